//! IPv4 fragment reassembly.
//!
//! Fragments are held in their pooled buffers until the datagram is
//! complete. Incomplete sets are evicted after [`FRAGMENT_TIMEOUT`] and at
//! most [`MAX_FRAGMENT_SETS`] sets are kept, so a peer that never sends the
//! last fragment cannot pin buffers forever.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use smoltcp::wire::{IpProtocol, Ipv4Packet};
use tracing::{debug, warn};

use super::ip::Packet;
use crate::buffer::BufferPool;

pub const FRAGMENT_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_FRAGMENT_SETS: usize = 256;

const MAX_DATAGRAM_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragmentKey {
    ident: u16,
    src: IpAddr,
    dst: IpAddr,
    protocol: IpProtocol,
}

impl FragmentKey {
    fn of(packet: &Packet) -> Self {
        let header = packet.header();
        Self {
            ident: header.ident(),
            src: header.src(),
            dst: header.dst(),
            protocol: header.protocol(),
        }
    }
}

struct FragmentSet {
    created: Instant,
    /// Fragments by byte offset.
    pieces: BTreeMap<usize, Packet>,
    /// Payload length of the whole datagram, known once the last fragment
    /// has arrived.
    total_len: Option<usize>,
}

impl FragmentSet {
    fn new(now: Instant) -> Self {
        Self {
            created: now,
            pieces: BTreeMap::new(),
            total_len: None,
        }
    }

    fn insert(&mut self, packet: Packet) {
        let header = packet.header();
        let offset = header.fragment_offset();
        if !header.more_fragments() {
            self.total_len = Some(offset + packet.payload().len());
        }
        self.pieces.entry(offset).or_insert(packet);
    }

    fn is_complete(&self) -> bool {
        let Some(total) = self.total_len else {
            return false;
        };
        let mut covered = 0;
        for (offset, piece) in &self.pieces {
            if covered >= total {
                break;
            }
            if *offset > covered {
                return false;
            }
            covered = covered.max(offset + piece.payload().len());
        }
        covered >= total
    }

    fn assemble(self, pool: &Arc<BufferPool>) -> Option<Packet> {
        let total = self.total_len?;
        let first = self.pieces.get(&0)?;
        let header_len = first.header().header_len();
        if header_len + total > MAX_DATAGRAM_LEN {
            return None;
        }

        let mut buf = pool.alloc(header_len + total);
        let data = buf.data_mut();
        data[..header_len].copy_from_slice(&first.data()[..header_len]);
        for (offset, piece) in &self.pieces {
            let payload = piece.payload();
            let end = (offset + payload.len()).min(total);
            if *offset < end {
                data[header_len + offset..header_len + end]
                    .copy_from_slice(&payload[..end - offset]);
            }
        }

        let mut ipv4 = Ipv4Packet::new_unchecked(&mut data[..]);
        ipv4.set_total_len((header_len + total) as u16);
        ipv4.set_more_frags(false);
        ipv4.set_frag_offset(0);
        ipv4.fill_checksum();

        Packet::parse(buf).ok()
    }
}

/// Reassembles IPv4 datagrams from their fragments.
pub struct Reassembler {
    pool: Arc<BufferPool>,
    sets: HashMap<FragmentKey, FragmentSet>,
    timeout: Duration,
    max_sets: usize,
}

impl Reassembler {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self::with_limits(pool, FRAGMENT_TIMEOUT, MAX_FRAGMENT_SETS)
    }

    pub fn with_limits(pool: Arc<BufferPool>, timeout: Duration, max_sets: usize) -> Self {
        Self {
            pool,
            sets: HashMap::new(),
            timeout,
            max_sets: max_sets.max(1),
        }
    }

    /// Add a fragment. Returns the reassembled datagram once it is complete.
    pub fn process(&mut self, packet: Packet) -> Option<Packet> {
        self.process_at(packet, Instant::now())
    }

    pub fn process_at(&mut self, packet: Packet, now: Instant) -> Option<Packet> {
        self.evict_expired(now);

        let key = FragmentKey::of(&packet);
        if !self.sets.contains_key(&key) && self.sets.len() >= self.max_sets {
            self.evict_oldest();
        }

        let set = self
            .sets
            .entry(key)
            .or_insert_with(|| FragmentSet::new(now));
        set.insert(packet);
        if !set.is_complete() {
            return None;
        }

        let set = self.sets.remove(&key)?;
        let fragments = set.pieces.len();
        let reassembled = set.assemble(&self.pool);
        match &reassembled {
            Some(packet) => debug!(
                ident = key.ident,
                src = %key.src,
                dst = %key.dst,
                fragments,
                len = packet.data().len(),
                "Reassembled fragmented packet"
            ),
            None => warn!(
                ident = key.ident,
                src = %key.src,
                "Dropping fragmented packet that could not be reassembled"
            ),
        }
        reassembled
    }

    /// Number of incomplete fragment sets.
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    fn evict_expired(&mut self, now: Instant) {
        let timeout = self.timeout;
        self.sets.retain(|key, set| {
            let keep = now.duration_since(set.created) < timeout;
            if !keep {
                debug!(ident = key.ident, src = %key.src, "Fragment set timed out");
            }
            keep
        });
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .sets
            .iter()
            .min_by_key(|(_, set)| set.created)
            .map(|(key, _)| *key);
        if let Some(key) = oldest {
            warn!(ident = key.ident, src = %key.src, "Fragment set limit reached, evicting oldest");
            self.sets.remove(&key);
        }
    }
}
