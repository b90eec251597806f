//! IP header parsing and packet emission.

use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{IpProtocol, Ipv4Packet, Ipv4Repr, Ipv6Packet, Ipv6Repr};

use super::ParseError;
use crate::buffer::{BufferPool, PoolBuffer};

pub const IPV4_MIN_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;

/// Hop limit of synthesized packets.
pub const DEFAULT_HOP_LIMIT: u8 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// Parsed view of an IPv4 or IPv6 header.
///
/// IPv6 extension headers are not walked: `protocol` is the fixed header's
/// next-header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpHeader {
    version: IpVersion,
    header_len: usize,
    payload_len: usize,
    protocol: IpProtocol,
    src: IpAddr,
    dst: IpAddr,
    ident: u16,
    more_fragments: bool,
    fragment_offset: usize,
}

impl IpHeader {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let first = *data
            .first()
            .ok_or(ParseError::Truncated { len: 0, need: 1 })?;
        match first >> 4 {
            4 => Self::parse_v4(data),
            6 => Self::parse_v6(data),
            v => Err(ParseError::UnknownVersion(v)),
        }
    }

    fn parse_v4(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < IPV4_MIN_HEADER_LEN {
            return Err(ParseError::Truncated {
                len: data.len(),
                need: IPV4_MIN_HEADER_LEN,
            });
        }
        // The declared total length is not checked against the buffer here:
        // a packet larger than the read buffer must still parse so it can be
        // answered with must-fragment.
        let packet = Ipv4Packet::new_unchecked(data);
        let header_len = packet.header_len() as usize;
        if header_len < IPV4_MIN_HEADER_LEN || header_len > data.len() {
            return Err(ParseError::InvalidHeaderLen(header_len));
        }
        let total = packet.total_len() as usize;
        if total < header_len {
            return Err(ParseError::InvalidTotalLen {
                total,
                header: header_len,
            });
        }
        Ok(Self {
            version: IpVersion::V4,
            header_len,
            payload_len: total - header_len,
            protocol: packet.next_header(),
            src: IpAddr::V4(packet.src_addr()),
            dst: IpAddr::V4(packet.dst_addr()),
            ident: packet.ident(),
            more_fragments: packet.more_frags(),
            fragment_offset: packet.frag_offset() as usize,
        })
    }

    fn parse_v6(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < IPV6_HEADER_LEN {
            return Err(ParseError::Truncated {
                len: data.len(),
                need: IPV6_HEADER_LEN,
            });
        }
        let packet = Ipv6Packet::new_unchecked(data);
        Ok(Self {
            version: IpVersion::V6,
            header_len: IPV6_HEADER_LEN,
            payload_len: packet.payload_len() as usize,
            protocol: packet.next_header(),
            src: IpAddr::V6(packet.src_addr()),
            dst: IpAddr::V6(packet.dst_addr()),
            ident: 0,
            more_fragments: false,
            fragment_offset: 0,
        })
    }

    pub fn version(&self) -> IpVersion {
        self.version
    }

    pub fn is_ipv4(&self) -> bool {
        self.version == IpVersion::V4
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Payload length declared by the header.
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub fn total_len(&self) -> usize {
        self.header_len + self.payload_len
    }

    pub fn protocol(&self) -> IpProtocol {
        self.protocol
    }

    pub fn src(&self) -> IpAddr {
        self.src
    }

    pub fn dst(&self) -> IpAddr {
        self.dst
    }

    /// IPv4 identification (0 for IPv6).
    pub fn ident(&self) -> u16 {
        self.ident
    }

    pub fn more_fragments(&self) -> bool {
        self.more_fragments
    }

    /// IPv4 fragment offset in bytes.
    pub fn fragment_offset(&self) -> usize {
        self.fragment_offset
    }

    /// Returns true for an IPv4 fragment (MF set or non-zero offset).
    pub fn is_fragment(&self) -> bool {
        self.version == IpVersion::V4 && (self.more_fragments || self.fragment_offset != 0)
    }

    /// Returns true if the payload does not fit the device MTU.
    pub fn is_oversize(&self, mtu: usize) -> bool {
        self.payload_len > mtu.saturating_sub(self.header_len)
    }
}

/// An IP packet in a pooled buffer together with its parsed header.
#[derive(Debug)]
pub struct Packet {
    header: IpHeader,
    buf: PoolBuffer,
}

impl Packet {
    /// Parse the header of the packet held by `buf`.
    ///
    /// On failure the buffer is dropped and returns to its pool.
    pub fn parse(buf: PoolBuffer) -> Result<Self, ParseError> {
        let header = IpHeader::parse(buf.data())?;
        Ok(Self { header, buf })
    }

    pub fn header(&self) -> &IpHeader {
        &self.header
    }

    /// The packet bytes, bounded by the declared total length.
    pub fn data(&self) -> &[u8] {
        let end = self.header.total_len().min(self.buf.len());
        &self.buf.data()[..end]
    }

    /// The L4 bytes following the IP header.
    pub fn payload(&self) -> &[u8] {
        let data = self.data();
        &data[self.header.header_len.min(data.len())..]
    }

    pub fn buffer(&self) -> &PoolBuffer {
        &self.buf
    }

    pub fn into_buffer(self) -> PoolBuffer {
        self.buf
    }
}

/// Build an IP packet from `src` to `dst` carrying `l4_len` bytes written by
/// `emit_l4`.
///
/// Mixed address families are emitted as IPv6 with the IPv4 address mapped.
pub fn emit_packet<F>(
    pool: &Arc<BufferPool>,
    src: IpAddr,
    dst: IpAddr,
    protocol: IpProtocol,
    l4_len: usize,
    emit_l4: F,
) -> Packet
where
    F: FnOnce(&mut [u8]),
{
    let caps = ChecksumCapabilities::default();
    match (src, dst) {
        (IpAddr::V4(src_addr), IpAddr::V4(dst_addr)) => {
            let repr = Ipv4Repr {
                src_addr,
                dst_addr,
                next_header: protocol,
                payload_len: l4_len,
                hop_limit: DEFAULT_HOP_LIMIT,
            };
            let mut buf = pool.alloc(IPV4_MIN_HEADER_LEN + l4_len);
            repr.emit(&mut Ipv4Packet::new_unchecked(buf.data_mut()), &caps);
            emit_l4(&mut buf.data_mut()[IPV4_MIN_HEADER_LEN..]);
            finish(buf, IpVersion::V4, IPV4_MIN_HEADER_LEN, l4_len, protocol, src, dst)
        }
        (src, dst) => {
            let repr = Ipv6Repr {
                src_addr: to_v6(src),
                dst_addr: to_v6(dst),
                next_header: protocol,
                payload_len: l4_len,
                hop_limit: DEFAULT_HOP_LIMIT,
            };
            let mut buf = pool.alloc(IPV6_HEADER_LEN + l4_len);
            repr.emit(&mut Ipv6Packet::new_unchecked(buf.data_mut()));
            emit_l4(&mut buf.data_mut()[IPV6_HEADER_LEN..]);
            finish(
                buf,
                IpVersion::V6,
                IPV6_HEADER_LEN,
                l4_len,
                protocol,
                IpAddr::V6(repr.src_addr),
                IpAddr::V6(repr.dst_addr),
            )
        }
    }
}

fn finish(
    buf: PoolBuffer,
    version: IpVersion,
    header_len: usize,
    payload_len: usize,
    protocol: IpProtocol,
    src: IpAddr,
    dst: IpAddr,
) -> Packet {
    Packet {
        header: IpHeader {
            version,
            header_len,
            payload_len,
            protocol,
            src,
            dst,
            ident: 0,
            more_fragments: false,
            fragment_offset: 0,
        },
        buf,
    }
}

pub(crate) fn to_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(ip) => ip.to_ipv6_mapped(),
        IpAddr::V6(ip) => ip,
    }
}
