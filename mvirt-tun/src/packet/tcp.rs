//! TCP segment view and segment builders.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{IpAddress, IpProtocol, TcpControl, TcpPacket, TcpRepr, TcpSeqNumber};

use super::ip::{Packet, emit_packet};
use super::{IpHeader, ParseError};
use crate::buffer::BufferPool;
use crate::connpool::ConnId;

/// An IP packet carrying a TCP segment with a valid header.
#[derive(Debug)]
pub struct TcpSegment {
    packet: Packet,
}

impl TcpSegment {
    pub fn new(packet: Packet) -> Result<Self, ParseError> {
        TcpPacket::new_checked(packet.payload()).map_err(|_| ParseError::Malformed("TCP"))?;
        Ok(Self { packet })
    }

    fn tcp(&self) -> TcpPacket<&[u8]> {
        TcpPacket::new_unchecked(self.packet.payload())
    }

    pub fn ip_header(&self) -> &IpHeader {
        self.packet.header()
    }

    pub fn src(&self) -> SocketAddr {
        SocketAddr::new(self.ip_header().src(), self.tcp().src_port())
    }

    pub fn dst(&self) -> SocketAddr {
        SocketAddr::new(self.ip_header().dst(), self.tcp().dst_port())
    }

    pub fn conn_id(&self) -> ConnId {
        ConnId::new(IpProtocol::Tcp, self.src(), self.dst())
    }

    pub fn syn(&self) -> bool {
        self.tcp().syn()
    }

    pub fn ack(&self) -> bool {
        self.tcp().ack()
    }

    pub fn fin(&self) -> bool {
        self.tcp().fin()
    }

    pub fn rst(&self) -> bool {
        self.tcp().rst()
    }

    pub fn seq_number(&self) -> TcpSeqNumber {
        self.tcp().seq_number()
    }

    pub fn ack_number(&self) -> TcpSeqNumber {
        self.tcp().ack_number()
    }

    /// Sequence space consumed by the segment (payload plus SYN and FIN).
    pub fn segment_len(&self) -> usize {
        self.tcp().segment_len()
    }

    pub fn payload(&self) -> &[u8] {
        let tcp = self.tcp();
        let header_len = tcp.header_len() as usize;
        &self.packet.payload()[header_len.min(self.packet.payload().len())..]
    }

    pub fn into_packet(self) -> Packet {
        self.packet
    }

    /// Build the RST answering this segment.
    ///
    /// If the segment carried an ACK the reset takes its sequence number from
    /// it, otherwise the reset acknowledges everything the segment occupied.
    pub fn reset(&self, pool: &Arc<BufferPool>) -> Packet {
        let (seq_number, ack_number) = if self.ack() {
            (self.ack_number(), None)
        } else {
            (TcpSeqNumber(0), Some(self.seq_number() + self.segment_len()))
        };
        let repr = segment_repr(
            self.dst().port(),
            self.src().port(),
            TcpControl::Rst,
            seq_number,
            ack_number,
            &[],
        );
        emit_segment(pool, self.dst().ip(), self.src().ip(), &repr)
    }
}

/// A bare segment representation without options.
pub fn segment_repr(
    src_port: u16,
    dst_port: u16,
    control: TcpControl,
    seq_number: TcpSeqNumber,
    ack_number: Option<TcpSeqNumber>,
    payload: &[u8],
) -> TcpRepr<'_> {
    TcpRepr {
        src_port,
        dst_port,
        control,
        seq_number,
        ack_number,
        window_len: u16::MAX,
        window_scale: None,
        max_seg_size: None,
        sack_permitted: false,
        sack_ranges: [None, None, None],
        timestamp: None,
        payload,
    }
}

/// Emit `repr` in an IP packet from `src` to `dst`.
pub fn emit_segment(pool: &Arc<BufferPool>, src: IpAddr, dst: IpAddr, repr: &TcpRepr) -> Packet {
    let caps = ChecksumCapabilities::default();
    let src_addr = IpAddress::from(src);
    let dst_addr = IpAddress::from(dst);
    emit_packet(pool, src, dst, IpProtocol::Tcp, repr.buffer_len(), |buf| {
        repr.emit(
            &mut TcpPacket::new_unchecked(buf),
            &src_addr,
            &dst_addr,
            &caps,
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
    const REMOTE: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 1, 0, 1));

    fn segment(
        pool: &Arc<BufferPool>,
        control: TcpControl,
        seq: i32,
        ack: Option<i32>,
        payload: &[u8],
    ) -> TcpSegment {
        let repr = segment_repr(
            40000,
            80,
            control,
            TcpSeqNumber(seq),
            ack.map(TcpSeqNumber),
            payload,
        );
        TcpSegment::new(emit_segment(pool, LOCAL, REMOTE, &repr)).unwrap()
    }

    #[test]
    fn test_segment_view() {
        let pool = BufferPool::new(1500);
        let seg = segment(&pool, TcpControl::Syn, 100, None, &[]);
        assert!(seg.syn());
        assert!(!seg.ack());
        assert_eq!(seg.segment_len(), 1);
        assert_eq!(seg.conn_id().src(), "10.0.0.2:40000".parse().unwrap());
        assert_eq!(seg.conn_id().dst(), "10.1.0.1:80".parse().unwrap());

        let seg = segment(&pool, TcpControl::Psh, 100, Some(7), b"hello");
        assert_eq!(seg.payload(), b"hello");
        assert!(seg.ack());
    }

    #[test]
    fn test_reset_for_ack_segment() {
        let pool = BufferPool::new(1500);
        let seg = segment(&pool, TcpControl::None, 100, Some(5000), b"data");
        let rst = TcpSegment::new(seg.reset(&pool)).unwrap();
        assert!(rst.rst());
        assert!(!rst.ack());
        assert_eq!(rst.seq_number(), TcpSeqNumber(5000));
        assert_eq!(rst.src(), seg.dst());
        assert_eq!(rst.dst(), seg.src());
    }

    #[test]
    fn test_reset_for_segment_without_ack() {
        let pool = BufferPool::new(1500);
        let seg = segment(&pool, TcpControl::Fin, 100, None, b"abc");
        let rst = TcpSegment::new(seg.reset(&pool)).unwrap();
        assert!(rst.rst());
        assert!(rst.ack());
        assert_eq!(rst.seq_number(), TcpSeqNumber(0));
        // 3 payload bytes plus FIN
        assert_eq!(rst.ack_number(), TcpSeqNumber(104));
    }

    #[test]
    fn test_truncated_segment_rejected() {
        let pool = BufferPool::new(1500);
        let packet = emit_packet(&pool, LOCAL, REMOTE, IpProtocol::Tcp, 8, |_| {});
        assert_eq!(
            TcpSegment::new(packet).unwrap_err(),
            ParseError::Malformed("TCP")
        );
        assert_eq!(pool.in_use(), 0);
    }
}
