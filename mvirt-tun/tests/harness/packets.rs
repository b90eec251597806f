//! Packet building and parsing utilities for tests

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, LazyLock};

use mvirt_tun::buffer::BufferPool;
use mvirt_tun::packet::emit_datagram;
use mvirt_tun::packet::tcp::{emit_segment, segment_repr};
use smoltcp::wire::{
    Icmpv4Packet, IpProtocol, Ipv4Packet, TcpControl, TcpPacket, TcpSeqNumber, UdpPacket,
};

/// Oversized pool so test packets may exceed the router's MTU.
static POOL: LazyLock<Arc<BufferPool>> = LazyLock::new(|| BufferPool::new(65535));

/// Build a UDP datagram in an IP packet.
pub fn udp(src: &str, dst: &str, payload: &[u8]) -> Vec<u8> {
    let src: SocketAddr = src.parse().unwrap();
    let dst: SocketAddr = dst.parse().unwrap();
    emit_datagram(&POOL, src, dst, payload).data().to_vec()
}

/// Build a TCP segment in an IP packet.
pub fn tcp(
    src: &str,
    dst: &str,
    control: TcpControl,
    seq: i32,
    ack: Option<i32>,
    payload: &[u8],
) -> Vec<u8> {
    let src: SocketAddr = src.parse().unwrap();
    let dst: SocketAddr = dst.parse().unwrap();
    let repr = segment_repr(
        src.port(),
        dst.port(),
        control,
        TcpSeqNumber(seq),
        ack.map(TcpSeqNumber),
        payload,
    );
    emit_segment(&POOL, src.ip(), dst.ip(), &repr).data().to_vec()
}

/// Build a raw IPv4 packet with an arbitrary protocol number.
pub fn ipv4_raw(src: [u8; 4], dst: [u8; 4], protocol: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 20 + payload.len()];
    buf[0] = 0x45;
    buf[2..4].copy_from_slice(&((20 + payload.len()) as u16).to_be_bytes());
    buf[8] = 64;
    buf[9] = protocol;
    buf[12..16].copy_from_slice(&src);
    buf[16..20].copy_from_slice(&dst);
    buf[20..].copy_from_slice(payload);
    let mut packet = Ipv4Packet::new_unchecked(&mut buf);
    packet.fill_checksum();
    buf
}

/// Split an IPv4 packet into fragments carrying at most `chunk` payload
/// bytes each. `chunk` must be a multiple of 8.
pub fn fragment_v4(packet: &[u8], ident: u16, chunk: usize) -> Vec<Vec<u8>> {
    let header = &packet[..20];
    let payload = &packet[20..];
    let count = payload.len().div_ceil(chunk);
    payload
        .chunks(chunk)
        .enumerate()
        .map(|(i, piece)| {
            let mut buf = Vec::with_capacity(20 + piece.len());
            buf.extend_from_slice(header);
            buf.extend_from_slice(piece);
            let mut ip = Ipv4Packet::new_unchecked(&mut buf);
            ip.set_total_len((20 + piece.len()) as u16);
            ip.set_ident(ident);
            ip.set_dont_frag(false);
            ip.set_more_frags(i + 1 < count);
            ip.set_frag_offset((i * chunk) as u16);
            ip.fill_checksum();
            buf
        })
        .collect()
}

/// IPv4 source and destination of a packet.
pub fn ipv4_addrs(packet: &[u8]) -> (IpAddr, IpAddr) {
    let ip = Ipv4Packet::new_checked(packet).expect("not an IPv4 packet");
    (IpAddr::V4(ip.src_addr()), IpAddr::V4(ip.dst_addr()))
}

/// Parsed ICMPv4 error.
#[derive(Debug, Clone)]
pub struct IcmpError {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub msg_type: u8,
    pub code: u8,
    /// Next-hop MTU for must-fragment errors.
    pub mtu: u16,
    /// Quoted header and leading payload of the offending packet.
    pub quoted: Vec<u8>,
}

/// Parse an ICMPv4 error from an IPv4 packet.
pub fn parse_icmpv4(packet: &[u8]) -> Option<IcmpError> {
    let ip = Ipv4Packet::new_checked(packet).ok()?;
    if ip.next_header() != IpProtocol::Icmp {
        return None;
    }
    let icmp = Icmpv4Packet::new_checked(ip.payload()).ok()?;
    if !icmp.verify_checksum() {
        return None;
    }
    let raw = ip.payload();
    Some(IcmpError {
        src: IpAddr::V4(ip.src_addr()),
        dst: IpAddr::V4(ip.dst_addr()),
        msg_type: raw[0],
        code: raw[1],
        mtu: u16::from_be_bytes([raw[6], raw[7]]),
        quoted: raw[8..].to_vec(),
    })
}

/// Parsed UDP datagram.
#[derive(Debug, Clone)]
pub struct UdpInfo {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub payload: Vec<u8>,
}

/// Parse a UDP datagram from an IPv4 packet.
pub fn parse_udp(packet: &[u8]) -> Option<UdpInfo> {
    let ip = Ipv4Packet::new_checked(packet).ok()?;
    if ip.next_header() != IpProtocol::Udp {
        return None;
    }
    let udp = UdpPacket::new_checked(ip.payload()).ok()?;
    Some(UdpInfo {
        src: SocketAddr::new(IpAddr::V4(ip.src_addr()), udp.src_port()),
        dst: SocketAddr::new(IpAddr::V4(ip.dst_addr()), udp.dst_port()),
        payload: udp.payload().to_vec(),
    })
}

/// Parsed TCP segment.
#[derive(Debug, Clone)]
pub struct TcpInfo {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub seq: i32,
    pub ack_number: i32,
    pub mss: Option<u16>,
    pub payload: Vec<u8>,
}

/// Parse a TCP segment from an IPv4 packet.
pub fn parse_tcp(packet: &[u8]) -> Option<TcpInfo> {
    let ip = Ipv4Packet::new_checked(packet).ok()?;
    if ip.next_header() != IpProtocol::Tcp {
        return None;
    }
    let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
    let src = IpAddr::V4(ip.src_addr());
    let dst = IpAddr::V4(ip.dst_addr());
    if !tcp.verify_checksum(&src.into(), &dst.into()) {
        return None;
    }
    let mss = {
        let mut options = tcp.options();
        let mut mss = None;
        while !options.is_empty() {
            let (rest, option) = smoltcp::wire::TcpOption::parse(options).ok()?;
            if let smoltcp::wire::TcpOption::MaxSegmentSize(value) = option {
                mss = Some(value);
            }
            if option == smoltcp::wire::TcpOption::EndOfList {
                break;
            }
            options = rest;
        }
        mss
    };
    Some(TcpInfo {
        src: SocketAddr::new(src, tcp.src_port()),
        dst: SocketAddr::new(dst, tcp.dst_port()),
        syn: tcp.syn(),
        ack: tcp.ack(),
        fin: tcp.fin(),
        rst: tcp.rst(),
        seq: tcp.seq_number().0,
        ack_number: tcp.ack_number().0,
        mss,
        payload: tcp.payload().to_vec(),
    })
}
