//! UDP datagram view and builder.

use std::net::SocketAddr;
use std::sync::Arc;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{IpAddress, IpProtocol, UDP_HEADER_LEN, UdpPacket, UdpRepr};

use super::ip::{Packet, emit_packet};
use super::{IpHeader, ParseError};
use crate::buffer::BufferPool;
use crate::connpool::ConnId;

/// An IP packet carrying a UDP datagram with a valid header.
#[derive(Debug)]
pub struct Datagram {
    packet: Packet,
}

impl Datagram {
    pub fn new(packet: Packet) -> Result<Self, ParseError> {
        UdpPacket::new_checked(packet.payload()).map_err(|_| ParseError::Malformed("UDP"))?;
        Ok(Self { packet })
    }

    fn udp(&self) -> UdpPacket<&[u8]> {
        UdpPacket::new_unchecked(self.packet.payload())
    }

    pub fn ip_header(&self) -> &IpHeader {
        self.packet.header()
    }

    pub fn src(&self) -> SocketAddr {
        SocketAddr::new(self.ip_header().src(), self.udp().src_port())
    }

    pub fn dst(&self) -> SocketAddr {
        SocketAddr::new(self.ip_header().dst(), self.udp().dst_port())
    }

    pub fn conn_id(&self) -> ConnId {
        ConnId::new(IpProtocol::Udp, self.src(), self.dst())
    }

    pub fn payload(&self) -> &[u8] {
        let len = self.udp().len() as usize;
        &self.packet.payload()[UDP_HEADER_LEN..len]
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn into_packet(self) -> Packet {
        self.packet
    }
}

/// Build a UDP datagram from `src` to `dst`.
pub fn emit_datagram(
    pool: &Arc<BufferPool>,
    src: SocketAddr,
    dst: SocketAddr,
    payload: &[u8],
) -> Packet {
    let caps = ChecksumCapabilities::default();
    let src_addr = IpAddress::from(src.ip());
    let dst_addr = IpAddress::from(dst.ip());
    let repr = UdpRepr {
        src_port: src.port(),
        dst_port: dst.port(),
    };
    emit_packet(
        pool,
        src.ip(),
        dst.ip(),
        IpProtocol::Udp,
        UDP_HEADER_LEN + payload.len(),
        |buf| {
            repr.emit(
                &mut UdpPacket::new_unchecked(buf),
                &src_addr,
                &dst_addr,
                payload.len(),
                |out| out.copy_from_slice(payload),
                &caps,
            );
        },
    )
}
