//! ICMP destination-unreachable synthesis.
//!
//! Replies are addressed back to the sender of the offending packet and quote
//! its IP header plus the first 8 bytes of its payload.

use std::sync::Arc;

use smoltcp::wire::{
    IpProtocol, Icmpv4DstUnreachable, Icmpv4Message, Icmpv4Packet, Icmpv6DstUnreachable,
    Icmpv6Message, Icmpv6Packet, Icmpv6ParamProblem,
};

use super::ip::{Packet, emit_packet, to_v6};
use crate::buffer::BufferPool;

/// Length of the ICMP error header (type, code, checksum, 4 bytes rest).
const ICMP_ERROR_HEADER_LEN: usize = 8;

/// Payload bytes of the offending packet quoted after its header.
const QUOTED_PAYLOAD_LEN: usize = 8;

/// Offset of the next-header field in an IPv6 header.
const IPV6_NEXT_HEADER_OFFSET: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreachableCode {
    /// Packet exceeds the MTU (carries the next-hop MTU).
    MustFragment,
    HostUnreachable,
    PortUnreachable,
    ProtocolUnreachable,
}

/// Build a destination-unreachable reply to `original`.
pub fn destination_unreachable(
    pool: &Arc<BufferPool>,
    mtu: usize,
    original: &Packet,
    code: UnreachableCode,
) -> Packet {
    let header = original.header();
    let data = original.data();
    let quoted = &data[..(header.header_len() + QUOTED_PAYLOAD_LEN).min(data.len())];
    let mtu = mtu.min(u16::MAX as usize) as u16;

    if header.is_ipv4() {
        let reason = match code {
            UnreachableCode::MustFragment => Icmpv4DstUnreachable::FragRequired,
            UnreachableCode::HostUnreachable => Icmpv4DstUnreachable::HostUnreachable,
            UnreachableCode::PortUnreachable => Icmpv4DstUnreachable::PortUnreachable,
            UnreachableCode::ProtocolUnreachable => Icmpv4DstUnreachable::ProtoUnreachable,
        };
        let next_hop_mtu = if code == UnreachableCode::MustFragment {
            mtu
        } else {
            0
        };
        emit_packet(
            pool,
            header.dst(),
            header.src(),
            IpProtocol::Icmp,
            ICMP_ERROR_HEADER_LEN + quoted.len(),
            |buf| {
                buf[6..8].copy_from_slice(&next_hop_mtu.to_be_bytes());
                let mut icmp = Icmpv4Packet::new_unchecked(buf);
                icmp.set_msg_type(Icmpv4Message::DstUnreachable);
                icmp.set_msg_code(reason.into());
                icmp.data_mut().copy_from_slice(quoted);
                icmp.fill_checksum();
            },
        )
    } else {
        let src = to_v6(header.dst());
        let dst = to_v6(header.src());
        emit_packet(
            pool,
            header.dst(),
            header.src(),
            IpProtocol::Icmpv6,
            ICMP_ERROR_HEADER_LEN + quoted.len(),
            |buf| {
                let mut icmp = Icmpv6Packet::new_unchecked(buf);
                match code {
                    UnreachableCode::MustFragment => {
                        icmp.set_msg_type(Icmpv6Message::PktTooBig);
                        icmp.set_msg_code(0);
                        icmp.set_pkt_too_big_mtu(mtu as u32);
                    }
                    UnreachableCode::HostUnreachable => {
                        icmp.set_msg_type(Icmpv6Message::DstUnreachable);
                        icmp.set_msg_code(Icmpv6DstUnreachable::AddrUnreachable.into());
                    }
                    UnreachableCode::PortUnreachable => {
                        icmp.set_msg_type(Icmpv6Message::DstUnreachable);
                        icmp.set_msg_code(Icmpv6DstUnreachable::PortUnreachable.into());
                    }
                    UnreachableCode::ProtocolUnreachable => {
                        icmp.set_msg_type(Icmpv6Message::ParamProblem);
                        icmp.set_msg_code(Icmpv6ParamProblem::UnrecognizedNxtHdr.into());
                        icmp.set_param_problem_ptr(IPV6_NEXT_HEADER_OFFSET);
                    }
                }
                icmp.payload_mut().copy_from_slice(quoted);
                icmp.fill_checksum(&src, &dst);
            },
        )
    }
}
