//! Packet parsing and construction.

pub mod fragment;
pub mod icmp;
pub mod ip;
pub mod tcp;
pub mod udp;

use thiserror::Error;

pub use fragment::Reassembler;
pub use icmp::{UnreachableCode, destination_unreachable};
pub use ip::{IpHeader, IpVersion, Packet, emit_packet};
pub use tcp::TcpSegment;
pub use udp::{Datagram, emit_datagram};

/// A packet that cannot be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("packet too short: {len} bytes, need at least {need}")]
    Truncated { len: usize, need: usize },

    #[error("unknown IP version {0}")]
    UnknownVersion(u8),

    #[error("invalid IPv4 header length {0}")]
    InvalidHeaderLen(usize),

    #[error("IPv4 total length {total} shorter than header length {header}")]
    InvalidTotalLen { total: usize, header: usize },

    #[error("malformed {0} header")]
    Malformed(&'static str),
}
