//! Concrete flow handlers.

pub mod dns;
pub mod tcp;
pub mod udp;

pub use dns::DnsHandler;
pub use tcp::TcpHandler;
pub use udp::UdpHandler;
