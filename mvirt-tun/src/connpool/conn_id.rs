//! Flow identifier and its wire encoding.
//!
//! A `ConnId` is the 5-tuple of a flow as seen from the local OS: `src` is the
//! local endpoint that originated the flow, `dst` the remote one. It is the
//! registry key and, encoded, the tag of every frame on the tunnel.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use smoltcp::wire::IpProtocol;
use thiserror::Error;

/// Encoded length of an IPv4 flow identifier.
pub const CONN_ID_V4_LEN: usize = 1 + 4 + 4 + 2 + 2;

/// Encoded length of an IPv6 flow identifier.
pub const CONN_ID_V6_LEN: usize = 1 + 16 + 16 + 2 + 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnIdError {
    #[error("invalid connection id length {0}")]
    InvalidLength(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    protocol: IpProtocol,
    src: SocketAddr,
    dst: SocketAddr,
}

impl ConnId {
    /// Create a flow identifier.
    ///
    /// Mixed address families are normalized to IPv6 so that the encoding
    /// stays well-formed.
    pub fn new(protocol: IpProtocol, src: SocketAddr, dst: SocketAddr) -> Self {
        let (src, dst) = match (src.ip(), dst.ip()) {
            (IpAddr::V4(_), IpAddr::V6(_)) => (to_v6(src), dst),
            (IpAddr::V6(_), IpAddr::V4(_)) => (src, to_v6(dst)),
            _ => (src, dst),
        };
        Self { protocol, src, dst }
    }

    pub fn protocol(&self) -> IpProtocol {
        self.protocol
    }

    /// Local endpoint.
    pub fn src(&self) -> SocketAddr {
        self.src
    }

    /// Remote endpoint.
    pub fn dst(&self) -> SocketAddr {
        self.dst
    }

    pub fn is_ipv4(&self) -> bool {
        self.src.is_ipv4()
    }

    /// Encode as `protocol | src addr | dst addr | src port | dst port`.
    pub fn encode(&self) -> Vec<u8> {
        let len = if self.is_ipv4() {
            CONN_ID_V4_LEN
        } else {
            CONN_ID_V6_LEN
        };
        let mut out = Vec::with_capacity(len);
        out.push(u8::from(self.protocol));
        push_ip(&mut out, self.src.ip());
        push_ip(&mut out, self.dst.ip());
        out.extend_from_slice(&self.src.port().to_be_bytes());
        out.extend_from_slice(&self.dst.port().to_be_bytes());
        out
    }

    /// Decode a frame tag produced by [`ConnId::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, ConnIdError> {
        let addr_len = match bytes.len() {
            CONN_ID_V4_LEN => 4,
            CONN_ID_V6_LEN => 16,
            len => return Err(ConnIdError::InvalidLength(len)),
        };
        let protocol = IpProtocol::from(bytes[0]);
        let src_ip = read_ip(&bytes[1..1 + addr_len]);
        let dst_ip = read_ip(&bytes[1 + addr_len..1 + 2 * addr_len]);
        let ports = &bytes[1 + 2 * addr_len..];
        let src_port = u16::from_be_bytes([ports[0], ports[1]]);
        let dst_port = u16::from_be_bytes([ports[2], ports[3]]);
        Ok(Self {
            protocol,
            src: SocketAddr::new(src_ip, src_port),
            dst: SocketAddr::new(dst_ip, dst_port),
        })
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.src, self.dst)
    }
}

fn to_v6(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) => SocketAddr::new(IpAddr::V6(ip.to_ipv6_mapped()), addr.port()),
        IpAddr::V6(_) => addr,
    }
}

fn push_ip(out: &mut Vec<u8>, ip: IpAddr) {
    match ip {
        IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
    }
}

fn read_ip(bytes: &[u8]) -> IpAddr {
    if let Ok(octets) = <[u8; 4]>::try_from(bytes) {
        IpAddr::V4(Ipv4Addr::from(octets))
    } else if let Ok(octets) = <[u8; 16]>::try_from(bytes) {
        IpAddr::V6(Ipv6Addr::from(octets))
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_ipv4() {
        let id = ConnId::new(
            IpProtocol::Tcp,
            "10.0.0.2:40000".parse().unwrap(),
            "192.168.1.1:443".parse().unwrap(),
        );
        let bytes = id.encode();
        assert_eq!(bytes.len(), CONN_ID_V4_LEN);
        assert_eq!(bytes[0], 6);
        assert_eq!(&bytes[1..5], &[10, 0, 0, 2]);
        assert_eq!(&bytes[5..9], &[192, 168, 1, 1]);
        assert_eq!(&bytes[9..11], &40000u16.to_be_bytes());
        assert_eq!(&bytes[11..13], &443u16.to_be_bytes());
        assert_eq!(ConnId::decode(&bytes), Ok(id));
    }

    #[test]
    fn test_decode_ipv6() {
        let id = ConnId::new(
            IpProtocol::Udp,
            "[fd00::2]:5353".parse().unwrap(),
            "[fd00::1]:53".parse().unwrap(),
        );
        let bytes = id.encode();
        assert_eq!(bytes.len(), CONN_ID_V6_LEN);
        let decoded = ConnId::decode(&bytes).unwrap();
        assert_eq!(decoded.protocol(), IpProtocol::Udp);
        assert_eq!(decoded.dst().port(), 53);
        assert!(!decoded.is_ipv4());
    }

    #[test]
    fn test_decode_invalid_length() {
        assert_eq!(ConnId::decode(&[]), Err(ConnIdError::InvalidLength(0)));
        assert_eq!(
            ConnId::decode(&[0u8; 14]),
            Err(ConnIdError::InvalidLength(14))
        );
    }

    #[test]
    fn test_mixed_family_normalized() {
        let id = ConnId::new(
            IpProtocol::Udp,
            "10.0.0.2:1000".parse().unwrap(),
            "[fd00::1]:53".parse().unwrap(),
        );
        assert!(!id.is_ipv4());
        assert_eq!(id.encode().len(), CONN_ID_V6_LEN);
    }

    #[test]
    fn test_display() {
        let id = ConnId::new(
            IpProtocol::Tcp,
            "10.0.0.2:40000".parse().unwrap(),
            "10.1.2.3:80".parse().unwrap(),
        );
        assert_eq!(id.to_string(), "TCP 10.0.0.2:40000 -> 10.1.2.3:80");
    }
}
