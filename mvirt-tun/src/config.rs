//! Router configuration and fixed limits.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Default TUN device name.
pub const TUN_NAME: &str = "mvirt-tun0";

/// Default maximum transmission unit of the TUN device.
pub const DEFAULT_MTU: usize = 1500;

/// Capacity of the queue feeding the device writer. Producers block when it
/// is full.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 100;

/// Capacity of the queue feeding the tunnel stream.
pub const TUNNEL_QUEUE_CAPACITY: usize = 256;

/// Capacity of each flow handler's inbound queues.
pub const HANDLER_QUEUE_CAPACITY: usize = 64;

/// Default timeout for establishing the connection to the remote peer.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// A UDP flow without traffic for this long is torn down.
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// UDP ports that are never tunneled.
pub const BLOCKED_UDP_PORTS: [u16; 3] = [
    137, // NETBIOS Name Service
    138, // NETBIOS Datagram Service
    139, // NETBIOS
];

/// Returns true if `port` is on the UDP deny-list.
pub fn is_blocked_udp_port(port: u16) -> bool {
    BLOCKED_UDP_PORTS.contains(&port)
}

/// DNS interception target.
///
/// Datagrams sent to `ip:port` are answered by the resolver listening on
/// `local_addr` instead of being tunneled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsConfig {
    pub ip: IpAddr,
    pub port: u16,
    pub local_addr: SocketAddr,
}

impl DnsConfig {
    pub fn new(ip: IpAddr, port: u16, local_addr: SocketAddr) -> Self {
        Self {
            ip,
            port,
            local_addr,
        }
    }

    /// Returns true if a datagram to `dst:port` must be intercepted.
    pub fn matches(&self, dst: IpAddr, port: u16) -> bool {
        self.port == port && self.ip == dst
    }
}

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum transmission unit of the device.
    pub mtu: usize,
    /// Timeout for dialing the remote peer.
    pub dial_timeout: Duration,
    /// Optional DNS interception target.
    pub dns: Option<DnsConfig>,
}

impl DispatcherConfig {
    pub fn new() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            dns: None,
        }
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_dns(mut self, dns: DnsConfig) -> Self {
        self.dns = Some(dns);
        self
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::new()
    }
}
