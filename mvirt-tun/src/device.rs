//! Virtual network device.
//!
//! [`Device`] is what the dispatcher reads IP packets from and writes them
//! back to. [`TunDevice`] is the Linux implementation: a layer 3 TUN device
//! (raw IP packets, no packet information header).

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use ipnet::IpNet;
use nix::libc;
use tokio::io::unix::AsyncFd;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[async_trait]
pub trait Device: Send + Sync {
    /// Read one packet into `buf` and return its length. A zero-length read
    /// carries no packet and should be retried.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet.
    async fn write(&self, packet: &[u8]) -> io::Result<usize>;

    /// Route `subnet` through the device.
    async fn add_subnet(&self, subnet: IpNet) -> io::Result<()>;

    /// Close the device. Pending and later reads and writes fail.
    async fn close(&self) -> io::Result<()>;
}

/// TUN device flags from linux/if_tun.h
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// ioctl request code for TUNSETIFF
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// ifreq structure for setting interface flags
#[repr(C)]
struct IfReqFlags {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// ifreq structure for setting the interface MTU
#[repr(C)]
struct IfReqMtu {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_mtu: libc::c_int,
    _pad: [u8; 20],
}

fn ifr_name(name: &str) -> io::Result<[libc::c_char; libc::IFNAMSIZ]> {
    let bytes = name.as_bytes();
    if bytes.len() >= libc::IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "TUN device name too long",
        ));
    }
    let mut out = [0; libc::IFNAMSIZ];
    for (i, &b) in bytes.iter().enumerate() {
        out[i] = b as libc::c_char;
    }
    Ok(out)
}

/// RAII guard for socket fd
struct SockGuard(RawFd);

impl SockGuard {
    fn new() -> io::Result<Self> {
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if sock < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(sock))
    }
}

impl Drop for SockGuard {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "device closed")
}

pub struct TunDevice {
    name: String,
    fd: RwLock<Option<Arc<AsyncFd<File>>>>,
    closed: CancellationToken,
}

impl TunDevice {
    /// Create the TUN device `name`, set its MTU and bring it up.
    ///
    /// Must be called from within a tokio runtime.
    pub fn create(name: &str, mtu: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")?;

        let ifr = IfReqFlags {
            ifr_name: ifr_name(name)?,
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 22],
        };
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        set_nonblocking(file.as_raw_fd())?;
        set_mtu(name, mtu)?;
        bring_up(name)?;
        info!(name, mtu, "TUN device created");

        Ok(Self {
            name: name.to_string(),
            fd: RwLock::new(Some(Arc::new(AsyncFd::new(file)?))),
            closed: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn fd(&self) -> io::Result<Arc<AsyncFd<File>>> {
        self.fd
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(closed_error)
    }
}

#[async_trait]
impl Device for TunDevice {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.fd()?;
        loop {
            let mut guard = tokio::select! {
                _ = self.closed.cancelled() => return Err(closed_error()),
                guard = fd.readable() => guard?,
            };
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.read(buf)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn write(&self, packet: &[u8]) -> io::Result<usize> {
        let fd = self.fd()?;
        loop {
            let mut guard = tokio::select! {
                _ = self.closed.cancelled() => return Err(closed_error()),
                guard = fd.writable() => guard?,
            };
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.write(packet)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn add_subnet(&self, subnet: IpNet) -> io::Result<()> {
        let subnet = subnet.trunc().to_string();
        let output = Command::new("ip")
            .args(["route", "add", &subnet, "dev", &self.name])
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Ignore "File exists" error (route already exists)
            if !stderr.contains("File exists") {
                return Err(io::Error::other(format!(
                    "ip route add {subnet} failed: {}",
                    stderr.trim()
                )));
            }
        }
        info!(subnet, dev = %self.name, "Added route");
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.cancel();
        let fd = self
            .fd
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if fd.is_some() {
            debug!(name = %self.name, "TUN device closed");
        }
        Ok(())
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_mtu(name: &str, mtu: usize) -> io::Result<()> {
    let sock = SockGuard::new()?;
    let ifr = IfReqMtu {
        ifr_name: ifr_name(name)?,
        ifr_mtu: libc::c_int::try_from(mtu)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "MTU out of range"))?,
        _pad: [0; 20],
    };
    let ret = unsafe { libc::ioctl(sock.0, libc::SIOCSIFMTU as _, &ifr) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn bring_up(name: &str) -> io::Result<()> {
    let sock = SockGuard::new()?;
    let mut ifr = IfReqFlags {
        ifr_name: ifr_name(name)?,
        ifr_flags: 0,
        _pad: [0; 22],
    };

    // SIOCGIFFLAGS
    let ret = unsafe { libc::ioctl(sock.0, libc::SIOCGIFFLAGS as _, &mut ifr) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    ifr.ifr_flags |= libc::IFF_UP as libc::c_short;

    // SIOCSIFFLAGS
    let ret = unsafe { libc::ioctl(sock.0, libc::SIOCSIFFLAGS as _, &ifr) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifr_name() {
        let name = ifr_name("mvirt-tun0").unwrap();
        assert_eq!(name[0], b'm' as libc::c_char);
        assert_eq!(name[10], 0);
        assert!(ifr_name("a-very-long-interface-name").is_err());
    }

    #[test]
    fn test_ifreq_layout() {
        assert_eq!(std::mem::size_of::<IfReqFlags>(), 40);
        assert_eq!(std::mem::size_of::<IfReqMtu>(), 40);
    }
}
