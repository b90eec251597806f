//! In-memory network device

use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ipnet::IpNet;
use mvirt_tun::connpool::Pool;
use mvirt_tun::device::Device;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::WAIT;

/// Device backed by channels: packets injected through the [`DeviceHandle`]
/// are read by the dispatcher, packets the dispatcher writes show up on the
/// handle.
pub struct MemoryDevice {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    written: mpsc::UnboundedSender<Vec<u8>>,
    subnets: Arc<Mutex<Vec<IpNet>>>,
    closed: CancellationToken,
    registry: Mutex<Option<Arc<Pool>>>,
    drained_at_close: Arc<Mutex<Option<bool>>>,
}

pub struct DeviceHandle {
    inject: mpsc::UnboundedSender<Vec<u8>>,
    written: mpsc::UnboundedReceiver<Vec<u8>>,
    subnets: Arc<Mutex<Vec<IpNet>>>,
    closed: CancellationToken,
    drained_at_close: Arc<Mutex<Option<bool>>>,
}

impl MemoryDevice {
    pub fn new() -> (Arc<Self>, DeviceHandle) {
        let (inject, incoming) = mpsc::unbounded_channel();
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        let subnets = Arc::new(Mutex::new(Vec::new()));
        let closed = CancellationToken::new();
        let drained_at_close = Arc::new(Mutex::new(None));
        let device = Arc::new(Self {
            incoming: tokio::sync::Mutex::new(incoming),
            written: written_tx,
            subnets: Arc::clone(&subnets),
            closed: closed.clone(),
            registry: Mutex::new(None),
            drained_at_close: Arc::clone(&drained_at_close),
        });
        let handle = DeviceHandle {
            inject,
            written: written_rx,
            subnets,
            closed,
            drained_at_close,
        };
        (device, handle)
    }

    /// Check `registry` when the device is closed: every flow and handler
    /// task should be gone by then.
    pub fn watch_registry(&self, registry: Arc<Pool>) {
        *self.registry.lock().unwrap() = Some(registry);
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "device closed")
}

#[async_trait]
impl Device for MemoryDevice {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(closed_error()),
            packet = incoming.recv() => match packet {
                Some(packet) => {
                    // Like a TUN read: anything past the buffer is cut off.
                    let len = packet.len().min(buf.len());
                    buf[..len].copy_from_slice(&packet[..len]);
                    Ok(len)
                }
                None => Err(closed_error()),
            },
        }
    }

    async fn write(&self, packet: &[u8]) -> io::Result<usize> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        self.written
            .send(packet.to_vec())
            .map_err(|_| closed_error())?;
        Ok(packet.len())
    }

    async fn add_subnet(&self, subnet: IpNet) -> io::Result<()> {
        self.subnets.lock().unwrap().push(subnet);
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        if let Some(registry) = self.registry.lock().unwrap().as_ref() {
            let drained = registry.is_empty() && registry.tracker().is_empty();
            self.drained_at_close.lock().unwrap().get_or_insert(drained);
        }
        self.closed.cancel();
        Ok(())
    }
}

impl DeviceHandle {
    /// Hand a packet to the dispatcher as if the OS routed it into the device.
    pub fn inject(&self, packet: Vec<u8>) {
        self.inject.send(packet).expect("device reader gone");
    }

    /// Next packet written to the device.
    pub async fn recv(&mut self) -> Vec<u8> {
        tokio::time::timeout(WAIT, self.written.recv())
            .await
            .expect("timed out waiting for a device write")
            .expect("device writer gone")
    }

    /// Next packet written to the device within `timeout`, if any.
    pub async fn try_recv(&mut self, timeout: std::time::Duration) -> Option<Vec<u8>> {
        tokio::time::timeout(timeout, self.written.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn subnets(&self) -> Vec<IpNet> {
        self.subnets.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Whether the watched registry was drained when the device was first
    /// closed. `None` until then.
    pub fn drained_at_close(&self) -> Option<bool> {
        *self.drained_at_close.lock().unwrap()
    }
}
