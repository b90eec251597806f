//! Flow handler contract.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use super::{ConnId, Pool, Stream};
use crate::buffer::BufferPool;
use crate::packet::{Datagram, Packet, TcpSegment};
use crate::tunnel::ConnMessage;

/// Handler for a connection-oriented flow (TCP).
#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// Feed the next segment from the device, in arrival order.
    async fn handle_packet(&self, segment: TcpSegment);

    /// Feed a tunnel frame addressed to this flow.
    async fn handle_message(&self, msg: ConnMessage);

    /// Ask the handler task to stop. Does not wait.
    fn close(&self);
}

/// Handler for a datagram flow (UDP, DNS).
#[async_trait]
pub trait DatagramHandler: Send + Sync {
    async fn new_datagram(&self, datagram: Datagram);

    async fn handle_message(&self, msg: ConnMessage);

    fn close(&self);
}

/// A live flow handler. The variant is fixed when the handler is created.
#[derive(Clone)]
pub enum Handler {
    Stream(Arc<dyn StreamHandler>),
    Datagram(Arc<dyn DatagramHandler>),
}

impl Handler {
    pub async fn handle_message(&self, msg: ConnMessage) {
        match self {
            Handler::Stream(h) => h.handle_message(msg).await,
            Handler::Datagram(h) => h.handle_message(msg).await,
        }
    }

    pub fn close(&self) {
        match self {
            Handler::Stream(h) => h.close(),
            Handler::Datagram(h) => h.close(),
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Handler::Stream(_))
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Stream(_) => f.write_str("Handler::Stream"),
            Handler::Datagram(_) => f.write_str("Handler::Datagram"),
        }
    }
}

/// Everything a handler factory needs to build a handler for one flow.
#[derive(Clone)]
pub struct HandlerContext {
    pub id: ConnId,
    /// Multiplexed tunnel stream.
    pub stream: Arc<Stream>,
    /// Queue of packets for the device writer.
    pub outbound: mpsc::Sender<Packet>,
    pub buffers: Arc<BufferPool>,
    /// Registry the handler detaches from when its task ends.
    pub registry: Arc<Pool>,
    /// Cancelled by `close()` or on process shutdown.
    pub cancel: CancellationToken,
    pub mtu: usize,
    /// Local resolver, set for DNS interception only.
    pub dns_addr: Option<SocketAddr>,
}

impl HandlerContext {
    /// Completion barrier the handler task runs on.
    pub fn tracker(&self) -> &TaskTracker {
        self.registry.tracker()
    }

    /// Spawn the handler task. The flow is removed from the registry when
    /// the task ends.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        let id = self.id;
        self.tracker().spawn(async move {
            task.await;
            registry.remove(&id);
            debug!(conn = %id, "Flow handler finished");
        });
    }

    /// Queue a packet for the device. Returns false once the writer is gone
    /// or the flow is cancelled.
    pub async fn write_packet(&self, packet: Packet) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            res = self.outbound.send(packet) => res.is_ok(),
        }
    }

    /// Queue a frame for the remote peer. Returns false once the tunnel is
    /// gone or the flow is cancelled.
    pub async fn send_frame(&self, msg: ConnMessage) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            res = self.stream.send(msg) => res.is_ok(),
        }
    }
}
