//! In-memory remote peer

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mvirt_tun::tunnel::{ConnMessage, ControlCode, Inbound, TunnelConnector};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;

use super::WAIT;

/// Connector whose stream ends in a [`PeerHandle`] instead of a gRPC server.
pub struct MemoryConnector {
    inbound: Mutex<Option<mpsc::Receiver<Result<ConnMessage, Status>>>>,
    frames: mpsc::UnboundedSender<ConnMessage>,
}

/// The remote end of the tunnel as seen by a test.
pub struct PeerHandle {
    to_router: mpsc::Sender<Result<ConnMessage, Status>>,
    frames: mpsc::UnboundedReceiver<ConnMessage>,
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, PeerHandle) {
        let (to_router, inbound) = mpsc::channel(64);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            inbound: Mutex::new(Some(inbound)),
            frames: frames_tx,
        });
        let peer = PeerHandle {
            to_router,
            frames: frames_rx,
        };
        (connector, peer)
    }
}

#[async_trait]
impl TunnelConnector for MemoryConnector {
    async fn open(&self, mut outbound: ReceiverStream<ConnMessage>) -> Result<Inbound, Status> {
        let inbound = self
            .inbound
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Status::failed_precondition("stream already open"))?;

        let frames = self.frames.clone();
        tokio::spawn(async move {
            while let Some(msg) = outbound.next().await {
                if frames.send(msg).is_err() {
                    break;
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(inbound)))
    }
}

impl PeerHandle {
    /// Send a frame to the router.
    pub async fn send(&self, msg: ConnMessage) {
        self.to_router.send(Ok(msg)).await.expect("tunnel reader gone");
    }

    pub async fn send_control(&self, conn_id: Vec<u8>, control: ControlCode) {
        self.send(ConnMessage::control_only(conn_id, control)).await;
    }

    /// Fail the stream with `status`.
    pub async fn fail(&self, status: Status) {
        self.to_router.send(Err(status)).await.expect("tunnel reader gone");
    }

    /// Next frame the router sent to the peer.
    pub async fn recv(&mut self) -> ConnMessage {
        tokio::time::timeout(WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for a tunnel frame")
            .expect("tunnel stream gone")
    }

    /// Next frame within `timeout`, if any.
    pub async fn try_recv(&mut self, timeout: std::time::Duration) -> Option<ConnMessage> {
        tokio::time::timeout(timeout, self.frames.recv())
            .await
            .ok()
            .flatten()
    }
}
