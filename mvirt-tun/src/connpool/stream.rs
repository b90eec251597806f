//! Tunnel stream multiplexer.
//!
//! All flows share one ordered RPC stream. Outbound frames from every handler
//! go through a single bounded queue drained by the request side of the
//! stream, which serializes writes and keeps each handler's frames in order.
//! Inbound frames are routed to the handler registered for their flow.

use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConnId, Pool};
use crate::tunnel::ConnMessage;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("tunnel stream closed")]
    Closed,

    #[error("tunnel stream failed: {0}")]
    Status(#[from] tonic::Status),
}

pub struct Stream {
    tx: mpsc::Sender<ConnMessage>,
    rx: Mutex<Option<mpsc::Receiver<ConnMessage>>>,
    registry: Arc<Pool>,
}

impl Stream {
    pub fn new(registry: Arc<Pool>, capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity);
        Arc::new(Self {
            tx,
            rx: Mutex::new(Some(rx)),
            registry,
        })
    }

    /// Queue a frame for the remote peer. Waits while the queue is full.
    pub async fn send(&self, msg: ConnMessage) -> Result<(), StreamError> {
        self.tx.send(msg).await.map_err(|_| StreamError::Closed)
    }

    /// Take the request side of the stream. Only the first call gets it.
    pub fn take_outbound(&self) -> Option<ReceiverStream<ConnMessage>> {
        self.rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(ReceiverStream::new)
    }

    /// Route inbound frames to their handlers until the stream ends, fails
    /// or `cancel` fires.
    pub async fn read_loop<S>(&self, mut inbound: S, cancel: CancellationToken) -> Result<(), StreamError>
    where
        S: tokio_stream::Stream<Item = Result<ConnMessage, tonic::Status>> + Unpin,
    {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Tunnel read loop cancelled");
                    return Ok(());
                }
                msg = inbound.next() => msg,
            };

            let msg = match msg {
                Some(Ok(msg)) => msg,
                Some(Err(status)) => return Err(status.into()),
                None => {
                    info!("Tunnel stream ended");
                    return Ok(());
                }
            };

            let id = match ConnId::decode(&msg.conn_id) {
                Ok(id) => id,
                Err(e) => {
                    warn!(error = %e, "Dropping tunnel frame with invalid connection id");
                    continue;
                }
            };

            match self.registry.get(&id) {
                Some(handler) => handler.handle_message(msg).await,
                None => debug!(conn = %id, control = ?msg.control(), "No flow for tunnel frame"),
            }
        }
    }
}
