//! Generic UDP flow handler.
//!
//! Each datagram payload from the device becomes a DATA frame; each inbound
//! DATA frame becomes a datagram back to the local endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{HANDLER_QUEUE_CAPACITY, UDP_IDLE_TIMEOUT};
use crate::connpool::{ConnId, DatagramHandler, Handler, HandlerContext};
use crate::packet::{Datagram, emit_datagram};
use crate::tunnel::{ConnMessage, ControlCode};

pub struct UdpHandler {
    datagrams: mpsc::Sender<Datagram>,
    messages: mpsc::Sender<ConnMessage>,
    id: ConnId,
    cancel: CancellationToken,
}

impl UdpHandler {
    /// Start the handler task for the flow in `ctx`.
    pub fn spawn(ctx: HandlerContext) -> Handler {
        let (datagrams, datagram_rx) = mpsc::channel(HANDLER_QUEUE_CAPACITY);
        let (messages, message_rx) = mpsc::channel(HANDLER_QUEUE_CAPACITY);
        let handler = Self {
            datagrams,
            messages,
            id: ctx.id,
            cancel: ctx.cancel.clone(),
        };
        debug!(conn = %ctx.id, "UDP flow started");
        ctx.spawn(run(ctx.clone(), datagram_rx, message_rx));
        Handler::Datagram(Arc::new(handler))
    }
}

#[async_trait]
impl DatagramHandler for UdpHandler {
    async fn new_datagram(&self, datagram: Datagram) {
        if self.datagrams.send(datagram).await.is_err() {
            debug!(conn = %self.id, "UDP flow gone, datagram dropped");
        }
    }

    async fn handle_message(&self, msg: ConnMessage) {
        let _ = self.messages.send(msg).await;
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

async fn run(
    ctx: HandlerContext,
    mut datagrams: mpsc::Receiver<Datagram>,
    mut messages: mpsc::Receiver<ConnMessage>,
) {
    let tag = ctx.id.encode();
    let idle = tokio::time::sleep(UDP_IDLE_TIMEOUT);
    tokio::pin!(idle);

    let notify_peer = loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break false,
            _ = &mut idle => {
                debug!(conn = %ctx.id, "UDP flow idle");
                break true;
            }
            Some(datagram) = datagrams.recv() => {
                idle.as_mut().reset(Instant::now() + UDP_IDLE_TIMEOUT);
                let msg = ConnMessage::data(tag.clone(), datagram.payload().to_vec());
                drop(datagram);
                if !ctx.send_frame(msg).await {
                    break false;
                }
            }
            Some(msg) = messages.recv() => {
                idle.as_mut().reset(Instant::now() + UDP_IDLE_TIMEOUT);
                match msg.control() {
                    ControlCode::Data => {
                        let packet = emit_datagram(&ctx.buffers, ctx.id.dst(), ctx.id.src(), &msg.payload);
                        if !ctx.write_packet(packet).await {
                            break false;
                        }
                    }
                    ControlCode::Disconnect | ControlCode::ConnectReject => break false,
                    control => debug!(conn = %ctx.id, ?control, "Ignoring control frame on UDP flow"),
                }
            }
            else => break false,
        }
    };

    if notify_peer {
        ctx.send_frame(ConnMessage::control_only(tag, ControlCode::Disconnect))
            .await;
    }
}
