//! DNS interceptor.
//!
//! Queries addressed to the configured DNS target are answered by a local
//! resolver instead of the remote peer. Replies are written back to the
//! device as if they came from the DNS target.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{HANDLER_QUEUE_CAPACITY, UDP_IDLE_TIMEOUT};
use crate::connpool::{ConnId, DatagramHandler, Handler, HandlerContext};
use crate::error::FlowError;
use crate::packet::ip::{IPV4_MIN_HEADER_LEN, IPV6_HEADER_LEN};
use crate::packet::{Datagram, emit_datagram};
use crate::tunnel::ConnMessage;

const UDP_HEADER_LEN: usize = 8;

pub struct DnsHandler {
    queries: mpsc::Sender<Datagram>,
    id: ConnId,
    cancel: CancellationToken,
}

impl DnsHandler {
    /// Bind a socket towards the local resolver and start the handler task.
    pub async fn spawn(ctx: HandlerContext) -> Result<Handler, FlowError> {
        let resolver = ctx.dns_addr.ok_or_else(|| FlowError::Create {
            conn: ctx.id,
            reason: "no local resolver configured".into(),
        })?;
        let socket = connect(resolver).await.map_err(|e| FlowError::Create {
            conn: ctx.id,
            reason: format!("failed to reach resolver {resolver}: {e}"),
        })?;

        let (queries, query_rx) = mpsc::channel(HANDLER_QUEUE_CAPACITY);
        let handler = Self {
            queries,
            id: ctx.id,
            cancel: ctx.cancel.clone(),
        };
        debug!(conn = %ctx.id, %resolver, "DNS flow started");
        ctx.spawn(run(ctx.clone(), socket, query_rx));
        Ok(Handler::Datagram(Arc::new(handler)))
    }
}

#[async_trait]
impl DatagramHandler for DnsHandler {
    async fn new_datagram(&self, datagram: Datagram) {
        if self.queries.send(datagram).await.is_err() {
            debug!(conn = %self.id, "DNS flow gone, query dropped");
        }
    }

    async fn handle_message(&self, msg: ConnMessage) {
        debug!(conn = %self.id, control = ?msg.control(), "Ignoring tunnel frame on DNS flow");
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

async fn connect(resolver: SocketAddr) -> io::Result<UdpSocket> {
    let bind: SocketAddr = if resolver.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(resolver).await?;
    Ok(socket)
}

async fn run(ctx: HandlerContext, socket: UdpSocket, mut queries: mpsc::Receiver<Datagram>) {
    let ip_header_len = if ctx.id.is_ipv4() {
        IPV4_MIN_HEADER_LEN
    } else {
        IPV6_HEADER_LEN
    };
    let max_reply = ctx.mtu.saturating_sub(ip_header_len + UDP_HEADER_LEN);
    let mut reply = vec![0u8; u16::MAX as usize];
    let idle = tokio::time::sleep(UDP_IDLE_TIMEOUT);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = &mut idle => {
                debug!(conn = %ctx.id, "DNS flow idle");
                break;
            }
            Some(query) = queries.recv() => {
                idle.as_mut().reset(Instant::now() + UDP_IDLE_TIMEOUT);
                if let Err(e) = socket.send(query.payload()).await {
                    warn!(conn = %ctx.id, error = %e, "Failed to forward DNS query");
                }
            }
            res = socket.recv(&mut reply) => {
                let len = match res {
                    Ok(len) => len,
                    Err(e) => {
                        warn!(conn = %ctx.id, error = %e, "DNS resolver receive failed");
                        continue;
                    }
                };
                if len > max_reply {
                    warn!(conn = %ctx.id, len, max_reply, "DNS reply exceeds MTU, dropped");
                    continue;
                }
                idle.as_mut().reset(Instant::now() + UDP_IDLE_TIMEOUT);
                let packet = emit_datagram(&ctx.buffers, ctx.id.dst(), ctx.id.src(), &reply[..len]);
                if !ctx.write_packet(packet).await {
                    break;
                }
            }
        }
    }
}
