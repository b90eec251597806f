//! TCP flow handler.
//!
//! Terminates the local side of a TCP connection and carries its byte stream
//! over the tunnel. The tunnel is reliable and ordered, so there is no
//! retransmission and no window management: out-of-order segments are
//! answered with a duplicate ACK and dropped, and the OS retransmits them.
//!
//! Handshake: the local SYN becomes a CONNECT frame, and the SYN-ACK is only
//! sent once the peer answers CONNECT_OK. CONNECT_REJECT resets the
//! connection. Each side's FIN maps to a DISCONNECT frame; the flow ends once
//! both directions are finished and our FIN is acknowledged.

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use smoltcp::wire::{TcpControl, TcpSeqNumber};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::HANDLER_QUEUE_CAPACITY;
use crate::connpool::{ConnId, Handler, HandlerContext, StreamHandler};
use crate::packet::ip::{IPV4_MIN_HEADER_LEN, IPV6_HEADER_LEN};
use crate::packet::tcp::{emit_segment, segment_repr};
use crate::packet::{Packet, TcpSegment};
use crate::tunnel::{ConnMessage, ControlCode};

/// How long to wait for the final ACK of our FIN.
const FIN_LINGER: Duration = Duration::from_secs(2);

/// Minimal TCP header length.
const TCP_HEADER_LEN: usize = 20;

/// Seeds initial sequence numbers; random per process.
static ISN_SEED: LazyLock<RandomState> = LazyLock::new(RandomState::new);

pub struct TcpHandler {
    segments: mpsc::Sender<TcpSegment>,
    messages: mpsc::Sender<ConnMessage>,
    id: ConnId,
    cancel: CancellationToken,
}

impl TcpHandler {
    /// Start the handler task for the flow in `ctx`.
    pub fn spawn(ctx: HandlerContext) -> Handler {
        let (segments, segment_rx) = mpsc::channel(HANDLER_QUEUE_CAPACITY);
        let (messages, message_rx) = mpsc::channel(HANDLER_QUEUE_CAPACITY);
        let handler = Self {
            segments,
            messages,
            id: ctx.id,
            cancel: ctx.cancel.clone(),
        };
        debug!(conn = %ctx.id, "TCP flow started");
        let spawner = ctx.clone();
        spawner.spawn(run(Flow::new(ctx), segment_rx, message_rx));
        Handler::Stream(Arc::new(handler))
    }
}

#[async_trait]
impl StreamHandler for TcpHandler {
    async fn handle_packet(&self, segment: TcpSegment) {
        if self.segments.send(segment).await.is_err() {
            debug!(conn = %self.id, "TCP flow gone, segment dropped");
        }
    }

    async fn handle_message(&self, msg: ConnMessage) {
        let _ = self.messages.send(msg).await;
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// What the handler task does after an event.
#[derive(Debug, PartialEq, Eq)]
enum Next {
    Continue,
    Finish,
}

struct Flow {
    ctx: HandlerContext,
    tag: Vec<u8>,
    /// Our initial sequence number.
    iss: TcpSeqNumber,
    /// Next sequence number we send.
    snd_nxt: TcpSeqNumber,
    /// Next sequence number expected from the local side.
    rcv_nxt: TcpSeqNumber,
    /// Largest payload per segment towards the device.
    mss: usize,
    syn_seen: bool,
    established: bool,
    /// The local side sent FIN.
    local_fin: bool,
    /// We sent FIN to the local side.
    remote_fin: bool,
    /// Deadline for the final ACK once both sides finished.
    linger: Option<Instant>,
}

impl Flow {
    fn new(ctx: HandlerContext) -> Self {
        let iss = TcpSeqNumber(ISN_SEED.hash_one(ctx.id) as i32);
        let ip_header_len = if ctx.id.is_ipv4() {
            IPV4_MIN_HEADER_LEN
        } else {
            IPV6_HEADER_LEN
        };
        let mss = ctx
            .mtu
            .saturating_sub(ip_header_len + TCP_HEADER_LEN)
            .clamp(1, u16::MAX as usize);
        Self {
            tag: ctx.id.encode(),
            ctx,
            iss,
            snd_nxt: iss,
            rcv_nxt: TcpSeqNumber(0),
            mss,
            syn_seen: false,
            established: false,
            local_fin: false,
            remote_fin: false,
            linger: None,
        }
    }

    fn segment(&self, control: TcpControl, seq: TcpSeqNumber, ack: Option<TcpSeqNumber>, payload: &[u8]) -> Packet {
        let local = self.ctx.id.src();
        let remote = self.ctx.id.dst();
        let mut repr = segment_repr(remote.port(), local.port(), control, seq, ack, payload);
        if control == TcpControl::Syn {
            repr.max_seg_size = Some(self.mss as u16);
        }
        emit_segment(&self.ctx.buffers, remote.ip(), local.ip(), &repr)
    }

    async fn send_ack(&self) -> Next {
        let packet = self.segment(TcpControl::None, self.snd_nxt, Some(self.rcv_nxt), &[]);
        self.write(packet).await
    }

    /// Reset the local side of a connection that was never established.
    async fn reject(&self) -> Next {
        let packet = self.segment(TcpControl::Rst, TcpSeqNumber(0), Some(self.rcv_nxt), &[]);
        self.write(packet).await;
        Next::Finish
    }

    async fn write(&self, packet: Packet) -> Next {
        if self.ctx.write_packet(packet).await {
            Next::Continue
        } else {
            Next::Finish
        }
    }

    async fn send_frame(&self, control: ControlCode, payload: Vec<u8>) -> Next {
        if self
            .ctx
            .send_frame(ConnMessage::new(self.tag.clone(), control, payload))
            .await
        {
            Next::Continue
        } else {
            Next::Finish
        }
    }

    fn both_finished(&mut self) {
        if self.local_fin && self.remote_fin && self.linger.is_none() {
            self.linger = Some(Instant::now() + FIN_LINGER);
        }
    }

    async fn on_segment(&mut self, segment: TcpSegment) -> Next {
        trace!(
            conn = %self.ctx.id,
            seq = %segment.seq_number(),
            len = segment.payload().len(),
            syn = segment.syn(),
            fin = segment.fin(),
            "Segment from device"
        );

        if segment.rst() {
            debug!(conn = %self.ctx.id, "Connection reset by local side");
            if self.syn_seen {
                self.send_frame(ControlCode::Disconnect, Vec::new()).await;
            }
            return Next::Finish;
        }

        if segment.syn() {
            if !self.syn_seen {
                self.syn_seen = true;
                self.rcv_nxt = segment.seq_number() + 1;
                return self.send_frame(ControlCode::Connect, Vec::new()).await;
            }
            // Retransmitted SYN while the peer is still connecting.
            return Next::Continue;
        }

        if !self.established {
            return Next::Continue;
        }

        if segment.seq_number() != self.rcv_nxt {
            if segment.segment_len() > 0 {
                return self.send_ack().await;
            }
            return Next::Continue;
        }

        let payload_len = segment.payload().len();
        if payload_len > 0 && !self.local_fin {
            let payload = segment.payload().to_vec();
            self.rcv_nxt = self.rcv_nxt + payload_len;
            if self.send_frame(ControlCode::Data, payload).await == Next::Finish {
                return Next::Finish;
            }
        }

        let fin = segment.fin() && !self.local_fin;
        if fin {
            self.local_fin = true;
            self.rcv_nxt = self.rcv_nxt + 1;
            if self.send_frame(ControlCode::Disconnect, Vec::new()).await == Next::Finish {
                return Next::Finish;
            }
        }

        let acks_our_fin = self.remote_fin && segment.ack() && segment.ack_number() == self.snd_nxt;
        if payload_len > 0 || fin {
            if self.send_ack().await == Next::Finish {
                return Next::Finish;
            }
        }

        if self.local_fin && acks_our_fin {
            return Next::Finish;
        }
        self.both_finished();
        Next::Continue
    }

    async fn on_message(&mut self, msg: ConnMessage) -> Next {
        match msg.control() {
            ControlCode::ConnectOk => {
                if !self.syn_seen || self.established {
                    return Next::Continue;
                }
                self.established = true;
                debug!(conn = %self.ctx.id, "Connection established");
                let packet = self.segment(TcpControl::Syn, self.iss, Some(self.rcv_nxt), &[]);
                self.snd_nxt = self.iss + 1;
                self.write(packet).await
            }
            ControlCode::ConnectReject => {
                debug!(conn = %self.ctx.id, "Connection rejected by peer");
                self.reject().await
            }
            ControlCode::Data => {
                if !self.established || self.remote_fin {
                    return Next::Continue;
                }
                for chunk in msg.payload.chunks(self.mss) {
                    let packet = self.segment(TcpControl::Psh, self.snd_nxt, Some(self.rcv_nxt), chunk);
                    self.snd_nxt = self.snd_nxt + chunk.len();
                    if self.write(packet).await == Next::Finish {
                        return Next::Finish;
                    }
                }
                Next::Continue
            }
            ControlCode::Disconnect => {
                if !self.established {
                    return self.reject().await;
                }
                if self.remote_fin {
                    return Next::Continue;
                }
                let packet = self.segment(TcpControl::Fin, self.snd_nxt, Some(self.rcv_nxt), &[]);
                self.snd_nxt = self.snd_nxt + 1;
                self.remote_fin = true;
                self.both_finished();
                self.write(packet).await
            }
            ControlCode::Connect => Next::Continue,
        }
    }

    /// Best-effort reset of the local side when the flow is torn down.
    fn abort(&self) {
        if !self.syn_seen || self.linger.is_some() {
            return;
        }
        let packet = if self.established {
            self.segment(TcpControl::Rst, self.snd_nxt, None, &[])
        } else {
            self.segment(TcpControl::Rst, TcpSeqNumber(0), Some(self.rcv_nxt), &[])
        };
        let _ = self.ctx.outbound.try_send(packet);
    }
}

async fn run(
    mut flow: Flow,
    mut segments: mpsc::Receiver<TcpSegment>,
    mut messages: mpsc::Receiver<ConnMessage>,
) {
    let cancel = flow.ctx.cancel.clone();
    loop {
        let linger = flow.linger;
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                flow.abort();
                break;
            }
            _ = async {
                match linger {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => Next::Finish,
            Some(segment) = segments.recv() => flow.on_segment(segment).await,
            Some(msg) = messages.recv() => flow.on_message(msg).await,
            else => Next::Finish,
        };
        if next == Next::Finish {
            break;
        }
    }
    debug!(conn = %flow.ctx.id, "TCP flow closed");
}
