//! Packet dispatcher.
//!
//! Runs the three pipelines between the device and the remote peer:
//!
//! - **device writer**: drains the outbound queue into the device.
//! - **tunnel reader**: routes frames from the peer to flow handlers.
//! - **device reader**: parses packets from the device, answers what cannot
//!   be routed with ICMP, and hands everything else to its flow handler.
//!
//! Shutdown goes `Running -> Closing -> Closed`. [`Dispatcher::stop`] moves to
//! `Closing` (no new flows), waits for every handler task, moves to `Closed`
//! and only then closes the device, so device errors caused by the close are
//! not reported.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ipnet::IpNet;
use smoltcp::wire::IpProtocol;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferPool, PoolBuffer};
use crate::config::{
    DispatcherConfig, DnsConfig, OUTBOUND_QUEUE_CAPACITY, TUNNEL_QUEUE_CAPACITY,
    is_blocked_udp_port,
};
use crate::connpool::{ConnId, Handler, HandlerContext, Pool, PoolState, Stream, StreamError};
use crate::device::Device;
use crate::error::{DispatcherError, FlowError, Result};
use crate::handler::{DnsHandler, TcpHandler, UdpHandler};
use crate::packet::{
    Datagram, Packet, Reassembler, TcpSegment, UnreachableCode, destination_unreachable,
};
use crate::tunnel::{GrpcConnector, TunnelConnector};

type Session = Option<Arc<dyn TunnelConnector>>;

pub struct Dispatcher {
    device: Arc<dyn Device>,
    registry: Arc<Pool>,
    stream: Arc<Stream>,
    buffers: Arc<BufferPool>,
    outbound_tx: mpsc::Sender<Packet>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    session: watch::Sender<Session>,
    dns: Mutex<Option<DnsConfig>>,
    mtu: usize,
    dial_timeout: Duration,
    /// Cancelled once the state is `Closed`.
    closed: CancellationToken,
}

impl Dispatcher {
    pub fn new(device: Arc<dyn Device>, config: DispatcherConfig) -> Arc<Self> {
        let registry = Pool::new();
        let stream = Stream::new(Arc::clone(&registry), TUNNEL_QUEUE_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (session, _) = watch::channel(None);
        Arc::new(Self {
            device,
            registry,
            stream,
            buffers: BufferPool::new(config.mtu),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            session,
            dns: Mutex::new(config.dns),
            mtu: config.mtu,
            dial_timeout: config.dial_timeout,
            closed: CancellationToken::new(),
        })
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn registry(&self) -> &Arc<Pool> {
        &self.registry
    }

    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    pub fn state(&self) -> PoolState {
        self.registry.state()
    }

    fn is_closed(&self) -> bool {
        self.state() == PoolState::Closed
    }

    /// Intercept datagrams to `ip:port` and answer them from the resolver at
    /// `local_addr`.
    pub fn configure_dns(&self, ip: IpAddr, port: u16, local_addr: SocketAddr) {
        info!(%ip, port, %local_addr, "DNS interception configured");
        *self.dns.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(DnsConfig::new(ip, port, local_addr));
    }

    fn dns(&self) -> Option<DnsConfig> {
        *self.dns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connect to the remote peer listening on `127.0.0.1:<port>`.
    ///
    /// Releases the waiting pipelines on success. Once a session exists,
    /// later calls do nothing.
    pub async fn configure_session(&self, port: u16) -> Result<()> {
        if self.session.borrow().is_some() {
            return Ok(());
        }
        let connector = GrpcConnector::connect(port, self.dial_timeout).await?;
        self.set_connector(Arc::new(connector));
        Ok(())
    }

    /// Use `connector` to open the tunnel. Only the first connector is kept.
    pub fn set_connector(&self, connector: Arc<dyn TunnelConnector>) {
        let published = self.session.send_if_modified(|session| {
            if session.is_some() {
                return false;
            }
            *session = Some(connector);
            true
        });
        if published {
            info!("Tunnel session configured");
        }
    }

    /// Route every subnet in `subnets` through the device.
    pub async fn add_subnets(&self, subnets: &[IpNet]) -> Result<()> {
        for subnet in subnets {
            debug!(%subnet, "Adding subnet");
            self.device.add_subnet(*subnet).await?;
        }
        Ok(())
    }

    /// Run the pipelines until they finish or `cancel` fires.
    ///
    /// Returns the first pipeline error.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let outbound_rx = self
            .outbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(DispatcherError::AlreadyRunning)?;

        let group = cancel.child_token();
        let mut tasks = JoinSet::new();
        tasks.spawn(Arc::clone(self).device_writer(outbound_rx, group.clone()));
        tasks.spawn(Arc::clone(self).tunnel_reader(group.clone()));
        tasks.spawn(Arc::clone(self).device_reader(group.clone()));
        info!("Dispatcher running");

        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let err = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => DispatcherError::Join(e),
            };
            error!(error = %err, "Dispatcher pipeline failed");
            if result.is_ok() {
                result = Err(err);
            }
            group.cancel();
        }
        result
    }

    /// Run the pipelines until `shutdown` resolves or one of them fails, then
    /// stop.
    ///
    /// A pipeline failure is returned once the dispatcher has stopped.
    pub async fn serve<F>(self: &Arc<Self>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let cancel = CancellationToken::new();
        let run = self.run(cancel.clone());
        tokio::pin!(run);

        let finished = tokio::select! {
            res = &mut run => Some(res),
            _ = shutdown => None,
        };
        self.stop().await;
        cancel.cancel();
        match finished {
            Some(res) => res,
            None => run.await,
        }
    }

    /// Shut down: stop creating flows, wait for all handlers to finish, then
    /// close the device.
    pub async fn stop(&self) {
        info!("Stopping dispatcher");
        self.registry.close_all();
        self.registry.wait().await;
        self.registry.mark_closed();
        self.closed.cancel();
        if let Err(e) = self.device.close().await {
            warn!(error = %e, "Failed to close device");
        }
        info!("Dispatcher stopped");
    }

    /// Wait until the tunnel session is configured. `None` on shutdown.
    async fn wait_session(&self, cancel: &CancellationToken) -> Session {
        let mut session = self.session.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => None,
            _ = self.closed.cancelled() => None,
            res = session.wait_for(Option::is_some) => res.ok().and_then(|s| s.clone()),
        }
    }

    async fn device_writer(
        self: Arc<Self>,
        mut outbound: mpsc::Receiver<Packet>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            let packet = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.closed.cancelled() => return Ok(()),
                packet = outbound.recv() => match packet {
                    Some(packet) => packet,
                    None => return Ok(()),
                },
            };
            debug!(
                src = %packet.header().src(),
                dst = %packet.header().dst(),
                proto = %packet.header().protocol(),
                len = packet.data().len(),
                "-> TUN"
            );
            let result = self.device.write(packet.data()).await;
            drop(packet);
            if let Err(e) = result {
                if self.is_closed() || cancel.is_cancelled() {
                    return Ok(());
                }
                return Err(DispatcherError::DeviceWrite(e));
            }
        }
    }

    async fn tunnel_reader(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let Some(connector) = self.wait_session(&cancel).await else {
            return Ok(());
        };
        let outbound = self.stream.take_outbound().ok_or(StreamError::Closed)?;
        // Connecting only proves the socket is up. The stream opens once the
        // peer answers HTTP/2, so that wait shares the dial deadline.
        let open = tokio::time::timeout(self.dial_timeout, connector.open(outbound));
        let inbound = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = self.closed.cancelled() => return Ok(()),
            inbound = open => inbound
                .map_err(|_| DispatcherError::EstablishmentTimeout(self.dial_timeout))??,
        };
        info!("Tunnel stream open");

        tokio::select! {
            res = self.stream.read_loop(inbound, cancel.clone()) => Ok(res?),
            _ = self.closed.cancelled() => Ok(()),
        }
    }

    async fn device_reader(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        if self.wait_session(&cancel).await.is_none() {
            return Ok(());
        }
        let mut reassembler = Reassembler::new(Arc::clone(&self.buffers));

        while !self.is_closed() {
            let mut buf = self.buffers.alloc_mtu();
            let len = loop {
                let res = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = self.closed.cancelled() => return Ok(()),
                    res = self.device.read(buf.data_mut()) => res,
                };
                match res {
                    Ok(0) => continue,
                    Ok(len) => break len,
                    Err(e) => {
                        if self.is_closed() || cancel.is_cancelled() {
                            return Ok(());
                        }
                        return Err(DispatcherError::DeviceRead(e));
                    }
                }
            };
            buf.set_len(len);
            self.handle_packet(buf, &mut reassembler, &cancel).await;
        }
        Ok(())
    }

    /// Queue a packet for the device writer.
    async fn queue(&self, packet: Packet, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.closed.cancelled() => {}
            res = self.outbound_tx.send(packet) => {
                if res.is_err() {
                    debug!("Device writer gone, packet dropped");
                }
            }
        }
    }

    async fn unreachable(&self, packet: &Packet, code: UnreachableCode, cancel: &CancellationToken) {
        debug!(
            src = %packet.header().src(),
            dst = %packet.header().dst(),
            ?code,
            "Answering with ICMP destination unreachable"
        );
        let reply = destination_unreachable(&self.buffers, self.mtu, packet, code);
        self.queue(reply, cancel).await;
    }

    async fn handle_packet(
        &self,
        buf: PoolBuffer,
        reassembler: &mut Reassembler,
        cancel: &CancellationToken,
    ) {
        let packet = match Packet::parse(buf) {
            Ok(packet) => packet,
            Err(e) => {
                error!(error = %e, "Unable to parse packet header");
                return;
            }
        };

        let header = *packet.header();
        if header.is_oversize(self.mtu) {
            self.unreachable(&packet, UnreachableCode::MustFragment, cancel)
                .await;
            return;
        }

        let packet = if header.is_fragment() {
            match reassembler.process(packet) {
                Some(packet) => packet,
                None => return,
            }
        } else {
            packet
        };

        match header.protocol() {
            IpProtocol::Tcp => self.dispatch_tcp(packet, cancel).await,
            IpProtocol::Udp => self.dispatch_udp(packet, cancel).await,
            IpProtocol::Icmp | IpProtocol::Icmpv6 => {
                debug!(src = %header.src(), dst = %header.dst(), "<- TUN ICMP, ignored");
            }
            _ => {
                self.unreachable(&packet, UnreachableCode::ProtocolUnreachable, cancel)
                    .await
            }
        }
    }

    fn context(
        &self,
        id: ConnId,
        dns_addr: Option<SocketAddr>,
        cancel: &CancellationToken,
    ) -> HandlerContext {
        HandlerContext {
            id,
            stream: Arc::clone(&self.stream),
            outbound: self.outbound_tx.clone(),
            buffers: Arc::clone(&self.buffers),
            registry: Arc::clone(&self.registry),
            cancel: cancel.child_token(),
            mtu: self.mtu,
            dns_addr,
        }
    }

    async fn dispatch_tcp(&self, packet: Packet, cancel: &CancellationToken) {
        let segment = match TcpSegment::new(packet) {
            Ok(segment) => segment,
            Err(e) => {
                warn!(error = %e, "Dropping invalid TCP segment");
                return;
            }
        };
        let id = segment.conn_id();
        debug!(conn = %id, len = segment.payload().len(), "<- TUN");

        let handler = match self.registry.get(&id) {
            Some(handler) => handler,
            None => {
                if segment.rst() {
                    error!(error = %FlowError::ResetWithoutFlow(id), "Dropping segment");
                    return;
                }
                if !segment.syn() {
                    debug!(conn = %id, "No flow for segment, resetting");
                    let reset = segment.reset(&self.buffers);
                    self.queue(reset, cancel).await;
                    return;
                }
                let ctx = self.context(id, None, cancel);
                match self
                    .registry
                    .get_or_create(id, || async move { Ok(TcpHandler::spawn(ctx)) })
                    .await
                {
                    Ok(handler) => handler,
                    Err(e) => {
                        error!(conn = %id, error = %e, "Failed to create TCP flow");
                        return;
                    }
                }
            }
        };

        match handler {
            Handler::Stream(h) => h.handle_packet(segment).await,
            Handler::Datagram(_) => warn!(conn = %id, "TCP segment for datagram flow"),
        }
    }

    async fn dispatch_udp(&self, packet: Packet, cancel: &CancellationToken) {
        let dst = packet.header().dst();
        if is_link_local(dst) {
            return;
        }
        if let IpAddr::V4(v4) = dst {
            let octets = v4.octets();
            if octets[2] == 0 && octets[3] == 0 {
                // Subnet zero address: nothing to pass on.
                self.unreachable(&packet, UnreachableCode::HostUnreachable, cancel)
                    .await;
                return;
            }
        }

        let datagram = match Datagram::new(packet) {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!(error = %e, "Dropping invalid UDP datagram");
                return;
            }
        };
        if is_blocked_udp_port(datagram.src().port()) || is_blocked_udp_port(datagram.dst().port()) {
            self.unreachable(datagram.packet(), UnreachableCode::PortUnreachable, cancel)
                .await;
            return;
        }

        let id = datagram.conn_id();
        debug!(conn = %id, len = datagram.payload().len(), "<- TUN");

        let handler = match self.registry.get(&id) {
            Some(handler) => handler,
            None => {
                // The handler kind is decided here, once per flow.
                let dns = self
                    .dns()
                    .filter(|dns| dns.matches(datagram.dst().ip(), datagram.dst().port()));
                let ctx = self.context(id, dns.map(|dns| dns.local_addr), cancel);
                let created = self
                    .registry
                    .get_or_create(id, || async move {
                        if ctx.dns_addr.is_some() {
                            DnsHandler::spawn(ctx).await
                        } else {
                            Ok(UdpHandler::spawn(ctx))
                        }
                    })
                    .await;
                match created {
                    Ok(handler) => handler,
                    Err(e) => {
                        error!(conn = %id, error = %e, "Failed to create UDP flow");
                        return;
                    }
                }
            }
        };

        match handler {
            Handler::Datagram(h) => h.new_datagram(datagram).await,
            Handler::Stream(_) => warn!(conn = %id, "UDP datagram for stream flow"),
        }
    }
}

fn is_link_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            v4.is_link_local() || (o[0] == 224 && o[1] == 0 && o[2] == 0)
        }
        IpAddr::V6(v6) => v6.is_unicast_link_local() || (v6.segments()[0] & 0xff0f) == 0xff02,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_link_local() {
        assert!(is_link_local("169.254.1.2".parse().unwrap()));
        assert!(is_link_local("224.0.0.251".parse().unwrap()));
        assert!(is_link_local("fe80::1".parse().unwrap()));
        assert!(is_link_local("ff02::fb".parse().unwrap()));
        assert!(!is_link_local("10.0.0.1".parse().unwrap()));
        assert!(!is_link_local("224.1.0.1".parse().unwrap()));
        assert!(!is_link_local("fd00::1".parse().unwrap()));
    }
}
