//! Remote peer RPC: generated protobuf types and the tunnel connector.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};
use tracing::info;

use crate::error::{DispatcherError, Result};

#[allow(clippy::enum_variant_names)]
pub mod proto {
    tonic::include_proto!("mvirt.tun");
}

pub use proto::tunnel_client::TunnelClient;
pub use proto::tunnel_server::{Tunnel, TunnelServer};
pub use proto::{ConnMessage, ControlCode};

/// Frames received from the remote peer.
pub type Inbound =
    Pin<Box<dyn tokio_stream::Stream<Item = std::result::Result<ConnMessage, tonic::Status>> + Send>>;

/// Opens the multiplexed stream to the remote peer.
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    /// Open the stream. `outbound` feeds the request side for its whole
    /// lifetime.
    async fn open(
        &self,
        outbound: ReceiverStream<ConnMessage>,
    ) -> std::result::Result<Inbound, tonic::Status>;
}

/// Connector for a peer serving `Tunnel` over plaintext HTTP/2.
#[derive(Clone)]
pub struct GrpcConnector {
    client: TunnelClient<Channel>,
}

impl GrpcConnector {
    /// Dial `http://127.0.0.1:<port>`, giving up after `timeout`.
    pub async fn connect(port: u16, timeout: Duration) -> Result<Self> {
        let endpoint = Endpoint::from_shared(format!("http://127.0.0.1:{port}"))?
            .connect_timeout(timeout);
        let channel = tokio::time::timeout(timeout, endpoint.connect())
            .await
            .map_err(|_| DispatcherError::EstablishmentTimeout(timeout))??;
        info!(port, "Connected to remote peer");
        Ok(Self {
            client: TunnelClient::new(channel),
        })
    }
}

#[async_trait]
impl TunnelConnector for GrpcConnector {
    async fn open(
        &self,
        outbound: ReceiverStream<ConnMessage>,
    ) -> std::result::Result<Inbound, tonic::Status> {
        let mut client = self.client.clone();
        let response = client.conn_tunnel(outbound).await?;
        Ok(Box::pin(response.into_inner()))
    }
}

impl ConnMessage {
    pub fn new(conn_id: Vec<u8>, control: ControlCode, payload: Vec<u8>) -> Self {
        Self {
            conn_id,
            control: control as i32,
            payload,
        }
    }

    pub fn data(conn_id: Vec<u8>, payload: Vec<u8>) -> Self {
        Self::new(conn_id, ControlCode::Data, payload)
    }

    pub fn control_only(conn_id: Vec<u8>, control: ControlCode) -> Self {
        Self::new(conn_id, control, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_message_helpers() {
        let msg = ConnMessage::data(vec![1, 2], b"abc".to_vec());
        assert_eq!(msg.control(), ControlCode::Data);
        assert_eq!(msg.payload, b"abc");

        let msg = ConnMessage::control_only(vec![1], ControlCode::Disconnect);
        assert_eq!(msg.control(), ControlCode::Disconnect);
        assert!(msg.payload.is_empty());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind and drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = GrpcConnector::connect(port, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(DispatcherError::Connect(_))));
    }
}
