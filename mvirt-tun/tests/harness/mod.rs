//! Test harness for dispatcher integration tests
//!
//! Provides an in-memory device, an in-memory remote peer and packet
//! builders, so the dispatcher can run without a TUN device or gRPC server.

#![allow(dead_code)]

pub mod device;
pub mod packets;
pub mod peer;

use std::sync::Arc;
use std::time::Duration;

use mvirt_tun::Dispatcher;
use mvirt_tun::config::DispatcherConfig;
use mvirt_tun::error::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use device::{DeviceHandle, MemoryDevice};
pub use peer::{MemoryConnector, PeerHandle};

/// How long tests wait for something to show up.
pub const WAIT: Duration = Duration::from_secs(2);

/// How long tests wait to be sure nothing shows up.
pub const QUIET: Duration = Duration::from_millis(200);

/// A running dispatcher wired to an in-memory device and peer.
pub struct TestRouter {
    pub dispatcher: Arc<Dispatcher>,
    pub device: DeviceHandle,
    pub peer: PeerHandle,
    pub cancel: CancellationToken,
    runner: JoinHandle<Result<()>>,
}

impl TestRouter {
    pub async fn start(config: DispatcherConfig) -> Self {
        let _ = tracing_subscriber::fmt::try_init();

        let (device, device_handle) = MemoryDevice::new();
        let dispatcher = Dispatcher::new(device.clone(), config);
        device.watch_registry(Arc::clone(dispatcher.registry()));
        let (connector, peer) = MemoryConnector::new();
        dispatcher.set_connector(connector);

        let cancel = CancellationToken::new();
        let runner = {
            let dispatcher = Arc::clone(&dispatcher);
            let cancel = cancel.clone();
            tokio::spawn(async move { dispatcher.run(cancel).await })
        };

        Self {
            dispatcher,
            device: device_handle,
            peer,
            cancel,
            runner,
        }
    }

    /// Stop the dispatcher and wait for its pipelines to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.dispatcher.stop().await;
        self.cancel.cancel();
        tokio::time::timeout(WAIT, self.runner)
            .await
            .expect("dispatcher did not stop")
            .expect("dispatcher task panicked")
    }

    /// Wait for the pipelines to end on their own, then stop the dispatcher.
    pub async fn join(self) -> Result<()> {
        let result = tokio::time::timeout(WAIT, self.runner)
            .await
            .expect("dispatcher did not finish")
            .expect("dispatcher task panicked");
        self.dispatcher.stop().await;
        result
    }
}
