//! Error types for the router.
//!
//! Per-packet errors (`ParseError`, `FlowError`, `PoolError`) are logged and
//! the packet is dropped. `DispatcherError` is pipeline-level and ends
//! `Dispatcher::run` unless the dispatcher is shutting down.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::connpool::ConnId;

pub use crate::connpool::{PoolError, StreamError};
pub use crate::packet::ParseError;

/// A packet could not be turned into a flow.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("dispatching got RST without connection workflow: {0}")]
    ResetWithoutFlow(ConnId),

    #[error("failed to create handler for {conn}: {reason}")]
    Create { conn: ConnId, reason: String },
}

/// Dispatcher errors.
#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("device read error: {0}")]
    DeviceRead(#[source] io::Error),

    #[error("device write error: {0}")]
    DeviceWrite(#[source] io::Error),

    #[error("device error: {0}")]
    Device(#[from] io::Error),

    #[error("tunnel stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("failed to connect to remote peer: {0}")]
    Connect(#[from] tonic::transport::Error),

    #[error("timed out after {0:?} connecting to remote peer")]
    EstablishmentTimeout(Duration),

    #[error("failed to open tunnel: {0}")]
    OpenTunnel(#[from] tonic::Status),

    #[error("dispatcher is already running")]
    AlreadyRunning,

    #[error("pipeline task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, DispatcherError>;
