//! mvirt-tun: user-space router between a TUN device and a remote peer.
//!
//! Packets the local OS routes into the remote subnets are read from the
//! device, classified per flow and carried over a single multiplexed gRPC
//! stream. Traffic from the peer is turned back into IP packets and written
//! to the device.

pub mod buffer;
pub mod config;
pub mod connpool;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod packet;
pub mod tunnel;

pub use dispatcher::Dispatcher;
pub use error::{DispatcherError, Result};
