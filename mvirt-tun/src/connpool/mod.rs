//! Per-flow connection state: identifiers, the handler registry, and the
//! tunnel stream shared by all flows.

pub mod conn_id;
pub mod handler;
pub mod pool;
pub mod stream;

pub use conn_id::{ConnId, ConnIdError};
pub use handler::{DatagramHandler, Handler, HandlerContext, StreamHandler};
pub use pool::{Pool, PoolError, PoolState};
pub use stream::{Stream, StreamError};
