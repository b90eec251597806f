//! Connection registry.
//!
//! Maps flow identifiers to live handlers. Creation is single-flight: each
//! key gets a `OnceCell` slot when first requested, and concurrent callers
//! for the same key wait on that slot while one of them runs the factory.
//! The map lock is only held for lookups and is never held across an await.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::OnceCell;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use super::{ConnId, Handler};
use crate::error::FlowError;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection pool is closed")]
    Closed,

    #[error(transparent)]
    Factory(#[from] FlowError),
}

/// Shutdown state, shared by every pipeline through the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Running,
    Closing,
    Closed,
}

type Slot = Arc<OnceCell<Handler>>;

struct Inner {
    state: PoolState,
    entries: HashMap<ConnId, Slot>,
}

pub struct Pool {
    inner: Mutex<Inner>,
    tracker: TaskTracker,
}

impl Pool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: PoolState::Running,
                entries: HashMap::new(),
            }),
            tracker: TaskTracker::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the handler for `id`, creating it with `factory` if needed.
    ///
    /// The factory runs at most once per successful creation even with
    /// concurrent callers; they all receive the same handler. A failed
    /// factory leaves no entry behind.
    pub async fn get_or_create<F, Fut>(&self, id: ConnId, factory: F) -> Result<Handler, PoolError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Handler, FlowError>>,
    {
        // The tracker token is taken under the same lock as the state check:
        // a stop that closes the pool after this point waits for the token,
        // and so for any handler task the factory spawns.
        let (slot, _token) = {
            let mut inner = self.lock();
            if inner.state != PoolState::Running {
                return Err(PoolError::Closed);
            }
            (
                Arc::clone(inner.entries.entry(id).or_default()),
                self.tracker.token(),
            )
        };

        match slot.get_or_try_init(factory).await {
            Ok(handler) => {
                let handler = handler.clone();
                if self.state() != PoolState::Running {
                    // Created while stopping; close_all may have missed it.
                    handler.close();
                }
                Ok(handler)
            }
            Err(e) => {
                let mut inner = self.lock();
                if let Some(current) = inner.entries.get(&id) {
                    if Arc::ptr_eq(current, &slot) && !slot.initialized() {
                        inner.entries.remove(&id);
                    }
                }
                Err(e.into())
            }
        }
    }

    /// Look up a live handler. Never creates one.
    pub fn get(&self, id: &ConnId) -> Option<Handler> {
        self.lock().entries.get(id).and_then(|slot| slot.get().cloned())
    }

    /// Detach the handler for `id`. Returns false if there was none.
    pub fn remove(&self, id: &ConnId) -> bool {
        let removed = self.lock().entries.remove(id).is_some();
        if removed {
            debug!(conn = %id, "Flow removed from registry");
        }
        removed
    }

    /// Stop accepting new handlers and ask every live one to close.
    ///
    /// Does not wait for the handler tasks, see [`Pool::wait`].
    pub fn close_all(&self) {
        let handlers: Vec<Handler> = {
            let mut inner = self.lock();
            if inner.state == PoolState::Running {
                inner.state = PoolState::Closing;
            }
            inner
                .entries
                .values()
                .filter_map(|slot| slot.get().cloned())
                .collect()
        };
        info!(count = handlers.len(), "Closing all flow handlers");
        for handler in handlers {
            handler.close();
        }
    }

    /// Wait until every handler task has finished.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    pub fn state(&self) -> PoolState {
        self.lock().state
    }

    pub fn mark_closed(&self) {
        self.lock().state = PoolState::Closed;
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Number of registered flows.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
