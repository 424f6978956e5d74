//! Consumer handle for one polled key.

use std::sync::Weak;

use tokio::sync::watch;

use super::state::{PollState, Resource};
use super::EngineInner;
use crate::error::{SyncError, SyncResult};

/// Push-style view of one key. Dropping it unsubscribes.
pub struct Subscription<T: Resource> {
    key: String,
    id: u64,
    rx: watch::Receiver<PollState<T>>,
    engine: Weak<EngineInner<T>>,
    released: bool,
}

impl<T: Resource> Subscription<T> {
    pub(super) fn new(
        key: String,
        id: u64,
        rx: watch::Receiver<PollState<T>>,
        engine: Weak<EngineInner<T>>,
    ) -> Self {
        Self {
            key,
            id,
            rx,
            engine,
            released: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn current_value(&self) -> PollState<T> {
        self.rx.borrow().clone()
    }

    /// Wait for the next published value.
    pub async fn changed(&mut self) -> SyncResult<PollState<T>> {
        self.rx.changed().await.map_err(|_| SyncError::Closed {
            message: format!("polling for '{}' stopped", self.key),
        })?;
        Ok(self.rx.borrow_and_update().clone())
    }

    /// A fresh receiver over the same values.
    pub fn receiver(&self) -> watch::Receiver<PollState<T>> {
        self.rx.clone()
    }

    /// Stop receiving values. Idempotent; the last unsubscribe for a key
    /// stops its polling task.
    pub fn unsubscribe(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(engine) = self.engine.upgrade() {
            engine.release(&self.key, self.id);
        }
    }
}

impl<T: Resource> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl<T: Resource + std::fmt::Debug> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("value", &*self.rx.borrow())
            .field("released", &self.released)
            .finish()
    }
}
