//! Explicit publish/subscribe channel for process-wide broadcast state.
//!
//! Lifecycle:
//!
//! 1. [`Channel::create`] with an initial value
//! 2. [`Channel::publish`] new values (every subscriber observes the latest)
//! 3. [`Channel::subscribe`] hands out independent `watch` receivers
//! 4. [`Channel::close`] drops the sender; receivers see `changed()` fail and
//!    further publishes are rejected with [`SyncError::Closed`]
//!
//! The kill switch and the manual refresh trigger are both built on this type.

use std::sync::Mutex;

use tokio::sync::watch;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::util::lock;

enum State<T> {
    Open(watch::Sender<T>),
    Closed(T),
}

/// A named broadcast value with an explicit close.
pub struct Channel<T> {
    name: &'static str,
    state: Mutex<State<T>>,
}

impl<T> Channel<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create an open channel holding `initial`.
    pub fn create(name: &'static str, initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            name,
            state: Mutex::new(State::Open(tx)),
        }
    }

    /// Publish a value to every subscriber.
    ///
    /// Returns `Ok(true)` if the value differed from the current one and
    /// subscribers were notified, `Ok(false)` if it was already current.
    pub fn publish(&self, value: T) -> SyncResult<bool> {
        match &*lock(&self.state) {
            State::Open(tx) => Ok(tx.send_if_modified(|current| {
                if *current == value {
                    false
                } else {
                    *current = value;
                    true
                }
            })),
            State::Closed(_) => Err(SyncError::Closed {
                message: format!("channel '{}' is closed", self.name),
            }),
        }
    }

    /// Replace the value and notify subscribers even if it did not change.
    pub fn publish_always(&self, value: T) -> SyncResult<()> {
        match &*lock(&self.state) {
            State::Open(tx) => {
                tx.send_replace(value);
                Ok(())
            }
            State::Closed(_) => Err(SyncError::Closed {
                message: format!("channel '{}' is closed", self.name),
            }),
        }
    }

    /// Update the value in place, always notifying subscribers.
    pub fn modify(&self, f: impl FnOnce(&mut T)) -> SyncResult<()> {
        match &*lock(&self.state) {
            State::Open(tx) => {
                tx.send_modify(f);
                Ok(())
            }
            State::Closed(_) => Err(SyncError::Closed {
                message: format!("channel '{}' is closed", self.name),
            }),
        }
    }

    /// Subscribe to the channel.
    ///
    /// The receiver starts with the current value marked as seen. Subscribing
    /// to a closed channel yields a receiver whose `changed()` fails at once.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        match &*lock(&self.state) {
            State::Open(tx) => tx.subscribe(),
            State::Closed(last) => {
                let (_tx, rx) = watch::channel(last.clone());
                rx
            }
        }
    }

    /// Current value.
    pub fn current(&self) -> T {
        match &*lock(&self.state) {
            State::Open(tx) => tx.borrow().clone(),
            State::Closed(last) => last.clone(),
        }
    }

    /// Close the channel. Idempotent.
    pub fn close(&self) {
        let mut state = lock(&self.state);
        if let State::Open(tx) = &*state {
            let last = tx.borrow().clone();
            debug!(channel = self.name, "closing channel");
            *state = State::Closed(last);
        }
    }

    /// Whether [`Channel::close`] has been called.
    pub fn is_closed(&self) -> bool {
        matches!(&*lock(&self.state), State::Closed(_))
    }

    /// Number of live receivers.
    pub fn subscriber_count(&self) -> usize {
        match &*lock(&self.state) {
            State::Open(tx) => tx.receiver_count(),
            State::Closed(_) => 0,
        }
    }

    /// Channel name (for logs).
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        let mut s = f.debug_struct("Channel");
        s.field("name", &self.name);
        match &*state {
            State::Open(tx) => s.field("value", &*tx.borrow()).field("closed", &false),
            State::Closed(last) => s.field("value", last).field("closed", &true),
        };
        s.finish()
    }
}
