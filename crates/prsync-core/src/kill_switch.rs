//! Process-wide kill switch and manual refresh trigger.
//!
//! The kill switch is a broadcast boolean meaning "the remote API is
//! rejecting or throttling us". It has no timers of its own: whoever sets it
//! to `true` schedules the clear.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::channel::Channel;

/// Shared circuit breaker for outbound calls.
#[derive(Debug, Clone)]
pub struct KillSwitch {
    channel: Arc<Channel<bool>>,
}

impl KillSwitch {
    /// Create a cleared kill switch.
    pub fn new() -> Self {
        Self {
            channel: Arc::new(Channel::create("kill_switch", false)),
        }
    }

    /// Set or clear the switch. Returns `true` if the state changed.
    pub fn set(&self, active: bool) -> bool {
        match self.channel.publish(active) {
            Ok(changed) => {
                if changed && active {
                    warn!("kill switch engaged, outbound calls suspended");
                } else if changed {
                    info!("kill switch cleared, outbound calls resumed");
                }
                changed
            }
            Err(e) => {
                debug!(error = %e, "ignoring kill switch update");
                false
            }
        }
    }

    /// Whether outbound calls are currently suspended.
    pub fn is_active(&self) -> bool {
        self.channel.current()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.channel.subscribe()
    }

    /// Close the underlying channel; subscribers stop receiving updates.
    pub fn close(&self) {
        self.channel.close();
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

/// Manual "refresh now" broadcast.
///
/// Each [`RefreshTrigger::fire`] bumps a generation counter; subscribers
/// react to `changed()` and force an immediate fetch.
#[derive(Debug, Clone)]
pub struct RefreshTrigger {
    channel: Arc<Channel<u64>>,
}

impl RefreshTrigger {
    pub fn new() -> Self {
        Self {
            channel: Arc::new(Channel::create("refresh_trigger", 0)),
        }
    }

    /// Ask every active subscription to resync immediately.
    pub fn fire(&self) {
        match self.channel.modify(|generation| *generation = generation.wrapping_add(1)) {
            Ok(()) => debug!(generation = self.channel.current(), "manual refresh fired"),
            Err(e) => debug!(error = %e, "ignoring manual refresh"),
        }
    }

    pub fn generation(&self) -> u64 {
        self.channel.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.channel.subscribe()
    }

    pub fn close(&self) {
        self.channel.close();
    }
}

impl Default for RefreshTrigger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_broadcasts_to_all_subscribers() {
        let switch = KillSwitch::new();
        let mut a = switch.subscribe();
        let mut b = switch.subscribe();

        assert!(switch.set(true));
        a.changed().await.unwrap();
        b.changed().await.unwrap();
        assert!(*a.borrow());
        assert!(*b.borrow());
        assert!(switch.is_active());
    }

    #[test]
    fn test_set_is_idempotent() {
        let switch = KillSwitch::new();
        assert!(switch.set(true));
        assert!(!switch.set(true));
        assert!(switch.set(false));
        assert!(!switch.set(false));
    }

    #[test]
    fn test_never_self_clears() {
        let switch = KillSwitch::new();
        switch.set(true);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(switch.is_active());
    }

    #[test]
    fn test_set_after_close_is_ignored() {
        let switch = KillSwitch::new();
        switch.close();
        assert!(!switch.set(true));
        assert!(!switch.is_active());
    }

    #[tokio::test]
    async fn test_trigger_bumps_generation() {
        let trigger = RefreshTrigger::new();
        let mut rx = trigger.subscribe();

        trigger.fire();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);

        trigger.fire();
        trigger.fire();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 3);
    }
}
