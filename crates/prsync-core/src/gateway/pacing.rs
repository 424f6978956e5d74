//! Adaptive spacing between outbound calls.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use super::transport::RateLimitInfo;
use crate::config::PacingConfig;
use crate::util::lock;

/// Latest known quota, as seen on the most recent response carrying headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitEstimate {
    pub remaining_quota: Option<u32>,
    pub limit: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
    pub last_observed_at: Option<DateTime<Utc>>,
}

/// Hands out call slots at least `interval` apart.
///
/// Each caller reserves the next slot under the lock and then sleeps until it,
/// so concurrent callers queue up instead of all firing after one sleep.
#[derive(Debug)]
pub(crate) struct Pacer {
    config: PacingConfig,
    estimate: Mutex<RateLimitEstimate>,
    next_slot: Mutex<Option<Instant>>,
}

impl Pacer {
    pub(crate) fn new(config: PacingConfig) -> Self {
        Self {
            config,
            estimate: Mutex::new(RateLimitEstimate::default()),
            next_slot: Mutex::new(None),
        }
    }

    /// Current minimum spacing, derived from the remaining quota.
    pub(crate) fn interval(&self) -> Duration {
        let remaining = lock(&self.estimate).remaining_quota;
        self.config.interval_for(remaining)
    }

    /// Wait for the next slot. Returns how long the caller slept.
    pub(crate) async fn wait(&self) -> Duration {
        let interval = self.interval();
        let now = Instant::now();
        let slot = {
            let mut next = lock(&self.next_slot);
            let slot = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            *next = Some(slot + interval);
            slot
        };

        if slot > now {
            tokio::time::sleep_until(slot).await;
        }
        slot - now
    }

    /// Record quota headers. Responses without them leave the estimate alone.
    pub(crate) fn observe(&self, info: &RateLimitInfo) {
        if info.remaining.is_none() {
            return;
        }
        let mut estimate = lock(&self.estimate);
        estimate.remaining_quota = info.remaining;
        estimate.limit = info.limit.or(estimate.limit);
        estimate.reset_at = info.reset_at.or(estimate.reset_at);
        estimate.last_observed_at = Some(Utc::now());
    }

    pub(crate) fn estimate(&self) -> RateLimitEstimate {
        lock(&self.estimate).clone()
    }
}
