//! Values published to subscribers.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Anything the engine can poll, cache, publish and persist.
pub trait Resource: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Resource for T where T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// What a subscriber sees. Errors never reach consumers directly; they only
/// show up as the `reason` of a [`PollState::Stale`] value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PollState<T> {
    /// Nothing known yet.
    Loading,
    Fresh {
        data: T,
        fetched_at: DateTime<Utc>,
    },
    /// Last-known-good value. `reason` says why it could not be refreshed.
    Stale {
        data: T,
        fetched_at: DateTime<Utc>,
        reason: String,
    },
}

impl<T> PollState<T> {
    pub fn data(&self) -> Option<&T> {
        match self {
            Self::Loading => None,
            Self::Fresh { data, .. } | Self::Stale { data, .. } => Some(data),
        }
    }

    pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Loading => None,
            Self::Fresh { fetched_at, .. } | Self::Stale { fetched_at, .. } => Some(*fetched_at),
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh { .. })
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }
}

/// Result of one check-and-fetch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Cache entry still fresh; no network call.
    CacheHit,
    Fetched,
    /// Another fetch for the key was in flight, or the key has no subscribers.
    Skipped,
    /// Fetch failed; the last-known-good value (if any) was republished as stale.
    Failed,
    /// Kill switch set; nothing attempted.
    Suspended,
}
