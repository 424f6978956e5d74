//! Error types for the synchronization layer.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::auth::AuthState;

/// Synchronization errors.
///
/// `Clone` is required because a single refresh outcome is shared by every
/// caller awaiting it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// Transport failure (connection refused/reset, timeout, DNS).
    #[error("network error: {message}")]
    Network { message: String },

    /// Credential rejected by the remote API (401-class).
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// Call rejected locally because authentication is not possible right now.
    #[error("not authenticated (state: {state})")]
    Unauthenticated { state: AuthState },

    /// Primary quota exhausted; the kill switch is set until `resume_at`.
    #[error("rate limit exceeded: resuming in {retry_after:?}")]
    RateLimitExceeded {
        retry_after: Duration,
        resume_at: Option<DateTime<Utc>>,
    },

    /// Secondary (abuse detection) limit; fixed cool-down, never auto-retried.
    #[error("secondary rate limit: cooling down for {cooldown:?}")]
    SecondaryRateLimit { cooldown: Duration },

    /// Remote 5xx.
    #[error("server error: HTTP {status}: {message}")]
    Server { status: u16, message: String },

    /// Remote 4xx not covered by the other variants.
    #[error("client error: HTTP {status}: {message}")]
    Client { status: u16, message: String },

    /// Malformed or unexpected payload.
    #[error("invalid response: {message}")]
    Validation { message: String },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Persisted snapshot store failure.
    #[error("snapshot error: {message}")]
    Snapshot { message: String },

    /// Channel or engine already shut down.
    #[error("closed: {message}")]
    Closed { message: String },
}

impl SyncError {
    /// Transport failure, expected on flaky networks.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    /// Primary or secondary rate limit.
    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded { .. } | Self::SecondaryRateLimit { .. }
        )
    }

    /// Whether the error belongs in the external error tracker.
    ///
    /// Local rejections (not authenticated, closed) are not remote failures.
    pub fn is_reportable(&self) -> bool {
        !self.is_network()
            && !self.is_rate_limit()
            && !matches!(self, Self::Unauthenticated { .. } | Self::Closed { .. })
    }

    /// Whether the polling backoff should try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::RateLimitExceeded { .. } | Self::Server { .. }
        )
    }

    /// Short, stable label used in logs and error-report context.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Unauthenticated { .. } => "unauthenticated",
            Self::RateLimitExceeded { .. } => "rate_limit",
            Self::SecondaryRateLimit { .. } => "secondary_rate_limit",
            Self::Server { .. } => "server",
            Self::Client { .. } => "client",
            Self::Validation { .. } => "validation",
            Self::Config { .. } => "config",
            Self::Snapshot { .. } => "snapshot",
            Self::Closed { .. } => "closed",
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Validation {
                message: err.to_string(),
            }
        } else {
            Self::Network {
                message: err.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation {
            message: err.to_string(),
        }
    }
}

/// Result type for synchronization operations.
pub type SyncResult<T> = Result<T, SyncError>;
