//! Adaptive synchronization layer for pull-request and CI dashboards.
//!
//! Keeps a dashboard current against a rate-limited, authenticated remote API
//! without blowing the quota:
//!
//! - Token lifecycle manager with single-flight refresh and a FIFO queue for
//!   calls made while authentication is in progress
//! - Request gateway with adaptive pacing, 401 retry, and a process-wide kill
//!   switch for primary and secondary rate limits
//! - TTL memory cache with fingerprints and capacity eviction
//! - Polling engine: one self-scheduling task per key, single-flight fetches,
//!   stale-while-revalidate on failure, snapshot restore on cold start
//!
//! # Quick Start
//!
//! ```no_run
//! use prsync_core::github::{self, PullRequest, RepoSlug};
//! use prsync_core::{SyncConfig, SyncLayer, SyncResult};
//!
//! # async fn example() -> SyncResult<()> {
//! // Token from PRSYNC_TOKEN or GITHUB_TOKEN
//! let layer = SyncLayer::builder().config(SyncConfig::from_env()).build()?;
//! layer.start().await?;
//!
//! let repo = RepoSlug::parse("rust-lang/rust")?;
//! let engine = layer.polling_engine::<Vec<PullRequest>>();
//! let mut pulls = engine.subscribe(
//!     repo.resource_key("pulls"),
//!     github::open_pull_requests(layer.gateway().clone(), &repo),
//! )?;
//!
//! loop {
//!     let state = pulls.changed().await?;
//!     if let Some(prs) = state.data() {
//!         println!("{} open pull requests", prs.len());
//!     }
//! }
//! # }
//! ```
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `PRSYNC_TOKEN` / `GITHUB_TOKEN` | API token |
//! | `PRSYNC_API_URL` | API root (default: `https://api.github.com`) |
//! | `PRSYNC_TIMEOUT_SECS` | Request timeout in seconds (default: 30) |
//! | `PRSYNC_MAX_AUTH_RETRIES` | 401 retries before re-authentication (default: 2) |
//! | `PRSYNC_RATE_LIMIT_BUFFER_SECS` | Safety buffer after a quota reset (default: 4) |
//! | `PRSYNC_SECONDARY_COOLDOWN_SECS` | Secondary limit cool-down (default: 120) |
//! | `PRSYNC_POLL_INTERVAL_SECS` | Polling period (default: 60) |
//! | `PRSYNC_CACHE_TTL_SECS` | Cache TTL for fetched values (default: 45) |
//! | `PRSYNC_CACHE_MAX_ENTRIES` | Memory cache capacity (default: 500) |

pub mod auth;
pub mod cache;
pub mod channel;
pub mod config;
pub mod error;
pub mod gateway;
pub mod github;
pub mod kill_switch;
mod layer;
pub mod polling;
pub mod report;
pub mod snapshot;
mod util;

// Re-export main types
pub use auth::{
    AuthContext, AuthState, CredentialProvider, StaticCredentialProvider, Token,
    TokenLifecycleManager,
};
pub use cache::{CacheEntry, CacheStats, MemoryCache};
pub use channel::Channel;
pub use config::{CacheConfig, GatewayConfig, PacingConfig, PacingTier, PollingConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use gateway::{
    Conditional, GatewayResponse, HttpTransport, Method, RateLimitEstimate, RequestDescriptor,
    RequestGateway, Transport,
};
pub use kill_switch::{KillSwitch, RefreshTrigger};
pub use layer::{SyncLayer, SyncLayerBuilder};
pub use polling::{CycleOutcome, PollState, PollingEngine, Resource, Subscription};
pub use report::{CollectingReporter, ErrorReporter, LastSynced, SyncObserver, TracingReporter};
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, PersistedSnapshot, SnapshotStore};
