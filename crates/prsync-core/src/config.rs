//! Configuration for the synchronization layer.
//!
//! Every tunable is a plain value with a default. Pacing tiers and
//! rate-limit buffers are empirically chosen, not correctness invariants.
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `PRSYNC_API_URL` | API base URL (default: `https://api.github.com`) |
//! | `PRSYNC_TIMEOUT_SECS` | Request timeout in seconds (default: 30) |
//! | `PRSYNC_MAX_AUTH_RETRIES` | Retries after a 401 (default: 2) |
//! | `PRSYNC_RATE_LIMIT_BUFFER_SECS` | Safety buffer added to the reset time (default: 4) |
//! | `PRSYNC_SECONDARY_COOLDOWN_SECS` | Cool-down after an abuse-detection limit (default: 120) |
//! | `PRSYNC_POLL_INTERVAL_SECS` | Polling period (default: 60) |
//! | `PRSYNC_CACHE_TTL_SECS` | TTL for fetched resources (default: 45) |
//! | `PRSYNC_CACHE_MAX_ENTRIES` | Memory cache entry limit (default: 500) |

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Durations are written as integer milliseconds in config files.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub pacing: PacingConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub polling: PollingConfig,
}

/// Request gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Base URL for the remote API.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Request timeout.
    #[serde(default = "default_timeout", with = "duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,

    /// Retries after a 401 before forcing full re-authentication.
    #[serde(default = "default_max_auth_retries")]
    pub max_auth_retries: u32,

    /// Base of the `base * 2^attempt` backoff between 401 retries.
    #[serde(
        default = "default_auth_backoff_base",
        with = "duration_ms",
        rename = "auth_backoff_base_ms"
    )]
    pub auth_backoff_base: Duration,

    /// Added to the provider's reset time before clearing the kill switch.
    #[serde(
        default = "default_rate_limit_buffer",
        with = "duration_ms",
        rename = "rate_limit_buffer_ms"
    )]
    pub rate_limit_buffer: Duration,

    /// Cool-down when the provider reports no usable reset time.
    #[serde(
        default = "default_fallback_cooldown",
        with = "duration_ms",
        rename = "fallback_cooldown_ms"
    )]
    pub fallback_cooldown: Duration,

    /// Fixed cool-down after a secondary (abuse detection) limit.
    #[serde(
        default = "default_secondary_cooldown",
        with = "duration_ms",
        rename = "secondary_cooldown_ms"
    )]
    pub secondary_cooldown: Duration,
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_auth_retries() -> u32 {
    2
}

fn default_auth_backoff_base() -> Duration {
    Duration::from_millis(500)
}

fn default_rate_limit_buffer() -> Duration {
    Duration::from_secs(4)
}

fn default_fallback_cooldown() -> Duration {
    Duration::from_secs(60)
}

fn default_secondary_cooldown() -> Duration {
    Duration::from_secs(120)
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            timeout: default_timeout(),
            max_auth_retries: default_max_auth_retries(),
            auth_backoff_base: default_auth_backoff_base(),
            rate_limit_buffer: default_rate_limit_buffer(),
            fallback_cooldown: default_fallback_cooldown(),
            secondary_cooldown: default_secondary_cooldown(),
        }
    }
}

/// One pacing tier: below `remaining_below` calls are spaced by `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacingTier {
    pub remaining_below: u32,

    #[serde(with = "duration_ms", rename = "interval_ms")]
    pub interval: Duration,
}

/// Adaptive pacing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Interval while the quota is healthy or unknown.
    #[serde(
        default = "default_base_interval",
        with = "duration_ms",
        rename = "base_interval_ms"
    )]
    pub base_interval: Duration,

    /// Narrower tiers win: the tier with the smallest matching threshold applies.
    #[serde(default = "default_tiers")]
    pub tiers: Vec<PacingTier>,
}

fn default_base_interval() -> Duration {
    Duration::from_millis(300)
}

fn default_tiers() -> Vec<PacingTier> {
    vec![
        PacingTier {
            remaining_below: 1000,
            interval: Duration::from_millis(500),
        },
        PacingTier {
            remaining_below: 500,
            interval: Duration::from_secs(1),
        },
        PacingTier {
            remaining_below: 100,
            interval: Duration::from_secs(2),
        },
    ]
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            base_interval: default_base_interval(),
            tiers: default_tiers(),
        }
    }
}

impl PacingConfig {
    /// Minimum spacing between calls for an observed remaining quota.
    pub fn interval_for(&self, remaining: Option<u32>) -> Duration {
        let Some(remaining) = remaining else {
            return self.base_interval;
        };

        self.tiers
            .iter()
            .filter(|tier| remaining < tier.remaining_below)
            .min_by_key(|tier| tier.remaining_below)
            .map(|tier| tier.interval)
            .unwrap_or(self.base_interval)
    }
}

/// Memory cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    #[serde(
        default = "default_sweep_interval",
        with = "duration_ms",
        rename = "sweep_interval_ms"
    )]
    pub sweep_interval: Duration,
}

fn default_max_entries() -> usize {
    500
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

/// Polling engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Period between check-and-fetch cycles.
    #[serde(default = "default_poll_interval", with = "duration_ms", rename = "interval_ms")]
    pub interval: Duration,

    /// TTL written with every successful fetch.
    #[serde(default = "default_cache_ttl", with = "duration_ms", rename = "cache_ttl_ms")]
    pub cache_ttl: Duration,

    /// Upper bound (exclusive) of the randomized retry delay after a failure.
    #[serde(
        default = "default_retry_jitter_max",
        with = "duration_ms",
        rename = "retry_jitter_max_ms"
    )]
    pub retry_jitter_max: Duration,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(45)
}

fn default_retry_jitter_max() -> Duration {
    Duration::from_secs(10)
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
            cache_ttl: default_cache_ttl(),
            retry_jitter_max: default_retry_jitter_max(),
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl SyncConfig {
    /// Defaults overridden by `PRSYNC_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("PRSYNC_API_URL") {
            if !url.is_empty() {
                config.gateway.api_url = url;
            }
        }
        if let Some(timeout) = env_secs("PRSYNC_TIMEOUT_SECS") {
            config.gateway.timeout = timeout;
        }
        if let Some(retries) = env_parse("PRSYNC_MAX_AUTH_RETRIES") {
            config.gateway.max_auth_retries = retries;
        }
        if let Some(buffer) = env_secs("PRSYNC_RATE_LIMIT_BUFFER_SECS") {
            config.gateway.rate_limit_buffer = buffer;
        }
        if let Some(cooldown) = env_secs("PRSYNC_SECONDARY_COOLDOWN_SECS") {
            config.gateway.secondary_cooldown = cooldown;
        }
        if let Some(interval) = env_secs("PRSYNC_POLL_INTERVAL_SECS") {
            config.polling.interval = interval;
        }
        if let Some(ttl) = env_secs("PRSYNC_CACHE_TTL_SECS") {
            config.polling.cache_ttl = ttl;
        }
        if let Some(max) = env_parse("PRSYNC_CACHE_MAX_ENTRIES") {
            config.cache.max_entries = max;
        }

        config
    }

    /// Parse a YAML document. Missing sections fall back to defaults.
    pub fn from_yaml_str(yaml: &str) -> SyncResult<Self> {
        let config: Self = serde_yaml::from_str(yaml).map_err(|e| SyncError::Config {
            message: format!("failed to parse config: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML config file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| SyncError::Config {
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Reject values that would make the engine spin or never poll.
    pub fn validate(&self) -> SyncResult<()> {
        if self.polling.interval.is_zero() {
            return Err(SyncError::Config {
                message: "polling.interval_ms must be greater than zero".into(),
            });
        }
        if self.cache.sweep_interval.is_zero() {
            return Err(SyncError::Config {
                message: "cache.sweep_interval_ms must be greater than zero".into(),
            });
        }
        if self.cache.max_entries == 0 {
            return Err(SyncError::Config {
                message: "cache.max_entries must be greater than zero".into(),
            });
        }
        url::Url::parse(&self.gateway.api_url).map_err(|e| SyncError::Config {
            message: format!("invalid gateway.api_url '{}': {}", self.gateway.api_url, e),
        })?;
        Ok(())
    }

    /// Set the API base URL.
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.gateway.api_url = url.into();
        self
    }

    /// Set the polling period.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.polling.interval = interval;
        self
    }

    /// Set the TTL for fetched resources.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.polling.cache_ttl = ttl;
        self
    }
}
