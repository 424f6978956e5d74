//! GitHub bindings: environment credentials, resource models and fetch
//! callbacks for the polling engine.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::{CredentialProvider, Token};
use crate::cache::MemoryCache;
use crate::config::GatewayConfig;
use crate::error::{SyncError, SyncResult};
use crate::gateway::{
    parse_rate_limit, Conditional, RateLimitInfo, RequestDescriptor, RequestGateway,
};
use crate::util::lock;

/// Checked in order; the first non-empty one wins.
pub const TOKEN_ENV_VARS: [&str; 2] = ["PRSYNC_TOKEN", "GITHUB_TOKEN"];

const USER_AGENT_VALUE: &str = concat!("prsync/", env!("CARGO_PKG_VERSION"));

/// `owner/repo`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoSlug {
    pub owner: String,
    pub repo: String,
}

impl RepoSlug {
    pub fn parse(input: &str) -> SyncResult<Self> {
        static SLUG: OnceLock<Regex> = OnceLock::new();
        let re = SLUG.get_or_init(|| {
            Regex::new(r"^([A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)/([A-Za-z0-9._-]+)$")
                .expect("repo slug regex")
        });

        let caps = re.captures(input.trim()).ok_or_else(|| SyncError::Config {
            message: format!("invalid repository {:?}, expected owner/repo", input),
        })?;
        Ok(Self {
            owner: caps[1].to_string(),
            repo: caps[2].to_string(),
        })
    }

    /// Polling key for one resource of this repository.
    pub fn resource_key(&self, resource: &str) -> String {
        format!("{}/{}:{}", self.owner, self.repo, resource)
    }
}

impl std::fmt::Display for RepoSlug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitRef {
    #[serde(rename = "ref")]
    pub name: String,
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub state: String,
    #[serde(default)]
    pub draft: bool,
    pub html_url: String,
    pub user: Account,
    pub head: GitRef,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: u64,
    pub name: Option<String>,
    pub head_branch: Option<String>,
    pub head_sha: String,
    /// `queued`, `in_progress`, `completed`, ...
    pub status: Option<String>,
    /// Set once `status == "completed"`.
    pub conclusion: Option<String>,
    pub html_url: String,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn is_running(&self) -> bool {
        !matches!(self.status.as_deref(), Some("completed"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WorkflowRuns {
    total_count: u64,
    workflow_runs: Vec<WorkflowRun>,
}

/// Token from the environment, validated against `GET /user`.
///
/// Validation uses its own client and does not go through the gateway: it
/// is neither paced nor counted in [`RequestGateway::rate_limit`]. The quota
/// headers of the last validation are kept in [`Self::rate_limit`].
#[derive(Debug)]
pub struct EnvCredentialProvider {
    client: reqwest::Client,
    api_url: String,
    current_user: Mutex<Option<String>>,
    rate_limit: Mutex<Option<RateLimitInfo>>,
}

impl EnvCredentialProvider {
    pub fn new(config: &GatewayConfig) -> SyncResult<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        default_headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(default_headers)
            .build()
            .map_err(|e| SyncError::Network {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            current_user: Mutex::new(None),
            rate_limit: Mutex::new(None),
        })
    }

    /// Quota reported by the last `GET /user`.
    pub fn rate_limit(&self) -> Option<RateLimitInfo> {
        lock(&self.rate_limit).clone()
    }

    fn read_env() -> SyncResult<Token> {
        for name in TOKEN_ENV_VARS {
            if let Ok(token) = std::env::var(name) {
                let token = token.trim();
                if !token.is_empty() {
                    debug!(source = name, "using token from environment");
                    return Ok(Token::new(token));
                }
            }
        }
        Err(SyncError::Config {
            message: format!("no token found, set {}", TOKEN_ENV_VARS.join(" or ")),
        })
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn get_token(&self) -> SyncResult<Token> {
        Self::read_env()
    }

    async fn refresh(&self) -> SyncResult<Token> {
        Self::read_env()
    }

    async fn validate(&self, token: &Token) -> SyncResult<bool> {
        let response = self
            .client
            .get(format!("{}/user", self.api_url))
            .header(AUTHORIZATION, format!("Bearer {}", token.secret()))
            .send()
            .await?;

        let quota = parse_rate_limit(response.headers());
        if quota.remaining.is_some() {
            debug!(remaining = ?quota.remaining, "quota seen during validation");
        }
        *lock(&self.rate_limit) = Some(quota);

        match response.status().as_u16() {
            200..=299 => {
                let account: Account = response.json().await?;
                debug!(login = %account.login, "token validated");
                *lock(&self.current_user) = Some(account.login);
                Ok(true)
            }
            401 => {
                warn!("token rejected by GET /user");
                *lock(&self.current_user) = None;
                Ok(false)
            }
            status @ 500..=599 => Err(SyncError::Server {
                status,
                message: "token validation failed".into(),
            }),
            status => Err(SyncError::Client {
                status,
                message: "token validation failed".into(),
            }),
        }
    }

    fn current_user(&self) -> Option<String> {
        lock(&self.current_user).clone()
    }
}

/// How long a representation and its `ETag` are kept for revalidation.
pub const VALIDATOR_TTL: Duration = Duration::from_secs(30 * 60);

/// Remembers the last representation and its `ETag` in a [`MemoryCache`],
/// sending `If-None-Match` so unchanged resources cost a 304.
///
/// A 304 renews the stored entry; once it expires the next request goes
/// out unconditionally.
pub struct ConditionalFetch<T> {
    gateway: RequestGateway,
    request: RequestDescriptor,
    validators: MemoryCache<T>,
    retention: Duration,
}

impl<T> ConditionalFetch<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(gateway: RequestGateway, request: RequestDescriptor) -> Self {
        Self {
            gateway,
            request,
            validators: MemoryCache::with_capacity(1),
            retention: VALIDATOR_TTL,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Stored `ETag` for this request, if still retained.
    pub fn fingerprint(&self) -> Option<String> {
        self.validators.fingerprint(&self.request.path)
    }

    pub async fn fetch(&self) -> SyncResult<T> {
        let key = self.request.path.as_str();
        let request = self
            .request
            .clone()
            .with_if_none_match(self.validators.fingerprint(key));

        match self.gateway.call_conditional::<T>(request).await? {
            Conditional::Modified { data, fingerprint } => {
                if fingerprint.is_some() {
                    self.validators
                        .set(key, data.clone(), self.retention, fingerprint);
                } else {
                    self.validators.invalidate(key);
                }
                Ok(data)
            }
            Conditional::NotModified => {
                debug!(operation = %self.request.operation, "not modified");
                let cached = if self.validators.touch(key, self.retention) {
                    self.validators.get(key)
                } else {
                    None
                };
                cached.ok_or_else(|| SyncError::Validation {
                    message: "304 without a cached representation".into(),
                })
            }
        }
    }
}

/// Fetch callback type accepted by the polling engine.
pub type Fetcher<T> = Box<dyn Fn() -> BoxFuture<'static, SyncResult<T>> + Send + Sync>;

/// Open pull requests, most recently updated first.
pub fn open_pull_requests(gateway: RequestGateway, repo: &RepoSlug) -> Fetcher<Vec<PullRequest>> {
    let request = RequestDescriptor::get(
        "list_open_pulls",
        format!(
            "/repos/{}/{}/pulls?state=open&sort=updated&direction=desc&per_page=50",
            repo.owner, repo.repo
        ),
    );
    let fetch = Arc::new(ConditionalFetch::new(gateway, request));
    Box::new(move || {
        let fetch = Arc::clone(&fetch);
        async move { fetch.fetch().await }.boxed()
    })
}

/// Most recent workflow runs.
pub fn workflow_runs(gateway: RequestGateway, repo: &RepoSlug) -> Fetcher<Vec<WorkflowRun>> {
    let request = RequestDescriptor::get(
        "list_workflow_runs",
        format!(
            "/repos/{}/{}/actions/runs?per_page=20",
            repo.owner, repo.repo
        ),
    );
    let fetch = Arc::new(ConditionalFetch::<WorkflowRuns>::new(gateway, request));
    Box::new(move || {
        let fetch = Arc::clone(&fetch);
        async move { fetch.fetch().await.map(|runs| runs.workflow_runs) }.boxed()
    })
}
