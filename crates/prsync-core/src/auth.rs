//! Token lifecycle management.
//!
//! [`TokenLifecycleManager`] is the single source of truth for "are we allowed
//! to call the API right now". It owns the authentication state machine,
//! caches the current credential, performs single-flight refreshes, and
//! holds calls that arrive while authentication is still in progress.
//!
//! State machine:
//!
//! ```text
//! Initializing    -> Authenticating | Unauthenticated | Error
//! Authenticating  -> Authenticated  | Unauthenticated | Error
//! Authenticated   -> Unauthenticated | Error
//! Unauthenticated -> Authenticating | Error
//! Error           -> Initializing | Authenticating | Unauthenticated
//! ```
//!
//! Illegal transitions are logged and ignored.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::error::{SyncError, SyncResult};
use crate::util::lock;

/// Tokens are treated as expired this long before their real expiry.
const EXPIRY_SKEW_SECS: i64 = 60;

/// Authentication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AuthState {
    Initializing,
    Authenticating,
    Authenticated,
    Unauthenticated,
    Error,
}

impl AuthState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: AuthState) -> bool {
        use AuthState::*;
        matches!(
            (self, next),
            (Initializing, Authenticating | Unauthenticated | Error)
                | (Authenticating, Authenticated | Unauthenticated | Error)
                | (Authenticated, Unauthenticated | Error)
                | (Unauthenticated, Authenticating | Error)
                | (Error, Initializing | Authenticating | Unauthenticated)
        )
    }

    /// Calls arriving in this state wait for authentication to finish.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Initializing | Self::Authenticating)
    }
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Unauthenticated => "unauthenticated",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Bearer credential. The secret never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    secret: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Token {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Expired, or close enough to expiry that it should not be used.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => at <= Utc::now() + chrono::Duration::seconds(EXPIRY_SKEW_SECS),
            None => false,
        }
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Context carried alongside the state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuthContext {
    pub current_user: Option<String>,
    pub last_error: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Source of bearer credentials.
///
/// The manager treats the provider as opaque: it never inspects how tokens
/// are obtained.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Initial credential acquisition.
    async fn get_token(&self) -> SyncResult<Token>;

    /// Obtain a fresh credential.
    async fn refresh(&self) -> SyncResult<Token>;

    /// Whether the remote side still accepts `token`.
    async fn validate(&self, token: &Token) -> SyncResult<bool>;

    /// Identity behind the last validated credential, if known.
    fn current_user(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acquire {
    /// `get_token()` first; used at start-up and for full re-authentication.
    Initial,
    /// `refresh()`.
    Refresh,
}

type RefreshFuture = Shared<BoxFuture<'static, SyncResult<Token>>>;

enum Next {
    Ready(Token),
    Join(RefreshFuture),
    Start(Acquire),
}

type QueuedCall = Box<dyn FnOnce(SyncResult<()>) -> BoxFuture<'static, ()> + Send>;

/// How `run_when_authenticated` admits a call.
enum Admission<F, R> {
    Now(F),
    Queued(oneshot::Receiver<SyncResult<R>>),
}

struct SharedState {
    state: AuthState,
    token: Option<Token>,
    context: AuthContext,
    refresh: Option<RefreshFuture>,
    queue: VecDeque<QueuedCall>,
}

struct Inner {
    provider: Arc<dyn CredentialProvider>,
    shared: Mutex<SharedState>,
    states: Channel<AuthState>,
}

/// Calls released by a transition, dispatched after the lock is dropped.
enum Release {
    Replay(Vec<QueuedCall>),
    Reject(Vec<QueuedCall>, AuthState),
}

/// Owner of the authentication state and the current credential.
#[derive(Clone)]
pub struct TokenLifecycleManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TokenLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = lock(&self.inner.shared);
        f.debug_struct("TokenLifecycleManager")
            .field("state", &shared.state)
            .field("queued", &shared.queue.len())
            .field("refreshing", &shared.refresh.is_some())
            .finish()
    }
}

impl TokenLifecycleManager {
    pub fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                shared: Mutex::new(SharedState {
                    state: AuthState::Initializing,
                    token: None,
                    context: AuthContext::default(),
                    refresh: None,
                    queue: VecDeque::new(),
                }),
                states: Channel::create("auth_state", AuthState::Initializing),
            }),
        }
    }

    /// Start-up sequence: `Initializing -> Authenticating -> Authenticated | Error`.
    pub async fn initialize(&self) -> SyncResult<Token> {
        self.acquire(Acquire::Initial).await
    }

    pub fn current_state(&self) -> AuthState {
        lock(&self.inner.shared).state
    }

    pub fn context(&self) -> AuthContext {
        lock(&self.inner.shared).context.clone()
    }

    /// Watch state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<AuthState> {
        self.inner.states.subscribe()
    }

    /// Number of calls waiting for authentication.
    pub fn queued_calls(&self) -> usize {
        lock(&self.inner.shared).queue.len()
    }

    /// Apply a transition. Returns `false` (and changes nothing) if illegal.
    pub fn transition(&self, next: AuthState) -> bool {
        self.inner.transition(next)
    }

    /// A credential that can be used right now.
    ///
    /// Joins an in-flight refresh if there is one; otherwise returns the cached
    /// credential while authenticated, or starts a refresh.
    pub async fn get_valid_credential(&self) -> SyncResult<Token> {
        let next = {
            let mut shared = lock(&self.inner.shared);
            match shared.refresh.clone() {
                Some(pending) => Next::Join(pending),
                None => match shared.token.clone() {
                    Some(token)
                        if shared.state == AuthState::Authenticated && !token.is_expired() =>
                    {
                        shared.context.last_activity = Some(Utc::now());
                        Next::Ready(token)
                    }
                    Some(_) => Next::Start(Acquire::Refresh),
                    None => Next::Start(Acquire::Initial),
                },
            }
        };

        match next {
            Next::Ready(token) => Ok(token),
            Next::Join(pending) => pending.await,
            Next::Start(kind) => self.acquire(kind).await,
        }
    }

    /// Refresh the credential now (single-flight).
    pub async fn force_refresh(&self) -> SyncResult<Token> {
        self.acquire(Acquire::Refresh).await
    }

    /// Drop the credential and sign in again from scratch.
    ///
    /// Calls queued at this point are rejected.
    pub async fn reauthenticate(&self) -> SyncResult<Token> {
        info!("forcing full re-authentication");
        lock(&self.inner.shared).token = None;
        self.inner.transition(AuthState::Unauthenticated);
        self.acquire(Acquire::Initial).await
    }

    /// Sign out: drop the credential and reject queued calls.
    pub fn sign_out(&self) {
        {
            let mut shared = lock(&self.inner.shared);
            shared.token = None;
            shared.context.current_user = None;
        }
        self.inner.transition(AuthState::Unauthenticated);
    }

    /// Run `f` once authenticated.
    ///
    /// Runs immediately when `Authenticated`; waits in a FIFO queue while
    /// `Initializing`/`Authenticating`; fails with
    /// [`SyncError::Unauthenticated`] otherwise. Queued calls are replayed in
    /// arrival order, one after another.
    pub async fn run_when_authenticated<F, Fut, R>(&self, f: F) -> SyncResult<R>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let admission = {
            let mut shared = lock(&self.inner.shared);
            match shared.state {
                AuthState::Authenticated => Admission::Now(f),
                state if state.is_pending() => {
                    let (tx, rx) = oneshot::channel();
                    shared.queue.push_back(Box::new(move |ready: SyncResult<()>| {
                        async move {
                            let outcome = match ready {
                                Ok(()) => Ok(f().await),
                                Err(e) => Err(e),
                            };
                            let _ = tx.send(outcome);
                        }
                        .boxed()
                    }));
                    debug!(queued = shared.queue.len(), state = %state, "call queued until authenticated");
                    Admission::Queued(rx)
                }
                state => return Err(SyncError::Unauthenticated { state }),
            }
        };

        match admission {
            Admission::Now(f) => Ok(f().await),
            Admission::Queued(rx) => rx.await.map_err(|_| SyncError::Closed {
                message: "authentication queue dropped".into(),
            })?,
        }
    }

    async fn acquire(&self, kind: Acquire) -> SyncResult<Token> {
        let pending = {
            let mut shared = lock(&self.inner.shared);
            match &shared.refresh {
                Some(pending) => pending.clone(),
                None => {
                    let inner = self.inner.clone();
                    let fut = async move { inner.perform(kind).await }.boxed().shared();
                    shared.refresh = Some(fut.clone());
                    fut
                }
            }
        };
        pending.await
    }
}

impl Inner {
    fn transition(&self, next: AuthState) -> bool {
        let release = {
            let mut shared = lock(&self.shared);
            match self.transition_locked(&mut shared, next) {
                Some(release) => release,
                None => return false,
            }
        };
        dispatch(release);
        true
    }

    fn transition_locked(&self, shared: &mut SharedState, next: AuthState) -> Option<Release> {
        let from = shared.state;
        if !from.can_transition_to(next) {
            warn!(from = %from, to = %next, "ignoring illegal auth state transition");
            return None;
        }

        shared.state = next;
        shared.context.last_activity = Some(Utc::now());
        let _ = self.states.publish(next);
        debug!(from = %from, to = %next, "auth state transition");

        let queued: Vec<QueuedCall> = shared.queue.drain(..).collect();
        Some(match next {
            AuthState::Authenticated => Release::Replay(queued),
            AuthState::Unauthenticated | AuthState::Error => Release::Reject(queued, next),
            _ => {
                // Still pending: keep waiting.
                shared.queue.extend(queued);
                Release::Replay(Vec::new())
            }
        })
    }

    async fn perform(self: Arc<Self>, kind: Acquire) -> SyncResult<Token> {
        let from = self.current_state();
        if from != AuthState::Authenticated && from != AuthState::Authenticating {
            self.transition(AuthState::Authenticating);
        }

        debug!(kind = ?kind, "acquiring credential");
        let result = self.obtain_valid(kind).await;

        let release = {
            let mut shared = lock(&self.shared);
            shared.refresh = None;
            match &result {
                Ok(token) => {
                    shared.token = Some(token.clone());
                    shared.context.last_error = None;
                    shared.context.current_user = self.provider.current_user();
                    if shared.state != AuthState::Authenticated {
                        self.transition_locked(&mut shared, AuthState::Authenticated)
                    } else {
                        None
                    }
                }
                Err(e) => {
                    shared.context.last_error = Some(e.to_string());
                    let keep = shared.state == AuthState::Authenticated
                        && e.is_network()
                        && shared.token.is_some();
                    if keep {
                        warn!(error = %e, "credential refresh failed on network, keeping current token");
                        None
                    } else {
                        warn!(error = %e, "credential acquisition failed");
                        shared.token = None;
                        self.transition_locked(&mut shared, AuthState::Error)
                    }
                }
            }
        };

        if let Some(release) = release {
            dispatch(release);
        }
        result
    }

    /// Acquire and validate, with one forced re-authentication if the
    /// provider rejects the first credential.
    async fn obtain_valid(&self, kind: Acquire) -> SyncResult<Token> {
        let token = match kind {
            Acquire::Initial => self.provider.get_token().await?,
            Acquire::Refresh => self.provider.refresh().await?,
        };
        if self.provider.validate(&token).await? {
            return Ok(token);
        }

        warn!("credential rejected by provider, forcing one re-authentication");
        let token = self.provider.refresh().await?;
        if self.provider.validate(&token).await? {
            Ok(token)
        } else {
            Err(SyncError::Unauthorized {
                message: "credential rejected after re-authentication".into(),
            })
        }
    }

    fn current_state(&self) -> AuthState {
        lock(&self.shared).state
    }
}

fn dispatch(release: Release) {
    match release {
        Release::Replay(calls) if calls.is_empty() => {}
        Release::Replay(calls) => {
            debug!(count = calls.len(), "replaying queued calls");
            tokio::spawn(async move {
                for call in calls {
                    call(Ok(())).await;
                }
            });
        }
        Release::Reject(calls, _) if calls.is_empty() => {}
        Release::Reject(calls, state) => {
            debug!(count = calls.len(), state = %state, "rejecting queued calls");
            tokio::spawn(async move {
                for call in calls {
                    call(Err(SyncError::Unauthenticated { state })).await;
                }
            });
        }
    }
}

/// Fixed credential, for tests and for tokens that never rotate.
#[derive(Debug, Clone)]
pub struct StaticCredentialProvider {
    token: String,
}

impl StaticCredentialProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn get_token(&self) -> SyncResult<Token> {
        Ok(Token::new(self.token.clone()))
    }

    async fn refresh(&self) -> SyncResult<Token> {
        Ok(Token::new(self.token.clone()))
    }

    async fn validate(&self, token: &Token) -> SyncResult<bool> {
        Ok(!token.secret().is_empty())
    }
}
