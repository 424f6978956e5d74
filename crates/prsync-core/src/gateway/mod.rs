//! Request gateway: the single choke point for outbound API calls.
//!
//! Every call goes through the same pipeline:
//!
//! 1. wait for authentication (queued while the token manager is busy)
//! 2. fail fast while the kill switch is set
//! 3. wait for a pacing slot
//! 4. execute with the current credential
//! 5. map the response class: 401 retries with backoff, primary limits and
//!    secondary limits suspend every caller via the kill switch
//!
//! Public API: no status code knowledge. All status mapping in http.rs.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::{AuthState, TokenLifecycleManager};
use crate::config::{GatewayConfig, PacingConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::kill_switch::KillSwitch;
use crate::report::{ErrorReporter, LastSynced, SyncObserver, TracingReporter};
use crate::util::lock;

mod http;
mod pacing;
mod transport;

pub use http::HttpTransport;
pub(crate) use http::parse_rate_limit;
pub use pacing::RateLimitEstimate;
pub use transport::{
    Method, RateLimitInfo, RequestDescriptor, ResponseClass, Transport, TransportResponse,
};

use pacing::Pacer;

/// Untyped result of a gateway call.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayResponse {
    Data {
        payload: Value,
        fingerprint: Option<String>,
    },
    /// The fingerprint sent in `if_none_match` is still current.
    NotModified,
}

/// Typed result of a conditional call.
#[derive(Debug, Clone, PartialEq)]
pub enum Conditional<T> {
    Modified {
        data: T,
        fingerprint: Option<String>,
    },
    NotModified,
}

/// Gateway handle. Cheap to clone; clones share pacing and suspension state.
#[derive(Clone)]
pub struct RequestGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    config: GatewayConfig,
    transport: Arc<dyn Transport>,
    tokens: TokenLifecycleManager,
    kill_switch: KillSwitch,
    pacer: Pacer,
    reporter: Arc<dyn ErrorReporter>,
    observer: Arc<dyn SyncObserver>,
    suspension: Mutex<Suspension>,
}

/// Bookkeeping for the scheduled auto-clear.
///
/// Each suspension bumps `generation`; a timer only clears the switch if its
/// generation is still current.
#[derive(Debug, Default)]
struct Suspension {
    generation: u64,
    until: Option<(Instant, DateTime<Utc>)>,
}

impl std::fmt::Debug for RequestGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGateway")
            .field("api_url", &self.inner.config.api_url)
            .field("suspended", &self.inner.kill_switch.is_active())
            .field("rate_limit", &self.inner.pacer.estimate())
            .finish()
    }
}

impl RequestGateway {
    pub fn builder(transport: Arc<dyn Transport>, tokens: TokenLifecycleManager) -> GatewayBuilder {
        GatewayBuilder {
            gateway: GatewayConfig::default(),
            pacing: PacingConfig::default(),
            transport,
            tokens,
            kill_switch: None,
            reporter: None,
            observer: None,
        }
    }

    /// Execute a call and decode the payload.
    pub async fn call<T: DeserializeOwned>(&self, request: RequestDescriptor) -> SyncResult<T> {
        match self.call_conditional(request).await? {
            Conditional::Modified { data, .. } => Ok(data),
            Conditional::NotModified => Err(SyncError::Validation {
                message: "unexpected 304 for an unconditional request".into(),
            }),
        }
    }

    /// Execute a call that may carry `if_none_match` and decode the payload.
    pub async fn call_conditional<T: DeserializeOwned>(
        &self,
        request: RequestDescriptor,
    ) -> SyncResult<Conditional<T>> {
        match self.call_raw(request.clone()).await? {
            GatewayResponse::NotModified => Ok(Conditional::NotModified),
            GatewayResponse::Data {
                payload,
                fingerprint,
            } => match serde_json::from_value(payload) {
                Ok(data) => Ok(Conditional::Modified { data, fingerprint }),
                Err(e) => {
                    let err = SyncError::from(e);
                    self.inner.report(&request, &err);
                    Err(err)
                }
            },
        }
    }

    /// Execute a call without decoding.
    pub async fn call_raw(&self, request: RequestDescriptor) -> SyncResult<GatewayResponse> {
        let context = request.clone();
        let result = self.dispatch(request).await;
        if let Err(e) = &result {
            self.inner.report(&context, e);
        }
        result
    }

    async fn dispatch(&self, request: RequestDescriptor) -> SyncResult<GatewayResponse> {
        // Credential recovery may hit the network too.
        self.inner.check_suspended()?;

        if self.inner.tokens.current_state() == AuthState::Error {
            debug!(operation = %request.operation, "authentication in error state, retrying before call");
            self.inner.tokens.get_valid_credential().await?;
        }

        let inner = Arc::clone(&self.inner);
        self.inner
            .tokens
            .run_when_authenticated(move || inner.execute(request))
            .await?
    }

    /// Latest known quota.
    pub fn rate_limit(&self) -> RateLimitEstimate {
        self.inner.pacer.estimate()
    }

    /// Current minimum spacing between calls.
    pub fn pacing_interval(&self) -> Duration {
        self.inner.pacer.interval()
    }

    /// When the current suspension is scheduled to end.
    pub fn suspended_until(&self) -> Option<DateTime<Utc>> {
        if !self.inner.kill_switch.is_active() {
            return None;
        }
        lock(&self.inner.suspension).until.map(|(_, wall)| wall)
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.inner.kill_switch
    }

    pub fn tokens(&self) -> &TokenLifecycleManager {
        &self.inner.tokens
    }
}

impl GatewayInner {
    async fn execute(self: Arc<Self>, request: RequestDescriptor) -> SyncResult<GatewayResponse> {
        let mut attempt: u32 = 0;

        loop {
            self.check_suspended()?;
            let waited = self.pacer.wait().await;
            // The switch may have been set while we slept.
            self.check_suspended()?;

            let token = self.tokens.get_valid_credential().await?;
            debug!(
                operation = %request.operation,
                method = %request.method,
                path = %request.path,
                attempt,
                waited_ms = waited.as_millis() as u64,
                "outbound call"
            );

            let response = self.transport.execute(&request, &token).await?;
            self.pacer.observe(&response.rate_limit);

            match response.class {
                ResponseClass::Success if response.rate_limit.is_exhausted() => {
                    let delay = self.primary_delay(&response.rate_limit);
                    let resume_at = self.suspend(delay, "quota exhausted");
                    return Err(SyncError::RateLimitExceeded {
                        retry_after: delay,
                        resume_at: Some(resume_at),
                    });
                }

                ResponseClass::Success => {
                    self.observer.synced(Utc::now());
                    return Ok(GatewayResponse::Data {
                        payload: response.payload,
                        fingerprint: response.fingerprint,
                    });
                }

                ResponseClass::NotModified => {
                    self.observer.synced(Utc::now());
                    return Ok(GatewayResponse::NotModified);
                }

                ResponseClass::Unauthorized if attempt < self.config.max_auth_retries => {
                    let backoff = self
                        .config
                        .auth_backoff_base
                        .saturating_mul(1u32 << attempt.min(16));
                    attempt += 1;
                    warn!(
                        operation = %request.operation,
                        retry = attempt,
                        max_retries = self.config.max_auth_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "credential rejected, refreshing"
                    );
                    self.tokens.force_refresh().await?;
                    tokio::time::sleep(backoff).await;
                }

                ResponseClass::Unauthorized => {
                    warn!(
                        operation = %request.operation,
                        attempts = attempt + 1,
                        "credential still rejected, forcing re-authentication"
                    );
                    if let Err(e) = self.tokens.reauthenticate().await {
                        warn!(error = %e, "re-authentication failed");
                    }
                    return Err(SyncError::Unauthorized {
                        message: response.message(),
                    });
                }

                ResponseClass::RateLimited => {
                    let delay = self.primary_delay(&response.rate_limit);
                    let resume_at = self.suspend(delay, "primary rate limit");
                    return Err(SyncError::RateLimitExceeded {
                        retry_after: delay,
                        resume_at: Some(resume_at),
                    });
                }

                ResponseClass::SecondaryRateLimited => {
                    let cooldown = response
                        .rate_limit
                        .retry_after
                        .map_or(self.config.secondary_cooldown, |r| {
                            r.max(self.config.secondary_cooldown)
                        });
                    self.suspend(cooldown, "secondary rate limit");
                    return Err(SyncError::SecondaryRateLimit { cooldown });
                }

                ResponseClass::ServerError => {
                    return Err(SyncError::Server {
                        status: response.status,
                        message: response.message(),
                    });
                }

                ResponseClass::ClientError => {
                    return Err(SyncError::Client {
                        status: response.status,
                        message: response.message(),
                    });
                }
            }
        }
    }

    fn check_suspended(&self) -> SyncResult<()> {
        if !self.kill_switch.is_active() {
            return Ok(());
        }
        let until = lock(&self.suspension).until;
        let (retry_after, resume_at) = match until {
            Some((at, wall)) => (at.saturating_duration_since(Instant::now()), Some(wall)),
            None => (Duration::ZERO, None),
        };
        Err(SyncError::RateLimitExceeded {
            retry_after,
            resume_at,
        })
    }

    /// Time until the quota resets, plus the safety buffer.
    fn primary_delay(&self, info: &RateLimitInfo) -> Duration {
        if let Some(reset_at) = info.reset_at {
            let until_reset = (reset_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            return until_reset + self.config.rate_limit_buffer;
        }
        match info.retry_after {
            Some(retry_after) => retry_after + self.config.rate_limit_buffer,
            None => self.config.fallback_cooldown,
        }
    }

    /// Set the kill switch and schedule its clear after `delay`.
    ///
    /// A suspension that already ends later is left alone.
    fn suspend(self: &Arc<Self>, delay: Duration, reason: &'static str) -> DateTime<Utc> {
        let until = Instant::now() + delay;
        let wall = Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());

        let generation = {
            let mut suspension = lock(&self.suspension);
            if let Some((current, current_wall)) = suspension.until {
                if current >= until && self.kill_switch.is_active() {
                    debug!(reason, "longer suspension already scheduled");
                    return current_wall;
                }
            }
            suspension.generation += 1;
            suspension.until = Some((until, wall));
            suspension.generation
        };

        warn!(
            reason,
            delay_secs = delay.as_secs_f64(),
            resume_at = %wall,
            "suspending outbound calls"
        );
        self.kill_switch.set(true);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(until).await;
            inner.resume(generation);
        });

        wall
    }

    fn resume(&self, generation: u64) {
        {
            let mut suspension = lock(&self.suspension);
            if suspension.generation != generation {
                debug!(generation, "superseded auto-clear ignored");
                return;
            }
            suspension.until = None;
        }
        if self.kill_switch.set(false) {
            info!("suspension elapsed");
        }
    }

    fn report(&self, request: &RequestDescriptor, error: &SyncError) {
        if !error.is_reportable() {
            debug!(operation = %request.operation, error = %error, "call failed (not reported)");
            return;
        }

        let mut context = Map::new();
        context.insert("operation".into(), Value::from(request.operation.clone()));
        context.insert("method".into(), Value::from(request.method.as_str()));
        context.insert("path".into(), Value::from(request.path.clone()));
        context.insert("kind".into(), Value::from(error.kind()));
        if let SyncError::Server { status, .. } | SyncError::Client { status, .. } = error {
            context.insert("status".into(), Value::from(*status));
        }
        self.reporter.report(error, &context);
    }
}

/// Builder for [`RequestGateway`].
pub struct GatewayBuilder {
    gateway: GatewayConfig,
    pacing: PacingConfig,
    transport: Arc<dyn Transport>,
    tokens: TokenLifecycleManager,
    kill_switch: Option<KillSwitch>,
    reporter: Option<Arc<dyn ErrorReporter>>,
    observer: Option<Arc<dyn SyncObserver>>,
}

impl GatewayBuilder {
    /// Take gateway and pacing settings from a full config.
    pub fn config(mut self, config: &SyncConfig) -> Self {
        self.gateway = config.gateway.clone();
        self.pacing = config.pacing.clone();
        self
    }

    pub fn gateway_config(mut self, config: GatewayConfig) -> Self {
        self.gateway = config;
        self
    }

    pub fn pacing(mut self, config: PacingConfig) -> Self {
        self.pacing = config;
        self
    }

    pub fn kill_switch(mut self, kill_switch: KillSwitch) -> Self {
        self.kill_switch = Some(kill_switch);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> RequestGateway {
        RequestGateway {
            inner: Arc::new(GatewayInner {
                config: self.gateway,
                transport: self.transport,
                tokens: self.tokens,
                kill_switch: self.kill_switch.unwrap_or_default(),
                pacer: Pacer::new(self.pacing),
                reporter: self
                    .reporter
                    .unwrap_or_else(|| Arc::new(TracingReporter)),
                observer: self
                    .observer
                    .unwrap_or_else(|| Arc::new(LastSynced::new())),
                suspension: Mutex::new(Suspension::default()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CredentialProvider, Token};
    use crate::report::CollectingReporter;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Issues `token-N`, bumping N on every refresh.
    #[derive(Default)]
    struct RotatingProvider {
        refreshes: AtomicUsize,
    }

    #[async_trait]
    impl CredentialProvider for RotatingProvider {
        async fn get_token(&self) -> SyncResult<Token> {
            Ok(Token::new(format!(
                "token-{}",
                self.refreshes.load(Ordering::SeqCst)
            )))
        }

        async fn refresh(&self) -> SyncResult<Token> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Token::new(format!("token-{}", n)))
        }

        async fn validate(&self, _token: &Token) -> SyncResult<bool> {
            Ok(true)
        }
    }

    /// Replays canned responses and records what was sent.
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<SyncResult<TransportResponse>>>,
        seen: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedTransport {
        fn push(&self, response: SyncResult<TransportResponse>) {
            lock(&self.script).push_back(response);
        }

        fn calls(&self) -> usize {
            lock(&self.seen).len()
        }

        fn tokens(&self) -> Vec<String> {
            lock(&self.seen).iter().map(|(_, t)| t.clone()).collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn execute(
            &self,
            request: &RequestDescriptor,
            token: &Token,
        ) -> SyncResult<TransportResponse> {
            lock(&self.seen).push((request.path.clone(), token.secret().to_string()));
            lock(&self.script).pop_front().unwrap_or_else(|| Ok(ok(json!([]), Some(4000))))
        }
    }

    fn response(status: u16, class: ResponseClass, remaining: Option<u32>) -> TransportResponse {
        TransportResponse {
            status,
            class,
            payload: Value::Null,
            fingerprint: None,
            rate_limit: RateLimitInfo {
                remaining,
                ..Default::default()
            },
        }
    }

    fn ok(payload: Value, remaining: Option<u32>) -> TransportResponse {
        TransportResponse {
            payload,
            fingerprint: Some("\"v1\"".into()),
            ..response(200, ResponseClass::Success, remaining)
        }
    }

    struct Harness {
        gateway: RequestGateway,
        transport: Arc<ScriptedTransport>,
        provider: Arc<RotatingProvider>,
        reporter: CollectingReporter,
        synced: LastSynced,
    }

    async fn harness() -> Harness {
        let transport = Arc::new(ScriptedTransport::default());
        let provider = Arc::new(RotatingProvider::default());
        let tokens = TokenLifecycleManager::new(provider.clone());
        tokens.initialize().await.unwrap();

        let reporter = CollectingReporter::new();
        let synced = LastSynced::new();
        let gateway = RequestGateway::builder(transport.clone(), tokens)
            .reporter(Arc::new(reporter.clone()))
            .observer(Arc::new(synced.clone()))
            .build();

        Harness {
            gateway,
            transport,
            provider,
            reporter,
            synced,
        }
    }

    fn pulls() -> RequestDescriptor {
        RequestDescriptor::get("list_pulls", "/repos/o/r/pulls")
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_updates_estimate_and_observer() {
        let h = harness().await;
        h.transport.push(Ok(ok(json!([{"number": 1}]), Some(4321))));

        let response = h.gateway.call_raw(pulls()).await.unwrap();
        assert_eq!(
            response,
            GatewayResponse::Data {
                payload: json!([{"number": 1}]),
                fingerprint: Some("\"v1\"".into()),
            }
        );
        assert_eq!(h.gateway.rate_limit().remaining_quota, Some(4321));
        assert!(h.gateway.rate_limit().last_observed_at.is_some());
        assert!(h.synced.get().is_some());
        assert!(h.reporter.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_typed_call_decodes() {
        #[derive(Debug, serde::Deserialize)]
        struct Pull {
            number: u64,
        }

        let h = harness().await;
        h.transport.push(Ok(ok(json!([{"number": 7}]), None)));
        let got: Vec<Pull> = h.gateway.call(pulls()).await.unwrap();
        assert_eq!(got[0].number, 7);

        // Shape mismatch is reported as a validation failure.
        h.transport.push(Ok(ok(json!({"unexpected": true}), None)));
        let err = h.gateway.call::<Vec<Pull>>(pulls()).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }));
        assert_eq!(h.reporter.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_modified() {
        let h = harness().await;
        h.transport
            .push(Ok(response(304, ResponseClass::NotModified, Some(4000))));

        let request = pulls().with_if_none_match(Some("\"v1\"".into()));
        let result: Conditional<Value> = h.gateway.call_conditional(request).await.unwrap();
        assert_eq!(result, Conditional::NotModified);
        assert!(h.synced.get().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_limit_suspends_until_reset_plus_buffer() {
        let h = harness().await;
        let mut limited = response(403, ResponseClass::RateLimited, Some(0));
        limited.rate_limit.reset_at = Some(Utc::now() + chrono::Duration::seconds(30));
        h.transport.push(Ok(limited));

        let err = h.gateway.call_raw(pulls()).await.unwrap_err();
        assert!(matches!(err, SyncError::RateLimitExceeded { .. }));
        assert!(h.gateway.kill_switch().is_active());
        assert!(h.gateway.suspended_until().is_some());
        assert!(h.reporter.is_empty());

        // Calls fail fast without touching the wire.
        let err = h.gateway.call_raw(pulls()).await.unwrap_err();
        assert!(matches!(err, SyncError::RateLimitExceeded { .. }));
        assert_eq!(h.transport.calls(), 1);

        tokio::time::sleep(Duration::from_millis(33_500)).await;
        assert!(h.gateway.kill_switch().is_active());

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(!h.gateway.kill_switch().is_active());

        h.gateway.call_raw(pulls()).await.unwrap();
        assert_eq!(h.transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_limit_without_reset_uses_fallback() {
        let h = harness().await;
        h.transport
            .push(Ok(response(429, ResponseClass::RateLimited, None)));

        let _ = h.gateway.call_raw(pulls()).await;
        assert!(h.gateway.kill_switch().is_active());

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(h.gateway.kill_switch().is_active());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!h.gateway.kill_switch().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_success_fails_and_suspends() {
        let h = harness().await;
        let mut last = ok(json!({"ok": true}), Some(0));
        last.rate_limit.reset_at = Some(Utc::now() + chrono::Duration::seconds(10));
        h.transport.push(Ok(last));

        let err = h.gateway.call_raw(pulls()).await.unwrap_err();
        match err {
            SyncError::RateLimitExceeded {
                retry_after,
                resume_at,
            } => {
                assert!(retry_after > Duration::from_secs(12));
                assert!(retry_after <= Duration::from_secs(14));
                assert!(resume_at.is_some());
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(h.gateway.kill_switch().is_active());
        assert!(h.synced.get().is_none());
        assert!(h.reporter.is_empty());

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(!h.gateway.kill_switch().is_active());
    }

    /// Fails validation with a 403, leaving the manager in `Error`.
    #[derive(Default)]
    struct ThrottledProvider {
        round_trips: AtomicUsize,
    }

    #[async_trait]
    impl CredentialProvider for ThrottledProvider {
        async fn get_token(&self) -> SyncResult<Token> {
            Ok(Token::new("token"))
        }

        async fn refresh(&self) -> SyncResult<Token> {
            Ok(Token::new("token"))
        }

        async fn validate(&self, _token: &Token) -> SyncResult<bool> {
            self.round_trips.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::Client {
                status: 403,
                message: "API rate limit exceeded".into(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspended_gateway_skips_credential_recovery() {
        let transport = Arc::new(ScriptedTransport::default());
        let provider = Arc::new(ThrottledProvider::default());
        let tokens = TokenLifecycleManager::new(provider.clone());
        assert!(tokens.initialize().await.is_err());
        assert_eq!(tokens.current_state(), AuthState::Error);
        let before = provider.round_trips.load(Ordering::SeqCst);

        let gateway = RequestGateway::builder(transport.clone(), tokens).build();
        gateway.kill_switch().set(true);

        let err = gateway.call_raw(pulls()).await.unwrap_err();
        assert!(matches!(err, SyncError::RateLimitExceeded { .. }));
        assert_eq!(provider.round_trips.load(Ordering::SeqCst), before);
        assert_eq!(transport.calls(), 0);
        assert_eq!(gateway.tokens().current_state(), AuthState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_secondary_limit_uses_fixed_cooldown() {
        let h = harness().await;
        h.transport.push(Ok(response(
            403,
            ResponseClass::SecondaryRateLimited,
            Some(4000),
        )));

        let err = h.gateway.call_raw(pulls()).await.unwrap_err();
        match err {
            SyncError::SecondaryRateLimit { cooldown } => {
                assert_eq!(cooldown, Duration::from_secs(120))
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(h.reporter.is_empty());

        tokio::time::sleep(Duration::from_secs(119)).await;
        assert!(h.gateway.kill_switch().is_active());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!h.gateway.kill_switch().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_auto_clear_is_ignored() {
        let h = harness().await;
        h.transport
            .push(Ok(response(429, ResponseClass::RateLimited, None)));
        let _ = h.gateway.call_raw(pulls()).await;

        // Manual clear, then a longer suspension.
        h.gateway.kill_switch().set(false);
        h.transport.push(Ok(response(
            403,
            ResponseClass::SecondaryRateLimited,
            None,
        )));
        let _ = h.gateway.call_raw(pulls()).await;

        // The first timer (60s) must not clear the second suspension (120s).
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert!(h.gateway.kill_switch().is_active());
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(!h.gateway.kill_switch().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_refreshes_and_retries() {
        let h = harness().await;
        h.transport
            .push(Ok(response(401, ResponseClass::Unauthorized, None)));
        h.transport
            .push(Ok(response(401, ResponseClass::Unauthorized, None)));

        let start = Instant::now();
        h.gateway.call_raw(pulls()).await.unwrap();

        assert_eq!(h.provider.refreshes.load(Ordering::SeqCst), 2);
        assert_eq!(h.transport.tokens(), vec!["token-0", "token-1", "token-2"]);
        // 500ms + 1s backoff; pacing slots fall inside the backoff.
        assert!(start.elapsed() >= Duration::from_millis(1_500));
        assert!(h.reporter.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_unauthorized_reauthenticates_and_fails() {
        let h = harness().await;
        for _ in 0..3 {
            h.transport
                .push(Ok(response(401, ResponseClass::Unauthorized, None)));
        }

        let err = h.gateway.call_raw(pulls()).await.unwrap_err();
        assert!(matches!(err, SyncError::Unauthorized { .. }));
        assert_eq!(h.transport.calls(), 3);
        assert_eq!(h.reporter.len(), 1);
        // Re-authentication ran and succeeded.
        assert_eq!(h.gateway.tokens().current_state(), AuthState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_errors_are_not_reported() {
        let h = harness().await;
        h.transport.push(Err(SyncError::Network {
            message: "connection reset".into(),
        }));

        let err = h.gateway.call_raw(pulls()).await.unwrap_err();
        assert!(err.is_network());
        assert!(h.reporter.is_empty());
        assert!(!h.gateway.kill_switch().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_are_reported_with_context() {
        let h = harness().await;
        let mut failed = response(502, ResponseClass::ServerError, None);
        failed.payload = json!({"message": "Bad Gateway"});
        h.transport.push(Ok(failed));

        let err = h.gateway.call_raw(pulls()).await.unwrap_err();
        assert!(matches!(err, SyncError::Server { status: 502, .. }));

        let reports = h.reporter.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].1["operation"], "list_pulls");
        assert_eq!(reports[0].1["status"], 502);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_are_paced() {
        let h = harness().await;
        let start = Instant::now();
        for _ in 0..3 {
            h.gateway.call_raw(pulls()).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_signed_out_calls_are_rejected_locally() {
        let h = harness().await;
        h.gateway.tokens().sign_out();

        let err = h.gateway.call_raw(pulls()).await.unwrap_err();
        assert!(matches!(err, SyncError::Unauthenticated { .. }));
        assert_eq!(h.transport.calls(), 0);
        assert!(h.reporter.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_wait_for_initial_authentication() {
        let transport = Arc::new(ScriptedTransport::default());
        let tokens = TokenLifecycleManager::new(Arc::new(RotatingProvider::default()));
        let gateway = RequestGateway::builder(transport.clone(), tokens.clone()).build();

        let pending = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.call_raw(pulls()).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(tokens.queued_calls(), 1);
        assert_eq!(transport.calls(), 0);

        tokens.initialize().await.unwrap();
        pending.await.unwrap().unwrap();
        assert_eq!(transport.calls(), 1);
    }
}
