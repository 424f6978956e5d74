//! Polling engine: one self-scheduling task per subscribed key.
//!
//! Each cycle:
//!
//! 1. kill switch set: do nothing ([`CycleOutcome::Suspended`])
//! 2. fresh cache entry: publish it, no network call
//! 3. fetch for the key already in flight: skip
//! 4. run the fetch callback, cache and publish the result
//! 5. on failure republish the last-known-good value as stale and retry after
//!    a random delay
//!
//! The task pauses while the kill switch is set and runs one immediate cycle
//! when it clears. A manual refresh bypasses cache freshness and restarts the
//! period.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{MemoryCache, SweeperHandle};
use crate::channel::Channel;
use crate::config::PollingConfig;
use crate::error::{SyncError, SyncResult};
use crate::kill_switch::{KillSwitch, RefreshTrigger};
use crate::snapshot::{PersistedSnapshot, SnapshotStore};
use crate::util::lock;

mod state;
mod subscription;

pub use state::{CycleOutcome, PollState, Resource};
pub use subscription::Subscription;

/// Resource fetch callback. Must route network access through the gateway.
pub type FetchFn<T> = Arc<dyn Fn() -> BoxFuture<'static, SyncResult<T>> + Send + Sync>;

const SNAPSHOT_REASON: &str = "restored from snapshot";

/// Engine handle. Cheap to clone.
pub struct PollingEngine<T: Resource> {
    inner: Arc<EngineInner<T>>,
}

impl<T: Resource> Clone for PollingEngine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct EngineInner<T: Resource> {
    config: PollingConfig,
    cache: Arc<MemoryCache<T>>,
    kill_switch: KillSwitch,
    trigger: RefreshTrigger,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    subscriptions: Mutex<HashMap<String, KeyState<T>>>,
    in_flight: Mutex<HashSet<String>>,
    sweeper: Mutex<Option<SweeperHandle>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Shared by every subscriber of one key.
struct KeyState<T: Resource> {
    id: u64,
    fetch: FetchFn<T>,
    channel: Arc<Channel<PollState<T>>>,
    refs: usize,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl<T: Resource> PollingEngine<T> {
    pub fn builder(kill_switch: KillSwitch, trigger: RefreshTrigger) -> PollingEngineBuilder<T> {
        PollingEngineBuilder {
            config: PollingConfig::default(),
            cache: None,
            kill_switch,
            trigger,
            snapshots: None,
        }
    }

    /// Start polling `key`, or join the existing subscription for it.
    ///
    /// When the key is already polled the existing callback is kept and
    /// `fetch` is dropped.
    pub fn subscribe<F, Fut>(&self, key: impl Into<String>, fetch: F) -> SyncResult<Subscription<T>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<T>> + Send + 'static,
    {
        let key = key.into();
        let mut subscriptions = lock(&self.inner.subscriptions);
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed {
                message: "polling engine is shut down".into(),
            });
        }

        if let Some(state) = subscriptions.get_mut(&key) {
            state.refs += 1;
            debug!(key = %key, subscribers = state.refs, "joined existing subscription");
            return Ok(Subscription::new(
                key,
                state.id,
                state.channel.subscribe(),
                Arc::downgrade(&self.inner),
            ));
        }

        self.ensure_sweeper();

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let fetch: FetchFn<T> = Arc::new(move || fetch().boxed());
        let channel = Arc::new(Channel::create("poll_state", PollState::Loading));
        let rx = channel.subscribe();
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_key(Arc::clone(&self.inner), key.clone(), stop_rx));

        subscriptions.insert(
            key.clone(),
            KeyState {
                id,
                fetch,
                channel,
                refs: 1,
                stop,
                task,
            },
        );
        debug!(key = %key, "polling started");

        Ok(Subscription::new(key, id, rx, Arc::downgrade(&self.inner)))
    }

    /// Run one check-and-fetch cycle for a subscribed key.
    ///
    /// `force` bypasses cache freshness.
    pub async fn poll_once(&self, key: &str, force: bool) -> CycleOutcome {
        self.inner.cycle(key, force).await
    }

    /// Force an immediate resync of every active key.
    pub fn refresh_all(&self) {
        self.inner.trigger.fire();
    }

    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.inner.subscriptions).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of subscribers for `key`.
    pub fn subscriber_count(&self, key: &str) -> usize {
        lock(&self.inner.subscriptions)
            .get(key)
            .map(|state| state.refs)
            .unwrap_or(0)
    }

    pub fn cache(&self) -> &Arc<MemoryCache<T>> {
        &self.inner.cache
    }

    /// Stop every task. In-flight fetches are allowed to finish.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let states: Vec<KeyState<T>> = lock(&self.inner.subscriptions)
            .drain()
            .map(|(_, state)| state)
            .collect();

        for state in &states {
            let _ = state.stop.send(true);
            state.channel.close();
        }
        let count = states.len();
        for state in states {
            let _ = state.task.await;
        }
        lock(&self.inner.sweeper).take();
        info!(keys = count, "polling engine stopped");
    }

    fn ensure_sweeper(&self) {
        let mut sweeper = lock(&self.inner.sweeper);
        if sweeper.is_none() {
            *sweeper = Some(self.inner.cache.spawn_sweeper());
        }
    }
}

impl<T: Resource> std::fmt::Debug for PollingEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingEngine")
            .field("keys", &self.active_keys())
            .field("interval", &self.inner.config.interval)
            .finish()
    }
}

impl<T: Resource> EngineInner<T> {
    async fn cycle(&self, key: &str, force: bool) -> CycleOutcome {
        if self.kill_switch.is_active() {
            debug!(key, "kill switch set, cycle suspended");
            return CycleOutcome::Suspended;
        }

        let Some((fetch, channel)) = self.lookup(key) else {
            debug!(key, "no subscription for key");
            return CycleOutcome::Skipped;
        };

        if !force {
            if let Some(entry) = self.cache.get_entry(key) {
                let current = channel.current();
                if !(current.is_fresh() && current.data() == Some(&entry.data)) {
                    let _ = channel.publish(PollState::Fresh {
                        data: entry.data,
                        fetched_at: wall_time(entry.last_fetch_at),
                    });
                }
                debug!(key, "cache fresh, no fetch");
                return CycleOutcome::CacheHit;
            }
        }

        if !lock(&self.in_flight).insert(key.to_string()) {
            debug!(key, "fetch already in flight, skipping cycle");
            return CycleOutcome::Skipped;
        }
        let _guard = InFlight {
            set: &self.in_flight,
            key,
        };

        debug!(key, force, "fetching");
        match fetch().await {
            Ok(data) => {
                let fetched_at = Utc::now();
                self.cache
                    .set(key, data.clone(), self.config.cache_ttl, None);
                let _ = channel.publish(PollState::Fresh {
                    data: data.clone(),
                    fetched_at,
                });
                self.persist(key, &data, fetched_at).await;
                CycleOutcome::Fetched
            }
            Err(e) => {
                if e.is_network() || e.is_rate_limit() {
                    debug!(key, error = %e, "fetch failed");
                } else {
                    warn!(key, error = %e, "fetch failed");
                }

                let degraded = match channel.current() {
                    PollState::Fresh { data, fetched_at }
                    | PollState::Stale {
                        data, fetched_at, ..
                    } => Some(PollState::Stale {
                        data,
                        fetched_at,
                        reason: e.to_string(),
                    }),
                    PollState::Loading => None,
                };
                if let Some(state) = degraded {
                    let _ = channel.publish(state);
                }
                CycleOutcome::Failed
            }
        }
    }

    fn lookup(&self, key: &str) -> Option<(FetchFn<T>, Arc<Channel<PollState<T>>>)> {
        lock(&self.subscriptions)
            .get(key)
            .map(|state| (Arc::clone(&state.fetch), Arc::clone(&state.channel)))
    }

    /// Random delay in `[0, retry_jitter_max)` so failing keys spread out.
    fn retry_delay(&self) -> Duration {
        let ceiling = self.config.retry_jitter_max.as_millis() as u64;
        if ceiling == 0 {
            return self.config.interval;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..ceiling))
    }

    /// Publish the persisted snapshot while the key has nothing better.
    async fn restore_snapshot(&self, key: &str) {
        let Some(store) = &self.snapshots else {
            return;
        };
        if self.cache.has(key) {
            return;
        }

        let snapshot = match store.load(key).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return,
            Err(e) => {
                warn!(key, error = %e, "failed to load snapshot");
                return;
            }
        };
        let data: T = match serde_json::from_value(snapshot.data) {
            Ok(data) => data,
            Err(e) => {
                warn!(key, error = %e, "snapshot does not match resource type");
                return;
            }
        };

        if let Some((_, channel)) = self.lookup(key) {
            if channel.current().is_loading() {
                debug!(key, last_updated = %snapshot.last_updated, "restored snapshot");
                let _ = channel.publish(PollState::Stale {
                    data,
                    fetched_at: snapshot.last_updated,
                    reason: SNAPSHOT_REASON.into(),
                });
            }
        }
    }

    async fn persist(&self, key: &str, data: &T, fetched_at: DateTime<Utc>) {
        let Some(store) = &self.snapshots else {
            return;
        };
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(e) => {
                warn!(key, error = %e, "failed to serialize snapshot");
                return;
            }
        };
        let snapshot = PersistedSnapshot {
            last_updated: fetched_at,
            data,
        };
        if let Err(e) = store.save(key, &snapshot).await {
            warn!(key, error = %e, "failed to save snapshot");
        }
    }

    /// Drop one subscriber; the last one stops the task.
    pub(crate) fn release(&self, key: &str, id: u64) {
        let removed = {
            let mut subscriptions = lock(&self.subscriptions);
            match subscriptions.get_mut(key) {
                Some(state) if state.id == id => {
                    state.refs = state.refs.saturating_sub(1);
                    if state.refs == 0 {
                        subscriptions.remove(key)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some(state) = removed {
            let _ = state.stop.send(true);
            state.channel.close();
            debug!(key, "last subscriber left, polling stopped");
        }
    }
}

/// Removes the key from the in-flight set when the fetch ends, however it ends.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: &'a str,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.set).remove(self.key);
    }
}

/// Per-key scheduling loop. Exits between cycles, never mid-fetch.
async fn run_key<T: Resource>(
    inner: Arc<EngineInner<T>>,
    key: String,
    mut stop: watch::Receiver<bool>,
) {
    let mut kill = inner.kill_switch.subscribe();
    let mut trigger = inner.trigger.subscribe();
    let mut kill_open = true;
    let mut trigger_open = true;
    let mut paused = *kill.borrow_and_update();
    trigger.borrow_and_update();

    inner.restore_snapshot(&key).await;

    let mut next_at = Instant::now();
    loop {
        let force = tokio::select! {
            biased;

            _ = stop.changed() => break,

            changed = kill.changed(), if kill_open => {
                if changed.is_err() {
                    kill_open = false;
                    continue;
                }
                let active = *kill.borrow_and_update();
                if active {
                    if !paused {
                        debug!(key = %key, "polling paused");
                    }
                    paused = true;
                    continue;
                }
                if !paused {
                    continue;
                }
                paused = false;
                debug!(key = %key, "polling resumed");
                false
            }

            changed = trigger.changed(), if trigger_open => {
                if changed.is_err() {
                    trigger_open = false;
                    continue;
                }
                trigger.borrow_and_update();
                if paused {
                    debug!(key = %key, "manual refresh ignored while suspended");
                    continue;
                }
                true
            }

            _ = tokio::time::sleep_until(next_at), if !paused => false,
        };

        let outcome = inner.cycle(&key, force).await;
        next_at = Instant::now()
            + match outcome {
                CycleOutcome::Failed => inner.retry_delay(),
                _ => inner.config.interval,
            };

        if outcome == CycleOutcome::Suspended {
            if *kill.borrow() {
                paused = true;
            } else {
                next_at = Instant::now();
            }
        }
    }

    debug!(key = %key, "polling task exited");
}

/// Wall-clock time of a monotonic instant in the past.
fn wall_time(at: Instant) -> DateTime<Utc> {
    let age = Instant::now().saturating_duration_since(at);
    Utc::now() - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::zero())
}

/// Builder for [`PollingEngine`].
pub struct PollingEngineBuilder<T: Resource> {
    config: PollingConfig,
    cache: Option<Arc<MemoryCache<T>>>,
    kill_switch: KillSwitch,
    trigger: RefreshTrigger,
    snapshots: Option<Arc<dyn SnapshotStore>>,
}

impl<T: Resource> PollingEngineBuilder<T> {
    pub fn config(mut self, config: PollingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cache(mut self, cache: Arc<MemoryCache<T>>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn snapshots(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn build(self) -> PollingEngine<T> {
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCache::with_capacity(500)));
        PollingEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                cache,
                kill_switch: self.kill_switch,
                trigger: self.trigger,
                snapshots: self.snapshots,
                subscriptions: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
                sweeper: Mutex::new(None),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::MemorySnapshotStore;
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        engine: PollingEngine<u32>,
        kill_switch: KillSwitch,
    }

    fn fixture() -> Fixture {
        let kill_switch = KillSwitch::new();
        let engine = PollingEngine::builder(kill_switch.clone(), RefreshTrigger::new()).build();
        Fixture {
            engine,
            kill_switch,
        }
    }

    /// Fetch callback returning an incrementing counter.
    fn counting(calls: Arc<AtomicUsize>) -> impl Fn() -> BoxFuture<'static, SyncResult<u32>> + Send + Sync {
        move || {
            let calls = Arc::clone(&calls);
            async move { Ok(calls.fetch_add(1, Ordering::SeqCst) as u32 + 1) }.boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_subscribers_share_one_fetch() {
        let f = fixture();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = f.engine.subscribe("org/repo", counting(calls.clone())).unwrap();
        let second = f.engine.subscribe("org/repo", counting(calls.clone())).unwrap();
        assert_eq!(f.engine.subscriber_count("org/repo"), 2);

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(first.current_value().is_fresh());
        assert_eq!(second.current_value().data(), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_cycles() {
        let f = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let _sub = f.engine.subscribe("k", counting(calls.clone())).unwrap();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Cache TTL (45s) is shorter than the period, so every tick fetches.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_once_uses_fresh_cache() {
        let f = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let _sub = f.engine.subscribe("k", counting(calls.clone())).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(f.engine.poll_once("k", false).await, CycleOutcome::CacheHit);
        assert_eq!(f.engine.poll_once("k", true).await, CycleOutcome::Fetched);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(f.engine.poll_once("unknown", true).await, CycleOutcome::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_per_key() {
        let f = fixture();
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));

        let fetch = {
            let running = running.clone();
            let max_running = max_running.clone();
            move || {
                let running = running.clone();
                let max_running = max_running.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_running.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(1u32)
                }
            }
        };
        let _sub = f.engine.subscribe("k", fetch).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Initial cycle is still fetching.
        let (a, b) = tokio::join!(f.engine.poll_once("k", true), f.engine.poll_once("k", true));
        assert_eq!(a, CycleOutcome::Skipped);
        assert_eq!(b, CycleOutcome::Skipped);
        assert_eq!(max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_last_known_good() {
        let f = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = {
            let calls = calls.clone();
            move || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Ok(7u32)
                    } else {
                        Err(SyncError::Network {
                            message: "connection reset".into(),
                        })
                    }
                }
            }
        };
        let sub = f.engine.subscribe("k", fetch).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sub.current_value().is_fresh());

        assert_eq!(f.engine.poll_once("k", true).await, CycleOutcome::Failed);
        match sub.current_value() {
            PollState::Stale { data, reason, .. } => {
                assert_eq!(data, 7);
                assert!(reason.contains("connection reset"));
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_without_value_stays_loading() {
        let f = fixture();
        let sub = f
            .engine
            .subscribe("k", || async {
                Err::<u32, _>(SyncError::Server {
                    status: 500,
                    message: "boom".into(),
                })
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sub.current_value().is_loading());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fetch_retries_with_jitter() {
        let f = fixture();
        let times = Arc::new(Mutex::new(Vec::new()));
        let fetch = {
            let times = times.clone();
            move || {
                lock(&times).push(Instant::now());
                async {
                    Err::<u32, _>(SyncError::Network {
                        message: "offline".into(),
                    })
                }
            }
        };
        let _sub = f.engine.subscribe("k", fetch).unwrap();

        while lock(&times).len() < 8 {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        let times = lock(&times).clone();
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps.iter().all(|gap| *gap < Duration::from_secs(10)));
        assert!(gaps.iter().any(|gap| *gap != gaps[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_switch_pauses_and_resumes_once() {
        let f = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let _sub = f.engine.subscribe("k", counting(calls.clone())).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        f.kill_switch.set(true);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.engine.poll_once("k", true).await, CycleOutcome::Suspended);

        f.kill_switch.set(false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Back on the regular period.
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_refresh_bypasses_cache_and_restarts_period() {
        let f = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let _sub = f.engine.subscribe("k", counting(calls.clone())).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        f.engine.refresh_all();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Next tick is 60s after the manual refresh, not after the first fetch.
        tokio::time::sleep(Duration::from_secs(55)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_is_idempotent_and_stops_polling() {
        let f = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut first = f.engine.subscribe("k", counting(calls.clone())).unwrap();
        let second = f.engine.subscribe("k", counting(calls.clone())).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        first.unsubscribe();
        first.unsubscribe();
        assert_eq!(f.engine.subscriber_count("k"), 1);

        drop(second);
        assert!(f.engine.active_keys().is_empty());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_shown_until_first_fetch() {
        let store = MemorySnapshotStore::new();
        store
            .save("k", &PersistedSnapshot::new(serde_json::json!(41)))
            .await
            .unwrap();

        let engine: PollingEngine<u32> =
            PollingEngine::builder(KillSwitch::new(), RefreshTrigger::new())
                .snapshots(Arc::new(store.clone()))
                .build();

        let sub = engine
            .subscribe("k", || async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(42u32)
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        match sub.current_value() {
            PollState::Stale { data, reason, .. } => {
                assert_eq!(data, 41);
                assert_eq!(reason, SNAPSHOT_REASON);
            }
            other => panic!("unexpected state: {other:?}"),
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sub.current_value().data(), Some(&42));
        assert_eq!(
            store.load("k").await.unwrap().unwrap().data,
            serde_json::json!(42)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_everything() {
        let f = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut sub = f.engine.subscribe("k", counting(calls.clone())).unwrap();
        assert!(sub.changed().await.unwrap().is_fresh());

        f.engine.shutdown().await;
        assert!(f.engine.active_keys().is_empty());
        assert!(sub.changed().await.is_err());
        assert!(f.engine.subscribe("k", counting(calls.clone())).is_err());
    }
}
