//! Start-up wiring: every shared service is constructed once here and
//! handed out by reference.

use std::sync::Arc;

use tracing::info;

use crate::auth::{CredentialProvider, TokenLifecycleManager};
use crate::cache::MemoryCache;
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::gateway::{HttpTransport, RequestGateway, Transport};
use crate::github::EnvCredentialProvider;
use crate::kill_switch::{KillSwitch, RefreshTrigger};
use crate::polling::{PollingEngine, Resource};
use crate::report::{ErrorReporter, LastSynced, TracingReporter};
use crate::snapshot::SnapshotStore;

/// The assembled synchronization layer.
#[derive(Clone)]
pub struct SyncLayer {
    config: SyncConfig,
    tokens: TokenLifecycleManager,
    gateway: RequestGateway,
    kill_switch: KillSwitch,
    trigger: RefreshTrigger,
    last_synced: LastSynced,
    snapshots: Option<Arc<dyn SnapshotStore>>,
}

impl std::fmt::Debug for SyncLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncLayer")
            .field("tokens", &self.tokens)
            .field("gateway", &self.gateway)
            .field("snapshots", &self.snapshots.is_some())
            .finish()
    }
}

impl SyncLayer {
    pub fn builder() -> SyncLayerBuilder {
        SyncLayerBuilder::default()
    }

    /// Run the initial authentication.
    pub async fn start(&self) -> SyncResult<()> {
        self.tokens.initialize().await?;
        let context = self.tokens.context();
        info!(user = ?context.current_user, "synchronization layer started");
        Ok(())
    }

    /// A polling engine for one resource type, with its own cache and the
    /// layer's kill switch, refresh trigger and snapshot store.
    pub fn polling_engine<T: Resource>(&self) -> PollingEngine<T> {
        let cache = Arc::new(MemoryCache::new(&self.config.cache));
        let builder = PollingEngine::builder(self.kill_switch.clone(), self.trigger.clone())
            .config(self.config.polling.clone())
            .cache(cache);
        match &self.snapshots {
            Some(store) => builder.snapshots(Arc::clone(store)).build(),
            None => builder.build(),
        }
    }

    /// Force an immediate resync of every active subscription.
    pub fn refresh_all(&self) {
        self.trigger.fire();
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn tokens(&self) -> &TokenLifecycleManager {
        &self.tokens
    }

    pub fn gateway(&self) -> &RequestGateway {
        &self.gateway
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill_switch
    }

    pub fn trigger(&self) -> &RefreshTrigger {
        &self.trigger
    }

    pub fn last_synced(&self) -> &LastSynced {
        &self.last_synced
    }
}

/// Builder for [`SyncLayer`]. Unset collaborators fall back to the
/// environment credential provider, the HTTP transport and the tracing
/// reporter.
#[derive(Default)]
pub struct SyncLayerBuilder {
    config: Option<SyncConfig>,
    provider: Option<Arc<dyn CredentialProvider>>,
    transport: Option<Arc<dyn Transport>>,
    reporter: Option<Arc<dyn ErrorReporter>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
}

impl SyncLayerBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn credential_provider(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn snapshots(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn build(self) -> SyncResult<SyncLayer> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let provider = match self.provider {
            Some(provider) => provider,
            None => Arc::new(EnvCredentialProvider::new(&config.gateway)?),
        };
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&config.gateway)?),
        };
        let reporter = self.reporter.unwrap_or_else(|| Arc::new(TracingReporter));

        let tokens = TokenLifecycleManager::new(provider);
        let kill_switch = KillSwitch::new();
        let last_synced = LastSynced::new();
        let gateway = RequestGateway::builder(transport, tokens.clone())
            .config(&config)
            .kill_switch(kill_switch.clone())
            .reporter(reporter)
            .observer(Arc::new(last_synced.clone()))
            .build();

        Ok(SyncLayer {
            config,
            tokens,
            gateway,
            kill_switch,
            trigger: RefreshTrigger::new(),
            last_synced,
            snapshots: self.snapshots,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthState, StaticCredentialProvider};
    use crate::error::SyncError;
    use std::time::Duration;

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = SyncConfig::default();
        config.polling.interval = Duration::ZERO;

        let err = SyncLayer::builder()
            .config(config)
            .credential_provider(Arc::new(StaticCredentialProvider::new("t")))
            .build()
            .unwrap_err();
        assert!(matches!(err, SyncError::Config { .. }));
    }

    #[tokio::test]
    async fn test_start_authenticates() {
        let layer = SyncLayer::builder()
            .credential_provider(Arc::new(StaticCredentialProvider::new("t")))
            .build()
            .unwrap();
        assert_eq!(layer.tokens().current_state(), AuthState::Initializing);

        layer.start().await.unwrap();
        assert_eq!(layer.tokens().current_state(), AuthState::Authenticated);
        assert!(!layer.kill_switch().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_all_reaches_every_engine() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let layer = SyncLayer::builder()
            .credential_provider(Arc::new(StaticCredentialProvider::new("t")))
            .build()
            .unwrap();
        let numbers = layer.polling_engine::<u32>();
        let names = layer.polling_engine::<String>();

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let _a = numbers
            .subscribe("n", move || {
                let calls = counted.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7u32)
                }
            })
            .unwrap();
        let counted = calls.clone();
        let _b = names
            .subscribe("s", move || {
                let calls = counted.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("seven".to_string())
                }
            })
            .unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Caches are still fresh; the trigger bypasses them.
        layer.refresh_all();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_engines_share_the_kill_switch() {
        let layer = SyncLayer::builder()
            .credential_provider(Arc::new(StaticCredentialProvider::new("t")))
            .build()
            .unwrap();
        let engine = layer.polling_engine::<u32>();

        layer.kill_switch().set(true);
        assert_eq!(
            engine.poll_once("any", true).await,
            crate::polling::CycleOutcome::Suspended
        );
    }
}
