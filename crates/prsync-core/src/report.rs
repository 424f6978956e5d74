//! Outbound collaborators notified by the gateway: error reporting and the
//! "last synchronized at" timestamp.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::error;

use crate::error::SyncError;
use crate::util::lock;

/// External error tracker.
///
/// Only reportable failures reach it (see [`SyncError::is_reportable`]):
/// network and rate-limit conditions are expected and never reported.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &SyncError, context: &Map<String, Value>);
}

/// Default reporter: one structured `error!` event per report.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, error: &SyncError, context: &Map<String, Value>) {
        let context = Value::Object(context.clone());
        error!(kind = error.kind(), error = %error, context = %context, "sync failure");
    }
}

/// Reporter that keeps everything in memory.
#[derive(Debug, Clone, Default)]
pub struct CollectingReporter {
    reports: Arc<Mutex<Vec<(SyncError, Map<String, Value>)>>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<(SyncError, Map<String, Value>)> {
        lock(&self.reports).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.reports).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ErrorReporter for CollectingReporter {
    fn report(&self, error: &SyncError, context: &Map<String, Value>) {
        lock(&self.reports).push((error.clone(), context.clone()));
    }
}

/// Notified after every successful outbound call.
pub trait SyncObserver: Send + Sync {
    fn synced(&self, at: DateTime<Utc>);
}

/// Default observer: remembers the last success and broadcasts it.
#[derive(Debug, Clone)]
pub struct LastSynced {
    tx: Arc<watch::Sender<Option<DateTime<Utc>>>>,
}

impl LastSynced {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> Option<DateTime<Utc>> {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.tx.subscribe()
    }
}

impl Default for LastSynced {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncObserver for LastSynced {
    fn synced(&self, at: DateTime<Utc>) {
        self.tx.send_replace(Some(at));
    }
}
