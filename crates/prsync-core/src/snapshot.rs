//! Persisted last-known-good values, shown while the first fetch of a
//! session is in flight.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::util::lock;

/// A stored value and when it was fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub last_updated: DateTime<Utc>,
    pub data: Value,
}

impl PersistedSnapshot {
    pub fn new(data: Value) -> Self {
        Self {
            last_updated: Utc::now(),
            data,
        }
    }
}

/// Durable key/value store for snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, key: &str) -> SyncResult<Option<PersistedSnapshot>>;

    async fn save(&self, key: &str, snapshot: &PersistedSnapshot) -> SyncResult<()>;

    async fn remove(&self, key: &str) -> SyncResult<()>;
}

/// One JSON file per key, named by the SHA-256 of the key.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    /// Default location: `~/.cache/prsync/snapshots`.
    pub fn new() -> SyncResult<Self> {
        let base = dirs::cache_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| SyncError::Snapshot {
                message: "could not determine cache directory".to_string(),
            })?;
        Ok(Self::with_dir(base.join("prsync").join("snapshots")))
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(format!("{}.json", hex::encode(digest)))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self, key: &str) -> SyncResult<Option<PersistedSnapshot>> {
        let path = self.path_for(key);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SyncError::Snapshot {
                    message: format!("failed to read {}: {}", path.display(), e),
                })
            }
        };

        match serde_json::from_str(&content) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                // Corrupt file: drop it, the next successful fetch rewrites it.
                warn!(key, path = %path.display(), error = %e, "discarding corrupt snapshot");
                let _ = fs::remove_file(&path).await;
                Ok(None)
            }
        }
    }

    async fn save(&self, key: &str, snapshot: &PersistedSnapshot) -> SyncResult<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SyncError::Snapshot {
                message: format!("failed to create {}: {}", self.dir.display(), e),
            })?;

        let content = serde_json::to_string(snapshot)?;
        let path = self.path_for(key);
        write_atomic(&path, &content).await?;
        debug!(key, path = %path.display(), "snapshot saved");
        Ok(())
    }

    async fn remove(&self, key: &str) -> SyncResult<()> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::Snapshot {
                message: format!("failed to remove snapshot: {}", e),
            }),
        }
    }
}

async fn write_atomic(path: &Path, content: &str) -> SyncResult<()> {
    let temp_path = path.with_extension("tmp");

    fs::write(&temp_path, content)
        .await
        .map_err(|e| SyncError::Snapshot {
            message: format!("failed to write temp file: {}", e),
        })?;

    fs::rename(&temp_path, path)
        .await
        .map_err(|e| SyncError::Snapshot {
            message: format!("failed to rename temp file: {}", e),
        })?;

    Ok(())
}

/// In-process store, for tests and for running without a disk.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    entries: Arc<Mutex<HashMap<String, PersistedSnapshot>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, key: &str) -> SyncResult<Option<PersistedSnapshot>> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    async fn save(&self, key: &str, snapshot: &PersistedSnapshot) -> SyncResult<()> {
        lock(&self.entries).insert(key.to_string(), snapshot.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> SyncResult<()> {
        lock(&self.entries).remove(key);
        Ok(())
    }
}
