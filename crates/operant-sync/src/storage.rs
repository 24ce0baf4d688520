//! Snapshot persistence
//!
//! Every durable resource persists as a versioned, whole-object snapshot
//! keyed by a stable identifier. The store is a narrow seam so the
//! file-per-key default can be swapped for an append log or an embedded
//! database without touching business logic.
//!
//! Read or deserialize failures are treated as "absent": the resource
//! resets to its empty initial state instead of propagating the error.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use operant_common::{OperantError, Result};

/// Storage key for the track queue snapshot
pub const TRACK_KEY: &str = "operant.track";
/// Storage key for the report queue snapshot
pub const REPORT_KEY: &str = "operant.report";
/// Storage key for the cartridge registry's action-identifier index
pub const CARTRIDGE_INDEX_KEY: &str = "operant.cartridge_index";
/// Storage key for the telemetry recorder snapshot
pub const TELEMETRY_KEY: &str = "operant.telemetry";

/// Storage key for one cartridge snapshot
pub fn cartridge_key(action_id: &str) -> String {
    format!("operant.cartridge.{action_id}")
}

/// Snapshot envelope format version
const SNAPSHOT_VERSION: u32 = 1;

/// Versioned envelope around a persisted snapshot
#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    payload: T,
}

/// Whole-object snapshot storage seam
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn save(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Load a snapshot, treating any failure as absence.
pub async fn load_snapshot<T: DeserializeOwned>(store: &dyn SnapshotStore, key: &str) -> Option<T> {
    let bytes = match store.load(key).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return None,
        Err(e) => {
            warn!(key, error = %e, "Snapshot load failed; starting from empty state");
            return None;
        }
    };
    match serde_json::from_slice::<Envelope<T>>(&bytes) {
        Ok(envelope) if envelope.version == SNAPSHOT_VERSION => Some(envelope.payload),
        Ok(envelope) => {
            warn!(
                key,
                version = envelope.version,
                "Snapshot format version mismatch; starting from empty state"
            );
            None
        }
        Err(e) => {
            warn!(key, error = %e, "Snapshot deserialize failed; starting from empty state");
            None
        }
    }
}

/// Save a snapshot. Persistence failures are logged, never propagated:
/// the in-memory state stays authoritative for this process lifetime.
pub async fn save_snapshot<T: Serialize>(store: &dyn SnapshotStore, key: &str, payload: &T) {
    let envelope = Envelope {
        version: SNAPSHOT_VERSION,
        payload,
    };
    let bytes = match serde_json::to_vec(&envelope) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(key, error = %e, "Snapshot serialize failed");
            return;
        }
    };
    if let Err(e) = store.save(key, bytes).await {
        warn!(key, error = %e, "Snapshot save failed");
    }
}

/// In-memory store, used in tests and as an opt-out of durability
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|entry| entry.clone()))
    }

    async fn save(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.entries.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// One JSON file per key under a directory, written atomically
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|e| OperantError::Storage(format!("create {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys may embed caller-supplied action identifiers
        let sanitized: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{sanitized}.json"))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OperantError::Storage(format!("read {key}: {e}"))),
        }
    }

    async fn save(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| OperantError::Storage(format!("write {key}: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| OperantError::Storage(format!("rename {key}: {e}")))?;
        debug!(key, bytes = bytes.len(), "Saved snapshot");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OperantError::Storage(format!("remove {key}: {e}"))),
        }
    }
}
