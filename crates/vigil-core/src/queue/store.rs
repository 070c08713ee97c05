// ── Durable queue storage ──
//
// The queue file is small (tens of entries, not thousands), so the
// whole thing lives in memory and is rewritten on every mutation.
// Writes go through a temp file in the same directory followed by a
// rename, so a crash mid-write never leaves a torn queue file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CoreError;

/// Lifecycle status of a queued operation.
///
/// Transitions are monotonic within one replay:
/// `Pending -> Syncing -> Synced | Failed`. Only an explicit retry
/// moves `Failed` back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

/// One mutation captured while the backend was unreachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: Uuid,
    /// Caller-defined operation kind (`"device.restart"`, ...).
    pub kind: String,
    /// Endpoint path the operation targets, relative to the backend base.
    pub endpoint: String,
    pub method: String,
    pub payload: Value,
    pub status: OpStatus,
    /// Dispatch attempts so far, bumped when a replay picks the entry up.
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl QueuedOperation {
    pub fn new(
        kind: impl Into<String>,
        endpoint: impl Into<String>,
        method: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            endpoint: endpoint.into(),
            method: method.into(),
            payload,
            status: OpStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
            completed_at: None,
            last_error: None,
        }
    }
}

/// Storage backend for the offline queue.
///
/// Implementations are synchronous; the queue file is tiny and every
/// caller already holds the replay lock when mutating in bulk.
pub trait QueueStore: Send + Sync {
    fn get(&self, id: Uuid) -> Result<Option<QueuedOperation>, CoreError>;

    /// Insert or overwrite by id.
    fn put(&self, op: QueuedOperation) -> Result<(), CoreError>;

    fn delete(&self, id: Uuid) -> Result<(), CoreError>;

    fn all(&self) -> Result<Vec<QueuedOperation>, CoreError>;

    fn all_by_status(&self, status: OpStatus) -> Result<Vec<QueuedOperation>, CoreError> {
        let mut ops = self.all()?;
        ops.retain(|op| op.status == status);
        Ok(ops)
    }
}

// ── File-backed store ────────────────────────────────────────────────

/// JSON-file store surviving process restarts.
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<Vec<QueuedOperation>>,
}

impl JsonFileStore {
    /// Open (or create) the queue file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| CoreError::Storage {
                message: format!("queue file {} is not valid JSON: {e}", path.display()),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(storage_io(&path, &e));
            }
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn persist(&self, entries: &[QueuedOperation]) -> Result<(), CoreError> {
        let raw = serde_json::to_string_pretty(entries).map_err(|e| CoreError::Storage {
            message: format!("failed to serialize queue: {e}"),
        })?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw).map_err(|e| storage_io(&tmp, &e))?;
        fs::rename(&tmp, &self.path).map_err(|e| storage_io(&self.path, &e))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<QueuedOperation>> {
        // Lock poisoning only happens if a panic occurred while
        // holding it; the entries are still structurally valid.
        self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn storage_io(path: &Path, err: &std::io::Error) -> CoreError {
    CoreError::Storage {
        message: format!("{}: {err}", path.display()),
    }
}

impl QueueStore for JsonFileStore {
    fn get(&self, id: Uuid) -> Result<Option<QueuedOperation>, CoreError> {
        Ok(self.lock().iter().find(|op| op.id == id).cloned())
    }

    fn put(&self, op: QueuedOperation) -> Result<(), CoreError> {
        let mut entries = self.lock();
        match entries.iter_mut().find(|e| e.id == op.id) {
            Some(existing) => *existing = op,
            None => entries.push(op),
        }
        self.persist(&entries)
    }

    fn delete(&self, id: Uuid) -> Result<(), CoreError> {
        let mut entries = self.lock();
        entries.retain(|op| op.id != id);
        self.persist(&entries)
    }

    fn all(&self) -> Result<Vec<QueuedOperation>, CoreError> {
        Ok(self.lock().clone())
    }
}

// ── In-memory store ──────────────────────────────────────────────────

/// Volatile store for tests and for embedders who do their own
/// persistence.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<Vec<QueuedOperation>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<QueuedOperation>> {
        self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl QueueStore for MemoryStore {
    fn get(&self, id: Uuid) -> Result<Option<QueuedOperation>, CoreError> {
        Ok(self.lock().iter().find(|op| op.id == id).cloned())
    }

    fn put(&self, op: QueuedOperation) -> Result<(), CoreError> {
        let mut entries = self.lock();
        match entries.iter_mut().find(|e| e.id == op.id) {
            Some(existing) => *existing = op,
            None => entries.push(op),
        }
        Ok(())
    }

    fn delete(&self, id: Uuid) -> Result<(), CoreError> {
        self.lock().retain(|op| op.id != id);
        Ok(())
    }

    fn all(&self) -> Result<Vec<QueuedOperation>, CoreError> {
        Ok(self.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_overwrites_by_id() {
        let store = MemoryStore::new();
        let mut op = QueuedOperation::new("device.restart", "/devices/1/restart", "POST", json!({}));
        store.put(op.clone()).expect("put");

        op.status = OpStatus::Failed;
        op.last_error = Some("boom".into());
        store.put(op.clone()).expect("put");

        let stored = store.get(op.id).expect("get").expect("present");
        assert_eq!(stored.status, OpStatus::Failed);
        assert_eq!(store.all().expect("all").len(), 1);
    }

    #[test]
    fn all_by_status_filters() {
        let store = MemoryStore::new();
        let mut a = QueuedOperation::new("a", "/a", "POST", json!({}));
        a.status = OpStatus::Synced;
        let b = QueuedOperation::new("b", "/b", "POST", json!({}));
        store.put(a).expect("put");
        store.put(b.clone()).expect("put");

        let pending = store.all_by_status(OpStatus::Pending).expect("filter");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.id);
    }

    #[test]
    fn file_store_round_trips_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("queue.json");

        let op = QueuedOperation::new("device.rename", "/devices/2", "PUT", json!({"name": "lobby"}));
        {
            let store = JsonFileStore::open(&path).expect("open");
            store.put(op.clone()).expect("put");
        }

        let reopened = JsonFileStore::open(&path).expect("reopen");
        let stored = reopened.get(op.id).expect("get").expect("survived restart");
        assert_eq!(stored.kind, "device.rename");
        assert_eq!(stored.payload, json!({"name": "lobby"}));
    }

    #[test]
    fn file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("queue.json");
        std::fs::write(&path, "{not json").expect("write");

        assert!(matches!(
            JsonFileStore::open(&path),
            Err(CoreError::Storage { .. })
        ));
    }
}
