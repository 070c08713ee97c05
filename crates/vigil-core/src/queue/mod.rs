//! Offline operation queue: durable capture and ordered replay of
//! mutations attempted while the backend is unreachable.
//!
//! `submit` is the front door: when the source is online it dispatches
//! immediately and only queues on connectivity-class failures; when
//! offline it queues without trying. Replay walks pending entries in
//! submission order, one at a time, and keeps going past individual
//! failures so one poisoned entry cannot wedge the queue.

mod store;

pub use store::{JsonFileStore, MemoryStore, OpStatus, QueueStore, QueuedOperation};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use vigil_api::{DashboardClient, Verdict, classify};

use crate::error::CoreError;

// ── Dispatch seam ────────────────────────────────────────────────────

/// Dispatches one operation against the backend. Abstracted so replay
/// order and bookkeeping are testable with scripted outcomes.
pub trait OperationExecutor: Send + Sync + 'static {
    fn execute(&self, op: &QueuedOperation) -> BoxFuture<'static, Result<Value, vigil_api::Error>>;
}

/// Production executor: resolves the entry's endpoint against the
/// backend base URL and sends it over HTTP.
pub struct HttpExecutor {
    client: DashboardClient,
    base_url: Url,
}

impl HttpExecutor {
    pub fn new(client: DashboardClient, base_url: Url) -> Self {
        Self { client, base_url }
    }
}

impl OperationExecutor for HttpExecutor {
    fn execute(&self, op: &QueuedOperation) -> BoxFuture<'static, Result<Value, vigil_api::Error>> {
        let client = self.client.clone();
        let url = self.base_url.join(&op.endpoint);
        let method = op.method.clone();
        let payload = op.payload.clone();
        Box::pin(async move {
            let url = url?;
            client.execute(&method, &url, &payload).await
        })
    }
}

// ── Queue ────────────────────────────────────────────────────────────

/// How a `submit` call resolved.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// Dispatched immediately; the backend's response body.
    Completed(Value),
    /// Captured for later replay.
    Queued(Uuid),
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// The offline operation queue.
pub struct OfflineQueue {
    store: Arc<dyn QueueStore>,
    executor: Arc<dyn OperationExecutor>,
    online: watch::Receiver<bool>,
    retention: Duration,
    /// Held for the duration of a replay pass so concurrent triggers
    /// coalesce instead of double-dispatching entries.
    replay_lock: tokio::sync::Mutex<()>,
}

impl OfflineQueue {
    pub fn new(
        store: Arc<dyn QueueStore>,
        executor: Arc<dyn OperationExecutor>,
        online: watch::Receiver<bool>,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            executor,
            online,
            retention,
            replay_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Capture an operation unconditionally, without attempting
    /// dispatch. Returns the entry id as soon as it is persisted.
    pub fn enqueue(
        &self,
        kind: impl Into<String>,
        endpoint: impl Into<String>,
        method: impl Into<String>,
        payload: Value,
    ) -> Result<Uuid, CoreError> {
        let op = QueuedOperation::new(kind, endpoint, method, payload);
        let id = op.id;
        self.store.put(op)?;
        debug!(%id, "operation queued");
        Ok(id)
    }

    /// Submit an operation: dispatch now if the source is online,
    /// queue otherwise.
    ///
    /// A connectivity-class dispatch failure (the backend went away
    /// between the online check and the request) falls back to
    /// queueing. Semantic rejections -- validation failures, fatal
    /// statuses -- surface to the caller immediately and are never
    /// queued: replaying them verbatim would fail identically.
    pub async fn submit(
        &self,
        kind: impl Into<String>,
        endpoint: impl Into<String>,
        method: impl Into<String>,
        payload: Value,
    ) -> Result<SubmitOutcome, CoreError> {
        let op = QueuedOperation::new(kind, endpoint, method, payload);

        if !*self.online.borrow() {
            let id = op.id;
            self.store.put(op)?;
            debug!(%id, "offline, operation queued");
            return Ok(SubmitOutcome::Queued(id));
        }

        match self.executor.execute(&op).await {
            Ok(body) => Ok(SubmitOutcome::Completed(body)),
            Err(err) if classify(&err) == Verdict::Transient => {
                let id = op.id;
                warn!(%id, error = %err, "dispatch failed in transit, operation queued");
                self.store.put(op)?;
                Ok(SubmitOutcome::Queued(id))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Replay pending entries in submission order.
    ///
    /// Returns `Ok(None)` when a replay is already in flight -- the
    /// trigger coalesces into the running pass. Individual entry
    /// failures are recorded on the entry and do not abort the pass.
    pub async fn process_queue(&self) -> Result<Option<ReplaySummary>, CoreError> {
        let Ok(_guard) = self.replay_lock.try_lock() else {
            debug!("replay already in flight, coalescing");
            return Ok(None);
        };

        let mut pending = self.store.all_by_status(OpStatus::Pending)?;
        pending.sort_by_key(|op| op.created_at);

        let mut summary = ReplaySummary::default();
        for mut op in pending {
            summary.processed += 1;
            op.status = OpStatus::Syncing;
            op.retry_count += 1;
            self.store.put(op.clone())?;

            match self.executor.execute(&op).await {
                Ok(_) => {
                    op.status = OpStatus::Synced;
                    op.completed_at = Some(Utc::now());
                    op.last_error = None;
                    summary.succeeded += 1;
                }
                Err(err) => {
                    // Any failure parks the entry; only `retry` /
                    // `retry_failed` put it back in line.
                    op.status = OpStatus::Failed;
                    op.last_error = Some(err.to_string());
                    summary.failed += 1;
                    warn!(id = %op.id, error = %err, "replay of queued operation failed");
                }
            }
            self.store.put(op)?;
        }

        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "queue replay finished"
        );
        Ok(Some(summary))
    }

    /// Move one failed entry back to pending. Its retry count is
    /// preserved.
    pub fn retry(&self, id: Uuid) -> Result<(), CoreError> {
        let Some(mut op) = self.store.get(id)? else {
            return Err(CoreError::OperationNotFound { id });
        };
        if op.status == OpStatus::Failed {
            op.status = OpStatus::Pending;
            self.store.put(op)?;
        }
        Ok(())
    }

    /// Move every failed entry back to pending. Returns how many moved.
    pub fn retry_failed(&self) -> Result<usize, CoreError> {
        let failed = self.store.all_by_status(OpStatus::Failed)?;
        let count = failed.len();
        for mut op in failed {
            op.status = OpStatus::Pending;
            self.store.put(op)?;
        }
        Ok(count)
    }

    /// Remove an entry that has not been dispatched yet.
    pub fn discard(&self, id: Uuid) -> Result<(), CoreError> {
        if self.store.get(id)?.is_none() {
            return Err(CoreError::OperationNotFound { id });
        }
        self.store.delete(id)
    }

    /// Drop synced entries older than the retention window. Returns
    /// how many were removed.
    ///
    /// A retention too large to represent as a datetime offset means
    /// nothing ever expires.
    pub fn cleanup(&self) -> Result<usize, CoreError> {
        let Some(cutoff) = chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return Ok(0);
        };

        let synced = self.store.all_by_status(OpStatus::Synced)?;
        let mut removed = 0;
        for op in synced {
            if op.completed_at.is_some_and(|done| done < cutoff) {
                self.store.delete(op.id)?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "expired synced queue entries removed");
        }
        Ok(removed)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<QueuedOperation>, CoreError> {
        self.store.get(id)
    }

    /// Every entry, in storage order.
    pub fn all(&self) -> Result<Vec<QueuedOperation>, CoreError> {
        self.store.all()
    }

    pub fn pending_count(&self) -> Result<usize, CoreError> {
        Ok(self.store.all_by_status(OpStatus::Pending)?.len())
    }

    /// Spawn a watcher that replays the queue each time connectivity
    /// comes back.
    pub fn spawn_replay_on_reconnect(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let mut online = self.online.clone();
        tokio::spawn(async move {
            let mut was_online = *online.borrow();
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let is_online = *online.borrow_and_update();
                        if is_online && !was_online {
                            info!("connectivity restored, replaying offline queue");
                            if let Err(err) = self.process_queue().await {
                                warn!(error = %err, "queue replay aborted");
                            }
                        }
                        was_online = is_online;
                    }
                }
            }
        })
    }
}
