//! Durable action queues
//!
//! [`ActionQueue`] buffers action records until a size or age trigger
//! fires, then uploads them as one batch. The track queue holds plain
//! observations; the report queue holds reinforced actions. Both persist
//! a whole-object snapshot after every mutation and reload it on
//! construction.
//!
//! Queue length only grows through [`ActionQueue::add`] and only shrinks
//! to zero through a successful or explicitly-invalidated sync.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use operant_common::time::utc_now_ms;
use operant_common::{ActionRecord, TriggerSnapshot, VersionHandle};

use crate::remote::{Outcome, RemoteDecisionService, RemoteStatus, StageResult};
use crate::storage::{load_snapshot, save_snapshot, SnapshotStore, REPORT_KEY, TRACK_KEY};

/// Which queue this is; decides storage key, batch semantics, and whether
/// the configured-version gate applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Track,
    Report,
}

impl QueueKind {
    pub fn name(&self) -> &'static str {
        match self {
            QueueKind::Track => "TrackQueue",
            QueueKind::Report => "ReportQueue",
        }
    }

    fn storage_key(&self) -> &'static str {
        match self {
            QueueKind::Track => TRACK_KEY,
            QueueKind::Report => REPORT_KEY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueState {
    records: Vec<ActionRecord>,
    timer_started_at_ms: i64,
    timer_expires_in_ms: i64,
    /// Configuration version the queue was buffered under
    version_stamp: Option<String>,
}

impl QueueState {
    fn empty(timer_expires_in_ms: i64, version_stamp: Option<String>) -> Self {
        Self {
            records: Vec::new(),
            timer_started_at_ms: utc_now_ms(),
            timer_expires_in_ms,
            version_stamp,
        }
    }
}

/// Durable FIFO queue of action records with size/age sync triggers
pub struct ActionQueue {
    kind: QueueKind,
    batch_threshold: usize,
    version: VersionHandle,
    store: Arc<dyn SnapshotStore>,
    state: Mutex<QueueState>,
    sync_in_flight: AtomicBool,
}

impl ActionQueue {
    /// Load the queue from durable storage, or start empty.
    ///
    /// A report snapshot stamped with a different configuration version
    /// than the current one is discarded wholesale.
    pub async fn open(
        kind: QueueKind,
        batch_threshold: usize,
        timer_expires_in_ms: i64,
        version: VersionHandle,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let current = version.get();
        let state = match load_snapshot::<QueueState>(store.as_ref(), kind.storage_key()).await {
            Some(saved) => {
                if kind == QueueKind::Report
                    && version.is_configured()
                    && saved.version_stamp != current
                {
                    debug!(queue = kind.name(), "Discarding stale-version snapshot");
                    QueueState::empty(timer_expires_in_ms, current)
                } else {
                    saved
                }
            }
            None => QueueState::empty(timer_expires_in_ms, current),
        };
        Self {
            kind,
            batch_threshold,
            version,
            store,
            state: Mutex::new(state),
            sync_in_flight: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.records.is_empty()
    }

    /// Append a record and persist. Does not itself trigger a sync; the
    /// caller notifies the coordinator.
    ///
    /// The track queue drops records while no remote configuration
    /// version has been obtained: an un-configured client must not
    /// buffer indefinitely against an unknown schema.
    pub async fn add(&self, record: ActionRecord) {
        if self.kind == QueueKind::Track && !self.version.is_configured() {
            debug!(
                queue = self.kind.name(),
                action_id = %record.action_id,
                "Dropping record; client not yet configured"
            );
            return;
        }
        let mut state = self.state.lock().await;
        state.records.push(record);
        state.version_stamp = self.version.get();
        debug!(
            queue = self.kind.name(),
            size = state.records.len(),
            "Queued action record"
        );
        self.persist(&state).await;
    }

    /// True iff the batch threshold or the age timer has been reached.
    /// The track queue additionally requires a configuration version.
    pub async fn is_triggered(&self, now: i64) -> bool {
        if self.kind == QueueKind::Track && !self.version.is_configured() {
            return false;
        }
        let state = self.state.lock().await;
        state.records.len() >= self.batch_threshold
            || now >= state.timer_started_at_ms + state.timer_expires_in_ms
    }

    /// Upload all queued records as one batch.
    ///
    /// Empty queue: resets the age timer, no network call. Success:
    /// clears the uploaded batch and resets the timer. Rejected: clears
    /// the batch without re-queueing. Anything else leaves the queue
    /// untouched and halts. At most one attempt runs at a time; a
    /// concurrent call returns immediately without side effects.
    #[instrument(skip(self, remote), fields(queue = self.kind.name()))]
    pub async fn sync(&self, remote: &dyn RemoteDecisionService) -> StageResult {
        let started_at = utc_now_ms();
        if self
            .sync_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return StageResult::finish(Outcome::AlreadyRunning, None, started_at);
        }
        let result = self.sync_inner(remote, started_at).await;
        self.sync_in_flight.store(false, Ordering::Release);
        result
    }

    async fn sync_inner(
        &self,
        remote: &dyn RemoteDecisionService,
        started_at: i64,
    ) -> StageResult {
        let batch = {
            let mut state = self.state.lock().await;
            if state.records.is_empty() {
                state.timer_started_at_ms = utc_now_ms();
                self.persist(&state).await;
                debug!(queue = self.kind.name(), "Nothing to sync");
                return StageResult::finish(Outcome::NothingToSync, None, started_at);
            }
            state.records.clone()
        };

        debug!(queue = self.kind.name(), size = batch.len(), "Uploading batch");
        let response = match self.kind {
            QueueKind::Track => remote
                .track(&batch)
                .await
                .map(|r| (r.status, r.error)),
            QueueKind::Report => remote
                .report(&batch)
                .await
                .map(|r| (r.status, r.error)),
        };

        match response {
            Ok((RemoteStatus::Success, _)) => {
                self.clear_batch(batch.len()).await;
                debug!(queue = self.kind.name(), sent = batch.len(), "Batch synced");
                StageResult::finish(Outcome::Success, None, started_at)
            }
            Ok((RemoteStatus::Rejected, error)) => {
                // Remote judged the batch permanently invalid; discard it
                self.clear_batch(batch.len()).await;
                warn!(
                    queue = self.kind.name(),
                    flushed = batch.len(),
                    "Flushed batch rejected by remote"
                );
                StageResult::finish(Outcome::ServerRejected, error, started_at)
            }
            Ok((RemoteStatus::Other(code), error)) => {
                warn!(queue = self.kind.name(), code, "Sync failed; halting");
                let error = error.or_else(|| Some(format!("remote status {code}")));
                StageResult::finish(Outcome::Halt, error, started_at)
            }
            Err(e) => {
                warn!(queue = self.kind.name(), error = %e, "Sync failed; halting");
                StageResult::finish(Outcome::Halt, Some(e.to_string()), started_at)
            }
        }
    }

    /// Drop the uploaded batch; records appended while the upload was in
    /// flight survive at the front of the next batch.
    async fn clear_batch(&self, sent: usize) {
        let mut state = self.state.lock().await;
        let upto = sent.min(state.records.len());
        state.records.drain(..upto);
        state.timer_started_at_ms = utc_now_ms();
        self.persist(&state).await;
    }

    /// Snapshot of the trigger-relevant counters for telemetry
    pub async fn trigger_snapshot(&self) -> TriggerSnapshot {
        let state = self.state.lock().await;
        TriggerSnapshot {
            size: state.records.len(),
            timer_started_at_ms: state.timer_started_at_ms,
            timer_expires_in_ms: state.timer_expires_in_ms,
            sync_response: None,
        }
    }

    /// Discard all queued records, reset the timer, and erase the
    /// persisted snapshot
    pub async fn flush(&self) {
        let mut state = self.state.lock().await;
        let timer = state.timer_expires_in_ms;
        *state = QueueState::empty(timer, self.version.get());
        if let Err(e) = self.store.remove(self.kind.storage_key()).await {
            warn!(queue = self.kind.name(), error = %e, "Snapshot erase failed");
        }
    }

    async fn persist(&self, state: &QueueState) {
        save_snapshot(self.store.as_ref(), self.kind.storage_key(), state).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockRemote;
    use crate::storage::MemorySnapshotStore;

    const HOUR_MS: i64 = 3_600_000;

    async fn queue(kind: QueueKind, threshold: usize, version: VersionHandle) -> ActionQueue {
        ActionQueue::open(
            kind,
            threshold,
            HOUR_MS,
            version,
            Arc::new(MemorySnapshotStore::new()),
        )
        .await
    }

    fn configured() -> VersionHandle {
        VersionHandle::with_version("v1")
    }

    #[tokio::test]
    async fn test_below_threshold_not_triggered() {
        let q = queue(QueueKind::Track, 15, configured()).await;
        for i in 0..14 {
            q.add(ActionRecord::new(format!("action{i}"))).await;
        }
        assert!(!q.is_triggered(utc_now_ms()).await);
        q.add(ActionRecord::new("action14")).await;
        assert!(q.is_triggered(utc_now_ms()).await);
    }

    #[tokio::test]
    async fn test_age_timer_triggers() {
        let q = queue(QueueKind::Report, 100, configured()).await;
        q.add(ActionRecord::new("a").with_decision("stars")).await;
        let now = utc_now_ms();
        assert!(!q.is_triggered(now).await);
        assert!(q.is_triggered(now + HOUR_MS).await);
    }

    #[tokio::test]
    async fn test_unconfigured_track_never_triggers_or_buffers() {
        let q = queue(QueueKind::Track, 1, VersionHandle::new()).await;
        q.add(ActionRecord::new("a")).await;
        assert_eq!(q.len().await, 0);
        assert!(!q.is_triggered(utc_now_ms() + 10 * HOUR_MS).await);
    }

    #[tokio::test]
    async fn test_successful_sync_clears_and_resets_timer() {
        let q = queue(QueueKind::Track, 15, configured()).await;
        let remote = MockRemote::new();
        let before = utc_now_ms();
        for i in 0..15 {
            q.add(ActionRecord::new(format!("action{i}"))).await;
        }

        let result = q.sync(&remote).await;
        assert_eq!(result.outcome, Outcome::Success);
        assert_eq!(q.len().await, 0);

        // timer baseline reset to completion time
        let snapshot = q.trigger_snapshot().await;
        assert!(snapshot.timer_started_at_ms >= before);

        // one batch containing all records in insertion order
        let calls = remote.track_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 15);
        assert_eq!(calls[0][0].action_id, "action0");
        assert_eq!(calls[0][14].action_id, "action14");
    }

    #[tokio::test]
    async fn test_empty_sync_makes_no_network_call() {
        let q = queue(QueueKind::Track, 15, configured()).await;
        let remote = MockRemote::new();
        let result = q.sync(&remote).await;
        assert_eq!(result.outcome, Outcome::NothingToSync);
        assert!(remote.track_calls().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_sync_clears_without_requeue() {
        let q = queue(QueueKind::Report, 15, configured()).await;
        let remote = MockRemote::new();
        remote.push_report_status(RemoteStatus::Rejected);
        q.add(ActionRecord::new("a").with_decision("stars")).await;

        let result = q.sync(&remote).await;
        assert_eq!(result.outcome, Outcome::ServerRejected);
        assert_eq!(q.len().await, 0);
    }

    #[tokio::test]
    async fn test_failed_sync_leaves_queue_untouched() {
        let q = queue(QueueKind::Track, 15, configured()).await;
        let remote = MockRemote::new();
        remote.push_track_error("connection refused");
        q.add(ActionRecord::new("a")).await;

        let result = q.sync(&remote).await;
        assert_eq!(result.outcome, Outcome::Halt);
        assert!(result.error.is_some());
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn test_queue_persists_across_open() {
        let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::new());
        let version = configured();
        {
            let q = ActionQueue::open(
                QueueKind::Track,
                15,
                HOUR_MS,
                version.clone(),
                store.clone(),
            )
            .await;
            q.add(ActionRecord::new("persisted")).await;
        }
        let q = ActionQueue::open(QueueKind::Track, 15, HOUR_MS, version, store).await;
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn test_stale_report_snapshot_discarded() {
        let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::new());
        {
            let q = ActionQueue::open(
                QueueKind::Report,
                15,
                HOUR_MS,
                VersionHandle::with_version("v1"),
                store.clone(),
            )
            .await;
            q.add(ActionRecord::new("old").with_decision("stars")).await;
        }
        let q = ActionQueue::open(
            QueueKind::Report,
            15,
            HOUR_MS,
            VersionHandle::with_version("v2"),
            store,
        )
        .await;
        assert_eq!(q.len().await, 0);
    }

    #[tokio::test]
    async fn test_flush_discards_everything_including_snapshot() {
        let store = Arc::new(MemorySnapshotStore::new());
        let q = ActionQueue::open(QueueKind::Track, 15, HOUR_MS, configured(), store.clone()).await;
        q.add(ActionRecord::new("a")).await;
        q.add(ActionRecord::new("b")).await;
        q.flush().await;
        assert_eq!(q.len().await, 0);
        assert!(store.is_empty());
    }
}
