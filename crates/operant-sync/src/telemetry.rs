//! Telemetry recorder
//!
//! Accumulates sync overviews and exception records in a durable list and
//! uploads them as a secondary, best-effort channel. Upload failures
//! leave everything queued for the next attempt; no cap is imposed, so
//! the lists grow until an upload succeeds.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use operant_common::time::utc_now_ms;
use operant_common::{ExceptionRecord, SyncOverview};

use crate::remote::{Outcome, RemoteDecisionService, RemoteStatus, StageResult};
use crate::storage::{load_snapshot, save_snapshot, SnapshotStore, TELEMETRY_KEY};

#[derive(Debug, Default, Serialize, Deserialize)]
struct TelemetryState {
    overviews: Vec<SyncOverview>,
    exceptions: Vec<ExceptionRecord>,
}

/// Records and uploads sync-performance diagnostics
pub struct TelemetryRecorder {
    store: Arc<dyn SnapshotStore>,
    state: Mutex<TelemetryState>,
}

impl TelemetryRecorder {
    /// Load pending diagnostics from durable storage, or start empty
    pub async fn open(store: Arc<dyn SnapshotStore>) -> Self {
        let state = load_snapshot::<TelemetryState>(store.as_ref(), TELEMETRY_KEY)
            .await
            .unwrap_or_default();
        Self {
            store,
            state: Mutex::new(state),
        }
    }

    /// Queue a finalized overview for upload
    pub async fn record_overview(&self, overview: SyncOverview) {
        let mut state = self.state.lock().await;
        state.overviews.push(overview);
        self.persist(&state).await;
    }

    /// Capture an internal failure with a call-stack snapshot. Never
    /// raises; recording problems are only logged.
    pub async fn store_exception(&self, component: &str, message: &str) {
        warn!(component, message, "Recorded exception");
        let record = ExceptionRecord::new(component, message);
        let mut state = self.state.lock().await;
        state.exceptions.push(record);
        self.persist(&state).await;
    }

    /// (pending overviews, pending exceptions)
    pub async fn pending_counts(&self) -> (usize, usize) {
        let state = self.state.lock().await;
        (state.overviews.len(), state.exceptions.len())
    }

    /// Best-effort upload of everything pending. Success clears both
    /// lists; any failure leaves them for the next attempt.
    pub async fn upload(&self, remote: &dyn RemoteDecisionService) -> StageResult {
        let started_at = utc_now_ms();
        let mut state = self.state.lock().await;
        if state.overviews.is_empty() && state.exceptions.is_empty() {
            return StageResult::finish(Outcome::NothingToSync, None, started_at);
        }
        match remote
            .upload_telemetry(&state.overviews, &state.exceptions)
            .await
        {
            Ok(response) if response.status == RemoteStatus::Success => {
                debug!(
                    overviews = state.overviews.len(),
                    exceptions = state.exceptions.len(),
                    "Uploaded telemetry"
                );
                state.overviews.clear();
                state.exceptions.clear();
                self.persist(&state).await;
                StageResult::finish(Outcome::Success, None, started_at)
            }
            Ok(response) => {
                debug!(status = ?response.status, "Telemetry upload refused; keeping diagnostics");
                StageResult::finish(Outcome::Halt, response.error, started_at)
            }
            Err(e) => {
                debug!(error = %e, "Telemetry upload failed; keeping diagnostics");
                StageResult::finish(Outcome::Halt, Some(e.to_string()), started_at)
            }
        }
    }

    /// Discard all pending diagnostics and erase the persisted snapshot
    pub async fn flush(&self) {
        let mut state = self.state.lock().await;
        *state = TelemetryState::default();
        if let Err(e) = self.store.remove(TELEMETRY_KEY).await {
            warn!(error = %e, "Telemetry snapshot erase failed");
        }
    }

    async fn persist(&self, state: &TelemetryState) {
        save_snapshot(self.store.as_ref(), TELEMETRY_KEY, state).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockRemote;
    use crate::storage::MemorySnapshotStore;
    use std::collections::BTreeMap;
    use operant_common::TriggerSnapshot;

    fn overview() -> SyncOverview {
        let snapshot = TriggerSnapshot {
            size: 0,
            timer_started_at_ms: 0,
            timer_expires_in_ms: 0,
            sync_response: None,
        };
        let mut overview = SyncOverview::open(
            "Track needs to sync.",
            snapshot.clone(),
            snapshot,
            BTreeMap::new(),
        );
        overview.finalize();
        overview
    }

    #[tokio::test]
    async fn test_upload_success_clears_both_lists() {
        let recorder = TelemetryRecorder::open(Arc::new(MemorySnapshotStore::new())).await;
        recorder.record_overview(overview()).await;
        recorder.store_exception("TrackQueue", "persist failed").await;
        assert_eq!(recorder.pending_counts().await, (1, 1));

        let remote = MockRemote::new();
        let result = recorder.upload(&remote).await;
        assert_eq!(result.outcome, Outcome::Success);
        assert_eq!(recorder.pending_counts().await, (0, 0));
        assert_eq!(remote.telemetry_calls(), vec![(1, 1)]);
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_everything() {
        let recorder = TelemetryRecorder::open(Arc::new(MemorySnapshotStore::new())).await;
        recorder.record_overview(overview()).await;

        let remote = MockRemote::new();
        remote.push_telemetry_status(RemoteStatus::Other(500));
        let result = recorder.upload(&remote).await;
        assert_eq!(result.outcome, Outcome::Halt);
        assert_eq!(recorder.pending_counts().await, (1, 0));

        // next attempt succeeds and drains
        let result = recorder.upload(&remote).await;
        assert_eq!(result.outcome, Outcome::Success);
        assert_eq!(recorder.pending_counts().await, (0, 0));
    }

    #[tokio::test]
    async fn test_nothing_pending_skips_network() {
        let recorder = TelemetryRecorder::open(Arc::new(MemorySnapshotStore::new())).await;
        let remote = MockRemote::new();
        let result = recorder.upload(&remote).await;
        assert_eq!(result.outcome, Outcome::NothingToSync);
        assert!(remote.telemetry_calls().is_empty());
    }

    #[tokio::test]
    async fn test_flush_erases_snapshot() {
        let store = Arc::new(MemorySnapshotStore::new());
        let recorder = TelemetryRecorder::open(store.clone()).await;
        recorder.store_exception("TrackQueue", "persist failed").await;
        recorder.flush().await;
        assert_eq!(recorder.pending_counts().await, (0, 0));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_diagnostics_persist_across_open() {
        let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::new());
        {
            let recorder = TelemetryRecorder::open(store.clone()).await;
            recorder.store_exception("Cartridge", "refresh failed").await;
        }
        let recorder = TelemetryRecorder::open(store).await;
        assert_eq!(recorder.pending_counts().await, (0, 1));
    }
}
