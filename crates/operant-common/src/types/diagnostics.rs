//! Diagnostic value records
//!
//! [`SyncOverview`] captures one synchronization run: the trigger-relevant
//! counters of every queue and cartridge at run start, plus a per-stage
//! response as each stage completes. [`ExceptionRecord`] captures an
//! unexpected internal failure. Both are queued locally and uploaded as a
//! secondary, best-effort telemetry channel.

use std::backtrace::Backtrace;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::time::{timezone_offset_ms, utc_now_ms};

/// Outcome of one sync stage, as recorded in an overview
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage uploaded its batch
    Success,
    /// Stage had nothing to upload; no network call was made
    NothingToSync,
    /// Remote judged the data permanently invalid; it was discarded
    Rejected,
    /// Transport failure or unexpected remote response
    Failed,
    /// Stage was skipped because another attempt was already in flight
    Skipped,
}

/// Response recorded for one sync stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResponse {
    /// Time the stage's call started, UTC milliseconds
    pub utc_ms: i64,
    /// Wall-clock round-trip time of the stage, milliseconds
    pub round_trip_ms: i64,
    pub status: StageStatus,
    pub error: Option<String>,
}

/// Trigger-relevant counters of a queue at run start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSnapshot {
    /// Queued record count
    pub size: usize,
    pub timer_started_at_ms: i64,
    pub timer_expires_in_ms: i64,
    /// Filled in when the stage completes
    pub sync_response: Option<StageResponse>,
}

/// Trigger-relevant counters of a cartridge at run start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartridgeSnapshot {
    pub action_id: String,
    /// Remaining decision count
    pub size: usize,
    /// Decision count at last refill
    pub initial_size: usize,
    /// Refill threshold as a fraction of the initial fill
    pub capacity_fraction: f64,
    pub timer_started_at_ms: i64,
    pub timer_expires_in_ms: i64,
    /// Filled in when the stage completes
    pub sync_response: Option<StageResponse>,
}

/// Record of one coordinator run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOverview {
    pub id: Uuid,
    /// Run start, UTC milliseconds
    pub utc_ms: i64,
    pub timezone_offset_ms: i64,
    /// Total run duration in milliseconds; -1 until finalized
    pub total_sync_time_ms: i64,
    /// Human-readable trigger reason
    pub cause: String,
    pub track: TriggerSnapshot,
    pub report: TriggerSnapshot,
    pub cartridges: BTreeMap<String, CartridgeSnapshot>,
}

impl SyncOverview {
    /// Open an overview at the start of a run
    pub fn open(
        cause: impl Into<String>,
        track: TriggerSnapshot,
        report: TriggerSnapshot,
        cartridges: BTreeMap<String, CartridgeSnapshot>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            utc_ms: utc_now_ms(),
            timezone_offset_ms: timezone_offset_ms(),
            total_sync_time_ms: -1,
            cause: cause.into(),
            track,
            report,
            cartridges,
        }
    }

    pub fn set_track_response(&mut self, response: StageResponse) {
        self.track.sync_response = Some(response);
    }

    pub fn set_report_response(&mut self, response: StageResponse) {
        self.report.sync_response = Some(response);
    }

    /// Records a cartridge stage response. Cartridges created after the
    /// run opened have no snapshot entry and are not recorded.
    pub fn set_cartridge_response(&mut self, action_id: &str, response: StageResponse) {
        if let Some(snapshot) = self.cartridges.get_mut(action_id) {
            snapshot.sync_response = Some(response);
        }
    }

    /// Compute the total run duration
    pub fn finalize(&mut self) {
        self.total_sync_time_ms = utc_now_ms() - self.utc_ms;
    }

    pub fn is_finalized(&self) -> bool {
        self.total_sync_time_ms >= 0
    }
}

/// Captured internal failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub utc_ms: i64,
    pub timezone_offset_ms: i64,
    /// Originating component name
    pub component: String,
    pub message: String,
    /// Serialized call-stack at capture time
    pub stack_trace: String,
}

impl ExceptionRecord {
    pub fn new(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            utc_ms: utc_now_ms(),
            timezone_offset_ms: timezone_offset_ms(),
            component: component.into(),
            message: message.into(),
            stack_trace: Backtrace::force_capture().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_snapshot() -> TriggerSnapshot {
        TriggerSnapshot {
            size: 0,
            timer_started_at_ms: 0,
            timer_expires_in_ms: 0,
            sync_response: None,
        }
    }

    #[test]
    fn test_overview_finalize() {
        let mut overview = SyncOverview::open(
            "Track needs to sync.",
            empty_snapshot(),
            empty_snapshot(),
            BTreeMap::new(),
        );
        assert!(!overview.is_finalized());
        assert_eq!(overview.total_sync_time_ms, -1);

        overview.finalize();
        assert!(overview.is_finalized());
        assert!(overview.total_sync_time_ms >= 0);
    }

    #[test]
    fn test_cartridge_response_ignored_for_unknown_action() {
        let mut overview = SyncOverview::open(
            "Cartridge taskCompleted needs to sync.",
            empty_snapshot(),
            empty_snapshot(),
            BTreeMap::new(),
        );
        overview.set_cartridge_response(
            "taskCompleted",
            StageResponse {
                utc_ms: 0,
                round_trip_ms: 1,
                status: StageStatus::Success,
                error: None,
            },
        );
        assert!(overview.cartridges.is_empty());
    }

    #[test]
    fn test_exception_record_captures_stack() {
        let record = ExceptionRecord::new("TrackQueue", "persist failed");
        assert_eq!(record.component, "TrackQueue");
        assert!(!record.stack_trace.is_empty());
    }
}
