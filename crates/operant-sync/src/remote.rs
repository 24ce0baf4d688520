//! Remote service boundary
//!
//! [`RemoteDecisionService`] is the narrow interface to the remote
//! reinforcement service: track, report, refresh-cartridge, and telemetry
//! uploads. [`HttpRemote`] is the production JSON-over-HTTP
//! implementation; [`MockRemote`] scripts responses for tests.
//!
//! Remote status codes collapse into three classes per stage: success,
//! rejected (data judged permanently invalid for the current
//! configuration), and everything else (a halting failure).

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use operant_common::{
    ActionRecord, ExceptionRecord, OperantError, Result, StageResponse, StageStatus, SyncOverview,
};
use operant_common::time::utc_now_ms;

/// Per-stage synchronization outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Batch uploaded and local state cleared
    Success,
    /// Nothing queued; timer reset, no network call made
    NothingToSync,
    /// Remote judged the data permanently invalid; local state discarded
    ServerRejected,
    /// Transport failure or unexpected response; local state untouched
    Halt,
    /// Another sync attempt for this resource is already in flight
    AlreadyRunning,
}

/// Remote response status, collapsed into stage-relevant classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteStatus {
    Success,
    Rejected,
    Other(i64),
}

impl RemoteStatus {
    /// Interpret an HTTP-style status code
    pub fn from_code(code: i64) -> Self {
        match code {
            200..=299 => RemoteStatus::Success,
            400..=499 => RemoteStatus::Rejected,
            other => RemoteStatus::Other(other),
        }
    }
}

/// Response to a track upload
#[derive(Debug, Clone)]
pub struct TrackResponse {
    pub status: RemoteStatus,
    pub error: Option<String>,
}

/// Response to a report upload
#[derive(Debug, Clone)]
pub struct ReportResponse {
    pub status: RemoteStatus,
    pub error: Option<String>,
}

/// Response to a cartridge refresh
#[derive(Debug, Clone)]
pub struct RefreshResponse {
    pub status: RemoteStatus,
    /// Fresh decision batch, front of the vec served first
    pub decisions: Vec<String>,
    /// Cartridge expiry duration in milliseconds
    pub expires_in_ms: i64,
    pub error: Option<String>,
}

/// Response to a telemetry upload
#[derive(Debug, Clone)]
pub struct TelemetryResponse {
    pub status: RemoteStatus,
    pub error: Option<String>,
}

/// Result of one sync stage: the outcome plus what the overview needs
#[derive(Debug, Clone)]
pub struct StageResult {
    pub outcome: Outcome,
    pub error: Option<String>,
    /// Stage start, UTC milliseconds
    pub started_at_ms: i64,
    pub round_trip_ms: i64,
}

impl StageResult {
    pub fn finish(outcome: Outcome, error: Option<String>, started_at_ms: i64) -> Self {
        Self {
            outcome,
            error,
            started_at_ms,
            round_trip_ms: utc_now_ms() - started_at_ms,
        }
    }

    /// Convert into the form recorded in a [`SyncOverview`]
    pub fn stage_response(&self) -> StageResponse {
        let status = match self.outcome {
            Outcome::Success => StageStatus::Success,
            Outcome::NothingToSync => StageStatus::NothingToSync,
            Outcome::ServerRejected => StageStatus::Rejected,
            Outcome::Halt => StageStatus::Failed,
            Outcome::AlreadyRunning => StageStatus::Skipped,
        };
        StageResponse {
            utc_ms: self.started_at_ms,
            round_trip_ms: self.round_trip_ms,
            status,
            error: self.error.clone(),
        }
    }
}

/// Network boundary to the remote reinforcement service
#[async_trait]
pub trait RemoteDecisionService: Send + Sync {
    async fn track(&self, records: &[ActionRecord]) -> Result<TrackResponse>;

    async fn report(&self, records: &[ActionRecord]) -> Result<ReportResponse>;

    async fn refresh_cartridge(&self, action_id: &str) -> Result<RefreshResponse>;

    async fn upload_telemetry(
        &self,
        overviews: &[SyncOverview],
        exceptions: &[ExceptionRecord],
    ) -> Result<TelemetryResponse>;
}

// --- HTTP implementation ---

#[derive(Serialize)]
struct TrackRequest<'a> {
    actions: &'a [ActionRecord],
}

#[derive(Serialize)]
struct ReportRequest<'a> {
    actions: &'a [ActionRecord],
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    action_id: &'a str,
}

#[derive(Serialize)]
struct TelemetryRequest<'a> {
    sync_overviews: &'a [SyncOverview],
    exceptions: &'a [ExceptionRecord],
}

#[derive(Deserialize)]
struct WireResponse {
    status: i64,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    decisions: Option<Vec<String>>,
    #[serde(default)]
    expires_in_ms: Option<i64>,
}

/// JSON-over-HTTP remote service client
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OperantError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<WireResponse> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .map_err(|e| OperantError::Network(e.to_string()))?;
        response
            .json::<WireResponse>()
            .await
            .map_err(|e| OperantError::Network(format!("malformed response: {e}")))
    }
}

#[async_trait]
impl RemoteDecisionService for HttpRemote {
    async fn track(&self, records: &[ActionRecord]) -> Result<TrackResponse> {
        let wire = self.post("/track", &TrackRequest { actions: records }).await?;
        Ok(TrackResponse {
            status: RemoteStatus::from_code(wire.status),
            error: wire.error,
        })
    }

    async fn report(&self, records: &[ActionRecord]) -> Result<ReportResponse> {
        let wire = self.post("/report", &ReportRequest { actions: records }).await?;
        Ok(ReportResponse {
            status: RemoteStatus::from_code(wire.status),
            error: wire.error,
        })
    }

    async fn refresh_cartridge(&self, action_id: &str) -> Result<RefreshResponse> {
        let wire = self.post("/refresh", &RefreshRequest { action_id }).await?;
        let status = RemoteStatus::from_code(wire.status);
        match (status, wire.decisions, wire.expires_in_ms) {
            (RemoteStatus::Success, Some(decisions), Some(expires_in_ms)) => Ok(RefreshResponse {
                status,
                decisions,
                expires_in_ms,
                error: wire.error,
            }),
            (RemoteStatus::Success, _, _) => Ok(RefreshResponse {
                status: RemoteStatus::Other(0),
                decisions: Vec::new(),
                expires_in_ms: 0,
                error: Some("refresh response missing decisions or expiry".into()),
            }),
            (status, _, _) => Ok(RefreshResponse {
                status,
                decisions: Vec::new(),
                expires_in_ms: 0,
                error: wire.error,
            }),
        }
    }

    async fn upload_telemetry(
        &self,
        overviews: &[SyncOverview],
        exceptions: &[ExceptionRecord],
    ) -> Result<TelemetryResponse> {
        let wire = self
            .post(
                "/telemetry",
                &TelemetryRequest {
                    sync_overviews: overviews,
                    exceptions,
                },
            )
            .await?;
        Ok(TelemetryResponse {
            status: RemoteStatus::from_code(wire.status),
            error: wire.error,
        })
    }
}

// --- scripted test double ---

/// Scripted remote for tests. Responses are popped per endpoint; an empty
/// script answers `Success` (refresh succeeds with an empty batch).
#[derive(Default)]
pub struct MockRemote {
    track_script: Mutex<VecDeque<Result<TrackResponse>>>,
    report_script: Mutex<VecDeque<Result<ReportResponse>>>,
    refresh_script: Mutex<VecDeque<Result<RefreshResponse>>>,
    telemetry_script: Mutex<VecDeque<Result<TelemetryResponse>>>,
    track_calls: Mutex<Vec<Vec<ActionRecord>>>,
    report_calls: Mutex<Vec<Vec<ActionRecord>>>,
    refresh_calls: Mutex<Vec<String>>,
    telemetry_calls: Mutex<Vec<(usize, usize)>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_track_status(&self, status: RemoteStatus) {
        self.track_script
            .lock()
            .push_back(Ok(TrackResponse { status, error: None }));
    }

    pub fn push_track_error(&self, message: impl Into<String>) {
        self.track_script
            .lock()
            .push_back(Err(OperantError::Network(message.into())));
    }

    pub fn push_report_status(&self, status: RemoteStatus) {
        self.report_script
            .lock()
            .push_back(Ok(ReportResponse { status, error: None }));
    }

    pub fn push_report_error(&self, message: impl Into<String>) {
        self.report_script
            .lock()
            .push_back(Err(OperantError::Network(message.into())));
    }

    pub fn push_refresh(&self, decisions: Vec<&str>, expires_in_ms: i64) {
        self.refresh_script.lock().push_back(Ok(RefreshResponse {
            status: RemoteStatus::Success,
            decisions: decisions.into_iter().map(String::from).collect(),
            expires_in_ms,
            error: None,
        }));
    }

    pub fn push_refresh_status(&self, status: RemoteStatus) {
        self.refresh_script.lock().push_back(Ok(RefreshResponse {
            status,
            decisions: Vec::new(),
            expires_in_ms: 0,
            error: None,
        }));
    }

    pub fn push_refresh_error(&self, message: impl Into<String>) {
        self.refresh_script
            .lock()
            .push_back(Err(OperantError::Network(message.into())));
    }

    pub fn push_telemetry_status(&self, status: RemoteStatus) {
        self.telemetry_script
            .lock()
            .push_back(Ok(TelemetryResponse { status, error: None }));
    }

    pub fn track_calls(&self) -> Vec<Vec<ActionRecord>> {
        self.track_calls.lock().clone()
    }

    pub fn report_calls(&self) -> Vec<Vec<ActionRecord>> {
        self.report_calls.lock().clone()
    }

    pub fn refresh_calls(&self) -> Vec<String> {
        self.refresh_calls.lock().clone()
    }

    /// (overview count, exception count) per telemetry upload
    pub fn telemetry_calls(&self) -> Vec<(usize, usize)> {
        self.telemetry_calls.lock().clone()
    }
}

#[async_trait]
impl RemoteDecisionService for MockRemote {
    async fn track(&self, records: &[ActionRecord]) -> Result<TrackResponse> {
        self.track_calls.lock().push(records.to_vec());
        self.track_script.lock().pop_front().unwrap_or(Ok(TrackResponse {
            status: RemoteStatus::Success,
            error: None,
        }))
    }

    async fn report(&self, records: &[ActionRecord]) -> Result<ReportResponse> {
        self.report_calls.lock().push(records.to_vec());
        self.report_script.lock().pop_front().unwrap_or(Ok(ReportResponse {
            status: RemoteStatus::Success,
            error: None,
        }))
    }

    async fn refresh_cartridge(&self, action_id: &str) -> Result<RefreshResponse> {
        self.refresh_calls.lock().push(action_id.to_string());
        self.refresh_script
            .lock()
            .pop_front()
            .unwrap_or(Ok(RefreshResponse {
                status: RemoteStatus::Success,
                decisions: Vec::new(),
                expires_in_ms: 600_000,
                error: None,
            }))
    }

    async fn upload_telemetry(
        &self,
        overviews: &[SyncOverview],
        exceptions: &[ExceptionRecord],
    ) -> Result<TelemetryResponse> {
        self.telemetry_calls
            .lock()
            .push((overviews.len(), exceptions.len()));
        self.telemetry_script
            .lock()
            .pop_front()
            .unwrap_or(Ok(TelemetryResponse {
                status: RemoteStatus::Success,
                error: None,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_code() {
        assert_eq!(RemoteStatus::from_code(200), RemoteStatus::Success);
        assert_eq!(RemoteStatus::from_code(204), RemoteStatus::Success);
        assert_eq!(RemoteStatus::from_code(400), RemoteStatus::Rejected);
        assert_eq!(RemoteStatus::from_code(404), RemoteStatus::Rejected);
        assert_eq!(RemoteStatus::from_code(500), RemoteStatus::Other(500));
    }

    #[test]
    fn test_stage_result_maps_outcomes() {
        let result = StageResult::finish(Outcome::ServerRejected, None, utc_now_ms());
        assert_eq!(result.stage_response().status, StageStatus::Rejected);

        let result = StageResult::finish(Outcome::Halt, Some("timeout".into()), utc_now_ms());
        let response = result.stage_response();
        assert_eq!(response.status, StageStatus::Failed);
        assert_eq!(response.error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_mock_remote_scripts_and_records() {
        let mock = MockRemote::new();
        mock.push_track_status(RemoteStatus::Rejected);

        let records = vec![ActionRecord::new("taskCompleted")];
        let response = mock.track(&records).await.unwrap();
        assert_eq!(response.status, RemoteStatus::Rejected);

        // unscripted call falls back to success
        let response = mock.track(&records).await.unwrap();
        assert_eq!(response.status, RemoteStatus::Success);
        assert_eq!(mock.track_calls().len(), 2);
    }
}
