//! Caller-facing client
//!
//! `Operant` wires the queues, the cartridge registry, the telemetry
//! recorder, and the coordinator into one explicitly constructed service
//! object. All entry points are fire-and-forget: they mutate local
//! durable state and at most schedule a background sync; they never
//! block on the network and never surface transport errors to callers.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use operant_common::time::utc_now_ms;
use operant_common::{ActionRecord, OperantConfig, VersionHandle};

use crate::cartridge::CartridgeRegistry;
use crate::coordinator::SyncCoordinator;
use crate::queue::{ActionQueue, QueueKind};
use crate::remote::RemoteDecisionService;
use crate::storage::SnapshotStore;
use crate::telemetry::TelemetryRecorder;

pub struct Operant {
    config: OperantConfig,
    version: VersionHandle,
    track: Arc<ActionQueue>,
    report: Arc<ActionQueue>,
    cartridges: Arc<CartridgeRegistry>,
    telemetry: Arc<TelemetryRecorder>,
    coordinator: Arc<SyncCoordinator>,
}

impl Operant {
    /// Build a client, rehydrating all durable state from `store`.
    /// The client starts un-configured; tracked actions are dropped
    /// until `set_configuration_version` is called.
    pub async fn new(
        config: OperantConfig,
        store: Arc<dyn SnapshotStore>,
        remote: Arc<dyn RemoteDecisionService>,
    ) -> Self {
        let version = VersionHandle::new();
        let track = Arc::new(
            ActionQueue::open(
                QueueKind::Track,
                config.track_batch_size,
                config.queue_timer_ms,
                version.clone(),
                store.clone(),
            )
            .await,
        );
        let report = Arc::new(
            ActionQueue::open(
                QueueKind::Report,
                config.report_batch_size,
                config.queue_timer_ms,
                version.clone(),
                store.clone(),
            )
            .await,
        );
        let cartridges = Arc::new(CartridgeRegistry::open(version.clone(), store.clone()).await);
        let telemetry = Arc::new(TelemetryRecorder::open(store).await);
        let coordinator = Arc::new(SyncCoordinator::new(
            config.clone(),
            track.clone(),
            report.clone(),
            cartridges.clone(),
            telemetry.clone(),
            remote,
        ));
        Self {
            config,
            version,
            track,
            report,
            cartridges,
            telemetry,
            coordinator,
        }
    }

    /// Mark the client configured. Gates track triggering and stamps
    /// newly refreshed cartridges and report batches.
    pub fn set_configuration_version(&self, version: impl Into<String>) {
        self.version.set(version);
    }

    pub fn is_configured(&self) -> bool {
        self.version.is_configured()
    }

    /// Record an occurrence of an action. Invalid input is logged and
    /// recorded as an exception instead of being returned.
    #[instrument(skip(self, metadata))]
    pub async fn track(
        &self,
        action_id: &str,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    ) {
        let mut record = ActionRecord::new(action_id);
        if let Some(metadata) = metadata {
            record = record.with_metadata(metadata);
        }
        if let Err(err) = record.validate() {
            warn!(action_id, %err, "Dropping invalid tracked action");
            self.telemetry
                .store_exception("Operant::track", &err.to_string())
                .await;
            return;
        }
        self.track.add(record).await;
        self.coordinator.request_sync();
    }

    /// Record a reinforced occurrence of an action together with the
    /// decision that was delivered for it.
    #[instrument(skip(self, metadata))]
    pub async fn report(
        &self,
        action_id: &str,
        decision: &str,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    ) {
        let mut record = ActionRecord::new(action_id).with_decision(decision);
        if let Some(metadata) = metadata {
            record = record.with_metadata(metadata);
        }
        if let Err(err) = record.validate() {
            warn!(action_id, %err, "Dropping invalid reported action");
            self.telemetry
                .store_exception("Operant::report", &err.to_string())
                .await;
            return;
        }
        self.report.add(record).await;
        self.coordinator.request_sync();
    }

    /// Pop the next prefetched decision for an action, falling back to
    /// the configured default when the cartridge is empty or stale.
    /// Looking up an unknown action creates its cartridge and schedules
    /// a sync to fill it.
    #[instrument(skip(self))]
    pub async fn next_decision(&self, action_id: &str) -> String {
        let (cartridge, created) = self.cartridges.get_or_create(action_id).await;
        let decision = cartridge.next(&self.config.default_decision).await;
        if created || cartridge.is_triggered(utc_now_ms()).await {
            debug!(action_id, "Cartridge wants a refill");
            self.coordinator.request_sync();
        }
        decision
    }

    /// Request a background synchronization run; returns whether one was
    /// scheduled (false while one is already pending or executing).
    pub fn perform_sync(&self) -> bool {
        self.coordinator.request_sync()
    }

    pub fn is_syncing(&self) -> bool {
        self.coordinator.is_syncing()
    }

    /// Identity reset: erase every queue, cartridge, and telemetry list,
    /// both in memory and in durable storage.
    pub async fn flush_all(&self) {
        debug!("Flushing all client state");
        self.track.flush().await;
        self.report.flush().await;
        self.cartridges.flush().await;
        self.telemetry.flush().await;
        self.version.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockRemote;
    use crate::storage::MemorySnapshotStore;
    use operant_common::DEFAULT_DECISION;
    use std::time::Duration;
    use tokio::time::sleep;

    async fn client() -> (Operant, Arc<MockRemote>, Arc<MemorySnapshotStore>) {
        let store = Arc::new(MemorySnapshotStore::new());
        let remote = Arc::new(MockRemote::new());
        let mut config = OperantConfig::default().with_zero_delays();
        config.track_batch_size = 2;
        config.report_batch_size = 2;
        let operant = Operant::new(config, store.clone(), remote.clone()).await;
        (operant, remote, store)
    }

    async fn wait_idle(operant: &Operant) {
        while operant.is_syncing() {
            sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfigured_client_never_syncs_track() {
        let (operant, remote, _) = client().await;
        operant.track("appOpened", None).await;
        operant.track("appOpened", None).await;
        operant.track("appOpened", None).await;
        wait_idle(&operant).await;

        assert!(remote.track_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_client_syncs_at_threshold() {
        let (operant, remote, _) = client().await;
        operant.set_configuration_version("v42");
        operant.track("appOpened", None).await;
        operant.track("appOpened", None).await;
        wait_idle(&operant).await;

        let calls = remote.track_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_action_recorded_as_exception() {
        let (operant, remote, _) = client().await;
        operant.set_configuration_version("v42");
        operant.track("", None).await;
        wait_idle(&operant).await;

        assert!(remote.track_calls().is_empty());
        let (_, exceptions) = operant.telemetry.pending_counts().await;
        assert_eq!(exceptions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_decision_defaults_and_schedules_refill() {
        let (operant, remote, _) = client().await;
        operant.set_configuration_version("v42");
        remote.push_refresh(vec!["thumbsUp", "stars", "goldStar", "balloons"], 600_000);

        // empty cartridge: caller gets the default immediately
        let decision = operant.next_decision("taskCompleted").await;
        assert_eq!(decision, DEFAULT_DECISION);
        wait_idle(&operant).await;

        // refill landed in the background
        assert_eq!(remote.refresh_calls(), vec!["taskCompleted".to_string()]);
        assert_eq!(operant.next_decision("taskCompleted").await, "thumbsUp");
        assert_eq!(operant.next_decision("taskCompleted").await, "stars");
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_all_resets_identity() {
        let (operant, _, store) = client().await;
        operant.set_configuration_version("v42");
        operant.report("taskCompleted", "stars", None).await;
        operant.next_decision("taskCompleted").await;
        wait_idle(&operant).await;

        operant.flush_all().await;
        assert_eq!(operant.report.len().await, 0);
        assert_eq!(operant.cartridges.len().await, 0);
        assert!(!operant.is_configured());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_survives_restart() {
        let store: Arc<MemorySnapshotStore> = Arc::new(MemorySnapshotStore::new());
        let remote = Arc::new(MockRemote::new());
        let config = OperantConfig::default().with_zero_delays();
        {
            let operant = Operant::new(config.clone(), store.clone(), remote.clone()).await;
            operant.set_configuration_version("v42");
            operant.track("appOpened", None).await;
            operant.report("taskCompleted", "stars", None).await;
            wait_idle(&operant).await;
        }

        let operant = Operant::new(config, store, remote).await;
        operant.set_configuration_version("v42");
        assert_eq!(operant.track.len().await, 1);
        assert_eq!(operant.report.len().await, 1);
    }
}
