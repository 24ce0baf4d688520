//! Sync coordinator
//!
//! Drives one end-to-end synchronization run across the track queue, the
//! report queue, and every triggered cartridge, in that order. The order
//! is a priority cascade: needing a cartridge refill implies needing a
//! report sync implies needing a track sync, because later stages depend
//! on a consistent server-side view built from earlier ones.
//!
//! A requested sync runs after a short coordination delay so that
//! near-simultaneous trigger calls from multiple callers collapse into
//! one run. Each stage is followed by a fixed pacing delay tuned to let
//! the remote side settle; the delay is a wall-clock pace, not a join.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use operant_common::time::utc_now_ms;
use operant_common::{OperantConfig, SyncOverview};

use crate::cartridge::CartridgeRegistry;
use crate::queue::ActionQueue;
use crate::remote::{Outcome, RemoteDecisionService};
use crate::telemetry::TelemetryRecorder;

/// Orchestrates the staged synchronization protocol
pub struct SyncCoordinator {
    config: OperantConfig,
    track: Arc<ActionQueue>,
    report: Arc<ActionQueue>,
    cartridges: Arc<CartridgeRegistry>,
    telemetry: Arc<TelemetryRecorder>,
    remote: Arc<dyn RemoteDecisionService>,
    sync_in_flight: AtomicBool,
    rerun_requested: AtomicBool,
}

impl SyncCoordinator {
    pub fn new(
        config: OperantConfig,
        track: Arc<ActionQueue>,
        report: Arc<ActionQueue>,
        cartridges: Arc<CartridgeRegistry>,
        telemetry: Arc<TelemetryRecorder>,
        remote: Arc<dyn RemoteDecisionService>,
    ) -> Self {
        Self {
            config,
            track,
            report,
            cartridges,
            telemetry,
            remote,
            sync_in_flight: AtomicBool::new(false),
            rerun_requested: AtomicBool::new(false),
        }
    }

    /// Request a synchronization run; returns whether this call
    /// scheduled one. The actual run happens after the coordination
    /// delay, re-evaluating triggers at run time since state may have
    /// changed during the wait.
    ///
    /// A request arriving while a run is scheduled or executing is
    /// coalesced: the in-flight run re-evaluates triggers on entry, and
    /// a request it cannot absorb (the run already past evaluation)
    /// causes one follow-up run before the slot is released.
    pub fn request_sync(self: &Arc<Self>) -> bool {
        if self
            .sync_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sync already in flight; coalescing");
            self.rerun_requested.store(true, Ordering::Release);
            return false;
        }
        let coordinator = self.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(coordinator.config.coordination_delay_ms)).await;
            loop {
                // requests made before this point are satisfied by the
                // trigger re-evaluation inside run()
                coordinator.rerun_requested.store(false, Ordering::Release);
                coordinator.run().await;
                if !coordinator.rerun_requested.load(Ordering::Acquire) {
                    break;
                }
                debug!("Request arrived mid-run; running again");
            }
            coordinator.sync_in_flight.store(false, Ordering::Release);
        });
        true
    }

    /// Whether a run is currently scheduled or executing
    pub fn is_syncing(&self) -> bool {
        self.sync_in_flight.load(Ordering::Acquire)
    }

    async fn run(&self) {
        // Re-evaluate lazily; a cartridge may have been triggered during
        // the coordination delay.
        let now = utc_now_ms();
        let triggered = self.cartridges.triggered(now).await;
        let cartridge_due = triggered.first().cloned();
        let report_due = cartridge_due.is_some() || self.report.is_triggered(now).await;
        let track_due = report_due || self.track.is_triggered(now).await;
        if !track_due {
            debug!("Nothing triggered; sync run ends");
            return;
        }

        let cause = if let Some(cartridge) = &cartridge_due {
            format!("Cartridge {} needs to sync.", cartridge.action_id())
        } else if report_due {
            "Report needs to sync.".to_string()
        } else {
            "Track needs to sync.".to_string()
        };
        debug!(cause, "Starting sync run");

        let mut overview = SyncOverview::open(
            cause,
            self.track.trigger_snapshot().await,
            self.report.trigger_snapshot().await,
            self.cartridges.snapshots().await,
        );

        // Track stage. A rejected batch was already discarded by the
        // queue; only transport/server failures halt the run.
        let result = self.track.sync(self.remote.as_ref()).await;
        overview.set_track_response(result.stage_response());
        if result.outcome == Outcome::Halt {
            self.finish_failed(overview, "TrackQueue", result.error).await;
            return;
        }
        sleep(Duration::from_millis(self.config.track_stage_delay_ms)).await;

        if report_due {
            // A rejected report batch is discarded but the run continues
            // to the cartridge stage.
            let result = self.report.sync(self.remote.as_ref()).await;
            overview.set_report_response(result.stage_response());
            if result.outcome == Outcome::Halt {
                self.finish_failed(overview, "ReportQueue", result.error).await;
                return;
            }
            sleep(Duration::from_millis(self.config.report_stage_delay_ms)).await;
        }

        // Cartridge stage. Re-enumerate: new cartridges may have become
        // triggered during the pacing delays.
        let now = utc_now_ms();
        for cartridge in self.cartridges.triggered(now).await {
            let result = cartridge.refresh(self.remote.as_ref()).await;
            overview.set_cartridge_response(cartridge.action_id(), result.stage_response());
            match result.outcome {
                Outcome::ServerRejected => {
                    // Action unknown to the remote; drop the cartridge and
                    // keep refreshing the rest.
                    self.cartridges.remove(cartridge.action_id()).await;
                }
                Outcome::Halt => {
                    let component = format!("Cartridge {}", cartridge.action_id());
                    self.finish_failed(overview, &component, result.error).await;
                    return;
                }
                _ => {}
            }
        }
        sleep(Duration::from_millis(self.config.cartridge_stage_delay_ms)).await;

        overview.finalize();
        debug!(
            total_ms = overview.total_sync_time_ms,
            "Sync run completed"
        );
        self.telemetry.record_overview(overview).await;
        // Telemetry rides along on successful runs only; its own failures
        // never affect the run's outcome.
        let _ = self.telemetry.upload(self.remote.as_ref()).await;
    }

    async fn finish_failed(&self, mut overview: SyncOverview, component: &str, error: Option<String>) {
        warn!(component, "Sync run halted");
        overview.finalize();
        self.telemetry.record_overview(overview).await;
        let message = error.unwrap_or_else(|| "sync halted".to_string());
        self.telemetry.store_exception(component, &message).await;
    }
}
