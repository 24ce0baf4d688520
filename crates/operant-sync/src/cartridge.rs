//! Decision cartridges
//!
//! A [`Cartridge`] is the prefetch cache that makes decision lookup
//! non-blocking: a durable FIFO of opaque decision strings for one action
//! identifier, refilled wholesale from the remote when depleted or
//! expired. The [`CartridgeRegistry`] maps action identifiers to
//! cartridges, creating them lazily on first lookup.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use operant_common::time::utc_now_ms;
use operant_common::{
    CartridgeSnapshot, VersionHandle, CARTRIDGE_CAPACITY_FRACTION, CARTRIDGE_MINIMUM_SIZE,
};

use crate::remote::{Outcome, RemoteDecisionService, RemoteStatus, StageResult};
use crate::storage::{
    cartridge_key, load_snapshot, save_snapshot, SnapshotStore, CARTRIDGE_INDEX_KEY,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CartridgeState {
    decisions: VecDeque<String>,
    /// Decision count at last refill
    initial_size: usize,
    timer_started_at_ms: i64,
    timer_expires_in_ms: i64,
    /// Configuration version the cartridge was filled under
    stamped_version: Option<String>,
}

impl CartridgeState {
    fn empty() -> Self {
        Self {
            decisions: VecDeque::new(),
            initial_size: 0,
            timer_started_at_ms: 0,
            timer_expires_in_ms: 0,
            stamped_version: None,
        }
    }

    fn timer_expired(&self, now: i64) -> bool {
        now >= self.timer_started_at_ms + self.timer_expires_in_ms
    }

    /// Fresh means able to serve: unexpired and at least one decision left
    fn is_fresh(&self, now: i64) -> bool {
        !self.timer_expired(now) && !self.decisions.is_empty()
    }

    /// Refill wanted: hard floor, proportional depletion, or expiry.
    /// A never-refilled cartridge (initial size zero) is always due.
    fn capacity_reached(&self) -> bool {
        let count = self.decisions.len();
        if count < CARTRIDGE_MINIMUM_SIZE || self.initial_size == 0 {
            return true;
        }
        count as f64 / self.initial_size as f64 <= CARTRIDGE_CAPACITY_FRACTION
    }
}

/// Durable per-action prefetched decision queue
pub struct Cartridge {
    action_id: String,
    version: VersionHandle,
    store: Arc<dyn SnapshotStore>,
    state: Mutex<CartridgeState>,
    sync_in_flight: AtomicBool,
}

impl Cartridge {
    /// Load from durable storage, or start empty. A stored snapshot
    /// stamped with a different known configuration version is discarded
    /// and treated identically to first creation; while the version is
    /// not yet known the snapshot is kept and the stamp is re-checked at
    /// delivery time.
    pub async fn open(
        action_id: impl Into<String>,
        version: VersionHandle,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let action_id = action_id.into();
        let current = version.get();
        let state = match load_snapshot::<CartridgeState>(
            store.as_ref(),
            &cartridge_key(&action_id),
        )
        .await
        {
            Some(saved) if current.is_none() || saved.stamped_version == current => saved,
            Some(_) => {
                debug!(action_id, "Discarding stale-version cartridge");
                let _ = store.remove(&cartridge_key(&action_id)).await;
                CartridgeState::empty()
            }
            None => CartridgeState::empty(),
        };
        Self {
            action_id,
            version,
            store,
            state: Mutex::new(state),
            sync_in_flight: AtomicBool::new(false),
        }
    }

    pub fn action_id(&self) -> &str {
        &self.action_id
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.decisions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.decisions.is_empty()
    }

    /// Pop the next decision if the cartridge is fresh and was filled
    /// under the current configuration version; otherwise return the
    /// default decision and leave state unchanged. Never fails.
    pub async fn next(&self, default_decision: &str) -> String {
        let current = self.version.get();
        let mut state = self.state.lock().await;
        if state.is_fresh(utc_now_ms()) && state.stamped_version == current {
            // is_fresh guarantees a head element
            let decision = state.decisions.pop_front().unwrap_or_default();
            self.persist(&state).await;
            decision
        } else {
            default_decision.to_string()
        }
    }

    /// True iff the cartridge wants a refill. A known configuration
    /// version newer than the stamp forces one: the held decisions can
    /// no longer be delivered.
    pub async fn is_triggered(&self, now: i64) -> bool {
        let state = self.state.lock().await;
        if self.version.is_configured() && state.stamped_version != self.version.get() {
            return true;
        }
        state.timer_expired(now) || state.capacity_reached()
    }

    /// Request a fresh decision batch plus expiry from the remote.
    ///
    /// Success replaces the decisions wholesale and resets the trigger
    /// counters. A rejected response means the action identifier is
    /// unknown to the remote; the caller removes the cartridge from the
    /// registry. Anything else leaves state untouched and halts.
    #[instrument(skip(self, remote), fields(action_id = %self.action_id))]
    pub async fn refresh(&self, remote: &dyn RemoteDecisionService) -> StageResult {
        let started_at = utc_now_ms();
        if self
            .sync_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return StageResult::finish(Outcome::AlreadyRunning, None, started_at);
        }
        let result = self.refresh_inner(remote, started_at).await;
        self.sync_in_flight.store(false, Ordering::Release);
        result
    }

    async fn refresh_inner(
        &self,
        remote: &dyn RemoteDecisionService,
        started_at: i64,
    ) -> StageResult {
        match remote.refresh_cartridge(&self.action_id).await {
            Ok(response) => match response.status {
                RemoteStatus::Success => {
                    let mut state = self.state.lock().await;
                    state.initial_size = response.decisions.len();
                    state.decisions = response.decisions.into();
                    state.timer_started_at_ms = utc_now_ms();
                    state.timer_expires_in_ms = response.expires_in_ms;
                    state.stamped_version = self.version.get();
                    self.persist(&state).await;
                    debug!(
                        action_id = %self.action_id,
                        size = state.initial_size,
                        expires_in_ms = state.timer_expires_in_ms,
                        "Cartridge refreshed"
                    );
                    StageResult::finish(Outcome::Success, None, started_at)
                }
                RemoteStatus::Rejected => {
                    warn!(action_id = %self.action_id, "Action unknown to remote");
                    StageResult::finish(Outcome::ServerRejected, response.error, started_at)
                }
                RemoteStatus::Other(code) => {
                    warn!(action_id = %self.action_id, code, "Refresh failed; halting");
                    let error = response
                        .error
                        .or_else(|| Some(format!("remote status {code}")));
                    StageResult::finish(Outcome::Halt, error, started_at)
                }
            },
            Err(e) => {
                warn!(action_id = %self.action_id, error = %e, "Refresh failed; halting");
                StageResult::finish(Outcome::Halt, Some(e.to_string()), started_at)
            }
        }
    }

    /// Snapshot of the trigger-relevant counters for telemetry
    pub async fn trigger_snapshot(&self) -> CartridgeSnapshot {
        let state = self.state.lock().await;
        CartridgeSnapshot {
            action_id: self.action_id.clone(),
            size: state.decisions.len(),
            initial_size: state.initial_size,
            capacity_fraction: CARTRIDGE_CAPACITY_FRACTION,
            timer_started_at_ms: state.timer_started_at_ms,
            timer_expires_in_ms: state.timer_expires_in_ms,
            sync_response: None,
        }
    }

    async fn erase(&self) {
        if let Err(e) = self.store.remove(&cartridge_key(&self.action_id)).await {
            warn!(action_id = %self.action_id, error = %e, "Cartridge erase failed");
        }
    }

    async fn persist(&self, state: &CartridgeState) {
        save_snapshot(self.store.as_ref(), &cartridge_key(&self.action_id), state).await;
    }
}

/// Durable mapping of action identifier to cartridge.
///
/// All mutation goes through the registry's own sequential context; the
/// persisted form is the sorted set of known action identifiers, each
/// cartridge holding its own snapshot.
pub struct CartridgeRegistry {
    version: VersionHandle,
    store: Arc<dyn SnapshotStore>,
    cartridges: Mutex<HashMap<String, Arc<Cartridge>>>,
}

impl CartridgeRegistry {
    /// Rehydrate every cartridge named by the persisted index
    pub async fn open(version: VersionHandle, store: Arc<dyn SnapshotStore>) -> Self {
        let mut cartridges = HashMap::new();
        if let Some(index) =
            load_snapshot::<Vec<String>>(store.as_ref(), CARTRIDGE_INDEX_KEY).await
        {
            for action_id in index {
                let cartridge =
                    Cartridge::open(&action_id, version.clone(), store.clone()).await;
                cartridges.insert(action_id, Arc::new(cartridge));
            }
        }
        Self {
            version,
            store,
            cartridges: Mutex::new(cartridges),
        }
    }

    pub async fn len(&self) -> usize {
        self.cartridges.lock().await.len()
    }

    pub async fn contains(&self, action_id: &str) -> bool {
        self.cartridges.lock().await.contains_key(action_id)
    }

    /// Return the cartridge for an action, creating an empty one on first
    /// lookup. `true` in the pair means the cartridge was just created;
    /// a brand-new cartridge is always triggered, so the caller should
    /// request a sync for it.
    pub async fn get_or_create(&self, action_id: &str) -> (Arc<Cartridge>, bool) {
        let mut cartridges = self.cartridges.lock().await;
        if let Some(cartridge) = cartridges.get(action_id) {
            return (cartridge.clone(), false);
        }
        let cartridge = Arc::new(
            Cartridge::open(action_id, self.version.clone(), self.store.clone()).await,
        );
        cartridges.insert(action_id.to_string(), cartridge.clone());
        self.persist_index(&cartridges).await;
        debug!(action_id, "Created cartridge");
        (cartridge, true)
    }

    /// Remove a cartridge and erase its snapshot
    pub async fn remove(&self, action_id: &str) {
        let mut cartridges = self.cartridges.lock().await;
        if let Some(cartridge) = cartridges.remove(action_id) {
            cartridge.erase().await;
            self.persist_index(&cartridges).await;
            debug!(action_id, "Removed cartridge");
        }
    }

    /// Cartridges currently due for a refill
    pub async fn triggered(&self, now: i64) -> Vec<Arc<Cartridge>> {
        let all: Vec<Arc<Cartridge>> =
            self.cartridges.lock().await.values().cloned().collect();
        let mut due = Vec::new();
        for cartridge in all {
            if cartridge.is_triggered(now).await {
                due.push(cartridge);
            }
        }
        due
    }

    /// Trigger snapshots of every cartridge, keyed by action identifier
    pub async fn snapshots(&self) -> BTreeMap<String, CartridgeSnapshot> {
        let all: Vec<Arc<Cartridge>> =
            self.cartridges.lock().await.values().cloned().collect();
        let mut snapshots = BTreeMap::new();
        for cartridge in all {
            snapshots.insert(
                cartridge.action_id().to_string(),
                cartridge.trigger_snapshot().await,
            );
        }
        snapshots
    }

    /// Erase every cartridge along with the persisted index
    pub async fn flush(&self) {
        let mut cartridges = self.cartridges.lock().await;
        for cartridge in cartridges.values() {
            cartridge.erase().await;
        }
        cartridges.clear();
        if let Err(e) = self.store.remove(CARTRIDGE_INDEX_KEY).await {
            warn!(error = %e, "Cartridge index erase failed");
        }
    }

    async fn persist_index(&self, cartridges: &HashMap<String, Arc<Cartridge>>) {
        let mut index: Vec<&String> = cartridges.keys().collect();
        index.sort();
        save_snapshot(self.store.as_ref(), CARTRIDGE_INDEX_KEY, &index).await;
    }
}
