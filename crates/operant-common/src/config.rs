//! Client configuration
//!
//! The original generation of this subsystem read its tuning values from
//! global singletons; here the host application constructs an
//! [`OperantConfig`] once and injects it. The remote configuration version
//! is the one late-bound value: it becomes known only after the first
//! successful handshake with the remote service, so it lives behind a
//! shared [`VersionHandle`].

use std::sync::Arc;

use parking_lot::RwLock;

use crate::{DEFAULT_BATCH_SIZE, DEFAULT_DECISION, DEFAULT_QUEUE_TIMER_MS};

/// Tuning knobs for the sync subsystem
#[derive(Debug, Clone)]
pub struct OperantConfig {
    /// Tracked actions needed to trigger a sync
    pub track_batch_size: usize,
    /// Reported actions needed to trigger a sync
    pub report_batch_size: usize,
    /// Queue age timer in milliseconds
    pub queue_timer_ms: i64,
    /// Decision handed out when a cartridge is empty or expired
    pub default_decision: String,
    /// Delay before a requested sync actually runs, batching
    /// near-simultaneous trigger calls into one run
    pub coordination_delay_ms: u64,
    /// Pacing delay after the track stage
    pub track_stage_delay_ms: u64,
    /// Pacing delay after the report stage
    pub report_stage_delay_ms: u64,
    /// Pacing delay after the cartridge stage
    pub cartridge_stage_delay_ms: u64,
}

impl Default for OperantConfig {
    fn default() -> Self {
        Self {
            track_batch_size: DEFAULT_BATCH_SIZE,
            report_batch_size: DEFAULT_BATCH_SIZE,
            queue_timer_ms: DEFAULT_QUEUE_TIMER_MS,
            default_decision: DEFAULT_DECISION.to_string(),
            coordination_delay_ms: 5_000,
            track_stage_delay_ms: 1_000,
            report_stage_delay_ms: 5_000,
            cartridge_stage_delay_ms: 3_000,
        }
    }
}

impl OperantConfig {
    /// Configuration with all delays collapsed to zero, for tests and
    /// latency-sensitive embedding
    pub fn with_zero_delays(mut self) -> Self {
        self.coordination_delay_ms = 0;
        self.track_stage_delay_ms = 0;
        self.report_stage_delay_ms = 0;
        self.cartridge_stage_delay_ms = 0;
        self
    }
}

/// Shared handle to the current remote configuration version.
///
/// Un-configured clients (version not yet obtained) must not buffer
/// tracked actions indefinitely against an unknown schema; cartridges are
/// stamped with the version they were filled under and invalidated
/// wholesale when it changes.
#[derive(Debug, Clone, Default)]
pub struct VersionHandle {
    inner: Arc<RwLock<Option<String>>>,
}

impl VersionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle pre-set to a version, for tests and restored sessions
    pub fn with_version(version: impl Into<String>) -> Self {
        let handle = Self::new();
        handle.set(version);
        handle
    }

    pub fn set(&self, version: impl Into<String>) {
        *self.inner.write() = Some(version.into());
    }

    pub fn get(&self) -> Option<String> {
        self.inner.read().clone()
    }

    pub fn is_configured(&self) -> bool {
        self.inner.read().is_some()
    }

    pub fn clear(&self) {
        *self.inner.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OperantConfig::default();
        assert_eq!(config.track_batch_size, 15);
        assert_eq!(config.queue_timer_ms, 172_800_000);
        assert_eq!(config.default_decision, "neutralResponse");
    }

    #[test]
    fn test_version_handle_shared() {
        let handle = VersionHandle::new();
        let clone = handle.clone();
        assert!(!clone.is_configured());

        handle.set("v42");
        assert_eq!(clone.get().as_deref(), Some("v42"));
        assert!(clone.is_configured());

        clone.clear();
        assert!(!handle.is_configured());
    }
}
