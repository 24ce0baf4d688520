//! # Operant Common
//!
//! Shared types, errors, and configuration for the Operant
//! behavioral-reinforcement client.
//!
//! ## Core Types
//!
//! - [`ActionRecord`]: one observed or reinforced behavioral event
//! - [`ExceptionRecord`]: captured internal failure, queued for telemetry
//! - [`SyncOverview`]: per-run synchronization diagnostics
//! - [`OperantConfig`]: client tuning knobs, injected at construction
//! - [`VersionHandle`]: shared handle to the remote configuration version

pub mod config;
pub mod error;
pub mod time;
pub mod types;

// Re-export commonly used types at crate root
pub use config::{OperantConfig, VersionHandle};
pub use error::{OperantError, Result};
pub use types::{
    action::ActionRecord,
    diagnostics::{
        CartridgeSnapshot, ExceptionRecord, StageResponse, StageStatus, SyncOverview,
        TriggerSnapshot,
    },
};

/// Operant version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Hard floor under which a cartridge always wants a refill
pub const CARTRIDGE_MINIMUM_SIZE: usize = 2;

/// Remaining-capacity fraction at or below which a cartridge wants a refill
pub const CARTRIDGE_CAPACITY_FRACTION: f64 = 0.25;

/// Default number of queued actions that triggers a sync
pub const DEFAULT_BATCH_SIZE: usize = 15;

/// Default queue age timer in milliseconds (48 hours)
pub const DEFAULT_QUEUE_TIMER_MS: i64 = 172_800_000;

/// Decision returned when a cartridge is empty or expired
pub const DEFAULT_DECISION: &str = "neutralResponse";
