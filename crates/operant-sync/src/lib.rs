//! # Operant Sync
//!
//! Local event-queueing and decision-prefetch synchronization for the
//! Operant reinforcement client.
//!
//! ## Components
//!
//! - [`queue::ActionQueue`]: durable FIFO queues of action records with
//!   size/age sync triggers (track and report)
//! - [`cartridge::Cartridge`] / [`cartridge::CartridgeRegistry`]:
//!   per-action prefetched decision queues with capacity/age refill
//!   triggers
//! - [`coordinator::SyncCoordinator`]: drives the staged synchronization
//!   protocol (track, then report, then cartridges) against the remote
//! - [`telemetry::TelemetryRecorder`]: queues sync overviews and exception
//!   records, uploaded best-effort
//! - [`storage::SnapshotStore`]: whole-object snapshot persistence seam
//! - [`remote::RemoteDecisionService`]: the network boundary
//! - [`client::Operant`]: the caller-facing entry points
//!
//! Every component mutates its state only through its own sequential
//! context; failures never propagate synchronously to the host
//! application.

pub mod cartridge;
pub mod client;
pub mod coordinator;
pub mod queue;
pub mod remote;
pub mod storage;
pub mod telemetry;

pub use cartridge::{Cartridge, CartridgeRegistry};
pub use client::Operant;
pub use coordinator::SyncCoordinator;
pub use queue::{ActionQueue, QueueKind};
pub use remote::{
    HttpRemote, MockRemote, Outcome, RefreshResponse, RemoteDecisionService, RemoteStatus,
    ReportResponse, StageResult, TelemetryResponse, TrackResponse,
};
pub use storage::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
pub use telemetry::TelemetryRecorder;
