//! Event processing core for the TestPulse telemetry pipeline.
//!
//! Producers (test executors and load agents) enqueue
//! [`testpulse_types::TelemetryEvent`]s through a [`TelemetryChannel`];
//! one consumer task replays them against a
//! [`testpulse_store::PersistenceGateway`], enforcing the run → suite →
//! testcase lifecycle, pairing checkpoints per worker thread, batching
//! high-volume rows, and degrading gracefully when entities are deleted
//! out from under a running session.

pub mod cache;
pub mod config;
pub mod consumer;
pub mod error;
pub mod lifecycle;
pub mod processor;
pub mod registry;

pub use cache::{BatchedWriteCache, CheckpointSummaryCache};
pub use config::DbLogConfig;
pub use consumer::TelemetryChannel;
pub use error::{ProcessingError, ProcessingResult, RegistryError};
pub use lifecycle::{LifecyclePhase, LifecycleState};
pub use processor::{EventProcessor, LifecycleListener};
pub use registry::CheckpointRegistry;
