//! Storage layer for the TestPulse telemetry pipeline.
//!
//! [`PersistenceGateway`] is the single seam between event processing and
//! the backing store: the processor speaks in entity operations and never
//! sees SQL. Two backends ship here — [`SqliteGateway`] for real
//! deployments and [`MemoryGateway`] for tests, both returning the same
//! structured [`StoreError`] taxonomy so callers can branch on missing
//! parents without string matching.

pub mod batch;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod sqlite;

pub use batch::{CheckpointAggregate, CheckpointRow, WriteBatch};
pub use error::{StoreError, StoreResult};
pub use gateway::{NewLoadQueue, NewRun, PersistenceGateway};
pub use memory::MemoryGateway;
pub use sqlite::SqliteGateway;
