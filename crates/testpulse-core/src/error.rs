//! Core error taxonomy.

use testpulse_store::StoreError;
use testpulse_types::EventKind;
use thiserror::Error;

use crate::lifecycle::LifecyclePhase;

/// Errors raised while registering threads and checkpoints against load
/// queues. These are expected conditions under misbehaving producers and
/// are reported, not panicked on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("load queue '{0}' is already running")]
    LoadQueueAlreadyRunning(String),

    #[error("load queue '{0}' is not known to this session")]
    NoSuchLoadQueue(String),

    #[error("thread '{thread}' is already registered with load queue '{queue}'")]
    ThreadAlreadyRegistered { thread: String, queue: String },

    #[error("thread '{0}' is not registered with any load queue")]
    ThreadNotRegistered(String),

    #[error("thread '{thread}' already has an open checkpoint named '{name}'")]
    CheckpointAlreadyStarted { thread: String, name: String },

    #[error("thread '{thread}' has no open checkpoint named '{name}'")]
    CheckpointNotStarted { thread: String, name: String },
}

/// Errors surfaced by event processing.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("event {event} is not allowed in phase {phase}; expected {expected}")]
    PhaseViolation {
        event: EventKind,
        phase: LifecyclePhase,
        expected: &'static str,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("telemetry queue is closed")]
    QueueClosed,
}

impl ProcessingError {
    pub fn is_connection(&self) -> bool {
        matches!(self, ProcessingError::Store(e) if e.is_connection())
    }
}

pub type ProcessingResult<T> = Result<T, ProcessingError>;
