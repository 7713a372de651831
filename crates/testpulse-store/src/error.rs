//! Store error taxonomy.

use thiserror::Error;

/// Errors produced by a [`crate::PersistenceGateway`] backend.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A child row referenced a parent entity that no longer exists.
    /// This is the signal the processor uses to detect entities deleted
    /// behind its back, so backends must report it structurally rather
    /// than as a generic constraint failure.
    #[error("{entity} {id} is not present in the store")]
    MissingParent { entity: &'static str, id: i64 },

    /// The backend could not be reached or a connection was lost.
    #[error("store connection failed: {0}")]
    Connection(String),

    /// A constraint other than a missing parent was violated.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// An entity a read operation asked for does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// True when the error means "a parent entity has been deleted".
    pub fn is_missing_parent(&self) -> bool {
        matches!(self, StoreError::MissingParent { .. })
    }

    /// True when the error is a connectivity problem worth logging once
    /// rather than per event.
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
