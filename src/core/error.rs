use crate::core::types::{Entity, EntityId};
use thiserror::Error;

/// Error taxonomy surfaced by every engine operation.
///
/// Errors are `Clone` so the same failure can be returned to the caller and
/// broadcast to `MutationFailed` listeners.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollectionError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Entity '{0}' not found")]
    NotFound(EntityId),

    #[error("Entity '{id}' changed elsewhere")]
    StaleWrite {
        id: EntityId,
        /// The value held by the store after the conflict was resolved.
        /// `None` when the concurrent edit removed the entity.
        current: Option<Box<Entity>>,
    },

    #[error("Network failure: {0}")]
    NetworkFailure(String),

    #[error("Entity '{0}' already has a pending mutation")]
    ConflictingMutation(EntityId),

    #[error("Mutation '{0}' is not pending")]
    UnknownMutation(String),

    #[error("Backend rejected the request: {0}")]
    Backend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, CollectionError>;

impl CollectionError {
    /// Stale writes are recoverable: the user re-reads and retries.
    pub fn is_stale_write(&self) -> bool {
        matches!(self, Self::StaleWrite { .. })
    }

    pub fn is_network_failure(&self) -> bool {
        matches!(self, Self::NetworkFailure(_))
    }
}

impl<T> From<std::sync::PoisonError<T>> for CollectionError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}
