//! Error types for rate limiting.

use crate::deny_list::DenyListError;
use crate::storage::StorageError;

/// Errors that can occur during rate limiting.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// The limiter was configured or called in a way that can never work.
    #[error("Invalid rate limiter configuration: {0}")]
    Config(String),

    /// The algorithm keeps state in the ephemeral cache, but none was provided.
    #[error("The {algorithm} algorithm requires an ephemeral cache")]
    MissingCache {
        /// Name of the algorithm.
        algorithm: &'static str,
    },

    /// Storage backend error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The deny list could not be refreshed from its source.
    #[error("Deny list error: {0}")]
    DenyList(#[from] DenyListError),

    /// A background task panicked or was aborted.
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
