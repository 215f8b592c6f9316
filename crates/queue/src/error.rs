//! Queue errors.

use factory_storage::StoreError;

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors that can occur during queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Underlying store failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Record didn't convert to or from a document
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Record serialized to something other than an object
    #[error("Record is not a JSON object: {0}")]
    NotAnObject(String),

    /// Record vanished while it was being handled
    #[error("Record not found: {0}")]
    NotFound(String),
}
