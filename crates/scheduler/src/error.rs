//! Scheduler errors.

use crate::substrate::SubstrateError;
use factory_queue::QueueError;
use factory_recipe::RecipeError;
use factory_storage::StoreError;

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors that can occur while scheduling jobs.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Queue operation failed
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Store operation failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Recipe didn't compile
    #[error(transparent)]
    Recipe(#[from] RecipeError),

    /// Execution substrate failed
    #[error("Substrate error: {0}")]
    Substrate(#[from] SubstrateError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Recipe id isn't a plain name
    #[error("Invalid recipe id: {0}")]
    InvalidRecipeId(String),

    /// No such job
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Job is still active
    #[error("Job is still active: {0}")]
    JobActive(String),
}
