//! Document store abstraction.

use crate::Filter;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

/// A stored JSON object. The `id` field holds the store-assigned id.
pub type Document = Map<String, Value>;

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Insert with an id that is already taken
    #[error("Duplicate id: {0}")]
    Conflict(String),

    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// One observed mutation. `old` and `new` are present only when the document
/// matched the subscription filter before and after the change respectively.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Document before the change
    pub old: Option<Document>,
    /// Document after the change
    pub new: Option<Document>,
}

/// Live feed of changes for one subscription.
///
/// Dropping the stream ends the subscription.
#[derive(Debug)]
pub struct ChangeStream {
    rx: mpsc::UnboundedReceiver<Change>,
}

impl ChangeStream {
    /// Wrap a receiver.
    pub fn new(rx: mpsc::UnboundedReceiver<Change>) -> Self {
        Self { rx }
    }

    /// Next change, or `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<Change> {
        self.rx.recv().await
    }

    /// Next change if one is already queued.
    pub fn try_recv(&mut self) -> Option<Change> {
        self.rx.try_recv().ok()
    }
}

/// Storage abstraction for queue records and logs.
///
/// Every single-document write is atomic with respect to the others, which is
/// what conditional updates rely on.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load a document by id.
    async fn get(&self, id: &str) -> Result<Option<Document>>;

    /// List documents matching the filter.
    async fn find(&self, filter: &Filter) -> Result<Vec<Document>>;

    /// Insert documents, assigning ids to those without one. Returns the
    /// stored documents.
    async fn insert(&self, docs: Vec<Document>) -> Result<Vec<Document>>;

    /// Merge `patch` into one document if it exists and satisfies `condition`.
    /// A `null` in the patch removes the field. Returns the updated document,
    /// or `None` when nothing was written.
    async fn update(
        &self,
        id: &str,
        patch: &Document,
        condition: Option<&Filter>,
    ) -> Result<Option<Document>>;

    /// Merge `patch` into every matching document. Returns the count.
    async fn update_all(&self, filter: &Filter, patch: &Document) -> Result<usize>;

    /// Delete matching documents. Returns the count.
    async fn delete(&self, filter: &Filter) -> Result<usize>;

    /// Subscribe to documents matching the filter. The stream first yields
    /// every current match (with `old` empty) and then live changes.
    async fn subscribe(&self, filter: Filter) -> Result<ChangeStream>;
}
