//! Common shape of records stored in a work queue.

use crate::{RunState, Time};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Field names shared by every queue record.
pub mod fields {
    /// Store-assigned id.
    pub const ID: &str = "id";
    /// Current [`RunState`](crate::RunState), stored as its ordinal.
    pub const STATE: &str = "state";
    /// When the record is next due, stored as epoch milliseconds.
    pub const DUE_AT: &str = "due_at";
    /// When work started.
    pub const STARTED_AT: &str = "started_at";
    /// When the record reached a terminal state.
    pub const ENDED_AT: &str = "ended_at";
}

/// A record that can live in a `Queue`.
///
/// Records are plain serde structs; the queue reads and writes the common
/// fields through this trait and through [`fields`] in store patches.
pub trait QueueRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Store-assigned id (empty before insertion).
    fn id(&self) -> &str;

    /// Replace the id.
    fn set_id(&mut self, id: String);

    /// Current run state.
    fn state(&self) -> RunState;

    /// Set the run state.
    fn set_state(&mut self, state: RunState);

    /// When the record is next due, if scheduled.
    fn due_at(&self) -> Option<Time>;

    /// Set the due time.
    fn set_due_at(&mut self, due_at: Time);

    /// Record the start of work.
    fn set_started_at(&mut self, started_at: Time);
}

/// Encode a due time the way it is persisted.
pub fn due_value(due_at: Time) -> Value {
    Value::from(due_at.timestamp_millis())
}

/// Encode a state the way it is persisted.
pub fn state_value(state: RunState) -> Value {
    Value::from(state.ordinal())
}

/// Encode a plain timestamp the way it is persisted.
pub fn time_value(time: Time) -> Value {
    Value::String(time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
}
