//! Transaction handle over one queue record.

use crate::error::Result;
use crate::queue::Queue;
use factory_core::record::{due_value, fields, state_value, time_value};
use factory_core::{LogLevel, QueueRecord, RunState, Time};
use factory_storage::Document;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// When to process a record next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reschedule {
    /// After the given delay
    After(Duration),
    /// At the given time
    At(Time),
    /// After the queue's check interval
    Default,
}

/// Marks a record as being handled by this process until dropped.
pub(crate) struct Claim<T: QueueRecord> {
    queue: Arc<Queue<T>>,
    id: String,
    registered: bool,
}

impl<T: QueueRecord> Claim<T> {
    /// Register `id` as in flight. Returns `None` if it already is.
    pub(crate) fn acquire(queue: Arc<Queue<T>>, id: String) -> Option<Self> {
        if !queue.mark_in_flight(&id) {
            return None;
        }
        Some(Self {
            queue,
            id,
            registered: true,
        })
    }

    /// A claim that doesn't block dispatch.
    pub(crate) fn detached(queue: Arc<Queue<T>>, id: String) -> Self {
        Self {
            queue,
            id,
            registered: false,
        }
    }
}

impl<T: QueueRecord> Drop for Claim<T> {
    fn drop(&mut self) {
        if self.registered {
            self.queue.clear_in_flight(&self.id);
        }
    }
}

/// Pending changes to one record, written by a single commit.
///
/// Field updates accumulate until one of the consuming methods
/// ([`reschedule`](Self::reschedule), [`cancel`](Self::cancel),
/// [`fail`](Self::fail), [`finish`](Self::finish) or [`end`](Self::end))
/// writes them and returns the stored record.
pub struct JobControl<T: QueueRecord> {
    claim: Claim<T>,
    record: T,
    pending: Document,
    claimed_due: Value,
}

impl<T: QueueRecord> JobControl<T> {
    pub(crate) fn new(claim: Claim<T>, record: T, pending: Document, claimed_due: Value) -> Self {
        Self {
            claim,
            record,
            pending,
            claimed_due,
        }
    }

    /// The record as it was when the handle was created.
    pub fn record(&self) -> &T {
        &self.record
    }

    /// Record id.
    pub fn id(&self) -> &str {
        self.record.id()
    }

    /// The owning queue.
    pub fn queue(&self) -> &Arc<Queue<T>> {
        &self.claim.queue
    }

    /// Changes written on commit.
    pub fn pending(&self) -> &Document {
        &self.pending
    }

    /// Merge fields into the pending update. `id` and `due_at` can't be set
    /// this way.
    pub fn update(&mut self, values: Value) -> &mut Self {
        match values {
            Value::Object(map) => {
                for (key, value) in map {
                    if key == fields::ID || key == fields::DUE_AT {
                        continue;
                    }
                    self.pending.insert(key, value);
                }
            }
            other => warn!(id = %self.id(), value = %other, "Ignoring non-object update"),
        }
        self
    }

    /// Set the state written on commit.
    pub fn set_state(&mut self, state: RunState) -> &mut Self {
        self.pending.insert(fields::STATE.into(), state_value(state));
        self
    }

    /// Set when the record is next due and commit.
    pub async fn reschedule(mut self, when: Reschedule) -> Result<T> {
        let clock = self.claim.queue.clock();
        let due = match when {
            Reschedule::After(delay) => clock.after(delay),
            Reschedule::At(time) => time,
            Reschedule::Default => clock.after(self.claim.queue.options().check_interval),
        };
        self.pending.insert(fields::DUE_AT.into(), due_value(due));
        self.commit().await
    }

    /// Log the reason, mark cancelled and commit.
    pub async fn cancel(self, reason: Option<&str>) -> Result<T> {
        let message = with_reason("Cancelled", reason);
        self.terminate(RunState::Cancelled, LogLevel::Info, message).await
    }

    /// Log the reason, mark failed and commit.
    pub async fn fail(self, reason: Option<&str>) -> Result<T> {
        let message = with_reason("Failed", reason);
        self.terminate(RunState::Failed, LogLevel::Error, message).await
    }

    /// Log, mark completed and commit.
    pub async fn finish(self, message: Option<&str>) -> Result<T> {
        let message = message.unwrap_or("Finished successfully").to_string();
        self.terminate(RunState::Completed, LogLevel::Info, message).await
    }

    /// Commit pending changes as they are.
    pub async fn end(self) -> Result<T> {
        self.commit().await
    }

    /// Logger bound to this record. Each call hands the control back for
    /// chaining, e.g. `control.log().error("no image", data).await.fail(None)`.
    pub fn log(self) -> Logger<T> {
        Logger { control: self }
    }

    async fn terminate(mut self, state: RunState, level: LogLevel, message: String) -> Result<T> {
        self.write_log(level, &message, Value::Null).await;
        let now = self.claim.queue.clock().now();
        self.set_state(state);
        self.pending.insert(fields::ENDED_AT.into(), time_value(now));
        self.commit().await
    }

    async fn write_log(&self, level: LogLevel, message: &str, data: Value) {
        if let Err(e) = self.claim.queue.add_log(self.id(), level, message, data).await {
            warn!(id = %self.id(), error = %e, "Failed to write log entry");
        }
    }

    async fn commit(self) -> Result<T> {
        let JobControl {
            claim,
            record,
            pending,
            claimed_due,
        } = self;
        let queue = Arc::clone(&claim.queue);
        let stored = queue.commit(record.id(), pending, claimed_due).await?;
        drop(claim);

        // Anything that became due while we held the claim was skipped by
        // the dispatch loop.
        if stored.state().is_active()
            && stored.due_at().is_some_and(|due| due <= queue.clock().now())
        {
            queue.nudge();
        }
        debug!(queue = %queue.name(), id = %stored.id(), state = %stored.state(), "Committed");
        Ok(stored)
    }
}

/// Log writer returned by [`JobControl::log`].
pub struct Logger<T: QueueRecord> {
    control: JobControl<T>,
}

impl<T: QueueRecord> Logger<T> {
    /// Append an entry at `level`.
    pub async fn add(self, level: LogLevel, message: &str, data: Value) -> JobControl<T> {
        self.control.write_log(level, message, data).await;
        self.control
    }

    /// Append an info entry.
    pub async fn info(self, message: &str, data: Value) -> JobControl<T> {
        self.add(LogLevel::Info, message, data).await
    }

    /// Append a warning entry.
    pub async fn warning(self, message: &str, data: Value) -> JobControl<T> {
        self.add(LogLevel::Warning, message, data).await
    }

    /// Append an error entry.
    pub async fn error(self, message: &str, data: Value) -> JobControl<T> {
        self.add(LogLevel::Error, message, data).await
    }
}

fn with_reason(what: &str, reason: Option<&str>) -> String {
    match reason {
        Some(reason) => format!("{}: {}", what, reason),
        None => what.to_string(),
    }
}
