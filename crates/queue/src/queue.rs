//! Durable, time-driven work queue.
//!
//! Records live in a [`DocumentStore`]. The dispatch loop subscribes to
//! active records that fall due within the next check interval. Records due
//! now are claimed with a conditional update and handed to the [`Handler`];
//! records due later inside the window arm the clock, and when the alarm
//! fires the subscription is rebuilt with a fresh window.

use crate::clock::{lock, Clock, WakeCallback};
use crate::control::{Claim, JobControl};
use crate::error::{QueueError, Result};
use async_trait::async_trait;
use factory_core::record::{due_value, fields, state_value, time_value};
use factory_core::{LogEntry, LogLevel, QueueRecord, RunState, Time};
use factory_storage::{Change, Document, DocumentStore, Filter};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How many times a commit retries its conditional write before giving up
/// on the condition.
const COMMIT_ATTEMPTS: usize = 8;

/// Processes one claimed record.
///
/// The handler owns the [`JobControl`] and is expected to commit it. A
/// control dropped without committing leaves the record leased until the
/// process timeout passes.
#[async_trait]
pub trait Handler<T: QueueRecord>: Send + Sync + 'static {
    /// Handle a record that came due.
    async fn handle(&self, record: T, control: JobControl<T>);
}

/// Queue timing.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Fallback polling interval and default reschedule delay
    pub check_interval: Duration,

    /// How long a claimed record stays leased
    pub process_timeout: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            process_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// A queue of records of type `T`.
pub struct Queue<T: QueueRecord> {
    name: String,
    records: Arc<dyn DocumentStore>,
    logs: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    options: QueueOptions,
    in_flight: Mutex<HashSet<String>>,
    alarm: Arc<Notify>,
    stop_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    _record: PhantomData<fn() -> T>,
}

impl<T: QueueRecord> Queue<T> {
    /// Create a queue over a record store and a log store.
    ///
    /// The clock's alarm is used by the dispatch loop, so every queue needs
    /// a clock of its own.
    pub fn new(
        name: impl Into<String>,
        records: Arc<dyn DocumentStore>,
        logs: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        options: QueueOptions,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            records,
            logs,
            clock,
            options,
            in_flight: Mutex::new(HashSet::new()),
            alarm: Arc::new(Notify::new()),
            stop_tx,
            worker: Mutex::new(None),
            _record: PhantomData,
        }
    }

    /// Queue name, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The queue's clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Timing options.
    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Prepare a new record: clears the id and makes it due now unless a due
    /// time was given.
    pub fn create(&self, mut record: T) -> T {
        record.set_id(String::new());
        if record.due_at().is_none() {
            record.set_due_at(self.clock.now());
        }
        record
    }

    /// Insert records and return them as stored.
    pub async fn add(&self, records: Vec<T>) -> Result<Vec<T>> {
        let docs = records.iter().map(to_document).collect::<Result<Vec<_>>>()?;
        let stored = self.records.insert(docs).await?;
        debug!(queue = %self.name, count = stored.len(), "Added records");
        stored.into_iter().map(from_document).collect()
    }

    /// Insert one record and return it as stored.
    pub async fn add_one(&self, record: T) -> Result<T> {
        self.add(vec![record])
            .await?
            .pop()
            .ok_or_else(|| QueueError::NotFound("inserted record".to_string()))
    }

    /// Load a record by id.
    pub async fn get(&self, id: &str) -> Result<Option<T>> {
        self.records.get(id).await?.map(from_document).transpose()
    }

    /// List records matching a filter.
    pub async fn find(&self, filter: &Filter) -> Result<Vec<T>> {
        self.records
            .find(filter)
            .await?
            .into_iter()
            .map(from_document)
            .collect()
    }

    /// Mark records cancelled. Returns how many were updated.
    pub async fn cancel(&self, ids: &[String]) -> Result<usize> {
        let mut patch = Document::new();
        patch.insert(fields::STATE.into(), state_value(RunState::Cancelled));
        patch.insert(fields::ENDED_AT.into(), time_value(self.clock.now()));
        Ok(self.records.update_all(&Filter::ids(ids.iter().cloned()), &patch).await?)
    }

    /// Delete records. Returns how many were removed.
    pub async fn delete(&self, ids: &[String]) -> Result<usize> {
        Ok(self.records.delete(&Filter::ids(ids.iter().cloned())).await?)
    }

    /// Bring active records forward to `when`. Records already due earlier,
    /// and records that are waiting or finished, are left alone.
    pub async fn wake(&self, ids: &[String], when: Time) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let due = due_value(when);
        let filter = Filter::ids(ids.iter().cloned())
            .and(Filter::lt(fields::STATE, RunState::WAITING))
            .and(Filter::Gt(fields::DUE_AT.into(), due.clone()));
        let mut patch = Document::new();
        patch.insert(fields::DUE_AT.into(), due);
        Ok(self.records.update_all(&filter, &patch).await?)
    }

    /// [`wake`](Self::wake) records `interval` from now.
    pub async fn wake_after(&self, ids: &[String], interval: Duration) -> Result<usize> {
        self.wake(ids, self.clock.after(interval)).await
    }

    /// Conditionally patch one record. Returns the updated record, or `None`
    /// when it doesn't exist or the condition failed.
    pub async fn update(
        &self,
        id: &str,
        patch: &Document,
        condition: Option<&Filter>,
    ) -> Result<Option<T>> {
        self.records
            .update(id, patch, condition)
            .await?
            .map(from_document)
            .transpose()
    }

    /// A control handle for a record outside the dispatch loop.
    pub fn control(self: &Arc<Self>, record: T) -> JobControl<T> {
        let claimed_due = record.due_at().map(due_value).unwrap_or(Value::Null);
        let claim = Claim::detached(Arc::clone(self), record.id().to_string());
        JobControl::new(claim, record, Document::new(), claimed_due)
    }

    /// Start dispatching due records to `handler`.
    pub fn process(self: &Arc<Self>, handler: Arc<dyn Handler<T>>) {
        self.stop_tx.send_replace(false);
        let stop = self.stop_tx.subscribe();
        let queue = Arc::clone(self);
        let task = tokio::spawn(async move { queue.run(handler, stop).await });
        if let Some(previous) = lock(&self.worker).replace(task) {
            previous.abort();
        }
    }

    /// Stop the dispatch loop and disarm the clock. Handlers already running
    /// finish on their own.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
        self.clock.cancel_wake();
        lock(&self.worker).take();
        info!(queue = %self.name, "Queue stopped");
    }

    /// Append a log entry for a record.
    pub async fn add_log(
        &self,
        owner: &str,
        level: LogLevel,
        message: impl Into<String>,
        data: Value,
    ) -> Result<LogEntry> {
        let entry = LogEntry {
            id: String::new(),
            owner: owner.to_string(),
            level,
            message: message.into(),
            data,
            timestamp: self.clock.now(),
        };
        let stored = self.logs.insert(vec![to_document(&entry)?]).await?;
        stored
            .into_iter()
            .next()
            .map(from_document)
            .transpose()?
            .ok_or_else(|| QueueError::NotFound(owner.to_string()))
    }

    /// Log entries for a record, oldest first.
    pub async fn get_logs(&self, owner: &str) -> Result<Vec<LogEntry>> {
        let mut entries: Vec<LogEntry> = self
            .logs
            .find(&Filter::eq("owner", owner))
            .await?
            .into_iter()
            .map(from_document)
            .collect::<Result<_>>()?;
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    /// Remove the log entries of the given records.
    pub async fn delete_logs(&self, owners: &[String]) -> Result<usize> {
        let owners = owners.iter().cloned().map(Value::String).collect();
        Ok(self.logs.delete(&Filter::In("owner".into(), owners)).await?)
    }

    fn alarm_callback(&self) -> WakeCallback {
        let alarm = Arc::clone(&self.alarm);
        Box::new(move || alarm.notify_one())
    }

    /// Make the dispatch loop rebuild its subscription.
    pub(crate) fn nudge(&self) {
        self.alarm.notify_one();
    }

    pub(crate) fn mark_in_flight(&self, id: &str) -> bool {
        lock(&self.in_flight).insert(id.to_string())
    }

    pub(crate) fn clear_in_flight(&self, id: &str) {
        lock(&self.in_flight).remove(id);
    }

    async fn run(self: Arc<Self>, handler: Arc<dyn Handler<T>>, mut stop: watch::Receiver<bool>) {
        info!(queue = %self.name, "Queue processing started");
        'refresh: loop {
            if *stop.borrow() {
                break;
            }
            let window_end = self.clock.after(self.options.check_interval);
            self.clock.wake_at(window_end, self.alarm_callback());

            let filter = Filter::lt(fields::STATE, RunState::WAITING)
                .and(Filter::Le(fields::DUE_AT.into(), due_value(window_end)));
            let mut stream = match self.records.subscribe(filter).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(queue = %self.name, error = %e, "Subscription failed");
                    tokio::select! {
                        _ = stop.changed() => break 'refresh,
                        _ = self.alarm.notified() => continue 'refresh,
                    }
                }
            };

            loop {
                tokio::select! {
                    _ = stop.changed() => break 'refresh,
                    _ = self.alarm.notified() => continue 'refresh,
                    change = stream.recv() => match change {
                        Some(Change { new: Some(doc), .. }) => self.observe(doc, &handler).await,
                        Some(_) => {}
                        None => continue 'refresh,
                    },
                }
            }
        }
        info!(queue = %self.name, "Queue processing ended");
    }

    async fn observe(self: &Arc<Self>, doc: Document, handler: &Arc<dyn Handler<T>>) {
        let Some(id) = doc.get(fields::ID).and_then(Value::as_str) else {
            return;
        };
        let Some(due) = doc.get(fields::DUE_AT).and_then(Value::as_i64) else {
            return;
        };

        if due > self.clock.now().timestamp_millis() {
            if let Some(at) = chrono::DateTime::from_timestamp_millis(due) {
                self.clock.wake_at(at, self.alarm_callback());
            }
            return;
        }

        match self.claim(id, due).await {
            Ok(Some(control)) => {
                let record = control.record().clone();
                let handler = Arc::clone(handler);
                tokio::spawn(async move { handler.handle(record, control).await });
            }
            Ok(None) => debug!(queue = %self.name, id, "Record not claimed"),
            Err(e) => error!(queue = %self.name, id, error = %e, "Claim failed"),
        }
    }

    /// Take the lease on a record observed with due time `observed_due`.
    async fn claim(self: &Arc<Self>, id: &str, observed_due: i64) -> Result<Option<JobControl<T>>> {
        let Some(claim) = Claim::acquire(Arc::clone(self), id.to_string()) else {
            return Ok(None);
        };

        let now = self.clock.now();
        let lease = due_value(self.clock.after(self.options.process_timeout));
        let mut patch = Document::new();
        patch.insert(fields::DUE_AT.into(), lease.clone());
        let condition = Filter::eq(fields::DUE_AT, observed_due)
            .and(Filter::lt(fields::STATE, RunState::WAITING));
        let Some(doc) = self.records.update(id, &patch, Some(&condition)).await? else {
            return Ok(None);
        };

        let mut record: T = from_document(doc)?;
        let mut pending = Document::new();
        pending.insert(
            fields::DUE_AT.into(),
            due_value(self.clock.after(self.options.check_interval)),
        );
        if record.state() == RunState::Ready {
            record.set_state(RunState::Running);
            record.set_started_at(now);
            pending.insert(fields::STATE.into(), state_value(RunState::Running));
            pending.insert(fields::STARTED_AT.into(), time_value(now));
        }
        debug!(queue = %self.name, id, state = %record.state(), "Claimed record");
        Ok(Some(JobControl::new(claim, record, pending, lease)))
    }

    /// Write a control's pending changes.
    ///
    /// The write is conditional on `due_at` still holding the value the
    /// control was created with. If something moved it in the meantime the
    /// earlier due time is kept, and a cancellation request is not
    /// overwritten by an active state.
    pub(crate) async fn commit(
        &self,
        id: &str,
        mut pending: Document,
        claimed_due: Value,
    ) -> Result<T> {
        let mut expected = claimed_due;
        for _ in 0..COMMIT_ATTEMPTS {
            let condition = (!expected.is_null())
                .then(|| Filter::Eq(fields::DUE_AT.into(), expected.clone()));
            if let Some(doc) = self.records.update(id, &pending, condition.as_ref()).await? {
                return from_document(doc);
            }

            let current = self
                .records
                .get(id)
                .await?
                .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
            let current_due = current.get(fields::DUE_AT).cloned().unwrap_or(Value::Null);
            if let (Some(now_due), Some(want)) = (
                current_due.as_i64(),
                pending.get(fields::DUE_AT).and_then(Value::as_i64),
            ) {
                if now_due < want {
                    pending.insert(fields::DUE_AT.into(), current_due.clone());
                }
            }
            let current_state = current.get(fields::STATE).and_then(Value::as_u64);
            let pending_state = pending.get(fields::STATE).and_then(Value::as_u64);
            if current_state == Some(u64::from(RunState::CANCELLING))
                && pending_state.is_some_and(|s| s < u64::from(RunState::WAITING))
            {
                pending.remove(fields::STATE);
            }
            debug!(queue = %self.name, id, "Record changed while handled, retrying commit");
            expected = current_due;
        }

        warn!(queue = %self.name, id, "Commit contention, writing unconditionally");
        self.records
            .update(id, &pending, None)
            .await?
            .map(from_document)
            .transpose()?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }
}

pub(crate) fn to_document<R: Serialize>(record: &R) -> Result<Document> {
    match serde_json::to_value(record)? {
        Value::Object(doc) => Ok(doc),
        other => Err(QueueError::NotAnObject(other.to_string())),
    }
}

pub(crate) fn from_document<R: DeserializeOwned>(doc: Document) -> Result<R> {
    Ok(serde_json::from_value(Value::Object(doc))?)
}
