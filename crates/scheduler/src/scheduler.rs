//! The scheduler: two queue handlers and a workload watch.
//!
//! Jobs and tasks each live in their own [`Queue`]. The job handler compiles
//! a job's recipe into task records and then periodically reconciles the
//! job against its tasks. The task handler dispatches workloads to the
//! [`ExecutionSubstrate`] and polls them. A supervised watch loop applies
//! workload completions between polls.

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::notify::NotificationBus;
use crate::recipes::RecipeStore;
use crate::substrate::{ExecutionSubstrate, WorkloadEvent, WorkloadEventKind};
use async_trait::async_trait;
use factory_core::record::{due_value, fields, state_value, time_value};
use factory_core::{
    job_channel, project_channel, JobChangeNotification, JobRecord, JobRequest, LogEntry, LogLevel,
    Notification, RunState, TaskChangeNotification, TaskRecord,
};
use factory_queue::{Clock, Handler, JobControl, Queue, SystemClock};
use factory_storage::{Document, DocumentStore, Filter, JsonStore};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Orchestrates jobs and their tasks.
pub struct Scheduler {
    pub(crate) jobs: Arc<Queue<JobRecord>>,
    pub(crate) tasks: Arc<Queue<TaskRecord>>,
    pub(crate) recipes: Arc<dyn RecipeStore>,
    pub(crate) substrate: Arc<dyn ExecutionSubstrate>,
    pub(crate) bus: Arc<dyn NotificationBus>,
    pub(crate) config: SchedulerConfig,
    stop_tx: watch::Sender<bool>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Build a scheduler over existing queues.
    pub fn new(
        jobs: Arc<Queue<JobRecord>>,
        tasks: Arc<Queue<TaskRecord>>,
        recipes: Arc<dyn RecipeStore>,
        substrate: Arc<dyn ExecutionSubstrate>,
        bus: Arc<dyn NotificationBus>,
        config: SchedulerConfig,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            jobs,
            tasks,
            recipes,
            substrate,
            bus,
            config,
            stop_tx,
            watcher: Mutex::new(None),
        }
    }

    /// Build both queues over the given stores, each with its own clock.
    #[allow(clippy::too_many_arguments)]
    pub fn with_stores(
        job_store: Arc<dyn DocumentStore>,
        task_store: Arc<dyn DocumentStore>,
        log_store: Arc<dyn DocumentStore>,
        clocks: (Arc<dyn Clock>, Arc<dyn Clock>),
        recipes: Arc<dyn RecipeStore>,
        substrate: Arc<dyn ExecutionSubstrate>,
        bus: Arc<dyn NotificationBus>,
        config: SchedulerConfig,
    ) -> Self {
        let (job_clock, task_clock) = clocks;
        let options = config.queue_options();
        let jobs = Arc::new(Queue::new(
            "jobs",
            job_store,
            Arc::clone(&log_store),
            job_clock,
            options.clone(),
        ));
        let tasks = Arc::new(Queue::new("tasks", task_store, log_store, task_clock, options));
        Self::new(jobs, tasks, recipes, substrate, bus, config)
    }

    /// Scheduler keeping everything in memory.
    pub fn in_memory(
        recipes: Arc<dyn RecipeStore>,
        substrate: Arc<dyn ExecutionSubstrate>,
        bus: Arc<dyn NotificationBus>,
        config: SchedulerConfig,
    ) -> Self {
        Self::with_stores(
            Arc::new(JsonStore::in_memory()),
            Arc::new(JsonStore::in_memory()),
            Arc::new(JsonStore::in_memory()),
            (Arc::new(SystemClock::new()), Arc::new(SystemClock::new())),
            recipes,
            substrate,
            bus,
            config,
        )
    }

    /// Scheduler persisting jobs, tasks and logs as JSON files in `dir`.
    pub async fn open(
        dir: impl AsRef<Path>,
        recipes: Arc<dyn RecipeStore>,
        substrate: Arc<dyn ExecutionSubstrate>,
        bus: Arc<dyn NotificationBus>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let job_store = JsonStore::open(dir.join("jobs.json")).await?;
        let task_store = JsonStore::open(dir.join("tasks.json")).await?;
        let log_store = JsonStore::open(dir.join("logs.json")).await?;
        info!(dir = %dir.display(), "Opened scheduler data");
        Ok(Self::with_stores(
            Arc::new(job_store),
            Arc::new(task_store),
            Arc::new(log_store),
            (Arc::new(SystemClock::new()), Arc::new(SystemClock::new())),
            recipes,
            substrate,
            bus,
            config,
        ))
    }

    /// The job queue.
    pub fn jobs(&self) -> &Arc<Queue<JobRecord>> {
        &self.jobs
    }

    /// The task queue.
    pub fn tasks(&self) -> &Arc<Queue<TaskRecord>> {
        &self.tasks
    }

    /// Active configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Start both dispatch loops and the workload watch.
    pub fn run(self: &Arc<Self>) {
        self.jobs.process(Arc::clone(self) as Arc<dyn Handler<JobRecord>>);
        self.tasks.process(Arc::clone(self) as Arc<dyn Handler<TaskRecord>>);

        self.stop_tx.send_replace(false);
        let stop = self.stop_tx.subscribe();
        let scheduler = Arc::clone(self);
        let task = tokio::spawn(async move { scheduler.watch_workloads(stop).await });
        let previous = self.watcher.lock().unwrap_or_else(|e| e.into_inner()).replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!("Scheduler started");
    }

    /// Stop dispatching. Handlers already running finish on their own.
    pub fn stop(&self) {
        self.jobs.stop();
        self.tasks.stop();
        self.stop_tx.send_replace(true);
        self.watcher.lock().unwrap_or_else(|e| e.into_inner()).take();
        info!("Scheduler stopped");
    }

    /// Accept a job submission. The job is stored READY and due now.
    pub async fn submit_job(&self, request: JobRequest) -> Result<JobRecord> {
        let limit = request
            .concurrency_limit
            .unwrap_or(self.config.default_concurrency_limit);
        let mut job = JobRecord::from_request(request);
        job.concurrency_limit = limit;
        job.state = RunState::Ready;
        job.created_at = Some(self.jobs.clock().now());

        let job = self.jobs.add_one(self.jobs.create(job)).await?;
        info!(job_id = %job.id, recipe = %job.recipe, project = job.project, "Job submitted");
        self.publish_jobs(
            job.project,
            JobChangeNotification {
                jobs_added: Some(vec![job.summary()]),
                ..Default::default()
            },
        );
        Ok(job)
    }

    /// Request cancellation of a ready or running job. Returns the updated
    /// job, or `None` if it wasn't in a cancellable state.
    pub async fn cancel_job(&self, id: &str) -> Result<Option<JobRecord>> {
        let mut patch = Document::new();
        patch.insert(fields::STATE.into(), state_value(RunState::Cancelling));
        let condition = Filter::le(fields::STATE, RunState::RUNNING);
        let Some(job) = self.jobs.update(id, &patch, Some(&condition)).await? else {
            if self.jobs.get(id).await?.is_none() {
                return Err(SchedulerError::JobNotFound(id.to_string()));
            }
            debug!(job_id = id, "Job not cancellable");
            return Ok(None);
        };

        self.jobs.wake(&[job.id.clone()], self.jobs.clock().now()).await?;
        info!(job_id = id, "Job cancellation requested");
        self.publish_job_update(&job);
        Ok(Some(job))
    }

    /// Delete a finished job with its tasks and logs.
    pub async fn delete_job(&self, id: &str) -> Result<()> {
        let job = self
            .jobs
            .get(id)
            .await?
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))?;
        if !job.state.is_terminal() {
            return Err(SchedulerError::JobActive(id.to_string()));
        }

        let task_ids: Vec<String> = self.job_tasks(id).await?.into_iter().map(|t| t.id).collect();
        self.tasks.delete_logs(&task_ids).await?;
        self.tasks.delete(&task_ids).await?;
        self.jobs.delete_logs(&[job.id.clone()]).await?;
        self.jobs.delete(&[job.id.clone()]).await?;
        info!(job_id = id, tasks = task_ids.len(), "Job deleted");

        self.publish_jobs(
            job.project,
            JobChangeNotification {
                jobs_deleted: Some(vec![job.id]),
                ..Default::default()
            },
        );
        Ok(())
    }

    /// Load a job.
    pub async fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        Ok(self.jobs.get(id).await?)
    }

    /// Jobs of a project, or all jobs.
    pub async fn list_jobs(&self, project: Option<u64>) -> Result<Vec<JobRecord>> {
        let filter = match project {
            Some(project) => Filter::eq("project", project),
            None => Filter::All,
        };
        Ok(self.jobs.find(&filter).await?)
    }

    /// A job's tasks in creation order.
    pub async fn job_tasks(&self, job_id: &str) -> Result<Vec<TaskRecord>> {
        let mut tasks = self.tasks.find(&Filter::eq("job_id", job_id)).await?;
        tasks.sort_by_key(|t| t.index);
        Ok(tasks)
    }

    /// A job's log entries, oldest first.
    pub async fn job_logs(&self, job_id: &str) -> Result<Vec<LogEntry>> {
        Ok(self.jobs.get_logs(job_id).await?)
    }

    /// A task's log entries, oldest first.
    pub async fn task_logs(&self, task_id: &str) -> Result<Vec<LogEntry>> {
        Ok(self.tasks.get_logs(task_id).await?)
    }

    /// Poll until the job reaches a terminal state.
    pub async fn wait_for_job(&self, id: &str, poll: Duration) -> Result<JobRecord> {
        loop {
            let job = self
                .jobs
                .get(id)
                .await?
                .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))?;
            if job.state.is_terminal() {
                return Ok(job);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Keep a workload watch open until stopped, reopening it whenever the
    /// feed ends.
    async fn watch_workloads(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        info!("Workload watch started");
        loop {
            if *stop.borrow() {
                break;
            }
            match self.substrate.watch().await {
                Ok(mut events) => loop {
                    tokio::select! {
                        _ = stop.changed() => break,
                        event = events.recv() => match event {
                            Some(event) => self.on_workload_event(event).await,
                            None => break,
                        },
                    }
                },
                Err(e) => error!(error = %e, "Failed to open workload watch"),
            }
            if *stop.borrow() {
                break;
            }
            warn!("Workload watch ended, restarting");
            tokio::select! {
                _ = stop.changed() => break,
                _ = tokio::time::sleep(self.config.watch_restart_delay()) => {}
            }
        }
        info!("Workload watch ended");
    }

    /// Apply a watch event to its task, if the task is still running or
    /// being cancelled.
    pub(crate) async fn on_workload_event(&self, event: WorkloadEvent) {
        if let Err(e) = self.apply_workload_event(&event).await {
            error!(handle = %event.handle, error = %e, "Failed to apply workload event");
        }
    }

    async fn apply_workload_event(&self, event: &WorkloadEvent) -> Result<()> {
        let Some(task_id) = event.task_id() else {
            debug!(handle = %event.handle, "Workload event without task label");
            return Ok(());
        };
        let Some(task) = self.tasks.get(task_id).await? else {
            debug!(task_id, "Workload event for unknown task");
            return Ok(());
        };
        if task.external_handle.as_deref() != Some(event.handle.as_str()) {
            return Ok(());
        }

        let (state, level, message) = match (event.kind, task.state) {
            (WorkloadEventKind::Succeeded, RunState::Running) => {
                (RunState::Completed, LogLevel::Info, "Finished successfully".to_string())
            }
            (WorkloadEventKind::Failed, RunState::Running) => {
                let reason = event.message.as_deref().unwrap_or("workload failed");
                (RunState::Failed, LogLevel::Error, format!("Failed: {}", reason))
            }
            (WorkloadEventKind::Deleted, RunState::Running) => {
                (RunState::Failed, LogLevel::Error, "Failed: workload deleted".to_string())
            }
            (_, RunState::Cancelling) => {
                (RunState::Cancelled, LogLevel::Info, "Cancelled: cancelled by request".to_string())
            }
            _ => return Ok(()),
        };

        let now = self.tasks.clock().now();
        let mut patch = Document::new();
        patch.insert(fields::STATE.into(), state_value(state));
        patch.insert(fields::ENDED_AT.into(), time_value(now));
        // Moving due_at makes an in-flight handler's commit re-read the record
        patch.insert(fields::DUE_AT.into(), due_value(now));
        let condition = Filter::eq(fields::STATE, task.state.ordinal());
        let Some(updated) = self.tasks.update(&task.id, &patch, Some(&condition)).await? else {
            return Ok(());
        };
        info!(task_id = %updated.task_id, job_id = %updated.job_id, state = %state, "Workload event applied");
        self.tasks.add_log(&updated.id, level, message, Value::Null).await?;

        // A deleted workload is already gone; every other ending frees it
        if event.kind != WorkloadEventKind::Deleted {
            self.release(&event.handle).await;
        }
        self.task_changed(&updated).await;
        Ok(())
    }

    /// Delete a workload, ignoring one that is already gone.
    pub(crate) async fn release(&self, handle: &str) {
        match self.substrate.delete(handle).await {
            Ok(()) => debug!(handle, "Workload released"),
            Err(crate::substrate::SubstrateError::NotFound(_)) => {}
            Err(e) => warn!(handle, error = %e, "Failed to release workload"),
        }
    }

    /// Wake the owning job and tell its subscribers.
    pub(crate) async fn task_changed(&self, task: &TaskRecord) {
        if let Err(e) = self
            .jobs
            .wake_after(&[task.job_id.clone()], self.config.short_interval())
            .await
        {
            warn!(job_id = %task.job_id, error = %e, "Failed to wake job");
        }
        self.publish_tasks(&task.job_id, vec![task.clone()]);
    }

    /// Mark a task failed outside of its normal control flow.
    pub(crate) async fn fail_task(&self, id: &str, reason: &str) {
        let task = match self.tasks.get(id).await {
            Ok(Some(task)) if !task.state.is_terminal() => task,
            Ok(_) => return,
            Err(e) => {
                error!(task_id = id, error = %e, "Failed to load task");
                return;
            }
        };
        match self.tasks.control(task).fail(Some(reason)).await {
            Ok(task) => self.task_changed(&task).await,
            Err(e) => error!(task_id = id, error = %e, "Failed to mark task failed"),
        }
    }

    pub(crate) fn publish_job_update(&self, job: &JobRecord) {
        self.publish_jobs(
            job.project,
            JobChangeNotification {
                jobs_updated: Some(vec![job.summary()]),
                ..Default::default()
            },
        );
    }

    fn publish_jobs(&self, project: u64, change: JobChangeNotification) {
        self.bus.publish(&project_channel(project), Notification::Jobs(change));
    }

    pub(crate) fn publish_tasks(&self, job_id: &str, tasks: Vec<TaskRecord>) {
        if tasks.is_empty() {
            return;
        }
        let change = TaskChangeNotification {
            tasks_updated: Some(tasks.iter().map(TaskRecord::summary).collect()),
        };
        self.bus.publish(&job_channel(job_id), Notification::Tasks(change));
    }

    /// Mark a job failed outside of its normal control flow.
    pub(crate) async fn fail_job(&self, id: &str, reason: &str) {
        let job = match self.jobs.get(id).await {
            Ok(Some(job)) if !job.state.is_terminal() => job,
            Ok(_) => return,
            Err(e) => {
                error!(job_id = id, error = %e, "Failed to load job");
                return;
            }
        };
        match self.jobs.control(job).fail(Some(reason)).await {
            Ok(job) => self.publish_job_update(&job),
            Err(e) => error!(job_id = id, error = %e, "Failed to mark job failed"),
        }
    }
}

#[async_trait]
impl Handler<JobRecord> for Scheduler {
    async fn handle(&self, job: JobRecord, control: JobControl<JobRecord>) {
        let id = job.id.clone();
        if let Err(e) = self.handle_job(job, control).await {
            error!(job_id = %id, error = %e, "Job handling failed");
            self.fail_job(&id, &e.to_string()).await;
            self.cancel_unfinished_tasks(&id).await;
        }
    }
}

#[async_trait]
impl Handler<TaskRecord> for Scheduler {
    async fn handle(&self, task: TaskRecord, control: JobControl<TaskRecord>) {
        let id = task.id.clone();
        let job_id = task.job_id.clone();
        if let Err(e) = self.handle_task(task, control).await {
            error!(task_id = %id, job_id = %job_id, error = %e, "Task handling failed");
            self.fail_task(&id, &e.to_string()).await;
        }
    }
}
