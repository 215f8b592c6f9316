//! The execution substrate: whatever actually runs task workloads.
//!
//! A workload is one container run created for one task. The scheduler
//! creates it, polls its status, reads per-container diagnostics when it
//! seems stuck, deletes it when done, and listens to a watch feed for
//! completions between polls.

use async_trait::async_trait;
use factory_core::{TaskRecord, Time};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Label carrying the owning job id.
pub const JOB_LABEL: &str = "factory/job";

/// Label carrying the task record id.
pub const TASK_LABEL: &str = "factory/task";

/// Container waiting reasons that never resolve on their own.
const UNRECOVERABLE_REASONS: &[&str] = &["ErrImagePull", "ImagePullBackOff", "InvalidImageName"];

/// Errors reported by a substrate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubstrateError {
    /// The workload doesn't exist (any more)
    #[error("Workload not found: {0}")]
    NotFound(String),

    /// The substrate refused the request
    #[error("Workload rejected: {0}")]
    Rejected(String),

    /// The substrate couldn't be reached
    #[error("Substrate unavailable: {0}")]
    Unavailable(String),
}

/// What to run for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// Workload name
    pub name: String,
    /// Container image
    pub image: String,
    /// Entry point inside the image
    pub tool: Option<String>,
    /// Working directory
    pub workdir: Option<String>,
    /// Arguments
    pub args: Vec<String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Labels identifying the owner
    pub labels: BTreeMap<String, String>,
}

impl WorkloadSpec {
    /// Workload for a task. `None` if the task has no image.
    pub fn for_task(task: &TaskRecord) -> Option<Self> {
        let image = task.image.as_deref().filter(|i| !i.is_empty())?;
        let labels = BTreeMap::from([
            (JOB_LABEL.to_string(), task.job_id.clone()),
            (TASK_LABEL.to_string(), task.id.clone()),
        ]);
        Some(Self {
            name: format!("{}-{}", task.job_id, task.id).to_lowercase(),
            image: image.to_string(),
            tool: task.tool.clone(),
            workdir: task.workdir.clone(),
            args: task.args.clone(),
            env: task.env.clone(),
            labels,
        })
    }
}

/// A created workload.
#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    /// Substrate handle used for later calls
    pub handle: String,
    /// When the substrate accepted it
    pub started_at: Time,
}

/// Coarse workload status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkloadStatus {
    /// Finished successfully
    pub succeeded: bool,
    /// Finished with an error
    pub failed: bool,
    /// Human readable conditions, most recent last
    pub conditions: Vec<String>,
}

/// State of one container inside a workload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerDiagnostic {
    /// Container name
    pub name: String,
    /// Why the container is waiting, if it is
    pub waiting_reason: Option<String>,
    /// Detail message
    pub message: Option<String>,
}

impl ContainerDiagnostic {
    /// Whether the container is stuck in a state that won't recover,
    /// such as an image that can't be pulled.
    pub fn is_unrecoverable(&self) -> bool {
        self.waiting_reason
            .as_deref()
            .is_some_and(|reason| UNRECOVERABLE_REASONS.contains(&reason))
    }

    /// One-line description for logs.
    pub fn describe(&self) -> String {
        let reason = self.waiting_reason.as_deref().unwrap_or("waiting");
        match &self.message {
            Some(message) => format!("{}: {} ({})", self.name, reason, message),
            None => format!("{}: {}", self.name, reason),
        }
    }
}

/// What happened to a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadEventKind {
    /// Finished successfully
    Succeeded,
    /// Finished with an error
    Failed,
    /// Removed
    Deleted,
}

/// One entry of the watch feed.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadEvent {
    /// What happened
    pub kind: WorkloadEventKind,
    /// Workload handle
    pub handle: String,
    /// Labels the workload was created with
    pub labels: BTreeMap<String, String>,
    /// Detail, if any
    pub message: Option<String>,
}

impl WorkloadEvent {
    /// Task record id from the labels.
    pub fn task_id(&self) -> Option<&str> {
        self.labels.get(TASK_LABEL).map(String::as_str)
    }
}

/// Receiving end of a watch feed. It ends when the substrate drops the
/// sender; the scheduler then opens a new one.
pub type WatchStream = mpsc::UnboundedReceiver<WorkloadEvent>;

/// Runs workloads.
#[async_trait]
pub trait ExecutionSubstrate: Send + Sync {
    /// Start a workload.
    async fn create(&self, spec: WorkloadSpec) -> Result<Workload, SubstrateError>;

    /// Delete a workload.
    async fn delete(&self, handle: &str) -> Result<(), SubstrateError>;

    /// Current status.
    async fn status(&self, handle: &str) -> Result<WorkloadStatus, SubstrateError>;

    /// Per-container state.
    async fn diagnostics(&self, handle: &str) -> Result<Vec<ContainerDiagnostic>, SubstrateError>;

    /// Feed of workload events.
    async fn watch(&self) -> Result<WatchStream, SubstrateError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_for_task() {
        let task = TaskRecord {
            id: "T1".into(),
            job_id: "J1".into(),
            task_id: "render.1".into(),
            image: Some("renderer".into()),
            args: vec!["--frame".into(), "1".into()],
            ..Default::default()
        };
        let spec = WorkloadSpec::for_task(&task).unwrap();
        assert_eq!(spec.name, "j1-t1");
        assert_eq!(spec.labels[JOB_LABEL], "J1");
        assert_eq!(spec.labels[TASK_LABEL], "T1");
        assert_eq!(spec.args, vec!["--frame", "1"]);

        let no_image = TaskRecord {
            image: Some(String::new()),
            ..task
        };
        assert!(WorkloadSpec::for_task(&no_image).is_none());
    }

    #[test]
    fn test_unrecoverable_reasons() {
        let diag = |reason: Option<&str>| ContainerDiagnostic {
            name: "main".into(),
            waiting_reason: reason.map(String::from),
            message: None,
        };
        assert!(diag(Some("ErrImagePull")).is_unrecoverable());
        assert!(diag(Some("ImagePullBackOff")).is_unrecoverable());
        assert!(diag(Some("InvalidImageName")).is_unrecoverable());
        assert!(!diag(Some("ContainerCreating")).is_unrecoverable());
        assert!(!diag(None).is_unrecoverable());
        assert_eq!(diag(Some("ErrImagePull")).describe(), "main: ErrImagePull");
    }
}
