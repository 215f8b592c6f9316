//! Task model - one unit of work within a job.

use crate::record::QueueRecord;
use crate::{RunState, Time};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A task as it is stored in the task queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Store-assigned id
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// Current state
    #[serde(default)]
    pub state: RunState,

    /// When the task is next due for processing
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub due_at: Option<Time>,

    /// When work started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Time>,

    /// When the task reached a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<Time>,

    /// Task id from the compiled recipe (unique within the job)
    pub task_id: String,

    /// Owning job id
    pub job_id: String,

    /// Display title
    #[serde(default)]
    pub title: String,

    /// Index of the recipe step that produced this task
    #[serde(default)]
    pub step: usize,

    /// Creation ordinal within the job
    #[serde(default)]
    pub index: usize,

    /// Task ids this task depends on
    #[serde(default)]
    pub depends: Vec<String>,

    /// Task ids that depend on this task
    #[serde(default)]
    pub dependents: Vec<String>,

    /// Container image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Tool to run inside the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,

    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,

    /// Arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Input files
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Output files
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Relative amount of work
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Handle of the dispatched workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_handle: Option<String>,

    /// Whether the workload has been dispatched
    #[serde(default)]
    pub work_started: bool,
}

fn default_weight() -> f64 {
    1.0
}

impl TaskRecord {
    /// API-facing view of this task.
    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.task_id.clone(),
            job_id: self.job_id.clone(),
            title: self.title.clone(),
            step: self.step,
            index: self.index,
            depends: self.depends.clone(),
            state: self.state,
            started_at: self.started_at,
            ended_at: self.ended_at,
            outputs: self.outputs.clone(),
            image: self.image.clone(),
            workdir: self.workdir.clone(),
            args: self.args.clone(),
        }
    }
}

impl QueueRecord for TaskRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn state(&self) -> RunState {
        self.state
    }

    fn set_state(&mut self, state: RunState) {
        self.state = state;
    }

    fn due_at(&self) -> Option<Time> {
        self.due_at
    }

    fn set_due_at(&mut self, due_at: Time) {
        self.due_at = Some(due_at);
    }

    fn set_started_at(&mut self, started_at: Time) {
        self.started_at = Some(started_at);
    }
}

/// Serialized view of a task for clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    /// Task id (unique within the job)
    pub id: String,
    /// Owning job
    pub job_id: String,
    /// Title
    pub title: String,
    /// Recipe step index
    pub step: usize,
    /// Creation ordinal
    pub index: usize,
    /// Dependencies
    pub depends: Vec<String>,
    /// Current state
    pub state: RunState,
    /// Start time
    pub started_at: Option<Time>,
    /// End time
    pub ended_at: Option<Time>,
    /// Output files
    pub outputs: Vec<String>,
    /// Container image
    pub image: Option<String>,
    /// Working directory
    pub workdir: Option<String>,
    /// Arguments
    pub args: Vec<String>,
}
