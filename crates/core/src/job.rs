//! Job model - one submission of a recipe.

use crate::record::QueueRecord;
use crate::{RunState, Time};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A job as it is stored in the job queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRecord {
    /// Store-assigned id
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// Current state
    #[serde(default)]
    pub state: RunState,

    /// When the job is next due for processing
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub due_at: Option<Time>,

    /// When the job was submitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Time>,

    /// When the scheduler first picked the job up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Time>,

    /// When the job reached a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<Time>,

    /// Submitting user id
    #[serde(default)]
    pub user: u64,

    /// Submitting user name
    #[serde(default)]
    pub username: String,

    /// Project id; selects the notification channel
    #[serde(default)]
    pub project: u64,

    /// Asset id
    #[serde(default)]
    pub asset: u64,

    /// Name of the main input file
    #[serde(default)]
    pub main_file_name: String,

    /// Recipe id
    #[serde(default)]
    pub recipe: String,

    /// Free text description
    #[serde(default)]
    pub description: String,

    /// Arguments supplied with the submission
    #[serde(default)]
    pub submission_params: Map<String, Value>,

    /// Maximum number of tasks running at once (0 = unlimited)
    #[serde(default)]
    pub concurrency_limit: u32,

    /// Whether the recipe has been compiled into task records
    #[serde(default)]
    pub tasks_created: bool,

    /// Total work, summed from task weights
    #[serde(default)]
    pub work_total: f64,

    /// Work completed
    #[serde(default)]
    pub work_completed: f64,

    /// Work in failed tasks
    #[serde(default)]
    pub work_failed: f64,

    /// Task ids whose dependencies haven't been met
    #[serde(default)]
    pub waiting_tasks: Vec<String>,

    /// Task ids that are ready, running, or being cancelled
    #[serde(default)]
    pub running_tasks: Vec<String>,

    /// Task ids that finished successfully
    #[serde(default)]
    pub completed_tasks: Vec<String>,

    /// Task ids that were cancelled
    #[serde(default)]
    pub cancelled_tasks: Vec<String>,

    /// Task ids that failed
    #[serde(default)]
    pub failed_tasks: Vec<String>,
}

impl JobRecord {
    /// Build an unsaved job from a submission.
    pub fn from_request(request: JobRequest) -> Self {
        Self {
            user: request.user,
            username: request.username,
            project: request.project,
            asset: request.asset,
            main_file_name: request.main_file_name,
            recipe: request.recipe,
            description: request.description,
            submission_params: request.args,
            concurrency_limit: request.concurrency_limit.unwrap_or(0),
            ..Default::default()
        }
    }

    /// Total number of tasks across all partitions.
    pub fn tasks_total(&self) -> usize {
        self.waiting_tasks.len()
            + self.running_tasks.len()
            + self.completed_tasks.len()
            + self.cancelled_tasks.len()
            + self.failed_tasks.len()
    }

    /// API-facing view of this job.
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id.clone(),
            user: self.user,
            username: self.username.clone(),
            project: self.project,
            asset: self.asset,
            main_file_name: self.main_file_name.clone(),
            recipe: self.recipe.clone(),
            description: self.description.clone(),
            submission_params: self.submission_params.clone(),
            state: self.state,
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            tasks_total: self.tasks_total(),
            tasks_completed: self.completed_tasks.len(),
            tasks_failed: self.failed_tasks.len(),
            work_total: self.work_total,
            work_completed: self.work_completed,
            work_failed: self.work_failed,
        }
    }
}

impl QueueRecord for JobRecord {
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

/// A request to create a job, as received from the API layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    /// Submitting user id
    #[serde(default)]
    pub user: u64,

    /// Submitting user name
    #[serde(default)]
    pub username: String,

    /// Project id
    #[serde(default)]
    pub project: u64,

    /// Asset id
    #[serde(default)]
    pub asset: u64,

    /// Name of the main input file
    #[serde(default)]
    pub main_file_name: String,

    /// Recipe to execute
    pub recipe: String,

    /// Free text description
    #[serde(default)]
    pub description: String,

    /// Recipe arguments
    #[serde(default)]
    pub args: Map<String, Value>,

    /// Optional per-job concurrency limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_limit: Option<u32>,
}

/// Serialized view of a job for clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    /// Job id
    pub id: String,
    /// Submitting user id
    pub user: u64,
    /// Submitting user name
    pub username: String,
    /// Project id
    pub project: u64,
    /// Asset id
    pub asset: u64,
    /// Main input file
    pub main_file_name: String,
    /// Recipe id
    pub recipe: String,
    /// Description
    pub description: String,
    /// Submission arguments
    pub submission_params: Map<String, Value>,
    /// Current state
    pub state: RunState,
    /// Submission time
    pub created_at: Option<Time>,
    /// Start time
    pub started_at: Option<Time>,
    /// End time
    pub ended_at: Option<Time>,
    /// Number of tasks
    pub tasks_total: usize,
    /// Number of completed tasks
    pub tasks_completed: usize,
    /// Number of failed tasks
    pub tasks_failed: usize,
    /// Total work
    pub work_total: f64,
    /// Completed work
    pub work_completed: f64,
    /// Failed work
    pub work_failed: f64,
}
