//! Change notifications published for clients.

use crate::{JobSummary, TaskSummary};
use serde::{Deserialize, Serialize};

/// Published on a project's channel when jobs change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobChangeNotification {
    /// Newly submitted jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobs_added: Option<Vec<JobSummary>>,

    /// Jobs whose state or progress changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobs_updated: Option<Vec<JobSummary>>,

    /// Ids of deleted jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobs_deleted: Option<Vec<String>>,
}

/// Published on a job's channel when its tasks change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskChangeNotification {
    /// Tasks whose state changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks_updated: Option<Vec<TaskSummary>>,
}

/// Any message carried by the notification bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Notification {
    /// Job changes
    Jobs(JobChangeNotification),
    /// Task changes
    Tasks(TaskChangeNotification),
}

/// Channel receiving job changes for a project.
pub fn project_channel(project: u64) -> String {
    format!("jobs.project.{}", project)
}

/// Channel receiving task changes for a job.
pub fn job_channel(job_id: &str) -> String {
    format!("tasks.job.{}", job_id)
}
