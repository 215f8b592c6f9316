//! Factory core data models.
//!
//! This crate defines the records shared by the recipe compiler, the work
//! queue and the scheduler.

#![warn(missing_docs)]

mod id;
mod state;

// Recipes
mod recipe;

// Queue records
pub mod record;
mod job;
mod task;
mod log;
mod notification;

// Re-exports
pub use id::new_record_id;
pub use state::{ordinal, InvalidRunState, RunState};

pub use recipe::{Param, ParamType, Recipe, Step};

pub use record::QueueRecord;
pub use job::{JobRecord, JobRequest, JobSummary};
pub use task::{TaskRecord, TaskSummary};
pub use log::{LogEntry, LogLevel};
pub use notification::{
    job_channel, project_channel, JobChangeNotification, Notification, TaskChangeNotification,
};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
