//! A compiled task, before it is persisted.

use factory_core::{RunState, TaskRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One concrete unit of work produced by expanding a recipe step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique id within the task set
    pub task_id: String,

    /// Display title
    pub title: String,

    /// Index of the step that produced this task
    pub step_index: usize,

    /// Creation ordinal across the whole set
    pub index: usize,

    /// Ids of tasks this one waits for
    pub depends: Vec<String>,

    /// Ids of tasks waiting for this one
    pub dependents: Vec<String>,

    /// Container image
    pub image: Option<String>,

    /// Tool to invoke
    pub tool: Option<String>,

    /// Working directory
    pub workdir: Option<String>,

    /// Command line arguments
    pub args: Vec<String>,

    /// Environment variables
    pub env: BTreeMap<String, String>,

    /// Input files
    pub inputs: Vec<String>,

    /// Output files
    pub outputs: Vec<String>,

    /// Relative amount of work
    pub weight: f64,
}

impl Task {
    /// Create an empty task.
    pub fn new(task_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            title: title.into(),
            step_index: 0,
            index: 0,
            depends: Vec::new(),
            dependents: Vec::new(),
            image: None,
            tool: None,
            workdir: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            weight: 1.0,
        }
    }

    /// Build the unsaved queue record for this task.
    pub fn to_record(&self, job_id: &str, state: RunState) -> TaskRecord {
        TaskRecord {
            task_id: self.task_id.clone(),
            job_id: job_id.to_string(),
            title: self.title.clone(),
            step: self.step_index,
            index: self.index,
            depends: self.depends.clone(),
            dependents: self.dependents.clone(),
            image: self.image.clone(),
            tool: self.tool.clone(),
            workdir: self.workdir.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            weight: self.weight,
            state,
            ..Default::default()
        }
    }
}
