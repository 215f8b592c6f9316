//! Shared fixtures for scheduler tests.

use crate::config::SchedulerConfig;
use crate::notify::BroadcastBus;
use crate::recipes::{MemoryRecipeStore, RecipeStore};
use crate::scheduler::Scheduler;
use crate::simulated::SimulatedSubstrate;
use factory_core::record::{fields, state_value};
use factory_core::{JobRecord, JobRequest, Recipe, RunState, TaskRecord};
use factory_queue::{Clock, FakeClock};
use factory_storage::{Document, JsonStore};
use serde_json::{json, Value};
use std::sync::Arc;

/// Renders each frame, then encodes a movie from all of them.
pub(crate) fn render_recipe() -> Recipe {
    serde_json::from_value(json!({
        "id": "render",
        "title": "Render and encode",
        "params": [{ "id": "frames", "type": "range", "default": [1, 3] }],
        "steps": [
            {
                "id": "render.{{frame}}",
                "image": "renderer",
                "multiplicity": { "frame": "{{frames}}" },
                "args": ["--frame", "{{frame}}"]
            },
            {
                "id": "movie",
                "image": "encoder",
                "depends": [{ "$foreach": ["frame", "{{frames}}", "render.{{frame}}"] }]
            }
        ]
    }))
    .unwrap()
}

/// A scheduler on fake clocks, driven one handler call at a time.
pub(crate) struct Harness {
    pub scheduler: Arc<Scheduler>,
    pub recipes: Arc<MemoryRecipeStore>,
    pub substrate: Arc<SimulatedSubstrate>,
    pub bus: Arc<BroadcastBus>,
    pub job_clock: Arc<FakeClock>,
    pub task_clock: Arc<FakeClock>,
}

impl Harness {
    pub fn new() -> Self {
        let recipes = Arc::new(MemoryRecipeStore::new());
        Self::build(Arc::clone(&recipes) as Arc<dyn RecipeStore>, recipes)
    }

    pub fn with_recipes(store: Arc<dyn RecipeStore>) -> Self {
        Self::build(store, Arc::new(MemoryRecipeStore::new()))
    }

    fn build(store: Arc<dyn RecipeStore>, recipes: Arc<MemoryRecipeStore>) -> Self {
        let substrate = Arc::new(SimulatedSubstrate::new());
        let bus = Arc::new(BroadcastBus::default());
        let job_clock = Arc::new(FakeClock::at_millis(1_000_000));
        let task_clock = Arc::new(FakeClock::at_millis(1_000_000));
        let scheduler = Arc::new(Scheduler::with_stores(
            Arc::new(JsonStore::in_memory()),
            Arc::new(JsonStore::in_memory()),
            Arc::new(JsonStore::in_memory()),
            (
                Arc::clone(&job_clock) as Arc<dyn Clock>,
                Arc::clone(&task_clock) as Arc<dyn Clock>,
            ),
            store,
            Arc::clone(&substrate) as _,
            Arc::clone(&bus) as _,
            SchedulerConfig::default(),
        ));
        Self {
            scheduler,
            recipes,
            substrate,
            bus,
            job_clock,
            task_clock,
        }
    }

    pub async fn submit(&self, recipe: &str, args: Value, limit: Option<u32>) -> JobRecord {
        let args = match args {
            Value::Object(map) => map,
            _ => Default::default(),
        };
        self.scheduler
            .submit_job(JobRequest {
                user: 1,
                username: "ada".into(),
                project: 7,
                recipe: recipe.into(),
                args,
                concurrency_limit: limit,
                ..Default::default()
            })
            .await
            .unwrap()
    }

    /// Run the job handler once on the stored job.
    pub async fn step_job(&self, id: &str) -> JobRecord {
        let job = self.scheduler.jobs().get(id).await.unwrap().unwrap();
        let control = self.scheduler.jobs().control(job.clone());
        self.scheduler.handle_job(job, control).await.unwrap()
    }

    /// Run the task handler once on the stored task.
    pub async fn step_task(&self, id: &str) -> TaskRecord {
        let task = self.scheduler.tasks().get(id).await.unwrap().unwrap();
        let control = self.scheduler.tasks().control(task.clone());
        self.scheduler.handle_task(task, control).await.unwrap()
    }

    /// Overwrite a task's state.
    pub async fn force_state(&self, id: &str, state: RunState) {
        let mut patch = Document::new();
        patch.insert(fields::STATE.into(), state_value(state));
        self.scheduler
            .tasks()
            .update(id, &patch, None)
            .await
            .unwrap()
            .unwrap();
    }
}
