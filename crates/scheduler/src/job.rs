//! Job handling.
//!
//! A job is first compiled: its recipe is expanded into task records. From
//! then on every time the job comes due it is reconciled against its tasks,
//! which releases waiting tasks whose dependencies finished, propagates
//! cancellation and failure down the graph, and decides whether the job
//! itself is done.

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::scheduler::Scheduler;
use factory_core::record::{due_value, fields, state_value, time_value};
use factory_core::{JobRecord, LogLevel, RunState, TaskRecord};
use factory_queue::{JobControl, Reschedule};
use factory_storage::{Document, Filter};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A change reconciliation makes to one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    /// Dependencies met, make it ready to run
    Release,
    /// Ask a ready or running task to wind down
    RequestCancel,
    /// Cancel a task that never started
    Cancel(&'static str),
    /// Fail a task that can never start
    Fail(&'static str),
}

impl Transition {
    fn target(self) -> RunState {
        match self {
            Transition::Release => RunState::Ready,
            Transition::RequestCancel => RunState::Cancelling,
            Transition::Cancel(_) => RunState::Cancelled,
            Transition::Fail(_) => RunState::Failed,
        }
    }
}

/// What a reconciliation decides for the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Fail,
    Cancel,
    Complete,
    Recheck(Duration),
}

/// Task ids of a job grouped by state, plus work totals.
#[derive(Debug, Default, Clone, PartialEq)]
struct Partitions {
    waiting: Vec<String>,
    running: Vec<String>,
    completed: Vec<String>,
    cancelled: Vec<String>,
    failed: Vec<String>,
    work_total: f64,
    work_completed: f64,
    work_failed: f64,
}

impl Partitions {
    fn of(tasks: &[TaskRecord]) -> Self {
        let mut parts = Partitions::default();
        for task in tasks {
            parts.work_total += task.weight;
            let id = task.id.clone();
            match task.state {
                RunState::Waiting => parts.waiting.push(id),
                RunState::Ready | RunState::Running | RunState::Cancelling => parts.running.push(id),
                RunState::Completed => {
                    parts.work_completed += task.weight;
                    parts.completed.push(id);
                }
                RunState::Cancelled => parts.cancelled.push(id),
                RunState::Failed => {
                    parts.work_failed += task.weight;
                    parts.failed.push(id);
                }
            }
        }
        parts
    }

    fn to_value(&self) -> Value {
        json!({
            "work_total": self.work_total,
            "work_completed": self.work_completed,
            "work_failed": self.work_failed,
            "waiting_tasks": self.waiting,
            "running_tasks": self.running,
            "completed_tasks": self.completed,
            "cancelled_tasks": self.cancelled,
            "failed_tasks": self.failed,
        })
    }

    fn decide(&self, cancelling: bool, config: &SchedulerConfig) -> Outcome {
        let active = !self.running.is_empty();
        if !self.failed.is_empty() {
            if active {
                Outcome::Recheck(config.medium_interval())
            } else {
                Outcome::Fail
            }
        } else if (cancelling || !self.cancelled.is_empty()) && !active {
            Outcome::Cancel
        } else if !active && self.waiting.is_empty() {
            Outcome::Complete
        } else if cancelling {
            Outcome::Recheck(config.medium_interval())
        } else {
            Outcome::Recheck(config.long_interval())
        }
    }
}

fn has_slot(limit: u32, running: usize) -> bool {
    limit == 0 || running < limit as usize
}

/// What should happen to `task` given the states of the tasks before it.
fn next_transition(
    task: &TaskRecord,
    states: &HashMap<String, RunState>,
    cancelling: bool,
    slot_free: bool,
) -> Option<Transition> {
    match task.state {
        RunState::Waiting => {
            if cancelling {
                return Some(Transition::Cancel("job cancelled"));
            }
            // A dependency we can't see counts as failed
            let deps: Vec<RunState> = task
                .depends
                .iter()
                .map(|d| states.get(d).copied().unwrap_or(RunState::Failed))
                .collect();
            if deps.iter().any(|s| matches!(s, RunState::Cancelling | RunState::Cancelled)) {
                Some(Transition::Cancel("dependency cancelled"))
            } else if deps.contains(&RunState::Failed) {
                Some(Transition::Fail("dependency failed"))
            } else if slot_free && deps.iter().all(|s| *s == RunState::Completed) {
                Some(Transition::Release)
            } else {
                None
            }
        }
        RunState::Ready | RunState::Running if cancelling => Some(Transition::RequestCancel),
        _ => None,
    }
}

impl Scheduler {
    /// Compile or reconcile a claimed job.
    pub(crate) async fn handle_job(
        &self,
        job: JobRecord,
        control: JobControl<JobRecord>,
    ) -> Result<JobRecord> {
        let stored = if job.tasks_created {
            self.reconcile_job(job, control).await?
        } else {
            self.compile_job(job, control).await?
        };
        debug!(job_id = %stored.id, state = %stored.state, "Job handled");
        Ok(stored)
    }

    async fn compile_job(
        &self,
        job: JobRecord,
        mut control: JobControl<JobRecord>,
    ) -> Result<JobRecord> {
        if job.state == RunState::Cancelling {
            let stored = control.cancel(Some("cancelled before tasks were created")).await?;
            info!(job_id = %stored.id, "Job cancelled before compiling");
            self.publish_job_update(&stored);
            return Ok(stored);
        }

        // Tasks left over from an attempt whose commit never landed
        let existing = self.job_tasks(&job.id).await?;
        let tasks = if !existing.is_empty() {
            warn!(job_id = %job.id, tasks = existing.len(), "Adopting previously created tasks");
            existing
        } else {
            let Some(recipe) = self.recipes.get(&job.recipe).await? else {
                warn!(job_id = %job.id, recipe = %job.recipe, "Recipe not found");
                let reason = format!("recipe \"{}\" not found", job.recipe);
                let stored = control.fail(Some(&reason)).await?;
                self.publish_job_update(&stored);
                return Ok(stored);
            };

            let set = match factory_recipe::compile(&recipe, job.submission_params.clone()) {
                Ok(set) => set,
                Err(e) => {
                    warn!(job_id = %job.id, recipe = %job.recipe, error = %e, "Recipe failed to compile");
                    let stored = control.fail(Some(&e.to_string())).await?;
                    self.publish_job_update(&stored);
                    return Ok(stored);
                }
            };

            let mut running = 0;
            let records: Vec<TaskRecord> = set
                .tasks()
                .iter()
                .map(|task| {
                    let state = if task.depends.is_empty() && has_slot(job.concurrency_limit, running) {
                        running += 1;
                        RunState::Ready
                    } else {
                        RunState::Waiting
                    };
                    self.tasks.create(task.to_record(&job.id, state))
                })
                .collect();
            let tasks = self.tasks.add(records).await?;
            info!(job_id = %job.id, tasks = tasks.len(), ready = running, "Job compiled");
            tasks
        };

        control
            .update(Partitions::of(&tasks).to_value())
            .update(json!({ "tasks_created": true }))
            .set_state(RunState::Running);
        let stored = control
            .reschedule(Reschedule::After(self.config.short_interval()))
            .await?;
        self.publish_job_update(&stored);
        self.publish_tasks(&stored.id, tasks);
        Ok(stored)
    }

    async fn reconcile_job(
        &self,
        job: JobRecord,
        mut control: JobControl<JobRecord>,
    ) -> Result<JobRecord> {
        let cancelling = job.state == RunState::Cancelling;
        let mut tasks = self.job_tasks(&job.id).await?;
        let mut states: HashMap<String, RunState> =
            tasks.iter().map(|t| (t.task_id.clone(), t.state)).collect();
        let mut running = tasks.iter().filter(|t| t.state.is_active()).count();
        let mut changed = Vec::new();

        // Tasks only depend on earlier tasks, so one pass in creation order
        // settles every cascade.
        for task in tasks.iter_mut() {
            let slot_free = has_slot(job.concurrency_limit, running);
            let Some(transition) = next_transition(task, &states, cancelling, slot_free) else {
                continue;
            };
            match self.move_task(task, transition).await? {
                Some(updated) => {
                    if transition == Transition::Release {
                        running += 1;
                    }
                    *task = updated;
                    changed.push(task.clone());
                }
                None => {
                    if let Some(current) = self.tasks.get(&task.id).await? {
                        *task = current;
                    }
                }
            }
            states.insert(task.task_id.clone(), task.state);
        }

        let mut parts = Partitions::of(&tasks);
        let outcome = parts.decide(cancelling, &self.config);
        if matches!(outcome, Outcome::Fail | Outcome::Cancel) && !parts.waiting.is_empty() {
            for task in tasks.iter_mut().filter(|t| t.state == RunState::Waiting) {
                if let Some(updated) = self.move_task(task, Transition::Cancel("job ended")).await? {
                    *task = updated;
                    changed.push(task.clone());
                }
            }
            parts = Partitions::of(&tasks);
        }
        control.update(parts.to_value());

        let stored = match outcome {
            Outcome::Fail => {
                info!(job_id = %job.id, failed = parts.failed.len(), "Job failed");
                control.fail(Some("one or more tasks failed")).await?
            }
            Outcome::Cancel => {
                info!(job_id = %job.id, "Job cancelled");
                let reason = if cancelling {
                    "cancelled by request"
                } else {
                    "one or more tasks were cancelled"
                };
                control.cancel(Some(reason)).await?
            }
            Outcome::Complete => {
                info!(job_id = %job.id, tasks = parts.completed.len(), "Job completed");
                control.finish(None).await?
            }
            Outcome::Recheck(delay) => {
                debug!(
                    job_id = %job.id,
                    waiting = parts.waiting.len(),
                    running = parts.running.len(),
                    "Job still in progress"
                );
                control.reschedule(Reschedule::After(delay)).await?
            }
        };

        self.publish_job_update(&stored);
        self.publish_tasks(&stored.id, changed);
        Ok(stored)
    }

    /// Apply a transition if the task is still in the state it was read
    /// in. Returns the updated task, or `None` if it had moved on.
    pub(crate) async fn move_task(
        &self,
        task: &TaskRecord,
        transition: Transition,
    ) -> Result<Option<TaskRecord>> {
        let now = self.tasks.clock().now();
        let target = transition.target();
        let mut patch = Document::new();
        patch.insert(fields::STATE.into(), state_value(target));
        if target.is_active() {
            patch.insert(fields::DUE_AT.into(), due_value(now));
        } else {
            patch.insert(fields::ENDED_AT.into(), time_value(now));
        }
        let condition = Filter::eq(fields::STATE, task.state.ordinal());
        let Some(updated) = self.tasks.update(&task.id, &patch, Some(&condition)).await? else {
            debug!(task_id = %task.task_id, "Task changed before transition");
            return Ok(None);
        };

        debug!(task_id = %updated.task_id, job_id = %updated.job_id, state = %target, "Task moved");
        let entry = match transition {
            Transition::Cancel(reason) => Some((LogLevel::Info, format!("Cancelled: {}", reason))),
            Transition::Fail(reason) => Some((LogLevel::Error, format!("Failed: {}", reason))),
            _ => None,
        };
        if let Some((level, message)) = entry {
            self.tasks.add_log(&updated.id, level, message, Value::Null).await?;
        }
        Ok(Some(updated))
    }

    /// Wind down the tasks of a job that ended abnormally.
    pub(crate) async fn cancel_unfinished_tasks(&self, job_id: &str) {
        let tasks = match self.job_tasks(job_id).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(job_id, error = %e, "Failed to load tasks");
                return;
            }
        };
        for task in tasks {
            let transition = match task.state {
                RunState::Waiting => Transition::Cancel("job failed"),
                RunState::Ready | RunState::Running => Transition::RequestCancel,
                _ => continue,
            };
            match self.move_task(&task, transition).await {
                Ok(Some(updated)) => self.publish_tasks(job_id, vec![updated]),
                Ok(None) => {}
                Err(e) => warn!(job_id, task_id = %task.task_id, error = %e, "Failed to cancel task"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchedulerError;
    use crate::recipes::RecipeStore;
    use crate::testing::{render_recipe, Harness};
    use factory_core::{Notification, Recipe};
    use factory_queue::{Clock, Handler};
    use std::sync::Arc;

    fn task(task_id: &str, state: RunState, depends: &[&str]) -> TaskRecord {
        TaskRecord {
            id: format!("rec-{}", task_id),
            task_id: task_id.into(),
            state,
            depends: depends.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_next_transition_rules() {
        let states = HashMap::from([
            ("done".to_string(), RunState::Completed),
            ("busy".to_string(), RunState::Running),
            ("broken".to_string(), RunState::Failed),
            ("stopped".to_string(), RunState::Cancelled),
        ]);
        let waiting = |deps: &[&str]| task("t", RunState::Waiting, deps);

        assert_eq!(next_transition(&waiting(&["done"]), &states, false, true), Some(Transition::Release));
        assert_eq!(next_transition(&waiting(&["done"]), &states, false, false), None);
        assert_eq!(next_transition(&waiting(&["done", "busy"]), &states, false, true), None);
        assert_eq!(
            next_transition(&waiting(&["done", "broken"]), &states, false, true),
            Some(Transition::Fail("dependency failed"))
        );
        assert_eq!(
            next_transition(&waiting(&["broken", "stopped"]), &states, false, true),
            Some(Transition::Cancel("dependency cancelled"))
        );
        assert_eq!(
            next_transition(&waiting(&["missing"]), &states, false, true),
            Some(Transition::Fail("dependency failed"))
        );
        assert_eq!(
            next_transition(&waiting(&["done"]), &states, true, true),
            Some(Transition::Cancel("job cancelled"))
        );

        let running = task("r", RunState::Running, &[]);
        assert_eq!(next_transition(&running, &states, false, true), None);
        assert_eq!(next_transition(&running, &states, true, true), Some(Transition::RequestCancel));
        let completed = task("c", RunState::Completed, &[]);
        assert_eq!(next_transition(&completed, &states, true, true), None);
    }

    #[test]
    fn test_partitions_and_decisions() {
        let config = SchedulerConfig::default();
        let mut a = task("a", RunState::Completed, &[]);
        a.weight = 2.0;
        let b = task("b", RunState::Running, &[]);
        let c = task("c", RunState::Waiting, &["a", "b"]);
        let parts = Partitions::of(&[a.clone(), b.clone(), c.clone()]);
        assert_eq!(parts.work_total, 4.0);
        assert_eq!(parts.work_completed, 2.0);
        assert_eq!(parts.running, vec!["rec-b"]);
        assert_eq!(parts.decide(false, &config), Outcome::Recheck(config.long_interval()));
        assert_eq!(parts.decide(true, &config), Outcome::Recheck(config.medium_interval()));

        let failed = task("b", RunState::Failed, &[]);
        let parts = Partitions::of(&[a.clone(), failed.clone(), c.clone()]);
        assert_eq!(parts.decide(false, &config), Outcome::Fail);
        let parts = Partitions::of(&[failed, b.clone()]);
        assert_eq!(parts.decide(false, &config), Outcome::Recheck(config.medium_interval()));

        let cancelled = task("b", RunState::Cancelled, &[]);
        assert_eq!(Partitions::of(&[a.clone(), cancelled]).decide(false, &config), Outcome::Cancel);
        assert_eq!(Partitions::of(&[a.clone()]).decide(true, &config), Outcome::Cancel);
        assert_eq!(Partitions::of(&[a]).decide(false, &config), Outcome::Complete);
        assert_eq!(Partitions::of(&[]).decide(false, &config), Outcome::Complete);
    }

    #[test]
    fn test_has_slot() {
        assert!(has_slot(0, 1000));
        assert!(has_slot(2, 1));
        assert!(!has_slot(2, 2));
    }

    #[tokio::test]
    async fn test_compile_creates_tasks() {
        let h = Harness::new();
        h.recipes.insert(render_recipe());
        let mut rx = h.bus.subscribe();
        let job = h.submit("render", json!({ "frames": [1, 3] }), None).await;
        let added = rx.recv().await.unwrap();
        assert_eq!(added.channel, "jobs.project.7");
        assert!(matches!(added.notification, Notification::Jobs(ref n) if n.jobs_added.is_some()));

        let job = h.step_job(&job.id).await;
        assert_eq!(job.state, RunState::Running);
        assert!(job.tasks_created);
        assert_eq!(job.tasks_total(), 4);
        assert_eq!(job.running_tasks.len(), 3);
        assert_eq!(job.waiting_tasks.len(), 1);
        assert_eq!(job.work_total, 4.0);

        let tasks = h.scheduler.job_tasks(&job.id).await.unwrap();
        let ids: Vec<_> = tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["render.1", "render.2", "render.3", "movie"]);
        let states: Vec<_> = tasks.iter().map(|t| t.state).collect();
        assert_eq!(
            states,
            vec![RunState::Ready, RunState::Ready, RunState::Ready, RunState::Waiting]
        );
        assert_eq!(tasks[3].depends, vec!["render.1", "render.2", "render.3"]);

        let updated = rx.recv().await.unwrap();
        assert_eq!(updated.channel, "jobs.project.7");
        let created = rx.recv().await.unwrap();
        assert_eq!(created.channel, format!("tasks.job.{}", job.id));
    }

    #[tokio::test]
    async fn test_concurrency_limit_holds_back_tasks() {
        let h = Harness::new();
        h.recipes.insert(render_recipe());
        let job = h.submit("render", json!({ "frames": [1, 3] }), Some(2)).await;
        let job = h.step_job(&job.id).await;
        assert_eq!(job.running_tasks.len(), 2);
        assert_eq!(job.waiting_tasks.len(), 2);

        // Free a slot and the held back render is released
        let tasks = h.scheduler.job_tasks(&job.id).await.unwrap();
        h.force_state(&tasks[0].id, RunState::Completed).await;
        let job = h.step_job(&job.id).await;
        let tasks = h.scheduler.job_tasks(&job.id).await.unwrap();
        assert_eq!(tasks[2].state, RunState::Ready);
        assert_eq!(tasks[3].state, RunState::Waiting);
        assert_eq!(job.running_tasks.len(), 2);
        assert_eq!(job.completed_tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_unlimited_concurrency() {
        let h = Harness::new();
        h.recipes.insert(render_recipe());
        let job = h.submit("render", json!({ "frames": [1, 20] }), Some(0)).await;
        let job = h.step_job(&job.id).await;
        assert_eq!(job.running_tasks.len(), 20);
    }

    #[tokio::test]
    async fn test_default_concurrency_limit_applies() {
        let h = Harness::new();
        h.recipes.insert(render_recipe());
        let job = h.submit("render", json!({ "frames": [1, 20] }), None).await;
        assert_eq!(job.concurrency_limit, 16);
        let job = h.step_job(&job.id).await;
        assert_eq!(job.running_tasks.len(), 16);
    }

    #[tokio::test]
    async fn test_missing_recipe_fails_job() {
        let h = Harness::new();
        let job = h.submit("nope", json!({}), None).await;
        let job = h.step_job(&job.id).await;
        assert_eq!(job.state, RunState::Failed);
        assert!(!job.tasks_created);
        let logs = h.scheduler.job_logs(&job.id).await.unwrap();
        assert_eq!(logs.last().unwrap().message, "Failed: recipe \"nope\" not found");
        assert_eq!(logs.last().unwrap().level, LogLevel::Error);
    }

    #[tokio::test]
    async fn test_compile_error_fails_job() {
        let h = Harness::new();
        let mut recipe = render_recipe();
        recipe.steps[0].depends = Some(json!(["movie"]));
        h.recipes.insert(recipe);
        let job = h.submit("render", json!({}), None).await;
        let job = h.step_job(&job.id).await;
        assert_eq!(job.state, RunState::Failed);
        let logs = h.scheduler.job_logs(&job.id).await.unwrap();
        assert!(logs[0].message.starts_with("Failed: "));
        assert!(h.scheduler.job_tasks(&job.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_compile() {
        let h = Harness::new();
        h.recipes.insert(render_recipe());
        let job = h.submit("render", json!({}), None).await;
        let cancelling = h.scheduler.cancel_job(&job.id).await.unwrap().unwrap();
        assert_eq!(cancelling.state, RunState::Cancelling);

        let job = h.step_job(&job.id).await;
        assert_eq!(job.state, RunState::Cancelled);
        assert!(h.scheduler.job_tasks(&job.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_render_then_movie_completes() {
        let h = Harness::new();
        h.recipes.insert(render_recipe());
        let job = h.submit("render", json!({ "frames": [1, 3] }), None).await;
        let job = h.step_job(&job.id).await;

        let tasks = h.scheduler.job_tasks(&job.id).await.unwrap();
        for t in &tasks[..2] {
            h.force_state(&t.id, RunState::Completed).await;
        }
        let job = h.step_job(&job.id).await;
        assert_eq!(job.state, RunState::Running);
        assert_eq!(h.scheduler.job_tasks(&job.id).await.unwrap()[3].state, RunState::Waiting);

        h.force_state(&tasks[2].id, RunState::Completed).await;
        let job = h.step_job(&job.id).await;
        let movie = &h.scheduler.job_tasks(&job.id).await.unwrap()[3];
        assert_eq!(movie.state, RunState::Ready);
        assert_eq!(movie.due_at, Some(h.task_clock.now()));

        h.force_state(&movie.id, RunState::Completed).await;
        let job = h.step_job(&job.id).await;
        assert_eq!(job.state, RunState::Completed);
        assert_eq!(job.work_completed, 4.0);
        assert_eq!(job.completed_tasks.len(), 4);
        assert!(job.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_cascading_cancellation() {
        let h = Harness::new();
        h.recipes.insert(render_recipe());
        let job = h.submit("render", json!({ "frames": [1, 4] }), Some(2)).await;
        let job = h.step_job(&job.id).await;
        let tasks = h.scheduler.job_tasks(&job.id).await.unwrap();
        h.force_state(&tasks[0].id, RunState::Running).await;
        h.force_state(&tasks[1].id, RunState::Running).await;

        h.scheduler.cancel_job(&job.id).await.unwrap().unwrap();
        let job = h.step_job(&job.id).await;
        assert_eq!(job.state, RunState::Cancelling);
        let states: Vec<_> = h
            .scheduler
            .job_tasks(&job.id)
            .await
            .unwrap()
            .iter()
            .map(|t| t.state)
            .collect();
        assert_eq!(
            states,
            vec![
                RunState::Cancelling,
                RunState::Cancelling,
                RunState::Cancelled,
                RunState::Cancelled,
                RunState::Cancelled,
            ]
        );

        // The task handler winds the running ones down
        for t in &tasks[..2] {
            h.step_task(&t.id).await;
        }
        let job = h.step_job(&job.id).await;
        assert_eq!(job.state, RunState::Cancelled);
        assert_eq!(job.cancelled_tasks.len(), 5);
        let logs = h.scheduler.job_logs(&job.id).await.unwrap();
        assert_eq!(logs.last().unwrap().message, "Cancelled: cancelled by request");
    }

    #[tokio::test]
    async fn test_failed_dependency_fails_job() {
        let h = Harness::new();
        h.recipes.insert(render_recipe());
        let job = h.submit("render", json!({ "frames": [1, 2] }), None).await;
        let job = h.step_job(&job.id).await;
        let tasks = h.scheduler.job_tasks(&job.id).await.unwrap();
        h.force_state(&tasks[0].id, RunState::Failed).await;

        // The other render is still going
        let job = h.step_job(&job.id).await;
        assert_eq!(job.state, RunState::Running);
        assert_eq!(
            job.due_at,
            Some(h.job_clock.after(h.scheduler.config().medium_interval()))
        );
        let movie = &h.scheduler.job_tasks(&job.id).await.unwrap()[2];
        assert_eq!(movie.state, RunState::Failed);
        let logs = h.scheduler.task_logs(&movie.id).await.unwrap();
        assert_eq!(logs[0].message, "Failed: dependency failed");

        h.force_state(&tasks[1].id, RunState::Completed).await;
        let job = h.step_job(&job.id).await;
        assert_eq!(job.state, RunState::Failed);
        assert_eq!(job.failed_tasks.len(), 2);
        assert_eq!(job.work_failed, 2.0);
    }

    struct BrokenRecipes;

    #[async_trait::async_trait]
    impl RecipeStore for BrokenRecipes {
        async fn get(&self, id: &str) -> Result<Option<Recipe>> {
            Err(SchedulerError::InvalidRecipeId(id.to_string()))
        }
    }

    #[tokio::test]
    async fn test_handler_error_fails_job() {
        let h = Harness::with_recipes(Arc::new(BrokenRecipes));
        let job = h.submit("render", json!({}), None).await;
        let record = h.scheduler.jobs().get(&job.id).await.unwrap().unwrap();
        let control = h.scheduler.jobs().control(record.clone());
        Handler::<JobRecord>::handle(&*h.scheduler, record, control).await;

        let job = h.scheduler.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.state, RunState::Failed);
        let logs = h.scheduler.job_logs(&job.id).await.unwrap();
        assert_eq!(logs[0].message, "Failed: Invalid recipe id: render");
    }
}
