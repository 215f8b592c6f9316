//! Task handling: dispatching workloads and watching them finish.

use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::substrate::{SubstrateError, WorkloadSpec};
use factory_core::record::time_value;
use factory_core::{RunState, TaskRecord};
use factory_queue::{JobControl, Reschedule};
use serde_json::json;
use tracing::{debug, info, warn};

impl Scheduler {
    /// Dispatch, poll or cancel a claimed task.
    pub(crate) async fn handle_task(
        &self,
        task: TaskRecord,
        control: JobControl<TaskRecord>,
    ) -> Result<TaskRecord> {
        if !task.state.is_active() {
            debug!(task_id = %task.task_id, state = %task.state, "Task is not active, skipping");
            return Ok(task);
        }
        if task.state == RunState::Cancelling {
            self.cancel_task(task, control).await
        } else if !task.work_started {
            self.dispatch_task(task, control).await
        } else {
            self.poll_task(task, control).await
        }
    }

    async fn dispatch_task(
        &self,
        task: TaskRecord,
        mut control: JobControl<TaskRecord>,
    ) -> Result<TaskRecord> {
        let Some(spec) = WorkloadSpec::for_task(&task) else {
            warn!(task_id = %task.task_id, job_id = %task.job_id, "Task has no image");
            let stored = control.fail(Some("no image specified")).await?;
            self.task_changed(&stored).await;
            return Ok(stored);
        };

        match self.substrate.create(spec).await {
            Ok(workload) => {
                info!(
                    task_id = %task.task_id,
                    job_id = %task.job_id,
                    handle = %workload.handle,
                    "Workload created"
                );
                control
                    .update(json!({
                        "external_handle": workload.handle,
                        "work_started": true,
                        "started_at": time_value(workload.started_at),
                    }))
                    .set_state(RunState::Running);
                let stored = control
                    .reschedule(Reschedule::After(self.config.medium_interval()))
                    .await?;
                self.task_changed(&stored).await;
                Ok(stored)
            }
            Err(e) => {
                warn!(task_id = %task.task_id, job_id = %task.job_id, error = %e, "Workload creation failed");
                let stored = control
                    .log()
                    .error("Workload creation failed", json!({ "error": e.to_string() }))
                    .await
                    .fail(Some(&e.to_string()))
                    .await?;
                self.task_changed(&stored).await;
                Ok(stored)
            }
        }
    }

    async fn poll_task(
        &self,
        task: TaskRecord,
        control: JobControl<TaskRecord>,
    ) -> Result<TaskRecord> {
        let Some(handle) = task.external_handle.clone() else {
            let stored = control.fail(Some("workload handle missing")).await?;
            self.task_changed(&stored).await;
            return Ok(stored);
        };

        let status = match self.substrate.status(&handle).await {
            Ok(status) => status,
            Err(SubstrateError::NotFound(_)) => {
                warn!(task_id = %task.task_id, handle = %handle, "Workload disappeared");
                let stored = control.fail(Some("workload disappeared")).await?;
                self.task_changed(&stored).await;
                return Ok(stored);
            }
            Err(e) => {
                warn!(task_id = %task.task_id, handle = %handle, error = %e, "Status query failed");
                return Ok(control
                    .reschedule(Reschedule::After(self.config.short_interval()))
                    .await?);
            }
        };

        if status.succeeded {
            let stored = control.finish(None).await?;
            info!(task_id = %stored.task_id, job_id = %stored.job_id, "Task completed");
            self.release(&handle).await;
            self.task_changed(&stored).await;
            return Ok(stored);
        }
        if status.failed {
            let reason = status
                .conditions
                .last()
                .cloned()
                .unwrap_or_else(|| "workload failed".to_string());
            info!(task_id = %task.task_id, job_id = %task.job_id, reason = %reason, "Task failed");
            let stored = control.fail(Some(&reason)).await?;
            self.release(&handle).await;
            self.task_changed(&stored).await;
            return Ok(stored);
        }

        let diagnostics = match self.substrate.diagnostics(&handle).await {
            Ok(diagnostics) => diagnostics,
            Err(e) => {
                warn!(task_id = %task.task_id, handle = %handle, error = %e, "Diagnostics query failed");
                return Ok(control
                    .reschedule(Reschedule::After(self.config.short_interval()))
                    .await?);
            }
        };
        if let Some(stuck) = diagnostics.iter().find(|d| d.is_unrecoverable()) {
            let reason = stuck.describe();
            warn!(task_id = %task.task_id, handle = %handle, reason = %reason, "Workload can't start");
            let stored = control
                .log()
                .error(
                    "Container can't start",
                    json!({ "container": stuck.name, "reason": stuck.waiting_reason, "message": stuck.message }),
                )
                .await
                .fail(Some(&reason))
                .await?;
            self.release(&handle).await;
            self.task_changed(&stored).await;
            return Ok(stored);
        }

        debug!(task_id = %task.task_id, handle = %handle, "Workload still running");
        Ok(control
            .reschedule(Reschedule::After(self.config.long_interval()))
            .await?)
    }

    async fn cancel_task(
        &self,
        task: TaskRecord,
        control: JobControl<TaskRecord>,
    ) -> Result<TaskRecord> {
        if let Some(handle) = &task.external_handle {
            self.release(handle).await;
        }
        let stored = control.cancel(Some("cancelled by request")).await?;
        info!(task_id = %stored.task_id, job_id = %stored.job_id, "Task cancelled");
        self.task_changed(&stored).await;
        Ok(stored)
    }
}
