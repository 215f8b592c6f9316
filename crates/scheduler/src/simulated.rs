//! In-process substrate that pretends to run workloads.
//!
//! Workloads finish after a fixed run time, or only when a test calls
//! [`SimulatedSubstrate::complete`] / [`SimulatedSubstrate::fail`]. Images
//! marked broken never start and report an image pull error.

use crate::substrate::{
    ContainerDiagnostic, ExecutionSubstrate, SubstrateError, WatchStream, Workload,
    WorkloadEvent, WorkloadEventKind, WorkloadSpec, WorkloadStatus,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Succeeded,
    Failed,
}

struct SimWorkload {
    spec: WorkloadSpec,
    phase: Phase,
    message: Option<String>,
}

struct SimState {
    next_handle: u64,
    workloads: BTreeMap<String, SimWorkload>,
    watchers: Vec<mpsc::UnboundedSender<WorkloadEvent>>,
    broken_images: HashSet<String>,
    accepting: bool,
}

impl SimState {
    fn emit(
        &mut self,
        kind: WorkloadEventKind,
        handle: &str,
        labels: BTreeMap<String, String>,
        message: Option<String>,
    ) {
        let event = WorkloadEvent {
            kind,
            handle: handle.to_string(),
            labels,
            message,
        };
        self.watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn finish(&mut self, handle: &str, phase: Phase, message: Option<String>) -> bool {
        let Some(workload) = self.workloads.get_mut(handle) else {
            return false;
        };
        if workload.phase != Phase::Running || self.broken_images.contains(&workload.spec.image) {
            return false;
        }
        workload.phase = phase;
        workload.message = message.clone();
        let labels = workload.spec.labels.clone();
        let kind = match phase {
            Phase::Failed => WorkloadEventKind::Failed,
            _ => WorkloadEventKind::Succeeded,
        };
        debug!(handle, ?phase, "Simulated workload finished");
        self.emit(kind, handle, labels, message);
        true
    }
}

/// A substrate that runs nothing.
#[derive(Clone)]
pub struct SimulatedSubstrate {
    state: Arc<Mutex<SimState>>,
    run_time: Option<Duration>,
}

impl SimulatedSubstrate {
    /// Workloads run until told to finish.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                next_handle: 1,
                workloads: BTreeMap::new(),
                watchers: Vec::new(),
                broken_images: HashSet::new(),
                accepting: true,
            })),
            run_time: None,
        }
    }

    /// Workloads succeed on their own after `run_time`.
    pub fn with_run_time(mut self, run_time: Duration) -> Self {
        self.run_time = Some(run_time);
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Workloads using `image` will never pull it.
    pub fn break_image(&self, image: impl Into<String>) {
        self.lock().broken_images.insert(image.into());
    }

    /// Make `create` succeed or be rejected.
    pub fn set_accepting(&self, accepting: bool) {
        self.lock().accepting = accepting;
    }

    /// Finish a running workload successfully.
    pub fn complete(&self, handle: &str) -> bool {
        self.lock().finish(handle, Phase::Succeeded, None)
    }

    /// Finish a running workload with an error.
    pub fn fail(&self, handle: &str, message: impl Into<String>) -> bool {
        self.lock().finish(handle, Phase::Failed, Some(message.into()))
    }

    /// Delete a workload from outside the scheduler.
    pub fn remove(&self, handle: &str) -> bool {
        let mut state = self.lock();
        let Some(workload) = state.workloads.remove(handle) else {
            return false;
        };
        state.emit(WorkloadEventKind::Deleted, handle, workload.spec.labels, None);
        true
    }

    /// Handles of existing workloads, oldest first.
    pub fn handles(&self) -> Vec<String> {
        let mut handles: Vec<_> = self.lock().workloads.keys().cloned().collect();
        handles.sort_by_key(|h| handle_number(h));
        handles
    }

    /// Handles of workloads still running, oldest first.
    pub fn running(&self) -> Vec<String> {
        let state = self.lock();
        let mut handles: Vec<_> = state
            .workloads
            .iter()
            .filter(|(_, w)| w.phase == Phase::Running)
            .map(|(h, _)| h.clone())
            .collect();
        handles.sort_by_key(|h| handle_number(h));
        handles
    }

    /// What a workload was created with.
    pub fn spec(&self, handle: &str) -> Option<WorkloadSpec> {
        self.lock().workloads.get(handle).map(|w| w.spec.clone())
    }

    /// End every open watch feed.
    pub fn close_watches(&self) {
        self.lock().watchers.clear();
    }

    /// Number of open watch feeds.
    pub fn watch_count(&self) -> usize {
        let mut state = self.lock();
        state.watchers.retain(|tx| !tx.is_closed());
        state.watchers.len()
    }
}

impl Default for SimulatedSubstrate {
    fn default() -> Self {
        Self::new()
    }
}

fn handle_number(handle: &str) -> u64 {
    handle
        .rsplit('-')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(u64::MAX)
}

#[async_trait]
impl ExecutionSubstrate for SimulatedSubstrate {
    async fn create(&self, spec: WorkloadSpec) -> Result<Workload, SubstrateError> {
        let handle = {
            let mut state = self.lock();
            if !state.accepting {
                return Err(SubstrateError::Rejected(format!("not accepting {}", spec.name)));
            }
            let handle = format!("sim-{}", state.next_handle);
            state.next_handle += 1;
            debug!(handle = %handle, image = %spec.image, "Simulated workload created");
            state.workloads.insert(
                handle.clone(),
                SimWorkload {
                    spec,
                    phase: Phase::Running,
                    message: None,
                },
            );
            handle
        };

        if let Some(run_time) = self.run_time {
            let sim = self.clone();
            let finishing = handle.clone();
            tokio::spawn(async move {
                tokio::time::sleep(run_time).await;
                sim.complete(&finishing);
            });
        }

        Ok(Workload {
            handle,
            started_at: chrono::Utc::now(),
        })
    }

    async fn delete(&self, handle: &str) -> Result<(), SubstrateError> {
        if self.remove(handle) {
            Ok(())
        } else {
            Err(SubstrateError::NotFound(handle.to_string()))
        }
    }

    async fn status(&self, handle: &str) -> Result<WorkloadStatus, SubstrateError> {
        let state = self.lock();
        let workload = state
            .workloads
            .get(handle)
            .ok_or_else(|| SubstrateError::NotFound(handle.to_string()))?;
        Ok(WorkloadStatus {
            succeeded: workload.phase == Phase::Succeeded,
            failed: workload.phase == Phase::Failed,
            conditions: workload.message.iter().cloned().collect(),
        })
    }

    async fn diagnostics(&self, handle: &str) -> Result<Vec<ContainerDiagnostic>, SubstrateError> {
        let state = self.lock();
        let workload = state
            .workloads
            .get(handle)
            .ok_or_else(|| SubstrateError::NotFound(handle.to_string()))?;
        let diagnostic = if state.broken_images.contains(&workload.spec.image) {
            ContainerDiagnostic {
                name: "main".into(),
                waiting_reason: Some("ErrImagePull".into()),
                message: Some(format!("failed to pull image \"{}\"", workload.spec.image)),
            }
        } else {
            ContainerDiagnostic {
                name: "main".into(),
                ..Default::default()
            }
        };
        Ok(vec![diagnostic])
    }

    async fn watch(&self) -> Result<WatchStream, SubstrateError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().watchers.push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::TASK_LABEL;

    fn spec(image: &str) -> WorkloadSpec {
        WorkloadSpec {
            name: "w".into(),
            image: image.into(),
            tool: None,
            workdir: None,
            args: vec![],
            env: BTreeMap::new(),
            labels: BTreeMap::from([(TASK_LABEL.to_string(), "T1".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_complete_on_demand() {
        let sim = SimulatedSubstrate::new();
        let mut events = sim.watch().await.unwrap();
        let workload = sim.create(spec("renderer")).await.unwrap();
        assert_eq!(workload.handle, "sim-1");
        assert!(!sim.status("sim-1").await.unwrap().succeeded);

        assert!(sim.complete("sim-1"));
        assert!(!sim.complete("sim-1"), "already finished");
        assert!(sim.status("sim-1").await.unwrap().succeeded);

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, WorkloadEventKind::Succeeded);
        assert_eq!(event.task_id(), Some("T1"));
    }

    #[tokio::test]
    async fn test_run_time_finishes_workloads() {
        let sim = SimulatedSubstrate::new().with_run_time(Duration::from_millis(5));
        let mut events = sim.watch().await.unwrap();
        sim.create(spec("renderer")).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, WorkloadEventKind::Succeeded);
        assert!(sim.running().is_empty());
    }

    #[tokio::test]
    async fn test_broken_image_reports_pull_error() {
        let sim = SimulatedSubstrate::new();
        sim.break_image("missing");
        sim.create(spec("missing")).await.unwrap();
        assert!(!sim.complete("sim-1"));
        let diagnostics = sim.diagnostics("sim-1").await.unwrap();
        assert!(diagnostics[0].is_unrecoverable());
    }

    #[tokio::test]
    async fn test_delete_and_rejection() {
        let sim = SimulatedSubstrate::new();
        let mut events = sim.watch().await.unwrap();
        sim.create(spec("renderer")).await.unwrap();
        sim.delete("sim-1").await.unwrap();
        assert_eq!(events.recv().await.unwrap().kind, WorkloadEventKind::Deleted);
        assert_eq!(
            sim.status("sim-1").await,
            Err(SubstrateError::NotFound("sim-1".into()))
        );

        sim.set_accepting(false);
        assert!(matches!(
            sim.create(spec("renderer")).await,
            Err(SubstrateError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_close_watches_ends_streams() {
        let sim = SimulatedSubstrate::new();
        let mut events = sim.watch().await.unwrap();
        assert_eq!(sim.watch_count(), 1);
        sim.close_watches();
        assert!(events.recv().await.is_none());
        assert_eq!(sim.watch_count(), 0);
    }
}
