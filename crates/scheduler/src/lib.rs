//! Job scheduler for Factory.
//!
//! Compiles submitted jobs into task graphs, dispatches ready tasks to an
//! [`ExecutionSubstrate`], and reconciles each job against its tasks until
//! it completes, fails or is cancelled.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod notify;
pub mod recipes;
pub mod scheduler;
pub mod simulated;
pub mod substrate;

mod job;
mod task;

#[cfg(test)]
mod testing;

pub use config::SchedulerConfig;
pub use error::{Result, SchedulerError};
pub use notify::{BroadcastBus, NotificationBus, Published};
pub use recipes::{DirRecipeStore, MemoryRecipeStore, RecipeStore};
pub use scheduler::Scheduler;
pub use simulated::SimulatedSubstrate;
pub use substrate::{
    ContainerDiagnostic, ExecutionSubstrate, SubstrateError, WatchStream, Workload,
    WorkloadEvent, WorkloadEventKind, WorkloadSpec, WorkloadStatus,
};
