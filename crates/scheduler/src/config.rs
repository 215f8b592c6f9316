//! Scheduler configuration.

use crate::error::Result;
use factory_queue::QueueOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Timing and limits for the scheduler. All intervals are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Queue polling interval and default reschedule delay
    pub check_interval_ms: u64,

    /// How long a claimed record stays leased
    pub process_timeout_ms: u64,

    /// Delay used right after a state change
    pub short_interval_ms: u64,

    /// Delay between polls of something expected to change soon
    pub medium_interval_ms: u64,

    /// Delay between polls of long running work
    pub long_interval_ms: u64,

    /// Concurrency limit for jobs submitted without one (0 = unlimited)
    pub default_concurrency_limit: u32,

    /// Pause before restarting a workload watch that ended
    pub watch_restart_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 5_000,
            process_timeout_ms: 60 * 60 * 1000,
            short_interval_ms: 100,
            medium_interval_ms: 5_000,
            long_interval_ms: 60 * 60 * 1000,
            default_concurrency_limit: 16,
            watch_restart_delay_ms: 1_000,
        }
    }
}

impl SchedulerConfig {
    /// Read a JSON config file. Missing keys keep their defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Options for the job and task queues.
    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            check_interval: Duration::from_millis(self.check_interval_ms),
            process_timeout: Duration::from_millis(self.process_timeout_ms),
        }
    }

    /// Short poll tier.
    pub fn short_interval(&self) -> Duration {
        Duration::from_millis(self.short_interval_ms)
    }

    /// Medium poll tier.
    pub fn medium_interval(&self) -> Duration {
        Duration::from_millis(self.medium_interval_ms)
    }

    /// Long poll tier.
    pub fn long_interval(&self) -> Duration {
        Duration::from_millis(self.long_interval_ms)
    }

    pub(crate) fn watch_restart_delay(&self) -> Duration {
        Duration::from_millis(self.watch_restart_delay_ms)
    }
}
