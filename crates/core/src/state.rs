//! Run state shared by jobs and tasks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Persisted ordinals of each [`RunState`].
pub mod ordinal {
    /// Ready to run.
    pub const READY: u8 = 0;
    /// Running.
    pub const RUNNING: u8 = 1;
    /// Cancel requested.
    pub const CANCELLING: u8 = 2;
    /// Waiting on dependencies.
    pub const WAITING: u8 = 3;
    /// Finished successfully.
    pub const COMPLETED: u8 = 4;
    /// Cancel complete.
    pub const CANCELLED: u8 = 5;
    /// Failed.
    pub const FAILED: u8 = 6;
}

/// The execution state of a job or task.
///
/// Ordinals are explicit and persisted as integers. Queue filtering selects
/// records with `state < WAITING`, so every active state must sort below
/// [`RunState::Waiting`] and every terminal state above it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum RunState {
    /// Ready to run but not yet started.
    #[default]
    Ready = ordinal::READY,
    /// Running.
    Running = ordinal::RUNNING,
    /// Cancellation requested, not yet wound down.
    Cancelling = ordinal::CANCELLING,
    /// Waiting on dependencies.
    Waiting = ordinal::WAITING,
    /// Finished successfully.
    Completed = ordinal::COMPLETED,
    /// Cancellation complete.
    Cancelled = ordinal::CANCELLED,
    /// Failed.
    Failed = ordinal::FAILED,
}

impl RunState {
    /// Ordinal of [`RunState::Ready`].
    pub const READY: u8 = ordinal::READY;
    /// Ordinal of [`RunState::Running`].
    pub const RUNNING: u8 = ordinal::RUNNING;
    /// Ordinal of [`RunState::Cancelling`].
    pub const CANCELLING: u8 = ordinal::CANCELLING;
    /// Ordinal of [`RunState::Waiting`]; the active/inactive boundary.
    pub const WAITING: u8 = ordinal::WAITING;
    /// Ordinal of [`RunState::Completed`].
    pub const COMPLETED: u8 = ordinal::COMPLETED;
    /// Ordinal of [`RunState::Cancelled`].
    pub const CANCELLED: u8 = ordinal::CANCELLED;
    /// Ordinal of [`RunState::Failed`].
    pub const FAILED: u8 = ordinal::FAILED;

    /// All states in ordinal order.
    pub const ALL: [RunState; 7] = [
        RunState::Ready,
        RunState::Running,
        RunState::Cancelling,
        RunState::Waiting,
        RunState::Completed,
        RunState::Cancelled,
        RunState::Failed,
    ];

    /// The persisted ordinal.
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Whether the record is eligible for dispatch when due.
    pub fn is_active(self) -> bool {
        self < RunState::Waiting
    }

    /// Whether the state is final.
    pub fn is_terminal(self) -> bool {
        self > RunState::Waiting
    }

    /// Lower-case name, as shown in logs and summaries.
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Ready => "ready",
            RunState::Running => "running",
            RunState::Cancelling => "cancelling",
            RunState::Waiting => "waiting",
            RunState::Completed => "completed",
            RunState::Cancelled => "cancelled",
            RunState::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RunState> for u8 {
    fn from(state: RunState) -> Self {
        state.ordinal()
    }
}

/// Error returned when an integer is not a known run state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid run state ordinal: {0}")]
pub struct InvalidRunState(pub u8);

impl TryFrom<u8> for RunState {
    type Error = InvalidRunState;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        RunState::ALL
            .into_iter()
            .find(|s| s.ordinal() == value)
            .ok_or(InvalidRunState(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_states_sort_below_inactive_states() {
        let active: Vec<_> = RunState::ALL.into_iter().filter(|s| s.is_active()).collect();
        let inactive: Vec<_> = RunState::ALL.into_iter().filter(|s| !s.is_active()).collect();
        assert_eq!(active, vec![RunState::Ready, RunState::Running, RunState::Cancelling]);

        for a in &active {
            for i in &inactive {
                assert!(a < i, "{a} must sort below {i}");
                assert!(a.ordinal() < i.ordinal());
                assert!(a.ordinal() < RunState::WAITING);
            }
        }
    }

    #[test]
    fn test_waiting_sorts_below_terminal_states() {
        for s in [RunState::Completed, RunState::Cancelled, RunState::Failed] {
            assert!(RunState::Waiting < s);
            assert!(s.is_terminal());
        }
        assert!(!RunState::Waiting.is_terminal());
        assert!(!RunState::Waiting.is_active());
    }

    #[test]
    fn test_serializes_as_ordinal() {
        assert_eq!(serde_json::to_value(RunState::Waiting).unwrap(), serde_json::json!(3));
        let s: RunState = serde_json::from_value(serde_json::json!(6)).unwrap();
        assert_eq!(s, RunState::Failed);
        assert!(serde_json::from_value::<RunState>(serde_json::json!(42)).is_err());
    }

    #[test]
    fn test_default_is_ready() {
        assert_eq!(RunState::default(), RunState::Ready);
    }
}
