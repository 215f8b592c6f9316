//! Structured log entries attached to jobs and tasks.

use crate::Time;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Informational
    Info,
    /// Something unexpected but recoverable
    Warning,
    /// A failure
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warning => write!(f, "warning"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// An append-only log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Store-assigned id
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// Id of the job or task record this entry belongs to
    pub owner: String,

    /// Severity
    pub level: LogLevel,

    /// Message text
    pub message: String,

    /// Structured detail
    #[serde(default)]
    pub data: Value,

    /// When the entry was written
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: Time,
}
