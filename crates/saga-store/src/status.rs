//! Saga and step status.

use serde::{Deserialize, Serialize};

/// Lifecycle status shared by sagas and their steps.
///
/// Saga transitions:
/// ```text
/// Pending ──► Running ──┬──► Completed
///                       └──► Failed ──► (compensation) ──► Completed | Failed
/// any non-terminal ──► Cancelled ──► (compensation) ──► Completed | Failed
/// ```
///
/// Steps move `Pending ──► Running ──► Completed | Failed`, and a completed
/// step being undone moves `Compensating ──► CompensateSuccess | CompensateFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Pending,
    Running,
    Failed,
    Compensating,
    CompensateSuccess,
    CompensateFailed,
    Completed,
    Cancelled,
}

impl Status {
    /// Returns true if a saga in this status needs no further work.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
    }

    /// Returns the status name as persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::Running => "RUNNING",
            Status::Failed => "FAILED",
            Status::Compensating => "COMPENSATING",
            Status::CompensateSuccess => "COMPENSATE_SUCCESS",
            Status::CompensateFailed => "COMPENSATE_FAILED",
            Status::Completed => "COMPLETED",
            Status::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
