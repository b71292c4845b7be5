// SPDX-License-Identifier: MIT

//! The closed set of task status strings a `TaskRuntime` publishes, and
//! the read-only projection exposed to control-surface callers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A task's published lifecycle status. `Display` renders exactly the
/// strings the configuration/control-surface contract names, including
/// the two parameterized "…: <detail>" forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    NotStarted,
    Starting,
    Started,
    RestartValidation,
    RestartOk,
    NewInstanceFailed,
    NewInstanceExitedTooFast,
    Finished,
    FinishedWithError(String),
    StartFailed(String),
    Stopped,
}

impl TaskStatus {
    pub fn is_terminalish(&self) -> bool {
        matches!(
            self,
            TaskStatus::Finished | TaskStatus::FinishedWithError(_) | TaskStatus::Stopped
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::NotStarted => write!(f, "not started"),
            TaskStatus::Starting => write!(f, "starting"),
            TaskStatus::Started => write!(f, "started"),
            TaskStatus::RestartValidation => write!(f, "restart validation"),
            TaskStatus::RestartOk => write!(f, "restart ok"),
            TaskStatus::NewInstanceFailed => write!(f, "new instance failed"),
            TaskStatus::NewInstanceExitedTooFast => write!(f, "new instance exited too fast"),
            TaskStatus::Finished => write!(f, "finished"),
            TaskStatus::FinishedWithError(detail) => {
                write!(f, "finished with error: {detail}")
            }
            TaskStatus::StartFailed(detail) => write!(f, "start failed: {detail}"),
            TaskStatus::Stopped => write!(f, "stopped"),
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::NotStarted
    }
}

/// The observable projection of a `TaskRuntime`, produced on demand
/// from its atomic fields — safe to serialize directly as a control
/// surface status response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatusView {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
}

impl TaskStatusView {
    pub fn new(status: &TaskStatus, started: Option<DateTime<Utc>>, finished: Option<DateTime<Utc>>) -> Self {
        Self {
            status: status.to_string(),
            started,
            finished,
        }
    }
}
