// src/status/mod.rs

//! Lifecycle states shared by tasks, stages and executions.
//!
//! - [`Status`] is the single state enum for all three entity kinds.
//! - [`fold`] derives stage and execution status from their children.
//!
//! Task transitions are checked by [`Status::check_task_transition`]; stage
//! and execution statuses are never set directly from task events, they are
//! always folded.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{BatchdagError, Result};
use crate::model::TaskId;

pub mod fold;

pub use fold::{StatusCounts, execution_status, stage_status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    NoAttempt,
    Waiting,
    Submitted,
    Running,
    Successful,
    Failed,
    Killed,
    /// Stage/execution only: some tasks failed under a tolerant policy.
    FailedButContinued,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Successful | Status::Failed | Status::Killed | Status::FailedButContinued
        )
    }

    /// Submitted to the adapter and not yet reported terminal.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Status::Submitted | Status::Running)
    }

    pub fn is_successful(self) -> bool {
        matches!(self, Status::Successful)
    }

    /// Whether a task may move from `self` to `to`.
    ///
    /// The resume-only edges (`failed`, `killed` and in-flight back to
    /// `waiting`) are allowed here; the resume manager is the only caller
    /// that takes them.
    pub fn task_transition_allowed(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (NoAttempt, Waiting)
                | (Waiting, Submitted)
                | (Waiting, Killed)
                | (Submitted, Running)
                | (Submitted, Failed)
                | (Submitted, Killed)
                | (Running, Successful)
                | (Running, Failed)
                | (Running, Killed)
                | (Failed, Waiting)
                | (Killed, Waiting)
                | (Submitted, Waiting)
                | (Running, Waiting)
        )
    }

    pub fn check_task_transition(self, task: TaskId, to: Status) -> Result<()> {
        if self.task_transition_allowed(to) {
            Ok(())
        } else {
            Err(BatchdagError::InvalidTransition {
                task,
                from: self,
                to,
            })
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::NoAttempt => "no_attempt",
            Status::Waiting => "waiting",
            Status::Submitted => "submitted",
            Status::Running => "running",
            Status::Successful => "successful",
            Status::Failed => "failed",
            Status::Killed => "killed",
            Status::FailedButContinued => "failed_but_continued",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "no_attempt" => Ok(Status::NoAttempt),
            "waiting" => Ok(Status::Waiting),
            "submitted" => Ok(Status::Submitted),
            "running" => Ok(Status::Running),
            "successful" => Ok(Status::Successful),
            "failed" => Ok(Status::Failed),
            "killed" => Ok(Status::Killed),
            "failed_but_continued" => Ok(Status::FailedButContinued),
            other => Err(format!("invalid status: {other}")),
        }
    }
}
