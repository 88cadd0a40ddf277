// src/errors.rs

//! Crate-wide error type and result alias.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::{TaskId, TaskName};
use crate::status::Status;

#[derive(Error, Debug)]
pub enum BatchdagError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Stage not found: {0}")]
    StageNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    /// Adding the given edges would close a cycle in the task DAG.
    #[error("Cycle detected in DAG: adding {parent} -> {child} closes a cycle")]
    CycleError { parent: TaskName, child: TaskName },

    /// The resource manager could not be reached. Transient.
    #[error("Resource manager unavailable: {0}")]
    AdapterUnavailable(String),

    /// The resource manager has no record of this job handle.
    #[error("Unknown job handle: {0}")]
    UnknownJob(String),

    #[error("Task '{task}' failed: {reason}")]
    TaskExecutionError { task: TaskName, reason: String },

    #[error("Task '{task}' finished without declared outputs: {missing:?}")]
    MissingOutputError { task: TaskName, missing: Vec<PathBuf> },

    /// No task is in flight, none is ready, yet some are not terminal.
    #[error("Execution '{execution}' stalled; unsatisfiable tasks: {tasks:?}")]
    StalledExecutionError {
        execution: String,
        tasks: Vec<TaskName>,
    },

    /// Another live process is driving this execution.
    #[error("Execution '{execution}' is held by process {pid}")]
    ExecutionBusy { execution: String, pid: u32 },

    #[error("Invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition { task: TaskId, from: Status, to: Status },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BatchdagError {
    /// Whether the dispatch loop should retry the failed call.
    pub fn is_transient(&self) -> bool {
        matches!(self, BatchdagError::AdapterUnavailable(_))
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, BatchdagError>;
