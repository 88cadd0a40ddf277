// src/model/task.rs

//! Task metadata and lifecycle bookkeeping.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adapter::JobHandle;
use crate::errors::BatchdagError;
use crate::model::{StageId, TaskId, TaskName, ResourceUsage};
use crate::status::Status;

/// Resource hints passed to the adapter and used for capacity accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub cpus: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    /// Wall-time limit; the task is killed once it runs longer.
    #[serde(default)]
    pub time_limit_secs: Option<u64>,
}

impl Requirements {
    /// Cpus counted against the execution ceiling (a task always uses one).
    pub fn effective_cpus(&self) -> u32 {
        self.cpus.unwrap_or(1).max(1)
    }

    pub fn effective_memory_mb(&self) -> u64 {
        self.memory_mb.unwrap_or(0)
    }
}

/// Why a task ended up `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskFailure {
    /// The process exited with a nonzero code.
    ExitCode { code: i32 },
    /// Exit code 0, but declared outputs were absent.
    MissingOutput { paths: Vec<PathBuf> },
    /// The adapter reported the job ended abnormally.
    Abnormal { message: String },
    /// Adapter calls kept failing beyond the retry bound.
    AdapterUnavailable { message: String },
    /// The job never reported running within the heartbeat bound.
    HeartbeatTimeout { secs: u64 },
}

impl TaskFailure {
    pub fn to_error(&self, task: &str) -> BatchdagError {
        match self {
            TaskFailure::MissingOutput { paths } => BatchdagError::MissingOutputError {
                task: task.to_string(),
                missing: paths.clone(),
            },
            TaskFailure::AdapterUnavailable { message } => {
                BatchdagError::AdapterUnavailable(message.clone())
            }
            other => BatchdagError::TaskExecutionError {
                task: task.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFailure::ExitCode { code } => write!(f, "exit code {code}"),
            TaskFailure::MissingOutput { paths } => write!(f, "missing outputs {paths:?}"),
            TaskFailure::Abnormal { message } => write!(f, "abnormal termination: {message}"),
            TaskFailure::AdapterUnavailable { message } => {
                write!(f, "resource manager unavailable: {message}")
            }
            TaskFailure::HeartbeatTimeout { secs } => {
                write!(f, "no heartbeat within {secs}s of submission")
            }
        }
    }
}

/// Why a task ended up `killed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    /// Explicit kill of the execution or stage.
    Cancelled,
    /// Exceeded `time_limit_secs`.
    Timeout,
    /// A parent failed and the task can never become ready.
    UpstreamFailed,
    /// A non-tolerant stage failed; remaining work was skipped.
    ExecutionFailed,
}

/// One schedulable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: TaskName,
    pub stage_id: StageId,
    pub status: Status,
    pub command: String,
    #[serde(default)]
    pub inputs: Vec<PathBuf>,
    /// Declared outputs, already resolved against `output_dir`.
    #[serde(default)]
    pub outputs: Vec<PathBuf>,
    #[serde(default)]
    pub requirements: Requirements,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Direct parents in insertion order. This is the persisted edge set.
    #[serde(default)]
    pub parents: Vec<TaskId>,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    #[serde(default)]
    pub job_handle: Option<JobHandle>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub failure: Option<TaskFailure>,
    #[serde(default)]
    pub kill_reason: Option<KillReason>,
    /// Consecutive transient adapter errors on this task.
    #[serde(default)]
    pub adapter_errors: u32,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage: Option<ResourceUsage>,
    /// Ended by the orchestrator while its job was live. The job's own
    /// terminal report (exit code, accounting) is still outstanding.
    #[serde(default)]
    pub awaiting_report: bool,
}

impl Task {
    pub fn new(
        id: TaskId,
        name: &str,
        stage_id: StageId,
        command: &str,
        output_dir: PathBuf,
        log_dir: PathBuf,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            stage_id,
            status: Status::NoAttempt,
            command: command.to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            requirements: Requirements::default(),
            tags: BTreeMap::new(),
            parents: Vec::new(),
            output_dir,
            log_dir,
            job_handle: None,
            exit_code: None,
            failure: None,
            kill_reason: None,
            adapter_errors: 0,
            submitted_at: None,
            started_at: None,
            finished_at: None,
            usage: None,
            awaiting_report: false,
        }
    }

    /// Declare an output; relative paths resolve against the task's output
    /// directory.
    pub fn declare_output(&mut self, path: impl AsRef<Path>) {
        let resolved = self.resolve_output(path);
        self.outputs.push(resolved);
    }

    pub fn resolve_output(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.output_dir.join(path)
        }
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.log_dir.join("stdout.txt")
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.log_dir.join("stderr.txt")
    }

    /// Clear everything a previous attempt left behind.
    pub fn reset_attempt(&mut self) {
        self.job_handle = None;
        self.exit_code = None;
        self.failure = None;
        self.kill_reason = None;
        self.adapter_errors = 0;
        self.submitted_at = None;
        self.started_at = None;
        self.finished_at = None;
        self.usage = None;
        self.awaiting_report = false;
    }
}
