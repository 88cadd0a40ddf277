// src/adapter/mod.rs

//! Resource-manager adapters.
//!
//! The dispatch loop talks to a [`ResourceManager`] instead of spawning
//! processes itself. This keeps backend details (local process pool, a grid
//! scheduler, a batch service) out of the orchestration core and makes it
//! easy to swap in a scripted fake in tests.
//!
//! - [`local`] runs tasks as local shell processes.
//! - [`dry`] accepts every job and reports success without running it.
//! - [`procfs`] samples cpu/memory of local processes on Linux.
//! - [`backend`] is the configuration-selected [`Backend`] enum.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::model::{Requirements, ResourceUsage, Task, TaskId, TaskName};

pub mod backend;
pub mod dry;
pub mod local;
pub mod procfs;

pub use backend::Backend;
pub use dry::DryAdapter;
pub use local::LocalAdapter;

/// Boxed future returned by adapter calls.
pub type AdapterFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Opaque backend job identifier, persisted on the task so a restarted
/// orchestrator can re-attach.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(pub String);

impl JobHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Live state of a job as the backend sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted but not started (queued in the backend).
    Pending,
    Running,
    /// The job ran to completion and exited with `exit_code`.
    Succeeded { exit_code: i32 },
    /// The job failed; negative codes mean it did not exit normally.
    Failed { exit_code: i32 },
    /// The backend killed the job (cancellation, preemption, limits).
    Killed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded { .. } | JobState::Failed { .. } | JobState::Killed
        )
    }
}

/// What an adapter needs to run one task.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub task_id: TaskId,
    pub name: TaskName,
    pub command: String,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    /// Declared outputs, resolved. Backends that stage files out use these.
    pub outputs: Vec<PathBuf>,
    pub requirements: Requirements,
}

impl JobRequest {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            name: task.name.clone(),
            command: task.command.clone(),
            output_dir: task.output_dir.clone(),
            log_dir: task.log_dir.clone(),
            stdout: task.stdout_path(),
            stderr: task.stderr_path(),
            outputs: task.outputs.clone(),
            requirements: task.requirements,
        }
    }
}

/// Capability set every backend implements.
///
/// All methods take `&self` so the dispatcher can issue submissions and
/// polls concurrently within one iteration.
pub trait ResourceManager: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Hand one job to the backend.
    fn submit(&self, job: JobRequest) -> AdapterFuture<'_, JobHandle>;

    /// Current state of a job. Unknown handles fail with
    /// [`crate::errors::BatchdagError::UnknownJob`].
    fn poll(&self, handle: &JobHandle) -> AdapterFuture<'_, JobState>;

    /// Accounting for a finished job. Fields the backend cannot measure are
    /// left unknown. Asked once per job, after a terminal poll; a backend may
    /// forget the job once it has answered.
    fn accounting(&self, handle: &JobHandle) -> AdapterFuture<'_, ResourceUsage>;

    /// Best-effort cancellation; the job may still finish afterwards.
    fn cancel(&self, handle: &JobHandle) -> AdapterFuture<'_, ()>;

    /// Whether successful jobs actually write their declared outputs. Backends
    /// that do not run anything opt out of output verification.
    fn produces_outputs(&self) -> bool {
        true
    }
}
