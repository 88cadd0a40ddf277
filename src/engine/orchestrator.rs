// src/engine/orchestrator.rs

//! Execution-level operations: start, resume, run, kill, delete stage.
//!
//! The orchestrator owns no execution state. Every operation takes (or
//! returns) an [`ExecutionHandle`] and does its work while holding that
//! handle's lock.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::adapter::ResourceManager;
use crate::config::{WorkflowFile, apply_workflow};
use crate::errors::{BatchdagError, Result};
use crate::fs::FileSystem;
use crate::model::{Execution, ExecutionRecord, ExecutionState, KillReason, TaskId};
use crate::status::Status;
use crate::store::ExecutionStore;

use super::core::{self as dispatch, KillSet};
use super::resume::{ResumeManager, ResumePlan};
use super::runtime::Dispatcher;
use super::{DispatchSettings, ExecutionHandle};

/// Options for [`Orchestrator::start`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub name: String,
    pub output_dir: PathBuf,
    /// Delete any previous execution of this name (record and outputs) first.
    pub restart: bool,
    /// When resuming, rerun failed tasks too.
    pub retry_failed: bool,
    /// Recorded as `info.last_cmd_executed`.
    pub command_line: Option<String>,
}

/// Result of [`Orchestrator::start`]. `plan` is set when an existing
/// execution was resumed.
#[derive(Debug, Clone)]
pub struct Started {
    pub handle: ExecutionHandle,
    pub plan: Option<ResumePlan>,
}

pub struct Orchestrator<R: ResourceManager> {
    adapter: Arc<R>,
    store: Arc<dyn ExecutionStore>,
    fs: Arc<dyn FileSystem>,
    settings: DispatchSettings,
}

impl<R: ResourceManager> Clone for Orchestrator<R> {
    fn clone(&self) -> Self {
        Self {
            adapter: Arc::clone(&self.adapter),
            store: Arc::clone(&self.store),
            fs: Arc::clone(&self.fs),
            settings: self.settings.clone(),
        }
    }
}

impl<R: ResourceManager> Orchestrator<R> {
    pub fn new(
        adapter: Arc<R>,
        store: Arc<dyn ExecutionStore>,
        fs: Arc<dyn FileSystem>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            adapter,
            store,
            fs,
            settings,
        }
    }

    pub fn store(&self) -> &dyn ExecutionStore {
        self.store.as_ref()
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    fn dispatcher(&self) -> Dispatcher<R> {
        Dispatcher::new(
            Arc::clone(&self.adapter),
            Arc::clone(&self.store),
            Arc::clone(&self.fs),
            self.settings.clone(),
        )
    }

    fn resume_manager(&self) -> ResumeManager<R> {
        ResumeManager::new(
            Arc::clone(&self.adapter),
            Arc::clone(&self.fs),
            self.settings.clone(),
        )
    }

    fn persist(&self, state: &ExecutionState) -> Result<()> {
        self.store.save(&state.to_record())
    }

    fn load_record(&self, name: &str) -> Result<ExecutionRecord> {
        let record = self
            .store
            .load_by_name(name)?
            .ok_or_else(|| BatchdagError::ExecutionNotFound(name.to_string()))?;
        if record.execution.deleted {
            return Err(BatchdagError::ExecutionNotFound(format!(
                "{name} (deleted)"
            )));
        }
        Ok(record)
    }

    /// Load a persisted execution without changing it.
    pub fn open(&self, name: &str) -> Result<ExecutionHandle> {
        let record = self.load_record(name)?;
        Ok(ExecutionHandle::new(ExecutionState::from_record(record)?))
    }

    /// Create an execution from a workflow, or resume the existing one of the
    /// same name. With `restart` the previous record and output directory are
    /// removed first.
    pub async fn start(&self, workflow: &WorkflowFile, opts: StartOptions) -> Result<Started> {
        Execution::validate_name(&opts.name)?;
        self.discard_kill_request(&opts.name)?;
        let mut existing = self.store.load_by_name(&opts.name)?;

        if opts.restart {
            if let Some(record) = existing.take() {
                warn!(execution = %opts.name, output_dir = %record.execution.output_dir.display(), "restart requested; deleting previous execution");
                self.fs.remove_dir_all(&record.execution.output_dir)?;
                self.store.delete(&opts.name)?;
            }
        }

        let (handle, plan) = match existing {
            Some(record) => {
                if record.execution.deleted {
                    return Err(BatchdagError::ConfigError(format!(
                        "execution '{}' was deleted; use restart to reuse the name",
                        opts.name
                    )));
                }
                if record.execution.output_dir != opts.output_dir {
                    return Err(BatchdagError::ConfigError(format!(
                        "execution '{}' already uses output dir {}; cannot resume into {}",
                        opts.name,
                        record.execution.output_dir.display(),
                        opts.output_dir.display()
                    )));
                }
                let mut state = ExecutionState::from_record(record)?;
                apply_workflow(&mut state, workflow)?;
                let handle = ExecutionHandle::new(state);
                let plan = self.resume_manager().resume(&handle, opts.retry_failed).await?;
                (handle, Some(plan))
            }
            None => {
                let id = self.store.next_id()?;
                let mut execution = Execution::new(id, &opts.name, opts.output_dir.clone())?;
                execution.max_cpus = self.settings.max_cpus;
                let mut state = ExecutionState::new(execution);
                apply_workflow(&mut state, workflow)?;
                info!(execution = %opts.name, id, tasks = state.tasks().count(), "execution created");
                (ExecutionHandle::new(state), None)
            }
        };

        {
            let mut state = handle.lock().await;
            if let Some(cmd) = &opts.command_line {
                state
                    .execution
                    .info
                    .insert("last_cmd_executed".to_string(), serde_json::json!(cmd));
            }
            self.persist(&state)?;
        }
        Ok(Started { handle, plan })
    }

    /// Resume a persisted execution by name, optionally picking up new
    /// stages and tasks from an edited workflow.
    pub async fn resume(
        &self,
        name: &str,
        workflow: Option<&WorkflowFile>,
        retry_failed: bool,
    ) -> Result<(ExecutionHandle, ResumePlan)> {
        let record = self.load_record(name)?;
        self.discard_kill_request(name)?;
        let mut state = ExecutionState::from_record(record)?;
        if let Some(workflow) = workflow {
            apply_workflow(&mut state, workflow)?;
        }
        let handle = ExecutionHandle::new(state);
        let plan = self.resume_manager().resume(&handle, retry_failed).await?;
        self.persist(&*handle.lock().await)?;
        Ok((handle, plan))
    }

    /// Drive the execution to a terminal status.
    pub async fn run(&self, handle: &ExecutionHandle) -> Result<Status> {
        self.dispatcher().run(handle).await
    }

    /// Kill every non-terminal task and mark the execution `killed`. A
    /// finished execution is left as it is.
    pub async fn kill(&self, handle: &ExecutionHandle) -> Result<KillSet> {
        let mut state = handle.lock().await;
        let set = self.dispatcher().kill_all(&mut state).await?;
        if !set.is_empty() {
            self.persist(&state)?;
        }
        Ok(set)
    }

    /// Ask the process currently driving `name` to kill it.
    pub fn request_kill(&self, name: &str) -> Result<()> {
        self.load_record(name)?;
        self.store.request_kill(name)?;
        info!(execution = %name, "kill requested");
        Ok(())
    }

    fn discard_kill_request(&self, name: &str) -> Result<()> {
        if self.store.take_kill_request(name)? {
            info!(execution = %name, "discarding kill request left by an earlier run");
        }
        Ok(())
    }

    /// Kill the non-terminal tasks of one stage. The execution keeps going;
    /// tasks depending on the killed ones are skipped by the dispatch loop.
    pub async fn kill_stage(&self, handle: &ExecutionHandle, stage: &str) -> Result<KillSet> {
        let mut state = handle.lock().await;
        let stage_id = state
            .stage_by_name(stage)
            .map(|s| s.id)
            .ok_or_else(|| BatchdagError::StageNotFound(stage.to_string()))?;
        let ids: Vec<TaskId> = state.tasks_of_stage(stage_id).map(|t| t.id).collect();
        let set = dispatch::kill_tasks(&mut state, &ids, KillReason::Cancelled)?;
        self.dispatcher().cancel_and_record(&mut state, &set).await;
        state.refresh_status();
        warn!(execution = %state.execution.name, %stage, killed = set.killed.len(), "stage killed");
        self.persist(&state)?;
        Ok(set)
    }

    /// Remove a stage, its tasks, their edges and their output and log
    /// directories. Irreversible.
    pub async fn delete_stage(&self, handle: &ExecutionHandle, stage: &str) -> Result<usize> {
        let mut state = handle.lock().await;
        let stage_id = state
            .stage_by_name(stage)
            .map(|s| s.id)
            .ok_or_else(|| BatchdagError::StageNotFound(stage.to_string()))?;

        if let Some(task) = state.tasks_of_stage(stage_id).find(|t| t.status.is_in_flight()) {
            return Err(BatchdagError::ConfigError(format!(
                "cannot delete stage '{stage}': task '{}' is {}",
                task.name, task.status
            )));
        }

        let removed = state.remove_stage(stage_id)?;
        for task in &removed {
            self.fs.remove_dir_all(&task.output_dir)?;
            self.fs.remove_dir_all(&task.log_dir)?;
        }
        let out = state.execution.output_dir.clone();
        self.fs.remove_dir_all(&out.join(stage))?;
        self.fs.remove_dir_all(&out.join("log").join(stage))?;

        state.refresh_status();
        info!(execution = %state.execution.name, %stage, tasks = removed.len(), "stage deleted");
        self.persist(&state)?;
        Ok(removed.len())
    }
}
