#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use batchdag::config::{
    RawWorkflowFile, SettingsSection, StageConfig, TaskConfig, WorkflowFile, apply_workflow,
};
use batchdag::engine::{DispatchSettings, Dispatcher, Orchestrator, StartOptions};
use batchdag::fs::MockFileSystem;
use batchdag::model::{Execution, ExecutionState};
use batchdag::store::MemoryStore;
use batchdag::types::FailurePolicy;

use crate::scripted_adapter::ScriptedAdapter;

/// Builder for `WorkflowFile` to simplify test setup.
pub struct WorkflowBuilder {
    raw: RawWorkflowFile,
}

impl WorkflowBuilder {
    pub fn new() -> Self {
        Self {
            raw: RawWorkflowFile {
                config: SettingsSection::default(),
                stage: Vec::new(),
            },
        }
    }

    pub fn configure(mut self, f: impl FnOnce(&mut SettingsSection)) -> Self {
        f(&mut self.raw.config);
        self
    }

    pub fn stage(mut self, stage: StageBuilder) -> Self {
        self.raw.stage.push(stage.build());
        self
    }

    pub fn raw(self) -> RawWorkflowFile {
        self.raw
    }

    pub fn build(self) -> WorkflowFile {
        WorkflowFile::try_from(self.raw).expect("Failed to build valid workflow from builder")
    }
}

impl Default for WorkflowBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `StageConfig`.
pub struct StageBuilder {
    stage: StageConfig,
}

impl StageBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            stage: StageConfig {
                name: name.to_string(),
                failure_policy: FailurePolicy::default(),
                after_stages: Vec::new(),
                tags: Default::default(),
                task: Vec::new(),
            },
        }
    }

    pub fn policy(mut self, policy: FailurePolicy) -> Self {
        self.stage.failure_policy = policy;
        self
    }

    pub fn after_stage(mut self, stage: &str) -> Self {
        self.stage.after_stages.push(stage.to_string());
        self
    }

    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.stage.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn task(mut self, task: TaskBuilder) -> Self {
        self.stage.task.push(task.build());
        self
    }

    pub fn build(self) -> StageConfig {
        self.stage
    }
}

/// Builder for `TaskConfig`.
pub struct TaskBuilder {
    task: TaskConfig,
}

impl TaskBuilder {
    pub fn new(name: &str, cmd: &str) -> Self {
        Self {
            task: TaskConfig {
                name: name.to_string(),
                cmd: cmd.to_string(),
                after: Vec::new(),
                inputs: Vec::new(),
                outputs: Vec::new(),
                cpus: None,
                memory_mb: None,
                time_limit_secs: None,
                tags: Default::default(),
            },
        }
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.task.after.push(dep.to_string());
        self
    }

    pub fn output(mut self, path: &str) -> Self {
        self.task.outputs.push(PathBuf::from(path));
        self
    }

    pub fn cpus(mut self, cpus: u32) -> Self {
        self.task.cpus = Some(cpus);
        self
    }

    pub fn memory_mb(mut self, mb: u64) -> Self {
        self.task.memory_mb = Some(mb);
        self
    }

    pub fn time_limit_secs(mut self, secs: u64) -> Self {
        self.task.time_limit_secs = Some(secs);
        self
    }

    pub fn build(self) -> TaskConfig {
        self.task
    }
}

/// Dispatch settings with millisecond timings so loops finish quickly.
pub fn fast_settings() -> DispatchSettings {
    DispatchSettings {
        poll_interval: Duration::from_millis(1),
        retry_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
        ..DispatchSettings::default()
    }
}

/// An orchestrator over a scripted adapter, an in-memory store and a mock
/// filesystem, all shared with the test.
pub struct Harness {
    pub adapter: ScriptedAdapter,
    pub store: MemoryStore,
    pub fs: MockFileSystem,
    pub orch: Orchestrator<ScriptedAdapter>,
}

impl Harness {
    pub fn new(settings: DispatchSettings) -> Self {
        let fs = MockFileSystem::new();
        let adapter = ScriptedAdapter::new().with_fs(fs.clone());
        Self::with_adapter(adapter, fs, settings)
    }

    pub fn with_adapter(adapter: ScriptedAdapter, fs: MockFileSystem, settings: DispatchSettings) -> Self {
        let store = MemoryStore::new();
        let orch = Orchestrator::new(
            Arc::new(adapter.clone()),
            Arc::new(store.clone()),
            Arc::new(fs.clone()),
            settings,
        );
        Self {
            adapter,
            store,
            fs,
            orch,
        }
    }

    /// A dispatcher sharing the harness collaborators, for driving the loop
    /// one iteration at a time.
    pub fn dispatcher(&self) -> Dispatcher<ScriptedAdapter> {
        Dispatcher::new(
            Arc::new(self.adapter.clone()),
            Arc::new(self.store.clone()),
            Arc::new(self.fs.clone()),
            self.orch.settings().clone(),
        )
    }
}

/// A fresh execution with `workflow` rendered and every task `waiting`.
pub fn rendered_state(name: &str, workflow: &WorkflowFile) -> ExecutionState {
    let execution = Execution::new(1, name, PathBuf::from("/out").join(name))
        .expect("valid execution name");
    let mut state = ExecutionState::new(execution);
    apply_workflow(&mut state, workflow).expect("workflow renders");
    state.mark_all_waiting().expect("tasks start waiting");
    state
}

/// Start options for a fresh execution under `/out/<name>`.
pub fn start_options(name: &str) -> StartOptions {
    StartOptions {
        name: name.to_string(),
        output_dir: PathBuf::from("/out").join(name),
        ..StartOptions::default()
    }
}
