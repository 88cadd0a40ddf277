// src/model/state.rs

//! In-memory aggregate of one execution.
//!
//! [`ExecutionState`] is what the dispatcher, the resume manager and the
//! mutation operations work on while holding the execution lock. It keeps
//! the task graph in sync with each task's `parents` list, which is the only
//! form the edges take once persisted as an [`ExecutionRecord`].

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dag::DependencyGraph;
use crate::errors::{BatchdagError, Result};
use crate::model::task::Requirements;
use crate::model::{Execution, Stage, StageId, Task, TaskId, TaskName};
use crate::status::{Status, StatusCounts, execution_status, stage_status};
use crate::types::FailurePolicy;

/// Everything needed to add one task to an execution.
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub name: TaskName,
    pub command: String,
    pub parents: Vec<TaskId>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub requirements: Requirements,
    pub tags: BTreeMap<String, String>,
}

impl TaskSpec {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            ..Self::default()
        }
    }
}

/// Persisted form of an execution: the entity records, edges folded into
/// `Task::parents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution: Execution,
    pub stages: Vec<Stage>,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub execution: Execution,
    stages: Vec<Stage>,
    tasks: BTreeMap<TaskId, Task>,
    names: HashMap<TaskName, TaskId>,
    graph: DependencyGraph,
    next_stage_id: StageId,
    next_task_id: TaskId,
}

impl ExecutionState {
    pub fn new(execution: Execution) -> Self {
        Self {
            execution,
            stages: Vec::new(),
            tasks: BTreeMap::new(),
            names: HashMap::new(),
            graph: DependencyGraph::new(),
            next_stage_id: 1,
            next_task_id: 1,
        }
    }

    /// Append a stage; its number is its position in submission order.
    pub fn add_stage(&mut self, name: &str, policy: FailurePolicy) -> Result<StageId> {
        if self.stages.iter().any(|s| s.name == name) {
            return Err(BatchdagError::ConfigError(format!(
                "duplicate stage name '{name}'"
            )));
        }
        let id = self.next_stage_id;
        self.next_stage_id += 1;
        let number = self.stages.iter().map(|s| s.number).max().unwrap_or(0) + 1;
        self.stages.push(Stage::new(id, number, name, policy));
        Ok(id)
    }

    pub fn stage_mut(&mut self, id: StageId) -> Option<&mut Stage> {
        self.stages.iter_mut().find(|s| s.id == id)
    }

    /// Add a task to a stage. Parents must already exist; the graph rejects
    /// anything that would close a cycle and nothing is added in that case.
    pub fn add_task(&mut self, stage_id: StageId, spec: TaskSpec) -> Result<TaskId> {
        if self.names.contains_key(&spec.name) {
            return Err(BatchdagError::ConfigError(format!(
                "duplicate task name '{}'",
                spec.name
            )));
        }
        let stage_name = self
            .stage(stage_id)
            .map(|s| s.name.clone())
            .ok_or_else(|| BatchdagError::StageNotFound(format!("stage {stage_id}")))?;

        let id = self.next_task_id;
        self.graph.add_task(id, &spec.name, &spec.parents)?;
        self.next_task_id += 1;

        let output_dir = self.execution.output_dir.join(&stage_name).join(&spec.name);
        let log_dir = self
            .execution
            .output_dir
            .join("log")
            .join(&stage_name)
            .join(&spec.name);

        let mut task = Task::new(id, &spec.name, stage_id, &spec.command, output_dir, log_dir);
        task.inputs = spec.inputs;
        for output in &spec.outputs {
            task.declare_output(output);
        }
        task.requirements = spec.requirements;
        task.tags = spec.tags;
        task.parents = self.graph.parents_of(id).to_vec();

        self.names.insert(spec.name, id);
        self.tasks.insert(id, task);
        if let Some(stage) = self.stage_mut(stage_id) {
            stage.task_ids.push(id);
        }
        Ok(id)
    }

    /// Add parent edges to an existing task.
    pub fn add_dependencies(&mut self, child: TaskId, parents: &[TaskId]) -> Result<()> {
        self.graph.add_dependencies(child, parents)?;
        let synced = self.graph.parents_of(child).to_vec();
        if let Some(task) = self.tasks.get_mut(&child) {
            task.parents = synced;
        }
        Ok(())
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, id: StageId) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn stage_by_name(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub(crate) fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    pub fn task_by_name(&self, name: &str) -> Option<&Task> {
        self.names.get(name).and_then(|id| self.tasks.get(id))
    }

    pub fn task_id(&self, name: &str) -> Option<TaskId> {
        self.names.get(name).copied()
    }

    pub fn stage_of(&self, task: TaskId) -> Option<&Stage> {
        let stage_id = self.tasks.get(&task)?.stage_id;
        self.stage(stage_id)
    }

    pub fn tasks_of_stage(&self, stage_id: StageId) -> impl Iterator<Item = &Task> {
        self.stage(stage_id)
            .map(|s| s.task_ids.as_slice())
            .unwrap_or(&[])
            .iter()
            .filter_map(|id| self.tasks.get(id))
    }

    pub fn stage_counts(&self, stage_id: StageId) -> StatusCounts {
        StatusCounts::from_statuses(self.tasks_of_stage(stage_id).map(|t| t.status))
    }

    pub fn task_counts(&self) -> StatusCounts {
        StatusCounts::from_statuses(self.tasks.values().map(|t| t.status))
    }

    /// Stage status folded from its tasks. Returns `None` for unknown stages.
    pub fn stage_status(&self, stage_id: StageId) -> Option<Status> {
        let stage = self.stage(stage_id)?;
        Some(stage_status(
            self.tasks_of_stage(stage_id).map(|t| t.status),
            stage.is_tolerant(),
        ))
    }

    /// Execution status folded from the stages, ignoring the stored value.
    pub fn folded_status(&self) -> Status {
        execution_status(
            self.stages
                .iter()
                .filter_map(|s| self.stage_status(s.id)),
        )
    }

    /// Recompute the stored execution status unless it is sticky.
    pub fn refresh_status(&mut self) -> Status {
        if !self.execution.status_is_sticky() {
            let folded = self.folded_status();
            self.execution.set_status(folded);
        }
        self.execution.status
    }

    /// A non-tolerant stage has failed.
    pub fn failed_stage(&self) -> Option<&Stage> {
        self.stages
            .iter()
            .find(|s| !s.is_tolerant() && self.stage_status(s.id) == Some(Status::Failed))
    }

    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    pub fn in_flight(&self) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.status.is_in_flight())
            .map(|t| t.id)
            .collect()
    }

    /// Apply one task transition, enforcing the lifecycle rules and stamping
    /// timestamps. Returns the previous status.
    pub fn transition(&mut self, id: TaskId, to: Status) -> Result<Status> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or_else(|| BatchdagError::TaskNotFound(format!("task {id}")))?;
        let from = task.status;
        from.check_task_transition(id, to)?;

        let now = Utc::now();
        match to {
            Status::Submitted => task.submitted_at = Some(now),
            Status::Running => task.started_at = Some(now),
            s if s.is_terminal() => task.finished_at = Some(now),
            _ => {}
        }
        task.status = to;
        debug!(task = %task.name, %from, %to, "task transition");
        Ok(from)
    }

    /// Move every `no_attempt` task to `waiting`.
    pub fn mark_all_waiting(&mut self) -> Result<usize> {
        let ids: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.status == Status::NoAttempt)
            .map(|t| t.id)
            .collect();
        for id in &ids {
            self.transition(*id, Status::Waiting)?;
        }
        Ok(ids.len())
    }

    /// Detach a stage and its tasks, returning the removed tasks.
    ///
    /// Refused if a task outside the stage depends on one inside it.
    pub fn remove_stage(&mut self, stage_id: StageId) -> Result<Vec<Task>> {
        let stage = self
            .stage(stage_id)
            .cloned()
            .ok_or_else(|| BatchdagError::StageNotFound(format!("stage {stage_id}")))?;

        for &id in &stage.task_ids {
            for &child in self.graph.children_of(id) {
                if self.tasks.get(&child).map(|t| t.stage_id) != Some(stage_id) {
                    let child_name = self
                        .tasks
                        .get(&child)
                        .map(|t| t.name.clone())
                        .unwrap_or_default();
                    return Err(BatchdagError::ConfigError(format!(
                        "cannot delete stage '{}': task '{}' depends on it",
                        stage.name, child_name
                    )));
                }
            }
        }

        self.graph.remove_tasks(&stage.task_ids);
        let mut removed = Vec::new();
        for id in &stage.task_ids {
            if let Some(task) = self.tasks.remove(id) {
                self.names.remove(&task.name);
                removed.push(task);
            }
        }
        self.stages.retain(|s| s.id != stage_id);
        Ok(removed)
    }

    pub fn to_record(&self) -> ExecutionRecord {
        ExecutionRecord {
            execution: self.execution.clone(),
            stages: self.stages.clone(),
            tasks: self.tasks.values().cloned().collect(),
        }
    }

    /// Rebuild the aggregate (including the graph) from its persisted form.
    pub fn from_record(record: ExecutionRecord) -> Result<Self> {
        let mut state = ExecutionState::new(record.execution);
        state.next_stage_id = record.stages.iter().map(|s| s.id).max().unwrap_or(0) + 1;
        state.next_task_id = record.tasks.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        state.stages = record.stages;

        let mut tasks = record.tasks;
        tasks.sort_by_key(|t| t.id);

        // Register every node first so edges may reference any task.
        for task in &tasks {
            state.graph.add_task(task.id, &task.name, &[])?;
        }
        for task in &tasks {
            state.graph.add_dependencies(task.id, &task.parents)?;
        }
        for task in tasks {
            state.names.insert(task.name.clone(), task.id);
            state.tasks.insert(task.id, task);
        }
        Ok(state)
    }
}
