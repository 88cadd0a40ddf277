// src/config/render.rs

//! Turn a validated workflow definition into execution entities.

use std::path::PathBuf;

use tracing::{debug, info};

use crate::config::model::{TaskConfig, WorkflowFile};
use crate::config::validate::declared_edges;
use crate::errors::{BatchdagError, Result};
use crate::model::{ExecutionState, Requirements, TaskSpec};
use crate::status::Status;

/// What [`apply_workflow`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderSummary {
    pub added_stages: usize,
    pub added_tasks: usize,
    /// Unfinished tasks whose definition was refreshed.
    pub refreshed_tasks: usize,
}

fn task_spec(tc: &TaskConfig) -> TaskSpec {
    TaskSpec {
        name: tc.name.clone(),
        command: tc.cmd.clone(),
        parents: Vec::new(),
        inputs: tc.inputs.clone(),
        outputs: tc.outputs.clone(),
        requirements: Requirements {
            cpus: tc.cpus,
            memory_mb: tc.memory_mb,
            time_limit_secs: tc.time_limit_secs,
        },
        tags: tc.tags.clone(),
    }
}

/// Add the workflow's stages, tasks and edges to `state`.
///
/// On a fresh state this renders everything. On a resumed state, stages and
/// tasks that already exist are kept (their status untouched); new ones are
/// appended. Unfinished existing tasks pick up an edited command,
/// requirements, inputs, outputs and tags. Successful tasks are never
/// modified.
pub fn apply_workflow(state: &mut ExecutionState, workflow: &WorkflowFile) -> Result<RenderSummary> {
    let mut summary = RenderSummary::default();

    for sc in &workflow.stage {
        let stage_id = match state.stage_by_name(&sc.name) {
            Some(stage) => stage.id,
            None => {
                let id = state.add_stage(&sc.name, sc.failure_policy)?;
                if let Some(stage) = state.stage_mut(id) {
                    stage.tags = sc.tags.clone();
                }
                summary.added_stages += 1;
                id
            }
        };

        for tc in &sc.task {
            match state.task_id(&tc.name) {
                None => {
                    state.add_task(stage_id, task_spec(tc))?;
                    summary.added_tasks += 1;
                }
                Some(id) => {
                    if state.task(id).map(|t| t.stage_id) != Some(stage_id) {
                        return Err(BatchdagError::ConfigError(format!(
                            "task '{}' moved to a different stage; cannot resume",
                            tc.name
                        )));
                    }
                    if refresh_task(state, id, tc) {
                        summary.refreshed_tasks += 1;
                    }
                }
            }
        }
    }

    for (parent, child) in declared_edges(&workflow.stage) {
        let (Some(p), Some(c)) = (state.task_id(parent), state.task_id(child)) else {
            continue;
        };
        state.add_dependencies(c, &[p])?;
    }

    info!(
        execution = %state.execution.name,
        stages = state.stages().len(),
        added_stages = summary.added_stages,
        added_tasks = summary.added_tasks,
        refreshed_tasks = summary.refreshed_tasks,
        "workflow rendered"
    );
    Ok(summary)
}

fn refresh_task(state: &mut ExecutionState, id: u64, tc: &TaskConfig) -> bool {
    let Some(task) = state.task_mut(id) else {
        return false;
    };
    if task.status == Status::Successful {
        return false;
    }

    let spec = task_spec(tc);
    let outputs: Vec<PathBuf> = spec.outputs.iter().map(|p| task.resolve_output(p)).collect();
    let changed = task.command != spec.command
        || task.requirements != spec.requirements
        || task.inputs != spec.inputs
        || task.outputs != outputs
        || task.tags != spec.tags;
    if changed {
        debug!(task = %task.name, "refreshing unfinished task from workflow");
        task.command = spec.command;
        task.requirements = spec.requirements;
        task.inputs = spec.inputs;
        task.outputs = outputs;
        task.tags = spec.tags;
    }
    changed
}
