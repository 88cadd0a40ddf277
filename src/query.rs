// src/query.rs

//! Read-side views over an execution snapshot.
//!
//! Nothing here mutates state. Statuses and percentages are folded on every
//! call.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::adapter::JobHandle;
use crate::collector::StageUsage;
use crate::dag::Page;
use crate::errors::{BatchdagError, Result};
use crate::export::{GraphPayload, export};
use crate::model::{
    ExecutionId, ExecutionState, KillReason, Requirements, ResourceUsage, Stage, StageId,
    TaskFailure, TaskId, TaskName,
};
use crate::status::{Status, StatusCounts};
use crate::types::{FailurePolicy, GraphKind};

/// Default number of parents/children shown in a task detail.
pub const DEFAULT_NEIGHBOUR_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Percentages {
    pub successful: f64,
    /// Submitted and running.
    pub running: f64,
    pub failed: f64,
    pub killed: f64,
    pub waiting: f64,
}

impl From<&StatusCounts> for Percentages {
    fn from(c: &StatusCounts) -> Self {
        Self {
            successful: c.percent_successful(),
            running: c.percent_running(),
            failed: c.percent_failed(),
            killed: c.percent_killed(),
            waiting: c.percent_waiting(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSummary {
    pub id: StageId,
    pub number: u32,
    pub name: String,
    pub status: Status,
    pub failure_policy: FailurePolicy,
    pub tags: BTreeMap<String, String>,
    pub counts: StatusCounts,
    pub percent: Percentages,
    pub usage: StageUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionSummary {
    pub id: ExecutionId,
    pub name: String,
    pub status: Status,
    pub output_dir: PathBuf,
    pub info: BTreeMap<String, serde_json::Value>,
    pub created_on: DateTime<Utc>,
    pub started_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
    pub counts: StatusCounts,
    pub percent: Percentages,
    pub stages: Vec<StageSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskDetail {
    pub id: TaskId,
    pub name: TaskName,
    pub stage: String,
    pub status: Status,
    pub command: String,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub requirements: Requirements,
    pub tags: BTreeMap<String, String>,
    pub job_handle: Option<JobHandle>,
    pub exit_code: Option<i32>,
    pub failure: Option<TaskFailure>,
    pub kill_reason: Option<KillReason>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub usage: Option<ResourceUsage>,
    pub parents: Page<TaskName>,
    pub children: Page<TaskName>,
}

fn summarize_stage(state: &ExecutionState, stage: &Stage) -> StageSummary {
    let counts = state.stage_counts(stage.id);
    StageSummary {
        id: stage.id,
        number: stage.number,
        name: stage.name.clone(),
        status: state.stage_status(stage.id).unwrap_or_default(),
        failure_policy: stage.failure_policy,
        tags: stage.tags.clone(),
        percent: Percentages::from(&counts),
        counts,
        usage: StageUsage::aggregate(state.tasks_of_stage(stage.id).filter_map(|t| t.usage.as_ref())),
    }
}

pub fn summarize(state: &ExecutionState) -> ExecutionSummary {
    let counts = state.task_counts();
    let execution = &state.execution;
    ExecutionSummary {
        id: execution.id,
        name: execution.name.clone(),
        status: execution.status,
        output_dir: execution.output_dir.clone(),
        info: execution.info.clone(),
        created_on: execution.created_on,
        started_on: execution.started_on,
        finished_on: execution.finished_on,
        percent: Percentages::from(&counts),
        counts,
        stages: state
            .stages()
            .iter()
            .map(|s| summarize_stage(state, s))
            .collect(),
    }
}

pub fn stage_summary(state: &ExecutionState, name: &str) -> Result<StageSummary> {
    let stage = state
        .stage_by_name(name)
        .ok_or_else(|| BatchdagError::StageNotFound(name.to_string()))?;
    Ok(summarize_stage(state, stage))
}

fn task_id(state: &ExecutionState, name: &str) -> Result<TaskId> {
    state
        .task_id(name)
        .ok_or_else(|| BatchdagError::TaskNotFound(name.to_string()))
}

fn names(state: &ExecutionState, page: Page<TaskId>) -> Page<TaskName> {
    page.map(|id| state.task(id).map(|t| t.name.clone()).unwrap_or_default())
}

/// Direct parents of a task, first `limit` in insertion order.
pub fn task_parents(state: &ExecutionState, name: &str, limit: usize) -> Result<Page<TaskName>> {
    let id = task_id(state, name)?;
    Ok(names(state, state.graph().parents(id, limit)))
}

/// Direct children of a task, first `limit` in insertion order.
pub fn task_children(state: &ExecutionState, name: &str, limit: usize) -> Result<Page<TaskName>> {
    let id = task_id(state, name)?;
    Ok(names(state, state.graph().children(id, limit)))
}

pub fn task_detail(state: &ExecutionState, name: &str, limit: usize) -> Result<TaskDetail> {
    let id = task_id(state, name)?;
    let task = state
        .task(id)
        .ok_or_else(|| BatchdagError::TaskNotFound(name.to_string()))?;
    Ok(TaskDetail {
        id,
        name: task.name.clone(),
        stage: state.stage_of(id).map(|s| s.name.clone()).unwrap_or_default(),
        status: task.status,
        command: task.command.clone(),
        inputs: task.inputs.clone(),
        outputs: task.outputs.clone(),
        output_dir: task.output_dir.clone(),
        stdout: task.stdout_path(),
        stderr: task.stderr_path(),
        requirements: task.requirements,
        tags: task.tags.clone(),
        job_handle: task.job_handle.clone(),
        exit_code: task.exit_code,
        failure: task.failure.clone(),
        kill_reason: task.kill_reason,
        submitted_at: task.submitted_at,
        started_at: task.started_at,
        finished_at: task.finished_at,
        usage: task.usage,
        parents: names(state, state.graph().parents(id, limit)),
        children: names(state, state.graph().children(id, limit)),
    })
}

/// Graph export selected by type string: `recipe` or `task`.
pub fn graph_by_type(state: &ExecutionState, kind: &str) -> Result<GraphPayload> {
    let kind: GraphKind = kind.parse().map_err(BatchdagError::ConfigError)?;
    Ok(export(state, kind))
}
