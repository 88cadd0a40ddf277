// src/export.rs

//! Stage-level and task-level graph payloads for external consumers.
//!
//! Both views are computed from a snapshot of the execution and carry node
//! status so a dashboard can color them. The payload serializes to JSON and
//! can be rendered as Graphviz DOT.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::Serialize;

use crate::model::{ExecutionState, StageId, TaskId};
use crate::status::Status;
use crate::types::GraphKind;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    /// `stage-<id>` or `task-<id>`.
    pub id: String,
    pub name: String,
    pub stage: String,
    pub status: Status,
    /// Stage graph only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphPayload {
    pub kind: GraphKind,
    pub execution: String,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

fn stage_key(id: StageId) -> String {
    format!("stage-{id}")
}

fn task_key(id: TaskId) -> String {
    format!("task-{id}")
}

/// Build the requested view.
pub fn export(state: &ExecutionState, kind: GraphKind) -> GraphPayload {
    match kind {
        GraphKind::Recipe => stage_graph(state),
        GraphKind::Task => task_graph(state),
    }
}

/// Nodes are stages in submission order; A -> B iff a task in A is a parent
/// of a task in B.
pub fn stage_graph(state: &ExecutionState) -> GraphPayload {
    let nodes = state
        .stages()
        .iter()
        .map(|s| GraphNode {
            id: stage_key(s.id),
            name: s.name.clone(),
            stage: s.name.clone(),
            status: state.stage_status(s.id).unwrap_or_default(),
            task_count: Some(s.task_ids.len()),
        })
        .collect();

    let number_of = |id: StageId| state.stage(id).map(|s| s.number).unwrap_or(u32::MAX);
    let mut pairs: BTreeSet<(u32, u32, StageId, StageId)> = BTreeSet::new();
    for task in state.tasks() {
        for parent in state.graph().parents_of(task.id) {
            let Some(parent_stage) = state.task(*parent).map(|p| p.stage_id) else {
                continue;
            };
            if parent_stage != task.stage_id {
                pairs.insert((
                    number_of(parent_stage),
                    number_of(task.stage_id),
                    parent_stage,
                    task.stage_id,
                ));
            }
        }
    }
    let edges = pairs
        .into_iter()
        .map(|(_, _, a, b)| GraphEdge {
            source: stage_key(a),
            target: stage_key(b),
        })
        .collect();

    GraphPayload {
        kind: GraphKind::Recipe,
        execution: state.execution.name.clone(),
        nodes,
        edges,
    }
}

/// Nodes are tasks in insertion order; edges are direct parent -> child.
pub fn task_graph(state: &ExecutionState) -> GraphPayload {
    let nodes = state
        .tasks()
        .map(|t| GraphNode {
            id: task_key(t.id),
            name: t.name.clone(),
            stage: state.stage_of(t.id).map(|s| s.name.clone()).unwrap_or_default(),
            status: t.status,
            task_count: None,
        })
        .collect();

    let edges = state
        .tasks()
        .flat_map(|t| {
            state.graph().parents_of(t.id).iter().map(move |p| GraphEdge {
                source: task_key(*p),
                target: task_key(t.id),
            })
        })
        .collect();

    GraphPayload {
        kind: GraphKind::Task,
        execution: state.execution.name.clone(),
        nodes,
        edges,
    }
}

fn color(status: Status) -> &'static str {
    match status {
        Status::Successful => "palegreen",
        Status::Failed => "lightcoral",
        Status::FailedButContinued => "orange",
        Status::Killed => "gray",
        Status::Submitted | Status::Running => "lightskyblue",
        Status::Waiting | Status::NoAttempt => "white",
    }
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

impl GraphPayload {
    pub fn to_dot(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph {} {{", quote(&self.execution));
        let _ = writeln!(out, "  rankdir=LR;");
        let _ = writeln!(out, "  node [shape=box, style=filled];");
        for node in &self.nodes {
            let label = match node.task_count {
                Some(n) => format!("{} ({n})", node.name),
                None => node.name.clone(),
            };
            let _ = writeln!(
                out,
                "  {} [label={}, fillcolor={}, tooltip={}];",
                quote(&node.id),
                quote(&label),
                color(node.status),
                quote(node.status.as_str()),
            );
        }
        for edge in &self.edges {
            let _ = writeln!(out, "  {} -> {};", quote(&edge.source), quote(&edge.target));
        }
        out.push_str("}\n");
        out
    }
}
