// src/dag/ready.rs

//! Ready-set computation.

use crate::model::{ExecutionState, TaskId};
use crate::status::Status;
use crate::types::FailurePolicy;

/// Whether `parent` no longer holds back its children.
///
/// A successful parent always satisfies. A failed parent satisfies only when
/// its stage runs under [`FailurePolicy::Release`].
pub fn parent_satisfied(state: &ExecutionState, parent: TaskId) -> bool {
    let Some(task) = state.task(parent) else {
        return false;
    };
    match task.status {
        Status::Successful => true,
        Status::Failed => state
            .stage_of(parent)
            .is_some_and(|s| s.failure_policy == FailurePolicy::Release),
        _ => false,
    }
}

/// Every waiting task whose parents all satisfy, in priority order: stage
/// submission order first, then task insertion order.
pub fn ready_set(state: &ExecutionState) -> Vec<TaskId> {
    let mut ready: Vec<(u32, TaskId)> = state
        .tasks()
        .filter(|t| t.status == Status::Waiting)
        .filter(|t| {
            state
                .graph()
                .parents_of(t.id)
                .iter()
                .all(|&p| parent_satisfied(state, p))
        })
        .map(|t| {
            let number = state.stage_of(t.id).map(|s| s.number).unwrap_or(u32::MAX);
            (number, t.id)
        })
        .collect();

    ready.sort_unstable();
    ready.into_iter().map(|(_, id)| id).collect()
}

/// Waiting tasks with a parent that has ended without satisfying; these can
/// never become ready.
pub fn blocked_set(state: &ExecutionState) -> Vec<TaskId> {
    state
        .tasks()
        .filter(|t| t.status == Status::Waiting)
        .filter(|t| {
            state.graph().parents_of(t.id).iter().any(|&p| {
                state
                    .task(p)
                    .is_some_and(|pt| pt.status.is_terminal() && !parent_satisfied(state, p))
            })
        })
        .map(|t| t.id)
        .collect()
}
