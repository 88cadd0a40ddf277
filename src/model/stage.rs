// src/model/stage.rs

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{StageId, TaskId};
use crate::types::FailurePolicy;

/// A named group of tasks with a position in the execution's submission
/// order.
///
/// Stage status is not stored; it is folded from the owned tasks on every
/// read (see [`crate::model::ExecutionState::stage_status`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    /// Monotonic sequence number within the execution, starting at 1.
    pub number: u32,
    pub name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Owned tasks in insertion order.
    #[serde(default)]
    pub task_ids: Vec<TaskId>,
}

impl Stage {
    pub fn new(id: StageId, number: u32, name: &str, failure_policy: FailurePolicy) -> Self {
        Self {
            id,
            number,
            name: name.to_string(),
            tags: BTreeMap::new(),
            failure_policy,
            task_ids: Vec::new(),
        }
    }

    pub fn is_tolerant(&self) -> bool {
        self.failure_policy.tolerates_failure()
    }
}
