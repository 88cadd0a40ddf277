// src/model/mod.rs

//! Entity model: executions own stages, stages own tasks.
//!
//! - [`execution`] holds the run-level record and its info map.
//! - [`stage`] and [`task`] are the owned children.
//! - [`usage`] is the per-task accounting snapshot.
//! - [`state`] is the in-memory aggregate the dispatcher mutates, plus its
//!   serializable [`ExecutionRecord`] form.

pub mod execution;
pub mod stage;
pub mod state;
pub mod task;
pub mod usage;

/// Canonical id types. Task ids are assigned in insertion order, so iterating
/// tasks by id is iterating them in insertion order.
pub type ExecutionId = u64;
pub type StageId = u64;
pub type TaskId = u64;

/// Task names are unique within an execution.
pub type TaskName = String;

pub use execution::Execution;
pub use stage::Stage;
pub use state::{ExecutionRecord, ExecutionState, TaskSpec};
pub use task::{KillReason, Requirements, Task, TaskFailure};
pub use usage::ResourceUsage;
