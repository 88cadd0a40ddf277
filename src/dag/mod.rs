// src/dag/mod.rs

//! Dependency graph model.
//!
//! - [`graph`] holds the task-level DAG and rejects cycles on insertion.
//! - [`ready`] computes which waiting tasks may be submitted now.
//! - [`page`] provides the truncated parent/child listing type.

pub mod graph;
pub mod page;
pub mod ready;

pub use graph::DependencyGraph;
pub use page::Page;
pub use ready::{blocked_set, parent_satisfied, ready_set};
