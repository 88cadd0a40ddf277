// src/config/mod.rs

//! Workflow definition loading and validation.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a workflow file from disk (`loader.rs`).
//! - Validate names, references and acyclicity (`validate.rs`).
//! - Render a validated workflow into execution entities (`render.rs`).

pub mod loader;
pub mod model;
pub mod render;
pub mod validate;

pub use loader::{load_and_validate, load_from_path, parse_str};
pub use model::{RawWorkflowFile, SettingsSection, StageConfig, TaskConfig, WorkflowFile};
pub use render::{RenderSummary, apply_workflow};
