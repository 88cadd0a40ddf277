// src/store/mod.rs

//! Durable storage of executions.
//!
//! One [`ExecutionRecord`] per execution. The dispatcher saves after every
//! iteration; the resume manager and read-side queries load from here.
//!
//! A process that writes an execution holds its [`ExecutionLease`]. Other
//! processes that want it killed leave a kill request instead, which the
//! lease holder's dispatch loop picks up.

use std::fmt;

use crate::errors::Result;
use crate::model::{Execution, ExecutionId, ExecutionRecord};

pub mod json;
pub mod memory;

pub use json::JsonStore;
pub use memory::MemoryStore;

pub trait ExecutionStore: Send + Sync {
    /// Id for a new execution: one past the largest stored id.
    fn next_id(&self) -> Result<ExecutionId>;

    /// Soft-deleted records are returned too; callers check `deleted`.
    fn load_by_name(&self, name: &str) -> Result<Option<ExecutionRecord>>;

    fn load_by_id(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>>;

    fn save(&self, record: &ExecutionRecord) -> Result<()>;

    /// Executions that are not soft-deleted, by id.
    fn list(&self) -> Result<Vec<Execution>>;

    /// Mark an execution deleted without removing its record.
    fn soft_delete(&self, name: &str) -> Result<()>;

    /// Remove the record. Missing records are not an error.
    fn delete(&self, name: &str) -> Result<()>;

    /// Claim the right to write `name`. Fails with
    /// [`crate::errors::BatchdagError::ExecutionBusy`] while another holder
    /// is alive. Released when the lease is dropped.
    fn lease(&self, name: &str) -> Result<ExecutionLease>;

    /// Whether some live holder currently has the lease of `name`.
    fn is_leased(&self, name: &str) -> Result<bool>;

    /// Ask the lease holder of `name` to kill it.
    fn request_kill(&self, name: &str) -> Result<()>;

    /// Consume a pending kill request. Returns whether there was one.
    fn take_kill_request(&self, name: &str) -> Result<bool>;
}

/// Exclusive right to write one execution. Dropping it releases the claim.
pub struct ExecutionLease {
    name: String,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ExecutionLease {
    pub(crate) fn new(name: &str, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            name: name.to_string(),
            release: Some(Box::new(release)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ExecutionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionLease")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Drop for ExecutionLease {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}
