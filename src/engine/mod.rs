// src/engine/mod.rs

//! Orchestration engine.
//!
//! This module ties together:
//! - the pure dispatch decisions in [`core`]
//! - the async dispatch loop in [`runtime`] that talks to the adapter
//! - recovery of persisted executions in [`resume`]
//! - the user-facing operations (start, resume, kill, delete stage) in
//!   [`orchestrator`]
//!
//! Every mutation of one execution happens while holding its
//! [`ExecutionHandle`] lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use crate::config::SettingsSection;
use crate::model::ExecutionState;

pub mod core;
pub mod orchestrator;
pub mod resume;
pub mod runtime;

pub use orchestrator::{Orchestrator, StartOptions, Started};
pub use resume::{ResumeManager, ResumePlan};
pub use runtime::{Dispatcher, Iteration};

/// Shared, lock-protected state of one execution.
///
/// Cloning the handle shares the same state. The dispatch loop holds the
/// lock for a whole iteration; kill and delete operations queue behind it.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    inner: Arc<Mutex<ExecutionState>>,
}

impl ExecutionHandle {
    pub fn new(state: ExecutionState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, ExecutionState> {
        self.inner.lock().await
    }

    /// Consistent copy for readers.
    pub async fn snapshot(&self) -> ExecutionState {
        self.inner.lock().await.clone()
    }
}

/// Dispatch loop limits and timings, derived from `[config]`.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub max_concurrent: usize,
    pub max_cpus: Option<u32>,
    pub max_memory_mb: Option<u64>,
    pub poll_interval: Duration,
    pub adapter_retry_limit: u32,
    pub retry_backoff: Duration,
    pub max_backoff: Duration,
    pub heartbeat_timeout: Option<Duration>,
    pub cancel_grace: Duration,
}

impl From<&SettingsSection> for DispatchSettings {
    fn from(cfg: &SettingsSection) -> Self {
        Self {
            max_concurrent: cfg.max_concurrent.max(1),
            max_cpus: cfg.max_cpus,
            max_memory_mb: cfg.max_memory_mb,
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            adapter_retry_limit: cfg.adapter_retry_limit,
            retry_backoff: Duration::from_millis(cfg.retry_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
            heartbeat_timeout: cfg.heartbeat_timeout_secs.map(Duration::from_secs),
            cancel_grace: Duration::from_secs(cfg.cancel_grace_secs),
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&SettingsSection::default())
    }
}
