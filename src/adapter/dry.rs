// src/adapter/dry.rs

//! Dry-run backend: every job "succeeds" immediately and nothing runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::info;

use crate::adapter::{AdapterFuture, JobHandle, JobRequest, JobState, ResourceManager};
use crate::errors::{BatchdagError, Result};
use crate::model::ResourceUsage;

#[derive(Debug, Clone, Default)]
pub struct DryAdapter {
    jobs: Arc<Mutex<HashMap<JobHandle, JobState>>>,
    seq: Arc<AtomicU64>,
}

impl DryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> Result<MutexGuard<'_, HashMap<JobHandle, JobState>>> {
        self.jobs
            .lock()
            .map_err(|_| BatchdagError::AdapterUnavailable("dry job table poisoned".to_string()))
    }

    fn state_of(&self, handle: &JobHandle) -> Result<JobState> {
        self.table()?
            .get(handle)
            .copied()
            .ok_or_else(|| BatchdagError::UnknownJob(handle.0.clone()))
    }

    /// Jobs whose accounting has not been read yet.
    pub fn tracked_jobs(&self) -> Result<usize> {
        Ok(self.table()?.len())
    }
}

impl ResourceManager for DryAdapter {
    fn name(&self) -> &'static str {
        "dry"
    }

    fn submit(&self, job: JobRequest) -> AdapterFuture<'_, JobHandle> {
        Box::pin(async move {
            let n = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
            let handle = JobHandle(format!("dry-{n}"));
            info!(task = %job.name, cmd = %job.command, "dry run; not executing");
            self.table()?
                .insert(handle.clone(), JobState::Succeeded { exit_code: 0 });
            Ok(handle)
        })
    }

    fn poll(&self, handle: &JobHandle) -> AdapterFuture<'_, JobState> {
        let handle = handle.clone();
        Box::pin(async move { self.state_of(&handle) })
    }

    fn accounting(&self, handle: &JobHandle) -> AdapterFuture<'_, ResourceUsage> {
        let handle = handle.clone();
        Box::pin(async move {
            self.table()?
                .remove(&handle)
                .ok_or_else(|| BatchdagError::UnknownJob(handle.0.clone()))?;
            Ok(ResourceUsage::default())
        })
    }

    fn cancel(&self, handle: &JobHandle) -> AdapterFuture<'_, ()> {
        let handle = handle.clone();
        Box::pin(async move {
            self.state_of(&handle)?;
            Ok(())
        })
    }

    fn produces_outputs(&self) -> bool {
        false
    }
}
