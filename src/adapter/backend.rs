// src/adapter/backend.rs

//! Configuration-selected backend.
//!
//! `Backend` has one variant per built-in adapter and forwards every call.
//! The dispatcher is generic over [`ResourceManager`], so tests pass their
//! own fakes while production code passes a `Backend` built from
//! `[config].adapter`.

use std::time::Duration;

use crate::adapter::{
    AdapterFuture, DryAdapter, JobHandle, JobRequest, JobState, LocalAdapter, ResourceManager,
};
use crate::model::ResourceUsage;
use crate::types::AdapterKind;

#[derive(Debug, Clone)]
pub enum Backend {
    Local(LocalAdapter),
    Dry(DryAdapter),
}

impl Backend {
    pub fn from_kind(kind: AdapterKind, sample_interval: Duration) -> Self {
        match kind {
            AdapterKind::Local => Backend::Local(LocalAdapter::new(sample_interval)),
            AdapterKind::Dry => Backend::Dry(DryAdapter::new()),
        }
    }

    fn inner(&self) -> &dyn ResourceManager {
        match self {
            Backend::Local(a) => a,
            Backend::Dry(a) => a,
        }
    }
}

impl ResourceManager for Backend {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn submit(&self, job: JobRequest) -> AdapterFuture<'_, JobHandle> {
        self.inner().submit(job)
    }

    fn poll(&self, handle: &JobHandle) -> AdapterFuture<'_, JobState> {
        self.inner().poll(handle)
    }

    fn accounting(&self, handle: &JobHandle) -> AdapterFuture<'_, ResourceUsage> {
        self.inner().accounting(handle)
    }

    fn cancel(&self, handle: &JobHandle) -> AdapterFuture<'_, ()> {
        self.inner().cancel(handle)
    }

    fn produces_outputs(&self) -> bool {
        self.inner().produces_outputs()
    }
}
