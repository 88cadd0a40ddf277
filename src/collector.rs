// src/collector.rs

//! Resource usage collection and stage aggregates.
//!
//! The dispatcher calls [`collect`] once per task that reached a terminal
//! state through the adapter. The record is merged with what the task
//! requested, so the requested columns are present even when the backend
//! reports nothing.

use serde::Serialize;
use tracing::warn;

use crate::adapter::{JobHandle, ResourceManager};
use crate::model::{Requirements, ResourceUsage};

/// The requested-only part of a usage record.
pub fn requested(requirements: &Requirements) -> ResourceUsage {
    ResourceUsage {
        requested_cpus: requirements.cpus,
        requested_memory_mb: requirements.memory_mb,
        ..ResourceUsage::default()
    }
}

/// Ask the adapter for accounting and merge in the requested resources.
///
/// An accounting failure is logged and yields a record carrying only the
/// requested fields.
pub async fn collect<R>(
    adapter: &R,
    task: &str,
    handle: &JobHandle,
    requirements: &Requirements,
) -> ResourceUsage
where
    R: ResourceManager + ?Sized,
{
    match adapter.accounting(handle).await {
        Ok(measured) => measured.or(requested(requirements)),
        Err(err) => {
            warn!(%task, %handle, error = %err, "accounting unavailable; storing requested resources only");
            requested(requirements)
        }
    }
}

/// Mean of one field over the samples where it is known.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FieldMean {
    pub mean: Option<f64>,
    pub samples: usize,
}

impl FieldMean {
    fn of(values: impl Iterator<Item = Option<f64>>) -> Self {
        let (sum, samples) = values
            .flatten()
            .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
        Self {
            mean: (samples > 0).then(|| sum / samples as f64),
            samples,
        }
    }
}

/// Per-field means over the usage records of one stage's tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageUsage {
    /// Tasks that carry a usage record at all.
    pub tasks_with_usage: usize,
    pub wall_time_secs: FieldMean,
    pub cpu_time_secs: FieldMean,
    pub avg_cpu_percent: FieldMean,
    pub peak_cpu_percent: FieldMean,
    pub avg_rss_kib: FieldMean,
    pub peak_rss_kib: FieldMean,
    pub requested_cpus: FieldMean,
    pub requested_memory_mb: FieldMean,
}

impl StageUsage {
    pub fn aggregate<'a>(records: impl IntoIterator<Item = &'a ResourceUsage>) -> Self {
        let records: Vec<&ResourceUsage> = records.into_iter().collect();
        let field = |f: fn(&ResourceUsage) -> Option<f64>| FieldMean::of(records.iter().map(|r| f(r)));

        Self {
            tasks_with_usage: records.len(),
            wall_time_secs: field(|r| r.wall_time_secs),
            cpu_time_secs: field(|r| r.cpu_time_secs),
            avg_cpu_percent: field(|r| r.avg_cpu_percent),
            peak_cpu_percent: field(|r| r.peak_cpu_percent),
            avg_rss_kib: field(|r| r.avg_rss_kib.map(|v| v as f64)),
            peak_rss_kib: field(|r| r.peak_rss_kib.map(|v| v as f64)),
            requested_cpus: field(|r| r.requested_cpus.map(f64::from)),
            requested_memory_mb: field(|r| r.requested_memory_mb.map(|v| v as f64)),
        }
    }
}
