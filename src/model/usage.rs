// src/model/usage.rs

use serde::{Deserialize, Serialize};

/// Per-task accounting snapshot.
///
/// Every field is optional: `None` means the backend could not report it.
/// Unknown is never stored as zero.
///
/// Units: seconds for times, percent (100 = one full core) for cpu, KiB for
/// resident memory, MB for the requested memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub wall_time_secs: Option<f64>,
    pub cpu_time_secs: Option<f64>,
    pub avg_cpu_percent: Option<f64>,
    pub peak_cpu_percent: Option<f64>,
    pub avg_rss_kib: Option<u64>,
    pub peak_rss_kib: Option<u64>,
    pub requested_cpus: Option<u32>,
    pub requested_memory_mb: Option<u64>,
}

impl ResourceUsage {
    /// Fill fields unknown in `self` from `other`.
    pub fn or(self, other: ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            wall_time_secs: self.wall_time_secs.or(other.wall_time_secs),
            cpu_time_secs: self.cpu_time_secs.or(other.cpu_time_secs),
            avg_cpu_percent: self.avg_cpu_percent.or(other.avg_cpu_percent),
            peak_cpu_percent: self.peak_cpu_percent.or(other.peak_cpu_percent),
            avg_rss_kib: self.avg_rss_kib.or(other.avg_rss_kib),
            peak_rss_kib: self.peak_rss_kib.or(other.peak_rss_kib),
            requested_cpus: self.requested_cpus.or(other.requested_cpus),
            requested_memory_mb: self.requested_memory_mb.or(other.requested_memory_mb),
        }
    }
}
