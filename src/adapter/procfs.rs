// src/adapter/procfs.rs

//! Cpu and memory sampling of local processes through `/proc`.
//!
//! Only available on Linux; elsewhere [`read_sample`] always returns `None`
//! and the resulting usage leaves cpu/memory unknown.

use std::time::{Duration, Instant};

use crate::model::ResourceUsage;

/// Kernel clock ticks per second. 100 on every mainstream Linux build.
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

/// One reading of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcSample {
    /// user + system ticks of the process and its reaped children.
    pub cpu_ticks: u64,
    pub rss_kib: u64,
}

#[cfg(target_os = "linux")]
pub fn read_sample(pid: u32) -> Option<ProcSample> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    Some(ProcSample {
        cpu_ticks: parse_stat_ticks(&stat)?,
        rss_kib: parse_status_rss(&status)?,
    })
}

#[cfg(not(target_os = "linux"))]
pub fn read_sample(_pid: u32) -> Option<ProcSample> {
    None
}

/// Sum utime, stime, cutime and cstime from a `/proc/<pid>/stat` line.
///
/// The command name may contain spaces and parentheses, so fields are
/// counted from the last `)`.
pub fn parse_stat_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 (state); utime is field 14.
    let tick = |i: usize| fields.get(i).and_then(|f| f.parse::<i64>().ok());
    let total = tick(11)? + tick(12)? + tick(13)? + tick(14)?;
    u64::try_from(total).ok()
}

/// `VmRSS` from `/proc/<pid>/status`, in KiB.
pub fn parse_status_rss(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

/// Accumulates samples over a process lifetime.
#[derive(Debug, Clone, Default)]
pub struct UsageSampler {
    samples: u64,
    rss_sum: u64,
    rss_peak: u64,
    last_ticks: Option<u64>,
    last_at: Option<Instant>,
    peak_cpu_percent: Option<f64>,
}

impl UsageSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, sample: ProcSample, at: Instant) {
        self.samples += 1;
        self.rss_sum += sample.rss_kib;
        self.rss_peak = self.rss_peak.max(sample.rss_kib);

        if let (Some(prev_ticks), Some(prev_at)) = (self.last_ticks, self.last_at) {
            let elapsed = at.saturating_duration_since(prev_at).as_secs_f64();
            if elapsed > 0.0 {
                let delta = sample.cpu_ticks.saturating_sub(prev_ticks) as f64;
                let percent = delta / CLOCK_TICKS_PER_SEC / elapsed * 100.0;
                self.peak_cpu_percent = Some(self.peak_cpu_percent.map_or(percent, |p| p.max(percent)));
            }
        }
        self.last_ticks = Some(sample.cpu_ticks);
        self.last_at = Some(at);
    }

    /// Usage over the whole run. Cpu and memory stay unknown when no sample
    /// was ever taken.
    pub fn finish(&self, wall: Duration) -> ResourceUsage {
        let wall_secs = wall.as_secs_f64();
        let cpu_time_secs = self
            .last_ticks
            .map(|ticks| ticks as f64 / CLOCK_TICKS_PER_SEC);
        let avg_cpu_percent = match cpu_time_secs {
            Some(cpu) if wall_secs > 0.0 => Some(cpu / wall_secs * 100.0),
            _ => None,
        };

        ResourceUsage {
            wall_time_secs: Some(wall_secs),
            cpu_time_secs,
            avg_cpu_percent,
            peak_cpu_percent: self.peak_cpu_percent,
            avg_rss_kib: (self.samples > 0).then(|| self.rss_sum / self.samples),
            peak_rss_kib: (self.samples > 0).then_some(self.rss_peak),
            requested_cpus: None,
            requested_memory_mb: None,
        }
    }
}
