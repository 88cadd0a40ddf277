// src/status/fold.rs

//! Pure status folds.
//!
//! Stage status is a function of its tasks' statuses plus whether the stage
//! tolerates failures; execution status is the same fold one level up. These
//! run on every read, nothing here is cached.

use serde::Serialize;

use super::Status;

/// Per-status tallies for a set of tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: usize,
    pub no_attempt: usize,
    pub waiting: usize,
    pub submitted: usize,
    pub running: usize,
    pub successful: usize,
    pub failed: usize,
    pub killed: usize,
    pub failed_but_continued: usize,
}

impl StatusCounts {
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = Status>,
    {
        let mut counts = StatusCounts::default();
        for status in statuses {
            counts.total += 1;
            match status {
                Status::NoAttempt => counts.no_attempt += 1,
                Status::Waiting => counts.waiting += 1,
                Status::Submitted => counts.submitted += 1,
                Status::Running => counts.running += 1,
                Status::Successful => counts.successful += 1,
                Status::Failed => counts.failed += 1,
                Status::Killed => counts.killed += 1,
                Status::FailedButContinued => counts.failed_but_continued += 1,
            }
        }
        counts
    }

    pub fn in_flight(&self) -> usize {
        self.submitted + self.running
    }

    pub fn terminal(&self) -> usize {
        self.successful + self.failed + self.killed + self.failed_but_continued
    }

    pub fn percent_successful(&self) -> f64 {
        self.percent(self.successful)
    }

    /// Submitted tasks count as running for display.
    pub fn percent_running(&self) -> f64 {
        self.percent(self.in_flight())
    }

    pub fn percent_failed(&self) -> f64 {
        self.percent(self.failed)
    }

    pub fn percent_killed(&self) -> f64 {
        self.percent(self.killed)
    }

    pub fn percent_waiting(&self) -> f64 {
        self.percent(self.waiting + self.no_attempt)
    }

    fn percent(&self, n: usize) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            n as f64 / self.total as f64 * 100.0
        }
    }
}

/// Fold task statuses into a stage status.
pub fn stage_status<I>(task_statuses: I, tolerant: bool) -> Status
where
    I: IntoIterator<Item = Status>,
{
    let counts = StatusCounts::from_statuses(task_statuses);
    fold_counts(&counts, tolerant)
}

/// Fold stage statuses (in submission order) into an execution status.
///
/// A failed stage fails the execution outright; tolerance was already applied
/// at the stage level, where it shows up as `failed_but_continued`.
pub fn execution_status<I>(stage_statuses: I) -> Status
where
    I: IntoIterator<Item = Status>,
{
    let counts = StatusCounts::from_statuses(stage_statuses);
    fold_counts(&counts, false)
}

fn fold_counts(c: &StatusCounts, tolerant: bool) -> Status {
    if c.total == 0 {
        return Status::Successful;
    }
    if c.failed > 0 && !tolerant {
        return Status::Failed;
    }
    if c.in_flight() > 0 {
        return Status::Running;
    }
    if c.successful == c.total {
        return Status::Successful;
    }
    if c.terminal() == c.total {
        if c.failed > 0 || c.failed_but_continued > 0 {
            return Status::FailedButContinued;
        }
        return Status::Killed;
    }
    if c.waiting == c.total {
        return Status::Waiting;
    }
    if c.no_attempt == c.total {
        return Status::NoAttempt;
    }
    if c.no_attempt + c.waiting == c.total {
        return Status::Waiting;
    }
    Status::Running
}
