// src/engine/core.rs

//! Pure dispatch decisions.
//!
//! Everything here works on an [`ExecutionState`] the caller has locked and
//! performs no adapter IO. The async shell (`engine::runtime`) gathers adapter
//! results and feeds them in, then acts on what comes back (cancel these
//! handles, collect usage for those tasks).
//!
//! Keeping this synchronous means every transition rule can be unit tested
//! without Tokio, processes or a store.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::adapter::{JobHandle, JobState};
use crate::dag::{blocked_set, ready_set};
use crate::engine::DispatchSettings;
use crate::errors::{BatchdagError, Result};
use crate::fs::FileSystem;
use crate::model::{ExecutionState, KillReason, TaskFailure, TaskId, TaskName};
use crate::status::Status;

/// What the core needs besides the state.
#[derive(Debug, Clone, Copy)]
pub struct CoreContext<'a> {
    pub settings: &'a DispatchSettings,
    pub fs: &'a dyn FileSystem,
    /// Check declared outputs on exit code 0.
    pub verify_outputs: bool,
}

/// Result of applying one poll report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEffect {
    Unchanged,
    /// `submitted -> running`.
    Started,
    /// The task reached a terminal status. `collect` is set when the job ran
    /// and accounting should be requested.
    Finished { status: Status, collect: bool },
    /// A transient adapter error was counted against the task.
    Retrying { attempts: u32 },
}

/// A limit that ran out on an in-flight task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Ran longer than `time_limit_secs`.
    TimeLimit,
    /// Still `submitted` after the heartbeat bound.
    Heartbeat,
}

/// Tasks moved to `killed`, and the in-flight ones among them whose jobs
/// should be cancelled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KillSet {
    pub killed: Vec<TaskId>,
    pub cancel: Vec<(TaskId, JobHandle)>,
}

impl KillSet {
    pub fn is_empty(&self) -> bool {
        self.killed.is_empty()
    }
}

fn task_name(state: &ExecutionState, id: TaskId) -> TaskName {
    state.task(id).map(|t| t.name.clone()).unwrap_or_default()
}

/// A terminal report straight from `submitted` passes through `running`.
fn ensure_running(state: &mut ExecutionState, id: TaskId) -> Result<()> {
    if state.task(id).map(|t| t.status) == Some(Status::Submitted) {
        state.transition(id, Status::Running)?;
    }
    Ok(())
}

fn fail(state: &mut ExecutionState, id: TaskId, failure: TaskFailure) -> Result<()> {
    state.transition(id, Status::Failed)?;
    let name = task_name(state, id);
    warn!(execution = %state.execution.name, task = %name, reason = %failure, "task failed");
    if let Some(task) = state.task_mut(id) {
        task.failure = Some(failure);
    }
    Ok(())
}

fn kill(state: &mut ExecutionState, id: TaskId, reason: KillReason) -> Result<()> {
    state.transition(id, Status::Killed)?;
    if let Some(task) = state.task_mut(id) {
        task.kill_reason = Some(reason);
    }
    Ok(())
}

/// Apply the adapter's answer to `poll(handle)` for an in-flight task.
pub fn apply_poll(
    state: &mut ExecutionState,
    id: TaskId,
    report: Result<JobState>,
    ctx: &CoreContext<'_>,
) -> Result<PollEffect> {
    let task = state
        .task(id)
        .ok_or_else(|| BatchdagError::TaskNotFound(format!("task {id}")))?;
    if !task.status.is_in_flight() {
        return Ok(PollEffect::Unchanged);
    }
    let name = task.name.clone();

    let job = match report {
        Ok(job) => job,
        Err(BatchdagError::UnknownJob(handle)) => {
            fail(
                state,
                id,
                TaskFailure::Abnormal {
                    message: format!("job {handle} is unknown to the resource manager"),
                },
            )?;
            return Ok(PollEffect::Finished {
                status: Status::Failed,
                collect: false,
            });
        }
        Err(err) => return count_adapter_error(state, id, &err, ctx),
    };

    if let Some(task) = state.task_mut(id) {
        task.adapter_errors = 0;
    }

    match job {
        JobState::Pending => Ok(PollEffect::Unchanged),
        JobState::Running => {
            if state.task(id).map(|t| t.status) == Some(Status::Submitted) {
                state.transition(id, Status::Running)?;
                info!(execution = %state.execution.name, task = %name, "task running");
                Ok(PollEffect::Started)
            } else {
                Ok(PollEffect::Unchanged)
            }
        }
        JobState::Succeeded { exit_code } => {
            ensure_running(state, id)?;
            if let Some(task) = state.task_mut(id) {
                task.exit_code = Some(exit_code);
            }
            let status = if exit_code != 0 {
                fail(state, id, TaskFailure::ExitCode { code: exit_code })?;
                Status::Failed
            } else {
                let missing = match state.task(id) {
                    Some(task) if ctx.verify_outputs => ctx.fs.missing(&task.outputs),
                    _ => Vec::new(),
                };
                if missing.is_empty() {
                    state.transition(id, Status::Successful)?;
                    info!(execution = %state.execution.name, task = %name, "task successful");
                    Status::Successful
                } else {
                    fail(state, id, TaskFailure::MissingOutput { paths: missing })?;
                    Status::Failed
                }
            };
            Ok(PollEffect::Finished {
                status,
                collect: true,
            })
        }
        JobState::Failed { exit_code } => {
            ensure_running(state, id)?;
            let failure = if exit_code > 0 {
                if let Some(task) = state.task_mut(id) {
                    task.exit_code = Some(exit_code);
                }
                TaskFailure::ExitCode { code: exit_code }
            } else {
                TaskFailure::Abnormal {
                    message: format!("resource manager reported failure (code {exit_code})"),
                }
            };
            fail(state, id, failure)?;
            Ok(PollEffect::Finished {
                status: Status::Failed,
                collect: true,
            })
        }
        JobState::Killed => {
            kill(state, id, KillReason::Cancelled)?;
            warn!(execution = %state.execution.name, task = %name, "job killed by resource manager");
            Ok(PollEffect::Finished {
                status: Status::Killed,
                collect: true,
            })
        }
    }
}

fn count_adapter_error(
    state: &mut ExecutionState,
    id: TaskId,
    err: &BatchdagError,
    ctx: &CoreContext<'_>,
) -> Result<PollEffect> {
    let attempts = match state.task_mut(id) {
        Some(task) => {
            task.adapter_errors += 1;
            task.adapter_errors
        }
        None => return Err(BatchdagError::TaskNotFound(format!("task {id}"))),
    };

    if attempts > ctx.settings.adapter_retry_limit {
        fail(
            state,
            id,
            TaskFailure::AdapterUnavailable {
                message: err.to_string(),
            },
        )?;
        return Ok(PollEffect::Finished {
            status: Status::Failed,
            collect: false,
        });
    }

    let name = task_name(state, id);
    warn!(execution = %state.execution.name, task = %name, attempts, error = %err, "adapter error; will retry");
    Ok(PollEffect::Retrying { attempts })
}

/// Handle the outcome of `submit` for a task chosen from the ready set.
///
/// Success moves it to `submitted`. A failed submission leaves it `waiting`
/// and counts the attempt; past the retry bound (or on a non-transient
/// error) the task passes through `submitted` to `failed`.
pub fn apply_submit(
    state: &mut ExecutionState,
    id: TaskId,
    result: Result<JobHandle>,
    ctx: &CoreContext<'_>,
) -> Result<PollEffect> {
    match result {
        Ok(handle) => {
            state.transition(id, Status::Submitted)?;
            let name = task_name(state, id);
            info!(execution = %state.execution.name, task = %name, %handle, "task submitted");
            if let Some(task) = state.task_mut(id) {
                task.job_handle = Some(handle);
                task.adapter_errors = 0;
            }
            Ok(PollEffect::Unchanged)
        }
        Err(err) => {
            let attempts = match state.task_mut(id) {
                Some(task) => {
                    task.adapter_errors += 1;
                    task.adapter_errors
                }
                None => return Err(BatchdagError::TaskNotFound(format!("task {id}"))),
            };
            if err.is_transient() && attempts <= ctx.settings.adapter_retry_limit {
                let name = task_name(state, id);
                warn!(execution = %state.execution.name, task = %name, attempts, error = %err, "submission failed; will retry");
                return Ok(PollEffect::Retrying { attempts });
            }
            state.transition(id, Status::Submitted)?;
            fail(
                state,
                id,
                TaskFailure::AdapterUnavailable {
                    message: err.to_string(),
                },
            )?;
            Ok(PollEffect::Finished {
                status: Status::Failed,
                collect: false,
            })
        }
    }
}

/// In-flight tasks whose time limit or heartbeat bound ran out at `now`.
pub fn expired(
    state: &ExecutionState,
    settings: &DispatchSettings,
    now: DateTime<Utc>,
) -> Vec<(TaskId, Expiry)> {
    let elapsed = |since: Option<DateTime<Utc>>| {
        since
            .map(|t| (now - t).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    };

    state
        .tasks()
        .filter(|t| t.status.is_in_flight())
        .filter_map(|t| {
            if let Some(limit) = t.requirements.time_limit_secs {
                let since = t.started_at.or(t.submitted_at);
                if elapsed(since) > limit * 1000 {
                    return Some((t.id, Expiry::TimeLimit));
                }
            }
            if let Some(bound) = settings.heartbeat_timeout {
                if t.status == Status::Submitted
                    && elapsed(t.submitted_at) > bound.as_millis() as u64
                {
                    return Some((t.id, Expiry::Heartbeat));
                }
            }
            None
        })
        .collect()
}

/// Apply an expiry. Returns the job to cancel, if the task had one.
pub fn apply_expiry(
    state: &mut ExecutionState,
    id: TaskId,
    expiry: Expiry,
    settings: &DispatchSettings,
) -> Result<Option<JobHandle>> {
    let handle = state.task(id).and_then(|t| t.job_handle.clone());
    match expiry {
        Expiry::TimeLimit => {
            kill(state, id, KillReason::Timeout)?;
            let name = task_name(state, id);
            warn!(execution = %state.execution.name, task = %name, "time limit exceeded; task killed");
        }
        Expiry::Heartbeat => {
            let secs = settings.heartbeat_timeout.map(|d| d.as_secs()).unwrap_or(0);
            fail(state, id, TaskFailure::HeartbeatTimeout { secs })?;
        }
    }
    if handle.is_some() {
        mark_awaiting(state, id);
    }
    Ok(handle)
}

fn mark_awaiting(state: &mut ExecutionState, id: TaskId) {
    if let Some(task) = state.task_mut(id) {
        task.awaiting_report = true;
        task.adapter_errors = 0;
    }
}

/// Kill waiting tasks that can never become ready because a parent ended
/// without satisfying them. Repeats until no more tasks are blocked, so
/// whole downstream chains go at once.
pub fn kill_blocked(state: &mut ExecutionState) -> Result<Vec<TaskId>> {
    let mut killed = Vec::new();
    loop {
        let blocked = blocked_set(state);
        if blocked.is_empty() {
            break;
        }
        for id in blocked {
            kill(state, id, KillReason::UpstreamFailed)?;
            killed.push(id);
        }
    }
    if !killed.is_empty() {
        info!(execution = %state.execution.name, count = killed.len(), "killed tasks blocked by failed parents");
    }
    Ok(killed)
}

/// Move the given tasks to `killed` if they are not terminal yet.
pub fn kill_tasks(
    state: &mut ExecutionState,
    ids: &[TaskId],
    reason: KillReason,
) -> Result<KillSet> {
    let mut set = KillSet::default();
    for &id in ids {
        let Some(task) = state.task(id) else {
            continue;
        };
        let status = task.status;
        let handle = task.job_handle.clone();
        match status {
            Status::NoAttempt => {
                // Never started: route through waiting so the lifecycle holds.
                state.transition(id, Status::Waiting)?;
                kill(state, id, reason)?;
            }
            Status::Waiting => kill(state, id, reason)?,
            s if s.is_in_flight() => {
                kill(state, id, reason)?;
                if let Some(handle) = handle {
                    mark_awaiting(state, id);
                    set.cancel.push((id, handle));
                }
            }
            _ => continue,
        }
        set.killed.push(id);
    }
    Ok(set)
}

/// A non-tolerant stage failed: kill every non-terminal task.
pub fn fail_fast(state: &mut ExecutionState) -> Result<KillSet> {
    let ids: Vec<TaskId> = state
        .tasks()
        .filter(|t| !t.status.is_terminal())
        .map(|t| t.id)
        .collect();
    kill_tasks(state, &ids, KillReason::ExecutionFailed)
}

/// Record a terminal report that arrived after the task was already killed.
/// Status is left alone. Returns whether anything was recorded.
pub fn record_late_report(state: &mut ExecutionState, id: TaskId, job: JobState) -> bool {
    let Some(task) = state.task_mut(id) else {
        return false;
    };
    if !task.status.is_terminal() {
        return false;
    }
    match job {
        JobState::Succeeded { exit_code } => task.exit_code = Some(exit_code),
        JobState::Failed { exit_code } if exit_code >= 0 => task.exit_code = Some(exit_code),
        JobState::Failed { .. } | JobState::Killed => {}
        JobState::Pending | JobState::Running => return false,
    }
    true
}

/// Outcome of polling a job whose task was already ended by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LateReport {
    /// The job has not reported a terminal state yet.
    Outstanding,
    /// The terminal report was recorded; accounting should be requested.
    Recorded,
    /// The job will never report. Only requested resources can be stored.
    Abandoned,
}

/// Tasks still waiting for their cancelled job's terminal report.
pub fn awaiting_reports(state: &ExecutionState) -> Vec<(TaskId, JobHandle)> {
    state
        .tasks()
        .filter(|t| t.awaiting_report)
        .filter_map(|t| t.job_handle.clone().map(|h| (t.id, h)))
        .collect()
}

/// Apply a poll of a job from [`awaiting_reports`].
pub fn apply_late_poll(
    state: &mut ExecutionState,
    id: TaskId,
    report: Result<JobState>,
    ctx: &CoreContext<'_>,
) -> LateReport {
    let outcome = match report {
        Ok(job) if job.is_terminal() => {
            record_late_report(state, id, job);
            LateReport::Recorded
        }
        Ok(_) => LateReport::Outstanding,
        Err(BatchdagError::UnknownJob(_)) => LateReport::Abandoned,
        Err(err) => {
            let Some(task) = state.task_mut(id) else {
                return LateReport::Abandoned;
            };
            task.adapter_errors += 1;
            if task.adapter_errors > ctx.settings.adapter_retry_limit {
                warn!(task = %task.name, error = %err, "giving up on report of cancelled job");
                LateReport::Abandoned
            } else {
                LateReport::Outstanding
            }
        }
    };
    if outcome != LateReport::Outstanding {
        if let Some(task) = state.task_mut(id) {
            task.awaiting_report = false;
            task.adapter_errors = 0;
        }
    }
    outcome
}

/// Stop waiting for every outstanding report. Returns the tasks given up on.
pub fn abandon_reports(state: &mut ExecutionState) -> Vec<TaskId> {
    let ids: Vec<TaskId> = awaiting_reports(state).into_iter().map(|(id, _)| id).collect();
    for &id in &ids {
        if let Some(task) = state.task_mut(id) {
            task.awaiting_report = false;
            task.adapter_errors = 0;
        }
    }
    ids
}

/// Pick the ready tasks that fit the capacity limits, in priority order.
///
/// Selection stops at the first task that does not fit, so later, smaller
/// tasks cannot overtake it. A task whose own request exceeds a ceiling is
/// admitted only when nothing else is in flight, so it runs alone rather
/// than never.
pub fn select_within_capacity(
    state: &ExecutionState,
    ready: &[TaskId],
    settings: &DispatchSettings,
) -> Vec<TaskId> {
    let max_cpus = state.execution.max_cpus.or(settings.max_cpus);
    let max_memory = settings.max_memory_mb;

    let in_flight = state.in_flight();
    let mut count = in_flight.len();
    let mut cpus: u64 = 0;
    let mut memory: u64 = 0;
    for id in &in_flight {
        if let Some(task) = state.task(*id) {
            cpus += u64::from(task.requirements.effective_cpus());
            memory += task.requirements.effective_memory_mb();
        }
    }

    let mut chosen = Vec::new();
    for &id in ready {
        if count >= settings.max_concurrent {
            break;
        }
        let Some(task) = state.task(id) else {
            continue;
        };
        let want_cpus = u64::from(task.requirements.effective_cpus());
        let want_memory = task.requirements.effective_memory_mb();

        let fits_cpus = max_cpus.is_none_or(|max| cpus + want_cpus <= u64::from(max));
        let fits_memory = max_memory.is_none_or(|max| memory + want_memory <= max);

        if !(fits_cpus && fits_memory) && count > 0 {
            break;
        }
        chosen.push(id);
        count += 1;
        cpus += want_cpus;
        memory += want_memory;
    }
    chosen
}

/// Names of the unfinished tasks if nothing is in flight, nothing is ready
/// and the execution is not done.
pub fn stalled_tasks(state: &ExecutionState) -> Option<Vec<TaskName>> {
    if state.all_terminal() || !state.in_flight().is_empty() || !ready_set(state).is_empty() {
        return None;
    }
    Some(
        state
            .tasks()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.name.clone())
            .collect(),
    )
}

/// Delay before the next iteration after `attempt` consecutive iterations
/// with transient errors (1-based).
pub fn backoff_delay(settings: &DispatchSettings, attempt: u32) -> std::time::Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    settings
        .retry_backoff
        .saturating_mul(factor)
        .min(settings.max_backoff)
}
