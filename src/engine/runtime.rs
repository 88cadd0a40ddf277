// src/engine/runtime.rs

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::adapter::{JobHandle, JobRequest, ResourceManager};
use crate::collector;
use crate::dag::ready_set;
use crate::errors::{BatchdagError, Result};
use crate::fs::FileSystem;
use crate::model::{ExecutionState, KillReason, Requirements, TaskId};
use crate::status::Status;
use crate::store::ExecutionStore;

use super::core::{self as dispatch, CoreContext, KillSet, LateReport, PollEffect};
use super::{DispatchSettings, ExecutionHandle};

/// What one dispatch iteration decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iteration {
    /// Keep going. `transient_errors` is set when some adapter call failed
    /// transiently and the next iteration should back off.
    Continue { transient_errors: bool },
    /// The execution reached this status; the loop is over.
    Done(Status),
}

/// Drives one execution to a terminal status against a [`ResourceManager`].
///
/// This is the IO shell around `engine::core`: it issues the adapter calls
/// of an iteration concurrently, feeds the results to the core under the
/// execution lock, collects usage and persists.
///
/// Jobs cancelled while live keep being polled until they report, so their
/// exit code and accounting still land on the killed task.
pub struct Dispatcher<R: ResourceManager> {
    adapter: Arc<R>,
    store: Arc<dyn ExecutionStore>,
    fs: Arc<dyn FileSystem>,
    settings: DispatchSettings,
}

impl<R: ResourceManager> fmt::Debug for Dispatcher<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("adapter", &self.adapter.name())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<R: ResourceManager> Dispatcher<R> {
    pub fn new(
        adapter: Arc<R>,
        store: Arc<dyn ExecutionStore>,
        fs: Arc<dyn FileSystem>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            adapter,
            store,
            fs,
            settings,
        }
    }

    fn ctx(&self) -> CoreContext<'_> {
        CoreContext {
            settings: &self.settings,
            fs: self.fs.as_ref(),
            verify_outputs: self.adapter.produces_outputs(),
        }
    }

    fn persist(&self, state: &ExecutionState) -> Result<()> {
        self.store.save(&state.to_record())
    }

    /// Main loop: iterate, sleeping the poll interval (or the backoff delay)
    /// between iterations, until the execution is terminal. Then wait up to
    /// `cancel_grace` for the reports of cancelled jobs.
    pub async fn run(&self, handle: &ExecutionHandle) -> Result<Status> {
        self.prepare(handle).await?;

        let mut backoff_attempt = 0u32;
        let status = loop {
            let delay = match self.step(handle).await? {
                Iteration::Done(status) => break status,
                Iteration::Continue {
                    transient_errors: true,
                } => {
                    backoff_attempt += 1;
                    dispatch::backoff_delay(&self.settings, backoff_attempt)
                        .max(self.settings.poll_interval)
                }
                Iteration::Continue {
                    transient_errors: false,
                } => {
                    backoff_attempt = 0;
                    self.settings.poll_interval
                }
            };
            tokio::time::sleep(delay).await;
        };

        self.settle_reports(handle).await?;
        Ok(status)
    }

    async fn settle_reports(&self, handle: &ExecutionHandle) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.settings.cancel_grace;
        loop {
            {
                let mut state = handle.lock().await;
                if dispatch::awaiting_reports(&state).is_empty() {
                    return Ok(());
                }
                if tokio::time::Instant::now() >= deadline {
                    let ids = dispatch::abandon_reports(&mut state);
                    warn!(execution = %state.execution.name, tasks = ids.len(), "cancelled jobs never reported; storing requested resources only");
                    store_requested(&mut state, &ids);
                    return self.persist(&state);
                }
                if self.record_reports(&mut state).await {
                    self.persist(&state)?;
                }
                if dispatch::awaiting_reports(&state).is_empty() {
                    return Ok(());
                }
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Move never-attempted tasks to `waiting` and mark the execution started.
    pub async fn prepare(&self, handle: &ExecutionHandle) -> Result<()> {
        let mut state = handle.lock().await;
        if state.execution.status_is_sticky() {
            return Ok(());
        }
        let marked = state.mark_all_waiting()?;
        if state.execution.started_on.is_none() {
            state.execution.started_on = Some(Utc::now());
        }
        if !state.all_terminal() {
            state.execution.set_status(Status::Running);
        }
        info!(
            execution = %state.execution.name,
            adapter = self.adapter.name(),
            tasks = state.tasks().count(),
            marked_waiting = marked,
            "dispatch starting"
        );
        self.persist(&state)
    }

    /// One dispatch iteration, under the execution lock.
    pub async fn step(&self, handle: &ExecutionHandle) -> Result<Iteration> {
        let mut state = handle.lock().await;
        let ctx = self.ctx();

        if state.execution.status_is_sticky() {
            if self.record_reports(&mut state).await {
                self.persist(&state)?;
            }
            info!(execution = %state.execution.name, status = %state.execution.status, "execution already ended; stopping dispatch");
            return Ok(Iteration::Done(state.execution.status));
        }

        if self.store.take_kill_request(&state.execution.name)? {
            warn!(execution = %state.execution.name, "kill requested through the store");
            if !self.kill_all(&mut state).await?.is_empty() {
                self.persist(&state)?;
                return Ok(Iteration::Done(state.execution.status));
            }
        }

        let mut transient = false;
        let mut to_collect: Vec<TaskId> = Vec::new();
        let mut to_cancel: Vec<(TaskId, JobHandle)> = Vec::new();

        // 1. Poll in-flight jobs.
        let polled: Vec<(TaskId, JobHandle)> = state
            .tasks()
            .filter(|t| t.status.is_in_flight())
            .filter_map(|t| t.job_handle.clone().map(|h| (t.id, h)))
            .collect();
        let adapter = self.adapter.as_ref();
        let reports = join_all(polled.iter().map(|(_, h)| adapter.poll(h))).await;
        for ((id, _), report) in polled.iter().zip(reports) {
            match dispatch::apply_poll(&mut state, *id, report, &ctx)? {
                PollEffect::Finished { collect: true, .. } => to_collect.push(*id),
                PollEffect::Retrying { .. } => transient = true,
                _ => {}
            }
        }

        for (id, expiry) in dispatch::expired(&state, &self.settings, Utc::now()) {
            if let Some(h) = dispatch::apply_expiry(&mut state, id, expiry, &self.settings)? {
                to_cancel.push((id, h));
            }
        }

        // 2. Propagate failures.
        let mut fail_fast = None;
        if let Some(stage) = state.failed_stage().map(|s| s.name.clone()) {
            let set = dispatch::fail_fast(&mut state)?;
            warn!(execution = %state.execution.name, %stage, skipped = set.killed.len(), "stage failed; aborting execution");
            fail_fast = Some(set);
        } else {
            dispatch::kill_blocked(&mut state)?;
        }
        if let Some(set) = &fail_fast {
            to_cancel.extend(set.cancel.iter().cloned());
        }

        self.cancel_all(&to_cancel).await;
        self.collect_usage(&mut state, &to_collect).await;
        self.record_reports(&mut state).await;

        if fail_fast.is_some() {
            state.execution.set_status(Status::Failed);
            self.persist(&state)?;
            return Ok(Iteration::Done(Status::Failed));
        }

        // 3. Submit what is ready and fits.
        let ready = ready_set(&state);
        let chosen = dispatch::select_within_capacity(&state, &ready, &self.settings);
        if !chosen.is_empty() {
            debug!(execution = %state.execution.name, ready = ready.len(), chosen = chosen.len(), "submitting ready tasks");
        }
        let requests: Vec<JobRequest> = chosen
            .iter()
            .filter_map(|id| state.task(*id).map(JobRequest::from_task))
            .collect();
        let results = join_all(requests.into_iter().map(|req| adapter.submit(req))).await;
        for (id, result) in chosen.iter().zip(results) {
            if let PollEffect::Retrying { .. } = dispatch::apply_submit(&mut state, *id, result, &ctx)? {
                transient = true;
            }
        }
        // Tasks failed at submission may block others.
        if state.failed_stage().is_none() {
            dispatch::kill_blocked(&mut state)?;
        }

        // 4. Done or stalled.
        if state.all_terminal() {
            let status = state.refresh_status();
            info!(execution = %state.execution.name, %status, "execution finished");
            self.persist(&state)?;
            return Ok(Iteration::Done(status));
        }

        if !transient && state.failed_stage().is_none() {
            if let Some(tasks) = dispatch::stalled_tasks(&state) {
                state
                    .execution
                    .info
                    .insert("stalled_tasks".to_string(), serde_json::json!(tasks));
                state.execution.set_status(Status::Failed);
                warn!(execution = %state.execution.name, ?tasks, "execution stalled");
                self.persist(&state)?;
                return Err(BatchdagError::StalledExecutionError {
                    execution: state.execution.name.clone(),
                    tasks,
                });
            }
        }

        // 5. Persist and hand the lock back.
        state.refresh_status();
        self.persist(&state)?;
        Ok(Iteration::Continue {
            transient_errors: transient,
        })
    }

    async fn cancel_all(&self, jobs: &[(TaskId, JobHandle)]) {
        let adapter = self.adapter.as_ref();
        let results = join_all(jobs.iter().map(|(_, h)| adapter.cancel(h))).await;
        for ((id, h), result) in jobs.iter().zip(results) {
            if let Err(err) = result {
                warn!(task = *id, handle = %h, error = %err, "cancel failed");
            }
        }
    }

    async fn collect_usage(&self, state: &mut ExecutionState, ids: &[TaskId]) {
        let jobs: Vec<(TaskId, String, JobHandle, Requirements)> = ids
            .iter()
            .filter_map(|id| {
                let task = state.task(*id)?;
                let handle = task.job_handle.clone()?;
                Some((*id, task.name.clone(), handle, task.requirements))
            })
            .collect();

        let adapter = self.adapter.as_ref();
        let usages = join_all(
            jobs.iter()
                .map(|(_, name, h, req)| collector::collect(adapter, name, h, req)),
        )
        .await;
        for ((id, _, _, _), usage) in jobs.iter().zip(usages) {
            if let Some(task) = state.task_mut(*id) {
                task.usage = Some(usage);
            }
        }
    }

    /// Poll the jobs of tasks that ended while their job was live and record
    /// the terminal reports that arrived. Returns whether any task changed.
    async fn record_reports(&self, state: &mut ExecutionState) -> bool {
        let awaiting = dispatch::awaiting_reports(state);
        if awaiting.is_empty() {
            return false;
        }
        let ctx = self.ctx();
        let adapter = self.adapter.as_ref();
        let reports = join_all(awaiting.iter().map(|(_, h)| adapter.poll(h))).await;

        let mut recorded = Vec::new();
        let mut abandoned = Vec::new();
        for ((id, _), report) in awaiting.iter().zip(reports) {
            match dispatch::apply_late_poll(state, *id, report, &ctx) {
                LateReport::Recorded => recorded.push(*id),
                LateReport::Abandoned => abandoned.push(*id),
                LateReport::Outstanding => {}
            }
        }
        if !recorded.is_empty() {
            debug!(execution = %state.execution.name, tasks = recorded.len(), "late reports recorded");
        }
        self.collect_usage(state, &recorded).await;
        store_requested(state, &abandoned);
        !recorded.is_empty() || !abandoned.is_empty()
    }

    /// Cancel jobs of tasks just killed outside the loop, then record the
    /// reports that are already available. Status is never touched; the
    /// rest arrive in later iterations.
    pub async fn cancel_and_record(&self, state: &mut ExecutionState, set: &KillSet) {
        self.cancel_all(&set.cancel).await;
        self.record_reports(state).await;
    }

    /// Kill every non-terminal task and mark the execution `killed`. When
    /// every task is already terminal nothing changes, so a finished
    /// execution keeps its outcome.
    pub async fn kill_all(&self, state: &mut ExecutionState) -> Result<KillSet> {
        if state.all_terminal() {
            info!(execution = %state.execution.name, status = %state.execution.status, "nothing left to kill");
            return Ok(KillSet::default());
        }
        let ids: Vec<TaskId> = state.tasks().map(|t| t.id).collect();
        let set = dispatch::kill_tasks(state, &ids, KillReason::Cancelled)?;
        state.execution.set_status(Status::Killed);
        self.cancel_and_record(state, &set).await;
        warn!(execution = %state.execution.name, killed = set.killed.len(), "execution killed");
        Ok(set)
    }
}

/// Usage for tasks whose job will never report: requested resources only.
fn store_requested(state: &mut ExecutionState, ids: &[TaskId]) {
    for &id in ids {
        if let Some(task) = state.task_mut(id) {
            if task.usage.is_none() {
                task.usage = Some(collector::requested(&task.requirements));
            }
        }
    }
}
