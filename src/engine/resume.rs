// src/engine/resume.rs

//! Re-attach to a persisted execution.
//!
//! The manager reconciles what the store says with what the adapter knows,
//! then leaves the execution `running` for the dispatch loop to pick up.
//! Successful tasks are never touched.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::adapter::{JobHandle, ResourceManager};
use crate::collector;
use crate::errors::{BatchdagError, Result};
use crate::fs::FileSystem;
use crate::model::{ExecutionState, TaskId, TaskName};
use crate::status::Status;

use super::core::{self as dispatch, CoreContext, PollEffect};
use super::{DispatchSettings, ExecutionHandle};

/// What a resume did, by task name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResumePlan {
    /// In-flight tasks whose job the adapter still knows.
    pub reattached: Vec<TaskName>,
    /// Tasks put back to `waiting` (killed, or their job was lost).
    pub reset: Vec<TaskName>,
    /// Failed tasks reset because a retry was requested.
    pub retried: Vec<TaskName>,
    pub skipped_successful: Vec<TaskName>,
    /// Failed tasks left as they are.
    pub still_failed: Vec<TaskName>,
}

impl ResumePlan {
    /// Tasks that will be (re)submitted by the dispatch loop.
    pub fn resubmitted(&self) -> usize {
        self.reset.len() + self.retried.len()
    }
}

pub struct ResumeManager<R: ResourceManager> {
    adapter: Arc<R>,
    fs: Arc<dyn FileSystem>,
    settings: DispatchSettings,
}

impl<R: ResourceManager> ResumeManager<R> {
    pub fn new(adapter: Arc<R>, fs: Arc<dyn FileSystem>, settings: DispatchSettings) -> Self {
        Self {
            adapter,
            fs,
            settings,
        }
    }

    pub async fn resume(&self, handle: &ExecutionHandle, retry_failed: bool) -> Result<ResumePlan> {
        let mut state = handle.lock().await;
        let mut plan = ResumePlan::default();
        let ctx = CoreContext {
            settings: &self.settings,
            fs: self.fs.as_ref(),
            verify_outputs: self.adapter.produces_outputs(),
        };

        // (a) In-flight tasks: ask the adapter about their jobs.
        let in_flight: Vec<(TaskId, Option<JobHandle>)> = state
            .tasks()
            .filter(|t| t.status.is_in_flight())
            .map(|t| (t.id, t.job_handle.clone()))
            .collect();
        let adapter = self.adapter.as_ref();
        let reports = join_all(in_flight.iter().map(|(_, h)| async move {
            match h {
                Some(h) => Some(adapter.poll(h).await),
                None => None,
            }
        }))
        .await;

        let mut finished = Vec::new();
        for ((id, _), report) in in_flight.iter().zip(reports) {
            let id = *id;
            let name = task_name(&state, id);
            match report {
                None | Some(Err(BatchdagError::UnknownJob(_))) => {
                    reset_to_waiting(&mut state, id)?;
                    plan.reset.push(name);
                }
                Some(report) => {
                    if let PollEffect::Finished { collect: true, .. } =
                        dispatch::apply_poll(&mut state, id, report, &ctx)?
                    {
                        finished.push(id);
                    }
                    plan.reattached.push(name);
                }
            }
        }
        for id in finished {
            let Some(task) = state.task(id) else {
                continue;
            };
            let Some(job) = task.job_handle.clone() else {
                continue;
            };
            let (name, requirements) = (task.name.clone(), task.requirements);
            let usage = collector::collect(adapter, &name, &job, &requirements).await;
            if let Some(task) = state.task_mut(id) {
                task.usage = Some(usage);
            }
        }

        // (b) and (c): terminal tasks, in insertion order.
        let terminal: Vec<(TaskId, Status)> = state
            .tasks()
            .filter(|t| t.status.is_terminal())
            .map(|t| (t.id, t.status))
            .collect();
        for (id, status) in terminal {
            let name = task_name(&state, id);
            match status {
                Status::Successful => plan.skipped_successful.push(name),
                Status::Failed if retry_failed => {
                    reset_to_waiting(&mut state, id)?;
                    plan.retried.push(name);
                }
                Status::Failed => plan.still_failed.push(name),
                Status::Killed => {
                    reset_to_waiting(&mut state, id)?;
                    plan.reset.push(name);
                }
                _ => {}
            }
        }

        state.execution.set_status(Status::Running);
        state
            .execution
            .info
            .insert("last_resumed".to_string(), serde_json::json!(Utc::now().to_rfc3339()));

        if !plan.still_failed.is_empty() {
            warn!(execution = %state.execution.name, tasks = ?plan.still_failed, "failed tasks kept; pass retry_failed to rerun them");
        }
        info!(
            execution = %state.execution.name,
            reattached = plan.reattached.len(),
            reset = plan.reset.len(),
            retried = plan.retried.len(),
            skipped_successful = plan.skipped_successful.len(),
            "execution resumed"
        );
        Ok(plan)
    }
}

fn task_name(state: &ExecutionState, id: TaskId) -> TaskName {
    state.task(id).map(|t| t.name.clone()).unwrap_or_default()
}

fn reset_to_waiting(state: &mut ExecutionState, id: TaskId) -> Result<()> {
    state.transition(id, Status::Waiting)?;
    if let Some(task) = state.task_mut(id) {
        task.reset_attempt();
    }
    Ok(())
}
