// src/adapter/local.rs

//! Local process-pool backend.
//!
//! Each submitted job runs as `sh -c <command>` (or `cmd /C` on Windows) in
//! the task's output directory, with stdout/stderr redirected to the task's
//! capture files. A supervisor future per job waits for the process,
//! samples it through [`super::procfs`] and records the final state and
//! usage in a shared job table that `poll`/`accounting` read from. A job
//! leaves the table once its accounting has been served.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::adapter::procfs::{UsageSampler, read_sample};
use crate::adapter::{AdapterFuture, JobHandle, JobRequest, JobState, ResourceManager};
use crate::errors::{BatchdagError, Result};
use crate::model::ResourceUsage;

/// Internal record for one job.
///
/// - `cancel` asks the supervisor to kill the process; it is taken on first
///   use so a job is only ever cancelled once.
/// - `usage` is filled in when the process exits, together with the
///   terminal `state`.
#[derive(Debug)]
struct LocalJob {
    state: JobState,
    usage: Option<ResourceUsage>,
    cancel: Option<oneshot::Sender<()>>,
}

type JobTable = Arc<Mutex<HashMap<JobHandle, LocalJob>>>;

#[derive(Debug, Clone)]
pub struct LocalAdapter {
    jobs: JobTable,
    seq: Arc<AtomicU64>,
    sample_interval: Duration,
}

impl LocalAdapter {
    pub fn new(sample_interval: Duration) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            seq: Arc::new(AtomicU64::new(0)),
            sample_interval,
        }
    }

    /// Handles embed the orchestrator's pid so a restarted process never
    /// mistakes an old handle for one of its own jobs.
    fn next_handle(&self) -> JobHandle {
        let n = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        JobHandle(format!("local-{}-{n}", std::process::id()))
    }

    fn table(&self) -> Result<MutexGuard<'_, HashMap<JobHandle, LocalJob>>> {
        lock_table(&self.jobs)
    }

    /// Jobs still held in the table.
    pub fn tracked_jobs(&self) -> Result<usize> {
        Ok(self.table()?.len())
    }

    async fn spawn_job(&self, job: JobRequest) -> Result<JobHandle> {
        tokio::fs::create_dir_all(&job.output_dir).await?;
        tokio::fs::create_dir_all(&job.log_dir).await?;
        let stdout = std::fs::File::create(&job.stdout)?;
        let stderr = std::fs::File::create(&job.stderr)?;

        let mut cmd = shell_command(&job.command);
        cmd.current_dir(&job.output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            BatchdagError::AdapterUnavailable(format!(
                "spawning process for task '{}': {e}",
                job.name
            ))
        })?;

        let handle = self.next_handle();
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

        self.table()?.insert(
            handle.clone(),
            LocalJob {
                state: JobState::Running,
                usage: None,
                cancel: Some(cancel_tx),
            },
        );

        info!(
            task = %job.name,
            handle = %handle,
            pid = child.id(),
            cmd = %job.command,
            "started local process"
        );

        tokio::spawn(supervise(
            child,
            handle.clone(),
            Arc::clone(&self.jobs),
            cancel_rx,
            self.sample_interval,
        ));

        Ok(handle)
    }
}

impl Default for LocalAdapter {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl ResourceManager for LocalAdapter {
    fn name(&self) -> &'static str {
        "local"
    }

    fn submit(&self, job: JobRequest) -> AdapterFuture<'_, JobHandle> {
        Box::pin(self.spawn_job(job))
    }

    fn poll(&self, handle: &JobHandle) -> AdapterFuture<'_, JobState> {
        let handle = handle.clone();
        Box::pin(async move {
            let state = self.table()?.get(&handle).map(|job| job.state);
            state.ok_or(BatchdagError::UnknownJob(handle.0))
        })
    }

    fn accounting(&self, handle: &JobHandle) -> AdapterFuture<'_, ResourceUsage> {
        let handle = handle.clone();
        Box::pin(async move {
            let mut table = self.table()?;
            let job = table
                .get(&handle)
                .ok_or_else(|| BatchdagError::UnknownJob(handle.0.clone()))?;
            let Some(usage) = job.usage else {
                return Err(BatchdagError::AdapterUnavailable(format!(
                    "job {handle} has not finished; no accounting yet"
                )));
            };
            table.remove(&handle);
            debug!(handle = %handle, "accounting served; job released");
            Ok(usage)
        })
    }

    fn cancel(&self, handle: &JobHandle) -> AdapterFuture<'_, ()> {
        let handle = handle.clone();
        Box::pin(async move {
            let cancel = {
                let mut table = self.table()?;
                let job = table
                    .get_mut(&handle)
                    .ok_or_else(|| BatchdagError::UnknownJob(handle.0.clone()))?;
                job.cancel.take()
            };

            match cancel {
                Some(tx) => {
                    if tx.send(()).is_err() {
                        debug!(handle = %handle, "process already finished while cancelling");
                    }
                }
                None => {
                    debug!(handle = %handle, "job already cancelled or finished");
                }
            }
            Ok(())
        })
    }
}

fn lock_table(jobs: &JobTable) -> Result<MutexGuard<'_, HashMap<JobHandle, LocalJob>>> {
    jobs.lock()
        .map_err(|_| BatchdagError::AdapterUnavailable("local job table poisoned".to_string()))
}

/// Build a shell command appropriate for the platform.
fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command);
        c
    }
}

/// Wait for the process, sampling it until it exits or is cancelled, then
/// publish the final state and usage.
async fn supervise(
    mut child: Child,
    handle: JobHandle,
    jobs: JobTable,
    mut cancel_rx: oneshot::Receiver<()>,
    sample_interval: Duration,
) {
    let started = Instant::now();
    let pid = child.id();
    let mut sampler = UsageSampler::new();
    let mut ticker = tokio::time::interval(sample_interval);
    let mut cancel_open = true;

    let state = loop {
        tokio::select! {
            status = child.wait() => {
                break match status {
                    Ok(status) if status.success() => JobState::Succeeded { exit_code: 0 },
                    Ok(status) => JobState::Failed { exit_code: status.code().unwrap_or(-1) },
                    Err(e) => {
                        warn!(handle = %handle, error = %e, "waiting for local process failed");
                        JobState::Failed { exit_code: -1 }
                    }
                };
            }

            cancel = &mut cancel_rx, if cancel_open => {
                match cancel {
                    Ok(()) => {
                        info!(handle = %handle, "cancellation requested; killing process");
                        if let Err(e) = child.kill().await {
                            warn!(handle = %handle, error = %e, "failed to kill process on cancellation");
                        }
                        break JobState::Killed;
                    }
                    Err(_) => {
                        // Sender dropped without cancelling; keep waiting.
                        cancel_open = false;
                    }
                }
            }

            _ = ticker.tick() => {
                if let Some(sample) = pid.and_then(read_sample) {
                    sampler.record(sample, Instant::now());
                }
            }
        }
    };

    let usage = sampler.finish(started.elapsed());
    debug!(handle = %handle, ?state, ?usage, "local process finished");

    match lock_table(&jobs) {
        Ok(mut table) => {
            if let Some(job) = table.get_mut(&handle) {
                job.state = state;
                job.usage = Some(usage);
                job.cancel = None;
            }
        }
        Err(e) => warn!(handle = %handle, error = %e, "could not record job result"),
    }
}
