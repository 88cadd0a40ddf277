use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use batchdag::adapter::{AdapterFuture, JobHandle, JobRequest, JobState, ResourceManager};
use batchdag::errors::BatchdagError;
use batchdag::fs::MockFileSystem;
use batchdag::model::ResourceUsage;

/// How a scripted job ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Exit 0, writing declared outputs if a filesystem is attached.
    Succeed,
    /// Exit 0 without writing declared outputs.
    SucceedWithoutOutputs,
    /// Exit with this code (0 behaves like `Succeed`).
    Exit(i32),
    /// The backend reports abnormal termination.
    Abnormal,
    /// Stays running until cancelled.
    Hang,
    /// Stays queued in the backend until cancelled; never reports running.
    Queued,
    /// Polls report the handle as unknown.
    Lost,
    /// The backend itself kills the job.
    KilledByBackend,
}

#[derive(Debug, Clone, Copy)]
struct Script {
    outcome: Outcome,
    running_polls: u32,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            outcome: Outcome::Succeed,
            running_polls: 0,
        }
    }
}

#[derive(Debug)]
struct Job {
    task: String,
    outcome: Outcome,
    polls_left: u32,
    cancelled: bool,
    /// Polls still answered `Running` after a lagging cancel.
    lagging: Option<u32>,
    outputs: Vec<PathBuf>,
}

#[derive(Debug, Default)]
struct Inner {
    scripts: HashMap<String, Script>,
    usage: HashMap<String, ResourceUsage>,
    submit_failures: HashMap<String, u32>,
    poll_failures: HashMap<String, u32>,
    accounting_fails: bool,
    cancel_lags: HashMap<String, u32>,
    polls: HashMap<String, u32>,
    jobs: HashMap<JobHandle, Job>,
    live: HashSet<JobHandle>,
    peak_live: usize,
    submitted: Vec<String>,
    cancelled: Vec<String>,
    seq: u64,
}

/// A fake resource manager whose jobs follow per-task scripts.
///
/// Unscripted tasks succeed on their first poll. Every submission and
/// cancellation is recorded by task name.
#[derive(Debug, Clone, Default)]
pub struct ScriptedAdapter {
    inner: Arc<Mutex<Inner>>,
    fs: Option<MockFileSystem>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful jobs create their declared outputs in `fs`.
    pub fn with_fs(mut self, fs: MockFileSystem) -> Self {
        self.fs = Some(fs);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn script(&self, task: &str, outcome: Outcome, running_polls: u32) -> &Self {
        self.lock().scripts.insert(
            task.to_string(),
            Script {
                outcome,
                running_polls,
            },
        );
        self
    }

    /// Shorthand for a task that exits with `code` on its first poll.
    pub fn exit(&self, task: &str, code: i32) -> &Self {
        self.script(task, Outcome::Exit(code), 0)
    }

    pub fn usage(&self, task: &str, usage: ResourceUsage) -> &Self {
        self.lock().usage.insert(task.to_string(), usage);
        self
    }

    /// The next `n` submissions of `task` fail with a transient error.
    pub fn fail_submissions(&self, task: &str, n: u32) -> &Self {
        self.lock().submit_failures.insert(task.to_string(), n);
        self
    }

    /// The next `n` polls of `task` fail with a transient error.
    pub fn fail_polls(&self, task: &str, n: u32) -> &Self {
        self.lock().poll_failures.insert(task.to_string(), n);
        self
    }

    /// Cancelling `task` takes effect late: the job keeps reporting running
    /// for `polls` more polls, then ends with its scripted outcome.
    pub fn cancel_lag(&self, task: &str, polls: u32) -> &Self {
        self.lock().cancel_lags.insert(task.to_string(), polls);
        self
    }

    pub fn fail_accounting(&self) -> &Self {
        self.lock().accounting_fails = true;
        self
    }

    /// Forget every job, as if the backend restarted.
    pub fn forget_jobs(&self) {
        let mut inner = self.lock();
        inner.jobs.clear();
        inner.live.clear();
    }

    pub fn submitted(&self) -> Vec<String> {
        self.lock().submitted.clone()
    }

    pub fn submission_count(&self, task: &str) -> usize {
        self.lock().submitted.iter().filter(|t| *t == task).count()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.lock().cancelled.clone()
    }

    /// Polls answered for `task`, errors included.
    pub fn poll_count(&self, task: &str) -> u32 {
        self.lock().polls.get(task).copied().unwrap_or(0)
    }

    /// Largest number of jobs alive at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.lock().peak_live
    }

    fn poll_now(&self, handle: &JobHandle) -> batchdag::errors::Result<JobState> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let Some(job) = inner.jobs.get(handle) else {
            return Err(BatchdagError::UnknownJob(handle.to_string()));
        };
        let task = job.task.clone();
        *inner.polls.entry(task.clone()).or_default() += 1;

        if let Some(n) = inner.poll_failures.get_mut(&task) {
            if *n > 0 {
                *n -= 1;
                return Err(BatchdagError::AdapterUnavailable(format!(
                    "scripted poll failure for {task}"
                )));
            }
        }

        let Some(job) = inner.jobs.get_mut(handle) else {
            return Err(BatchdagError::UnknownJob(handle.to_string()));
        };
        if job.cancelled {
            return Ok(JobState::Killed);
        }
        if let Some(n) = job.lagging.as_mut() {
            if *n > 0 {
                *n -= 1;
                return Ok(JobState::Running);
            }
            job.polls_left = 0;
        }
        if job.outcome == Outcome::Lost {
            return Err(BatchdagError::UnknownJob(handle.to_string()));
        }
        if job.polls_left > 0 {
            job.polls_left -= 1;
            return Ok(JobState::Running);
        }

        let state = match job.outcome {
            Outcome::Succeed | Outcome::Exit(0) => {
                if let Some(fs) = &self.fs {
                    for path in &job.outputs {
                        fs.add_file(path, "");
                    }
                }
                JobState::Succeeded { exit_code: 0 }
            }
            Outcome::SucceedWithoutOutputs => JobState::Succeeded { exit_code: 0 },
            Outcome::Exit(code) => JobState::Failed { exit_code: code },
            Outcome::Abnormal => JobState::Failed { exit_code: -1 },
            Outcome::Hang => JobState::Running,
            Outcome::Queued => JobState::Pending,
            Outcome::KilledByBackend => JobState::Killed,
            Outcome::Lost => unreachable!(),
        };
        if state.is_terminal() {
            inner.live.remove(handle);
        }
        Ok(state)
    }
}

impl ResourceManager for ScriptedAdapter {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn submit(&self, job: JobRequest) -> AdapterFuture<'_, JobHandle> {
        Box::pin(async move {
            let mut guard = self.lock();
            let inner = &mut *guard;
            if let Some(n) = inner.submit_failures.get_mut(&job.name) {
                if *n > 0 {
                    *n -= 1;
                    return Err(BatchdagError::AdapterUnavailable(format!(
                        "scripted submit failure for {}",
                        job.name
                    )));
                }
            }

            inner.seq += 1;
            let handle = JobHandle(format!("scripted-{}", inner.seq));
            let script = inner.scripts.get(&job.name).copied().unwrap_or_default();
            inner.jobs.insert(
                handle.clone(),
                Job {
                    task: job.name.clone(),
                    outcome: script.outcome,
                    polls_left: script.running_polls,
                    cancelled: false,
                    lagging: None,
                    outputs: job.outputs.clone(),
                },
            );
            inner.live.insert(handle.clone());
            inner.peak_live = inner.peak_live.max(inner.live.len());
            inner.submitted.push(job.name);
            Ok(handle)
        })
    }

    fn poll(&self, handle: &JobHandle) -> AdapterFuture<'_, JobState> {
        let handle = handle.clone();
        Box::pin(async move { self.poll_now(&handle) })
    }

    fn accounting(&self, handle: &JobHandle) -> AdapterFuture<'_, ResourceUsage> {
        let handle = handle.clone();
        Box::pin(async move {
            let inner = self.lock();
            if inner.accounting_fails {
                return Err(BatchdagError::AdapterUnavailable(
                    "scripted accounting failure".to_string(),
                ));
            }
            let job = inner
                .jobs
                .get(&handle)
                .ok_or_else(|| BatchdagError::UnknownJob(handle.to_string()))?;
            Ok(inner.usage.get(&job.task).copied().unwrap_or_default())
        })
    }

    fn cancel(&self, handle: &JobHandle) -> AdapterFuture<'_, ()> {
        let handle = handle.clone();
        Box::pin(async move {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let task = match inner.jobs.get_mut(&handle) {
                Some(job) => {
                    match inner.cancel_lags.get(&job.task) {
                        Some(&lag) => job.lagging = Some(job.lagging.unwrap_or(lag)),
                        None => job.cancelled = true,
                    }
                    job.task.clone()
                }
                None => return Err(BatchdagError::UnknownJob(handle.to_string())),
            };
            if !inner.cancel_lags.contains_key(&task) {
                inner.live.remove(&handle);
            }
            inner.cancelled.push(task);
            Ok(())
        })
    }
}
