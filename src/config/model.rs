// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::types::{AdapterKind, FailurePolicy};

/// Workflow definition as read from a TOML file, before validation.
///
/// ```toml
/// [config]
/// adapter = "local"
/// max_concurrent = 4
///
/// [[stage]]
/// name = "align"
///
/// [[stage.task]]
/// name = "align_1"
/// cmd = "bwa mem ref.fa r1.fq > align_1.sam"
/// outputs = ["align_1.sam"]
///
/// [[stage]]
/// name = "merge"
/// after_stages = ["align"]
///
/// [[stage.task]]
/// name = "merge"
/// cmd = "samtools merge ..."
/// ```
///
/// Stages and tasks are arrays so that their order in the file is their
/// submission and insertion order.
#[derive(Debug, Clone, Deserialize)]
pub struct RawWorkflowFile {
    #[serde(default)]
    pub config: SettingsSection,

    #[serde(default)]
    pub stage: Vec<StageConfig>,
}

/// A validated workflow definition. Only constructed via
/// `TryFrom<RawWorkflowFile>` (see `config::validate`).
#[derive(Debug, Clone)]
pub struct WorkflowFile {
    pub config: SettingsSection,
    pub stage: Vec<StageConfig>,
}

impl WorkflowFile {
    pub(crate) fn new_unchecked(config: SettingsSection, stage: Vec<StageConfig>) -> Self {
        Self { config, stage }
    }

    pub fn task_count(&self) -> usize {
        self.stage.iter().map(|s| s.task.len()).sum()
    }
}

/// `[config]` section: dispatcher and backend settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SettingsSection {
    /// `"local"` (default) or `"dry"`.
    #[serde(default)]
    pub adapter: AdapterKind,

    /// Ceiling on simultaneously submitted + running tasks.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Optional ceiling on the summed `cpus` of in-flight tasks.
    #[serde(default)]
    pub max_cpus: Option<u32>,

    /// Optional ceiling on the summed `memory_mb` of in-flight tasks.
    #[serde(default)]
    pub max_memory_mb: Option<u64>,

    /// Delay between dispatch iterations.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Consecutive transient adapter errors tolerated per task before it is
    /// failed.
    #[serde(default = "default_adapter_retry_limit")]
    pub adapter_retry_limit: u32,

    /// Base delay of the exponential backoff after transient adapter errors.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Cap on the backoff delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Fail a task that stays `submitted` this long without a heartbeat.
    #[serde(default)]
    pub heartbeat_timeout_secs: Option<u64>,

    /// How long a finished dispatch loop keeps polling cancelled jobs for
    /// their terminal report before storing requested resources only.
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,

    /// How often the local backend samples process cpu/memory.
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    /// Directory holding persisted executions.
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
}

fn default_max_concurrent() -> usize {
    8
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_adapter_retry_limit() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_cancel_grace_secs() -> u64 {
    30
}

fn default_sample_interval_ms() -> u64 {
    1_000
}

fn default_store_dir() -> PathBuf {
    PathBuf::from(".batchdag")
}

impl Default for SettingsSection {
    fn default() -> Self {
        Self {
            adapter: AdapterKind::default(),
            max_concurrent: default_max_concurrent(),
            max_cpus: None,
            max_memory_mb: None,
            poll_interval_ms: default_poll_interval_ms(),
            adapter_retry_limit: default_adapter_retry_limit(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            heartbeat_timeout_secs: None,
            cancel_grace_secs: default_cancel_grace_secs(),
            sample_interval_ms: default_sample_interval_ms(),
            store_dir: default_store_dir(),
        }
    }
}

/// `[[stage]]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    pub name: String,

    /// `"abort"` (default), `"continue"` or `"release"`.
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Every task of this stage depends on every task of these stages.
    #[serde(default)]
    pub after_stages: Vec<String>,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    #[serde(default)]
    pub task: Vec<TaskConfig>,
}

/// `[[stage.task]]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    /// Unique across the whole workflow.
    pub name: String,

    /// The command to execute.
    pub cmd: String,

    /// Names of tasks (in any stage) this task waits for.
    #[serde(default)]
    pub after: Vec<String>,

    #[serde(default)]
    pub inputs: Vec<PathBuf>,

    /// Files the command must create. Relative paths resolve against the
    /// task's output directory.
    #[serde(default)]
    pub outputs: Vec<PathBuf>,

    #[serde(default)]
    pub cpus: Option<u32>,

    #[serde(default)]
    pub memory_mb: Option<u64>,

    #[serde(default)]
    pub time_limit_secs: Option<u64>,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}
