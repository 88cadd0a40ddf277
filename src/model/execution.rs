// src/model/execution.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{BatchdagError, Result};
use crate::model::ExecutionId;
use crate::status::Status;

/// One workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub name: String,
    pub output_dir: PathBuf,
    /// Free-form attributes surfaced to collaborators (last command line,
    /// resume history, stall diagnostics...).
    #[serde(default)]
    pub info: BTreeMap<String, serde_json::Value>,
    pub status: Status,
    pub created_on: DateTime<Utc>,
    #[serde(default)]
    pub started_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_on: Option<DateTime<Utc>>,
    /// Aggregate cpu ceiling over in-flight tasks, if any.
    #[serde(default)]
    pub max_cpus: Option<u32>,
    /// Soft-delete marker; deleted executions are hidden from listings.
    #[serde(default)]
    pub deleted: bool,
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("static regex is valid"))
}

impl Execution {
    pub fn new(id: ExecutionId, name: &str, output_dir: PathBuf) -> Result<Self> {
        Self::validate_name(name)?;
        Ok(Self {
            id,
            name: name.to_string(),
            output_dir,
            info: BTreeMap::new(),
            status: Status::NoAttempt,
            created_on: Utc::now(),
            started_on: None,
            finished_on: None,
            max_cpus: None,
            deleted: false,
        })
    }

    /// Names are restricted to word characters so they are safe as file and
    /// directory names.
    pub fn validate_name(name: &str) -> Result<()> {
        if name_pattern().is_match(name) {
            Ok(())
        } else {
            Err(BatchdagError::ConfigError(format!(
                "invalid execution name '{name}' (expected [A-Za-z0-9_]+)"
            )))
        }
    }

    /// `killed` and `failed` stick: later task reports never revive them.
    pub fn status_is_sticky(&self) -> bool {
        matches!(self.status, Status::Killed | Status::Failed)
    }

    /// Set the status, stamping `finished_on` when it becomes terminal.
    pub fn set_status(&mut self, status: Status) {
        if self.status == status {
            return;
        }
        self.status = status;
        if status.is_terminal() {
            self.finished_on = Some(Utc::now());
        } else {
            self.finished_on = None;
        }
    }
}
