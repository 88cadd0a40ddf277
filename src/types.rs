use std::str::FromStr;
use serde::{Deserialize, Serialize};

/// How a stage reacts when one of its tasks fails.
///
/// - `Abort`: the stage fails, which fails the whole execution (default).
/// - `Continue`: the stage tolerates the failure and ends up
///   `failed_but_continued`; tasks depending on the failed task can never
///   become ready and are killed.
/// - `Release`: like `Continue`, but dependents treat the failed task as a
///   satisfied parent and run anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Abort,
    Continue,
    Release,
}

impl FailurePolicy {
    pub fn tolerates_failure(self) -> bool {
        !matches!(self, FailurePolicy::Abort)
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "abort" => Ok(FailurePolicy::Abort),
            "continue" => Ok(FailurePolicy::Continue),
            "release" => Ok(FailurePolicy::Release),
            other => Err(format!(
                "invalid failure_policy: {other} (expected \"abort\", \"continue\" or \"release\")"
            )),
        }
    }
}

/// Which resource-manager backend executes tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// Local process pool.
    #[default]
    Local,
    /// Accept every submission and report success without running anything.
    Dry,
}

impl FromStr for AdapterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(AdapterKind::Local),
            "dry" => Ok(AdapterKind::Dry),
            other => Err(format!(
                "invalid adapter: {other} (expected \"local\" or \"dry\")"
            )),
        }
    }
}

/// Which granularity a graph export renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphKind {
    /// One node per stage.
    Recipe,
    /// One node per task.
    Task,
}

impl FromStr for GraphKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "recipe" => Ok(GraphKind::Recipe),
            "task" => Ok(GraphKind::Task),
            other => Err(format!(
                "invalid graph type: {other} (expected \"recipe\" or \"task\")"
            )),
        }
    }
}
