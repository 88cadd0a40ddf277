// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::types::GraphKind;

/// Command-line arguments for `batchdag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "batchdag",
    version,
    about = "Run DAGs of batch jobs, track their resources and resume failed runs.",
    long_about = None
)]
pub struct CliArgs {
    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `BATCHDAG_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Directory holding persisted executions. Overrides `[config].store_dir`.
    #[arg(long, global = true, value_name = "DIR")]
    pub store_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Start an execution of a workflow, or resume the one with this name.
    Run {
        /// Workflow definition (TOML).
        #[arg(value_name = "WORKFLOW", default_value = "Workflow.toml")]
        workflow: PathBuf,

        /// Execution name ([A-Za-z0-9_]+).
        #[arg(long)]
        name: String,

        /// Root directory for task outputs and logs.
        #[arg(long, value_name = "DIR")]
        output_dir: PathBuf,

        /// Delete a previous execution of this name and its outputs first.
        #[arg(long)]
        restart: bool,

        /// When resuming, rerun failed tasks too.
        #[arg(long)]
        retry_failed: bool,

        /// Use the dry-run backend: nothing is executed.
        #[arg(long)]
        dry_run: bool,
    },

    /// Resume a persisted execution.
    Resume {
        #[arg(long)]
        name: String,

        /// Pick up stages and tasks added to the workflow since the last run.
        #[arg(long, value_name = "WORKFLOW")]
        workflow: Option<PathBuf>,

        #[arg(long)]
        retry_failed: bool,
    },

    /// Print an execution summary as JSON.
    Status {
        #[arg(long)]
        name: String,

        /// Show one task in detail instead.
        #[arg(long, value_name = "TASK")]
        task: Option<String>,
    },

    /// Export the stage or task graph.
    Graph {
        #[arg(long)]
        name: String,

        #[arg(long, value_enum, default_value = "task")]
        kind: GraphKindArg,

        #[arg(long, value_enum, default_value = "json")]
        format: GraphFormat,
    },

    /// Kill an execution, or one of its stages.
    Kill {
        #[arg(long)]
        name: String,

        #[arg(long, value_name = "STAGE")]
        stage: Option<String>,
    },

    /// Delete a stage, its tasks and their output and log directories.
    DeleteStage {
        #[arg(long)]
        name: String,

        #[arg(long)]
        stage: String,
    },
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum GraphKindArg {
    Recipe,
    Task,
}

impl From<GraphKindArg> for GraphKind {
    fn from(kind: GraphKindArg) -> Self {
        match kind {
            GraphKindArg::Recipe => GraphKind::Recipe,
            GraphKindArg::Task => GraphKind::Task,
        }
    }
}

#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum GraphFormat {
    Json,
    Dot,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
