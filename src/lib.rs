// src/lib.rs

pub mod adapter;
pub mod cli;
pub mod collector;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod export;
pub mod fs;
pub mod logging;
pub mod model;
pub mod query;
pub mod status;
pub mod store;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::{info, warn};

use crate::adapter::Backend;
use crate::cli::{CliArgs, Command, GraphFormat};
use crate::config::{SettingsSection, WorkflowFile, load_and_validate};
use crate::engine::{DispatchSettings, Orchestrator, StartOptions};
use crate::fs::RealFileSystem;
use crate::model::ExecutionState;
use crate::status::Status;
use crate::store::{ExecutionStore, JsonStore};
use crate::types::AdapterKind;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - workflow loading
/// - the execution store
/// - the configured backend
/// - the orchestrator and its dispatch loop
/// - Ctrl-C handling (kills the running execution)
pub async fn run(args: CliArgs) -> Result<()> {
    match args.command {
        Command::Run {
            workflow,
            name,
            output_dir,
            restart,
            retry_failed,
            dry_run,
        } => {
            let wf = load_and_validate(&workflow)?;
            let adapter = if dry_run { AdapterKind::Dry } else { wf.config.adapter };
            let orch = orchestrator(args.store_dir.as_deref(), &wf.config, adapter)?;
            let _lease = orch.store().lease(&name)?;

            let started = orch
                .start(
                    &wf,
                    StartOptions {
                        name: name.clone(),
                        output_dir,
                        restart,
                        retry_failed,
                        command_line: Some(std::env::args().collect::<Vec<_>>().join(" ")),
                    },
                )
                .await?;
            if let Some(plan) = &started.plan {
                info!(execution = %name, resubmitted = plan.resubmitted(), "resuming existing execution");
            }
            drive(&orch, &started.handle, &name).await
        }

        Command::Resume {
            name,
            workflow,
            retry_failed,
        } => {
            let wf = workflow.map(load_and_validate).transpose()?;
            let settings = settings_of(wf.as_ref());
            let orch = orchestrator(args.store_dir.as_deref(), &settings, settings.adapter)?;
            let _lease = orch.store().lease(&name)?;
            let (handle, plan) = orch.resume(&name, wf.as_ref(), retry_failed).await?;
            info!(execution = %name, resubmitted = plan.resubmitted(), "resuming execution");
            drive(&orch, &handle, &name).await
        }

        Command::Status { name, task } => {
            let state = load_state(args.store_dir.as_deref(), &name)?;
            let json = match task {
                Some(task) => serde_json::to_string_pretty(&query::task_detail(
                    &state,
                    &task,
                    query::DEFAULT_NEIGHBOUR_LIMIT,
                )?)?,
                None => serde_json::to_string_pretty(&query::summarize(&state))?,
            };
            println!("{json}");
            Ok(())
        }

        Command::Graph { name, kind, format } => {
            let state = load_state(args.store_dir.as_deref(), &name)?;
            let payload = export::export(&state, kind.into());
            match format {
                GraphFormat::Json => println!("{}", serde_json::to_string_pretty(&payload)?),
                GraphFormat::Dot => print!("{}", payload.to_dot()),
            }
            Ok(())
        }

        Command::Kill { name, stage } => {
            let settings = SettingsSection::default();
            let orch = orchestrator(args.store_dir.as_deref(), &settings, settings.adapter)?;
            match orch.store().lease(&name) {
                Ok(_lease) => {
                    let handle = orch.open(&name)?;
                    let set = match stage {
                        Some(stage) => orch.kill_stage(&handle, &stage).await?,
                        None => orch.kill(&handle).await?,
                    };
                    println!("killed {} task(s)", set.killed.len());
                }
                // Only the process driving the execution can cancel its jobs.
                Err(errors::BatchdagError::ExecutionBusy { pid, .. }) if stage.is_none() => {
                    orch.request_kill(&name)?;
                    println!("kill requested; process {pid} will stop '{name}'");
                }
                Err(e) => return Err(e.into()),
            }
            Ok(())
        }

        Command::DeleteStage { name, stage } => {
            let settings = SettingsSection::default();
            let orch = orchestrator(args.store_dir.as_deref(), &settings, settings.adapter)?;
            let _lease = orch.store().lease(&name)?;
            let handle = orch.open(&name)?;
            let removed = orch.delete_stage(&handle, &stage).await?;
            println!("deleted stage '{stage}' ({removed} task(s))");
            Ok(())
        }
    }
}

fn settings_of(wf: Option<&WorkflowFile>) -> SettingsSection {
    wf.map(|w| w.config.clone()).unwrap_or_default()
}

fn store_dir(cli: Option<&Path>, settings: &SettingsSection) -> PathBuf {
    cli.map(Path::to_path_buf)
        .unwrap_or_else(|| settings.store_dir.clone())
}

fn orchestrator(
    cli_store: Option<&Path>,
    settings: &SettingsSection,
    adapter: AdapterKind,
) -> Result<Orchestrator<Backend>> {
    let store = JsonStore::open(store_dir(cli_store, settings))?;
    let backend = Backend::from_kind(
        adapter,
        std::time::Duration::from_millis(settings.sample_interval_ms),
    );
    Ok(Orchestrator::new(
        Arc::new(backend),
        Arc::new(store),
        Arc::new(RealFileSystem),
        DispatchSettings::from(settings),
    ))
}

fn load_state(cli_store: Option<&Path>, name: &str) -> Result<ExecutionState> {
    let store = JsonStore::open(store_dir(cli_store, &SettingsSection::default()))?;
    let record = store
        .load_by_name(name)?
        .ok_or_else(|| errors::BatchdagError::ExecutionNotFound(name.to_string()))?;
    Ok(ExecutionState::from_record(record)?)
}

/// Run the dispatch loop with Ctrl-C wired to a kill, then print the summary.
async fn drive(
    orch: &Orchestrator<Backend>,
    handle: &engine::ExecutionHandle,
    name: &str,
) -> Result<()> {
    {
        let orch = orch.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            warn!("interrupt received; killing execution");
            if let Err(e) = orch.kill(&handle).await {
                warn!(error = %e, "kill after interrupt failed");
            }
        });
    }

    let status = orch.run(handle).await?;
    let summary = query::summarize(&handle.snapshot().await);
    println!("{}", serde_json::to_string_pretty(&summary)?);

    match status {
        Status::Successful | Status::FailedButContinued => Ok(()),
        other => bail!("execution '{name}' ended {other}"),
    }
}
