// src/config/validate.rs

use std::collections::{HashMap, HashSet};

use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{RawWorkflowFile, WorkflowFile};
use crate::errors::{BatchdagError, Result};

impl TryFrom<RawWorkflowFile> for WorkflowFile {
    type Error = BatchdagError;

    fn try_from(raw: RawWorkflowFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_workflow(&raw)?;
        Ok(WorkflowFile::new_unchecked(raw.config, raw.stage))
    }
}

fn validate_raw_workflow(cfg: &RawWorkflowFile) -> Result<()> {
    ensure_has_tasks(cfg)?;
    validate_settings(cfg)?;
    validate_names(cfg)?;
    validate_references(cfg)?;
    validate_dag(cfg)?;
    Ok(())
}

fn ensure_has_tasks(cfg: &RawWorkflowFile) -> Result<()> {
    if cfg.stage.iter().all(|s| s.task.is_empty()) {
        return Err(BatchdagError::ConfigError(
            "workflow must contain at least one [[stage.task]] entry".to_string(),
        ));
    }
    Ok(())
}

fn validate_settings(cfg: &RawWorkflowFile) -> Result<()> {
    // adapter and failure_policy are strongly typed and validated during
    // deserialization.
    if cfg.config.max_concurrent == 0 {
        return Err(BatchdagError::ConfigError(
            "[config].max_concurrent must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.config.poll_interval_ms == 0 {
        return Err(BatchdagError::ConfigError(
            "[config].poll_interval_ms must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.config.sample_interval_ms == 0 {
        return Err(BatchdagError::ConfigError(
            "[config].sample_interval_ms must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

/// Stage and task names become directory names.
fn check_path_safe(kind: &str, name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok {
        Ok(())
    } else {
        Err(BatchdagError::ConfigError(format!(
            "invalid {kind} name '{name}' (use letters, digits, '_', '-', '.')"
        )))
    }
}

fn validate_names(cfg: &RawWorkflowFile) -> Result<()> {
    let mut stages = HashSet::new();
    let mut tasks = HashSet::new();

    for stage in &cfg.stage {
        check_path_safe("stage", &stage.name)?;
        if stage.name == "log" {
            return Err(BatchdagError::ConfigError(
                "stage name 'log' is reserved for task logs".to_string(),
            ));
        }
        if !stages.insert(stage.name.as_str()) {
            return Err(BatchdagError::ConfigError(format!(
                "duplicate stage name '{}'",
                stage.name
            )));
        }
        for task in &stage.task {
            check_path_safe("task", &task.name)?;
            if !tasks.insert(task.name.as_str()) {
                return Err(BatchdagError::ConfigError(format!(
                    "duplicate task name '{}'",
                    task.name
                )));
            }
        }
    }
    Ok(())
}

fn validate_references(cfg: &RawWorkflowFile) -> Result<()> {
    let stages: HashSet<&str> = cfg.stage.iter().map(|s| s.name.as_str()).collect();
    let tasks: HashSet<&str> = cfg
        .stage
        .iter()
        .flat_map(|s| s.task.iter().map(|t| t.name.as_str()))
        .collect();

    for stage in &cfg.stage {
        for dep in &stage.after_stages {
            if !stages.contains(dep.as_str()) {
                return Err(BatchdagError::ConfigError(format!(
                    "stage '{}' has unknown stage '{}' in `after_stages`",
                    stage.name, dep
                )));
            }
            if dep == &stage.name {
                return Err(BatchdagError::ConfigError(format!(
                    "stage '{}' cannot depend on itself in `after_stages`",
                    stage.name
                )));
            }
        }
        for task in &stage.task {
            for dep in &task.after {
                if !tasks.contains(dep.as_str()) {
                    return Err(BatchdagError::ConfigError(format!(
                        "task '{}' has unknown dependency '{}' in `after`",
                        task.name, dep
                    )));
                }
                if dep == &task.name {
                    return Err(BatchdagError::ConfigError(format!(
                        "task '{}' cannot depend on itself in `after`",
                        task.name
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Every (parent, child) edge the workflow declares, by task name.
pub(crate) fn declared_edges(cfg_stages: &[crate::config::StageConfig]) -> Vec<(&str, &str)> {
    let stage_tasks: HashMap<&str, Vec<&str>> = cfg_stages
        .iter()
        .map(|s| {
            (
                s.name.as_str(),
                s.task.iter().map(|t| t.name.as_str()).collect(),
            )
        })
        .collect();

    let mut edges = Vec::new();
    for stage in cfg_stages {
        for task in &stage.task {
            for dep in &task.after {
                edges.push((dep.as_str(), task.name.as_str()));
            }
            for dep_stage in &stage.after_stages {
                for parent in stage_tasks.get(dep_stage.as_str()).into_iter().flatten() {
                    edges.push((*parent, task.name.as_str()));
                }
            }
        }
    }
    edges
}

fn validate_dag(cfg: &RawWorkflowFile) -> Result<()> {
    // Edge direction: parent -> child.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for stage in &cfg.stage {
        for task in &stage.task {
            graph.add_node(task.name.as_str());
        }
    }
    for (parent, child) in declared_edges(&cfg.stage) {
        graph.add_edge(parent, child, ());
    }

    // A topological sort will fail if there is a cycle.
    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => {
            let node = cycle.node_id();
            // Report an edge on the cycle: a parent of `node` that `node`
            // reaches again.
            let parent = graph
                .neighbors_directed(node, petgraph::Direction::Incoming)
                .find(|&p| has_path_connecting(&graph, node, p, None))
                .unwrap_or(node);
            Err(BatchdagError::CycleError {
                parent: parent.to_string(),
                child: node.to_string(),
            })
        }
    }
}
