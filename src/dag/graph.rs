// src/dag/graph.rs

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graphmap::DiGraphMap;

use crate::dag::page::Page;
use crate::errors::{BatchdagError, Result};
use crate::model::{TaskId, TaskName};

/// Internal node structure: stores immediate parents and children in the
/// order the edges were added.
#[derive(Debug, Clone)]
struct DagNode {
    name: TaskName,
    parents: Vec<TaskId>,
    children: Vec<TaskId>,
}

/// Task-level DAG for one execution.
///
/// Adjacency is kept twice: ordered vectors for stable listings, and a
/// petgraph map for reachability checks. Edge direction is parent -> child.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashMap<TaskId, DagNode>,
    order: Vec<TaskId>,
    reach: DiGraphMap<TaskId, ()>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Task ids in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.order.iter().copied()
    }

    /// Register a task and its parents.
    ///
    /// If the task is already present this is [`Self::add_dependencies`].
    /// Every parent must already be registered. Nothing is inserted unless
    /// the whole edge set is valid.
    pub fn add_task(&mut self, id: TaskId, name: &str, parents: &[TaskId]) -> Result<()> {
        if self.nodes.contains_key(&id) {
            return self.add_dependencies(id, parents);
        }

        for &parent in parents {
            if parent == id {
                return Err(BatchdagError::CycleError {
                    parent: name.to_string(),
                    child: name.to_string(),
                });
            }
            if !self.nodes.contains_key(&parent) {
                return Err(BatchdagError::TaskNotFound(format!(
                    "parent {parent} of task '{name}'"
                )));
            }
        }

        self.nodes.insert(
            id,
            DagNode {
                name: name.to_string(),
                parents: Vec::new(),
                children: Vec::new(),
            },
        );
        self.order.push(id);
        self.reach.add_node(id);

        // A fresh node has no outgoing edges, so these cannot close a cycle.
        for &parent in dedup(parents).iter() {
            self.insert_edge(parent, id);
        }
        Ok(())
    }

    /// Add parent edges to an already registered task.
    ///
    /// Fails with [`BatchdagError::CycleError`] if `child` already reaches
    /// any of the new parents; the graph is left unchanged on error.
    pub fn add_dependencies(&mut self, child: TaskId, parents: &[TaskId]) -> Result<()> {
        let child_name = self
            .nodes
            .get(&child)
            .map(|n| n.name.clone())
            .ok_or_else(|| BatchdagError::TaskNotFound(format!("task {child}")))?;

        let mut new_parents = Vec::new();
        for parent in dedup(parents) {
            let parent_name = match self.nodes.get(&parent) {
                Some(node) => node.name.clone(),
                None => {
                    return Err(BatchdagError::TaskNotFound(format!(
                        "parent {parent} of task '{child_name}'"
                    )));
                }
            };

            // All new edges point into `child`, so a new cycle exists iff
            // `child` already reaches one of the parents.
            if parent == child || has_path_connecting(&self.reach, child, parent, None) {
                return Err(BatchdagError::CycleError {
                    parent: parent_name,
                    child: child_name,
                });
            }

            if !self.reach.contains_edge(parent, child) {
                new_parents.push(parent);
            }
        }

        for parent in new_parents {
            self.insert_edge(parent, child);
        }
        Ok(())
    }

    fn insert_edge(&mut self, parent: TaskId, child: TaskId) {
        self.reach.add_edge(parent, child, ());
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children.push(child);
        }
        if let Some(node) = self.nodes.get_mut(&child) {
            node.parents.push(parent);
        }
    }

    /// Remove tasks and every edge touching them.
    pub fn remove_tasks(&mut self, ids: &[TaskId]) {
        let doomed: HashSet<TaskId> = ids.iter().copied().collect();
        for id in &doomed {
            self.nodes.remove(id);
            self.reach.remove_node(*id);
        }
        self.order.retain(|id| !doomed.contains(id));
        for node in self.nodes.values_mut() {
            node.parents.retain(|p| !doomed.contains(p));
            node.children.retain(|c| !doomed.contains(c));
        }
    }

    /// Immediate parents, insertion ordered.
    pub fn parents_of(&self, id: TaskId) -> &[TaskId] {
        self.nodes
            .get(&id)
            .map(|n| n.parents.as_slice())
            .unwrap_or(&[])
    }

    /// Immediate children, insertion ordered.
    pub fn children_of(&self, id: TaskId) -> &[TaskId] {
        self.nodes
            .get(&id)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    /// First `limit` parents plus the total count.
    pub fn parents(&self, id: TaskId, limit: usize) -> Page<TaskId> {
        Page::truncate(self.parents_of(id).iter().copied(), limit)
    }

    /// First `limit` children plus the total count.
    pub fn children(&self, id: TaskId, limit: usize) -> Page<TaskId> {
        Page::truncate(self.children_of(id).iter().copied(), limit)
    }

    /// Transitive parents, breadth first.
    pub fn ancestors(&self, id: TaskId) -> Vec<TaskId> {
        self.walk(id, true)
    }

    /// Transitive children, breadth first.
    pub fn descendants(&self, id: TaskId) -> Vec<TaskId> {
        self.walk(id, false)
    }

    fn walk(&self, start: TaskId, upward: bool) -> Vec<TaskId> {
        let next = |id: TaskId| {
            if upward {
                self.parents_of(id)
            } else {
                self.children_of(id)
            }
        };

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut queue: VecDeque<TaskId> = next(start).iter().copied().collect();

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            out.push(id);
            queue.extend(next(id).iter().copied());
        }
        out
    }

    /// Parents before children. The graph is acyclic by construction.
    pub fn topological_order(&self) -> Vec<TaskId> {
        match toposort(&self.reach, None) {
            Ok(order) => order,
            Err(_) => self.order.clone(),
        }
    }
}

fn dedup(ids: &[TaskId]) -> Vec<TaskId> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}
