//! Dependency graph for task ordering.
//!
//! This module provides the DependencyGraph structure that represents
//! task ordering constraints as a directed acyclic graph, enabling
//! parallel execution of independent tasks.

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet, VecDeque};

/// The task dependency graph.
///
/// Nodes are task ids; an edge `dep -> task` means `task` depends on `dep`
/// and may not start until `dep` has completed. Task metadata lives with
/// the executor/queue that owns the tasks; the graph only orders ids.
pub struct DependencyGraph {
    /// The underlying directed graph.
    graph: DiGraph<TaskId, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    node_index: HashMap<TaskId, NodeIndex>,
}

impl DependencyGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            node_index: HashMap::new(),
        }
    }

    /// Add a task node to the graph.
    ///
    /// Returns the existing index if the id is already present.
    pub fn add_node(&mut self, id: &TaskId) -> NodeIndex {
        if let Some(&index) = self.node_index.get(id) {
            return index;
        }
        let index = self.graph.add_node(id.clone());
        self.node_index.insert(id.clone(), index);
        index
    }

    /// Add a dependency: `task` depends on `dep` (edge `dep -> task`).
    ///
    /// Both nodes are created if absent. The edge is validated against
    /// cycles before it is kept.
    ///
    /// # Errors
    /// Returns a validation error if the edge would create a cycle
    /// (including self-dependencies).
    pub fn add_dependency(&mut self, task: &TaskId, dep: &TaskId) -> Result<()> {
        let task_index = self.add_node(task);
        let dep_index = self.add_node(dep);

        if self.graph.find_edge(dep_index, task_index).is_some() {
            return Ok(());
        }

        // Temporarily add the edge to check for cycles
        let edge = self.graph.add_edge(dep_index, task_index, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::Validation(format!(
                "dependency of {} on {} would create a cycle",
                task, dep
            )));
        }

        Ok(())
    }

    /// Remove the dependency of `task` on `dep`.
    ///
    /// Returns true if an edge was removed.
    pub fn remove_dependency(&mut self, task: &TaskId, dep: &TaskId) -> bool {
        let (Some(&task_index), Some(&dep_index)) =
            (self.node_index.get(task), self.node_index.get(dep))
        else {
            return false;
        };
        match self.graph.find_edge(dep_index, task_index) {
            Some(edge) => {
                self.graph.remove_edge(edge);
                true
            }
            None => false,
        }
    }

    /// Direct dependencies of a task (what it waits on).
    pub fn dependencies(&self, id: &TaskId) -> HashSet<TaskId> {
        self.neighbors(id, petgraph::Direction::Incoming)
    }

    /// Direct dependents of a task (what waits on it).
    pub fn dependents(&self, id: &TaskId) -> HashSet<TaskId> {
        self.neighbors(id, petgraph::Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, dir: petgraph::Direction) -> HashSet<TaskId> {
        let Some(&index) = self.node_index.get(id) else {
            return HashSet::new();
        };
        self.graph
            .neighbors_directed(index, dir)
            .filter_map(|n| self.graph.node_weight(n).cloned())
            .collect()
    }

    /// All direct and transitive dependents of a task.
    ///
    /// Used by the cancellation cascade: everything returned here can
    /// never become ready once `id` is cancelled.
    pub fn transitive_dependents(&self, id: &TaskId) -> HashSet<TaskId> {
        let mut seen = HashSet::new();
        let Some(&start) = self.node_index.get(id) else {
            return seen;
        };
        let mut queue = VecDeque::from([start]);
        while let Some(index) = queue.pop_front() {
            for next in self
                .graph
                .neighbors_directed(index, petgraph::Direction::Outgoing)
            {
                if let Some(task_id) = self.graph.node_weight(next) {
                    if seen.insert(task_id.clone()) {
                        queue.push_back(next);
                    }
                }
            }
        }
        seen
    }

    /// Full cycle check over the whole graph.
    pub fn has_cycle(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    /// Check if a task id is in the graph.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.node_index.contains_key(id)
    }

    /// Number of task nodes.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of dependency edges.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// All task ids known to the graph.
    pub fn all_nodes(&self) -> Vec<TaskId> {
        self.graph.node_weights().cloned().collect()
    }

    /// All tasks whose full dependency set is within the completed set.
    ///
    /// A task with no declared dependencies is ready immediately (the
    /// empty set is a subset of any set). Already-completed tasks are
    /// excluded; the executor filters running/failed/cancelled states
    /// and applies priority ordering.
    pub fn ready_tasks(&self, completed: &HashSet<TaskId>) -> Vec<TaskId> {
        self.graph
            .node_indices()
            .filter_map(|index| {
                let id = self.graph.node_weight(index)?;
                if completed.contains(id) {
                    return None;
                }
                let deps_satisfied = self
                    .graph
                    .neighbors_directed(index, petgraph::Direction::Incoming)
                    .all(|dep_index| {
                        self.graph
                            .node_weight(dep_index)
                            .map(|dep| completed.contains(dep))
                            .unwrap_or(false)
                    });
                deps_satisfied.then(|| id.clone())
            })
            .collect()
    }

    /// Task ids in topological order (dependencies before dependents).
    ///
    /// # Errors
    /// Returns an error if the graph contains a cycle (should never happen
    /// since `add_dependency` validates against cycles).
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let at = self
                .graph
                .node_weight(cycle.node_id())
                .map(|id| id.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Error::Validation(format!("cycle detected at task: {}", at))
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index).cloned())
            .collect())
    }

    /// Count of tasks not yet in the completed set.
    pub fn pending_count(&self, completed: &HashSet<TaskId>) -> usize {
        self.node_index
            .keys()
            .filter(|id| !completed.contains(*id))
            .count()
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.node_count())
            .field("dependencies", &self.edge_count())
            .finish()
    }
}
