//! Task dependency graph.
//!
//! Built on demand from the flat `tasks` list of a [`GraphState`]. The
//! distill node uses it to reject cyclic plans and the implement node uses
//! it to pick the next task whose dependencies are complete.
//!
//! [`GraphState`]: super::GraphState

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use super::state::TaskRecord;
use super::types::TaskStatus;
use crate::error::{Error, Result};

/// Borrowed view of the task list as a directed graph.
///
/// An edge `a -> b` means `a` must complete before `b` can start.
pub struct TaskGraph<'a> {
    graph: DiGraph<&'a TaskRecord, ()>,
    index: HashMap<&'a str, NodeIndex>,
}

impl<'a> TaskGraph<'a> {
    /// Build the graph.
    ///
    /// # Errors
    /// Returns an error if a task depends on an unknown task id.
    pub fn build(tasks: &'a [TaskRecord]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for task in tasks {
            let node = graph.add_node(task);
            index.insert(task.task_id.as_str(), node);
        }

        for task in tasks {
            let to = index[task.task_id.as_str()];
            for dep in &task.depends_on {
                let from = index.get(dep.as_str()).ok_or_else(|| {
                    Error::Validation(format!(
                        "Task {} depends on unknown task {}",
                        task.task_id, dep
                    ))
                })?;
                graph.add_edge(*from, to, ());
            }
        }

        Ok(Self { graph, index })
    }

    /// Tasks in an order where each comes after its dependencies.
    ///
    /// # Errors
    /// Returns an error naming a task on the cycle if the plan is cyclic.
    pub fn topological_order(&self) -> Result<Vec<&'a TaskRecord>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let name = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.task_id.as_str())
                .unwrap_or("unknown");
            Error::Validation(format!("Cycle detected at task: {}", name))
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|i| self.graph.node_weight(i).copied())
            .collect())
    }

    /// First open task (pending or resumed), in list order, whose
    /// dependencies are all completed.
    ///
    /// # Errors
    /// Returns an error if the plan is cyclic.
    pub fn next_ready(&self) -> Result<Option<&'a TaskRecord>> {
        self.topological_order()?;
        Ok(self
            .graph
            .node_weights()
            .copied()
            .find(|task| {
                matches!(task.status, TaskStatus::Pending | TaskStatus::Resumed)
                    && self.dependencies_complete(&task.task_id)
            }))
    }

    fn dependencies_complete(&self, task_id: &str) -> bool {
        let Some(&node) = self.index.get(task_id) else {
            return false;
        };
        self.graph
            .neighbors_directed(node, petgraph::Direction::Incoming)
            .all(|dep| {
                self.graph
                    .node_weight(dep)
                    .map(|t| t.status == TaskStatus::Completed)
                    .unwrap_or(false)
            })
    }
}
