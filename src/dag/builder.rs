//! DAG builder for constructing phased dependency graphs from tasks.
//!
//! The builder takes a list of tasks with their dependencies, validates them,
//! and layers them into phases: phase k holds every task whose dependencies
//! all sit in phases 0..k. Output is deterministic for identical input since
//! tasks are indexed in ascending id order.

use crate::errors::GraphError;
use crate::task::Task;
use std::collections::{HashMap, HashSet};

/// Index into the task list (ascending id order).
pub type TaskIndex = usize;

/// A validated, acyclic graph of tasks with its phase layering.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    /// Tasks sorted by id
    tasks: Vec<Task>,
    /// Map from task id to index
    index_map: HashMap<String, TaskIndex>,
    /// Forward edges: index -> tasks that depend on it
    forward_edges: Vec<Vec<TaskIndex>>,
    /// Reverse edges: index -> tasks it depends on
    reverse_edges: Vec<Vec<TaskIndex>>,
    /// Phase layering, each layer sorted by id
    phases: Vec<Vec<TaskIndex>>,
    /// Phase position of each task
    phase_of: Vec<usize>,
}

impl TaskGraph {
    /// Get the number of tasks in the graph.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Get a task by its index.
    pub fn get_task(&self, index: TaskIndex) -> Option<&Task> {
        self.tasks.get(index)
    }

    /// Get a task by its id.
    pub fn get_task_by_id(&self, id: &str) -> Option<&Task> {
        self.index_map.get(id).and_then(|&i| self.tasks.get(i))
    }

    /// Get the index for a task id.
    pub fn get_index(&self, id: &str) -> Option<TaskIndex> {
        self.index_map.get(id).copied()
    }

    /// Get all tasks in ascending id order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Get tasks that depend on the given task.
    pub fn dependents(&self, index: TaskIndex) -> &[TaskIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Get tasks that the given task depends on.
    pub fn dependencies(&self, index: TaskIndex) -> &[TaskIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Number of phases.
    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }

    /// Task indices of each phase, in phase order.
    pub fn phases(&self) -> &[Vec<TaskIndex>] {
        &self.phases
    }

    /// Phase position of a task.
    pub fn phase_of(&self, index: TaskIndex) -> Option<usize> {
        self.phase_of.get(index).copied()
    }

    /// Phase layering expressed as task ids.
    pub fn phase_ids(&self) -> Vec<Vec<String>> {
        self.phases
            .iter()
            .map(|layer| layer.iter().map(|&i| self.tasks[i].id.clone()).collect())
            .collect()
    }

    /// Check if all dependencies of a task are in the given set.
    pub fn dependencies_satisfied(
        &self,
        index: TaskIndex,
        succeeded: &HashSet<TaskIndex>,
    ) -> bool {
        self.dependencies(index)
            .iter()
            .all(|dep| succeeded.contains(dep))
    }

    /// Every task reachable downstream of the given task.
    pub fn transitive_dependents(&self, index: TaskIndex) -> Vec<TaskIndex> {
        let mut seen = HashSet::new();
        let mut stack: Vec<TaskIndex> = self.dependents(index).to_vec();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend_from_slice(self.dependents(next));
            }
        }
        let mut out: Vec<TaskIndex> = seen.into_iter().collect();
        out.sort_unstable();
        out
    }
}

/// Builder for constructing task graphs.
pub struct GraphBuilder {
    tasks: Vec<Task>,
}

impl GraphBuilder {
    /// Create a new builder with the given tasks.
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    /// Build the task graph.
    ///
    /// This validates the graph structure:
    /// - Task ids must be non-empty and unique
    /// - All dependencies must reference existing tasks
    /// - No cycles are allowed
    pub fn build(mut self) -> Result<TaskGraph, GraphError> {
        self.tasks.sort_by(|a, b| a.id.cmp(&b.id));

        let mut index_map = HashMap::with_capacity(self.tasks.len());
        for (i, task) in self.tasks.iter().enumerate() {
            if task.id.is_empty() {
                return Err(GraphError::EmptyTaskId);
            }
            if index_map.insert(task.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateTask(task.id.clone()));
            }
        }

        let mut forward_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); self.tasks.len()];
        let mut reverse_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); self.tasks.len()];

        for (to_idx, task) in self.tasks.iter().enumerate() {
            for dep in &task.depends_on {
                let from_idx =
                    *index_map
                        .get(dep)
                        .ok_or_else(|| GraphError::UnknownDependency {
                            task: task.id.clone(),
                            dependency: dep.clone(),
                        })?;

                // A repeated dependency is one edge
                if reverse_edges[to_idx].contains(&from_idx) {
                    continue;
                }
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        for edges in forward_edges.iter_mut().chain(reverse_edges.iter_mut()) {
            edges.sort_unstable();
        }

        let mut graph = TaskGraph {
            tasks: self.tasks,
            index_map,
            forward_edges,
            reverse_edges,
            phases: Vec::new(),
            phase_of: Vec::new(),
        };

        let (phases, phase_of) = Self::layer(&graph)?;
        graph.phases = phases;
        graph.phase_of = phase_of;

        Ok(graph)
    }

    /// Layer the graph with Kahn's algorithm, one whole frontier per phase.
    ///
    /// Fails with `CycleDetected` if some tasks never reach in-degree zero.
    fn layer(graph: &TaskGraph) -> Result<(Vec<Vec<TaskIndex>>, Vec<usize>), GraphError> {
        let mut in_degree: Vec<usize> = graph.reverse_edges.iter().map(|deps| deps.len()).collect();
        let mut phase_of = vec![usize::MAX; graph.len()];
        let mut phases: Vec<Vec<TaskIndex>> = Vec::new();

        let mut frontier: Vec<TaskIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;

        while !frontier.is_empty() {
            frontier.sort_unstable();
            let mut next = Vec::new();

            for &node in &frontier {
                phase_of[node] = phases.len();
                processed += 1;
                for &dependent in graph.dependents(node) {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }

            phases.push(std::mem::take(&mut frontier));
            frontier = next;
        }

        if processed != graph.len() {
            return Err(GraphError::CycleDetected {
                tasks: Self::cycle_members(graph, &in_degree),
            });
        }

        Ok((phases, phase_of))
    }

    /// Narrow the unprocessed remainder to tasks on or between cycles.
    ///
    /// Tasks that merely sit downstream of a cycle are peeled off by
    /// repeatedly dropping remaining nodes with no remaining dependents.
    fn cycle_members(graph: &TaskGraph, in_degree: &[usize]) -> Vec<String> {
        let mut remaining: HashSet<TaskIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg > 0)
            .map(|(i, _)| i)
            .collect();

        loop {
            let sinks: Vec<TaskIndex> = remaining
                .iter()
                .copied()
                .filter(|&i| !graph.dependents(i).iter().any(|d| remaining.contains(d)))
                .collect();
            if sinks.is_empty() {
                break;
            }
            for sink in sinks {
                remaining.remove(&sink);
            }
        }

        let mut ids: Vec<String> = remaining
            .into_iter()
            .filter_map(|i| graph.get_task(i).map(|t| t.id.clone()))
            .collect();
        ids.sort();
        ids
    }
}
