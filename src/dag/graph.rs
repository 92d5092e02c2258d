// src/dag/graph.rs

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use tracing::{debug, warn};

use crate::dag::validation::{DagValidationError, ValidationReport};
use crate::errors::{OrchestratorError, Result};

/// Node colouring for the iterative DFS used in cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// One frame of the explicit DFS recursion stack.
struct Frame {
    node: NodeIndex,
    children: Vec<NodeIndex>,
    next: usize,
}

/// Directed graph of named tasks.
///
/// Edge direction is `dependency -> dependent`: for a task `B` declared with
/// `depends_on = ["A"]` the graph holds `A -> B`.
///
/// Declared dependencies are kept separately from the petgraph edges so that
/// tasks can be added in any order and dangling names are still reported by
/// [`validate`](Self::validate). Self-dependencies are never turned into
/// edges; they are reported on their own.
#[derive(Debug, Clone, Default)]
pub struct WorkflowDag {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
    declared: BTreeMap<String, Vec<String>>,
}

impl WorkflowDag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from `(task, dependencies)` pairs.
    pub fn from_dependencies<I, S, D>(tasks: I) -> Self
    where
        I: IntoIterator<Item = (S, D)>,
        S: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        let mut dag = Self::new();
        for (name, deps) in tasks {
            dag.add_task(name, deps);
        }
        dag
    }

    /// Register a task node together with its declared dependencies.
    ///
    /// Re-adding an existing name replaces its declared dependencies.
    pub fn add_task<S, D>(&mut self, name: S, dependencies: D)
    where
        S: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        let name = name.into();
        let deps: Vec<String> = dependencies.into_iter().map(Into::into).collect();

        let node = match self.index.get(&name) {
            Some(&node) => {
                warn!(task = %name, "task re-added to DAG; replacing its dependencies");
                let mut incoming: Vec<_> = self
                    .graph
                    .edges_directed(node, Direction::Incoming)
                    .map(|e| e.id())
                    .collect();
                // remove_edge swaps the last edge into the hole; go high to low.
                incoming.sort_by(|a, b| b.cmp(a));
                for edge in incoming {
                    self.graph.remove_edge(edge);
                }
                node
            }
            None => {
                let node = self.graph.add_node(name.clone());
                self.index.insert(name.clone(), node);
                node
            }
        };

        // Edges from already-known dependencies to this node.
        for dep in &deps {
            if dep == &name {
                continue;
            }
            if let Some(&dep_node) = self.index.get(dep) {
                self.graph.update_edge(dep_node, node, ());
            }
        }

        // Edges from this node to earlier tasks that declared it as a dependency.
        for (other, other_deps) in &self.declared {
            if other != &name && other_deps.iter().any(|d| d == &name) {
                if let Some(&other_node) = self.index.get(other) {
                    self.graph.update_edge(node, other_node, ());
                }
            }
        }

        debug!(task = %name, deps = ?deps, "task added to DAG");
        self.declared.insert(name, deps);
    }

    /// Add a `task depends on depends_on` edge. Both endpoints must exist.
    pub fn add_dependency(&mut self, task: &str, depends_on: &str) -> Result<()> {
        let task_node = *self
            .index
            .get(task)
            .ok_or_else(|| OrchestratorError::UnknownTask(task.to_string()))?;
        let dep_node = *self
            .index
            .get(depends_on)
            .ok_or_else(|| OrchestratorError::UnknownTask(depends_on.to_string()))?;

        let declared = self.declared.entry(task.to_string()).or_default();
        if !declared.iter().any(|d| d == depends_on) {
            declared.push(depends_on.to_string());
        }

        if task_node != dep_node {
            self.graph.update_edge(dep_node, task_node, ());
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// All task names, sorted.
    pub fn tasks(&self) -> impl Iterator<Item = &str> {
        self.declared.keys().map(|s| s.as_str())
    }

    /// Declared direct dependencies of a task (may include unknown names).
    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.declared
            .get(name)
            .map(|d| d.as_slice())
            .unwrap_or(&[])
    }

    /// Tasks with no declared dependencies.
    pub fn roots(&self) -> Vec<String> {
        self.declared
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Check the graph for cycles, dangling references and self-dependencies,
    /// in that order.
    pub fn validate(&self) -> ValidationReport {
        let mut errors = self.find_cycles();

        for (task, deps) in &self.declared {
            for dep in deps {
                if dep != task && !self.index.contains_key(dep) {
                    errors.push(DagValidationError::DanglingDependency {
                        task: task.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        for (task, deps) in &self.declared {
            if deps.iter().any(|d| d == task) {
                errors.push(DagValidationError::SelfDependency { task: task.clone() });
            }
        }

        ValidationReport::from_errors(errors)
    }

    /// Leveled topological order. Every task in level `n` only depends on
    /// tasks in levels `< n`; names inside a level are sorted.
    pub fn execution_order(&self) -> Result<Vec<Vec<String>>> {
        self.validate().into_result()?;

        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| {
                let deg = self.graph.neighbors_directed(n, Direction::Incoming).count();
                (n, deg)
            })
            .collect();

        let mut current: Vec<NodeIndex> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(n, _)| *n)
            .collect();

        let mut levels = Vec::new();
        let mut processed = 0usize;

        while !current.is_empty() {
            processed += current.len();
            let mut next = Vec::new();

            for node in &current {
                for dependent in self.graph.neighbors_directed(*node, Direction::Outgoing) {
                    if let Some(deg) = in_degree.get_mut(&dependent) {
                        *deg -= 1;
                        if *deg == 0 {
                            next.push(dependent);
                        }
                    }
                }
            }

            let mut level: Vec<String> = current.iter().map(|n| self.graph[*n].clone()).collect();
            level.sort();
            levels.push(level);
            current = next;
        }

        let total = self.graph.node_count();
        if processed < total {
            return Err(OrchestratorError::Validation(vec![
                DagValidationError::ResidualCycle { processed, total },
            ]));
        }

        Ok(levels)
    }

    /// Transitive dependencies of `name`.
    pub fn task_dependencies(&self, name: &str) -> Result<BTreeSet<String>> {
        self.closure(name, Direction::Incoming)
    }

    /// Transitive dependents of `name`.
    pub fn dependent_tasks(&self, name: &str) -> Result<BTreeSet<String>> {
        self.closure(name, Direction::Outgoing)
    }

    fn closure(&self, name: &str, direction: Direction) -> Result<BTreeSet<String>> {
        let start = *self
            .index
            .get(name)
            .ok_or_else(|| OrchestratorError::UnknownTask(name.to_string()))?;

        let mut seen = BTreeSet::new();
        let mut stack = vec![start];

        while let Some(node) = stack.pop() {
            for next in self.graph.neighbors_directed(node, direction) {
                if seen.insert(self.graph[next].clone()) {
                    stack.push(next);
                }
            }
        }

        seen.remove(name);
        Ok(seen)
    }

    fn sorted_children(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut children: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect();
        children.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
        children.dedup();
        children
    }

    /// Depth-first traversal with an explicit recursion stack. A child found
    /// while still on the stack closes a cycle; the stack slice from that
    /// child upward is the cycle path.
    fn find_cycles(&self) -> Vec<DagValidationError> {
        let mut marks: HashMap<NodeIndex, Mark> = self
            .graph
            .node_indices()
            .map(|n| (n, Mark::Unvisited))
            .collect();
        let mut cycles = Vec::new();

        let mut starts: Vec<NodeIndex> = self.graph.node_indices().collect();
        starts.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));

        for start in starts {
            if marks.get(&start) != Some(&Mark::Unvisited) {
                continue;
            }

            marks.insert(start, Mark::OnStack);
            let mut stack = vec![Frame {
                node: start,
                children: self.sorted_children(start),
                next: 0,
            }];

            while let Some(frame) = stack.last_mut() {
                let step = if frame.next < frame.children.len() {
                    let child = frame.children[frame.next];
                    frame.next += 1;
                    Some(child)
                } else {
                    None
                };

                match step {
                    Some(child) => match marks.get(&child).copied().unwrap_or(Mark::Done) {
                        Mark::Unvisited => {
                            marks.insert(child, Mark::OnStack);
                            stack.push(Frame {
                                node: child,
                                children: self.sorted_children(child),
                                next: 0,
                            });
                        }
                        Mark::OnStack => {
                            let pos = stack.iter().position(|f| f.node == child).unwrap_or(0);
                            let mut path: Vec<String> = stack[pos..]
                                .iter()
                                .map(|f| self.graph[f.node].clone())
                                .collect();
                            path.push(self.graph[child].clone());
                            debug!(path = ?path, "cycle found during DAG validation");
                            cycles.push(DagValidationError::Cycle { path });
                        }
                        Mark::Done => {}
                    },
                    None => {
                        let node = frame.node;
                        marks.insert(node, Mark::Done);
                        stack.pop();
                    }
                }
            }
        }

        cycles
    }
}
