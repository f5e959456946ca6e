//! Dependency graph with an incremental topological execution engine.
//!
//! The graph maps each task to the set of tasks it depends on. After
//! [`DependencyGraph::build`], callers repeatedly take the ready set and report
//! which tasks are done; dependents become ready once every prerequisite is
//! done.
//!
//! "Done" means finished, not succeeded. A failed task must still be marked
//! completed so that its dependents are not blocked forever.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graphmap::DiGraphMap;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::{GraphError, GraphResult};
use crate::parallel::validator::GraphValidator;
use crate::task::{TaskDefinition, TaskId};

/// Graph shared between the orchestration loop and the dynamic manager.
/// The mutex guards every read-modify-write sequence on the graph.
pub type SharedGraph = Arc<Mutex<DependencyGraph>>;

/// Point-in-time graph counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    /// Tasks added through `add_task`.
    pub total_tasks: usize,
    /// Number of dependency edges.
    pub total_dependencies: usize,
    pub is_built: bool,
    pub is_active: bool,
    /// Tasks marked completed so far.
    pub completed: usize,
}

/// Kahn's algorithm, one readiness event at a time.
///
/// Only nodes that are not yet done are tracked. Nodes already completed are
/// treated as satisfied prerequisites, and nodes already handed out stay
/// handed out, so a rebuilt engine never surfaces either again.
#[derive(Debug, Clone, Default, PartialEq)]
struct TopologicalEngine {
    /// Unmet prerequisite count for nodes not yet ready.
    waiting_on: HashMap<TaskId, usize>,
    /// Reverse edges restricted to remaining nodes.
    dependents: HashMap<TaskId, Vec<TaskId>>,
    /// Ready but not yet handed out.
    ready: BTreeSet<TaskId>,
    /// Handed out and not yet done.
    handed_out: HashSet<TaskId>,
    /// Every node not yet done.
    remaining: HashSet<TaskId>,
}

impl TopologicalEngine {
    fn new(
        edges: &BTreeMap<TaskId, BTreeSet<TaskId>>,
        completed: &BTreeSet<TaskId>,
        dispatched: &BTreeSet<TaskId>,
    ) -> GraphResult<Self> {
        check_acyclic(edges)?;

        let mut engine = Self::default();
        let nodes = all_nodes(edges);
        let no_deps = BTreeSet::new();

        for node in nodes.iter().filter(|node| !completed.contains(*node)) {
            engine.remaining.insert(node.clone());

            let deps = edges.get(node).unwrap_or(&no_deps);
            let mut unmet = 0;
            for dep in deps.iter().filter(|dep| !completed.contains(*dep)) {
                engine
                    .dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(node.clone());
                unmet += 1;
            }

            if dispatched.contains(node) {
                engine.handed_out.insert(node.clone());
            } else if unmet == 0 {
                engine.ready.insert(node.clone());
            } else {
                engine.waiting_on.insert(node.clone(), unmet);
            }
        }

        Ok(engine)
    }

    fn take_ready(&mut self) -> Vec<TaskId> {
        let ready: Vec<TaskId> = std::mem::take(&mut self.ready).into_iter().collect();
        self.handed_out.extend(ready.iter().cloned());
        ready
    }

    fn done(&mut self, id: &str) {
        self.handed_out.remove(id);
        self.remaining.remove(id);

        let Some(dependents) = self.dependents.remove(id) else {
            return;
        };
        for dependent in dependents {
            if let Some(count) = self.waiting_on.get_mut(&dependent) {
                *count -= 1;
                if *count == 0 {
                    self.waiting_on.remove(&dependent);
                    self.ready.insert(dependent);
                }
            }
        }
    }

    fn is_active(&self) -> bool {
        !self.remaining.is_empty()
    }
}

/// Fails with `CycleDetected` naming the tasks on the offending cycle.
fn check_acyclic(edges: &BTreeMap<TaskId, BTreeSet<TaskId>>) -> GraphResult<()> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for (task, deps) in edges {
        graph.add_node(task.as_str());
        for dep in deps {
            graph.add_edge(dep.as_str(), task.as_str(), ());
        }
    }

    let Err(cycle) = toposort(&graph, None) else {
        return Ok(());
    };

    let node = cycle.node_id();
    let mut members: Vec<&str> = tarjan_scc(&graph)
        .into_iter()
        .find(|component| component.contains(&node))
        .unwrap_or_else(|| vec![node]);
    members.sort_unstable();

    Err(GraphError::CycleDetected(format!(
        "task '{}' is part of a cycle involving [{}]",
        node,
        members.join(", ")
    )))
}

fn all_nodes(edges: &BTreeMap<TaskId, BTreeSet<TaskId>>) -> BTreeSet<TaskId> {
    edges
        .iter()
        .flat_map(|(task, deps)| std::iter::once(task).chain(deps.iter()))
        .cloned()
        .collect()
}

/// Directed dependency graph over task ids.
///
/// Dependencies may name ids that were never added as tasks; those are
/// treated as independent nodes with no prerequisites of their own.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyGraph {
    edges: BTreeMap<TaskId, BTreeSet<TaskId>>,
    /// Ids marked done. Survives rebuilds.
    completed: BTreeSet<TaskId>,
    /// Ids handed out as ready and not yet done. Survives rebuilds.
    dispatched: BTreeSet<TaskId>,
    built: bool,
    engine: Option<TopologicalEngine>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unbuilt graph from a task mapping.
    pub fn from_tasks<'a, I>(tasks: I) -> Self
    where
        I: IntoIterator<Item = (&'a TaskId, &'a TaskDefinition)>,
    {
        let mut graph = Self::new();
        for (id, definition) in tasks {
            graph.add_task(id.clone(), definition.dependencies.iter().cloned());
        }
        graph
    }

    /// Insert or replace a task and its dependencies.
    ///
    /// Calling this after `build()` invalidates the built state; ready and
    /// completion queries are refused until `rebuild()` is called.
    pub fn add_task<I, S>(&mut self, id: impl Into<TaskId>, dependencies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        let id = id.into();
        if self.built {
            tracing::warn!(
                task_id = %id,
                "Adding task to a built graph; rebuild() is required before further scheduling"
            );
            self.built = false;
            self.engine = None;
        }
        let deps: BTreeSet<TaskId> = dependencies.into_iter().map(Into::into).collect();
        tracing::debug!(task_id = %id, dependencies = deps.len(), "Task added to graph");
        self.edges.insert(id, deps);
    }

    /// Construct the topological engine over the current edge set.
    ///
    /// Fails with [`GraphError::CycleDetected`] if the edges contain a cycle,
    /// leaving the graph unbuilt.
    pub fn build(&mut self) -> GraphResult<()> {
        match TopologicalEngine::new(&self.edges, &self.completed, &self.dispatched) {
            Ok(engine) => {
                tracing::debug!(
                    tasks = self.edges.len(),
                    remaining = engine.remaining.len(),
                    "Dependency graph built"
                );
                self.engine = Some(engine);
                self.built = true;
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to build dependency graph");
                self.engine = None;
                self.built = false;
                Err(err)
            }
        }
    }

    /// Rebuild after the edge set changed. Completions are preserved.
    pub fn rebuild(&mut self) -> GraphResult<()> {
        self.build()
    }

    /// Tasks whose prerequisites are all done and that have not been handed
    /// out yet. Each task is returned once; calling again without completing
    /// anything returns an empty list. Empty before `build()`.
    pub fn get_ready_tasks(&mut self) -> Vec<TaskId> {
        let Some(engine) = self.engine.as_mut().filter(|_| self.built) else {
            tracing::warn!("get_ready_tasks called on a graph that is not built");
            return Vec::new();
        };
        let ready = engine.take_ready();
        self.dispatched.extend(ready.iter().cloned());
        ready
    }

    /// Mark tasks as done, unblocking their dependents.
    ///
    /// Success and failure are not distinguished here: a failed task is done
    /// too, so downstream work is never starved by an upstream failure.
    ///
    /// The whole call is rejected if any id is unknown, was never handed out,
    /// or is already completed. An empty list is a no-op.
    pub fn mark_completed<I, S>(&mut self, ids: I) -> GraphResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let Some(engine) = self.engine.as_mut().filter(|_| self.built) else {
            return Err(GraphError::NotBuilt);
        };

        let ids: Vec<S> = ids.into_iter().collect();
        if ids.is_empty() {
            tracing::warn!("mark_completed called with no task ids");
            return Ok(());
        }

        let mut seen = HashSet::new();
        for id in &ids {
            let id = id.as_ref();
            if self.completed.contains(id) || !seen.insert(id) {
                return Err(GraphError::AlreadyCompleted(id.to_string()));
            }
            if !engine.remaining.contains(id) {
                return Err(GraphError::UnknownTask(id.to_string()));
            }
            if !engine.handed_out.contains(id) {
                return Err(GraphError::NotReady(id.to_string()));
            }
        }

        for id in &ids {
            let id = id.as_ref();
            engine.done(id);
            self.dispatched.remove(id);
            self.completed.insert(id.to_string());
        }
        tracing::debug!(count = ids.len(), "Tasks marked completed");
        Ok(())
    }

    /// True iff built and some task is not done yet.
    pub fn is_active(&self) -> bool {
        self.built && self.engine.as_ref().is_some_and(TopologicalEngine::is_active)
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Unbuilt copy carrying only the edge map.
    pub fn copy(&self) -> Self {
        Self {
            edges: self.edges.clone(),
            ..Self::default()
        }
    }

    /// Record an id finished outside this graph as a satisfied prerequisite.
    ///
    /// Ids that are already nodes are left alone and `false` is returned.
    /// Takes effect on the next `build()`.
    pub fn mark_satisfied(&mut self, id: impl Into<TaskId>) -> bool {
        let id = id.into();
        if self.has_node(&id) {
            return false;
        }
        self.completed.insert(id);
        self.built = false;
        self.engine = None;
        true
    }

    /// Whether `id` was added as a task.
    pub fn contains(&self, id: &str) -> bool {
        self.edges.contains_key(id)
    }

    /// Whether `id` is a task, a dependency of one, or already completed.
    pub fn has_node(&self, id: &str) -> bool {
        self.edges.contains_key(id)
            || self.completed.contains(id)
            || self.edges.values().any(|deps| deps.contains(id))
    }

    /// Number of distinct ids, dependency-only nodes included.
    pub fn node_count(&self) -> usize {
        all_nodes(&self.edges).len()
    }

    pub fn is_completed(&self, id: &str) -> bool {
        self.completed.contains(id)
    }

    pub fn dependencies(&self, id: &str) -> Option<&BTreeSet<TaskId>> {
        self.edges.get(id)
    }

    pub fn edges(&self) -> &BTreeMap<TaskId, BTreeSet<TaskId>> {
        &self.edges
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.edges.keys()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn get_stats(&self) -> GraphStats {
        GraphStats {
            total_tasks: self.edges.len(),
            total_dependencies: self.edges.values().map(BTreeSet::len).sum(),
            is_built: self.built,
            is_active: self.is_active(),
            completed: self.completed.len(),
        }
    }
}

/// Build a graph from a task mapping and run the diagnostic validator on it.
///
/// Cycles fail the build. Missing references and orphans are only logged.
pub fn build_and_validate<'a, I>(tasks: I) -> GraphResult<DependencyGraph>
where
    I: IntoIterator<Item = (&'a TaskId, &'a TaskDefinition)>,
{
    let mut graph = DependencyGraph::from_tasks(tasks);
    graph.build()?;

    let report = GraphValidator::validate(&graph);
    for warning in &report.warnings {
        tracing::warn!(warning = %warning, "Dependency graph validation warning");
    }
    tracing::info!(
        tasks = graph.len(),
        dependencies = graph.get_stats().total_dependencies,
        "Dependency graph built and validated"
    );
    Ok(graph)
}
