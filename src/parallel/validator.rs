//! Diagnostic validation and rendering of dependency graphs.
//!
//! Independent of the build-time cycle check: the validator walks the whole
//! node set, reports every cycle as an explicit path, and flags missing
//! references and orphaned tasks as warnings.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fmt::Write as _;
use std::str::FromStr;

use serde::Serialize;

use crate::error::GraphError;
use crate::parallel::dependency::DependencyGraph;
use crate::task::TaskId;

/// Outcome of a validation pass.
///
/// Only cycles make a graph invalid. Missing references and orphans are
/// reported as warnings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Each cycle is a closed walk: first and last entries are equal.
    pub cycles: Vec<Vec<TaskId>>,
    /// Ids referenced as dependencies but never added as tasks.
    pub missing_refs: BTreeSet<TaskId>,
    /// Tasks not reachable backwards from any terminal task.
    pub orphaned_tasks: BTreeSet<TaskId>,
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            cycles: Vec::new(),
            missing_refs: BTreeSet::new(),
            orphaned_tasks: BTreeSet::new(),
        }
    }
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error. Marks the report invalid.
    pub fn add_error(&mut self, message: impl Into<String>) {
        self.is_valid = false;
        self.errors.push(message.into());
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Human-readable multi-line summary.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let status = if self.is_valid { "PASS" } else { "FAIL" };
        let _ = writeln!(out, "Validation Status: {}", status);
        let _ = writeln!(out, "Errors: {}", self.errors.len());
        let _ = writeln!(out, "Warnings: {}", self.warnings.len());
        let _ = writeln!(out, "Cycles: {}", self.cycles.len());
        let _ = writeln!(out, "Missing References: {}", self.missing_refs.len());
        let _ = writeln!(out, "Orphaned Tasks: {}", self.orphaned_tasks.len());

        if !self.errors.is_empty() {
            out.push_str("\nErrors:\n");
            for error in &self.errors {
                let _ = writeln!(out, "  - {}", error);
            }
        }
        if !self.warnings.is_empty() {
            out.push_str("\nWarnings:\n");
            for warning in &self.warnings {
                let _ = writeln!(out, "  - {}", warning);
            }
        }
        out
    }
}

/// Output format for [`GraphValidator::visualize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisualizationFormat {
    /// Mermaid flow chart.
    Mermaid,
    /// Graphviz node/edge list.
    Dot,
}

impl FromStr for VisualizationFormat {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mermaid" => Ok(Self::Mermaid),
            "dot" | "graphviz" => Ok(Self::Dot),
            other => Err(GraphError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Stateless graph diagnostics.
pub struct GraphValidator;

impl GraphValidator {
    /// Run every check over the graph's edges.
    pub fn validate(graph: &DependencyGraph) -> ValidationReport {
        Self::validate_edges(graph.edges())
    }

    /// Same as [`validate`](Self::validate) on a raw edge map.
    pub fn validate_edges(edges: &BTreeMap<TaskId, BTreeSet<TaskId>>) -> ValidationReport {
        let mut report = ValidationReport::new();

        let cycles = find_cycles(edges);
        for cycle in &cycles {
            report.add_error(format!("Cycle detected: {}", cycle.join(" -> ")));
        }
        report.cycles = cycles;

        report.missing_refs = find_missing_refs(edges);
        for missing in &report.missing_refs.clone() {
            report.add_warning(format!("Missing dependency reference: {}", missing));
        }

        // Reachability from terminals is meaningless once cycles exist.
        if report.cycles.is_empty() {
            report.orphaned_tasks = find_orphans(edges);
            for orphan in &report.orphaned_tasks.clone() {
                report.add_warning(format!(
                    "Orphaned task (unreachable from any terminal task): {}",
                    orphan
                ));
            }
        }

        tracing::debug!(
            valid = report.is_valid,
            cycles = report.cycles.len(),
            missing = report.missing_refs.len(),
            orphaned = report.orphaned_tasks.len(),
            "Dependency graph validated"
        );
        report
    }

    /// Render the graph for debugging. Output is sorted and deterministic.
    pub fn visualize(graph: &DependencyGraph, format: VisualizationFormat) -> String {
        match format {
            VisualizationFormat::Mermaid => render_mermaid(graph.edges()),
            VisualizationFormat::Dot => render_dot(graph.edges()),
        }
    }

    /// Render using a format name such as `"mermaid"` or `"dot"`.
    pub fn visualize_as(graph: &DependencyGraph, format: &str) -> Result<String, GraphError> {
        Ok(Self::visualize(graph, format.parse()?))
    }
}

struct CycleSearch<'a> {
    edges: &'a BTreeMap<TaskId, BTreeSet<TaskId>>,
    visited: HashSet<&'a str>,
    on_stack: HashSet<&'a str>,
    path: Vec<&'a str>,
    cycles: Vec<Vec<TaskId>>,
}

impl<'a> CycleSearch<'a> {
    fn visit(&mut self, node: &'a str) {
        self.visited.insert(node);
        self.on_stack.insert(node);
        self.path.push(node);

        if let Some(deps) = self.edges.get(node) {
            for dep in deps {
                let dep = dep.as_str();
                if !self.visited.contains(dep) {
                    self.visit(dep);
                } else if self.on_stack.contains(dep) {
                    if let Some(start) = self.path.iter().position(|n| *n == dep) {
                        let mut cycle: Vec<TaskId> =
                            self.path[start..].iter().map(|n| n.to_string()).collect();
                        cycle.push(dep.to_string());
                        self.cycles.push(cycle);
                    }
                }
            }
        }

        self.path.pop();
        self.on_stack.remove(node);
    }
}

/// Depth-first search over every node, following task -> dependency edges.
fn find_cycles(edges: &BTreeMap<TaskId, BTreeSet<TaskId>>) -> Vec<Vec<TaskId>> {
    let nodes: BTreeSet<&str> = edges
        .iter()
        .flat_map(|(task, deps)| std::iter::once(task).chain(deps.iter()))
        .map(String::as_str)
        .collect();

    let mut search = CycleSearch {
        edges,
        visited: HashSet::new(),
        on_stack: HashSet::new(),
        path: Vec::new(),
        cycles: Vec::new(),
    };
    for node in nodes {
        if !search.visited.contains(node) {
            search.visit(node);
        }
    }
    search.cycles
}

fn find_missing_refs(edges: &BTreeMap<TaskId, BTreeSet<TaskId>>) -> BTreeSet<TaskId> {
    edges
        .values()
        .flatten()
        .filter(|dep| !edges.contains_key(*dep))
        .cloned()
        .collect()
}

/// Tasks with no dependents are terminal. Walk backwards from terminals over
/// the dependency relation; any task never reached is orphaned.
fn find_orphans(edges: &BTreeMap<TaskId, BTreeSet<TaskId>>) -> BTreeSet<TaskId> {
    let has_dependents: HashSet<&str> = edges.values().flatten().map(String::as_str).collect();

    let mut queue: VecDeque<&str> = edges
        .keys()
        .map(String::as_str)
        .filter(|task| !has_dependents.contains(task))
        .collect();
    let mut reachable: HashSet<&str> = HashSet::new();

    while let Some(node) = queue.pop_front() {
        if !reachable.insert(node) {
            continue;
        }
        if let Some(deps) = edges.get(node) {
            queue.extend(deps.iter().map(String::as_str));
        }
    }

    edges
        .keys()
        .filter(|task| !reachable.contains(task.as_str()))
        .cloned()
        .collect()
}

fn mermaid_id(id: &str) -> String {
    id.replace(['-', '.', ' '], "_")
}

fn render_mermaid(edges: &BTreeMap<TaskId, BTreeSet<TaskId>>) -> String {
    let mut out = String::from("graph TD\n");
    if edges.is_empty() {
        out.push_str("    Empty[Empty Graph]\n");
        return out;
    }

    let nodes: BTreeSet<&TaskId> = edges
        .iter()
        .flat_map(|(task, deps)| std::iter::once(task).chain(deps.iter()))
        .collect();
    for node in nodes {
        let _ = writeln!(out, "    {}[\"{}\"]", mermaid_id(node), node);
    }
    for (task, deps) in edges {
        for dep in deps {
            let _ = writeln!(out, "    {} --> {}", mermaid_id(dep), mermaid_id(task));
        }
    }
    out
}

fn render_dot(edges: &BTreeMap<TaskId, BTreeSet<TaskId>>) -> String {
    let mut out = String::from("digraph DependencyGraph {\n");
    out.push_str("    rankdir=LR;\n");
    out.push_str("    node [shape=box, style=rounded];\n\n");

    if edges.is_empty() {
        out.push_str("    Empty [label=\"Empty Graph\"];\n");
    } else {
        for task in edges.keys() {
            let _ = writeln!(out, "    \"{}\";", task);
        }
        for (task, deps) in edges {
            for dep in deps {
                let _ = writeln!(out, "    \"{}\" -> \"{}\";", dep, task);
            }
        }
    }
    out.push_str("}\n");
    out
}
