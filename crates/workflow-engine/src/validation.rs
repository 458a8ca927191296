//! Structural validation for workflow graphs
//!
//! Detects empty and disconnected workflows, dangling connection
//! references and cycles. Every problem found is reported, not just the
//! first; orphaned steps are reported as warnings and never block a run.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::types::{Connection, Step};

/// A structural problem found in a graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum GraphIssue {
    /// The workflow has no steps at all
    NoSteps,
    /// Several steps but not a single connection
    NoConnections,
    /// A connection references a step that does not exist
    #[serde(rename_all = "camelCase")]
    UnknownNode { connection_id: String, node_id: String },
    /// A cycle exists in the connection graph
    CycleDetected,
    /// A step is not incident to any connection
    #[serde(rename_all = "camelCase")]
    OrphanedNode { node_id: String },
}

impl std::fmt::Display for GraphIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSteps => write!(f, "Workflow must contain at least one step"),
            Self::NoConnections => write!(f, "Multi-step workflows must be connected"),
            Self::UnknownNode {
                connection_id,
                node_id,
            } => write!(
                f,
                "Connection '{}' references unknown step '{}'",
                connection_id, node_id
            ),
            Self::CycleDetected => write!(f, "Cycle detected in graph"),
            Self::OrphanedNode { node_id } => {
                write!(f, "Step '{}' has no connections and will run in isolation", node_id)
            }
        }
    }
}

/// Outcome of [`validate_graph`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphValidation {
    pub valid: bool,
    pub errors: Vec<GraphIssue>,
    pub warnings: Vec<GraphIssue>,
}

impl GraphValidation {
    /// Human-readable error messages, in detection order
    pub fn messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.to_string()).collect()
    }

    /// Human-readable warning messages, in detection order
    pub fn warning_messages(&self) -> Vec<String> {
        self.warnings.iter().map(|w| w.to_string()).collect()
    }

    pub fn has_cycle(&self) -> bool {
        self.errors.contains(&GraphIssue::CycleDetected)
    }
}

/// Validate the structure of a workflow graph
///
/// Pure: the graph is never modified and repeated calls give identical
/// results. Engines must refuse to execute a graph that is not `valid`.
pub fn validate_graph(steps: &[Step], connections: &[Connection]) -> GraphValidation {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if steps.is_empty() {
        errors.push(GraphIssue::NoSteps);
        return GraphValidation {
            valid: false,
            errors,
            warnings,
        };
    }

    if steps.len() > 1 && connections.is_empty() {
        errors.push(GraphIssue::NoConnections);
    }

    validate_references(steps, connections, &mut errors);

    if steps.len() > 1 {
        find_orphans(steps, connections, &mut warnings);
    }

    if has_cycle(steps, connections) {
        errors.push(GraphIssue::CycleDetected);
    }

    GraphValidation {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

/// Check that all connection endpoints exist
fn validate_references(steps: &[Step], connections: &[Connection], errors: &mut Vec<GraphIssue>) {
    let node_ids: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();

    for conn in connections {
        for endpoint in [&conn.source, &conn.target] {
            if !node_ids.contains(endpoint.as_str()) {
                errors.push(GraphIssue::UnknownNode {
                    connection_id: conn.id.clone(),
                    node_id: endpoint.clone(),
                });
            }
        }
    }
}

fn find_orphans(steps: &[Step], connections: &[Connection], warnings: &mut Vec<GraphIssue>) {
    let connected: HashSet<&str> = connections
        .iter()
        .flat_map(|c| [c.source.as_str(), c.target.as_str()])
        .collect();

    for step in steps {
        if !connected.contains(step.id.as_str()) {
            warnings.push(GraphIssue::OrphanedNode {
                node_id: step.id.clone(),
            });
        }
    }
}

/// Detect cycles using DFS with a recursion stack
///
/// An edge back to a node still on the stack closes a cycle; an edge to a
/// node that has already been fully explored does not.
fn has_cycle(steps: &[Step], connections: &[Connection]) -> bool {
    let mut graph: HashMap<&str, Vec<&str>> = HashMap::new();
    for conn in connections {
        graph
            .entry(conn.source.as_str())
            .or_default()
            .push(conn.target.as_str());
    }

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();

    // Walk declared steps first, then any endpoint only named by connections
    let roots = steps
        .iter()
        .map(|s| s.id.as_str())
        .chain(connections.iter().map(|c| c.source.as_str()));

    for node in roots {
        if !visited.contains(node) && visit(node, &graph, &mut visited, &mut rec_stack) {
            return true;
        }
    }

    false
}

fn visit<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);

    if let Some(neighbors) = graph.get(node) {
        for &neighbor in neighbors {
            if !visited.contains(neighbor) {
                if visit(neighbor, graph, visited, rec_stack) {
                    return true;
                }
            } else if rec_stack.contains(neighbor) {
                return true;
            }
        }
    }

    rec_stack.remove(node);
    false
}
