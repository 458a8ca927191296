//! Execution ordering and lineage queries over a workflow graph
//!
//! Everything here is a pure function of the step list and the static
//! connection list. Structural checks live in [`crate::validation`]; callers
//! are expected to validate before executing in the order computed here.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::types::{Connection, NodeId, Step};

/// Compute a deterministic execution order for the given steps
///
/// Entry steps (no incoming connection) are walked depth-first in the order
/// the step list declares them; outgoing connections are followed in list
/// order and a step is emitted when the walk reaches it. A step whose
/// predecessors have not all been emitted yet is left for the walk that
/// arrives from its last predecessor, so every step follows all of its
/// direct predecessors in an acyclic graph. Steps never reached (cycles,
/// dangling structure) are appended in declaration order.
pub fn execution_order(steps: &[Step], connections: &[Connection]) -> Vec<NodeId> {
    let known: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();

    let mut predecessors: HashMap<&str, HashSet<&str>> = HashMap::new();
    for conn in connections {
        if known.contains(conn.source.as_str()) {
            predecessors
                .entry(conn.target.as_str())
                .or_default()
                .insert(conn.source.as_str());
        }
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut order = Vec::with_capacity(steps.len());

    for step in steps {
        if is_trigger_node(&step.id, connections) {
            visit(&step.id, connections, &predecessors, &mut visited, &mut order);
        }
    }

    for step in steps {
        if visited.insert(step.id.as_str()) {
            order.push(step.id.clone());
        }
    }

    order
}

fn visit<'a>(
    node: &'a str,
    connections: &'a [Connection],
    predecessors: &HashMap<&'a str, HashSet<&'a str>>,
    visited: &mut HashSet<&'a str>,
    order: &mut Vec<NodeId>,
) {
    if visited.contains(node) {
        return;
    }

    let ready = predecessors
        .get(node)
        .map(|preds| preds.iter().all(|p| visited.contains(p)))
        .unwrap_or(true);
    if !ready {
        return;
    }

    visited.insert(node);
    order.push(node.to_string());

    for conn in connections.iter().filter(|c| c.source == node) {
        visit(conn.target.as_str(), connections, predecessors, visited, order);
    }
}

/// All steps that can reach `node_id`, nearest first
pub fn upstream_nodes(node_id: &str, connections: &[Connection]) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    collect_transitive(node_id, connections, Direction::Upstream, &mut seen, &mut result);
    result
}

/// All steps reachable from `node_id`, nearest first
pub fn downstream_nodes(node_id: &str, connections: &[Connection]) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    collect_transitive(node_id, connections, Direction::Downstream, &mut seen, &mut result);
    result
}

#[derive(Clone, Copy)]
enum Direction {
    Upstream,
    Downstream,
}

fn collect_transitive<'a>(
    node: &str,
    connections: &'a [Connection],
    direction: Direction,
    seen: &mut HashSet<&'a str>,
    result: &mut Vec<NodeId>,
) {
    for conn in connections {
        let (from, to) = match direction {
            Direction::Upstream => (conn.target.as_str(), conn.source.as_str()),
            Direction::Downstream => (conn.source.as_str(), conn.target.as_str()),
        };
        if from == node && seen.insert(to) {
            result.push(to.to_string());
            collect_transitive(to, connections, direction, seen, result);
        }
    }
}

/// Direct predecessors of a step, in connection order
pub fn immediate_predecessors(node_id: &str, connections: &[Connection]) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    connections
        .iter()
        .filter(|c| c.target == node_id && seen.insert(c.source.as_str()))
        .map(|c| c.source.clone())
        .collect()
}

/// Direct successors of a step, in connection order
pub fn immediate_successors(node_id: &str, connections: &[Connection]) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    connections
        .iter()
        .filter(|c| c.source == node_id && seen.insert(c.target.as_str()))
        .map(|c| c.target.clone())
        .collect()
}

/// A step with no incoming connection
pub fn is_trigger_node(node_id: &str, connections: &[Connection]) -> bool {
    !connections.iter().any(|c| c.target == node_id)
}

/// A step with no outgoing connection
pub fn is_terminal_node(node_id: &str, connections: &[Connection]) -> bool {
    !connections.iter().any(|c| c.source == node_id)
}

/// Every trigger step, in declaration order
pub fn trigger_nodes(steps: &[Step], connections: &[Connection]) -> Vec<NodeId> {
    steps
        .iter()
        .filter(|s| is_trigger_node(&s.id, connections))
        .map(|s| s.id.clone())
        .collect()
}

/// Every terminal step, in declaration order
pub fn terminal_nodes(steps: &[Step], connections: &[Connection]) -> Vec<NodeId> {
    steps
        .iter()
        .filter(|s| is_terminal_node(&s.id, connections))
        .map(|s| s.id.clone())
        .collect()
}

/// Dependency-count scheduler (Kahn's algorithm)
///
/// Hands out steps whose predecessors have all completed, so independent
/// branches can be dispatched together. Connections to unknown steps are
/// ignored; steps on a cycle are never released.
#[derive(Debug, Clone)]
pub struct ReadyQueue {
    in_degree: HashMap<NodeId, usize>,
    successors: HashMap<NodeId, Vec<NodeId>>,
    ready: VecDeque<NodeId>,
    position: HashMap<NodeId, usize>,
    completed: HashSet<NodeId>,
}

impl ReadyQueue {
    /// Build the queue for a graph
    pub fn new(steps: &[Step], connections: &[Connection]) -> Self {
        let position: HashMap<NodeId, usize> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();

        let mut in_degree: HashMap<NodeId, usize> =
            steps.iter().map(|s| (s.id.clone(), 0)).collect();
        let mut successors: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut seen_edges: HashSet<(&str, &str)> = HashSet::new();

        for conn in connections {
            if !position.contains_key(&conn.source) || !position.contains_key(&conn.target) {
                continue;
            }
            // Parallel connections between the same pair count once
            if !seen_edges.insert((conn.source.as_str(), conn.target.as_str())) {
                continue;
            }
            if let Some(degree) = in_degree.get_mut(&conn.target) {
                *degree += 1;
            }
            successors
                .entry(conn.source.clone())
                .or_default()
                .push(conn.target.clone());
        }

        let ready = steps
            .iter()
            .filter(|s| in_degree.get(&s.id) == Some(&0))
            .map(|s| s.id.clone())
            .collect();

        Self {
            in_degree,
            successors,
            ready,
            position,
            completed: HashSet::new(),
        }
    }

    /// Take every step that is currently ready, in declaration order
    pub fn ready(&mut self) -> Vec<NodeId> {
        let mut batch: Vec<NodeId> = self.ready.drain(..).collect();
        batch.sort_by_key(|id| self.position.get(id).copied().unwrap_or(usize::MAX));
        batch
    }

    /// Mark a step as completed and release successors that became ready
    pub fn complete(&mut self, node_id: &str) {
        if !self.in_degree.contains_key(node_id) || !self.completed.insert(node_id.to_string()) {
            return;
        }
        let Some(successors) = self.successors.get(node_id) else {
            return;
        };
        for succ in successors {
            if let Some(degree) = self.in_degree.get_mut(succ) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    self.ready.push_back(succ.clone());
                }
            }
        }
    }

    /// Whether any step is waiting to be handed out
    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Steps not yet completed
    pub fn remaining(&self) -> usize {
        self.in_degree.len() - self.completed.len()
    }

    /// All steps have been completed
    pub fn is_finished(&self) -> bool {
        self.remaining() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::WorkflowBuilder;
    use crate::types::Workflow;

    fn chain() -> Workflow {
        WorkflowBuilder::new("wf", "Chain")
            .add_step("A", "t")
            .add_step("B", "t")
            .add_step("C", "t")
            .connect("A", "B")
            .connect("B", "C")
            .build()
    }

    fn steps(ids: &[&str]) -> Vec<Step> {
        ids.iter().map(|id| Step::new(*id, "t")).collect()
    }

    fn position(order: &[NodeId], id: &str) -> usize {
        order.iter().position(|s| s == id).unwrap()
    }

    /// Every step must come after all of its direct predecessors
    fn assert_respects_edges(steps: &[Step], connections: &[Connection], order: &[NodeId]) {
        assert_eq!(order.len(), steps.len(), "order must be total: {:?}", order);
        let unique: HashSet<&NodeId> = order.iter().collect();
        assert_eq!(unique.len(), order.len(), "order has duplicates: {:?}", order);
        for conn in connections {
            assert!(
                position(order, &conn.source) < position(order, &conn.target),
                "{} must precede {} in {:?}",
                conn.source,
                conn.target,
                order
            );
        }
    }

    #[test]
    fn test_linear_chain_order() {
        let wf = chain();
        assert_eq!(execution_order(&wf.steps, &wf.connections), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_chain_declared_in_reverse() {
        let mut wf = chain();
        wf.steps.reverse();
        assert_eq!(execution_order(&wf.steps, &wf.connections), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_merge_after_both_triggers() {
        let wf = WorkflowBuilder::new("wf", "Merge")
            .add_step("T1", "t")
            .add_step("T2", "t")
            .add_step("M", "t")
            .connect("T1", "M")
            .connect("T2", "M")
            .build();

        let order = execution_order(&wf.steps, &wf.connections);
        assert_eq!(order.len(), 3);
        assert!(position(&order, "M") > position(&order, "T1"));
        assert!(position(&order, "M") > position(&order, "T2"));
    }

    #[test]
    fn test_diamond_with_shortcut() {
        // A -> B, A -> C, C -> B: B must wait for C
        let wf = WorkflowBuilder::new("wf", "Diamond")
            .add_step("A", "t")
            .add_step("B", "t")
            .add_step("C", "t")
            .connect("A", "B")
            .connect("A", "C")
            .connect("C", "B")
            .build();

        assert_eq!(execution_order(&wf.steps, &wf.connections), vec!["A", "C", "B"]);
    }

    #[test]
    fn test_unreached_steps_appended_in_declaration_order() {
        // "late" hangs off a cycle, so no walk from a trigger reaches it
        let wf = WorkflowBuilder::new("wf", "Loose")
            .add_step("A", "t")
            .add_step("late", "t")
            .add_step("X", "t")
            .add_step("Y", "t")
            .add_step("lonely", "t")
            .connect("X", "Y")
            .connect("Y", "X")
            .connect("Y", "late")
            .build();

        let order = execution_order(&wf.steps, &wf.connections);
        assert_eq!(order, vec!["A", "lonely", "late", "X", "Y"]);
    }

    #[test]
    fn test_cycle_is_total_and_terminates() {
        let wf = WorkflowBuilder::new("wf", "Cycle")
            .add_step("A", "t")
            .add_step("B", "t")
            .add_step("C", "t")
            .connect("A", "B")
            .connect("B", "C")
            .connect("C", "B")
            .build();

        let order = execution_order(&wf.steps, &wf.connections);
        assert_eq!(order, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_order_respects_edges_for_every_small_dag() {
        // Enumerate every DAG over up to five steps: edges only go from a
        // lower to a higher topological rank, every subset of such edges is
        // tried, and the step list is presented in several declaration orders.
        for n in 1..=5usize {
            let ids: Vec<String> = (0..n).map(|i| format!("s{}", i)).collect();
            let pairs: Vec<(usize, usize)> = (0..n)
                .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
                .collect();

            for mask in 0u32..(1u32 << pairs.len()) {
                let connections: Vec<Connection> = pairs
                    .iter()
                    .enumerate()
                    .filter(|(bit, _)| mask & (1 << bit) != 0)
                    .map(|(bit, (i, j))| {
                        Connection::new(format!("c{}", bit), ids[*i].clone(), ids[*j].clone())
                    })
                    .collect();

                let forward: Vec<Step> = ids.iter().map(|id| Step::new(id.clone(), "t")).collect();
                let mut backward = forward.clone();
                backward.reverse();
                let mut rotated = forward.clone();
                rotated.rotate_left(n / 2);
                let mut connections_reversed = connections.clone();
                connections_reversed.reverse();

                for declared in [&forward, &backward, &rotated] {
                    let order = execution_order(declared, &connections);
                    assert_respects_edges(declared, &connections, &order);

                    let order = execution_order(declared, &connections_reversed);
                    assert_respects_edges(declared, &connections_reversed, &order);
                }
            }
        }
    }

    #[test]
    fn test_upstream_and_downstream_closure() {
        let wf = WorkflowBuilder::new("wf", "Tree")
            .add_step("A", "t")
            .add_step("B", "t")
            .add_step("C", "t")
            .add_step("D", "t")
            .connect("A", "B")
            .connect("B", "D")
            .connect("A", "C")
            .connect("C", "D")
            .build();

        assert_eq!(downstream_nodes("A", &wf.connections), vec!["B", "D", "C"]);
        assert_eq!(upstream_nodes("D", &wf.connections), vec!["B", "A", "C"]);
        assert!(upstream_nodes("A", &wf.connections).is_empty());
        assert!(downstream_nodes("D", &wf.connections).is_empty());
    }

    #[test]
    fn test_closure_terminates_on_cycle() {
        let connections = vec![Connection::new("c1", "A", "B"), Connection::new("c2", "B", "A")];
        assert_eq!(downstream_nodes("A", &connections), vec!["B", "A"]);
    }

    #[test]
    fn test_immediate_neighbours_are_deduplicated() {
        let connections = vec![
            Connection::new("c1", "A", "B"),
            Connection::new("c2", "A", "B"),
            Connection::new("c3", "A", "C"),
        ];
        assert_eq!(immediate_successors("A", &connections), vec!["B", "C"]);
        assert_eq!(immediate_predecessors("B", &connections), vec!["A"]);
    }

    #[test]
    fn test_trigger_and_terminal_nodes() {
        let wf = chain();
        assert!(is_trigger_node("A", &wf.connections));
        assert!(!is_trigger_node("B", &wf.connections));
        assert!(is_terminal_node("C", &wf.connections));
        assert_eq!(trigger_nodes(&wf.steps, &wf.connections), vec!["A"]);
        assert_eq!(terminal_nodes(&wf.steps, &wf.connections), vec!["C"]);

        let single = steps(&["only"]);
        assert_eq!(trigger_nodes(&single, &[]), vec!["only"]);
        assert_eq!(terminal_nodes(&single, &[]), vec!["only"]);
    }

    #[test]
    fn test_ready_queue_releases_in_waves() {
        let wf = WorkflowBuilder::new("wf", "Fan")
            .add_step("A", "t")
            .add_step("B", "t")
            .add_step("C", "t")
            .add_step("D", "t")
            .connect("A", "B")
            .connect("A", "C")
            .connect("B", "D")
            .connect("C", "D")
            .build();

        let mut queue = ReadyQueue::new(&wf.steps, &wf.connections);
        assert_eq!(queue.ready(), vec!["A"]);
        assert!(!queue.has_ready());

        queue.complete("A");
        assert_eq!(queue.ready(), vec!["B", "C"]);

        queue.complete("B");
        assert!(!queue.has_ready());
        queue.complete("C");
        assert_eq!(queue.ready(), vec!["D"]);

        queue.complete("D");
        assert!(queue.is_finished());
    }

    #[test]
    fn test_ready_queue_never_releases_cycle() {
        let wf = WorkflowBuilder::new("wf", "Cycle")
            .add_step("A", "t")
            .add_step("B", "t")
            .connect("A", "B")
            .connect("B", "A")
            .build();

        let mut queue = ReadyQueue::new(&wf.steps, &wf.connections);
        assert!(queue.ready().is_empty());
        assert_eq!(queue.remaining(), 2);
    }

    #[test]
    fn test_ready_queue_counts_parallel_connections_once() {
        let s = steps(&["A", "B"]);
        let connections = vec![Connection::new("c1", "A", "B"), Connection::new("c2", "A", "B")];
        let mut queue = ReadyQueue::new(&s, &connections);
        assert_eq!(queue.ready(), vec!["A"]);
        queue.complete("A");
        assert_eq!(queue.ready(), vec!["B"]);
    }
}
