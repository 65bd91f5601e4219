//! DAG construction and validation.
//!
//! The graph is a disjoint union of task nodes and node nodes: edges run
//! `node -> task` for a dependency and `task -> node` for a product, so a
//! normal topological order of the whole graph interleaves data availability
//! with task execution. A `HashMap<String, NodeIndex>` signature index backs
//! O(1) lookup by signature over the underlying `petgraph::Graph`.

use std::collections::HashMap;

use petgraph::Directed;
use petgraph::algo::kosaraju_scc;
use petgraph::graph::{Graph, NodeIndex};

use crate::error::{DagError, MissingRoot};
use crate::node::Node;
use crate::task::{NodeId, Task, TaskId};

#[derive(Debug, Clone)]
pub enum DagNode {
    Task(TaskId),
    Node(NodeId),
}

pub struct Dag {
    pub(crate) graph: Graph<DagNode, (), Directed>,
    index: HashMap<String, NodeIndex>,
}

impl Dag {
    pub fn index_of(&self, signature: &str) -> Option<NodeIndex> {
        self.index.get(signature).copied()
    }

    pub fn node_at(&self, idx: NodeIndex) -> &DagNode {
        &self.graph[idx]
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.graph.node_weights().filter_map(|n| match n {
            DagNode::Task(id) => Some(id),
            DagNode::Node(_) => None,
        })
    }

    pub fn dependencies_of(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph
            .neighbors_directed(idx, petgraph::Direction::Incoming)
    }

    pub fn dependents_of(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph
            .neighbors_directed(idx, petgraph::Direction::Outgoing)
    }
}

/// Assembles tasks and their dependency/product trees into a validated
/// [`Dag`]. All checks run unconditionally and every failure is collected,
/// rather than stopping at the first one: a caller fixing a project wants
/// the full list of problems in one pass, not a fix-rerun-fix loop.
pub fn build_dag(tasks: &[Task]) -> Result<Dag, DagError> {
    let mut graph: Graph<DagNode, (), Directed> = Graph::new();
    let mut index: HashMap<String, NodeIndex> = HashMap::new();
    let mut errors = Vec::new();

    for task in tasks {
        if task.has_conflicting_priority() {
            errors.push(DagError::ConflictingPriority(task.signature.clone()));
        }
    }

    // Pass 1: a graph index entry per task and per distinct node signature.
    for task in tasks {
        let task_idx = graph.add_node(DagNode::Task(task.signature.clone()));
        index.insert(task.signature.clone(), task_idx);

        for (_, node) in task.depends_on.walk().into_iter().chain(task.produces.walk()) {
            ensure_node_indexed(&mut graph, &mut index, node);
        }
    }

    // Pass 2: producer uniqueness + edges.
    let mut producers: HashMap<String, Vec<TaskId>> = HashMap::new();

    for task in tasks {
        let task_idx = index[&task.signature];

        for (_, node) in task.depends_on.walk() {
            let node_idx = index[node.signature()];
            graph.update_edge(node_idx, task_idx, ());
        }

        for (_, node) in task.produces.walk() {
            let node_idx = index[node.signature()];
            graph.update_edge(task_idx, node_idx, ());
            producers
                .entry(node.signature().to_string())
                .or_default()
                .push(task.signature.clone());
        }
    }

    for (node_sig, producing_tasks) in &producers {
        if producing_tasks.len() > 1 {
            errors.push(DagError::DuplicateProducer {
                node: node_sig.clone(),
                producers: producing_tasks.clone(),
            });
        }
    }

    if let Some(cycle) = find_cycle(&graph) {
        errors.push(DagError::Cycle(cycle));
    }

    let missing_roots = find_missing_roots(tasks, &producers);
    if !missing_roots.is_empty() {
        errors.push(DagError::MissingRoots(missing_roots));
    }

    if errors.is_empty() {
        Ok(Dag { graph, index })
    } else if errors.len() == 1 {
        Err(errors.into_iter().next().unwrap())
    } else {
        Err(DagError::Aggregate(errors))
    }
}

fn ensure_node_indexed(
    graph: &mut Graph<DagNode, (), Directed>,
    index: &mut HashMap<String, NodeIndex>,
    node: &Node,
) {
    index.entry(node.signature().to_string()).or_insert_with(|| {
        graph.add_node(DagNode::Node(node.signature().to_string()))
    });
}

/// A cycle exists iff there is a strongly-connected component with more
/// than one node, or a self-loop — a single-node SCC that also carries an
/// edge to itself.
fn find_cycle(graph: &Graph<DagNode, (), Directed>) -> Option<Vec<String>> {
    for scc in kosaraju_scc(graph) {
        if scc.len() > 1 {
            return Some(scc.iter().map(|&idx| dag_node_label(&graph[idx])).collect());
        }
        if let [only] = scc.as_slice() {
            if graph.find_edge(*only, *only).is_some() {
                return Some(vec![dag_node_label(&graph[*only])]);
            }
        }
    }
    None
}

fn dag_node_label(node: &DagNode) -> String {
    match node {
        DagNode::Task(id) => id.clone(),
        DagNode::Node(id) => id.clone(),
    }
}

/// A dependency node is a root if nothing produces it. A root that is also
/// absent from disk can never become available, so every task depending on
/// it can never run; this is reported rather than silently deferred.
fn find_missing_roots(tasks: &[Task], producers: &HashMap<String, Vec<TaskId>>) -> Vec<MissingRoot> {
    let mut dependents: HashMap<String, Vec<TaskId>> = HashMap::new();

    for task in tasks {
        for (_, node) in task.depends_on.walk() {
            dependents
                .entry(node.signature().to_string())
                .or_default()
                .push(task.signature.clone());
        }
    }

    let mut missing = Vec::new();
    for (node_sig, dependent_tasks) in &dependents {
        if producers.contains_key(node_sig) {
            continue;
        }
        let node = tasks
            .iter()
            .flat_map(|t| t.depends_on.walk())
            .find(|(_, n)| n.signature() == node_sig)
            .map(|(_, n)| n);

        let Some(node) = node else { continue };
        if node.is_provisional() {
            continue;
        }
        if matches!(node.state(), Ok(crate::node::NodeState::Absent)) {
            missing.push(MissingRoot {
                node: node_sig.clone(),
                dependent_tasks: dependent_tasks.clone(),
            });
        }
    }

    missing.sort_by(|a, b| a.node.cmp(&b.node));
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::PathNode;
    use crate::tree::NodeTree;
    use std::sync::Arc;

    fn dummy_task(sig: &str, deps: NodeTree, prods: NodeTree) -> Task {
        let mut task = Task::new(
            None,
            sig,
            "",
            deps,
            prods,
            Arc::new(|_: &NodeTree, _: &NodeTree| Ok(vec![])),
            "",
        );
        task.signature = sig.to_string();
        task
    }

    #[test]
    fn acyclic_two_task_chain_builds() {
        let a_out = Node::Path(PathNode::new("a.out"));
        let b_out = Node::Path(PathNode::new("b.out"));

        let task_a = dummy_task("task_a", NodeTree::default(), NodeTree::leaf(a_out.clone()));
        let task_b = dummy_task("task_b", NodeTree::leaf(a_out), NodeTree::leaf(b_out));

        let dag = build_dag(&[task_a, task_b]).unwrap();
        assert_eq!(dag.task_ids().count(), 2);
    }

    #[test]
    fn duplicate_producer_is_rejected() {
        let shared = Node::Path(PathNode::new("shared.out"));

        let task_a = dummy_task("task_a", NodeTree::default(), NodeTree::leaf(shared.clone()));
        let task_b = dummy_task("task_b", NodeTree::default(), NodeTree::leaf(shared));

        let err = build_dag(&[task_a, task_b]).unwrap_err();
        assert!(matches!(err, DagError::DuplicateProducer { .. }));
    }

    #[test]
    fn direct_cycle_is_detected() {
        let node_x = Node::Path(PathNode::new("x"));
        let node_y = Node::Path(PathNode::new("y"));

        let task_a = dummy_task(
            "task_a",
            NodeTree::leaf(node_y.clone()),
            NodeTree::leaf(node_x.clone()),
        );
        let task_b = dummy_task("task_b", NodeTree::leaf(node_x), NodeTree::leaf(node_y));

        let err = build_dag(&[task_a, task_b]).unwrap_err();
        assert!(matches!(err, DagError::Cycle(_)));
    }

    #[test]
    fn missing_absent_root_is_reported() {
        let missing_input = Node::Path(PathNode::new("/does/not/exist.txt"));
        let task_a = dummy_task(
            "task_a",
            NodeTree::leaf(missing_input),
            NodeTree::leaf(Node::Path(PathNode::new("out.txt"))),
        );

        let err = build_dag(&[task_a]).unwrap_err();
        assert!(matches!(err, DagError::MissingRoots(_)));
    }
}
