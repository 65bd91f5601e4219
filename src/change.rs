//! Change detection: per-task staleness from current node state vs. the
//! state store, with cascade propagation along task -> node -> task edges.

use std::collections::{HashMap, HashSet};

use petgraph::graph::NodeIndex;

use crate::dag::{Dag, DagNode};
use crate::store::{StateStore, StateValue};
use crate::task::{Marker, Task, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Missing,
    NotInDb,
    Equal,
    Differ,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalRole {
    TaskItself,
    Dependency,
    Product,
}

#[derive(Debug, Clone)]
pub struct SignalResult {
    pub node_id: String,
    pub role: SignalRole,
    pub kind: SignalKind,
    pub current: Option<String>,
    pub previous: Option<String>,
}

impl SignalResult {
    pub fn is_changed(&self) -> bool {
        !matches!(self.kind, SignalKind::Equal)
    }
}

#[derive(Debug, Clone)]
pub struct StalenessExplanation {
    pub task_id: TaskId,
    pub stale: bool,
    /// Set when the task carries `persist` and the only changed signals are
    /// products that differ (not missing) while the task body and every
    /// dependency are unchanged: the body must not re-run, only the stored
    /// product hashes need refreshing (the `persisted` outcome).
    pub persist_refresh: bool,
    pub signals: Vec<SignalResult>,
}

/// Computes every signal for one task: the task itself, each dependency
/// node, and each product node.
fn task_signals(task: &Task, store: &StateStore) -> Vec<SignalResult> {
    let mut signals = Vec::new();

    signals.push(signal_for(
        SignalRole::TaskItself,
        &task.signature,
        current_task_state(task),
        store.get_task_state(&task.signature),
    ));

    for (_, node) in task.depends_on.walk() {
        let current = node_current_state(node);
        let previous = store.get_node_state(&task.signature, node.signature()).cloned();
        signals.push(signal_for(SignalRole::Dependency, node.signature(), current, previous));
    }

    for (_, node) in task.produces.walk() {
        let current = node_current_state(node);
        let previous = store.get_node_state(&task.signature, node.signature()).cloned();
        signals.push(signal_for(SignalRole::Product, node.signature(), current, previous));
    }

    signals
}

fn node_current_state(node: &crate::node::Node) -> Option<StateValue> {
    if node.is_provisional() {
        None
    } else {
        Some(StateValue::from(
            node.state()
                .expect("non-provisional node state is infallible"),
        ))
    }
}

fn current_task_state(task: &Task) -> Option<StateValue> {
    Some(StateValue {
        value: crate::hash::hash_task_body(
            &task.source_text,
            &Marker::canonical_form(&task.markers),
        )
        .to_hex(),
    })
}

fn signal_for(
    role: SignalRole,
    node_id: &str,
    current: Option<StateValue>,
    previous: Option<StateValue>,
) -> SignalResult {
    let kind = match (&current, &previous) {
        (None, _) => SignalKind::Missing,
        (Some(_), None) => SignalKind::NotInDb,
        (Some(cur), Some(prev)) if cur.value == prev.value => SignalKind::Equal,
        (Some(_), Some(_)) => SignalKind::Differ,
    };
    SignalResult {
        node_id: node_id.to_string(),
        role,
        kind,
        current: current.map(|v| v.value),
        previous: previous.map(|v| v.value),
    }
}

/// Determines staleness for every task, returning a map keyed by task
/// signature to its explanation. Tasks reachable from a stale task via a
/// task -> node -> task edge are also marked stale (cascade), matching a
/// plain topological sweep since the DAG is already acyclic.
///
/// `force` makes every task stale regardless of its signals. A task's
/// `persist` marker does not downgrade it to stale on product changes
/// alone — the executor, not this pass, turns that into a `persisted`
/// outcome; here it is still reported with its raw signals so the
/// executor can tell the two cases apart.
pub fn detect_changes(
    dag: &Dag,
    tasks: &[Task],
    store: &StateStore,
    force: bool,
) -> HashMap<TaskId, StalenessExplanation> {
    let tasks_by_id: HashMap<&str, &Task> =
        tasks.iter().map(|t| (t.signature.as_str(), t)).collect();

    let order = petgraph::algo::toposort(&dag.graph, None)
        .expect("DAG was validated acyclic at build time");

    let mut stale: HashSet<TaskId> = HashSet::new();
    let mut explanations = HashMap::new();

    for idx in order {
        let DagNode::Task(task_id) = dag.node_at(idx) else {
            continue;
        };
        let Some(task) = tasks_by_id.get(task_id.as_str()) else {
            continue;
        };

        let signals = task_signals(task, store);
        let persists = task.persists();

        // A persist task is not downgraded to stale by a product that
        // merely differs (the file was edited by hand, not deleted) — but
        // a missing product, or a changed task body/dependency, still
        // makes it stale in the ordinary way.
        let non_persist_changed = signals.iter().any(|s| {
            s.is_changed() && !(persists && s.role == SignalRole::Product && s.kind == SignalKind::Differ)
        });
        let cascade_stale = has_stale_ancestor(dag, idx, &stale);
        let is_stale = force || non_persist_changed || cascade_stale;

        let persist_refresh = persists
            && !is_stale
            && signals
                .iter()
                .any(|s| s.role == SignalRole::Product && s.kind == SignalKind::Differ);

        if is_stale {
            stale.insert(task_id.clone());
        }

        explanations.insert(
            task_id.clone(),
            StalenessExplanation {
                task_id: task_id.clone(),
                stale: is_stale,
                persist_refresh,
                signals,
            },
        );
    }

    explanations
}

/// Whether any predecessor task (reachable via node edges) is stale.
fn has_stale_ancestor(dag: &Dag, task_idx: NodeIndex, stale: &HashSet<TaskId>) -> bool {
    for node_idx in dag.dependencies_of(task_idx) {
        for predecessor_task_idx in dag.dependencies_of(node_idx) {
            if let DagNode::Task(id) = dag.node_at(predecessor_task_idx) {
                if stale.contains(id) {
                    return true;
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::build_dag;
    use crate::node::{Node, PathNode};
    use crate::tree::NodeTree;
    use std::sync::Arc;
    use camino::Utf8PathBuf;

    fn task_with_path(dir: &camino::Utf8Path, sig: &str, in_name: &str, out_name: &str) -> Task {
        let depends_on = NodeTree::leaf(Node::Path(PathNode::new(dir.join(in_name))));
        let produces = NodeTree::leaf(Node::Path(PathNode::new(dir.join(out_name))));
        let mut task = Task::new(
            None,
            sig,
            "",
            depends_on,
            produces,
            Arc::new(|_: &NodeTree, _: &NodeTree| Ok(vec![])),
            "fn body v1",
        );
        task.signature = sig.to_string();
        task
    }

    #[test]
    fn fresh_task_with_no_store_entry_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::write(root.join("in.txt"), b"hello").unwrap();

        let task = task_with_path(&root, "task_a", "in.txt", "out.txt");
        let dag = build_dag(std::slice::from_ref(&task)).unwrap();
        let store = StateStore::open(&root).unwrap();

        let explanations = detect_changes(&dag, &[task], &store, false);
        assert!(explanations["task_a"].stale);
    }

    #[test]
    fn unchanged_rerun_is_not_stale() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::write(root.join("in.txt"), b"hello").unwrap();
        std::fs::write(root.join("out.txt"), b"world").unwrap();

        let task = task_with_path(&root, "task_a", "in.txt", "out.txt");
        let dag = build_dag(std::slice::from_ref(&task)).unwrap();

        let mut store = StateStore::open(&root).unwrap();
        let signals = task_signals(&task, &store);
        let mut entry = crate::store::TaskEntry {
            id: task.signature.clone(),
            state: StateValue {
                value: signals[0].current.clone().unwrap(),
            },
            depends_on: Vec::new(),
            produces: Vec::new(),
        };
        for (_, node) in task.depends_on.walk() {
            entry.depends_on.push(crate::store::NodeEntry {
                id: node.signature().to_string(),
                state: StateValue::from(node.state().unwrap()),
            });
        }
        for (_, node) in task.produces.walk() {
            entry.produces.push(crate::store::NodeEntry {
                id: node.signature().to_string(),
                state: StateValue::from(node.state().unwrap()),
            });
        }
        store.update_task(entry).unwrap();

        let explanations = detect_changes(&dag, &[task], &store, false);
        assert!(!explanations["task_a"].stale);
    }

    #[test]
    fn force_marks_everything_stale_regardless_of_signals() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::write(root.join("in.txt"), b"hello").unwrap();

        let task = task_with_path(&root, "task_a", "in.txt", "out.txt");
        let dag = build_dag(std::slice::from_ref(&task)).unwrap();
        let store = StateStore::open(&root).unwrap();

        let explanations = detect_changes(&dag, &[task], &store, true);
        assert!(explanations["task_a"].stale);
    }
}
