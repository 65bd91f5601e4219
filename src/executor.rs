//! Setup -> execute -> teardown driver per task, with skip/persist
//! semantics, cascade-skip on failure, and a stop policy.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::config::RunConfig;
use crate::error::TaskError;
use crate::node::{path_casing_mismatch, Node, NodeState};
use crate::provisional::Resolver;
use crate::store::{NodeEntry, StateStore, StateValue, TaskEntry};
use crate::task::{Marker, Task, TaskId, WarningFilter};
use crate::tree::NodeTree;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Persisted,
    Skipped,
    SkippedUnchanged,
    SkippedAncestorFailed { reason: TaskId },
    Failed { reason: String },
    WouldBeExecuted,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Persisted => "persisted",
            Outcome::Skipped => "skipped",
            Outcome::SkippedUnchanged => "skipped_unchanged",
            Outcome::SkippedAncestorFailed { .. } => "skipped_ancestor_failed",
            Outcome::Failed { .. } => "failed",
            Outcome::WouldBeExecuted => "would_be_executed",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }
}

/// Drives a single task through setup, execute and teardown. Returns the
/// outcome plus, for task generators, any freshly produced tasks for the
/// caller to fold into the session and trigger a DAG rebuild.
pub struct Executor<'a> {
    store: &'a mut StateStore,
    config: &'a RunConfig,
    global_filters: &'a [WarningFilter],
    resolver: Resolver,
    failure_count: usize,
}

impl<'a> Executor<'a> {
    pub fn new(
        store: &'a mut StateStore,
        config: &'a RunConfig,
        global_filters: &'a [WarningFilter],
    ) -> Self {
        Executor {
            store,
            config,
            global_filters,
            resolver: Resolver::default(),
            failure_count: 0,
        }
    }

    pub fn should_stop(&self) -> bool {
        self.failure_count >= self.config.effective_max_failures()
    }

    pub fn run(
        &mut self,
        task: &mut Task,
        ancestor_failure: Option<&str>,
        explanation: &crate::change::StalenessExplanation,
    ) -> Result<(Outcome, Vec<Task>), TaskError> {
        if let Some(reason) = ancestor_failure {
            return Ok((
                Outcome::SkippedAncestorFailed {
                    reason: reason.to_string(),
                },
                Vec::new(),
            ));
        }

        if let Some(reason) = task.skip_ancestor_failed_reason() {
            return Ok((
                Outcome::SkippedAncestorFailed {
                    reason: reason.to_string(),
                },
                Vec::new(),
            ));
        }

        if task.is_skip() || task.skip_if_reason().is_some() {
            return Ok((Outcome::Skipped, Vec::new()));
        }

        // A persist task whose only drift is a hand-edited product does not
        // re-run the body; it just accepts the new product hash as ground
        // truth and refreshes the stored state.
        if explanation.persist_refresh && !self.config.force {
            self.write_state(task)?;
            return Ok((Outcome::Persisted, Vec::new()));
        }

        if !explanation.stale && !self.config.force {
            return Ok((Outcome::SkippedUnchanged, Vec::new()));
        }

        if self.config.dry_run {
            return Ok((Outcome::WouldBeExecuted, Vec::new()));
        }

        if self.config.check_casing_of_paths {
            warn_on_casing_mismatches(&task.depends_on);
        }

        self.resolver.resolve_dependencies(task)?;

        for (_, node) in task.depends_on.walk() {
            match node.state() {
                Ok(NodeState::Absent) | Err(_) => {
                    self.failure_count += 1;
                    return Err(TaskError::MissingDependency(node.signature().to_string()));
                }
                Ok(_) => {}
            }
        }

        create_product_directories(task);

        log_effective_filters(task, self.global_filters);

        let generated = match task.function.call(&task.depends_on, &task.produces) {
            Ok(generated) => generated,
            Err(err) => {
                self.failure_count += 1;
                return Err(TaskError::Execution(err));
            }
        };

        self.resolver.resolve_products(task)?;

        for (_, node) in task.produces.walk() {
            match node.state() {
                Ok(NodeState::Absent) | Err(_) => {
                    self.failure_count += 1;
                    return Err(TaskError::MissingProduct(node.signature().to_string()));
                }
                Ok(_) => {}
            }
        }

        if self.config.check_casing_of_paths {
            warn_on_casing_mismatches(&task.produces);
        }

        if !task.is_generator {
            self.write_state(task)?;
        }

        Ok((Outcome::Success, generated))
    }

    fn write_state(&mut self, task: &Task) -> Result<(), TaskError> {
        write_task_state(self.store, task)
    }
}

/// Builds a [`TaskEntry`] from a task's current node states and writes it
/// to the store. Shared between the sequential executor and the `parallel`
/// adapter, which both finish a task the same way once its body (if any)
/// has run.
pub(crate) fn write_task_state(store: &mut StateStore, task: &Task) -> Result<(), TaskError> {
    let task_state = StateValue {
        value: crate::hash::hash_task_body(&task.source_text, &Marker::canonical_form(&task.markers))
            .to_hex(),
    };

    let depends_on = task
        .depends_on
        .walk()
        .into_iter()
        .map(|(_, node)| NodeEntry {
            id: node.signature().to_string(),
            state: StateValue::from(
                node.state()
                    .expect("node state resolved before state write"),
            ),
        })
        .collect();

    let produces = task
        .produces
        .walk()
        .into_iter()
        .map(|(_, node)| NodeEntry {
            id: node.signature().to_string(),
            state: StateValue::from(
                node.state()
                    .expect("node state resolved before state write"),
            ),
        })
        .collect();

    store.update_task(TaskEntry {
        id: task.signature.clone(),
        state: task_state,
        depends_on,
        produces,
    })?;

    Ok(())
}

pub(crate) fn create_product_directories(task: &Task) {
    for (_, node) in task.produces.walk() {
        if let crate::node::Node::Path(path_node) = node {
            if let Some(parent) = path_node.path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
    }
}

/// Warns when a declared path's casing differs from the matching on-disk
/// entry, gated on `RunConfig::check_casing_of_paths`. Shared between the
/// sequential executor and the `parallel` adapter.
pub(crate) fn warn_on_casing_mismatches(tree: &NodeTree) {
    for (_, node) in tree.walk() {
        if let Node::Path(path_node) = node {
            if let Some(actual) = path_casing_mismatch(&path_node.path) {
                warn!(
                    declared = %path_node.path,
                    actual = %actual,
                    "path casing differs from the on-disk name"
                );
            }
        }
    }
}

/// Logs the warning filters in effect for a task, merging its own
/// `FilterWarnings` markers with the run-wide `filterwarnings` config.
pub(crate) fn log_effective_filters(task: &Task, global_filters: &[WarningFilter]) {
    let effective = task.effective_filters(global_filters);
    if !effective.is_empty() {
        debug!(
            task = %task.base_name,
            filters = effective.len(),
            "warning filters in effect"
        );
    }
}

/// Propagates `skip_ancestor_failed` to every strict descendant of a failed
/// task, returning the reasons keyed by descendant task id.
pub fn cascade_failure(
    dag: &crate::dag::Dag,
    failed_task_id: &str,
) -> HashMap<TaskId, String> {
    let mut reasons = HashMap::new();
    let Some(idx) = dag.index_of(failed_task_id) else {
        return reasons;
    };

    let mut stack = vec![idx];
    let mut visited = std::collections::HashSet::new();

    while let Some(current) = stack.pop() {
        for node_idx in dag.dependents_of(current) {
            for task_idx in dag.dependents_of(node_idx) {
                if !visited.insert(task_idx) {
                    continue;
                }
                if let crate::dag::DagNode::Task(id) = dag.node_at(task_idx) {
                    reasons
                        .entry(id.clone())
                        .or_insert_with(|| failed_task_id.to_string());
                }
                stack.push(task_idx);
            }
        }
    }

    reasons
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::StalenessExplanation;
    use crate::dag::build_dag;
    use crate::node::{Node, PathNode};
    use crate::tree::NodeTree;
    use std::sync::Arc;

    fn explanation(stale: bool) -> StalenessExplanation {
        StalenessExplanation {
            task_id: "t".to_string(),
            stale,
            persist_refresh: false,
            signals: Vec::new(),
        }
    }

    #[test]
    fn skip_marker_short_circuits_to_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let mut store = StateStore::open(&root).unwrap();
        let config = RunConfig::default();
        let mut executor = Executor::new(&mut store, &config, &[]);

        let mut task = Task::new(
            None,
            "t",
            "",
            NodeTree::default(),
            NodeTree::default(),
            Arc::new(|_: &NodeTree, _: &NodeTree| Ok(vec![])),
            "",
        )
        .with_marker(Marker::Skip);

        let (outcome, _) = executor.run(&mut task, None, &explanation(true)).unwrap();
        assert_eq!(outcome, Outcome::Skipped);
    }

    #[test]
    fn unchanged_and_not_forced_skips_without_running_body() {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let mut store = StateStore::open(&root).unwrap();
        let config = RunConfig::default();
        let mut executor = Executor::new(&mut store, &config, &[]);

        let mut task = Task::new(
            None,
            "t",
            "",
            NodeTree::default(),
            NodeTree::default(),
            Arc::new(|_: &NodeTree, _: &NodeTree| unreachable!("should not run")),
            "",
        );

        let (outcome, _) = executor.run(&mut task, None, &explanation(false)).unwrap();
        assert_eq!(outcome, Outcome::SkippedUnchanged);
    }

    #[test]
    fn successful_execution_creates_parent_dirs_and_writes_state() {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::write(root.join("in.txt"), b"hello").unwrap();

        let out_path = root.join("nested").join("out.txt");
        let out_path_clone = out_path.clone();

        let mut store = StateStore::open(&root).unwrap();
        let config = RunConfig::default();
        let mut executor = Executor::new(&mut store, &config, &[]);

        let depends_on = NodeTree::leaf(Node::Path(PathNode::new(root.join("in.txt"))));
        let produces = NodeTree::leaf(Node::Path(PathNode::new(out_path.clone())));

        let mut task = Task::new(
            None,
            "t",
            "",
            depends_on,
            produces,
            Arc::new(move |_: &NodeTree, _: &NodeTree| {
                std::fs::write(&out_path_clone, b"done").unwrap();
                Ok(vec![])
            }),
            "fn body",
        );
        task.signature = "t".to_string();

        let (outcome, _) = executor.run(&mut task, None, &explanation(true)).unwrap();
        assert_eq!(outcome, Outcome::Success);
        assert!(out_path.exists());
        assert!(store.get_task_state("t").is_some());
    }

    #[test]
    fn persist_marker_refreshes_state_without_running_body() {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let mut store = StateStore::open(&root).unwrap();
        let config = RunConfig::default();
        let mut executor = Executor::new(&mut store, &config, &[]);

        let mut task = Task::new(
            None,
            "t",
            "",
            NodeTree::default(),
            NodeTree::default(),
            Arc::new(|_: &NodeTree, _: &NodeTree| unreachable!("should not run")),
            "",
        )
        .with_marker(Marker::Persist);

        let mut persisted_explanation = explanation(false);
        persisted_explanation.persist_refresh = true;

        let (outcome, _) = executor.run(&mut task, None, &persisted_explanation).unwrap();
        assert_eq!(outcome, Outcome::Persisted);
        assert!(store.get_task_state("t").is_some());
    }

    #[test]
    fn generator_task_never_writes_state_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let mut store = StateStore::open(&root).unwrap();
        let config = RunConfig::default();
        let mut executor = Executor::new(&mut store, &config, &[]);

        let child_signature = "generated_child".to_string();
        let mut task = Task::new(
            None,
            "spawns_children",
            "",
            NodeTree::default(),
            NodeTree::default(),
            Arc::new(move |_: &NodeTree, _: &NodeTree| {
                let mut child = Task::new(
                    None,
                    "generated_child",
                    "",
                    NodeTree::default(),
                    NodeTree::default(),
                    Arc::new(|_: &NodeTree, _: &NodeTree| Ok(vec![])),
                    "",
                );
                child.signature = "generated_child".to_string();
                Ok(vec![child])
            }),
            "",
        )
        .as_generator();
        task.signature = "spawns_children".to_string();

        let (outcome, generated) = executor.run(&mut task, None, &explanation(true)).unwrap();
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(generated.len(), 1);
        assert_eq!(generated[0].signature, child_signature);
        assert!(store.get_task_state("spawns_children").is_none());
    }

    #[test]
    fn cascade_failure_reaches_downstream_task() {
        let shared = Node::Path(PathNode::new("mid.txt"));
        let task_a = {
            let mut t = Task::new(
                None,
                "a",
                "",
                NodeTree::default(),
                NodeTree::leaf(shared.clone()),
                Arc::new(|_: &NodeTree, _: &NodeTree| Ok(vec![])),
                "",
            );
            t.signature = "a".to_string();
            t
        };
        let task_b = {
            let mut t = Task::new(
                None,
                "b",
                "",
                NodeTree::leaf(shared),
                NodeTree::default(),
                Arc::new(|_: &NodeTree, _: &NodeTree| Ok(vec![])),
                "",
            );
            t.signature = "b".to_string();
            t
        };

        let dag = build_dag(&[task_a, task_b]).unwrap();
        let reasons = cascade_failure(&dag, "a");
        assert_eq!(reasons.get("b"), Some(&"a".to_string()));
    }
}
