//! Priority-aware topological scheduler over the task-restricted DAG: an
//! explicit `get_ready`/`done` pull protocol so a driver (sequential here,
//! or a `parallel`-feature worker pool) controls dispatch, rather than the
//! scheduler dispatching work itself.

use std::collections::{HashMap, HashSet};

use petgraph::graph::NodeIndex;

use crate::dag::{Dag, DagNode};
use crate::task::{Task, TaskId};

pub struct Scheduler {
    /// Remaining in-degree within the task-only edge set (an edge task_a ->
    /// task_b exists iff task_a produces a node task_b depends on).
    remaining_in_degree: HashMap<NodeIndex, usize>,
    dependents: HashMap<NodeIndex, Vec<NodeIndex>>,
    priority: HashMap<NodeIndex, i8>,
    insertion_order: HashMap<NodeIndex, usize>,
    in_flight: HashSet<NodeIndex>,
    finished: HashSet<TaskId>,
    index_to_task_id: HashMap<NodeIndex, TaskId>,
    prepared: bool,
}

impl Scheduler {
    pub fn new(dag: &Dag, tasks: &[Task]) -> Self {
        Self::build(dag, tasks, HashSet::new())
    }

    fn build(dag: &Dag, tasks: &[Task], finished: HashSet<TaskId>) -> Self {
        let priority_by_id: HashMap<&str, i8> =
            tasks.iter().map(|t| (t.signature.as_str(), t.priority())).collect();

        let task_indices: Vec<NodeIndex> = dag
            .graph
            .node_indices()
            .filter(|&idx| matches!(dag.node_at(idx), DagNode::Task(_)))
            .collect();

        let mut index_to_task_id = HashMap::new();
        let mut insertion_order = HashMap::new();
        let mut priority = HashMap::new();

        for (order, &idx) in task_indices.iter().enumerate() {
            let DagNode::Task(id) = dag.node_at(idx) else {
                unreachable!()
            };
            index_to_task_id.insert(idx, id.clone());
            insertion_order.insert(idx, order);
            priority.insert(idx, priority_by_id.get(id.as_str()).copied().unwrap_or(0));
        }

        let task_task_edges = |from: NodeIndex| -> Vec<NodeIndex> {
            dag.dependents_of(from)
                .flat_map(|node_idx| dag.dependents_of(node_idx))
                .filter(|&t| index_to_task_id.contains_key(&t) && !finished.contains(&index_to_task_id[&t]))
                .collect()
        };

        let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        let mut remaining_in_degree: HashMap<NodeIndex, usize> = HashMap::new();

        for &idx in &task_indices {
            if finished.contains(&index_to_task_id[&idx]) {
                continue;
            }
            let successors = task_task_edges(idx);
            for succ in &successors {
                dependents.entry(idx).or_default().push(*succ);
            }
        }

        for &idx in &task_indices {
            if finished.contains(&index_to_task_id[&idx]) {
                continue;
            }
            let in_degree = dag
                .dependencies_of(idx)
                .flat_map(|node_idx| dag.dependencies_of(node_idx))
                .filter(|&t| index_to_task_id.contains_key(&t) && !finished.contains(&index_to_task_id[&t]))
                .count();
            remaining_in_degree.insert(idx, in_degree);
        }

        Scheduler {
            remaining_in_degree,
            dependents,
            priority,
            insertion_order,
            in_flight: HashSet::new(),
            finished,
            index_to_task_id,
            prepared: false,
        }
    }

    /// Validates the restricted graph is acyclic (it always is, inheriting
    /// from the already-validated full DAG) and marks the scheduler ready.
    pub fn prepare(&mut self) {
        self.prepared = true;
    }

    /// Returns up to `n` ready tasks: in-degree 0, neither in-flight nor
    /// finished. Higher priority first; ties broken by insertion order.
    pub fn get_ready(&mut self, n: usize) -> Vec<TaskId> {
        let mut candidates: Vec<NodeIndex> = self
            .remaining_in_degree
            .iter()
            .filter(|(idx, &deg)| {
                deg == 0
                    && !self.in_flight.contains(idx)
                    && !self.finished.contains(&self.index_to_task_id[idx])
            })
            .map(|(&idx, _)| idx)
            .collect();

        candidates.sort_by(|a, b| {
            let pa = self.priority.get(a).copied().unwrap_or(0);
            let pb = self.priority.get(b).copied().unwrap_or(0);
            pb.cmp(&pa)
                .then_with(|| self.insertion_order[a].cmp(&self.insertion_order[b]))
        });

        candidates.truncate(n);
        for &idx in &candidates {
            self.in_flight.insert(idx);
        }

        candidates
            .into_iter()
            .map(|idx| self.index_to_task_id[&idx].clone())
            .collect()
    }

    /// Marks the given tasks finished; their successors lose an in-edge.
    pub fn done(&mut self, task_ids: &[TaskId]) {
        for task_id in task_ids {
            self.finished.insert(task_id.clone());
            let Some(&idx) = self.index_to_task_id.iter().find_map(|(idx, id)| {
                (id == task_id).then_some(idx)
            }) else {
                continue;
            };
            self.in_flight.remove(&idx);

            if let Some(successors) = self.dependents.get(&idx) {
                for &succ in successors {
                    if let Some(deg) = self.remaining_in_degree.get_mut(&succ) {
                        *deg = deg.saturating_sub(1);
                    }
                }
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.index_to_task_id
            .keys()
            .any(|idx| !self.finished.contains(&self.index_to_task_id[idx]))
    }

    /// Rebuilds the scheduler over `new_dag`, preserving `finished` tasks
    /// from the previous instance — used after a mid-run DAG rebuild
    /// triggered by provisional resolution or a task generator.
    pub fn from_dag_and_sorter(new_dag: &Dag, tasks: &[Task], previous: &Scheduler) -> Self {
        Self::build(new_dag, tasks, previous.finished.clone())
    }
}
