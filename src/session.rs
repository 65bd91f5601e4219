//! Top-level run orchestration: collection -> DAG build -> change detection
//! -> scheduling -> execution -> state persistence, with mid-run DAG
//! rebuilds when a task resolves provisional nodes or generates further
//! tasks. This is the single entry point a frontend drives; everything else
//! in the crate is a building block it composes.

use std::collections::HashMap;

use camino::Utf8PathBuf;
use tracing::{debug, info, warn};

use crate::change::detect_changes;
use crate::config::RunConfig;
use crate::dag::{build_dag, Dag};
use crate::error::{RetaskError, TaskError};
use crate::executor::{cascade_failure, Executor, Outcome};
use crate::provisional::{fold_generated_tasks, Resolver};
use crate::scheduler::Scheduler;
use crate::store::StateStore;
use crate::task::{Task, TaskId, WarningFilter};

/// The outcome of a whole run: one [`Outcome`] per task, in the order each
/// task finished.
#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<(TaskId, Outcome)>,
}

impl RunReport {
    pub fn failures(&self) -> impl Iterator<Item = &(TaskId, Outcome)> {
        self.outcomes.iter().filter(|(_, o)| o.is_failure())
    }

    pub fn exit_code(&self) -> i32 {
        if self.failures().next().is_some() {
            1
        } else {
            0
        }
    }
}

/// Runs every task in `tasks` to completion against the state store rooted
/// at `root`, honoring `config`. Consumes `tasks` because generator tasks
/// append further tasks to the working set as the run progresses.
pub fn run(root: impl Into<Utf8PathBuf>, mut tasks: Vec<Task>, config: &RunConfig) -> Result<RunReport, RetaskError> {
    let root = root.into();
    let mut store = StateStore::open(&root)?;
    let global_filters = WarningFilter::parse_all(&config.filterwarnings)?;
    let mut resolver = Resolver::default();
    let mut report = RunReport::default();
    let mut ancestor_failures: HashMap<TaskId, String> = HashMap::new();
    let mut previous_scheduler: Option<Scheduler> = None;

    loop {
        let dag = build_dag(&tasks)?;
        debug!(task_count = tasks.len(), "dag built");

        let explanations = detect_changes(&dag, &tasks, &store, config.force);
        let mut scheduler = match &previous_scheduler {
            Some(previous) => Scheduler::from_dag_and_sorter(&dag, &tasks, previous),
            None => Scheduler::new(&dag, &tasks),
        };
        scheduler.prepare();

        let mut executor = Executor::new(&mut store, config, &global_filters);
        let mut rebuild_needed = false;
        let mut finished_this_pass: Vec<TaskId> = Vec::new();

        while scheduler.is_active() {
            let ready = scheduler.get_ready(usize::MAX);
            if ready.is_empty() {
                break;
            }

            for task_id in &ready {
                let Some(task) = tasks.iter_mut().find(|t| &t.signature == task_id) else {
                    continue;
                };
                let ancestor_failure = ancestor_failures.get(task_id).map(String::as_str);
                let explanation = explanations
                    .get(task_id)
                    .cloned()
                    .unwrap_or_else(|| default_explanation(task_id));

                info!(task = %task.base_name, "running task");
                let (outcome, generated) = match executor.run(task, ancestor_failure, &explanation) {
                    Ok(result) => result,
                    Err(TaskError::Resolving(err)) => {
                        warn!("aborting run: resolving error");
                        store.flush()?;
                        return Err(RetaskError::Resolving(err));
                    }
                    Err(err) => (Outcome::Failed { reason: err.to_string() }, Vec::new()),
                };

                if let Outcome::Failed { .. } = &outcome {
                    warn!(task = %task.base_name, "task failed");
                    for (descendant, reason) in cascade_failure(&dag, task_id) {
                        ancestor_failures.entry(descendant).or_insert(reason);
                    }
                }

                if !generated.is_empty() {
                    rebuild_needed = true;
                    fold_generated_tasks(&mut tasks, generated);
                }
                if resolver.needs_rebuild(task_id) {
                    rebuild_needed = true;
                }

                report.outcomes.push((task_id.clone(), outcome));
                finished_this_pass.push(task_id.clone());
            }

            scheduler.done(&finished_this_pass);
            finished_this_pass.clear();

            if executor.should_stop() {
                warn!("stopping run: failure limit reached");
                store.flush()?;
                return Ok(report);
            }

            if rebuild_needed {
                break;
            }
        }

        if !rebuild_needed {
            break;
        }
        debug!("rebuilding dag after provisional resolution or task generation");
        previous_scheduler = Some(scheduler);
    }

    if config.clean_lockfile {
        let known: std::collections::HashSet<&str> =
            tasks.iter().map(|t| t.signature.as_str()).collect();
        store.retain_tasks(|id| known.contains(id));
    }

    store.flush()?;
    Ok(report)
}

fn default_explanation(task_id: &str) -> crate::change::StalenessExplanation {
    crate::change::StalenessExplanation {
        task_id: task_id.to_string(),
        stale: true,
        persist_refresh: false,
        signals: Vec::new(),
    }
}
