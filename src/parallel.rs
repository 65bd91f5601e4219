//! Rayon-driven scheduler adapter, gated behind the `parallel` feature.
//!
//! The scheduler and state store stay single-owner on the driver thread,
//! exactly as [`crate::session::run`] uses them; only task bodies — the
//! genuinely CPU- or I/O-bound work — run concurrently on the rayon pool.
//! Results flow back through an `mpsc` channel the driver drains before
//! touching the scheduler again.

use std::collections::HashMap;
use std::sync::mpsc::channel;

use camino::Utf8PathBuf;
use tracing::{debug, info, warn};

use crate::change::detect_changes;
use crate::config::RunConfig;
use crate::dag::build_dag;
use crate::error::{ResolvingError, RetaskError};
use crate::executor::{
    cascade_failure, create_product_directories, log_effective_filters, warn_on_casing_mismatches,
    write_task_state, Outcome,
};
use crate::node::NodeState;
use crate::provisional::{fold_generated_tasks, Resolver};
use crate::scheduler::Scheduler;
use crate::change::StalenessExplanation;
use crate::session::RunReport;
use crate::store::StateStore;
use crate::task::{Task, TaskId, WarningFilter};

pub fn run(
    root: impl Into<Utf8PathBuf>,
    mut tasks: Vec<Task>,
    config: &RunConfig,
) -> Result<RunReport, RetaskError> {
    let root = root.into();
    let mut store = StateStore::open(&root)?;
    let global_filters = WarningFilter::parse_all(&config.filterwarnings)?;
    let mut resolver = Resolver::default();
    let mut report = RunReport::default();
    let mut ancestor_failures: HashMap<TaskId, String> = HashMap::new();
    let mut failure_count = 0usize;
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

        let mut rebuild_needed = false;

        while scheduler.is_active() {
            let ready = scheduler.get_ready(rayon::current_num_threads().max(1));
            if ready.is_empty() {
                break;
            }

            let (sender, receiver) = channel::<(TaskId, Outcome, Vec<Task>)>();
            let mut abort_error: Option<ResolvingError> = None;

            rayon::scope(|scope| {
                for task_id in &ready {
                    if abort_error.is_some() {
                        break;
                    }

                    let Some(task_idx) = tasks.iter().position(|t| &t.signature == task_id) else {
                        continue;
                    };

                    let ancestor_failure = ancestor_failures.get(task_id).cloned();
                    let explanation = explanations
                        .get(task_id)
                        .cloned()
                        .unwrap_or_else(|| default_explanation(task_id));

                    if let Some(reason) = ancestor_failure {
                        sender
                            .send((
                                task_id.clone(),
                                Outcome::SkippedAncestorFailed { reason },
                                Vec::new(),
                            ))
                            .unwrap();
                        continue;
                    }

                    if let Some(reason) = tasks[task_idx].skip_ancestor_failed_reason() {
                        sender
                            .send((
                                task_id.clone(),
                                Outcome::SkippedAncestorFailed {
                                    reason: reason.to_string(),
                                },
                                Vec::new(),
                            ))
                            .unwrap();
                        continue;
                    }

                    if tasks[task_idx].is_skip() || tasks[task_idx].skip_if_reason().is_some() {
                        sender
                            .send((task_id.clone(), Outcome::Skipped, Vec::new()))
                            .unwrap();
                        continue;
                    }

                    if explanation.persist_refresh && !config.force {
                        sender
                            .send((task_id.clone(), Outcome::Persisted, Vec::new()))
                            .unwrap();
                        continue;
                    }

                    if !explanation.stale && !config.force {
                        sender
                            .send((task_id.clone(), Outcome::SkippedUnchanged, Vec::new()))
                            .unwrap();
                        continue;
                    }

                    if config.dry_run {
                        sender
                            .send((task_id.clone(), Outcome::WouldBeExecuted, Vec::new()))
                            .unwrap();
                        continue;
                    }

                    if config.check_casing_of_paths {
                        warn_on_casing_mismatches(&tasks[task_idx].depends_on);
                    }

                    if let Err(err) = resolver.resolve_dependencies(&mut tasks[task_idx]) {
                        abort_error = Some(err);
                        break;
                    }

                    let missing_dep = tasks[task_idx]
                        .depends_on
                        .walk()
                        .into_iter()
                        .find(|(_, n)| !matches!(n.state(), Ok(NodeState::Hash(_)) | Ok(NodeState::SizeAndMtime { .. }) | Ok(NodeState::Random(_))));
                    if let Some((_, node)) = missing_dep {
                        sender
                            .send((
                                task_id.clone(),
                                Outcome::Failed {
                                    reason: format!("missing dependency `{}`", node.signature()),
                                },
                                Vec::new(),
                            ))
                            .unwrap();
                        continue;
                    }

                    create_product_directories(&tasks[task_idx]);

                    log_effective_filters(&tasks[task_idx], &global_filters);

                    let task_id = task_id.clone();
                    let sender = sender.clone();
                    let function = tasks[task_idx].function.clone();
                    let depends_on = tasks[task_idx].depends_on.clone();
                    let produces = tasks[task_idx].produces.clone();

                    scope.spawn(move |_| {
                        let result = function.call(&depends_on, &produces);
                        match result {
                            Ok(generated) => {
                                sender.send((task_id, Outcome::Success, generated)).unwrap();
                            }
                            Err(err) => {
                                sender
                                    .send((
                                        task_id,
                                        Outcome::Failed {
                                            reason: err.to_string(),
                                        },
                                        Vec::new(),
                                    ))
                                    .unwrap();
                            }
                        }
                    });
                }
            });
            drop(sender);

            if let Some(err) = abort_error {
                warn!("aborting run: resolving error");
                store.flush()?;
                return Err(RetaskError::Resolving(err));
            }

            let mut finished = Vec::new();
            for (task_id, mut outcome, generated) in receiver {
                let task_idx = tasks.iter().position(|t| t.signature == task_id);

                if let (Outcome::Success, Some(task_idx)) = (&outcome, task_idx) {
                    if let Err(err) = resolver.resolve_products(&mut tasks[task_idx]) {
                        warn!("aborting run: resolving error");
                        store.flush()?;
                        return Err(RetaskError::Resolving(err));
                    }

                    if config.check_casing_of_paths {
                        warn_on_casing_mismatches(&tasks[task_idx].produces);
                    }

                    let missing_product = tasks[task_idx]
                        .produces
                        .walk()
                        .into_iter()
                        .find(|(_, n)| !matches!(n.state(), Ok(NodeState::Hash(_)) | Ok(NodeState::SizeAndMtime { .. }) | Ok(NodeState::Random(_))));
                    if let Some((_, node)) = missing_product {
                        outcome = Outcome::Failed {
                            reason: format!("missing product `{}`", node.signature()),
                        };
                    } else if !tasks[task_idx].is_generator {
                        if let Err(err) = write_task_state(&mut store, &tasks[task_idx]) {
                            outcome = Outcome::Failed {
                                reason: err.to_string(),
                            };
                        }
                    }
                }

                if let Outcome::Failed { .. } = &outcome {
                    failure_count += 1;
                    warn!(task = %task_id, "task failed");
                    for (descendant, reason) in cascade_failure(&dag, &task_id) {
                        ancestor_failures.entry(descendant).or_insert(reason);
                    }
                }

                if resolver.needs_rebuild(&task_id) || !generated.is_empty() {
                    rebuild_needed = true;
                    fold_generated_tasks(&mut tasks, generated);
                }

                info!(task = %task_id, outcome = outcome.as_str(), "task finished");
                report.outcomes.push((task_id.clone(), outcome));
                finished.push(task_id);
            }

            scheduler.done(&finished);

            if failure_count >= config.effective_max_failures() {
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

fn default_explanation(task_id: &str) -> StalenessExplanation {
    StalenessExplanation {
        task_id: task_id.to_string(),
        stale: true,
        persist_refresh: false,
        signals: Vec::new(),
    }
}
