//! The task model.
//!
//! A [`Task`] is a unit of work: a callable body plus typed dependency and
//! product trees. Tasks are identified by a stable [`Task::signature`]
//! derived from their source path, base name and parametrization id —
//! never by memory address or insertion order, so two runs of the same
//! project agree on identity.

use std::collections::HashMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::ConfigError;
use crate::tree::NodeTree;

pub type TaskId = String;
pub type NodeId = String;

/// The callable body of a task. Receives the resolved dependency tree (for
/// reading) and the product tree (for calling `.save` on output nodes), and
/// may return freshly constructed [`Task`]s — the mechanism behind task
/// generators: a normal task whose body yields further tasks to fold into
/// the run.
pub trait TaskBody: Send + Sync {
    fn call(&self, depends_on: &NodeTree, produces: &NodeTree) -> anyhow::Result<Vec<Task>>;
}

impl<F> TaskBody for F
where
    F: Fn(&NodeTree, &NodeTree) -> anyhow::Result<Vec<Task>> + Send + Sync,
{
    fn call(&self, depends_on: &NodeTree, produces: &NodeTree) -> anyhow::Result<Vec<Task>> {
        self(depends_on, produces)
    }
}

/// Markers accepted by the core; anything else is inert metadata a
/// frontend may attach.
#[derive(Debug, Clone)]
pub enum Marker {
    Skip,
    SkipIf { condition: bool, reason: String },
    /// Internal: seeded by change detection to bypass execution.
    SkipUnchanged,
    /// Internal: seeded by the executor on a predecessor's failure.
    SkipAncestorFailed { reason: String },
    Persist,
    TryFirst,
    TryLast,
    FilterWarnings(Vec<WarningFilter>),
}

impl Marker {
    pub fn canonical_form(markers: &[Marker]) -> String {
        // Deterministic textual form used as part of the task-body hash;
        // ordering is preserved since marker order is meaningful (e.g.
        // filter precedence).
        markers
            .iter()
            .map(|m| format!("{m:?}"))
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// A structural stand-in for `warnings.filterwarnings`-style filtering:
/// matches a warning by message pattern and/or category, applying `action`
/// when it matches.
#[derive(Debug, Clone)]
pub struct WarningFilter {
    pub action: FilterAction,
    pub message: Option<Regex>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Ignore,
    Error,
    Always,
    Once,
}

impl WarningFilter {
    /// Parses an `action:message:category` config-level filter spec (the
    /// `filterwarnings` run-config analogue of a `FilterWarnings` marker);
    /// `message`/`category` may be left empty to match anything.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let mut parts = spec.split(':');
        let action = match parts.next().unwrap_or("") {
            "ignore" => FilterAction::Ignore,
            "error" => FilterAction::Error,
            "always" => FilterAction::Always,
            "once" => FilterAction::Once,
            other => {
                return Err(ConfigError::IncompatibleOptions(format!(
                    "unknown filterwarnings action `{other}` in spec `{spec}`"
                )));
            }
        };
        let message = match parts.next() {
            Some(pattern) if !pattern.is_empty() => Some(Regex::new(pattern).map_err(|e| {
                ConfigError::IncompatibleOptions(format!(
                    "invalid filterwarnings message pattern `{pattern}`: {e}"
                ))
            })?),
            _ => None,
        };
        let category = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
        Ok(WarningFilter {
            action,
            message,
            category,
        })
    }

    /// Parses every spec in `specs`, in order.
    pub fn parse_all(specs: &[String]) -> Result<Vec<Self>, ConfigError> {
        specs.iter().map(|s| Self::parse(s)).collect()
    }
}

#[derive(Debug, Clone)]
pub enum AttributeValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

#[derive(Debug, Clone)]
pub struct ReportSection {
    pub label: String,
    pub content: String,
}

pub struct Task {
    pub signature: TaskId,
    pub base_name: String,
    pub path: Option<Utf8PathBuf>,
    pub depends_on: NodeTree,
    pub produces: NodeTree,
    pub function: Arc<dyn TaskBody>,
    pub markers: Vec<Marker>,
    pub attributes: HashMap<String, AttributeValue>,
    pub report_sections: Vec<ReportSection>,
    /// `true` for a task whose body produces further `Task` values that the
    /// resolver should fold into the session. Generator tasks never write
    /// state, so a rerun always regenerates their children.
    pub is_generator: bool,
    /// Source text of `function`, combined with the markers' canonical form
    /// to produce the task-state hash.
    pub source_text: String,
}

impl Task {
    /// Builds the task signature:
    /// `sha256(path_posix || "::" || base_name || "::" || param_id)`.
    /// Path-less tasks use `"::" || base_name` as the stem.
    ///
    /// This hex digest is used uniformly as the `TaskId` everywhere — in
    /// the DAG, the state store index, and the lockfile/journal `id` field
    /// (see DESIGN.md for why the on-disk id is this hash rather than a
    /// raw path::name string).
    pub fn compute_signature(path: Option<&Utf8Path>, base_name: &str, param_id: &str) -> TaskId {
        let stem = match path {
            Some(p) => format!("{}::{base_name}", p.as_str()),
            None => format!("::{base_name}"),
        };
        let full = format!("{stem}::{param_id}");

        let mut hasher = Sha256::new();
        hasher.update(full.as_bytes());
        let digest = hasher.finalize();
        hex_encode(&digest)
    }

    pub fn new(
        path: Option<Utf8PathBuf>,
        base_name: impl Into<String>,
        param_id: &str,
        depends_on: NodeTree,
        produces: NodeTree,
        function: Arc<dyn TaskBody>,
        source_text: impl Into<String>,
    ) -> Self {
        let base_name = base_name.into();
        let signature = Self::compute_signature(path.as_deref(), &base_name, param_id);
        Self {
            signature,
            base_name,
            path,
            depends_on,
            produces,
            function,
            markers: Vec::new(),
            attributes: HashMap::new(),
            report_sections: Vec::new(),
            is_generator: false,
            source_text: source_text.into(),
        }
    }

    pub fn with_marker(mut self, marker: Marker) -> Self {
        self.markers.push(marker);
        self
    }

    /// Marks this task as a generator: its body may return further `Task`
    /// values to fold into the session, and the executor never writes state
    /// for it on success, so a rerun always regenerates its children.
    pub fn as_generator(mut self) -> Self {
        self.is_generator = true;
        self
    }

    pub fn has_marker(&self, predicate: impl Fn(&Marker) -> bool) -> bool {
        self.markers.iter().any(predicate)
    }

    pub fn is_skip(&self) -> bool {
        self.has_marker(|m| matches!(m, Marker::Skip))
    }

    pub fn skip_if_reason(&self) -> Option<&str> {
        self.markers.iter().find_map(|m| match m {
            Marker::SkipIf {
                condition: true,
                reason,
            } => Some(reason.as_str()),
            _ => None,
        })
    }

    pub fn skip_unchanged(&self) -> bool {
        self.has_marker(|m| matches!(m, Marker::SkipUnchanged))
    }

    pub fn skip_ancestor_failed_reason(&self) -> Option<&str> {
        self.markers.iter().find_map(|m| match m {
            Marker::SkipAncestorFailed { reason } => Some(reason.as_str()),
            _ => None,
        })
    }

    pub fn persists(&self) -> bool {
        self.has_marker(|m| matches!(m, Marker::Persist))
    }

    /// Priority recoding used by the scheduler:
    /// `try_first = +1, none = 0, try_last = -1`.
    pub fn priority(&self) -> i8 {
        let try_first = self.has_marker(|m| matches!(m, Marker::TryFirst));
        let try_last = self.has_marker(|m| matches!(m, Marker::TryLast));
        match (try_first, try_last) {
            (true, false) => 1,
            (false, true) => -1,
            _ => 0,
        }
    }

    pub fn has_conflicting_priority(&self) -> bool {
        let try_first = self.has_marker(|m| matches!(m, Marker::TryFirst));
        let try_last = self.has_marker(|m| matches!(m, Marker::TryLast));
        try_first && try_last
    }

    pub fn active_filters(&self) -> Vec<&WarningFilter> {
        self.markers
            .iter()
            .filter_map(|m| match m {
                Marker::FilterWarnings(filters) => Some(filters.iter()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// This task's own `FilterWarnings` markers, followed by the run-wide
    /// `filterwarnings` config filters: task-specific filters are checked
    /// first, matching `filterwarnings`'s most-specific-wins precedence.
    pub fn effective_filters<'a>(&'a self, global: &'a [WarningFilter]) -> Vec<&'a WarningFilter> {
        let mut filters = self.active_filters();
        filters.extend(global.iter());
        filters
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0xF) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_stable_across_calls() {
        let a = Task::compute_signature(Some(Utf8Path::new("tasks/foo.rs")), "task_a", "");
        let b = Task::compute_signature(Some(Utf8Path::new("tasks/foo.rs")), "task_a", "");
        assert_eq!(a, b);
    }

    #[test]
    fn signature_differs_by_param_id() {
        let a = Task::compute_signature(Some(Utf8Path::new("tasks/foo.rs")), "task_a", "1");
        let b = Task::compute_signature(Some(Utf8Path::new("tasks/foo.rs")), "task_a", "2");
        assert_ne!(a, b);
    }

    #[test]
    fn pathless_task_uses_double_colon_stem() {
        let with_path = Task::compute_signature(Some(Utf8Path::new("::")), "task_a", "");
        let without_path = Task::compute_signature(None, "task_a", "");
        // Not expected to collide in practice; this just checks both compute.
        assert_ne!(with_path.len(), 0);
        assert_ne!(without_path.len(), 0);
    }

    #[test]
    fn priority_conflict_detected() {
        let task = Task::new(
            None,
            "t",
            "",
            NodeTree::default(),
            NodeTree::default(),
            Arc::new(|_: &NodeTree, _: &NodeTree| Ok(vec![])),
            "",
        )
        .with_marker(Marker::TryFirst)
        .with_marker(Marker::TryLast);

        assert!(task.has_conflicting_priority());
    }

    #[test]
    fn warning_filter_parse_reads_action_message_category() {
        let filter = WarningFilter::parse("ignore:deprecated.*:legacy").unwrap();
        assert_eq!(filter.action, FilterAction::Ignore);
        assert!(filter.message.unwrap().is_match("deprecated.thing"));
        assert_eq!(filter.category.as_deref(), Some("legacy"));
    }

    #[test]
    fn warning_filter_parse_rejects_unknown_action() {
        assert!(WarningFilter::parse("nonsense:x:y").is_err());
    }

    #[test]
    fn effective_filters_prefers_task_specific_over_global() {
        let task_filter = WarningFilter {
            action: FilterAction::Error,
            message: None,
            category: None,
        };
        let task = Task::new(
            None,
            "t",
            "",
            NodeTree::default(),
            NodeTree::default(),
            Arc::new(|_: &NodeTree, _: &NodeTree| Ok(vec![])),
            "",
        )
        .with_marker(Marker::FilterWarnings(vec![task_filter]));

        let global = vec![WarningFilter::parse("ignore::").unwrap()];
        let effective = task.effective_filters(&global);
        assert_eq!(effective.len(), 2);
        assert_eq!(effective[0].action, FilterAction::Error);
        assert_eq!(effective[1].action, FilterAction::Ignore);
    }
}
