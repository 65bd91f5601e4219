//! Persistent state store: an append-only journal plus a consolidated
//! snapshot. State must survive the process between runs, so the
//! snapshot/journal pair is the on-disk record of what each task last saw.

use std::collections::HashMap;
use std::io::Write as _;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, InternalError};
use crate::node::NodeState;
use crate::task::{NodeId, TaskId};

pub const CURRENT_LOCK_VERSION: &str = "1.0";
const LOCKFILE_NAME: &str = "pytask.lock";
const JOURNAL_NAME: &str = "pytask.lock.journal";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateValue {
    pub value: String,
}

impl From<NodeState> for StateValue {
    fn from(state: NodeState) -> Self {
        let value = match state {
            NodeState::Absent => String::new(),
            NodeState::Hash(hash) => hash.to_hex(),
            NodeState::SizeAndMtime { len, mtime_nanos } => format!("{len}:{mtime_nanos}"),
            NodeState::Random(token) => format!("random:{token}"),
        };
        StateValue { value }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: NodeId,
    pub state: StateValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEntry {
    pub id: TaskId,
    pub state: StateValue,
    #[serde(default)]
    pub depends_on: Vec<NodeEntry>,
    #[serde(default)]
    pub produces: Vec<NodeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Snapshot {
    #[serde(rename = "lock-version")]
    lock_version: String,
    #[serde(default, rename = "task")]
    tasks: Vec<TaskEntry>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot {
            lock_version: CURRENT_LOCK_VERSION.to_string(),
            tasks: Vec::new(),
        }
    }
}

/// Holds per-(task, node) state across runs. `open` replays the journal over
/// the snapshot so a crash between a journal append and the next flush never
/// loses an update; `update_task` keeps both the in-memory index and the
/// on-disk journal coherent, skipping the write entirely when nothing
/// actually changed.
pub struct StateStore {
    root: Utf8PathBuf,
    entries: HashMap<TaskId, TaskEntry>,
    journal: Option<std::fs::File>,
}

impl StateStore {
    pub fn open(root_dir: impl Into<Utf8PathBuf>) -> Result<Self, InternalError> {
        let root = root_dir.into();
        let lockfile_path = root.join(LOCKFILE_NAME);
        let journal_path = root.join(JOURNAL_NAME);

        let mut entries = HashMap::new();

        if lockfile_path.exists() {
            let text = std::fs::read_to_string(&lockfile_path)?;
            let snapshot: Snapshot = toml::from_str(&text)?;
            check_version(&snapshot.lock_version)?;
            for task in snapshot.tasks {
                entries.insert(task.id.clone(), task);
            }
        }

        if journal_path.exists() {
            replay_journal(&journal_path, &mut entries)?;
        }

        let journal = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)?;

        Ok(StateStore {
            root,
            entries,
            journal: Some(journal),
        })
    }

    pub fn get_task_state(&self, task_id: &str) -> Option<&StateValue> {
        self.entries.get(task_id).map(|t| &t.state)
    }

    pub fn get_node_state(&self, task_id: &str, node_id: &str) -> Option<&StateValue> {
        let task = self.entries.get(task_id)?;
        if task.id == node_id {
            return Some(&task.state);
        }
        task.depends_on
            .iter()
            .chain(task.produces.iter())
            .find(|n| n.id == node_id)
            .map(|n| &n.state)
    }

    /// Replaces the entry for `task_id`, appending a journal record, unless
    /// the new entry is byte-identical to the existing one (idempotence: a
    /// no-op rerun never dirties the journal).
    pub fn update_task(&mut self, entry: TaskEntry) -> Result<(), InternalError> {
        if let Some(existing) = self.entries.get(&entry.id) {
            if entries_equal(existing, &entry) {
                return Ok(());
            }
        }

        let line = serde_json::to_string(&entry)?;
        if let Some(journal) = &mut self.journal {
            writeln!(journal, "{line}")?;
            journal.flush()?;
        }

        self.entries.insert(entry.id.clone(), entry);
        Ok(())
    }

    /// Drops entries for tasks not present in `keep`, used by
    /// `clean_lockfile` after a successful run.
    pub fn retain_tasks(&mut self, keep: impl Fn(&str) -> bool) {
        self.entries.retain(|id, _| keep(id));
    }

    /// Writes the consolidated snapshot (entries sorted by id; dep/prod
    /// entries sorted by id within each task) and deletes the journal.
    pub fn flush(&mut self) -> Result<(), InternalError> {
        let mut tasks: Vec<TaskEntry> = self.entries.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        for task in &mut tasks {
            task.depends_on.sort_by(|a, b| a.id.cmp(&b.id));
            task.produces.sort_by(|a, b| a.id.cmp(&b.id));
        }

        let snapshot = Snapshot {
            lock_version: CURRENT_LOCK_VERSION.to_string(),
            tasks,
        };

        let text = toml::to_string_pretty(&snapshot)?;
        let tmp_path = self.root.join(format!("{LOCKFILE_NAME}.tmp"));
        let final_path = self.root.join(LOCKFILE_NAME);
        std::fs::write(&tmp_path, text)?;
        std::fs::rename(&tmp_path, &final_path)?;

        let journal_path = self.root.join(JOURNAL_NAME);
        if journal_path.exists() {
            std::fs::remove_file(&journal_path)?;
        }
        self.journal = Some(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&journal_path)?,
        );

        Ok(())
    }

    pub fn close(mut self) -> Result<(), InternalError> {
        self.flush()
    }
}

fn entries_equal(a: &TaskEntry, b: &TaskEntry) -> bool {
    serde_json::to_string(a).ok() == serde_json::to_string(b).ok()
}

fn check_version(found: &str) -> Result<(), InternalError> {
    // Version comparison is lexicographic on "major.minor" strings, matching
    // the single-digit scheme the format currently uses.
    if found > CURRENT_LOCK_VERSION {
        return Err(InternalError::CorruptSnapshot(format!(
            "lockfile version {found} is newer than supported {CURRENT_LOCK_VERSION}"
        )));
    }
    Ok(())
}

/// Returns a `ConfigError` specifically for the version-too-new case,
/// distinguished at the call site that owns configuration-level errors.
pub fn check_version_for_open(found: &str) -> Result<(), ConfigError> {
    if found > CURRENT_LOCK_VERSION {
        return Err(ConfigError::LockfileVersionTooNew {
            found: found.to_string(),
            current: CURRENT_LOCK_VERSION.to_string(),
        });
    }
    Ok(())
}

/// Replays journal lines over `entries`. Lines are applied in file order; a
/// line that fails to parse ends replay at that point — a valid prefix is
/// authoritative, the trailing bytes are assumed to be a torn write from a
/// crash mid-append.
fn replay_journal(
    path: &Utf8Path,
    entries: &mut HashMap<TaskId, TaskEntry>,
) -> Result<(), InternalError> {
    let text = std::fs::read_to_string(path.as_std_path())?;
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TaskEntry>(line) {
            Ok(entry) => {
                entries.insert(entry.id.clone(), entry);
            }
            Err(_) => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, value: &str) -> TaskEntry {
        TaskEntry {
            id: id.to_string(),
            state: StateValue {
                value: value.to_string(),
            },
            depends_on: vec![NodeEntry {
                id: "in.txt".to_string(),
                state: StateValue {
                    value: "dephash".to_string(),
                },
            }],
            produces: vec![NodeEntry {
                id: "out.txt".to_string(),
                state: StateValue {
                    value: "prodhash".to_string(),
                },
            }],
        }
    }

    #[test]
    fn open_on_empty_dir_starts_blank() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let store = StateStore::open(&root).unwrap();
        assert!(store.get_task_state("anything").is_none());
    }

    #[test]
    fn update_then_flush_then_reopen_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let mut store = StateStore::open(&root).unwrap();
        store.update_task(entry("task_a", "h1")).unwrap();
        store.flush().unwrap();

        let reopened = StateStore::open(&root).unwrap();
        assert_eq!(reopened.get_task_state("task_a").unwrap().value, "h1");
        assert_eq!(
            reopened.get_node_state("task_a", "out.txt").unwrap().value,
            "prodhash"
        );
    }

    #[test]
    fn idempotent_update_does_not_append_journal() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let mut store = StateStore::open(&root).unwrap();
        store.update_task(entry("task_a", "h1")).unwrap();
        store.flush().unwrap();

        store.update_task(entry("task_a", "h1")).unwrap();
        let journal_path = root.join(JOURNAL_NAME);
        let journal_contents = std::fs::read_to_string(&journal_path).unwrap_or_default();
        assert!(journal_contents.trim().is_empty());
    }

    #[test]
    fn crash_after_journal_write_recovers_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        {
            let mut store = StateStore::open(&root).unwrap();
            store.update_task(entry("task_a", "h1")).unwrap();
            // No flush: simulates a crash with only the journal on disk.
        }

        let reopened = StateStore::open(&root).unwrap();
        assert_eq!(reopened.get_task_state("task_a").unwrap().value, "h1");
    }
}
