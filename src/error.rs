//! Error taxonomy.
//!
//! Each kind of failure gets its own `thiserror`-derived enum, nested under
//! the top-level [`RetaskError`]. `configuration`, `collection`, `dag` and
//! `resolving` errors are the ones the run aborts on immediately;
//! `setup`/`execution`/`teardown` surface as a failing
//! [`crate::executor::Outcome`] instead and never reach this type; `internal`
//! errors (state-store I/O, hashing) are always fatal.

use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetaskError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("collection error: {0}")]
    Collection(#[from] CollectionError),

    #[error(transparent)]
    Dag(#[from] DagError),

    #[error(transparent)]
    Resolving(#[from] ResolvingError),

    #[error(transparent)]
    Internal(#[from] InternalError),
}

impl RetaskError {
    /// The process exit code contract with the (out-of-scope) CLI frontend.
    pub fn exit_code(&self) -> i32 {
        match self {
            RetaskError::Configuration(_) => 2,
            RetaskError::Collection(_) => 3,
            RetaskError::Dag(_) => 4,
            RetaskError::Resolving(_) => 5,
            RetaskError::Internal(_) => 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("lockfile version {found} is newer than the supported version {current}")]
    LockfileVersionTooNew { found: String, current: String },

    #[error("incompatible options: {0}")]
    IncompatibleOptions(String),
}

#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("task source at `{path}` could not be collected: {reason}")]
    Unreadable { path: Utf8PathBuf, reason: String },
}

/// Failures raised while assembling or validating the task graph.
#[derive(Debug, Error)]
pub enum DagError {
    #[error("a task may not carry both try_first and try_last: {0}")]
    ConflictingPriority(String),

    #[error("cycle detected in task graph: {0:?}")]
    Cycle(Vec<String>),

    #[error("node `{node}` is produced by more than one task: {producers:?}")]
    DuplicateProducer {
        node: String,
        producers: Vec<String>,
    },

    #[error("missing root node(s), not produced by any task and absent on disk: {0:?}")]
    MissingRoots(Vec<MissingRoot>),

    #[error("{} dag error(s) detected", .0.len())]
    Aggregate(Vec<DagError>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingRoot {
    pub node: String,
    pub dependent_tasks: Vec<String>,
}

/// Failures raised while resolving provisional nodes/task generators.
#[derive(Debug, Error)]
pub enum ResolvingError {
    #[error("glob pattern `{pattern}` under `{root}` matched no files")]
    EmptyMatch { root: Utf8PathBuf, pattern: String },

    #[error("invalid glob pattern `{0}`: {1}")]
    InvalidPattern(String, #[source] glob::PatternError),

    #[error("provisional node `{0}` was used before being resolved")]
    NotResolved(String),
}

/// Setup/execution/teardown failures for a single task. These do not abort
/// the run; the executor turns them into a `Failed` outcome and marks
/// descendants `SkippedAncestorFailed`.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("dependency `{0}` has no state at execute time")]
    MissingDependency(String),

    #[error("task body failed: {0}")]
    Execution(#[from] anyhow::Error),

    #[error("declared product `{0}` is missing after execution")]
    MissingProduct(String),

    #[error(transparent)]
    Resolving(#[from] ResolvingError),

    #[error(transparent)]
    Internal(#[from] InternalError),
}

/// Fatal, non-recoverable failures: state-store I/O, hashing. The run
/// cannot meaningfully continue.
#[derive(Debug, Error)]
pub enum InternalError {
    #[error("state store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state store snapshot is corrupt: {0}")]
    CorruptSnapshot(String),

    #[error("failed to (de)serialize journal record: {0}")]
    Journal(#[from] serde_json::Error),

    #[error("failed to (de)serialize lockfile snapshot: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("failed to serialize lockfile snapshot: {0}")]
    TomlSer(#[from] toml::ser::Error),
}
