#![deny(unsafe_code, clippy::panic)]

pub mod change;
pub mod config;
pub mod dag;
pub mod error;
pub mod executor;
pub mod hash;
pub mod node;
#[cfg(feature = "parallel")]
pub mod parallel;
pub mod provisional;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod task;
pub mod tree;

pub use camino;

pub use change::{SignalKind, SignalResult, SignalRole, StalenessExplanation};
pub use config::RunConfig;
pub use dag::{Dag, DagNode, build_dag};
pub use error::RetaskError;
pub use executor::{Executor, Outcome};
pub use hash::{Hash32, HashValue};
pub use node::{DirectoryNode, Node, NodeKind, NodeState, PathNode, PickleNode, ValueNode};
pub use session::{RunReport, run};
pub use store::StateStore;
pub use task::{Marker, Task, TaskBody, TaskId};
pub use tree::{NodePath, NodeTree, PathSegment};
