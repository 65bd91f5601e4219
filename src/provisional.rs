//! Provisional node resolution and task-generator handling.
//!
//! A [`crate::node::DirectoryNode`] never reaches the DAG: it is replaced by
//! its concrete [`crate::node::PathNode`]s immediately before the owning
//! task's setup, and again for products after execute. Tasks that resolved
//! at least one provisional node are tracked so the caller knows to rebuild
//! the DAG afterward.

use std::collections::HashSet;

use crate::error::ResolvingError;
use crate::node::Node;
use crate::task::{Task, TaskId};
use crate::tree::NodeTree;

#[derive(Default)]
pub struct Resolver {
    pub tasks_with_provisional: HashSet<TaskId>,
}

impl Resolver {
    pub fn resolve_dependencies(&mut self, task: &mut Task) -> Result<(), ResolvingError> {
        let resolved_any = resolve_tree(&mut task.depends_on)?;
        if resolved_any {
            self.tasks_with_provisional.insert(task.signature.clone());
        }
        Ok(())
    }

    pub fn resolve_products(&mut self, task: &mut Task) -> Result<(), ResolvingError> {
        let resolved_any = resolve_tree(&mut task.produces)?;
        if resolved_any {
            self.tasks_with_provisional.insert(task.signature.clone());
        }
        Ok(())
    }

    pub fn needs_rebuild(&self, task_id: &str) -> bool {
        self.tasks_with_provisional.contains(task_id)
    }
}

/// Replaces every [`Node::Directory`] leaf in-place with a `List` of its
/// collected [`Node::Path`] entries. Returns whether any substitution
/// happened.
fn resolve_tree(tree: &mut NodeTree) -> Result<bool, ResolvingError> {
    let mut any = false;
    substitute(tree, &mut any)?;
    Ok(any)
}

fn substitute(tree: &mut NodeTree, any: &mut bool) -> Result<(), ResolvingError> {
    match tree {
        NodeTree::Leaf(Node::Directory(dir)) => {
            let collected = dir.collect()?;
            *tree = NodeTree::List(
                collected
                    .into_iter()
                    .map(|path_node| NodeTree::Leaf(Node::Path(path_node)))
                    .collect(),
            );
            *any = true;
            Ok(())
        }
        NodeTree::Leaf(_) => Ok(()),
        NodeTree::List(items) => {
            for item in items {
                substitute(item, any)?;
            }
            Ok(())
        }
        NodeTree::Map(map) => {
            for item in map.values_mut() {
                substitute(item, any)?;
            }
            Ok(())
        }
    }
}

/// Folds freshly generated tasks (from a generator task's return value)
/// into the session's task list. The generator task itself never writes
/// state, so rerunning it regenerates its children from scratch.
pub fn fold_generated_tasks(session_tasks: &mut Vec<Task>, generated: Vec<Task>) {
    session_tasks.extend(generated);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::DirectoryNode;

    #[test]
    fn directory_node_expands_into_path_list() {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::write(root.join("a.txt"), b"a").unwrap();
        std::fs::write(root.join("b.txt"), b"b").unwrap();

        let mut tree = NodeTree::leaf(Node::Directory(DirectoryNode::new(root, "*.txt")));
        let resolved = resolve_tree(&mut tree).unwrap();
        assert!(resolved);

        match tree {
            NodeTree::List(items) => assert_eq!(items.len(), 2),
            _ => unreachable!("expected a list after resolution"),
        }
    }

    #[test]
    fn leaf_path_node_is_untouched() {
        let mut tree = NodeTree::leaf(Node::Path(crate::node::PathNode::new("x.txt")));
        let resolved = resolve_tree(&mut tree).unwrap();
        assert!(!resolved);
        assert!(matches!(tree, NodeTree::Leaf(Node::Path(_))));
    }
}
