//! Generic ordered tree replicated through the consensus log.
//!
//! The tree is addressed by [`TreePath`]s made of fixed schema nodes and keyed list
//! entries. Children keep insertion order, which is what gives candidate lists their
//! append-only ordering. Applying a [`Modification`] yields the [`TreeChange`]s that
//! tree-change subscribers observe.

use crate::types::TransactionId;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;

/// One step in a tree path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PathArg {
    /// A fixed, schema-defined child.
    Node(SmolStr),
    /// An entry of a keyed list. The key is a sequence of components.
    Entry(Vec<String>),
}

impl PathArg {
    pub fn node(name: &str) -> Self {
        PathArg::Node(SmolStr::new(name))
    }

    pub fn entry<I, S>(key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PathArg::Entry(key.into_iter().map(Into::into).collect())
    }

    /// Whether this is the fixed node `name`.
    pub fn is_node(&self, name: &str) -> bool {
        matches!(self, PathArg::Node(n) if n == name)
    }

    /// Get the key of a list entry.
    pub fn key(&self) -> Option<&[String]> {
        match self {
            PathArg::Entry(key) => Some(key),
            PathArg::Node(_) => None,
        }
    }
}

impl fmt::Display for PathArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathArg::Node(name) => f.write_str(name),
            PathArg::Entry(key) => write!(f, "[{}]", key.join(",")),
        }
    }
}

/// Absolute path of a node in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TreePath(Vec<PathArg>);

impl TreePath {
    /// The root path.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new(args: Vec<PathArg>) -> Self {
        Self(args)
    }

    /// Path of a child of this path.
    pub fn child(&self, arg: PathArg) -> Self {
        let mut args = self.0.clone();
        args.push(arg);
        Self(args)
    }

    pub fn node(&self, name: &str) -> Self {
        self.child(PathArg::node(name))
    }

    pub fn entry<I, S>(&self, key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.child(PathArg::entry(key))
    }

    pub fn args(&self) -> &[PathArg] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&PathArg> {
        self.0.last()
    }

    /// Whether `prefix` is this path or one of its ancestors.
    pub fn starts_with(&self, prefix: &TreePath) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for arg in &self.0 {
            write!(f, "/{}", arg)?;
        }
        Ok(())
    }
}

/// A node of the tree: an optional leaf value plus ordered children.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TreeNode {
    value: Option<String>,
    children: IndexMap<PathArg, TreeNode>,
}

impl TreeNode {
    /// An empty container node.
    pub fn container() -> Self {
        Self::default()
    }

    /// A leaf node holding `value`.
    pub fn leaf(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            children: IndexMap::new(),
        }
    }

    /// Builder-style child insertion.
    pub fn with_child(mut self, arg: PathArg, child: TreeNode) -> Self {
        self.children.insert(arg, child);
        self
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn child(&self, arg: &PathArg) -> Option<&TreeNode> {
        self.children.get(arg)
    }

    /// Children in insertion order.
    pub fn children(&self) -> impl Iterator<Item = (&PathArg, &TreeNode)> {
        self.children.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }

    /// Descend along relative path arguments.
    pub fn descendant(&self, args: &[PathArg]) -> Option<&TreeNode> {
        let mut node = self;
        for arg in args {
            node = node.children.get(arg)?;
        }
        Some(node)
    }

    fn descendant_or_create(&mut self, args: &[PathArg]) -> &mut TreeNode {
        let mut node = self;
        for arg in args {
            node = node.children.entry(arg.clone()).or_default();
        }
        node
    }

    fn descendant_mut(&mut self, args: &[PathArg]) -> Option<&mut TreeNode> {
        let mut node = self;
        for arg in args {
            node = node.children.get_mut(arg)?;
        }
        Some(node)
    }

    /// Merge `other` into this node. Existing children not present in `other` are kept.
    fn merge(&mut self, other: TreeNode) {
        if other.value.is_some() {
            self.value = other.value;
        }
        for (arg, child) in other.children {
            self.children.entry(arg).or_default().merge(child);
        }
    }
}

/// A single mutation of the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Modification {
    /// Replace the node at `path`.
    Write { path: TreePath, node: TreeNode },
    /// Merge `node` into whatever exists at `path`.
    Merge { path: TreePath, node: TreeNode },
    /// Remove the node at `path`.
    Delete { path: TreePath },
}

impl Modification {
    pub fn path(&self) -> &TreePath {
        match self {
            Modification::Write { path, .. }
            | Modification::Merge { path, .. }
            | Modification::Delete { path } => path,
        }
    }
}

/// Batch of modifications submitted for replication under one transaction id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModificationBatch {
    pub transaction_id: TransactionId,
    pub modifications: Vec<Modification>,
}

impl ModificationBatch {
    pub fn new(transaction_id: TransactionId, modifications: Vec<Modification>) -> Self {
        Self {
            transaction_id,
            modifications,
        }
    }

    /// Serialize the batch into a log payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize a batch from a log payload.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Kind of structural change observed at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// The modified node was created or replaced.
    Write,
    /// The modified node was removed.
    Delete,
    /// Only descendants of the node changed.
    SubtreeModified,
    /// A descendant of the modified node was created.
    Appeared,
    /// A descendant of the modified node was removed.
    Disappeared,
}

/// One changed node, with its state before and after the modification.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeChange {
    pub path: TreePath,
    pub kind: ChangeKind,
    pub before: Option<TreeNode>,
    pub after: Option<TreeNode>,
}

impl TreeChange {
    /// Leaf value before the change.
    pub fn value_before(&self) -> Option<&str> {
        self.before.as_ref().and_then(TreeNode::value)
    }

    /// Leaf value after the change.
    pub fn value_after(&self) -> Option<&str> {
        self.after.as_ref().and_then(TreeNode::value)
    }
}

/// Changes produced by one applied log entry, tagged with the entry's index.
#[derive(Debug, Clone)]
pub struct TreeChangeBatch {
    pub index: u64,
    pub changes: Vec<TreeChange>,
}

/// The in-memory tree.
#[derive(Debug, Clone, Default)]
pub struct DataTree {
    root: TreeNode,
}

impl DataTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, path: &TreePath) -> Option<&TreeNode> {
        self.root.descendant(path.args())
    }

    /// Apply modifications in order, returning every change they caused.
    pub fn apply_all(&mut self, modifications: &[Modification]) -> Vec<TreeChange> {
        let mut changes = Vec::new();
        for modification in modifications {
            self.apply_into(modification, &mut changes);
        }
        changes
    }

    /// Apply one modification.
    pub fn apply(&mut self, modification: &Modification) -> Vec<TreeChange> {
        let mut changes = Vec::new();
        self.apply_into(modification, &mut changes);
        changes
    }

    fn apply_into(&mut self, modification: &Modification, out: &mut Vec<TreeChange>) {
        let path = modification.path();
        let before = self.read(path).cloned();

        match modification {
            Modification::Write { path, node } => {
                *self.root.descendant_or_create(path.args()) = node.clone();
            }
            Modification::Merge { path, node } => {
                self.root
                    .descendant_or_create(path.args())
                    .merge(node.clone());
            }
            Modification::Delete { path } => match path.args().split_last() {
                Some((last, parent)) => {
                    if let Some(parent) = self.root.descendant_mut(parent) {
                        parent.children.shift_remove(last);
                    }
                }
                None => self.root = TreeNode::default(),
            },
        }

        let after = self.read(path).cloned();
        diff(path, before.as_ref(), after.as_ref(), true, out);
    }
}

/// Changes describing `node` appearing at `path` from nothing.
///
/// Used to replay existing state to a new subscriber.
pub fn snapshot_changes(path: &TreePath, node: &TreeNode) -> Vec<TreeChange> {
    let mut out = Vec::new();
    diff(path, None, Some(node), true, &mut out);
    out
}

fn diff(
    path: &TreePath,
    before: Option<&TreeNode>,
    after: Option<&TreeNode>,
    top: bool,
    out: &mut Vec<TreeChange>,
) {
    let kind = match (before, after) {
        (None, None) => return,
        (Some(b), Some(a)) if b == a => return,
        (None, Some(_)) if top => ChangeKind::Write,
        (None, Some(_)) => ChangeKind::Appeared,
        (Some(_), None) if top => ChangeKind::Delete,
        (Some(_), None) => ChangeKind::Disappeared,
        (Some(b), Some(a)) if b.value != a.value => ChangeKind::Write,
        (Some(_), Some(_)) => ChangeKind::SubtreeModified,
    };

    out.push(TreeChange {
        path: path.clone(),
        kind,
        before: before.cloned(),
        after: after.cloned(),
    });

    let empty = IndexMap::new();
    let before_children = before.map_or(&empty, |n| &n.children);
    let after_children = after.map_or(&empty, |n| &n.children);

    for (arg, child) in before_children {
        diff(&path.child(arg.clone()), Some(child), after_children.get(arg), false, out);
    }
    for (arg, child) in after_children {
        if !before_children.contains_key(arg) {
            diff(&path.child(arg.clone()), None, Some(child), false, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_path() -> TreePath {
        TreePath::root().node("list")
    }

    #[test]
    fn test_merge_preserves_existing_children_and_order() {
        let mut tree = DataTree::new();
        for name in ["b", "a", "c"] {
            tree.apply(&Modification::Merge {
                path: list_path(),
                node: TreeNode::container().with_child(PathArg::entry([name]), TreeNode::leaf(name)),
            });
        }

        let names: Vec<_> = tree
            .read(&list_path())
            .unwrap()
            .children()
            .filter_map(|(_, n)| n.value())
            .collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_merge_of_identical_node_is_not_a_change() {
        let mut tree = DataTree::new();
        let modification = Modification::Merge {
            path: list_path(),
            node: TreeNode::container().with_child(PathArg::entry(["a"]), TreeNode::leaf("a")),
        };

        assert!(!tree.apply(&modification).is_empty());
        assert!(tree.apply(&modification).is_empty());
    }

    #[test]
    fn test_changes_cover_descendants() {
        let mut tree = DataTree::new();
        let changes = tree.apply(&Modification::Merge {
            path: TreePath::root(),
            node: TreeNode::container().with_child(
                PathArg::node("list"),
                TreeNode::container().with_child(PathArg::entry(["a"]), TreeNode::leaf("a")),
            ),
        });

        let kinds: Vec<_> = changes.iter().map(|c| (c.path.to_string(), c.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                ("/".to_string(), ChangeKind::SubtreeModified),
                ("/list".to_string(), ChangeKind::Appeared),
                ("/list/[a]".to_string(), ChangeKind::Appeared),
            ]
        );

        let changes = tree.apply(&Modification::Delete { path: list_path() });
        assert_eq!(changes[0].kind, ChangeKind::Delete);
        assert_eq!(changes[1].kind, ChangeKind::Disappeared);
        assert_eq!(changes[1].value_before(), Some("a"));
        assert!(changes[1].after.is_none());
    }

    #[test]
    fn test_write_replaces_leaf_value() {
        let mut tree = DataTree::new();
        let path = TreePath::root().node("owner");
        tree.apply(&Modification::Write { path: path.clone(), node: TreeNode::leaf("m1") });
        let changes = tree.apply(&Modification::Write { path: path.clone(), node: TreeNode::leaf("m2") });

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Write);
        assert_eq!(changes[0].value_before(), Some("m1"));
        assert_eq!(changes[0].value_after(), Some("m2"));
        assert_eq!(tree.read(&path).and_then(TreeNode::value), Some("m2"));
    }

    #[test]
    fn test_delete_of_missing_path_is_noop() {
        let mut tree = DataTree::new();
        assert!(tree.apply(&Modification::Delete { path: list_path().entry(["x"]) }).is_empty());
    }
}
