//! Replicated data tree access.
//!
//! The ownership shard never writes to the tree directly. It reads committed state
//! and observes committed changes through [`DataStore`], and writes only through the
//! consensus primitive.

pub mod shard_data_tree;

pub use shard_data_tree::ShardDataTree;

use crate::model::{TreeChangeBatch, TreeNode, TreePath};
use tokio::sync::mpsc;

/// Read and change-subscription access to the committed tree of one replica.
pub trait DataStore: Send + Sync + 'static {
    /// Read a committed subtree.
    fn read(&self, path: &TreePath) -> Option<TreeNode> {
        self.read_indexed(path).1
    }

    /// Read a committed subtree together with the log index it reflects.
    fn read_indexed(&self, path: &TreePath) -> (u64, Option<TreeNode>);

    /// Subscribe to committed changes under `prefix`.
    ///
    /// The first batch replays the current content of the subtree, if any. Every
    /// later batch carries the changes made by one applied log entry, in log order.
    fn subscribe(&self, prefix: TreePath) -> mpsc::UnboundedReceiver<TreeChangeBatch>;
}
