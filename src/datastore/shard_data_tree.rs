//! Replica of the ownership tree that applies committed log entries.

use crate::datastore::DataStore;
use crate::model::tree::snapshot_changes;
use crate::model::{DataTree, ModificationBatch, TreeChangeBatch, TreeNode, TreePath};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, error};

struct Subscriber {
    prefix: TreePath,
    tx: mpsc::UnboundedSender<TreeChangeBatch>,
}

/// Applies committed [`ModificationBatch`] payloads to an in-memory [`DataTree`].
///
/// The apply method must be infallible. Entries that cannot be decoded are logged
/// and skipped so the replica still advances its applied index.
pub struct ShardDataTree {
    tree: RwLock<DataTree>,

    /// The last applied index.
    applied_index: AtomicU64,

    /// The last applied term.
    applied_term: AtomicU64,

    /// Number of batches applied.
    batches_applied: AtomicU64,

    subscribers: Mutex<Vec<Subscriber>>,
}

impl ShardDataTree {
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(DataTree::new()),
            applied_index: AtomicU64::new(0),
            applied_term: AtomicU64::new(0),
            batches_applied: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Apply a committed entry.
    ///
    /// Changes are published while the tree write lock is held, so a concurrent
    /// subscriber sees every change exactly once: either in its snapshot or live.
    pub fn apply(&self, index: u64, term: u64, data: &[u8]) {
        let mut tree = self.tree.write();

        // Skip if already applied
        if index <= self.applied_index.load(Ordering::SeqCst) {
            debug!(index, "Skipping already applied entry");
            return;
        }

        // Empty data is a noop entry, e.g. after a leader election
        if data.is_empty() {
            self.update_applied(index, term);
            return;
        }

        let batch = match ModificationBatch::from_bytes(data) {
            Ok(batch) => batch,
            Err(e) => {
                error!(index, error = %e, "Failed to decode modification batch");
                self.update_applied(index, term);
                return;
            }
        };

        let changes = tree.apply_all(&batch.modifications);
        self.update_applied(index, term);
        self.batches_applied.fetch_add(1, Ordering::Relaxed);

        debug!(
            index,
            term,
            transaction_id = %batch.transaction_id,
            modifications = batch.modifications.len(),
            changes = changes.len(),
            "Applied modification batch"
        );

        if changes.is_empty() {
            return;
        }

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| {
            let matching: Vec<_> = changes
                .iter()
                .filter(|c| c.path.starts_with(&sub.prefix))
                .cloned()
                .collect();
            if matching.is_empty() {
                return !sub.tx.is_closed();
            }
            sub.tx
                .send(TreeChangeBatch {
                    index,
                    changes: matching,
                })
                .is_ok()
        });
    }

    fn update_applied(&self, index: u64, term: u64) {
        self.applied_index.store(index, Ordering::SeqCst);
        self.applied_term.store(term, Ordering::SeqCst);
    }

    /// Get the last applied index.
    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::SeqCst)
    }

    pub fn applied_term(&self) -> u64 {
        self.applied_term.load(Ordering::SeqCst)
    }

    pub fn batches_applied(&self) -> u64 {
        self.batches_applied.load(Ordering::Relaxed)
    }
}

impl Default for ShardDataTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DataStore for ShardDataTree {
    fn read_indexed(&self, path: &TreePath) -> (u64, Option<TreeNode>) {
        let tree = self.tree.read();
        (self.applied_index(), tree.read(path).cloned())
    }

    fn subscribe(&self, prefix: TreePath) -> mpsc::UnboundedReceiver<TreeChangeBatch> {
        let (tx, rx) = mpsc::unbounded_channel();

        // Hold the write lock so no entry is applied between snapshot and registration
        let tree = self.tree.write();
        if let Some(node) = tree.read(&prefix) {
            let _ = tx.send(TreeChangeBatch {
                index: self.applied_index(),
                changes: snapshot_changes(&prefix, node),
            });
        }
        self.subscribers.lock().push(Subscriber { prefix, tx });
        drop(tree);

        rx
    }
}

impl std::fmt::Debug for ShardDataTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardDataTree")
            .field("applied_index", &self.applied_index())
            .field("applied_term", &self.applied_term())
            .field("batches_applied", &self.batches_applied())
            .finish()
    }
}
