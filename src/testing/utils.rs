use crate::listener::{EntityOwnershipChange, EntityOwnershipListener};
use crate::types::Entity;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Poll `condition` until it holds or `timeout` elapses.
///
/// Returns whether the condition was met.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    let interval = Duration::from_millis(10);

    loop {
        if condition() {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

/// Repeat an async action until its result satisfies `predicate` or `timeout` elapses.
pub async fn wait_for_result<F, Fut, T, P>(
    mut action: F,
    predicate: P,
    timeout: Duration,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let start = Instant::now();
    let interval = Duration::from_millis(20);

    while start.elapsed() < timeout {
        let result = action().await;
        if predicate(&result) {
            return Some(result);
        }
        tokio::time::sleep(interval).await;
    }
    None
}

/// Listener that records every change it receives.
#[derive(Debug, Default)]
pub struct RecordingListener {
    changes: Mutex<Vec<EntityOwnershipChange>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.changes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.lock().is_empty()
    }

    pub fn changes(&self) -> Vec<EntityOwnershipChange> {
        self.changes.lock().clone()
    }

    /// Changes received for one entity, oldest first.
    pub fn changes_for(&self, entity: &Entity) -> Vec<EntityOwnershipChange> {
        self.changes
            .lock()
            .iter()
            .filter(|c| &c.entity == entity)
            .cloned()
            .collect()
    }

    pub fn last_for(&self, entity: &Entity) -> Option<EntityOwnershipChange> {
        self.changes
            .lock()
            .iter()
            .rev()
            .find(|c| &c.entity == entity)
            .cloned()
    }

    pub fn clear(&self) {
        self.changes.lock().clear();
    }
}

impl EntityOwnershipListener for RecordingListener {
    fn ownership_changed(&self, change: &EntityOwnershipChange) {
        self.changes.lock().push(change.clone());
    }
}
