//! Listener registration table and per-listener delivery.

use super::{EntityOwnershipChange, EntityOwnershipListener};
use crate::metrics::ShardMetrics;
use crate::types::Entity;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Identity of a listener object, its allocation address.
type ListenerKey = usize;

fn listener_key(listener: &Arc<dyn EntityOwnershipListener>) -> ListenerKey {
    Arc::as_ptr(listener) as *const () as usize
}

struct Delivery {
    tx: mpsc::UnboundedSender<EntityOwnershipChange>,
    /// Number of entity types the listener is registered for.
    ref_count: usize,
}

struct Registration {
    key: ListenerKey,
    /// Live changes at or below this applied index were already covered by backfill.
    synced_index: u64,
}

#[derive(Default)]
struct Registrations {
    by_type: HashMap<String, Vec<Registration>>,
    deliveries: HashMap<ListenerKey, Delivery>,
}

/// Tracks listeners per entity type and fans ownership changes out to them.
///
/// Registration takes the write lock, notification only the read lock.
pub struct ListenerSupport {
    shard_name: String,
    registrations: RwLock<Registrations>,
    in_jeopardy: AtomicBool,
    metrics: Arc<ShardMetrics>,
}

impl ListenerSupport {
    pub fn new(shard_name: impl Into<String>, metrics: Arc<ShardMetrics>) -> Self {
        Self {
            shard_name: shard_name.into(),
            registrations: RwLock::new(Registrations::default()),
            in_jeopardy: AtomicBool::new(false),
            metrics,
        }
    }

    /// Register `listener` for `entity_type`.
    ///
    /// Returns false if it was already registered for that type. The first
    /// registration of a listener object starts its delivery task.
    pub fn add_listener(
        &self,
        entity_type: &str,
        listener: Arc<dyn EntityOwnershipListener>,
    ) -> bool {
        let key = listener_key(&listener);
        let mut regs = self.registrations.write();

        let registered = regs.by_type.entry(entity_type.to_string()).or_default();
        if registered.iter().any(|r| r.key == key) {
            return false;
        }
        registered.push(Registration {
            key,
            synced_index: 0,
        });

        match regs.deliveries.get_mut(&key) {
            Some(delivery) => delivery.ref_count += 1,
            None => {
                let tx = self.spawn_delivery(listener);
                regs.deliveries.insert(key, Delivery { tx, ref_count: 1 });
            }
        }

        debug!(shard = %self.shard_name, entity_type, "Added ownership listener");
        true
    }

    /// Unregister `listener` from `entity_type`.
    ///
    /// The delivery task ends once the listener has no registrations left.
    pub fn remove_listener(
        &self,
        entity_type: &str,
        listener: &Arc<dyn EntityOwnershipListener>,
    ) -> bool {
        let key = listener_key(listener);
        let mut regs = self.registrations.write();

        let Some(registered) = regs.by_type.get_mut(entity_type) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|r| r.key != key);
        if registered.len() == before {
            return false;
        }
        if registered.is_empty() {
            regs.by_type.remove(entity_type);
        }

        if let Some(delivery) = regs.deliveries.get_mut(&key) {
            delivery.ref_count -= 1;
            if delivery.ref_count == 0 {
                regs.deliveries.remove(&key);
            }
        }

        debug!(shard = %self.shard_name, entity_type, "Removed ownership listener");
        true
    }

    /// Record that `listener` was backfilled with state as of `index`.
    pub fn mark_synced(
        &self,
        entity_type: &str,
        listener: &Arc<dyn EntityOwnershipListener>,
        index: u64,
    ) {
        let key = listener_key(listener);
        let mut regs = self.registrations.write();
        if let Some(reg) = regs
            .by_type
            .get_mut(entity_type)
            .and_then(|regs| regs.iter_mut().find(|r| r.key == key))
        {
            reg.synced_index = reg.synced_index.max(index);
        }
    }

    /// Notify every listener registered for the entity's type.
    ///
    /// `index` is the applied log index of the change. Listeners whose backfill
    /// already covered that index are skipped. Synthetic notifications pass `None`.
    pub fn notify(
        &self,
        entity: &Entity,
        was_owner: bool,
        is_owner: bool,
        has_owner: bool,
        index: Option<u64>,
    ) {
        let regs = self.registrations.read();
        let Some(registered) = regs.by_type.get(entity.entity_type()) else {
            return;
        };

        let change = self.change(entity, was_owner, is_owner, has_owner);
        for reg in registered {
            if index.is_some_and(|index| index <= reg.synced_index) {
                continue;
            }
            if let Some(delivery) = regs.deliveries.get(&reg.key) {
                let _ = delivery.tx.send(change.clone());
            }
        }
    }

    /// Notify a single listener, used for backfill.
    pub fn notify_listener(
        &self,
        listener: &Arc<dyn EntityOwnershipListener>,
        entity: &Entity,
        was_owner: bool,
        is_owner: bool,
        has_owner: bool,
    ) {
        let regs = self.registrations.read();
        if let Some(delivery) = regs.deliveries.get(&listener_key(listener)) {
            let _ = delivery
                .tx
                .send(self.change(entity, was_owner, is_owner, has_owner));
        }
    }

    /// Set the jeopardy flag carried by future notifications, returning the previous value.
    pub fn set_in_jeopardy(&self, in_jeopardy: bool) -> bool {
        self.in_jeopardy.swap(in_jeopardy, Ordering::SeqCst)
    }

    pub fn in_jeopardy(&self) -> bool {
        self.in_jeopardy.load(Ordering::SeqCst)
    }

    /// Entity types with at least one listener.
    pub fn entity_types(&self) -> Vec<String> {
        self.registrations.read().by_type.keys().cloned().collect()
    }

    /// Number of distinct listener objects with a delivery task.
    pub fn listener_count(&self) -> usize {
        self.registrations.read().deliveries.len()
    }

    fn change(
        &self,
        entity: &Entity,
        was_owner: bool,
        is_owner: bool,
        has_owner: bool,
    ) -> EntityOwnershipChange {
        EntityOwnershipChange {
            entity: entity.clone(),
            was_owner,
            is_owner,
            has_owner,
            in_jeopardy: self.in_jeopardy(),
        }
    }

    fn spawn_delivery(
        &self,
        listener: Arc<dyn EntityOwnershipListener>,
    ) -> mpsc::UnboundedSender<EntityOwnershipChange> {
        let (tx, mut rx) = mpsc::unbounded_channel::<EntityOwnershipChange>();
        let shard = self.shard_name.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            while let Some(change) = rx.recv().await {
                let result = catch_unwind(AssertUnwindSafe(|| listener.ownership_changed(&change)));
                match result {
                    Ok(()) => metrics.listener_notifications.inc(),
                    Err(_) => {
                        metrics.listener_failures.inc();
                        error!(shard = %shard, entity = %change.entity, "Ownership listener panicked");
                    }
                }
            }
            debug!(shard = %shard, "Ownership listener delivery stopped");
        });

        tx
    }
}

impl std::fmt::Debug for ListenerSupport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSupport")
            .field("shard_name", &self.shard_name)
            .field("listeners", &self.listener_count())
            .field("in_jeopardy", &self.in_jeopardy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_until, RecordingListener};
    use std::time::Duration;

    fn support() -> (ListenerSupport, Arc<ShardMetrics>) {
        let metrics = Arc::new(ShardMetrics::new());
        (ListenerSupport::new("test", metrics.clone()), metrics)
    }

    fn entity(entity_type: &str) -> Entity {
        Entity::parse(entity_type, "/e1").unwrap()
    }

    struct PanickingListener;

    impl EntityOwnershipListener for PanickingListener {
        fn ownership_changed(&self, _change: &EntityOwnershipChange) {
            panic!("listener failure");
        }
    }

    #[tokio::test]
    async fn test_registration_is_deduplicated_and_ref_counted() {
        let (support, _) = support();
        let listener: Arc<dyn EntityOwnershipListener> = Arc::new(RecordingListener::new());

        assert!(support.add_listener("device", listener.clone()));
        assert!(!support.add_listener("device", listener.clone()));
        assert!(support.add_listener("port", listener.clone()));
        assert_eq!(support.listener_count(), 1);

        assert!(support.remove_listener("device", &listener));
        assert_eq!(support.listener_count(), 1);
        assert!(support.remove_listener("port", &listener));
        assert_eq!(support.listener_count(), 0);
        assert!(!support.remove_listener("port", &listener));
    }

    #[tokio::test]
    async fn test_notify_by_type() {
        let (support, _) = support();
        let recorder = Arc::new(RecordingListener::new());
        let listener: Arc<dyn EntityOwnershipListener> = recorder.clone();
        support.add_listener("device", listener);

        support.notify(&entity("port"), false, true, true, None);
        support.notify(&entity("device"), false, true, true, None);

        assert!(wait_until(Duration::from_secs(2), || recorder.len() == 1).await);
        let changes = recorder.changes();
        assert_eq!(changes[0].entity, entity("device"));
        assert!(changes[0].is_owner && changes[0].has_owner && !changes[0].was_owner);
    }

    #[tokio::test]
    async fn test_synced_index_skips_covered_changes() {
        let (support, _) = support();
        let recorder = Arc::new(RecordingListener::new());
        let listener: Arc<dyn EntityOwnershipListener> = recorder.clone();
        support.add_listener("device", listener.clone());
        support.mark_synced("device", &listener, 5);

        support.notify(&entity("device"), false, true, true, Some(5));
        support.notify(&entity("device"), true, false, true, Some(6));

        assert!(wait_until(Duration::from_secs(2), || recorder.len() == 1).await);
        assert!(recorder.changes()[0].was_owner);
    }

    #[tokio::test]
    async fn test_panicking_listener_is_isolated() {
        let (support, metrics) = support();
        let recorder = Arc::new(RecordingListener::new());
        let good: Arc<dyn EntityOwnershipListener> = recorder.clone();
        let bad: Arc<dyn EntityOwnershipListener> = Arc::new(PanickingListener);
        support.add_listener("device", bad);
        support.add_listener("device", good);

        support.notify(&entity("device"), false, true, true, None);
        support.notify(&entity("device"), true, false, false, None);

        assert!(wait_until(Duration::from_secs(2), || recorder.len() == 2).await);
        assert!(wait_until(Duration::from_secs(2), || metrics.listener_failures.get() == 2).await);
    }

    #[tokio::test]
    async fn test_jeopardy_flag_is_carried() {
        let (support, _) = support();
        let recorder = Arc::new(RecordingListener::new());
        support.add_listener("device", recorder.clone());

        assert!(!support.set_in_jeopardy(true));
        support.notify(&entity("device"), true, true, true, None);

        assert!(wait_until(Duration::from_secs(2), || recorder.len() == 1).await);
        assert!(recorder.changes()[0].in_jeopardy);
        assert!(support.set_in_jeopardy(false));
    }
}
