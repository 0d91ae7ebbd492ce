//! Local entry point for applications.

use crate::config::OwnershipConfig;
use crate::consensus::Consensus;
use crate::datastore::DataStore;
use crate::error::{Error, Result};
use crate::listener::EntityOwnershipListener;
use crate::metrics::ShardMetrics;
use crate::model::{self, EntityView};
use crate::shard::{ShardBuilder, ShardHandle, ShardStatus};
use crate::types::{Entity, EntityOwnershipState, MemberName};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct ServiceInner {
    member: MemberName,
    shard: ShardHandle,
    store: Arc<dyn DataStore>,
    registered: Mutex<HashSet<Entity>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// Entity ownership service of the local member.
///
/// Registration calls complete once the intent is queued on the local shard.
/// Whether the member actually became owner is only observable through a
/// subsequent listener notification or [`ownership_state`](Self::ownership_state).
#[derive(Clone)]
pub struct EntityOwnershipService {
    inner: Arc<ServiceInner>,
}

impl EntityOwnershipService {
    /// Start the local shard replica and return the service wrapping it.
    pub fn start(
        config: OwnershipConfig,
        consensus: Arc<dyn Consensus>,
        store: Arc<dyn DataStore>,
    ) -> Result<Self> {
        Self::start_with_metrics(config, consensus, store, Arc::new(ShardMetrics::new()))
    }

    pub fn start_with_metrics(
        config: OwnershipConfig,
        consensus: Arc<dyn Consensus>,
        store: Arc<dyn DataStore>,
        metrics: Arc<ShardMetrics>,
    ) -> Result<Self> {
        let member = config.member_name.clone();
        info!(member = %member, shard = %config.shard_name, "Starting entity ownership service");

        let (shard, join) = ShardBuilder::new()
            .config(config)
            .consensus(consensus)
            .store(store.clone())
            .metrics(metrics)
            .spawn()?;

        Ok(Self {
            inner: Arc::new(ServiceInner {
                member,
                shard,
                store,
                registered: Mutex::new(HashSet::new()),
                join: Mutex::new(Some(join)),
            }),
        })
    }

    pub fn member(&self) -> &MemberName {
        &self.inner.member
    }

    /// Register the local member as a candidate to own `entity`.
    pub async fn register_candidate(&self, entity: Entity) -> Result<CandidateRegistration> {
        if !self.inner.registered.lock().insert(entity.clone()) {
            return Err(Error::CandidateAlreadyRegistered(entity));
        }

        debug!(member = %self.inner.member, entity = %entity, "Registering candidate");
        if let Err(e) = self.inner.shard.register_candidate(entity.clone()).await {
            self.inner.registered.lock().remove(&entity);
            return Err(e);
        }

        Ok(CandidateRegistration {
            entity,
            service: self.clone(),
        })
    }

    /// Register `listener` for ownership changes of every entity of `entity_type`.
    ///
    /// Every existing entity of that type is replayed to the listener right
    /// after registration, including entities without an owner.
    pub async fn register_listener(
        &self,
        entity_type: impl Into<String>,
        listener: Arc<dyn EntityOwnershipListener>,
    ) -> Result<ListenerRegistration> {
        let entity_type = entity_type.into();
        if entity_type.is_empty() {
            return Err(Error::InvalidEntity("entity type must not be empty".into()));
        }

        self.inner
            .shard
            .register_listener(entity_type.clone(), listener.clone())
            .await?;

        Ok(ListenerRegistration {
            entity_type,
            listener,
            service: self.clone(),
        })
    }

    /// Ownership of `entity` in the local replica's committed tree.
    ///
    /// Returns `None` if the entity has never had a candidate.
    pub fn ownership_state(&self, entity: &Entity) -> Option<EntityOwnershipState> {
        let node = self.inner.store.read(&model::entity_path(entity))?;
        let owner = EntityView::new(&node).owner();
        Some(EntityOwnershipState::from_owner(
            owner.as_ref(),
            &self.inner.member,
        ))
    }

    /// Whether the local member registered itself as candidate for `entity`.
    pub fn is_candidate_registered(&self, entity: &Entity) -> bool {
        self.inner.registered.lock().contains(entity)
    }

    pub fn metrics(&self) -> &Arc<ShardMetrics> {
        self.inner.shard.metrics()
    }

    pub async fn status(&self) -> Result<ShardStatus> {
        self.inner.shard.status().await
    }

    /// Handle to the underlying shard.
    pub fn shard(&self) -> &ShardHandle {
        &self.inner.shard
    }

    /// Stop the shard and wait for its loop to exit.
    pub async fn shutdown(&self) {
        info!(member = %self.inner.member, "Shutting down entity ownership service");
        self.inner.shard.shutdown().await;
        let join = self.inner.join.lock().take();
        if let Some(join) = join {
            let _ = join.await;
        }
    }

    async fn unregister_candidate(&self, entity: &Entity) -> Result<()> {
        if !self.inner.registered.lock().remove(entity) {
            return Ok(());
        }
        debug!(member = %self.inner.member, entity = %entity, "Unregistering candidate");
        self.inner.shard.unregister_candidate(entity.clone()).await
    }
}

impl std::fmt::Debug for EntityOwnershipService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityOwnershipService")
            .field("member", &self.inner.member)
            .field("registered", &self.inner.registered.lock().len())
            .finish()
    }
}

/// A local candidacy. Withdraw it with [`close`](Self::close).
#[derive(Debug)]
pub struct CandidateRegistration {
    entity: Entity,
    service: EntityOwnershipService,
}

impl CandidateRegistration {
    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    /// Withdraw the candidacy.
    pub async fn close(self) -> Result<()> {
        self.service.unregister_candidate(&self.entity).await
    }
}

/// A listener registration. Remove it with [`close`](Self::close).
pub struct ListenerRegistration {
    entity_type: String,
    listener: Arc<dyn EntityOwnershipListener>,
    service: EntityOwnershipService,
}

impl ListenerRegistration {
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub async fn close(self) -> Result<()> {
        self.service
            .inner
            .shard
            .unregister_listener(self.entity_type, self.listener)
            .await
    }
}

impl std::fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("entity_type", &self.entity_type)
            .finish()
    }
}
