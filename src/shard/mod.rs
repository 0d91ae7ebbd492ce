//! The entity ownership shard.
//!
//! One shard replica runs per member as a single message loop. It receives local
//! commands through its inbox, cluster events from the consensus primitive and
//! committed tree changes from its replica of the ownership tree. Only the
//! replica that currently leads selects owners. Every write goes through the
//! [`CommitCoordinator`].
//!
//! ```text
//!  ShardHandle ──▶ inbox ──┐
//!  Consensus ──▶ events ───┼──▶ EntityOwnershipShard ──▶ CommitCoordinator ──▶ Consensus::submit
//!  DataStore ──▶ changes ──┘          │
//!                                     └──▶ ListenerSupport ──▶ listener tasks
//! ```

pub mod commit;
mod link;
pub mod messages;

pub use commit::{CommitCoordinator, CommitTarget, CommitWaiter};
pub use messages::{ShardMessage, ShardStatus};

use crate::cluster::ClusterEvent;
use crate::config::OwnershipConfig;
use crate::consensus::Consensus;
use crate::datastore::DataStore;
use crate::error::{CommitError, Error, Result};
use crate::listener::{
    CandidateEvent, CandidateListChangeListener, EntityOwnerChangeListener,
    EntityOwnershipListener, ListenerSupport,
};
use crate::metrics::ShardMetrics;
use crate::model::{self, TreeChangeBatch};
use crate::selection::{OwnershipStatistics, StrategyRegistry};
use crate::types::{Entity, MemberName, VotingState};
use link::ShardLink;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct ScheduledSelection {
    task_id: u64,
    token: CancellationToken,
}

/// Builder for an [`EntityOwnershipShard`].
#[derive(Default)]
pub struct ShardBuilder {
    config: Option<OwnershipConfig>,
    consensus: Option<Arc<dyn Consensus>>,
    store: Option<Arc<dyn DataStore>>,
    metrics: Option<Arc<ShardMetrics>>,
}

impl ShardBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: OwnershipConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn consensus(mut self, consensus: Arc<dyn Consensus>) -> Self {
        self.consensus = Some(consensus);
        self
    }

    pub fn store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share a metrics instance. A fresh one is created otherwise.
    pub fn metrics(mut self, metrics: Arc<ShardMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the inputs and start the shard loop.
    pub fn spawn(self) -> Result<(ShardHandle, JoinHandle<()>)> {
        let config = self
            .config
            .ok_or_else(|| Error::Config("shard config is required".into()))?;
        config.validate()?;
        let consensus = self
            .consensus
            .ok_or_else(|| Error::Config("shard consensus is required".into()))?;
        let store = self
            .store
            .ok_or_else(|| Error::Config("shard data store is required".into()))?;
        let metrics = self.metrics.unwrap_or_default();

        let (tx, inbox) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        // Subscribe before the loop starts so nothing published in between is missed.
        let events = consensus.subscribe_events();
        let changes = store.subscribe(model::entity_types_path());

        let listener_support = Arc::new(ListenerSupport::new(
            config.shard_name.clone(),
            metrics.clone(),
        ));

        let shard = EntityOwnershipShard {
            shard_name: config.shard_name.clone(),
            local_member: config.member_name.clone(),
            consensus: consensus.clone(),
            store,
            commit: CommitCoordinator::new(
                config.shard_name.clone(),
                config.member_name.clone(),
                config.max_batch_size,
                config.raft.election_timeout(),
                metrics.clone(),
            ),
            link: ShardLink::new(
                config.shard_name.clone(),
                config.member_name.clone(),
                consensus,
                tx.clone(),
                config.commit_timeout,
            ),
            listener_support: listener_support.clone(),
            candidate_listener: CandidateListChangeListener::new(),
            owner_listener: EntityOwnerChangeListener::new(config.member_name.clone()),
            statistics: OwnershipStatistics::new(),
            strategies: StrategyRegistry::new(config.strategies.clone()),
            down_peers: HashSet::new(),
            scheduled: HashMap::new(),
            next_task_id: 1,
            metrics: metrics.clone(),
        };

        let join = tokio::spawn(shard.run(inbox, shutdown_rx, events, changes));

        let handle = ShardHandle {
            member: config.member_name,
            tx,
            shutdown_tx,
            metrics,
            listener_support,
        };
        Ok((handle, join))
    }
}

/// Coordination state machine of one shard replica.
pub struct EntityOwnershipShard {
    shard_name: String,
    local_member: MemberName,
    consensus: Arc<dyn Consensus>,
    store: Arc<dyn DataStore>,
    commit: CommitCoordinator,
    link: ShardLink,
    listener_support: Arc<ListenerSupport>,
    candidate_listener: CandidateListChangeListener,
    owner_listener: EntityOwnerChangeListener,
    statistics: OwnershipStatistics,
    strategies: StrategyRegistry,
    /// Members believed unreachable. Only maintained meaningfully while leader.
    down_peers: HashSet<MemberName>,
    scheduled: HashMap<Entity, ScheduledSelection>,
    next_task_id: u64,
    metrics: Arc<ShardMetrics>,
}

impl EntityOwnershipShard {
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<ShardMessage>,
        mut shutdown_rx: mpsc::Receiver<()>,
        mut events: mpsc::UnboundedReceiver<ClusterEvent>,
        mut changes: mpsc::UnboundedReceiver<TreeChangeBatch>,
    ) {
        info!(shard = %self.shard_name, member = %self.local_member, "Entity ownership shard started");

        // Pick up whatever role the replica already has.
        self.on_state_changed();
        if self.is_leader() {
            self.on_became_leader();
        }

        loop {
            tokio::select! {
                biased;

                Some(event) = events.recv() => self.handle_cluster_event(event),
                Some(message) = inbox.recv() => self.handle_message(message),
                Some(batch) = changes.recv() => self.handle_tree_changes(batch),
                _ = shutdown_rx.recv() => {
                    info!(shard = %self.shard_name, "Entity ownership shard shutting down");
                    break;
                }
                else => break,
            }
        }

        for (_, scheduled) in self.scheduled.drain() {
            scheduled.token.cancel();
        }
    }

    fn is_leader(&self) -> bool {
        self.consensus.is_leader()
    }

    fn handle_message(&mut self, message: ShardMessage) {
        debug!(shard = %self.shard_name, message = ?message, "Handling shard message");

        match message {
            ShardMessage::RegisterCandidateLocal { entity, reply } => {
                let modification = model::candidate_merge(&entity, &self.local_member);
                self.commit.commit_modification(modification, &mut self.link);
                let _ = reply.send(Ok(()));
            }
            ShardMessage::UnregisterCandidateLocal { entity, reply } => {
                let modification = model::candidate_delete(&entity, &self.local_member);
                self.commit.commit_modification(modification, &mut self.link);
                let _ = reply.send(Ok(()));
            }
            ShardMessage::RegisterListenerLocal {
                entity_type,
                listener,
                reply,
            } => {
                let added = self
                    .listener_support
                    .add_listener(&entity_type, listener.clone());
                let _ = reply.send(Ok(()));
                if added {
                    self.backfill_listener(&entity_type, &listener);
                }
            }
            ShardMessage::UnregisterListenerLocal {
                entity_type,
                listener,
                reply,
            } => {
                self.listener_support.remove_listener(&entity_type, &listener);
                let _ = reply.send(Ok(()));
            }
            ShardMessage::SelectOwner {
                entity,
                candidates,
                task_id,
            } => self.on_select_owner(entity, candidates, task_id),
            ShardMessage::RemoveAllCandidates { member, reply } => {
                self.on_remove_all_candidates(member, reply)
            }
            ShardMessage::CommitComplete { id, result } => {
                self.commit.on_commit_result(&id, result, &mut self.link)
            }
            ShardMessage::CommitRetry { id } => self.commit.on_retry(&id, &mut self.link),
            ShardMessage::InitialPurgeDone => self.link.on_initial_purge_done(),
            ShardMessage::Status { reply } => {
                let mut down_peers: Vec<_> = self.down_peers.iter().cloned().collect();
                down_peers.sort();
                let _ = reply.send(ShardStatus {
                    is_leader: self.is_leader(),
                    down_peers,
                    pending_modifications: self.commit.pending_len(),
                    inflight: self.commit.inflight_id().cloned(),
                    inflight_modifications: self.commit.inflight_modifications().len(),
                    scheduled_selections: self.scheduled.len(),
                });
            }
        }
    }

    fn handle_cluster_event(&mut self, event: ClusterEvent) {
        event.log(&self.shard_name);

        match event {
            ClusterEvent::StateChanged { .. } => self.on_state_changed(),
            ClusterEvent::LeaderChanged { .. } => self.on_leader_changed(),
            ClusterEvent::VotingStateChanged => {
                if self.is_leader() {
                    self.reassign_owners(|_| true, true);
                }
            }
            ClusterEvent::PeerUp(member) => self.on_peer_up(member),
            ClusterEvent::PeerDown(member) => self.on_peer_down(member),
        }
    }

    fn handle_tree_changes(&mut self, batch: TreeChangeBatch) {
        self.owner_listener
            .on_changes(&batch, &mut self.statistics, &self.listener_support);

        for event in self.candidate_listener.on_changes(&batch) {
            match event {
                CandidateEvent::Added {
                    entity,
                    new_candidate,
                    all_candidates,
                } => self.on_candidate_added(entity, new_candidate, all_candidates),
                CandidateEvent::Removed {
                    entity,
                    removed_candidate,
                    remaining_candidates,
                } => self.on_candidate_removed(entity, removed_candidate, remaining_candidates),
            }
        }
    }

    // ==================== Role changes ====================

    fn on_state_changed(&mut self) {
        let is_leader = self.is_leader();
        self.metrics.set_leader(is_leader);

        let in_jeopardy = self.consensus.raft_state().in_jeopardy();
        let was_in_jeopardy = self.listener_support.set_in_jeopardy(in_jeopardy);
        if in_jeopardy != was_in_jeopardy {
            info!(
                shard = %self.shard_name,
                in_jeopardy,
                "Jeopardy state changed, notifying all listeners"
            );
            self.notify_all_listeners();
        }

        self.commit.on_state_changed(&mut self.link);
    }

    fn on_leader_changed(&mut self) {
        let is_leader = self.is_leader();
        self.metrics.set_leader(is_leader);

        if is_leader {
            self.on_became_leader();
        } else {
            // Staying a follower under a new leader still needs pending work forwarded.
            self.commit.on_state_changed(&mut self.link);
        }
    }

    fn on_became_leader(&mut self) {
        // The previous leader is most likely down, even if no PeerDown arrived yet.
        self.down_peers = self
            .consensus
            .cluster_members()
            .into_iter()
            .filter(|m| m.is_down() && m.name != self.local_member)
            .map(|m| m.name)
            .collect();
        self.update_down_peers_gauge();

        // Strategies may hold state computed while not leader.
        self.strategies.clear();

        info!(
            shard = %self.shard_name,
            down_peers = self.down_peers.len(),
            "Became shard leader, reassigning owners of down members and ownerless entities"
        );

        let down = self.down_peers.clone();
        self.reassign_owners(
            |owner| owner.map_or(true, |owner| down.contains(owner)),
            false,
        );
    }

    fn on_peer_down(&mut self, member: MemberName) {
        if member == self.local_member {
            return;
        }
        let newly_down = self.down_peers.insert(member.clone());
        self.update_down_peers_gauge();

        if newly_down && self.is_leader() {
            // A sole down candidate keeps ownership, it may only be partitioned.
            self.reassign_owners(|owner| owner == Some(&member), false);
        }
    }

    fn on_peer_up(&mut self, member: MemberName) {
        self.down_peers.remove(&member);
        self.update_down_peers_gauge();

        self.commit.on_state_changed(&mut self.link);

        if self.is_leader() {
            // An owner write may have been lost to a leader change while its candidate write survived.
            self.reassign_owners(|owner| owner.is_none(), false);
        }
    }

    // ==================== Candidate changes ====================

    fn on_candidate_added(
        &mut self,
        entity: Entity,
        new_candidate: MemberName,
        all_candidates: Vec<MemberName>,
    ) {
        if !self.is_leader() {
            return;
        }

        // Only a member itself registers its candidacy, so it is up.
        if self.down_peers.remove(&new_candidate) {
            self.update_down_peers_gauge();
        }

        let current = self.current_owner(&entity);
        let delay = self.strategies.selection_delay(entity.entity_type());
        let available_members = self
            .consensus
            .peers()
            .len()
            .saturating_sub(self.down_peers.len())
            + 1;

        debug!(
            shard = %self.shard_name,
            entity = %entity,
            candidate = %new_candidate,
            current_owner = ?current,
            available_members,
            "Candidate added"
        );

        if delay.is_zero() || all_candidates.len() >= available_members {
            self.cancel_selection(&entity);
            let new_owner = self.new_owner(&entity, current.as_ref(), &all_candidates);
            self.write_new_owner(&entity, new_owner);
        } else {
            self.schedule_selection(entity, all_candidates, delay);
        }
    }

    fn on_candidate_removed(
        &mut self,
        entity: Entity,
        removed_candidate: MemberName,
        remaining_candidates: Vec<MemberName>,
    ) {
        if !self.is_leader() {
            return;
        }

        debug!(
            shard = %self.shard_name,
            entity = %entity,
            candidate = %removed_candidate,
            remaining = remaining_candidates.len(),
            "Candidate removed"
        );

        self.cancel_selection(&entity);
        let current = self.current_owner(&entity);
        let new_owner = self.new_owner(&entity, current.as_ref(), &remaining_candidates);
        self.write_new_owner(&entity, new_owner);
    }

    fn on_select_owner(&mut self, entity: Entity, candidates: Vec<MemberName>, task_id: u64) {
        if self.scheduled.get(&entity).map(|s| s.task_id) != Some(task_id) {
            debug!(shard = %self.shard_name, entity = %entity, task_id, "Ignoring stale owner selection");
            return;
        }
        self.scheduled.remove(&entity);

        if !self.is_leader() {
            return;
        }

        if self.current_owner(&entity).is_none() {
            let new_owner = self.new_owner(&entity, None, &candidates);
            self.write_new_owner(&entity, new_owner);
        }
    }

    fn on_remove_all_candidates(&mut self, member: MemberName, reply: Option<CommitWaiter>) {
        if !self.is_leader() {
            if let Some(reply) = reply {
                let _ = reply.send(Err(CommitError::NotLeader {
                    leader: self.consensus.leader(),
                }));
            }
            return;
        }

        let modifications: Vec<_> = match self.store.read(&model::entity_types_path()) {
            Some(types) => model::entities(&types)
                .into_iter()
                .filter(|(_, view)| view.has_candidate(&member))
                .map(|(entity, _)| model::candidate_delete(&entity, &member))
                .collect(),
            None => Vec::new(),
        };

        info!(
            shard = %self.shard_name,
            %member,
            candidates = modifications.len(),
            "Removing all candidates of member"
        );

        match reply {
            Some(reply) => {
                self.commit
                    .commit_modifications_with_waiter(modifications, reply, &mut self.link)
            }
            None => self.commit.commit_modifications(modifications, &mut self.link),
        }
    }

    // ==================== Owner selection ====================

    /// Owner of the entity once queued writes commit, falling back to committed state.
    fn current_owner(&self, entity: &Entity) -> Option<MemberName> {
        match self.commit.effective_owner(entity) {
            Some(owner) => owner,
            None => model::owner_value(
                self.store
                    .read(&model::owner_path(entity))
                    .as_ref()
                    .and_then(|node| node.value()),
            ),
        }
    }

    /// Choose an owner among the viable candidates, `None` when there are none.
    fn new_owner(
        &mut self,
        entity: &Entity,
        current: Option<&MemberName>,
        candidates: &[MemberName],
    ) -> Option<MemberName> {
        let viable: Vec<MemberName> = candidates
            .iter()
            .filter(|c| {
                !self.down_peers.contains(*c)
                    && self.consensus.voting_state(c) != VotingState::NonVoting
            })
            .cloned()
            .collect();
        if viable.is_empty() {
            return None;
        }

        let strategy = self
            .strategies
            .strategy(entity.entity_type(), &self.statistics);
        Some(strategy.new_owner(current, &viable))
    }

    fn write_new_owner(&mut self, entity: &Entity, new_owner: Option<MemberName>) {
        let current = self.current_owner(entity);
        if current == new_owner {
            debug!(shard = %self.shard_name, entity = %entity, owner = ?new_owner, "Owner unchanged");
            return;
        }

        debug!(
            shard = %self.shard_name,
            entity = %entity,
            old_owner = ?current,
            new_owner = ?new_owner,
            "Writing new owner"
        );
        self.metrics.owner_writes.inc();
        self.commit
            .commit_modification(model::owner_write(entity, new_owner.as_ref()), &mut self.link);
    }

    /// Recompute the owner of every entity whose current owner matches `owned_by`.
    ///
    /// Empty results are only written when `write_empty` is set, so an entity
    /// whose remaining candidates are all unviable keeps its owner.
    fn reassign_owners<F>(&mut self, owned_by: F, write_empty: bool)
    where
        F: Fn(Option<&MemberName>) -> bool,
    {
        let Some(types) = self.store.read(&model::entity_types_path()) else {
            return;
        };

        let mut modifications = Vec::new();
        for (entity, view) in model::entities(&types) {
            let current = self
                .commit
                .effective_owner(&entity)
                .unwrap_or_else(|| view.owner());
            if !owned_by(current.as_ref()) {
                continue;
            }

            let new_owner = self.new_owner(&entity, current.as_ref(), &view.candidates());
            if new_owner == current || (new_owner.is_none() && !write_empty) {
                continue;
            }

            debug!(
                shard = %self.shard_name,
                entity = %entity,
                old_owner = ?current,
                new_owner = ?new_owner,
                "Reassigning owner"
            );
            self.cancel_selection(&entity);
            modifications.push(model::owner_write(&entity, new_owner.as_ref()));
        }

        self.metrics.owner_writes.inc_by(modifications.len() as u64);
        self.commit.commit_modifications(modifications, &mut self.link);
    }

    fn schedule_selection(&mut self, entity: Entity, candidates: Vec<MemberName>, delay: Duration) {
        self.cancel_selection(&entity);

        let task_id = self.next_task_id;
        self.next_task_id += 1;
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let tx = self.link.sender().clone();
        let scheduled_entity = entity.clone();

        debug!(
            shard = %self.shard_name,
            entity = %entity,
            delay_ms = delay.as_millis() as u64,
            task_id,
            "Scheduling owner selection"
        );

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(ShardMessage::SelectOwner {
                        entity: scheduled_entity,
                        candidates,
                        task_id,
                    });
                }
            }
        });

        self.scheduled
            .insert(entity, ScheduledSelection { task_id, token });
    }

    fn cancel_selection(&mut self, entity: &Entity) {
        if let Some(scheduled) = self.scheduled.remove(entity) {
            scheduled.token.cancel();
        }
    }

    // ==================== Listeners ====================

    /// Replay the current owner of every existing entity of the type to a new listener.
    fn backfill_listener(&self, entity_type: &str, listener: &Arc<dyn EntityOwnershipListener>) {
        let (index, types) = self.store.read_indexed(&model::entity_types_path());

        let mut replayed = 0usize;
        if let Some(types) = types {
            for (entity, view) in model::entities(&types) {
                if entity.entity_type() != entity_type {
                    continue;
                }
                let owner = view.owner();
                let is_owner = owner.as_ref() == Some(&self.local_member);
                self.listener_support
                    .notify_listener(listener, &entity, false, is_owner, owner.is_some());
                replayed += 1;
            }
        }

        self.listener_support.mark_synced(entity_type, listener, index);
        debug!(shard = %self.shard_name, entity_type, index, replayed, "Backfilled ownership listener");
    }

    /// Re-announce every owned entity, carrying the current jeopardy flag.
    fn notify_all_listeners(&self) {
        let Some(types) = self.store.read(&model::entity_types_path()) else {
            return;
        };
        for (entity, view) in model::entities(&types) {
            let owner = view.owner();
            let is_owner = owner.as_ref() == Some(&self.local_member);
            self.listener_support
                .notify(&entity, is_owner, is_owner, owner.is_some(), None);
        }
    }

    fn update_down_peers_gauge(&self) {
        self.metrics.down_peers.set(self.down_peers.len() as i64);
    }
}

/// Handle for sending commands to a running shard.
#[derive(Clone)]
pub struct ShardHandle {
    member: MemberName,
    tx: mpsc::UnboundedSender<ShardMessage>,
    shutdown_tx: mpsc::Sender<()>,
    metrics: Arc<ShardMetrics>,
    listener_support: Arc<ListenerSupport>,
}

impl ShardHandle {
    /// Member this shard replica runs on.
    pub fn member(&self) -> &MemberName {
        &self.member
    }

    pub fn metrics(&self) -> &Arc<ShardMetrics> {
        &self.metrics
    }

    pub fn listener_support(&self) -> &Arc<ListenerSupport> {
        &self.listener_support
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ShardMessage,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| Error::ShardStopped)?;
        rx.await.map_err(|_| Error::ShardStopped)
    }

    /// Queue registration of the local member as a candidate.
    ///
    /// Returns once the intent is queued, not once it is replicated.
    pub async fn register_candidate(&self, entity: Entity) -> Result<()> {
        self.request(|reply| ShardMessage::RegisterCandidateLocal { entity, reply })
            .await?
    }

    pub async fn unregister_candidate(&self, entity: Entity) -> Result<()> {
        self.request(|reply| ShardMessage::UnregisterCandidateLocal { entity, reply })
            .await?
    }

    pub async fn register_listener(
        &self,
        entity_type: impl Into<String>,
        listener: Arc<dyn EntityOwnershipListener>,
    ) -> Result<()> {
        let entity_type = entity_type.into();
        self.request(|reply| ShardMessage::RegisterListenerLocal {
            entity_type,
            listener,
            reply,
        })
        .await?
    }

    pub async fn unregister_listener(
        &self,
        entity_type: impl Into<String>,
        listener: Arc<dyn EntityOwnershipListener>,
    ) -> Result<()> {
        let entity_type = entity_type.into();
        self.request(|reply| ShardMessage::UnregisterListenerLocal {
            entity_type,
            listener,
            reply,
        })
        .await?
    }

    /// Ask this shard, which must lead, to delete every candidate entry of `member`.
    ///
    /// Resolves once the deletions are committed.
    pub async fn remove_all_candidates(&self, member: MemberName) -> std::result::Result<(), CommitError> {
        let (reply, rx) = oneshot::channel();
        let message = ShardMessage::RemoveAllCandidates {
            member,
            reply: Some(reply),
        };
        if self.tx.send(message).is_err() {
            return Err(CommitError::Internal("shard stopped".into()));
        }
        rx.await
            .unwrap_or_else(|_| Err(CommitError::Internal("shard stopped".into())))
    }

    /// Current coordination state.
    pub async fn status(&self) -> Result<ShardStatus> {
        self.request(|reply| ShardMessage::Status { reply }).await
    }

    /// Stop the shard loop.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    /// Whether the shard loop is still accepting messages.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

impl std::fmt::Debug for ShardHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardHandle")
            .field("member", &self.member)
            .field("running", &self.is_running())
            .finish()
    }
}
