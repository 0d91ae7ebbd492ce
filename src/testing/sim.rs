//! In-process cluster that stands in for the consensus primitive.
//!
//! Every member gets a [`ShardDataTree`] replica and a [`SimReplica`] implementing
//! [`Consensus`]. Submitted batches are appended to one shared log and applied to
//! every replica synchronously, so a successful submit means every member has
//! already applied the entry. Leadership, reachability and voting are driven
//! explicitly by the test.

use crate::cluster::ClusterEvent;
use crate::config::OwnershipConfig;
use crate::consensus::{Consensus, LeaderRequest};
use crate::datastore::{DataStore, ShardDataTree};
use crate::error::{CommitError, Error, Result};
use crate::model::{self, EntityView, ModificationBatch};
use crate::service::EntityOwnershipService;
use crate::shard::ShardHandle;
use crate::types::{
    ClusterMember, Entity, MemberName, MemberStatus, PeerInfo, RaftState, VotingState,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// A batch as it reached the simulated consensus layer.
#[derive(Debug, Clone)]
pub struct Submission {
    pub submitter: MemberName,
    pub batch: ModificationBatch,
}

struct HeldSubmission {
    batch: ModificationBatch,
    reply: oneshot::Sender<std::result::Result<(), CommitError>>,
}

struct SimMember {
    name: MemberName,
    store: Arc<ShardDataTree>,
    status: MemberStatus,
    reachable: bool,
    voting: VotingState,
    raft_state: RaftState,
    /// Leader as known by this member.
    leader: Option<MemberName>,
    events: Vec<mpsc::UnboundedSender<ClusterEvent>>,
    shard: Option<ShardHandle>,
}

impl SimMember {
    fn emit(&mut self, event: ClusterEvent) {
        self.events.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

struct LogEntry {
    term: u64,
    data: Bytes,
}

struct SimState {
    members: Vec<SimMember>,
    term: u64,
    log: Vec<LogEntry>,
    hold: bool,
    held: Vec<HeldSubmission>,
    fail_next: VecDeque<CommitError>,
    submissions: Vec<Submission>,
}

impl SimState {
    fn member(&self, name: &MemberName) -> Option<&SimMember> {
        self.members.iter().find(|m| &m.name == name)
    }

    fn member_mut(&mut self, name: &MemberName) -> Option<&mut SimMember> {
        self.members.iter_mut().find(|m| &m.name == name)
    }

    /// The leader as seen by `name`, if it is able to commit.
    fn active_leader_of(&self, name: &MemberName) -> Option<MemberName> {
        let leader = self.member(name)?.leader.clone()?;
        let leader_state = self.member(&leader)?.raft_state;
        (leader_state == RaftState::Leader).then_some(leader)
    }

    fn append(&mut self, batch: &ModificationBatch) -> std::result::Result<(), CommitError> {
        let data = Bytes::from(
            batch
                .to_bytes()
                .map_err(|e| CommitError::Internal(e.to_string()))?,
        );
        self.log.push(LogEntry {
            term: self.term,
            data: data.clone(),
        });
        let index = self.log.len() as u64;
        debug!(
            index,
            transaction_id = %batch.transaction_id,
            modifications = batch.modifications.len(),
            "Appending batch to simulated log"
        );
        for member in &self.members {
            member.store.apply(index, self.term, &data);
        }
        Ok(())
    }

    fn set_role(&mut self, name: &MemberName, raft_state: RaftState, leader: Option<MemberName>) {
        let Some(member) = self.member_mut(name) else {
            return;
        };
        let old_state = std::mem::replace(&mut member.raft_state, raft_state);
        let old_leader = std::mem::replace(&mut member.leader, leader.clone());
        if old_state != raft_state {
            member.emit(ClusterEvent::StateChanged {
                old: old_state,
                new: raft_state,
            });
        }
        if old_leader != leader {
            member.emit(ClusterEvent::LeaderChanged {
                old: old_leader,
                new: leader,
            });
        }
    }
}

/// A simulated cluster of ownership shard replicas.
#[derive(Clone)]
pub struct SimulatedCluster {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedCluster {
    /// Create a cluster of up, reachable, voting members without a leader.
    pub fn new<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<MemberName>,
    {
        let members = members
            .into_iter()
            .map(|name| SimMember {
                name: name.into(),
                store: Arc::new(ShardDataTree::new()),
                status: MemberStatus::Up,
                reachable: true,
                voting: VotingState::Voting,
                raft_state: RaftState::Follower,
                leader: None,
                events: Vec::new(),
                shard: None,
            })
            .collect();

        Self {
            state: Arc::new(Mutex::new(SimState {
                members,
                term: 0,
                log: Vec::new(),
                hold: false,
                held: Vec::new(),
                fail_next: VecDeque::new(),
                submissions: Vec::new(),
            })),
        }
    }

    pub fn members(&self) -> Vec<MemberName> {
        self.state.lock().members.iter().map(|m| m.name.clone()).collect()
    }

    /// Consensus view of `member`.
    pub fn replica(&self, member: impl Into<MemberName>) -> Arc<SimReplica> {
        Arc::new(SimReplica {
            member: member.into(),
            state: self.state.clone(),
        })
    }

    /// Tree replica of `member`.
    pub fn store(&self, member: impl Into<MemberName>) -> Option<Arc<ShardDataTree>> {
        let member = member.into();
        self.state.lock().member(&member).map(|m| m.store.clone())
    }

    /// Start the ownership service of the member named in `config`.
    pub fn start(&self, config: OwnershipConfig) -> Result<EntityOwnershipService> {
        let member = config.member_name.clone();
        let store = self
            .store(member.clone())
            .ok_or_else(|| Error::Config(format!("unknown member {}", member)))?;
        let service = EntityOwnershipService::start(config, self.replica(member.clone()), store)?;
        self.attach(member, service.shard().clone());
        Ok(service)
    }

    /// Replace the tree replica of `member` with a fresh one rebuilt from the log,
    /// as after a process restart.
    pub fn reset_store(&self, member: impl Into<MemberName>) -> Option<Arc<ShardDataTree>> {
        let member = member.into();
        let mut state = self.state.lock();
        let store = Arc::new(ShardDataTree::new());
        for (i, entry) in state.log.iter().enumerate() {
            store.apply(i as u64 + 1, entry.term, &entry.data);
        }
        let m = state.member_mut(&member)?;
        m.store = store.clone();
        m.events.clear();
        m.shard = None;
        Some(store)
    }

    /// Route leader requests for `member` to `shard`.
    pub fn attach(&self, member: impl Into<MemberName>, shard: ShardHandle) {
        let member = member.into();
        if let Some(m) = self.state.lock().member_mut(&member) {
            m.shard = Some(shard);
        }
    }

    /// Make `leader` the leader of a new term, as seen by every member.
    pub fn elect(&self, leader: impl Into<MemberName>) {
        let leader = leader.into();
        let mut state = self.state.lock();
        state.term += 1;
        let names: Vec<_> = state.members.iter().map(|m| m.name.clone()).collect();
        for name in names {
            let role = if name == leader {
                RaftState::Leader
            } else {
                RaftState::Follower
            };
            state.set_role(&name, role, Some(leader.clone()));
        }
    }

    /// Every member loses its leader and starts campaigning.
    pub fn no_leader(&self) {
        let mut state = self.state.lock();
        let names: Vec<_> = state.members.iter().map(|m| m.name.clone()).collect();
        for name in names {
            state.set_role(&name, RaftState::Candidate, None);
        }
    }

    /// The current leader loses its quorum but keeps believing it leads.
    pub fn isolate_leader(&self) {
        self.set_leader_state(RaftState::Leader, RaftState::IsolatedLeader);
    }

    /// An isolated leader regains its quorum.
    pub fn heal_leader(&self) {
        self.set_leader_state(RaftState::IsolatedLeader, RaftState::Leader);
    }

    fn set_leader_state(&self, from: RaftState, to: RaftState) {
        let mut state = self.state.lock();
        let leaders: Vec<_> = state
            .members
            .iter()
            .filter(|m| m.raft_state == from)
            .map(|m| (m.name.clone(), m.leader.clone()))
            .collect();
        for (name, leader) in leaders {
            state.set_role(&name, to, leader);
        }
    }

    /// Mark `member` unreachable and tell every other member.
    pub fn peer_down(&self, member: impl Into<MemberName>) {
        self.set_reachable(member.into(), false);
    }

    pub fn peer_up(&self, member: impl Into<MemberName>) {
        self.set_reachable(member.into(), true);
    }

    fn set_reachable(&self, member: MemberName, reachable: bool) {
        let mut state = self.state.lock();
        if let Some(m) = state.member_mut(&member) {
            m.reachable = reachable;
        }
        for other in state.members.iter_mut().filter(|m| m.name != member) {
            let event = if reachable {
                ClusterEvent::PeerUp(member.clone())
            } else {
                ClusterEvent::PeerDown(member.clone())
            };
            other.emit(event);
        }
    }

    /// Change the voting eligibility of `member` and tell every member.
    pub fn set_voting(&self, member: impl Into<MemberName>, voting: VotingState) {
        let member = member.into();
        let mut state = self.state.lock();
        if let Some(m) = state.member_mut(&member) {
            m.voting = voting;
        }
        for m in state.members.iter_mut() {
            m.emit(ClusterEvent::VotingStateChanged);
        }
    }

    /// While set, accepted batches wait for [`release_held`](Self::release_held).
    pub fn hold_submissions(&self, hold: bool) {
        self.state.lock().hold = hold;
    }

    /// Commit every held batch in submission order.
    pub fn release_held(&self) -> usize {
        let mut state = self.state.lock();
        let held = std::mem::take(&mut state.held);
        let count = held.len();
        for HeldSubmission { batch, reply } in held {
            let result = state.append(&batch);
            let _ = reply.send(result);
        }
        count
    }

    /// Fail every held batch with `error` without committing it.
    pub fn fail_held(&self, error: CommitError) -> usize {
        let held = std::mem::take(&mut self.state.lock().held);
        let count = held.len();
        for HeldSubmission { reply, .. } in held {
            let _ = reply.send(Err(error.clone()));
        }
        count
    }

    pub fn held_len(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Fail the next submission with `error`.
    pub fn fail_next(&self, error: CommitError) {
        self.state.lock().fail_next.push_back(error);
    }

    /// Every batch that reached the consensus layer, in arrival order.
    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    pub fn clear_submissions(&self) {
        self.state.lock().submissions.clear();
    }

    /// Last applied log index.
    pub fn log_index(&self) -> u64 {
        self.state.lock().log.len() as u64
    }

    /// Owner of `entity` in the committed tree.
    pub fn owner(&self, entity: &Entity) -> Option<MemberName> {
        self.entity_view(entity, |view| view.owner()).flatten()
    }

    /// Candidates of `entity` in the committed tree, in registration order.
    pub fn candidates(&self, entity: &Entity) -> Vec<MemberName> {
        self.entity_view(entity, |view| view.candidates())
            .unwrap_or_default()
    }

    fn entity_view<T>(&self, entity: &Entity, f: impl FnOnce(EntityView<'_>) -> T) -> Option<T> {
        let store = self.state.lock().members.first().map(|m| m.store.clone())?;
        let node = store.read(&model::entity_path(entity))?;
        Some(f(EntityView::new(&node)))
    }
}

impl std::fmt::Debug for SimulatedCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimulatedCluster")
            .field("members", &state.members.len())
            .field("term", &state.term)
            .field("log_index", &state.log.len())
            .finish()
    }
}

/// The simulated consensus primitive as seen by one member.
pub struct SimReplica {
    member: MemberName,
    state: Arc<Mutex<SimState>>,
}

impl SimReplica {
    fn with_member<T>(&self, f: impl FnOnce(&SimMember) -> T) -> Option<T> {
        self.state.lock().member(&self.member).map(f)
    }
}

#[async_trait]
impl Consensus for SimReplica {
    fn is_leader(&self) -> bool {
        self.with_member(|m| {
            matches!(m.raft_state, RaftState::Leader | RaftState::IsolatedLeader)
        })
        .unwrap_or(false)
    }

    fn leader(&self) -> Option<MemberName> {
        self.with_member(|m| m.leader.clone()).flatten()
    }

    fn has_active_leader(&self) -> bool {
        self.state.lock().active_leader_of(&self.member).is_some()
    }

    fn raft_state(&self) -> RaftState {
        self.with_member(|m| m.raft_state)
            .unwrap_or(RaftState::Follower)
    }

    fn peers(&self) -> Vec<PeerInfo> {
        self.state
            .lock()
            .members
            .iter()
            .filter(|m| m.name != self.member)
            .map(|m| PeerInfo {
                member: m.name.clone(),
                voting_state: m.voting,
            })
            .collect()
    }

    fn voting_state(&self, member: &MemberName) -> VotingState {
        self.state
            .lock()
            .member(member)
            .map_or(VotingState::Voting, |m| m.voting)
    }

    fn cluster_members(&self) -> Vec<ClusterMember> {
        self.state
            .lock()
            .members
            .iter()
            .map(|m| ClusterMember {
                name: m.name.clone(),
                status: m.status,
                reachable: m.reachable,
            })
            .collect()
    }

    async fn submit(&self, batch: ModificationBatch) -> std::result::Result<(), CommitError> {
        let held = {
            let mut state = self.state.lock();
            state.submissions.push(Submission {
                submitter: self.member.clone(),
                batch: batch.clone(),
            });

            if let Some(error) = state.fail_next.pop_front() {
                return Err(error);
            }
            if state.active_leader_of(&self.member).is_none() {
                return Err(CommitError::NoLeader);
            }

            if state.hold {
                let (reply, rx) = oneshot::channel();
                state.held.push(HeldSubmission { batch, reply });
                rx
            } else {
                return state.append(&batch);
            }
        };

        held.await.unwrap_or(Err(CommitError::ProposalDropped))
    }

    async fn send_to_leader(&self, request: LeaderRequest) -> std::result::Result<(), CommitError> {
        let shard = {
            let state = self.state.lock();
            let leader = state
                .active_leader_of(&self.member)
                .ok_or(CommitError::NoLeader)?;
            state
                .member(&leader)
                .and_then(|m| m.shard.clone())
                .ok_or_else(|| CommitError::Internal(format!("no shard attached for {}", leader)))?
        };

        match request {
            LeaderRequest::RemoveAllCandidates { member } => shard.remove_all_candidates(member).await,
        }
    }

    fn subscribe_events(&self) -> mpsc::UnboundedReceiver<ClusterEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(m) = self.state.lock().member_mut(&self.member) {
            m.events.push(tx);
        }
        rx
    }
}

impl std::fmt::Debug for SimReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimReplica")
            .field("member", &self.member)
            .finish()
    }
}
