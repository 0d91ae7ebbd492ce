//! Narrow interface to the leader-replicated commit primitive.
//!
//! The ownership shard does not run consensus itself. It asks the primitive who
//! leads, submits modification batches, forwards leader-only requests and reacts
//! to [`ClusterEvent`]s.

use crate::cluster::ClusterEvent;
use crate::error::CommitError;
use crate::model::ModificationBatch;
use crate::types::{ClusterMember, MemberName, PeerInfo, RaftState, VotingState};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Requests a follower hands to the shard instance on the current leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaderRequest {
    /// Delete every candidate entry registered by `member`.
    RemoveAllCandidates { member: MemberName },
}

/// The consensus primitive as seen by one ownership shard replica.
#[async_trait]
pub trait Consensus: Send + Sync + 'static {
    /// Whether the local replica currently leads.
    fn is_leader(&self) -> bool;

    /// Current leader, if one is known.
    fn leader(&self) -> Option<MemberName>;

    /// Whether the leader is able to commit, i.e. not isolated from its quorum.
    fn has_active_leader(&self) -> bool;

    fn raft_state(&self) -> RaftState;

    /// Consensus peers of the local replica, excluding itself.
    fn peers(&self) -> Vec<PeerInfo>;

    /// Voting eligibility of `member`. Unknown members count as voting.
    fn voting_state(&self, member: &MemberName) -> VotingState {
        self.peers()
            .into_iter()
            .find(|p| &p.member == member)
            .map_or(VotingState::Voting, |p| p.voting_state)
    }

    /// Current cluster membership snapshot.
    fn cluster_members(&self) -> Vec<ClusterMember>;

    /// Replicate a batch.
    ///
    /// A leader appends the batch to its log, a follower forwards it to the leader.
    /// Resolves once the batch is committed or has definitely failed.
    async fn submit(&self, batch: ModificationBatch) -> Result<(), CommitError>;

    /// Deliver a request to the shard on the current leader and wait for its reply.
    async fn send_to_leader(&self, request: LeaderRequest) -> Result<(), CommitError>;

    /// Subscribe to role, leadership, voting and membership events.
    fn subscribe_events(&self) -> mpsc::UnboundedReceiver<ClusterEvent>;
}
