//! Cluster role and membership events.

use crate::types::{MemberName, RaftState};

/// Events published by the consensus primitive to the ownership shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// The local replica's consensus role changed.
    StateChanged {
        /// Previous role.
        old: RaftState,
        /// New role.
        new: RaftState,
    },

    /// The shard leader changed.
    LeaderChanged {
        /// Previous leader, if any.
        old: Option<MemberName>,
        /// New leader, if any.
        new: Option<MemberName>,
    },

    /// A peer's voting eligibility changed.
    VotingStateChanged,

    /// A member was confirmed reachable and up.
    PeerUp(MemberName),

    /// A member became unreachable or left.
    PeerDown(MemberName),
}

impl ClusterEvent {
    /// Log the event at the level it warrants.
    pub fn log(&self, shard: &str) {
        match self {
            ClusterEvent::StateChanged { old, new } => {
                tracing::info!(shard, %old, %new, "Shard role changed");
            }
            ClusterEvent::LeaderChanged { old, new } => {
                tracing::info!(shard, old = ?old, new = ?new, "Shard leader changed");
            }
            ClusterEvent::VotingStateChanged => {
                tracing::info!(shard, "Peer voting states changed");
            }
            ClusterEvent::PeerUp(member) => {
                tracing::info!(shard, %member, "Peer up");
            }
            ClusterEvent::PeerDown(member) => {
                tracing::warn!(shard, %member, "Peer down");
            }
        }
    }
}

