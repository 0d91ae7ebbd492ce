//! Messages processed by the shard loop.

use super::commit::CommitWaiter;
use crate::error::{CommitError, Result};
use crate::listener::EntityOwnershipListener;
use crate::types::{Entity, MemberName, TransactionId};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Point-in-time view of the shard's coordination state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardStatus {
    pub is_leader: bool,
    pub down_peers: Vec<MemberName>,
    pub pending_modifications: usize,
    pub inflight: Option<TransactionId>,
    pub inflight_modifications: usize,
    pub scheduled_selections: usize,
}

/// Inbox message of an ownership shard.
pub enum ShardMessage {
    RegisterCandidateLocal {
        entity: Entity,
        reply: oneshot::Sender<Result<()>>,
    },
    UnregisterCandidateLocal {
        entity: Entity,
        reply: oneshot::Sender<Result<()>>,
    },
    RegisterListenerLocal {
        entity_type: String,
        listener: Arc<dyn EntityOwnershipListener>,
        reply: oneshot::Sender<Result<()>>,
    },
    UnregisterListenerLocal {
        entity_type: String,
        listener: Arc<dyn EntityOwnershipListener>,
        reply: oneshot::Sender<Result<()>>,
    },
    /// A delayed owner selection fired.
    SelectOwner {
        entity: Entity,
        candidates: Vec<MemberName>,
        task_id: u64,
    },
    /// Leader-only removal of every candidate entry of `member`.
    RemoveAllCandidates {
        member: MemberName,
        reply: Option<CommitWaiter>,
    },
    CommitComplete {
        id: TransactionId,
        result: std::result::Result<(), CommitError>,
    },
    CommitRetry {
        id: TransactionId,
    },
    /// The initial stale-candidate purge was acknowledged or gave up.
    InitialPurgeDone,
    Status {
        reply: oneshot::Sender<ShardStatus>,
    },
}

impl fmt::Debug for ShardMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardMessage::RegisterCandidateLocal { entity, .. } => {
                write!(f, "RegisterCandidateLocal({})", entity)
            }
            ShardMessage::UnregisterCandidateLocal { entity, .. } => {
                write!(f, "UnregisterCandidateLocal({})", entity)
            }
            ShardMessage::RegisterListenerLocal { entity_type, .. } => {
                write!(f, "RegisterListenerLocal({})", entity_type)
            }
            ShardMessage::UnregisterListenerLocal { entity_type, .. } => {
                write!(f, "UnregisterListenerLocal({})", entity_type)
            }
            ShardMessage::SelectOwner { entity, task_id, .. } => {
                write!(f, "SelectOwner({}, task {})", entity, task_id)
            }
            ShardMessage::RemoveAllCandidates { member, .. } => {
                write!(f, "RemoveAllCandidates({})", member)
            }
            ShardMessage::CommitComplete { id, result } => {
                write!(f, "CommitComplete({}, {:?})", id, result)
            }
            ShardMessage::CommitRetry { id } => write!(f, "CommitRetry({})", id),
            ShardMessage::InitialPurgeDone => write!(f, "InitialPurgeDone"),
            ShardMessage::Status { .. } => write!(f, "Status"),
        }
    }
}
