//! Error types for the ownership service.

use crate::types::{Entity, MemberName};
use thiserror::Error;

/// Result type alias for ownership operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the ownership service.
#[derive(Error, Debug)]
pub enum Error {
    /// A commit failed in the consensus layer.
    #[error("commit error: {0}")]
    Commit(#[from] CommitError),

    /// The local member is already registered as a candidate for the entity.
    #[error("candidate already registered for entity {0}")]
    CandidateAlreadyRegistered(Entity),

    /// Malformed entity type or identifier.
    #[error("invalid entity: {0}")]
    InvalidEntity(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The shard's message loop has stopped.
    #[error("ownership shard stopped")]
    ShardStopped,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Encoding or decoding of a log payload failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Failures reported by the consensus primitive for a submitted batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitError {
    /// There is currently no leader to accept the batch.
    #[error("no shard leader")]
    NoLeader,

    /// The contacted replica is not the leader.
    #[error("not leader, leader is: {leader:?}")]
    NotLeader { leader: Option<MemberName> },

    /// Proposal was dropped before it was committed.
    #[error("proposal dropped")]
    ProposalDropped,

    /// No acknowledgement arrived in time.
    #[error("commit timed out")]
    Timeout,

    /// Internal consensus error.
    #[error("consensus internal: {0}")]
    Internal(String),
}

impl CommitError {
    /// Whether the failure only means there was no leader.
    ///
    /// Such a batch was never accepted by anyone, so it may be resubmitted under the
    /// same transaction id. Every other failure leaves the commit state ambiguous.
    pub fn is_no_leader(&self) -> bool {
        matches!(self, CommitError::NoLeader)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
