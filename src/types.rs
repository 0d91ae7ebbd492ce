//! Core types used throughout the ownership service.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;

/// Name of a cluster member, e.g. `member-1`.
///
/// Member names double as candidate names and owner values in the ownership tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberName(SmolStr);

impl MemberName {
    /// Create a member name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(SmolStr::new(name.as_ref()))
    }

    /// Get the name as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for MemberName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for MemberName {
    fn from(name: String) -> Self {
        Self(SmolStr::from(name))
    }
}

/// Opaque identifier of an entity within its type.
///
/// The identifier is a path of segments. It is treated as a single structured key
/// in the ownership tree, so segments may contain any characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(Vec<String>);

impl EntityId {
    /// Create an identifier from path segments.
    pub fn new<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(Error::InvalidEntity("entity id has no path segments".into()));
        }
        if segments.iter().any(|s| s.is_empty()) {
            return Err(Error::InvalidEntity(format!(
                "entity id {:?} contains an empty segment",
                segments
            )));
        }
        Ok(Self(segments))
    }

    /// Parse a `/`-separated identifier such as `/devices/switch-1`.
    pub fn parse(path: &str) -> Result<Self> {
        Self::new(path.split('/').filter(|s| !s.is_empty()))
    }

    /// Get the path segments.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Wrap already validated segments, used when reading keys back out of the tree.
    pub(crate) fn from_segments(segments: Vec<String>) -> Option<Self> {
        if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
            None
        } else {
            Some(Self(segments))
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.0 {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

/// An externally defined entity subject to single-owner election.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity {
    entity_type: String,
    id: EntityId,
}

impl Entity {
    /// Create an entity, rejecting an empty type.
    pub fn new(entity_type: impl Into<String>, id: EntityId) -> Result<Self> {
        let entity_type = entity_type.into();
        if entity_type.is_empty() {
            return Err(Error::InvalidEntity("entity type is empty".into()));
        }
        Ok(Self { entity_type, id })
    }

    /// Convenience constructor from a type and a `/`-separated id.
    pub fn parse(entity_type: impl Into<String>, id: &str) -> Result<Self> {
        Self::new(entity_type, EntityId::parse(id)?)
    }

    /// Get the entity type.
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Get the entity identifier.
    pub fn id(&self) -> &EntityId {
        &self.id
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.entity_type, self.id)
    }
}

/// Role of the local replica as reported by the consensus engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftState {
    Follower,
    Candidate,
    PreLeader,
    Leader,
    /// Leader that cannot reach a quorum of followers.
    IsolatedLeader,
}

impl RaftState {
    /// Whether ownership claims observed in this state are doubtful.
    pub fn in_jeopardy(self) -> bool {
        matches!(self, RaftState::IsolatedLeader)
    }
}

impl fmt::Display for RaftState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaftState::Follower => write!(f, "follower"),
            RaftState::Candidate => write!(f, "candidate"),
            RaftState::PreLeader => write!(f, "pre-leader"),
            RaftState::Leader => write!(f, "leader"),
            RaftState::IsolatedLeader => write!(f, "isolated-leader"),
        }
    }
}

/// Voting eligibility of a member in the consensus configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VotingState {
    Voting,
    NonVoting,
}

/// Membership status of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Joining,
    WeaklyUp,
    Up,
    Leaving,
    Exiting,
    Down,
    Removed,
}

impl MemberStatus {
    /// Whether the member counts as up for owner selection.
    pub fn is_up(self) -> bool {
        matches!(self, MemberStatus::Up | MemberStatus::WeaklyUp)
    }
}

/// A member as seen in the cluster membership snapshot.
#[derive(Debug, Clone)]
pub struct ClusterMember {
    /// Member name.
    pub name: MemberName,
    /// Current membership status.
    pub status: MemberStatus,
    /// Whether the failure detector currently reaches the member.
    pub reachable: bool,
}

impl ClusterMember {
    /// Create an up, reachable member.
    pub fn up(name: impl Into<MemberName>) -> Self {
        Self {
            name: name.into(),
            status: MemberStatus::Up,
            reachable: true,
        }
    }

    /// Whether the member should be treated as down.
    pub fn is_down(&self) -> bool {
        !self.reachable || !self.status.is_up()
    }
}

/// A consensus peer of the local replica.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Peer member name.
    pub member: MemberName,
    /// Voting eligibility of the peer.
    pub voting_state: VotingState,
}

impl PeerInfo {
    /// Create a voting peer.
    pub fn voting(member: impl Into<MemberName>) -> Self {
        Self {
            member: member.into(),
            voting_state: VotingState::Voting,
        }
    }
}

/// Identifier of a batch submitted by a commit coordinator.
///
/// Sequence numbers are strictly increasing within one member's local history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId {
    /// Member that created the batch.
    pub member: MemberName,
    /// Local sequence number.
    pub seq: u64,
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-txn-{}", self.member, self.seq)
    }
}

/// Point-in-time ownership of an entity as seen by the local member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityOwnershipState {
    /// The local member owns the entity.
    IsOwner,
    /// Another member owns the entity.
    OwnedByOther,
    /// The entity is known but currently has no owner.
    NoOwner,
}

impl EntityOwnershipState {
    /// Derive the state from an owner value and the local member.
    pub fn from_owner(owner: Option<&MemberName>, local: &MemberName) -> Self {
        match owner {
            Some(owner) if owner == local => EntityOwnershipState::IsOwner,
            Some(_) => EntityOwnershipState::OwnedByOther,
            None => EntityOwnershipState::NoOwner,
        }
    }

    pub fn has_owner(self) -> bool {
        !matches!(self, EntityOwnershipState::NoOwner)
    }

    pub fn is_owner(self) -> bool {
        matches!(self, EntityOwnershipState::IsOwner)
    }
}
