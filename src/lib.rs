//! Single-owner election for cluster entities.
//!
//! This crate decides which one member of a cluster owns each of an open set of
//! entities (a device, a resource, a partition). It runs on top of a
//! leader-replicated log and uses:
//! - **An ownership tree** replicated through that log as the only shared state
//! - **One shard loop per member** that reacts to committed tree changes and
//!   cluster events, with only the current leader selecting owners
//! - **Pluggable selection strategies** per entity type
//!
//! # Features
//!
//! - At most one owner per entity in every committed state
//! - Re-election when the owner goes down, withdraws or stops voting
//! - A sole candidate keeps ownership while down, since it may only be partitioned
//! - Batched commits with a single batch in flight and retry on election-timeout cadence
//! - Per-listener delivery tasks, so a slow or panicking listener only affects itself
//!
//! # Example
//!
//! ```rust,no_run
//! use entity_ownership::testing::SimulatedCluster;
//! use entity_ownership::{Entity, OwnershipConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cluster = SimulatedCluster::new(["member-1"]);
//!     let service = cluster.start(OwnershipConfig::new("member-1"))?;
//!     cluster.elect("member-1");
//!
//!     // Candidacy is queued locally and replicated asynchronously
//!     let entity = Entity::parse("device", "/openflow:1")?;
//!     let registration = service.register_candidate(entity.clone()).await?;
//!
//!     // Reads are local and reflect the committed tree of this member
//!     if let Some(state) = service.ownership_state(&entity) {
//!         println!("is owner: {}", state.is_owner());
//!     }
//!
//!     registration.close().await?;
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            Application Layer                │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │        EntityOwnershipService API           │
//! │  • register_candidate(entity)               │
//! │  • register_listener(type, listener)        │
//! │  • ownership_state(entity)                  │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │          EntityOwnershipShard               │
//! │  candidate/owner listeners, strategies,     │
//! │  down peers, CommitCoordinator              │
//! └─────────────────────────────────────────────┘
//!          │                       ▲
//!          ▼                       │
//! ┌──────────────────┐   ┌──────────────────────┐
//! │    Consensus     │──▶│ DataStore (replica)  │
//! └──────────────────┘   └──────────────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Writes**: every candidate and owner write goes through the replicated log
//! - **Reads**: `ownership_state` reads the local replica and may lag the leader
//! - **Registration**: returns once queued locally; observe a listener
//!   notification to learn the outcome

pub mod cluster;
pub mod config;
pub mod consensus;
pub mod datastore;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod model;
pub mod selection;
pub mod service;
pub mod shard;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use config::{OwnershipConfig, RaftTimingConfig};
pub use error::{CommitError, Error, Result};
pub use service::{CandidateRegistration, EntityOwnershipService, ListenerRegistration};
pub use types::{
    ClusterMember, Entity, EntityId, EntityOwnershipState, MemberName, MemberStatus, PeerInfo,
    RaftState, TransactionId, VotingState,
};

// Re-export cluster and consensus types
pub use cluster::ClusterEvent;
pub use consensus::{Consensus, LeaderRequest};
pub use datastore::{DataStore, ShardDataTree};

// Re-export listener types
pub use listener::{EntityOwnershipChange, EntityOwnershipListener};

// Re-export selection types
pub use selection::{
    EntityOwnerSelectionStrategy, FirstCandidateSelectionStrategy,
    LeastLoadedCandidateSelectionStrategy, StrategyConfig, StrategyKind,
};

// Re-export shard types
pub use shard::{ShardBuilder, ShardHandle, ShardStatus};

// Re-export metrics types
pub use metrics::{ShardMetrics, ShardMetricsSnapshot};
