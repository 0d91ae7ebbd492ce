//! Testing utilities for the ownership service.
//!
//! This module provides:
//! - [`SimulatedCluster`], an in-process consensus primitive with explicit
//!   control over leadership, reachability, voting and commit outcomes
//! - [`RecordingListener`] and polling helpers for asserting on asynchronous effects
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      SimulatedCluster                        │
//! │   shared log ──apply──▶ ShardDataTree (one per member)       │
//! │   leader / isolation / peer up-down / voting controls        │
//! │   hold, release or fail submitted batches                    │
//! └──────────────────────────────────────────────────────────────┘
//!          ▲ SimReplica (Consensus)          │ DataStore
//!          │                                 ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │           EntityOwnershipService  (one per member)           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use entity_ownership::testing::{wait_until, SimulatedCluster};
//! use entity_ownership::{Entity, OwnershipConfig};
//! use std::time::Duration;
//!
//! let cluster = SimulatedCluster::new(["member-1", "member-2"]);
//! let m1 = cluster.start(OwnershipConfig::new("member-1"))?;
//! let _m2 = cluster.start(OwnershipConfig::new("member-2"))?;
//! cluster.elect("member-1");
//!
//! let entity = Entity::parse("device", "/s1")?;
//! let _registration = m1.register_candidate(entity.clone()).await?;
//! assert!(wait_until(Duration::from_secs(5), || cluster.owner(&entity).is_some()).await);
//! ```

mod sim;
mod utils;

#[cfg(test)]
mod ownership_tests;

pub use sim::{SimReplica, SimulatedCluster, Submission};
pub use utils::{wait_for_result, wait_until, RecordingListener};
