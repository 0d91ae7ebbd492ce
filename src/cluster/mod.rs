//! Cluster role and membership events.

pub mod events;

pub use events::ClusterEvent;
