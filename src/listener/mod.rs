//! Reactions to committed tree changes and ownership change fan-out.
//!
//! - [`CandidateListChangeListener`] turns candidate entry changes into
//!   [`CandidateEvent`]s for the shard's election logic.
//! - [`EntityOwnerChangeListener`] turns owner leaf changes into statistics
//!   updates and notifications.
//! - [`ListenerSupport`] keeps external listener registrations and delivers
//!   [`EntityOwnershipChange`]s to each listener on its own task.

pub mod candidate;
pub mod owner;
pub mod support;

pub use candidate::{CandidateEvent, CandidateListChangeListener};
pub use owner::EntityOwnerChangeListener;
pub use support::ListenerSupport;

use crate::types::Entity;

/// Receives ownership changes for the entity types it is registered for.
///
/// Calls happen on a delivery task dedicated to the listener, in commit order. A
/// panic inside the callback is caught and logged.
pub trait EntityOwnershipListener: Send + Sync + 'static {
    fn ownership_changed(&self, change: &EntityOwnershipChange);
}

/// One ownership change as seen by the local member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityOwnershipChange {
    pub entity: Entity,
    /// The local member owned the entity before the change.
    pub was_owner: bool,
    /// The local member owns the entity after the change.
    pub is_owner: bool,
    /// Some member owns the entity after the change.
    pub has_owner: bool,
    /// The shard leader is isolated, so ownership may be stale.
    pub in_jeopardy: bool,
}
