//! Owner leaf change handling.

use super::ListenerSupport;
use crate::model::{self, TreeChangeBatch};
use crate::selection::OwnershipStatistics;
use crate::types::{Entity, MemberName};
use tracing::debug;

/// An owner change extracted from a committed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerChange {
    pub entity: Entity,
    pub old_owner: Option<MemberName>,
    pub new_owner: Option<MemberName>,
}

/// Turns committed owner writes into statistics updates and listener notifications.
#[derive(Debug)]
pub struct EntityOwnerChangeListener {
    local_member: MemberName,
}

impl EntityOwnerChangeListener {
    pub fn new(local_member: MemberName) -> Self {
        Self { local_member }
    }

    /// Owner changes in a batch, skipping writes that leave the owner unchanged.
    pub fn owner_changes(batch: &TreeChangeBatch) -> Vec<OwnerChange> {
        batch
            .changes
            .iter()
            .filter_map(|change| {
                let entity = model::parse_owner_path(&change.path)?;
                let old_owner = model::owner_value(change.value_before());
                let new_owner = model::owner_value(change.value_after());
                (old_owner != new_owner).then_some(OwnerChange {
                    entity,
                    old_owner,
                    new_owner,
                })
            })
            .collect()
    }

    /// Process a committed batch.
    pub fn on_changes(
        &self,
        batch: &TreeChangeBatch,
        statistics: &mut OwnershipStatistics,
        support: &ListenerSupport,
    ) -> Vec<OwnerChange> {
        let changes = Self::owner_changes(batch);

        for change in &changes {
            statistics.owner_changed(
                change.entity.entity_type(),
                change.old_owner.as_ref(),
                change.new_owner.as_ref(),
            );

            let was_owner = change.old_owner.as_ref() == Some(&self.local_member);
            let is_owner = change.new_owner.as_ref() == Some(&self.local_member);
            let has_owner = change.new_owner.is_some();

            debug!(
                index = batch.index,
                entity = %change.entity,
                old_owner = ?change.old_owner,
                new_owner = ?change.new_owner,
                "Entity owner changed"
            );

            support.notify(&change.entity, was_owner, is_owner, has_owner, Some(batch.index));
        }

        changes
    }
}
