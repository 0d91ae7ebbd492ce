//! Committed ownership counts per entity type and member.

use crate::types::MemberName;
use std::collections::HashMap;

/// Number of entities each member owns, per entity type.
///
/// Maintained by the owner-change listener from committed owner writes only.
#[derive(Debug, Clone, Default)]
pub struct OwnershipStatistics {
    by_type: HashMap<String, HashMap<MemberName, u64>>,
}

impl OwnershipStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an owner change for an entity of `entity_type`.
    pub fn owner_changed(
        &mut self,
        entity_type: &str,
        old: Option<&MemberName>,
        new: Option<&MemberName>,
    ) {
        let counts = self.by_type.entry(entity_type.to_string()).or_default();
        if let Some(old) = old {
            if let Some(count) = counts.get_mut(old) {
                *count = count.saturating_sub(1);
            }
        }
        if let Some(new) = new {
            *counts.entry(new.clone()).or_insert(0) += 1;
        }
    }

    /// Snapshot of the counts for one entity type.
    pub fn by_entity_type(&self, entity_type: &str) -> HashMap<MemberName, u64> {
        self.by_type.get(entity_type).cloned().unwrap_or_default()
    }

    /// Number of `entity_type` entities owned by `member`.
    pub fn owned(&self, entity_type: &str, member: &MemberName) -> u64 {
        self.by_type
            .get(entity_type)
            .and_then(|counts| counts.get(member))
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_changes_move_counts() {
        let m1 = MemberName::new("member-1");
        let m2 = MemberName::new("member-2");
        let mut stats = OwnershipStatistics::new();

        stats.owner_changed("device", None, Some(&m1));
        stats.owner_changed("device", None, Some(&m1));
        stats.owner_changed("device", Some(&m1), Some(&m2));
        stats.owner_changed("port", None, Some(&m2));

        assert_eq!(stats.owned("device", &m1), 1);
        assert_eq!(stats.owned("device", &m2), 1);
        assert_eq!(stats.owned("port", &m2), 1);
        assert_eq!(stats.owned("port", &m1), 0);

        stats.owner_changed("device", Some(&m2), None);
        assert_eq!(stats.by_entity_type("device").get(&m2), Some(&0));
    }
}
