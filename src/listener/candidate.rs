//! Candidate list change tracking.

use crate::model::{self, TreeChangeBatch};
use crate::types::{Entity, MemberName};
use std::collections::HashMap;
use tracing::debug;

/// Candidate change derived from committed tree changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateEvent {
    Added {
        entity: Entity,
        new_candidate: MemberName,
        /// Every candidate of the entity after the addition, in registration order.
        all_candidates: Vec<MemberName>,
    },
    Removed {
        entity: Entity,
        removed_candidate: MemberName,
        /// Candidates left after the removal, in registration order.
        remaining_candidates: Vec<MemberName>,
    },
}

impl CandidateEvent {
    pub fn entity(&self) -> &Entity {
        match self {
            CandidateEvent::Added { entity, .. } | CandidateEvent::Removed { entity, .. } => entity,
        }
    }
}

/// Keeps a shadow copy of every entity's candidate list so events can carry the full list.
#[derive(Debug, Default)]
pub struct CandidateListChangeListener {
    candidates: HashMap<Entity, Vec<MemberName>>,
}

impl CandidateListChangeListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate one committed change batch into candidate events, in change order.
    pub fn on_changes(&mut self, batch: &TreeChangeBatch) -> Vec<CandidateEvent> {
        let mut events = Vec::new();

        for change in &batch.changes {
            let Some((entity, member)) = model::parse_candidate_path(&change.path) else {
                continue;
            };

            match (change.before.is_some(), change.after.is_some()) {
                (false, true) => {
                    let list = self.candidates.entry(entity.clone()).or_default();
                    if !list.contains(&member) {
                        list.push(member.clone());
                    }
                    debug!(index = batch.index, entity = %entity, candidate = %member, "Candidate added");
                    events.push(CandidateEvent::Added {
                        entity,
                        new_candidate: member,
                        all_candidates: list.clone(),
                    });
                }
                (true, false) => {
                    let remaining = match self.candidates.get_mut(&entity) {
                        Some(list) => {
                            list.retain(|m| m != &member);
                            list.clone()
                        }
                        None => Vec::new(),
                    };
                    if remaining.is_empty() {
                        self.candidates.remove(&entity);
                    }
                    debug!(index = batch.index, entity = %entity, candidate = %member, "Candidate removed");
                    events.push(CandidateEvent::Removed {
                        entity,
                        removed_candidate: member,
                        remaining_candidates: remaining,
                    });
                }
                _ => {}
            }
        }

        events
    }

    /// Current shadow candidate list of an entity.
    pub fn candidates(&self, entity: &Entity) -> &[MemberName] {
        self.candidates.get(entity).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DataTree;

    fn apply(tree: &mut DataTree, index: u64, modifications: Vec<model::Modification>) -> TreeChangeBatch {
        TreeChangeBatch {
            index,
            changes: tree.apply_all(&modifications),
        }
    }

    #[test]
    fn test_added_events_carry_full_list() {
        let entity = Entity::parse("device", "/s1").unwrap();
        let m1 = MemberName::new("member-1");
        let m2 = MemberName::new("member-2");
        let mut tree = DataTree::new();
        let mut listener = CandidateListChangeListener::new();

        let events = listener.on_changes(&apply(&mut tree, 1, vec![model::candidate_merge(&entity, &m1)]));
        assert_eq!(
            events,
            vec![CandidateEvent::Added {
                entity: entity.clone(),
                new_candidate: m1.clone(),
                all_candidates: vec![m1.clone()],
            }]
        );

        let events = listener.on_changes(&apply(&mut tree, 2, vec![model::candidate_merge(&entity, &m2)]));
        assert_eq!(
            events,
            vec![CandidateEvent::Added {
                entity: entity.clone(),
                new_candidate: m2.clone(),
                all_candidates: vec![m1.clone(), m2.clone()],
            }]
        );

        // Re-registering is not a change
        let events = listener.on_changes(&apply(&mut tree, 3, vec![model::candidate_merge(&entity, &m1)]));
        assert!(events.is_empty());
    }

    #[test]
    fn test_removed_events_carry_remaining() {
        let entity = Entity::parse("device", "/s1").unwrap();
        let m1 = MemberName::new("member-1");
        let m2 = MemberName::new("member-2");
        let mut tree = DataTree::new();
        let mut listener = CandidateListChangeListener::new();

        listener.on_changes(&apply(
            &mut tree,
            1,
            vec![model::candidate_merge(&entity, &m1), model::candidate_merge(&entity, &m2)],
        ));
        let events = listener.on_changes(&apply(&mut tree, 2, vec![model::candidate_delete(&entity, &m1)]));

        assert_eq!(
            events,
            vec![CandidateEvent::Removed {
                entity: entity.clone(),
                removed_candidate: m1,
                remaining_candidates: vec![m2.clone()],
            }]
        );
        assert_eq!(listener.candidates(&entity), &[m2]);
    }

    #[test]
    fn test_owner_changes_are_ignored() {
        let entity = Entity::parse("device", "/s1").unwrap();
        let m1 = MemberName::new("member-1");
        let mut tree = DataTree::new();
        let mut listener = CandidateListChangeListener::new();

        let events = listener.on_changes(&apply(&mut tree, 1, vec![model::owner_write(&entity, Some(&m1))]));
        assert!(events.is_empty());
    }
}
