//! Layout of entities, candidates and owners in the shared tree.
//!
//! ```text
//! /entity-owners
//!   /entity-type
//!     /[<type>]
//!       /entity
//!         /[<id segments>]
//!           /candidate
//!             /[<member>]   value = member name, insertion ordered
//!           /owner          value = member name, "" when ownerless
//! ```
//!
//! Every variable component sits in its own keyed entry, so paths for different
//! types, ids and member names can never collide.

pub mod tree;

pub use tree::{
    ChangeKind, DataTree, Modification, ModificationBatch, PathArg, TreeChange, TreeChangeBatch,
    TreeNode, TreePath,
};

use crate::types::{Entity, EntityId, MemberName};

pub const ENTITY_OWNERS: &str = "entity-owners";
pub const ENTITY_TYPE: &str = "entity-type";
pub const ENTITY: &str = "entity";
pub const CANDIDATE: &str = "candidate";
pub const OWNER: &str = "owner";

/// Length of an owner leaf path.
const OWNER_PATH_LEN: usize = 6;
/// Length of a candidate entry path.
const CANDIDATE_PATH_LEN: usize = 7;

pub fn entity_owners_path() -> TreePath {
    TreePath::root().node(ENTITY_OWNERS)
}

/// Path of the container holding every entity type.
pub fn entity_types_path() -> TreePath {
    entity_owners_path().node(ENTITY_TYPE)
}

pub fn entity_path(entity: &Entity) -> TreePath {
    entity_types_path()
        .entry([entity.entity_type()])
        .node(ENTITY)
        .child(PathArg::Entry(entity.id().segments().to_vec()))
}

pub fn candidate_path(entity: &Entity, member: &MemberName) -> TreePath {
    entity_path(entity).node(CANDIDATE).entry([member.as_str()])
}

pub fn owner_path(entity: &Entity) -> TreePath {
    entity_path(entity).node(OWNER)
}

/// Tree rooted at `/entity-owners` containing a single candidate entry.
pub fn entity_owners_with_candidate(entity: &Entity, member: &MemberName) -> TreeNode {
    let candidates = TreeNode::container().with_child(
        PathArg::entry([member.as_str()]),
        TreeNode::leaf(member.as_str()),
    );
    let entity_node = TreeNode::container().with_child(PathArg::node(CANDIDATE), candidates);
    let entities = TreeNode::container().with_child(
        PathArg::Entry(entity.id().segments().to_vec()),
        entity_node,
    );
    let entity_type =
        TreeNode::container().with_child(PathArg::node(ENTITY), entities);
    let entity_types = TreeNode::container()
        .with_child(PathArg::entry([entity.entity_type()]), entity_type);

    TreeNode::container().with_child(PathArg::node(ENTITY_TYPE), entity_types)
}

/// Merge registering `member` as a candidate, so concurrently added candidates survive.
pub fn candidate_merge(entity: &Entity, member: &MemberName) -> Modification {
    Modification::Merge {
        path: entity_owners_path(),
        node: entity_owners_with_candidate(entity, member),
    }
}

/// Delete withdrawing `member`'s candidacy.
pub fn candidate_delete(entity: &Entity, member: &MemberName) -> Modification {
    Modification::Delete {
        path: candidate_path(entity, member),
    }
}

/// Overwrite of the owner leaf. `None` writes the empty owner.
pub fn owner_write(entity: &Entity, owner: Option<&MemberName>) -> Modification {
    Modification::Write {
        path: owner_path(entity),
        node: TreeNode::leaf(owner.map_or("", MemberName::as_str)),
    }
}

/// Whether the modification is a write of an owner leaf.
pub fn is_owner_write(modification: &Modification) -> bool {
    matches!(modification, Modification::Write { path, .. } if parse_owner_path(path).is_some())
}

/// Decode the entity from the first components of an entity, owner or candidate path.
pub fn entity_from_path(path: &TreePath) -> Option<Entity> {
    let args = path.args();
    if args.len() < 5
        || !args[0].is_node(ENTITY_OWNERS)
        || !args[1].is_node(ENTITY_TYPE)
        || !args[3].is_node(ENTITY)
    {
        return None;
    }

    let entity_type = match args[2].key() {
        Some([entity_type]) => entity_type.clone(),
        _ => return None,
    };
    let id = EntityId::from_segments(args[4].key()?.to_vec())?;
    Entity::new(entity_type, id).ok()
}

/// Decode `(entity, member)` from a candidate entry path.
pub fn parse_candidate_path(path: &TreePath) -> Option<(Entity, MemberName)> {
    let args = path.args();
    if args.len() != CANDIDATE_PATH_LEN || !args[5].is_node(CANDIDATE) {
        return None;
    }
    let member = match args[6].key() {
        Some([member]) => MemberName::new(member),
        _ => return None,
    };
    entity_from_path(path).map(|entity| (entity, member))
}

/// Decode the entity from an owner leaf path.
pub fn parse_owner_path(path: &TreePath) -> Option<Entity> {
    let args = path.args();
    if args.len() != OWNER_PATH_LEN || !args[5].is_node(OWNER) {
        return None;
    }
    entity_from_path(path)
}

/// Interpret an owner leaf, mapping the empty string to no owner.
pub fn owner_value(value: Option<&str>) -> Option<MemberName> {
    value.filter(|v| !v.is_empty()).map(MemberName::new)
}

/// Read-only view of one entity node.
#[derive(Debug, Clone, Copy)]
pub struct EntityView<'a> {
    node: &'a TreeNode,
}

impl<'a> EntityView<'a> {
    pub fn new(node: &'a TreeNode) -> Self {
        Self { node }
    }

    /// Current owner, `None` when absent or empty.
    pub fn owner(&self) -> Option<MemberName> {
        owner_value(
            self.node
                .child(&PathArg::node(OWNER))
                .and_then(TreeNode::value),
        )
    }

    /// Candidate names in registration order.
    pub fn candidates(&self) -> Vec<MemberName> {
        self.node
            .child(&PathArg::node(CANDIDATE))
            .map(|list| {
                list.children()
                    .filter_map(|(arg, _)| match arg.key() {
                        Some([member]) => Some(MemberName::new(member)),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_candidate(&self, member: &MemberName) -> bool {
        self.node
            .child(&PathArg::node(CANDIDATE))
            .and_then(|list| list.child(&PathArg::entry([member.as_str()])))
            .is_some()
    }
}

/// Walk every entity under an `/entity-owners/entity-type` node.
pub fn entities(entity_types: &TreeNode) -> Vec<(Entity, EntityView<'_>)> {
    let mut found = Vec::new();
    for (type_arg, type_node) in entity_types.children() {
        let entity_type = match type_arg.key() {
            Some([entity_type]) => entity_type,
            _ => continue,
        };
        let Some(entity_nodes) = type_node.child(&PathArg::node(ENTITY)) else {
            continue;
        };
        for (id_arg, entity_node) in entity_nodes.children() {
            let id = id_arg
                .key()
                .and_then(|k| EntityId::from_segments(k.to_vec()));
            if let Some(entity) = id.and_then(|id| Entity::new(entity_type.clone(), id).ok()) {
                found.push((entity, EntityView::new(entity_node)));
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: &str) -> Entity {
        Entity::parse("device", id).unwrap()
    }

    #[test]
    fn test_paths_round_trip_through_parsers() {
        let e = entity("/a/b");
        let m = MemberName::new("member-1");

        assert_eq!(parse_candidate_path(&candidate_path(&e, &m)), Some((e.clone(), m)));
        assert_eq!(parse_owner_path(&owner_path(&e)), Some(e.clone()));
        assert!(parse_owner_path(&entity_path(&e)).is_none());
        assert!(parse_candidate_path(&owner_path(&e)).is_none());
    }

    #[test]
    fn test_paths_do_not_collide() {
        let a = Entity::parse("x", "/a/b").unwrap();
        let b = Entity::new("x", EntityId::new(vec!["a/b"]).unwrap()).unwrap();
        let c = Entity::parse("x/a", "/b").unwrap();
        assert_ne!(entity_path(&a), entity_path(&b));
        assert_ne!(entity_path(&a), entity_path(&c));
        assert_ne!(entity_path(&b), entity_path(&c));
    }

    #[test]
    fn test_candidate_merge_and_owner_write() {
        let e = entity("/s1");
        let m1 = MemberName::new("member-1");
        let m2 = MemberName::new("member-2");

        let mut tree = DataTree::new();
        tree.apply(&candidate_merge(&e, &m1));
        tree.apply(&candidate_merge(&e, &m2));
        tree.apply(&candidate_merge(&e, &m1));
        tree.apply(&owner_write(&e, Some(&m2)));

        let node = tree.read(&entity_path(&e)).unwrap();
        let view = EntityView::new(node);
        assert_eq!(view.candidates(), vec![m1.clone(), m2.clone()]);
        assert_eq!(view.owner(), Some(m2));
        assert!(view.has_candidate(&m1));

        tree.apply(&owner_write(&e, None));
        assert_eq!(EntityView::new(tree.read(&entity_path(&e)).unwrap()).owner(), None);

        tree.apply(&candidate_delete(&e, &m1));
        let view = EntityView::new(tree.read(&entity_path(&e)).unwrap());
        assert!(!view.has_candidate(&m1));
    }

    #[test]
    fn test_owner_write_detection() {
        let e = entity("/s1");
        let m = MemberName::new("member-1");
        assert!(is_owner_write(&owner_write(&e, Some(&m))));
        assert!(!is_owner_write(&candidate_merge(&e, &m)));
        assert!(!is_owner_write(&candidate_delete(&e, &m)));
    }

    #[test]
    fn test_entities_walk() {
        let mut tree = DataTree::new();
        let m = MemberName::new("member-1");
        tree.apply(&candidate_merge(&entity("/s1"), &m));
        tree.apply(&candidate_merge(&Entity::parse("port", "/p1").unwrap(), &m));

        let types = tree.read(&entity_types_path()).unwrap();
        let mut found: Vec<_> = entities(types).into_iter().map(|(e, _)| e.to_string()).collect();
        found.sort();
        assert_eq!(found, vec!["device/s1", "port/p1"]);
    }
}
