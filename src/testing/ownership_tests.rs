//! Multi-member ownership scenarios against the simulated cluster.

use super::{wait_for_result, wait_until, RecordingListener, SimulatedCluster};
use crate::config::{OwnershipConfig, RaftTimingConfig};
use crate::error::{CommitError, Error};
use crate::listener::EntityOwnershipListener;
use crate::model;
use crate::selection::{StrategyConfig, StrategyKind};
use crate::service::EntityOwnershipService;
use crate::types::{Entity, EntityOwnershipState, MemberName, VotingState};
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn m(name: &str) -> MemberName {
    MemberName::new(name)
}

fn device(id: &str) -> Entity {
    Entity::parse("device", id).unwrap()
}

fn test_config(member: &str) -> OwnershipConfig {
    OwnershipConfig::new(member)
        .with_raft_config(RaftTimingConfig {
            heartbeat_interval: Duration::from_millis(20),
            election_timeout_factor: 2,
        })
        .with_commit_timeout(Duration::from_secs(2))
}

/// Three started members with `member-1` elected.
async fn three_members() -> (SimulatedCluster, Vec<EntityOwnershipService>) {
    three_members_with(test_config).await
}

async fn three_members_with(
    config: impl Fn(&str) -> OwnershipConfig,
) -> (SimulatedCluster, Vec<EntityOwnershipService>) {
    let names = ["member-1", "member-2", "member-3"];
    let cluster = SimulatedCluster::new(names);
    let services: Vec<_> = names
        .iter()
        .map(|name| cluster.start(config(*name)).unwrap())
        .collect();
    cluster.elect("member-1");

    // Followers purge their stale candidates once on seeing the leader.
    let leader = services[0].shard().clone();
    assert!(wait_until(TIMEOUT, || leader.metrics().is_leader()).await);
    (cluster, services)
}

async fn wait_for_owner(cluster: &SimulatedCluster, entity: &Entity, owner: Option<&str>) -> bool {
    let expected = owner.map(m);
    wait_until(TIMEOUT, || cluster.owner(entity) == expected).await
}

#[tokio::test]
async fn test_single_candidate_is_elected() {
    let (cluster, services) = three_members().await;
    let entity = device("/s1");

    let _reg = services[0].register_candidate(entity.clone()).await.unwrap();
    assert!(wait_for_owner(&cluster, &entity, Some("member-1")).await);

    assert_eq!(
        services[0].ownership_state(&entity),
        Some(EntityOwnershipState::IsOwner)
    );
    assert_eq!(
        services[1].ownership_state(&entity),
        Some(EntityOwnershipState::OwnedByOther)
    );
    assert_eq!(services[0].ownership_state(&device("/unknown")), None);
}

#[tokio::test]
async fn test_follower_candidates_are_elected() {
    let (cluster, services) = three_members().await;
    let entity = device("/s1");

    let _r2 = services[1].register_candidate(entity.clone()).await.unwrap();
    let _r3 = services[2].register_candidate(entity.clone()).await.unwrap();

    assert!(wait_until(TIMEOUT, || cluster.candidates(&entity).len() == 2).await);
    assert!(wait_until(TIMEOUT, || cluster.owner(&entity).is_some()).await);

    let owner = cluster.owner(&entity).unwrap();
    assert!(cluster.candidates(&entity).contains(&owner));
    // The first committed candidate keeps ownership.
    assert_eq!(Some(&owner), cluster.candidates(&entity).first());
}

#[tokio::test]
async fn test_sole_down_candidate_keeps_ownership_until_replaced() {
    let (cluster, services) = three_members().await;
    let entity = device("/s1");

    let _r2 = services[1].register_candidate(entity.clone()).await.unwrap();
    assert!(wait_for_owner(&cluster, &entity, Some("member-2")).await);

    cluster.peer_down("member-2");
    let leader = services[0].clone();
    assert!(
        wait_until(TIMEOUT, || {
            leader.metrics().down_peers.get() == 1
        })
        .await
    );

    // No alternative, so the owner is not cleared.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cluster.owner(&entity), Some(m("member-2")));

    let _r3 = services[2].register_candidate(entity.clone()).await.unwrap();
    assert!(wait_for_owner(&cluster, &entity, Some("member-3")).await);
    assert_eq!(cluster.candidates(&entity), vec![m("member-2"), m("member-3")]);
}

#[tokio::test]
async fn test_down_owner_is_replaced_by_remaining_candidate() {
    let (cluster, services) = three_members().await;
    let entity = device("/s1");

    let _r2 = services[1].register_candidate(entity.clone()).await.unwrap();
    assert!(wait_for_owner(&cluster, &entity, Some("member-2")).await);
    let _r3 = services[2].register_candidate(entity.clone()).await.unwrap();
    assert!(wait_until(TIMEOUT, || cluster.candidates(&entity).len() == 2).await);

    cluster.peer_down("member-2");
    assert!(wait_for_owner(&cluster, &entity, Some("member-3")).await);

    cluster.peer_up("member-2");
    let leader = services[0].clone();
    assert!(wait_until(TIMEOUT, || leader.metrics().down_peers.get() == 0).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cluster.owner(&entity), Some(m("member-3")));
}

#[tokio::test]
async fn test_repeated_peer_down_does_not_rewrite_owners() {
    let (cluster, services) = three_members().await;
    let entity = device("/s1");

    let _r2 = services[1].register_candidate(entity.clone()).await.unwrap();
    assert!(wait_for_owner(&cluster, &entity, Some("member-2")).await);
    let _r3 = services[2].register_candidate(entity.clone()).await.unwrap();
    assert!(wait_until(TIMEOUT, || cluster.candidates(&entity).len() == 2).await);

    cluster.peer_down("member-2");
    assert!(wait_for_owner(&cluster, &entity, Some("member-3")).await);
    let leader = services[0].clone();
    let writes = leader.metrics().owner_writes.get();
    let index = cluster.log_index();

    cluster.peer_down("member-2");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(leader.metrics().down_peers.get(), 1);
    assert_eq!(leader.metrics().owner_writes.get(), writes);
    assert_eq!(cluster.log_index(), index);
}

#[tokio::test]
async fn test_listener_backfill_is_not_duplicated() {
    let (cluster, services) = three_members().await;
    let entity = device("/s1");

    let _reg = services[0].register_candidate(entity.clone()).await.unwrap();
    assert!(wait_for_owner(&cluster, &entity, Some("member-1")).await);

    let owner_side = Arc::new(RecordingListener::new());
    let other_side = Arc::new(RecordingListener::new());
    let _l1 = services[0]
        .register_listener("device", owner_side.clone())
        .await
        .unwrap();
    let _l2 = services[1]
        .register_listener("device", other_side.clone())
        .await
        .unwrap();

    assert!(wait_until(TIMEOUT, || owner_side.len() == 1 && other_side.len() == 1).await);
    let change = owner_side.last_for(&entity).unwrap();
    assert!(!change.was_owner && change.is_owner && change.has_owner);
    let change = other_side.last_for(&entity).unwrap();
    assert!(!change.was_owner && !change.is_owner && change.has_owner);

    // Listeners of other types see nothing.
    let ports = Arc::new(RecordingListener::new());
    let _l3 = services[0].register_listener("port", ports.clone()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(owner_side.len(), 1);
    assert_eq!(other_side.len(), 1);
    assert!(ports.is_empty());
}

#[tokio::test]
async fn test_live_notifications_follow_owner_changes() {
    let (cluster, services) = three_members().await;
    let entity = device("/s1");

    let listener = Arc::new(RecordingListener::new());
    let registration = services[0]
        .register_listener("device", listener.clone())
        .await
        .unwrap();

    let r1 = services[0].register_candidate(entity.clone()).await.unwrap();
    assert!(wait_for_owner(&cluster, &entity, Some("member-1")).await);
    let _r2 = services[1].register_candidate(entity.clone()).await.unwrap();
    assert!(wait_until(TIMEOUT, || cluster.candidates(&entity).len() == 2).await);

    r1.close().await.unwrap();
    assert!(!services[0].is_candidate_registered(&entity));
    assert!(wait_for_owner(&cluster, &entity, Some("member-2")).await);

    assert!(wait_until(TIMEOUT, || listener.len() == 2).await);
    let flags: Vec<_> = listener
        .changes_for(&entity)
        .iter()
        .map(|c| (c.was_owner, c.is_owner, c.has_owner))
        .collect();
    assert_eq!(flags, vec![(false, true, true), (true, false, true)]);

    registration.close().await.unwrap();
    let support = services[0].shard().listener_support().clone();
    assert!(wait_until(TIMEOUT, || support.listener_count() == 0).await);
}

#[tokio::test]
async fn test_leadership_loss_prunes_owner_writes() {
    let (cluster, services) = three_members().await;
    let first = device("/s1");
    let second = device("/s2");
    let member1 = services[0].clone();

    cluster.hold_submissions(true);
    let _r1 = member1.register_candidate(first.clone()).await.unwrap();
    let _r2 = member1.register_candidate(second.clone()).await.unwrap();

    // Commit the first candidate so the leader queues an owner write for it.
    assert!(wait_until(TIMEOUT, || cluster.held_len() == 1).await);
    cluster.release_held();
    assert!(wait_until(TIMEOUT, || member1.metrics().owner_writes.get() >= 1).await);
    assert!(wait_until(TIMEOUT, || cluster.held_len() == 1).await);
    cluster.hold_submissions(false);

    let before = cluster.submissions().len();
    cluster.no_leader();
    cluster.elect("member-2");
    assert!(wait_until(TIMEOUT, || member1.metrics().modifications_pruned.get() >= 1).await);
    cluster.fail_held(CommitError::NoLeader);

    // The new leader recomputes the owners itself.
    assert!(wait_for_owner(&cluster, &first, Some("member-1")).await);
    assert!(wait_for_owner(&cluster, &second, Some("member-1")).await);

    let forwarded: Vec<_> = cluster.submissions()[before..]
        .iter()
        .filter(|s| s.submitter == m("member-1"))
        .flat_map(|s| s.batch.modifications.clone())
        .collect();
    assert!(!forwarded.is_empty());
    assert!(forwarded.iter().all(|m| !model::is_owner_write(m)));
}

#[tokio::test]
async fn test_duplicate_registration() {
    let (cluster, services) = three_members().await;
    let entity = device("/s1");

    let _reg = services[0].register_candidate(entity.clone()).await.unwrap();
    assert!(matches!(
        services[0].register_candidate(entity.clone()).await,
        Err(Error::CandidateAlreadyRegistered(_))
    ));
    assert!(services[0].is_candidate_registered(&entity));

    assert!(wait_for_owner(&cluster, &entity, Some("member-1")).await);

    // Merging the same entry again leaves a single candidate.
    let shard = services[0].shard().clone();
    let index = cluster.log_index();
    shard.register_candidate(entity.clone()).await.unwrap();
    assert!(wait_until(TIMEOUT, || cluster.log_index() > index).await);
    assert_eq!(cluster.candidates(&entity), vec![m("member-1")]);
}

#[tokio::test]
async fn test_no_leader_failure_is_retried() {
    let (cluster, services) = three_members().await;
    let entity = device("/s1");

    cluster.fail_next(CommitError::NoLeader);
    let _reg = services[1].register_candidate(entity.clone()).await.unwrap();
    assert!(wait_for_owner(&cluster, &entity, Some("member-2")).await);

    let metrics = services[1].metrics().snapshot();
    assert!(metrics.commit_failures >= 1);
    assert!(metrics.commit_retries >= 1);

    // A batch that was never accepted keeps its transaction id.
    let attempts: Vec<_> = cluster
        .submissions()
        .into_iter()
        .filter(|s| s.submitter == m("member-2"))
        .collect();
    assert!(attempts.len() >= 2);
    assert_eq!(attempts[0].batch.transaction_id, attempts[1].batch.transaction_id);
}

#[tokio::test]
async fn test_ambiguous_failure_uses_new_transaction_id() {
    let (cluster, services) = three_members().await;
    let entity = device("/s1");

    cluster.fail_next(CommitError::Timeout);
    let _reg = services[1].register_candidate(entity.clone()).await.unwrap();
    assert!(wait_for_owner(&cluster, &entity, Some("member-2")).await);

    let attempts: Vec<_> = cluster
        .submissions()
        .into_iter()
        .filter(|s| s.submitter == m("member-2"))
        .collect();
    assert!(attempts.len() >= 2);
    assert_ne!(attempts[0].batch.transaction_id, attempts[1].batch.transaction_id);
    assert!(services[1].metrics().transactions_rebuilt.get() >= 1);
}

#[tokio::test]
async fn test_isolated_leader_puts_listeners_in_jeopardy() {
    let (cluster, services) = three_members().await;
    let entity = device("/s1");

    let _reg = services[0].register_candidate(entity.clone()).await.unwrap();
    assert!(wait_for_owner(&cluster, &entity, Some("member-1")).await);

    let listener = Arc::new(RecordingListener::new());
    let _l = services[0]
        .register_listener("device", listener.clone())
        .await
        .unwrap();
    assert!(wait_until(TIMEOUT, || listener.len() == 1).await);

    cluster.isolate_leader();
    assert!(wait_until(TIMEOUT, || listener.len() == 2).await);
    let change = listener.last_for(&entity).unwrap();
    assert!(change.in_jeopardy && change.was_owner && change.is_owner);

    cluster.heal_leader();
    assert!(wait_until(TIMEOUT, || listener.len() == 3).await);
    assert!(!listener.last_for(&entity).unwrap().in_jeopardy);
}

#[tokio::test]
async fn test_selection_delay_waits_for_candidates() {
    let strategies = StrategyConfig::new().with_strategy(
        "delayed",
        StrategyKind::FirstCandidate,
        Duration::from_millis(300),
    );
    let (cluster, services) =
        three_members_with(|name| test_config(name).with_strategies(strategies.clone())).await;

    let waiting = Entity::parse("delayed", "/a").unwrap();
    let _r1 = services[0].register_candidate(waiting.clone()).await.unwrap();
    assert!(wait_until(TIMEOUT, || cluster.candidates(&waiting).len() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cluster.owner(&waiting), None);
    assert!(wait_for_owner(&cluster, &waiting, Some("member-1")).await);

    // Once every available member is a candidate there is nothing left to wait for.
    let full = Entity::parse("delayed", "/b").unwrap();
    let mut regs = Vec::new();
    for service in &services {
        regs.push(service.register_candidate(full.clone()).await.unwrap());
    }
    assert!(wait_until(TIMEOUT, || cluster.candidates(&full).len() == 3).await);
    assert!(wait_until(Duration::from_millis(250), || cluster.owner(&full).is_some()).await);
}

#[tokio::test]
async fn test_non_voting_owner_is_replaced() {
    let (cluster, services) = three_members().await;
    let entity = device("/s1");

    let _r2 = services[1].register_candidate(entity.clone()).await.unwrap();
    assert!(wait_for_owner(&cluster, &entity, Some("member-2")).await);
    let _r3 = services[2].register_candidate(entity.clone()).await.unwrap();
    assert!(wait_until(TIMEOUT, || cluster.candidates(&entity).len() == 2).await);

    cluster.set_voting("member-2", VotingState::NonVoting);
    assert!(wait_for_owner(&cluster, &entity, Some("member-3")).await);
}

#[tokio::test]
async fn test_new_leader_reassigns_owner_of_down_leader() {
    let (cluster, services) = three_members().await;
    let entity = device("/s1");

    let _r1 = services[0].register_candidate(entity.clone()).await.unwrap();
    assert!(wait_for_owner(&cluster, &entity, Some("member-1")).await);
    let _r2 = services[1].register_candidate(entity.clone()).await.unwrap();
    assert!(wait_until(TIMEOUT, || cluster.candidates(&entity).len() == 2).await);

    cluster.peer_down("member-1");
    cluster.elect("member-2");
    assert!(wait_for_owner(&cluster, &entity, Some("member-2")).await);

    let status = wait_for_result(
        || services[1].status(),
        |status| status.as_ref().is_ok_and(|s| s.is_leader),
        TIMEOUT,
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(status.down_peers, vec![m("member-1")]);
}

#[tokio::test]
async fn test_peer_up_elects_owner_for_ownerless_entity() {
    let (cluster, services) = three_members().await;
    let entity = device("/s1");
    let member1 = services[0].clone();

    // Commit the candidate while holding back the leader's owner write.
    cluster.hold_submissions(true);
    let _r3 = services[2].register_candidate(entity.clone()).await.unwrap();
    assert!(wait_until(TIMEOUT, || cluster.held_len() == 1).await);
    cluster.release_held();
    assert!(wait_until(TIMEOUT, || member1.metrics().owner_writes.get() >= 1).await);
    assert!(wait_until(TIMEOUT, || cluster.held_len() == 1).await);

    // The owner write is lost to a leader change while the candidate is down.
    cluster.peer_down("member-3");
    cluster.no_leader();
    cluster.elect("member-2");
    assert!(wait_until(TIMEOUT, || member1.metrics().modifications_pruned.get() >= 1).await);
    cluster.fail_held(CommitError::NoLeader);
    cluster.hold_submissions(false);

    let leader = services[1].clone();
    assert!(wait_until(TIMEOUT, || leader.metrics().is_leader()).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cluster.candidates(&entity), vec![m("member-3")]);
    assert_eq!(cluster.owner(&entity), None);

    cluster.peer_up("member-3");
    assert!(wait_for_owner(&cluster, &entity, Some("member-3")).await);
}

#[tokio::test]
async fn test_backfill_includes_ownerless_entities() {
    let (cluster, services) = three_members().await;
    let entity = device("/s1");

    let reg = services[1].register_candidate(entity.clone()).await.unwrap();
    assert!(wait_for_owner(&cluster, &entity, Some("member-2")).await);
    reg.close().await.unwrap();
    assert!(wait_for_owner(&cluster, &entity, None).await);
    assert_eq!(
        services[0].ownership_state(&entity),
        Some(EntityOwnershipState::NoOwner)
    );

    let listener = Arc::new(RecordingListener::new());
    let _l = services[0]
        .register_listener("device", listener.clone())
        .await
        .unwrap();

    assert!(wait_until(TIMEOUT, || listener.len() == 1).await);
    let change = listener.last_for(&entity).unwrap();
    assert!(!change.was_owner && !change.is_owner && !change.has_owner);
}

#[tokio::test]
async fn test_restarted_member_purges_stale_candidates() {
    let (cluster, services) = three_members().await;
    let entity = device("/s1");

    let _r2 = services[1].register_candidate(entity.clone()).await.unwrap();
    assert!(wait_for_owner(&cluster, &entity, Some("member-2")).await);

    services[1].shutdown().await;
    let store = cluster.reset_store("member-2").unwrap();
    assert!(store.applied_index() > 0);
    let restarted = cluster.start(test_config("member-2")).unwrap();

    assert!(wait_until(TIMEOUT, || cluster.candidates(&entity).is_empty()).await);
    assert!(wait_for_owner(&cluster, &entity, None).await);
    assert_eq!(
        restarted.ownership_state(&entity),
        Some(EntityOwnershipState::NoOwner)
    );
}

#[tokio::test]
async fn test_remove_all_candidates_requires_leader() {
    let (cluster, services) = three_members().await;
    let entity = device("/s1");

    let _reg = services[2].register_candidate(entity.clone()).await.unwrap();
    assert!(wait_until(TIMEOUT, || cluster.candidates(&entity).len() == 1).await);

    let result = services[1].shard().remove_all_candidates(m("member-3")).await;
    assert_eq!(
        result,
        Err(CommitError::NotLeader {
            leader: Some(m("member-1"))
        })
    );

    services[0]
        .shard()
        .remove_all_candidates(m("member-3"))
        .await
        .unwrap();
    assert!(cluster.candidates(&entity).is_empty());
}

#[tokio::test]
async fn test_listener_shared_across_types() {
    let (cluster, services) = three_members().await;
    let listener = Arc::new(RecordingListener::new());
    let shared: Arc<dyn EntityOwnershipListener> = listener.clone();

    let _l1 = services[0].register_listener("device", shared.clone()).await.unwrap();
    let _l2 = services[0].register_listener("port", shared).await.unwrap();
    assert_eq!(services[0].shard().listener_support().listener_count(), 1);

    let port = Entity::parse("port", "/p1").unwrap();
    let _r1 = services[0].register_candidate(device("/s1")).await.unwrap();
    let _r2 = services[0].register_candidate(port.clone()).await.unwrap();
    assert!(wait_for_owner(&cluster, &port, Some("member-1")).await);

    assert!(wait_until(TIMEOUT, || listener.len() == 2).await);
    assert!(listener.last_for(&port).unwrap().is_owner);
}
