//! Basic example of entity ownership election in a simulated three-member cluster.

use entity_ownership::testing::{wait_until, RecordingListener, SimulatedCluster};
use entity_ownership::{Entity, OwnershipConfig};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter("entity_ownership=debug,info")
        .init();

    let cluster = SimulatedCluster::new(["member-1", "member-2", "member-3"]);
    let m1 = cluster.start(OwnershipConfig::new("member-1"))?;
    let m2 = cluster.start(OwnershipConfig::new("member-2"))?;
    let m3 = cluster.start(OwnershipConfig::new("member-3"))?;

    println!("Electing member-1 as shard leader...");
    cluster.elect("member-1");

    let listener = Arc::new(RecordingListener::new());
    let _listener_registration = m2.register_listener("device", listener.clone()).await?;

    // Two candidates for the same entity
    let entity = Entity::parse("device", "/openflow:1")?;
    let _r2 = m2.register_candidate(entity.clone()).await?;
    let _r3 = m3.register_candidate(entity.clone()).await?;

    wait_until(Duration::from_secs(5), || cluster.owner(&entity).is_some()).await;
    println!("\nOwner of {}: {:?}", entity, cluster.owner(&entity));
    println!("Candidates: {:?}", cluster.candidates(&entity));

    // The owner becomes unreachable, the remaining candidate takes over
    if let Some(owner) = cluster.owner(&entity) {
        println!("\nMarking {} down...", owner);
        cluster.peer_down(owner.clone());
        wait_until(Duration::from_secs(5), || {
            cluster.owner(&entity).is_some_and(|o| o != owner)
        })
        .await;
        println!("New owner: {:?}", cluster.owner(&entity));
    }

    println!("\nNotifications seen by member-2:");
    for change in listener.changes() {
        println!(
            "  {} was_owner={} is_owner={} has_owner={}",
            change.entity, change.was_owner, change.is_owner, change.has_owner
        );
    }

    let metrics = m1.metrics().snapshot();
    println!("\nLeader metrics:");
    println!("  Batches submitted: {}", metrics.batches_submitted);
    println!("  Owner writes: {}", metrics.owner_writes);
    println!("  Down peers: {}", metrics.down_peers);

    // Shutdown
    println!("\nShutting down...");
    for service in [m1, m2, m3] {
        service.shutdown().await;
    }

    Ok(())
}
