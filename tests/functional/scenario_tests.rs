//! Probing while slots move.
//!
//! Clients that follow `MOVED` and `ASK` should see neither downtime nor data
//! loss when slots are migrated under them.

use std::time::Duration;

use valkey_reshard::sim::SimCluster;
use valkey_reshard::slots::key_slot;

use crate::{MIGRATE_TIMEOUT, migrator, other_than, probe_config, prober, topology};

/// Move every slot the probe writes to, one after another, mid-run.
#[tokio::test(start_paused = true)]
async fn test_probe_during_migrations_loses_nothing() {
    let cluster = SimCluster::new(3).with_latency(Duration::from_millis(1));
    let config = probe_config(100, 3000, 20);
    let slots = vec![
        key_slot(&config.hash_key()),
        key_slot(&config.zset_key()),
        key_slot(&config.cycle_key(5)),
        key_slot(&config.cycle_key(12)),
    ];
    let prober = prober(&cluster, config);
    let (migrator, log, _) = migrator(&cluster);

    prober.start().unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    for slot in &slots {
        let owner = cluster.owner_of(*slot).unwrap();
        let dest = other_than(&cluster, &owner);
        let outcome = migrator
            .migrate_slot(*slot, &dest, MIGRATE_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(cluster.owner_of(*slot), Some(dest));
        assert!(outcome.finalize_errors.is_empty());
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    let report = prober.wait().await.unwrap();
    assert_eq!(report.total_cycles, 30);
    assert!(report.missing_after.is_empty(), "{:?}", report.missing_after);
    assert!(report.misses.is_empty(), "{:?}", report.misses);
    assert_eq!(report.data_loss(), 0.0);
    assert_eq!(log.count(valkey_reshard::events::EventKind::MigrationFinished), slots.len());
    assert!(!cluster.has_open_slots());
}

/// Migrate the hash slot back and forth; the hash keeps every field.
#[tokio::test(start_paused = true)]
async fn test_ping_pong_migration_keeps_hash_fields() {
    let cluster = SimCluster::new(2).with_latency(Duration::from_millis(2));
    let config = probe_config(50, 2000, 10);
    let slot = key_slot(&config.hash_key());
    let prober = prober(&cluster, config);
    let (migrator, _, _) = migrator(&cluster);

    prober.start().unwrap();
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let owner = cluster.owner_of(slot).unwrap();
        let dest = other_than(&cluster, &owner);
        migrator
            .migrate_slot(slot, &dest, MIGRATE_TIMEOUT)
            .await
            .unwrap();
    }

    let report = prober.wait().await.unwrap();
    assert_eq!(report.total_cycles, 40);
    assert!(report.is_clean(), "{:?} {:?}", report.misses, report.missing_after);
}

/// At rest, exactly one master claims each slot.
#[tokio::test]
async fn test_single_owner_per_slot_after_migrations() {
    let cluster = SimCluster::new(3);
    let (migrator, _, _) = migrator(&cluster);
    let moved = [0u16, 5461, 5462, 10923, 16383];
    for slot in moved {
        let owner = cluster.owner_of(slot).unwrap();
        let dest = other_than(&cluster, &owner);
        migrator
            .migrate_slot(slot, &dest, MIGRATE_TIMEOUT)
            .await
            .unwrap();
    }

    let topology = topology(&cluster);
    for slot in moved.into_iter().chain([1, 8000, 15495]) {
        let mut claimants = Vec::new();
        for address in cluster.addresses() {
            let node = topology.master_node(&address).await.unwrap();
            if node.is_slot_owner(slot).await.unwrap() {
                claimants.push(address);
            }
        }
        assert_eq!(claimants.len(), 1, "slot {} claimed by {:?}", slot, claimants);
        assert_eq!(Some(claimants[0].clone()), cluster.owner_of(slot));
    }
    assert_eq!(cluster.slot_counts().iter().sum::<usize>(), 16384);
}
