//! Slot migration against a simulated cluster.

use valkey_reshard::client::DataCommands;
use valkey_reshard::error::Error;
use valkey_reshard::events::EventKind;
use valkey_reshard::sim::{MigrateFault, SimCluster};
use valkey_reshard::slots::{MigrationState, SlotError, key_slot};

use crate::{MIGRATE_TIMEOUT, addr, migrator, other_than, topology};

/// Count the masters that claim `slot` through the ownership probe.
async fn claimants(cluster: &SimCluster, slot: u16) -> usize {
    let topology = topology(cluster);
    let mut count = 0;
    for address in cluster.addresses() {
        let node = topology.master_node(&address).await.unwrap();
        if node.is_slot_owner(slot).await.unwrap() {
            count += 1;
        }
    }
    count
}

// ============================================================================
// Successful handovers
// ============================================================================

/// Slot 15495 holds `a`, `b{a}` and `c{a}`; all three follow the slot.
#[tokio::test]
async fn test_migrate_slot_with_co_located_keys() {
    let cluster = SimCluster::new(3);
    let client = cluster.client();
    for (key, value) in [("a", "1"), ("b{a}", "2"), ("c{a}", "3"), ("foo", "bar")] {
        client.set(key, value).await.unwrap();
    }
    assert_eq!(key_slot("a"), 15495);
    assert_eq!(cluster.owner_of(15495), Some(addr(50003)));

    let (migrator, log, metrics) = migrator(&cluster);
    let outcome = migrator
        .migrate_slot(15495, &addr(50001), MIGRATE_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(outcome.slot, 15495);
    assert_eq!(outcome.source, addr(50003));
    assert_eq!(outcome.destination, addr(50001));
    assert_eq!(outcome.keys_moved, 3);
    assert_eq!(outcome.final_state, MigrationState::Reassigned);
    assert!(outcome.finalize_errors.is_empty());

    // Destination lists exactly the three keys, the source none.
    let dest = topology(&cluster).master_node(&addr(50001)).await.unwrap();
    let source = topology(&cluster).master_node(&addr(50003)).await.unwrap();
    assert_eq!(dest.keys_in_slot(15495).await.unwrap(), vec!["a", "b{a}", "c{a}"]);
    assert!(source.keys_in_slot(15495).await.unwrap().is_empty());

    // Ownership moved and only the destination claims the slot.
    assert!(dest.is_slot_owner(15495).await.unwrap());
    assert!(!source.is_slot_owner(15495).await.unwrap());
    assert_eq!(claimants(&cluster, 15495).await, 1);
    assert_eq!(
        topology(&cluster).get_slot_owner(15495).await.unwrap().address,
        addr(50001)
    );
    assert!(!cluster.has_open_slots());

    // Values are intact and reachable through a cluster client.
    assert_eq!(client.get("b{a}").await.unwrap(), Some("2".to_string()));

    // A key in another slot keeps its owner and value.
    assert_eq!(cluster.owner_of(key_slot("foo")), Some(addr(50003)));
    assert_eq!(client.get("foo").await.unwrap(), Some("bar".to_string()));

    assert_eq!(log.count(EventKind::MigrationStarted), 1);
    assert_eq!(log.count(EventKind::MigrationFinished), 1);
    assert!(log.count(EventKind::MigrationPhase) >= 3);
    assert!(
        metrics
            .encode()
            .contains("reshard_migrations_total{result=\"success\"} 1")
    );
}

#[tokio::test]
async fn test_migrate_empty_slot_hands_over_ownership() {
    let cluster = SimCluster::new(3);
    assert_eq!(cluster.owner_of(100), Some(addr(50001)));

    let (migrator, _, _) = migrator(&cluster);
    let outcome = migrator
        .migrate_slot(100, &addr(50002), MIGRATE_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(outcome.keys_moved, 0);
    assert_eq!(cluster.owner_of(100), Some(addr(50002)));
    assert_eq!(claimants(&cluster, 100).await, 1);
    assert!(!cluster.has_open_slots());
}

#[tokio::test]
async fn test_migrate_in_batches() {
    let cluster = SimCluster::new(2);
    let client = cluster.client();
    for i in 0..25 {
        client.set(&format!("user:{{7}}:{}", i), "x").await.unwrap();
    }
    let slot = key_slot("7");
    let source = cluster.owner_of(slot).unwrap();
    let dest = other_than(&cluster, &source);

    let log = valkey_reshard::events::EventLog::new();
    let migrator = valkey_reshard::slots::SlotMigrator::new(
        topology(&cluster),
        valkey_reshard::slots::MigrationConfig::default().with_migrate_batch_size(10),
        log,
    );
    let outcome = migrator
        .migrate_slot(slot, &dest, MIGRATE_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(outcome.keys_moved, 25);
    assert_eq!(cluster.keys_on(&dest, slot).len(), 25);
    assert!(cluster.keys_on(&source, slot).is_empty());
}

#[tokio::test]
async fn test_migrate_several_slots() {
    let cluster = SimCluster::new(3);
    let (migrator, _, _) = migrator(&cluster);

    let outcomes = migrator
        .migrate_slots(&[0, 1, 2], &addr(50003), MIGRATE_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 3);
    assert_eq!(cluster.slot_counts(), vec![5459, 5461, 5464]);
    for slot in 0..3 {
        assert_eq!(cluster.owner_of(slot), Some(addr(50003)));
    }
}

#[tokio::test]
async fn test_other_masters_failing_the_broadcast_do_not_fail_the_migration() {
    let cluster = SimCluster::new(3);
    cluster.fail_next_setslot(&addr(50002), "NODE", "ERR busy");

    let (migrator, _, _) = migrator(&cluster);
    let outcome = migrator
        .migrate_slot(15495, &addr(50001), MIGRATE_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(outcome.finalize_errors.len(), 1);
    assert!(outcome.finalize_errors[0].contains("127.0.0.1:50002"));
    assert_eq!(cluster.owner_of(15495), Some(addr(50001)));
}

// ============================================================================
// Rejected requests
// ============================================================================

/// Asking for a move the cluster already made changes nothing.
#[tokio::test]
async fn test_migrate_to_current_owner_is_a_no_op() {
    let cluster = SimCluster::new(3);
    cluster.client().set("a", "v").await.unwrap();
    let (migrator, log, _) = migrator(&cluster);

    let outcome = migrator
        .migrate_slot(15495, &addr(50003), MIGRATE_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(outcome.keys_moved, 0);
    assert_eq!(outcome.source, addr(50003));
    assert_eq!(outcome.destination, addr(50003));
    assert_eq!(outcome.final_state, MigrationState::Stable);
    assert_eq!(cluster.owner_of(15495), Some(addr(50003)));
    assert_eq!(cluster.keys_on(&addr(50003), 15495), vec!["a".to_string()]);
    assert!(!cluster.has_open_slots());
    assert_eq!(log.count(EventKind::MigrationFinished), 1);
}

#[tokio::test]
async fn test_migrate_to_unknown_node_is_invalid() {
    let cluster = SimCluster::new(3);
    let (migrator, _, _) = migrator(&cluster);

    let err = migrator
        .migrate_slot(15495, &addr(6379), MIGRATE_TIMEOUT)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidMigration { slot: 15495, .. }));
    assert_eq!(cluster.owner_of(15495), Some(addr(50003)));
    assert!(!cluster.has_open_slots());
}

#[tokio::test]
async fn test_migrate_out_of_range_slot() {
    let cluster = SimCluster::new(3);
    let (migrator, log, _) = migrator(&cluster);

    let err = migrator
        .migrate_slot(16384, &addr(50001), MIGRATE_TIMEOUT)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Slot(SlotError::OutOfRange(16384))));
    assert_eq!(log.count(EventKind::MigrationFailed), 1);
}

#[tokio::test]
async fn test_no_owner_when_owner_is_down() {
    let cluster = SimCluster::new(3);
    cluster.set_reachable(&addr(50003), false);
    let (migrator, _, _) = migrator(&cluster);

    let err = topology(&cluster).get_slot_owner(15495).await.unwrap_err();
    assert!(matches!(err, Error::NoOwnerFound { slot: 15495 }));

    let err = migrator
        .migrate_slot(15495, &addr(50001), MIGRATE_TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoOwnerFound { slot: 15495 }));
}

#[tokio::test]
async fn test_unreachable_seed() {
    let cluster = SimCluster::new(3);
    cluster.set_reachable(&addr(50001), false);

    let err = topology(&cluster).list_master_nodes().await.unwrap_err();
    match err {
        Error::TopologyUnavailable { address, .. } => assert_eq!(address, addr(50001)),
        other => panic!("unexpected error: {}", other),
    }
}

// ============================================================================
// Failures during the handover
// ============================================================================

#[tokio::test]
async fn test_importing_refused_leaves_cluster_untouched() {
    let cluster = SimCluster::new(3);
    cluster.fail_next_setslot(&addr(50001), "IMPORTING", "ERR refused");
    let (migrator, _, _) = migrator(&cluster);

    let err = migrator
        .migrate_slot(15495, &addr(50001), MIGRATE_TIMEOUT)
        .await
        .unwrap_err();

    match err {
        Error::SetSlotFailed { node, state, .. } => {
            assert_eq!(node, addr(50001));
            assert_eq!(state, "IMPORTING");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(cluster.owner_of(15495), Some(addr(50003)));
    assert!(!cluster.has_open_slots());
}

#[tokio::test]
async fn test_migrating_refused_resets_destination() {
    let cluster = SimCluster::new(3);
    cluster.fail_next_setslot(&addr(50003), "MIGRATING", "ERR refused");
    let (migrator, _, _) = migrator(&cluster);

    let err = migrator
        .migrate_slot(15495, &addr(50001), MIGRATE_TIMEOUT)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SetSlotFailed { ref state, .. } if state == "MIGRATING"));
    assert_eq!(cluster.owner_of(15495), Some(addr(50003)));
    assert!(!cluster.has_open_slots());
}

/// The slot is still assigned to the destination after a timed out transfer.
/// Keys that did not move stay on the source and are no longer served.
#[tokio::test]
async fn test_transfer_timeout_still_finalizes() {
    let cluster = SimCluster::new(3);
    let client = cluster.client();
    for key in ["a", "b{a}", "c{a}"] {
        client.set(key, "v").await.unwrap();
    }
    cluster.fail_next_migrate(&addr(50003), MigrateFault::Timeout);
    let (migrator, log, metrics) = migrator(&cluster);

    let err = migrator
        .migrate_slot(15495, &addr(50001), MIGRATE_TIMEOUT)
        .await
        .unwrap_err();

    match err {
        Error::TransferTimeout {
            slot,
            timeout,
            finalized,
            ..
        } => {
            assert_eq!(slot, 15495);
            assert_eq!(timeout, MIGRATE_TIMEOUT);
            assert!(finalized);
        }
        other => panic!("unexpected error: {}", other),
    }

    assert_eq!(cluster.owner_of(15495), Some(addr(50001)));
    assert_eq!(cluster.keys_on(&addr(50003), 15495).len(), 3);
    assert!(cluster.keys_on(&addr(50001), 15495).is_empty());
    assert_eq!(client.get("a").await.unwrap(), None);

    assert_eq!(log.count(EventKind::MigrationFailed), 1);
    assert!(
        metrics
            .encode()
            .contains("reshard_migrations_total{result=\"timeout\"} 1")
    );
}

/// Running the same migration again after a timed out transfer moves the
/// keys left on the old owner, and a third run has nothing left to do.
#[tokio::test]
async fn test_rerun_recovers_keys_left_by_timed_out_transfer() {
    let cluster = SimCluster::new(3);
    let client = cluster.client();
    for key in ["a", "b{a}", "c{a}"] {
        client.set(key, "v").await.unwrap();
    }
    cluster.fail_next_migrate(&addr(50003), MigrateFault::Timeout);
    let (migrator, log, _) = migrator(&cluster);

    migrator
        .migrate_slot(15495, &addr(50001), MIGRATE_TIMEOUT)
        .await
        .unwrap_err();
    assert_eq!(cluster.keys_on(&addr(50003), 15495).len(), 3);

    let outcome = migrator
        .migrate_slot(15495, &addr(50001), MIGRATE_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(outcome.keys_moved, 3);
    assert_eq!(outcome.destination, addr(50001));
    assert!(cluster.keys_on(&addr(50003), 15495).is_empty());
    assert_eq!(cluster.keys_on(&addr(50001), 15495).len(), 3);
    assert_eq!(cluster.owner_of(15495), Some(addr(50001)));
    assert!(!cluster.has_open_slots());
    assert_eq!(client.get("b{a}").await.unwrap().as_deref(), Some("v"));
    assert_eq!(log.count(EventKind::MigrationFinished), 1);

    let again = migrator
        .migrate_slot(15495, &addr(50001), MIGRATE_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(again.keys_moved, 0);
}

#[tokio::test]
async fn test_transfer_error_is_reported_as_failed_transfer() {
    let cluster = SimCluster::new(3);
    cluster.client().set("a", "v").await.unwrap();
    cluster.fail_next_migrate(
        &addr(50003),
        MigrateFault::Error("ERR Target instance replied with error: NOAUTH".to_string()),
    );
    let (migrator, _, _) = migrator(&cluster);

    let err = migrator
        .migrate_slot(15495, &addr(50001), MIGRATE_TIMEOUT)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::TransferFailed {
            slot: 15495,
            finalized: true,
            ..
        }
    ));
}

#[tokio::test]
async fn test_destination_refusing_assignment() {
    let cluster = SimCluster::new(3);
    cluster.fail_next_setslot(&addr(50002), "NODE", "ERR refused");
    let (migrator, _, metrics) = migrator(&cluster);

    let err = migrator
        .migrate_slot(100, &addr(50002), MIGRATE_TIMEOUT)
        .await
        .unwrap_err();

    match err {
        Error::FinalizationFailed { slot, node, .. } => {
            assert_eq!(slot, 100);
            assert_eq!(node, addr(50002));
        }
        other => panic!("unexpected error: {}", other),
    }
    // The destination still has the slot flagged as importing.
    assert!(cluster.has_open_slots());
    assert!(
        metrics
            .encode()
            .contains("reshard_migrations_total{result=\"finalize_failed\"} 1")
    );
}

// ============================================================================
// Node helpers
// ============================================================================

#[tokio::test]
async fn test_memory_helpers_and_flush() {
    let cluster = SimCluster::new(1);
    let client = cluster.client();
    client.set("small", "x").await.unwrap();
    client.hset("big", "field", &"y".repeat(100)).await.unwrap();

    let node = topology(&cluster).master_node(&addr(50001)).await.unwrap();
    let usage = node.all_keys_with_memory_usage().await.unwrap();
    assert_eq!(usage.len(), 2);
    assert_eq!(usage[0].key, "big");
    assert!(usage[0].bytes.unwrap() > usage[1].bytes.unwrap());

    let info = node.memory_info().await.unwrap();
    assert!(info.used_memory > 0);

    node.flush_all().await.unwrap();
    assert!(node.all_keys().await.unwrap().is_empty());
    assert_eq!(node.memory_usage("small").await.unwrap(), None);
}

/// Moving a slot frees memory on the source and keeps every key reachable.
#[tokio::test]
async fn test_memory_moves_with_the_slot() {
    let cluster = SimCluster::new(3);
    let client = cluster.client();
    for key in ["a", "b{a}", "c{a}", "foo"] {
        client.set(key, &"v".repeat(64)).await.unwrap();
    }
    let topology = topology(&cluster);
    let source = topology.master_node(&addr(50003)).await.unwrap();
    let dest = topology.master_node(&addr(50001)).await.unwrap();
    let source_before = source.memory_info().await.unwrap().used_memory;
    let dest_before = dest.memory_info().await.unwrap().used_memory;
    let keys_before = topology.all_keys().await.unwrap();

    let (migrator, _, _) = migrator(&cluster);
    migrator
        .migrate_slot(15495, &addr(50001), MIGRATE_TIMEOUT)
        .await
        .unwrap();

    assert!(source.memory_info().await.unwrap().used_memory < source_before);
    assert!(dest.memory_info().await.unwrap().used_memory > dest_before);
    assert_eq!(topology.all_keys().await.unwrap(), keys_before);
    assert_eq!(keys_before, vec!["a", "b{a}", "c{a}", "foo"]);
}

/// One connection per master, however many slots move, all closed at the end.
#[tokio::test]
async fn test_node_connections_are_reused_and_closed() {
    let cluster = SimCluster::new(3);
    let client = cluster.client();
    for key in ["a", "b{a}", "foo"] {
        client.set(key, "v").await.unwrap();
    }
    let (migrator, _, _) = migrator(&cluster);
    let slots = [key_slot("a"), key_slot("foo"), 100, 101, 102];
    let destination = addr(50002);

    for &slot in &slots {
        migrator
            .migrate_slot(slot, &destination, MIGRATE_TIMEOUT)
            .await
            .unwrap();
    }

    assert!(cluster.connections_opened() <= 3);
    assert_eq!(migrator.topology().open_connections(), 3);
    migrator.topology().disconnect().await;
    assert_eq!(migrator.topology().open_connections(), 0);
    assert_eq!(cluster.open_connections(), 0);
}
