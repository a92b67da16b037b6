//! Live consistency probing.

use std::time::Duration;

use valkey_reshard::events::EventLog;
use valkey_reshard::probe::{Prober, ProberConfig};
use valkey_reshard::slots::key_slot;

use crate::{MIGRATE_TIMEOUT, cluster_client, init_test, migrator, other_master, topology};

fn probe_config(prefix: &str) -> ProberConfig {
    ProberConfig::new(prefix)
        .with_duration(Duration::from_secs(3))
        .with_interval(Duration::from_millis(100))
        .with_read_after_write_delay(Duration::from_millis(20))
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a local Valkey cluster on ports 50001-50003"]
async fn test_probe_on_stable_cluster() {
    let _guard = init_test().await;
    let client = cluster_client().await;
    let prober = Prober::new(client.clone(), probe_config("it-stable"), EventLog::new());

    prober.start().expect("start");
    let report = prober.wait().await.expect("report");

    assert!(report.total_cycles >= 29, "only {} cycles", report.total_cycles);
    assert!(report.is_clean(), "{:?} {:?}", report.misses, report.missing_after);
    client.close().await.ok();
}

/// Move the hash and sorted-set slots mid-run and back again.
#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a local Valkey cluster on ports 50001-50003"]
async fn test_probe_during_migration_has_no_data_loss() {
    let _guard = init_test().await;
    let client = cluster_client().await;
    let config = probe_config("it-migrate");
    let slots = [key_slot(&config.hash_key()), key_slot(&config.zset_key())];
    let prober = Prober::new(client.clone(), config, EventLog::new());
    let (migrator, _) = migrator();

    prober.start().expect("start");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut moved = Vec::new();
    for slot in slots {
        let origin = topology().get_slot_owner(slot).await.unwrap().address;
        let destination = other_master(&origin).await;
        migrator
            .migrate_slot(slot, &destination, MIGRATE_TIMEOUT)
            .await
            .expect("migrate");
        moved.push((slot, origin));
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    let report = prober.wait().await.expect("report");
    assert_eq!(report.data_loss(), 0.0, "{:?}", report.missing_after);

    for (slot, origin) in moved {
        migrator
            .migrate_slot(slot, &origin, MIGRATE_TIMEOUT)
            .await
            .expect("migrate back");
    }
    client.close().await.ok();
}
