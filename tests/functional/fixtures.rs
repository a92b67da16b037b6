//! Shared helpers for functional tests.

use std::sync::Arc;
use std::time::Duration;

use valkey_reshard::client::NodeAddress;
use valkey_reshard::cluster::Topology;
use valkey_reshard::events::EventLog;
use valkey_reshard::health::Metrics;
use valkey_reshard::probe::{Prober, ProberConfig};
use valkey_reshard::sim::{BASE_PORT, SimCluster, SimClusterClient};
use valkey_reshard::slots::{MigrationConfig, SlotMigrator};

/// Timeout passed to `migrate_slot` in tests.
pub const MIGRATE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Address of simulated node `port`.
pub fn addr(port: u16) -> NodeAddress {
    NodeAddress::new("127.0.0.1", port)
}

/// Topology seeded at the first simulated node.
pub fn topology(cluster: &SimCluster) -> Topology<SimCluster> {
    Topology::new(Arc::new(cluster.clone()), addr(BASE_PORT))
}

/// Migrator with default settings, its event log and metrics.
pub fn migrator(cluster: &SimCluster) -> (SlotMigrator<SimCluster>, EventLog, Arc<Metrics>) {
    let log = EventLog::new();
    let metrics = Arc::new(Metrics::new());
    let migrator = SlotMigrator::new(topology(cluster), MigrationConfig::default(), log.clone())
        .with_metrics(Arc::clone(&metrics));
    (migrator, log, metrics)
}

/// Probe settings in milliseconds.
pub fn probe_config(interval_ms: u64, duration_ms: u64, delay_ms: u64) -> ProberConfig {
    ProberConfig::new("probe")
        .with_interval(Duration::from_millis(interval_ms))
        .with_duration(Duration::from_millis(duration_ms))
        .with_read_after_write_delay(Duration::from_millis(delay_ms))
}

/// Prober over a cluster-aware client of `cluster`.
pub fn prober(cluster: &SimCluster, config: ProberConfig) -> Prober<SimClusterClient> {
    Prober::new(Arc::new(cluster.client()), config, EventLog::new())
}

/// Some node other than `address`.
pub fn other_than(cluster: &SimCluster, address: &NodeAddress) -> NodeAddress {
    cluster
        .addresses()
        .into_iter()
        .find(|a| a != address)
        .expect("cluster has at least two nodes")
}
