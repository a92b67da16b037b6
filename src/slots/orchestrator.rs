//! Live migration of one hash slot between masters.
//!
//! The handover follows the cluster resharding protocol:
//!
//! 1. `CLUSTER SETSLOT <slot> IMPORTING <source-id>` on the destination
//! 2. `CLUSTER SETSLOT <slot> MIGRATING <destination-id>` on the source
//! 3. `MIGRATE` of every key in the slot from the source, then of any key
//!    written to the source before it started migrating
//! 4. `CLUSTER SETSLOT <slot> NODE <destination-id>` on the source, then the
//!    destination, then (optionally) every other master
//!
//! Step 4 runs even when step 3 failed. The transfer error is still the one
//! returned, with `finalized: true`. Keys left on the old owner that way are
//! moved by migrating the slot to its new owner again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::check_slot;
use super::migration::{MigrationState, SlotMigrationTracker};
use crate::client::{NodeAddress, NodeCommands, NodeConnector, SetSlotState, ValkeyError};
use crate::cluster::{MasterNode, NodeInfo, Topology};
use crate::error::{Error, Result};
use crate::events::{Event, EventKind, EventLog};
use crate::health::Metrics;

/// Extra passes over the source for keys that appeared after enumeration.
const MAX_SWEEPS: usize = 3;

/// Settings for slot migrations.
#[derive(Clone, Debug)]
pub struct MigrationConfig {
    /// `MIGRATE` timeout used by callers that do not pass their own.
    pub timeout: Duration,
    /// Send `SETSLOT NODE` to the masters not involved in the move.
    pub broadcast_assignment: bool,
    /// Keys per `MIGRATE` call. `None` sends every key in one call.
    pub migrate_batch_size: Option<usize>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            broadcast_assignment: true,
            migrate_batch_size: None,
        }
    }
}

impl MigrationConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_broadcast_assignment(mut self, broadcast: bool) -> Self {
        self.broadcast_assignment = broadcast;
        self
    }

    pub fn with_migrate_batch_size(mut self, batch_size: usize) -> Self {
        self.migrate_batch_size = Some(batch_size.max(1));
        self
    }
}

/// Result of a completed migration.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationOutcome {
    pub slot: u16,
    pub source: NodeAddress,
    pub source_id: String,
    pub destination: NodeAddress,
    pub destination_id: String,
    pub keys_moved: u64,
    pub final_state: MigrationState,
    /// Masters outside the move that did not accept the new assignment.
    pub finalize_errors: Vec<String>,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
}

fn as_millis<S: serde::Serializer>(
    duration: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u128(duration.as_millis())
}

/// Moves slots between masters while the cluster keeps serving them.
pub struct SlotMigrator<C: NodeConnector> {
    topology: Topology<C>,
    config: MigrationConfig,
    log: EventLog,
    metrics: Option<Arc<Metrics>>,
}

impl<C: NodeConnector> SlotMigrator<C> {
    pub fn new(topology: Topology<C>, config: MigrationConfig, log: EventLog) -> Self {
        Self {
            topology,
            config,
            log,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn topology(&self) -> &Topology<C> {
        &self.topology
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Move `slot` and all its keys to the master at `destination`.
    #[instrument(skip(self, destination), fields(destination = %destination))]
    pub async fn migrate_slot(
        &self,
        slot: u16,
        destination: &NodeAddress,
        timeout: Duration,
    ) -> Result<MigrationOutcome> {
        let started = Instant::now();
        let result = self.run_migration(slot, destination, timeout, started).await;

        if let Some(metrics) = &self.metrics {
            let label = match &result {
                Ok(_) => "success",
                Err(Error::TransferTimeout { .. }) => "timeout",
                Err(Error::TransferFailed { .. }) => "transfer_failed",
                Err(Error::FinalizationFailed { .. }) => "finalize_failed",
                Err(_) => "error",
            };
            let keys = result.as_ref().map(|o| o.keys_moved).unwrap_or(0);
            metrics.record_migration(label, keys, started.elapsed());
        }

        if let Err(e) = &result {
            error!(slot, error = %e, "Slot migration failed");
            self.log
                .record(Event::new(EventKind::MigrationFailed, e.to_string()).with_slot(slot));
        }
        result
    }

    /// Migrate several slots in order, stopping at the first failure.
    pub async fn migrate_slots(
        &self,
        slots: &[u16],
        destination: &NodeAddress,
        timeout: Duration,
    ) -> Result<Vec<MigrationOutcome>> {
        let mut outcomes = Vec::with_capacity(slots.len());
        for &slot in slots {
            outcomes.push(self.migrate_slot(slot, destination, timeout).await?);
        }
        Ok(outcomes)
    }

    async fn run_migration(
        &self,
        slot: u16,
        destination: &NodeAddress,
        timeout: Duration,
        started: Instant,
    ) -> Result<MigrationOutcome> {
        let slot = check_slot(slot)?;
        self.log.record(
            Event::new(
                EventKind::MigrationStarted,
                format!("migrating slot {} to {}", slot, destination),
            )
            .with_slot(slot),
        );

        let masters = self.topology.list_master_nodes().await?;
        if !masters.iter().any(|m| m.address == *destination) {
            return Err(Error::InvalidMigration {
                slot,
                reason: format!("{} is not a master of the cluster", destination),
            });
        }

        let owner = self.topology.get_slot_owner(slot).await?;
        if owner.address == *destination {
            return self
                .recover_stranded(slot, owner, masters, timeout, started)
                .await;
        }

        let source = self.topology.master_node(&owner.address).await?;
        let dest = self.topology.master_node(destination).await?;
        let keys = source.keys_in_slot(slot).await?;
        let source_id = source.node_id().await?;
        let dest_id = dest.node_id().await?;

        let mut tracker = SlotMigrationTracker::new(slot, &source_id, &dest_id);
        tracker.record_keys_enumerated(keys.len() as u64);
        info!(slot, source = %owner.address, keys = keys.len(), "Starting slot handover");

        if let Err(source_err) = dest
            .commands()
            .cluster_setslot(slot, SetSlotState::Importing(source_id.clone()))
            .await
        {
            return Err(Error::SetSlotFailed {
                slot,
                node: destination.clone(),
                state: "IMPORTING".to_string(),
                source: source_err,
            });
        }
        tracker.advance(MigrationState::DestImporting);
        self.phase(slot, format!("{} importing from {}", destination, owner.address));

        if let Err(source_err) = source
            .commands()
            .cluster_setslot(slot, SetSlotState::Migrating(dest_id.clone()))
            .await
        {
            if let Err(e) = dest
                .commands()
                .cluster_setslot(slot, SetSlotState::Stable)
                .await
            {
                warn!(slot, error = %e, "Failed to reset importing destination");
            }
            tracker.advance(MigrationState::Stable);
            return Err(Error::SetSlotFailed {
                slot,
                node: owner.address.clone(),
                state: "MIGRATING".to_string(),
                source: source_err,
            });
        }
        tracker.advance(MigrationState::SourceMigrating);
        self.phase(slot, format!("{} migrating to {}", owner.address, destination));

        let transfer = self
            .transfer(&source, destination, &keys, timeout, &mut tracker)
            .await;

        let mut finalize_errors = Vec::new();
        for node in [&source, &dest] {
            if let Err(e) = node
                .commands()
                .cluster_setslot(slot, SetSlotState::Node(dest_id.clone()))
                .await
            {
                warn!(slot, node = %node.address(), error = %e, "SETSLOT NODE failed");
                tracker.record_finalize_error(format!("{}: {}", node.address(), e));
                finalize_errors.push(Error::FinalizationFailed {
                    slot,
                    node: node.address().clone(),
                    source: e,
                });
            }
        }
        tracker.advance(MigrationState::Reassigned);
        self.phase(slot, format!("slot assigned to {}", dest_id));

        let mut broadcast_errors = Vec::new();
        if self.config.broadcast_assignment {
            broadcast_errors = self
                .broadcast(slot, &owner.address, destination, &dest_id)
                .await;
        }

        if let Err(e) = transfer {
            return Err(transfer_error(slot, timeout, e, true));
        }
        if let Some(first) = finalize_errors.into_iter().next() {
            return Err(first);
        }

        let outcome = MigrationOutcome {
            slot,
            source: owner.address,
            source_id,
            destination: destination.clone(),
            destination_id: dest_id,
            keys_moved: tracker.keys_migrated,
            final_state: tracker.state,
            finalize_errors: broadcast_errors,
            duration: started.elapsed(),
        };
        info!(slot, keys_moved = outcome.keys_moved, "Slot migration finished");
        self.log.record(
            Event::new(
                EventKind::MigrationFinished,
                format!("slot {} moved with {} keys", slot, outcome.keys_moved),
            )
            .with_slot(slot),
        );
        Ok(outcome)
    }

    /// The destination already owns `slot`. Moves keys that an interrupted
    /// handover left on other masters, where nobody serves them.
    ///
    /// Each such master is marked importing from the owner so it accepts the
    /// `MIGRATE`, then made stable again.
    async fn recover_stranded(
        &self,
        slot: u16,
        owner: NodeInfo,
        masters: Vec<NodeInfo>,
        timeout: Duration,
        started: Instant,
    ) -> Result<MigrationOutcome> {
        let mut tracker = SlotMigrationTracker::new(slot, &owner.node_id, &owner.node_id);

        for master in masters {
            if master.address == owner.address || !master.healthy {
                continue;
            }
            let node = self.topology.master_node(&master.address).await?;
            let keys = node.keys_in_slot(slot).await?;
            if keys.is_empty() {
                continue;
            }
            warn!(slot, node = %master.address, keys = keys.len(), "Found keys stranded outside the slot owner");
            tracker.record_keys_enumerated(tracker.keys_enumerated + keys.len() as u64);

            node.commands()
                .cluster_setslot(slot, SetSlotState::Importing(owner.node_id.clone()))
                .await
                .map_err(|source| Error::SetSlotFailed {
                    slot,
                    node: master.address.clone(),
                    state: "IMPORTING".to_string(),
                    source,
                })?;
            let moved = self
                .migrate_batches(&node, &owner.address, &keys, timeout, &mut tracker)
                .await;
            let reset = node
                .commands()
                .cluster_setslot(slot, SetSlotState::Stable)
                .await;
            moved.map_err(|e| transfer_error(slot, timeout, e, false))?;
            reset.map_err(|source| Error::FinalizationFailed {
                slot,
                node: master.address.clone(),
                source,
            })?;
            self.phase(
                slot,
                format!("moved {} stranded keys from {}", keys.len(), master.address),
            );
        }

        let outcome = MigrationOutcome {
            slot,
            source: owner.address.clone(),
            source_id: owner.node_id.clone(),
            destination: owner.address,
            destination_id: owner.node_id,
            keys_moved: tracker.keys_migrated,
            final_state: tracker.state,
            finalize_errors: Vec::new(),
            duration: started.elapsed(),
        };
        info!(slot, keys_moved = outcome.keys_moved, "Slot already at destination");
        self.log.record(
            Event::new(
                EventKind::MigrationFinished,
                format!(
                    "slot {} already owned by {}, {} stranded keys moved",
                    slot, outcome.destination, outcome.keys_moved
                ),
            )
            .with_slot(slot),
        );
        Ok(outcome)
    }

    /// `MIGRATE` every key, in batches when configured.
    async fn transfer(
        &self,
        source: &MasterNode<C::Node>,
        destination: &NodeAddress,
        keys: &[String],
        timeout: Duration,
        tracker: &mut SlotMigrationTracker,
    ) -> std::result::Result<(), ValkeyError> {
        if keys.is_empty() {
            self.phase(tracker.slot, "no keys to migrate".to_string());
        } else {
            self.migrate_batches(source, destination, keys, timeout, tracker)
                .await?;
        }

        // Keys written between enumeration and MIGRATING stay on the source.
        for _ in 0..MAX_SWEEPS {
            let slot = tracker.slot;
            let commands = source.commands();
            let count = commands.cluster_count_keys_in_slot(slot).await?;
            if count == 0 {
                break;
            }
            let late = commands.cluster_get_keys_in_slot(slot, count).await?;
            debug!(slot, count = late.len(), "Migrating keys written during handover");
            tracker.record_keys_enumerated(tracker.keys_enumerated + late.len() as u64);
            self.migrate_batches(source, destination, &late, timeout, tracker)
                .await?;
        }

        if tracker.keys_migrated > 0 {
            self.phase(tracker.slot, format!("migrated {} keys", tracker.keys_migrated));
        }
        Ok(())
    }

    async fn migrate_batches(
        &self,
        source: &MasterNode<C::Node>,
        destination: &NodeAddress,
        keys: &[String],
        timeout: Duration,
        tracker: &mut SlotMigrationTracker,
    ) -> std::result::Result<(), ValkeyError> {
        let batch_size = self.config.migrate_batch_size.unwrap_or(keys.len()).max(1);
        for batch in keys.chunks(batch_size) {
            if let Err(e) = source
                .commands()
                .migrate_keys(destination, batch, timeout)
                .await
            {
                tracker.record_transfer_error(e.to_string());
                return Err(e);
            }
            tracker.record_keys_migrated(batch.len() as u64);
        }
        Ok(())
    }

    /// Best-effort `SETSLOT NODE` on the masters outside the move.
    async fn broadcast(
        &self,
        slot: u16,
        source: &NodeAddress,
        destination: &NodeAddress,
        dest_id: &str,
    ) -> Vec<String> {
        let masters = match self.topology.list_master_nodes().await {
            Ok(masters) => masters,
            Err(e) => {
                warn!(slot, error = %e, "Skipping assignment broadcast");
                return vec![e.to_string()];
            }
        };

        let mut errors = Vec::new();
        for master in masters {
            if master.address == *source || master.address == *destination || !master.healthy {
                continue;
            }
            let result = match self.topology.master_node(&master.address).await {
                Ok(node) => node
                    .commands()
                    .cluster_setslot(slot, SetSlotState::Node(dest_id.to_string()))
                    .await
                    .map_err(Error::from),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(slot, node = %master.address, error = %e, "Assignment broadcast failed");
                errors.push(format!("{}: {}", master.address, e));
            }
        }
        errors
    }

    fn phase(&self, slot: u16, message: String) {
        self.log
            .record(Event::new(EventKind::MigrationPhase, message).with_slot(slot));
    }
}

fn transfer_error(slot: u16, timeout: Duration, e: ValkeyError, finalized: bool) -> Error {
    if e.is_timeout() {
        Error::TransferTimeout {
            slot,
            timeout,
            message: e.to_string(),
            finalized,
        }
    } else {
        Error::TransferFailed {
            slot,
            source: e,
            finalized,
        }
    }
}
