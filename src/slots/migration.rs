//! Slot handover state tracking.
//!
//! One migration walks the slot through:
//! 1. `DestImporting` after `SETSLOT IMPORTING` on the destination
//! 2. `SourceMigrating` after `SETSLOT MIGRATING` on the source
//! 3. keys move with `MIGRATE` (state unchanged)
//! 4. `Reassigned` once `SETSLOT NODE` has been sent
//!
//! `Reassigned` is reached even when the key transfer failed.

use serde::Serialize;

/// Handover state of one slot during a migration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    /// No migration flags set.
    #[default]
    Stable,
    /// Destination accepts ASK-redirected commands for the slot.
    DestImporting,
    /// Source redirects commands for keys it no longer holds.
    SourceMigrating,
    /// Ownership handed to the destination.
    Reassigned,
}

impl MigrationState {
    /// Whether any node currently carries migration flags for the slot.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            MigrationState::DestImporting | MigrationState::SourceMigrating
        )
    }

    /// Check whether `next` is the state that follows this one.
    pub fn can_advance_to(&self, next: MigrationState) -> bool {
        matches!(
            (self, next),
            (MigrationState::Stable, MigrationState::DestImporting)
                | (MigrationState::DestImporting, MigrationState::SourceMigrating)
                | (MigrationState::SourceMigrating, MigrationState::Reassigned)
                // Step 4 failed: the destination is reset to stable.
                | (MigrationState::DestImporting, MigrationState::Stable)
        )
    }
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationState::Stable => write!(f, "stable"),
            MigrationState::DestImporting => write!(f, "dest_importing"),
            MigrationState::SourceMigrating => write!(f, "source_migrating"),
            MigrationState::Reassigned => write!(f, "reassigned"),
        }
    }
}

/// Progress of one (slot, source, destination) migration.
#[derive(Debug, Clone)]
pub struct SlotMigrationTracker {
    /// The slot being migrated.
    pub slot: u16,
    /// Source node ID.
    pub source_node: String,
    /// Destination node ID.
    pub target_node: String,
    /// Current state.
    pub state: MigrationState,
    /// Keys found in the slot before the transfer.
    pub keys_enumerated: u64,
    /// Keys handed to `MIGRATE` successfully.
    pub keys_migrated: u64,
    /// Error text of a failed transfer.
    pub transfer_error: Option<String>,
    /// Finalization failures, one per node that refused `SETSLOT NODE`.
    pub finalize_errors: Vec<String>,
}

impl SlotMigrationTracker {
    /// Create a tracker in the `Stable` state.
    pub fn new(slot: u16, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            slot,
            source_node: source.into(),
            target_node: target.into(),
            state: MigrationState::Stable,
            keys_enumerated: 0,
            keys_migrated: 0,
            transfer_error: None,
            finalize_errors: Vec::new(),
        }
    }

    /// Move to the next state. Out-of-order transitions are ignored and reported.
    pub fn advance(&mut self, next: MigrationState) -> bool {
        if self.state.can_advance_to(next) {
            self.state = next;
            true
        } else {
            tracing::warn!(
                slot = self.slot,
                from = %self.state,
                to = %next,
                "Ignoring out-of-order migration transition"
            );
            false
        }
    }

    /// Record the number of keys found in the slot.
    pub fn record_keys_enumerated(&mut self, count: u64) {
        self.keys_enumerated = count;
    }

    /// Record keys as migrated.
    pub fn record_keys_migrated(&mut self, count: u64) {
        self.keys_migrated += count;
    }

    /// Record a failed transfer.
    pub fn record_transfer_error(&mut self, error: impl Into<String>) {
        self.transfer_error = Some(error.into());
    }

    /// Record a node that refused the final assignment.
    pub fn record_finalize_error(&mut self, error: impl Into<String>) {
        self.finalize_errors.push(error.into());
    }

    /// Handover finished on both nodes and every key arrived.
    pub fn is_clean(&self) -> bool {
        self.state == MigrationState::Reassigned
            && self.transfer_error.is_none()
            && self.finalize_errors.is_empty()
    }
}
