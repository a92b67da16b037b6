//! Hash slot logic for Valkey clusters.
//!
//! Pure helpers (hashing, ranges, handover states) live next to the
//! [`SlotMigrator`], which drives a live slot handover.
//!
//! ## Module Structure
//!
//! - [`hashing`]: Key to slot mapping and synthetic keys for a slot
//! - [`distribution`]: Slot ranges and even distributions
//! - [`migration`]: Handover state tracking
//! - [`orchestrator`]: The `IMPORTING`/`MIGRATING`/`MIGRATE`/`NODE` sequence

use thiserror::Error;

pub mod distribution;
pub mod hashing;
pub mod migration;
pub mod orchestrator;

pub use distribution::{
    MAX_SLOT, SlotRange, TOTAL_SLOTS, calculate_distribution, check_slot, compress_slots,
};
pub use hashing::{hash_tag, hash_tag_for_slot, key_for_slot, key_slot, ownership_probe_key};
pub use migration::{MigrationState, SlotMigrationTracker};
pub use orchestrator::{MigrationConfig, MigrationOutcome, SlotMigrator};

/// Invalid slot input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlotError {
    #[error("slot {0} is out of range (0-16383)")]
    OutOfRange(u16),
    #[error("invalid slot range: {0}")]
    InvalidRange(String),
}
