//! Error types for resharding operations.
//!
//! Defines the crate error with classification for retry behavior, plus the
//! prober and configuration errors.

use std::time::Duration;

use thiserror::Error;

use crate::client::{NodeAddress, ValkeyError};
use crate::probe::ProbeStatus;
use crate::slots::SlotError;

/// Error type for topology and migration operations
#[derive(Error, Debug)]
pub enum Error {
    /// The seed node could not report the cluster topology
    #[error("Topology unavailable from {address}: {source}")]
    TopologyUnavailable {
        address: NodeAddress,
        #[source]
        source: ValkeyError,
    },

    /// No master claims the slot
    #[error("No owner found for slot {slot}")]
    NoOwnerFound { slot: u16 },

    /// A node command failed outside the transfer itself
    #[error("Valkey error: {0}")]
    Valkey(#[from] ValkeyError),

    /// `CLUSTER SETSLOT` was refused before any key moved
    #[error("SETSLOT {slot} {state} on {node} failed: {source}")]
    SetSlotFailed {
        slot: u16,
        node: NodeAddress,
        state: String,
        #[source]
        source: ValkeyError,
    },

    /// `MIGRATE` ran out of time. `finalized` tells whether `SETSLOT NODE`
    /// was still sent afterwards.
    #[error("Transfer of slot {slot} timed out after {timeout:?}: {message}")]
    TransferTimeout {
        slot: u16,
        timeout: Duration,
        message: String,
        finalized: bool,
    },

    /// `MIGRATE` failed
    #[error("Transfer of slot {slot} failed: {source}")]
    TransferFailed {
        slot: u16,
        #[source]
        source: ValkeyError,
        finalized: bool,
    },

    /// Keys moved but a node refused the final assignment
    #[error("Finalizing slot {slot} on {node} failed: {source}")]
    FinalizationFailed {
        slot: u16,
        node: NodeAddress,
        #[source]
        source: ValkeyError,
    },

    /// The requested migration cannot be performed
    #[error("Invalid migration of slot {slot}: {reason}")]
    InvalidMigration { slot: u16, reason: String },

    #[error("Slot error: {0}")]
    Slot(#[from] SlotError),

    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Valkey(e) => e.is_transient(),
            Error::SetSlotFailed { source, .. } => source.is_transient(),
            Error::TransferTimeout { .. } => true,
            Error::TransferFailed { source, .. } => source.is_transient(),
            // Re-running the migration finishes the assignment.
            Error::FinalizationFailed { .. } => true,
            Error::TopologyUnavailable { .. }
            | Error::NoOwnerFound { .. }
            | Error::InvalidMigration { .. }
            | Error::Slot(_)
            | Error::Probe(_)
            | Error::Config(_)
            | Error::Serialization(_) => false,
        }
    }

    /// The slot this error concerns, if any
    pub fn slot(&self) -> Option<u16> {
        match self {
            Error::NoOwnerFound { slot }
            | Error::SetSlotFailed { slot, .. }
            | Error::TransferTimeout { slot, .. }
            | Error::TransferFailed { slot, .. }
            | Error::FinalizationFailed { slot, .. }
            | Error::InvalidMigration { slot, .. } => Some(*slot),
            _ => None,
        }
    }
}

/// Result type alias for resharding operations
pub type Result<T> = std::result::Result<T, Error>;

/// Misuse of the prober state machine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("probe is already running")]
    AlreadyRunning,

    #[error("probe has already finished")]
    AlreadyFinished,

    #[error("probe is not running")]
    NotRunning,

    #[error("cannot {operation} while probe is {status}")]
    InvalidState {
        operation: &'static str,
        status: ProbeStatus,
    },

    /// The scheduler task ended without producing a report
    #[error("probe scheduler aborted")]
    Aborted,
}

/// Invalid or missing configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required variable {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}
