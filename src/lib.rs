//! valkey-reshard library crate
//!
//! Moves hash slots between the masters of a live Valkey cluster and measures
//! what clients observe while it happens.
//!
//! - [`slots`]: slot hashing, ranges and the [`SlotMigrator`]
//! - [`cluster`]: master discovery and slot ownership
//! - [`probe`]: the read-after-write consistency [`Prober`]
//! - [`client`]: the `fred` backed client and the command traits
//! - [`sim`]: an in-process cluster implementing the same traits

pub mod client;
pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod probe;
pub mod sim;
pub mod slots;

pub use client::{NodeAddress, ValkeyClient, ValkeyConnector, ValkeyError};
pub use cluster::{MasterNode, NodeInfo, Topology};
pub use config::AppConfig;
pub use error::{Error, Result};
pub use events::{Event, EventKind, EventLog};
pub use health::{HealthState, Metrics};
pub use probe::{ProbeReport, ProbeStatus, ProbeSummary, ProbeTarget, Prober, ProberConfig};
pub use slots::{MigrationConfig, MigrationOutcome, SlotMigrator, key_slot};
