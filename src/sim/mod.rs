//! In-process cluster simulator.
//!
//! Implements the same command traits as the `fred` client, so the migrator
//! and the prober run unchanged against it. Supports fault injection for
//! writes, reads, `MIGRATE`, `SETSLOT` and whole nodes.

mod client;
mod cluster;
mod node;

pub use client::SimClusterClient;
pub use cluster::{BASE_PORT, MigrateFault, SimCluster, WriteFault};
pub use node::SimNode;
