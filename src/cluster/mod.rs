//! Cluster topology: which masters exist and which one serves a slot.

pub mod node;
pub mod topology;

pub use node::{KeyMemory, MasterNode, NodeInfo};
pub use topology::Topology;
