//! Valkey client module for resharding operations.
//!
//! This module wraps the `fred` client behind small capability traits so the
//! migration and probing logic can run against a live cluster or the
//! in-process simulator.
//!
//! ## Architecture
//!
//! - `commands`: Capability traits ([`DataCommands`], [`NodeCommands`], [`NodeConnector`])
//! - `valkey_client`: fred backed implementation with TLS support
//! - `types`: Parsed types for cluster information (nodes, slots, redirects)
//! - `parsing`: Regex parsing of INFO output and redirect replies
//!
//! ## Example
//!
//! ```rust,ignore
//! use valkey_reshard::client::{NodeCommands, ValkeyClient, ValkeyClientConfig};
//!
//! let config = ValkeyClientConfig::default();
//! let node = ValkeyClient::connect_single(&"127.0.0.1:50001".parse()?, &config).await?;
//! let id = node.cluster_myid().await?;
//! ```

pub mod commands;
pub mod parsing;
pub mod types;
pub mod valkey_client;

pub use commands::{DataCommands, NodeCommands, NodeConnector, SetSlotState};
pub use parsing::MemoryInfo;
pub use types::{
    ClusterNode, NodeAddress, NodeFlags, NodeRole, ParsedClusterNodes, Redirect, RedirectKind,
    SlotMarker,
};
pub use valkey_client::{
    TlsClientConfig, ValkeyClient, ValkeyClientConfig, ValkeyConnector, ValkeyError,
};
