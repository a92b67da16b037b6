//! Command capabilities the resharding core needs from a cluster node.
//!
//! Both the `fred` backed [`ValkeyClient`](super::ValkeyClient) and the
//! in-process simulator implement these traits, so the orchestrator and the
//! prober are generic over where commands go.

use std::future::Future;
use std::time::Duration;

use super::types::NodeAddress;
use super::valkey_client::ValkeyError;

/// Argument of `CLUSTER SETSLOT <slot> ...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetSlotState {
    /// `IMPORTING <source-id>`, sent to the destination.
    Importing(String),
    /// `MIGRATING <destination-id>`, sent to the source.
    Migrating(String),
    /// `NODE <owner-id>`, assigns the slot.
    Node(String),
    /// `STABLE`, clears importing/migrating flags.
    Stable,
}

impl SetSlotState {
    /// Command arguments following `CLUSTER SETSLOT <slot>`.
    pub fn args(&self) -> Vec<String> {
        match self {
            SetSlotState::Importing(id) => vec!["IMPORTING".to_string(), id.clone()],
            SetSlotState::Migrating(id) => vec!["MIGRATING".to_string(), id.clone()],
            SetSlotState::Node(id) => vec!["NODE".to_string(), id.clone()],
            SetSlotState::Stable => vec!["STABLE".to_string()],
        }
    }
}

impl std::fmt::Display for SetSlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.args().join(" "))
    }
}

/// Key, hash and sorted-set commands used by the consistency prober.
pub trait DataCommands: Send + Sync {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, ValkeyError>> + Send;

    fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<(), ValkeyError>> + Send;

    fn hget(
        &self,
        key: &str,
        field: &str,
    ) -> impl Future<Output = Result<Option<String>, ValkeyError>> + Send;

    fn hset(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> impl Future<Output = Result<(), ValkeyError>> + Send;

    fn zadd(
        &self,
        key: &str,
        score: f64,
        member: &str,
    ) -> impl Future<Output = Result<(), ValkeyError>> + Send;

    fn zscore(
        &self,
        key: &str,
        member: &str,
    ) -> impl Future<Output = Result<Option<f64>, ValkeyError>> + Send;
}

/// Commands addressed to one specific node.
///
/// Data commands on a node handle are not redirected: a key the node does not
/// serve yields [`ValkeyError::Redirect`].
pub trait NodeCommands: DataCommands {
    /// Address this handle talks to.
    fn address(&self) -> &NodeAddress;

    fn cluster_myid(&self) -> impl Future<Output = Result<String, ValkeyError>> + Send;

    fn cluster_nodes_raw(&self) -> impl Future<Output = Result<String, ValkeyError>> + Send;

    fn cluster_setslot(
        &self,
        slot: u16,
        state: SetSlotState,
    ) -> impl Future<Output = Result<(), ValkeyError>> + Send;

    fn cluster_count_keys_in_slot(
        &self,
        slot: u16,
    ) -> impl Future<Output = Result<u64, ValkeyError>> + Send;

    fn cluster_get_keys_in_slot(
        &self,
        slot: u16,
        count: u64,
    ) -> impl Future<Output = Result<Vec<String>, ValkeyError>> + Send;

    /// `MIGRATE host port "" 0 <timeout> KEYS k1 k2 ...`
    fn migrate_keys(
        &self,
        destination: &NodeAddress,
        keys: &[String],
        timeout: Duration,
    ) -> impl Future<Output = Result<(), ValkeyError>> + Send;

    /// Every key stored on the node.
    fn keys(&self) -> impl Future<Output = Result<Vec<String>, ValkeyError>> + Send;

    fn memory_usage(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<u64>, ValkeyError>> + Send;

    fn info_raw(&self, section: &str) -> impl Future<Output = Result<String, ValkeyError>> + Send;

    fn flush_all(&self) -> impl Future<Output = Result<(), ValkeyError>> + Send;

    /// Whether the handle can still send commands.
    fn is_connected(&self) -> bool;

    /// Close the connection. Clones of the handle share it.
    fn close(&self) -> impl Future<Output = Result<(), ValkeyError>> + Send;
}

/// Opens handles to individual nodes.
pub trait NodeConnector: Send + Sync {
    type Node: NodeCommands + Clone + 'static;

    fn connect_node(
        &self,
        address: &NodeAddress,
    ) -> impl Future<Output = Result<Self::Node, ValkeyError>> + Send;
}
