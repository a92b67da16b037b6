//! Handle to one master node.

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::client::{
    ClusterNode, MemoryInfo, NodeAddress, NodeCommands, NodeRole, ParsedClusterNodes, ValkeyError,
};
use crate::error::Result;
use crate::slots::{SlotRange, check_slot, ownership_probe_key};

/// Parallel `MEMORY USAGE` calls in [`MasterNode::all_keys_with_memory_usage`].
const MEMORY_SCAN_CONCURRENCY: usize = 16;

/// A node as listed by `CLUSTER NODES`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: String,
    pub address: NodeAddress,
    pub role: NodeRole,
    /// Not flagged `fail`, `fail?`, `handshake` or `noaddr`, and linked.
    pub healthy: bool,
    /// Slots listed for the node. Informational; ownership is probed.
    pub slots: Vec<SlotRange>,
}

impl From<&ClusterNode> for NodeInfo {
    fn from(node: &ClusterNode) -> Self {
        NodeInfo {
            node_id: node.node_id.clone(),
            address: node.address.clone(),
            role: node.role(),
            healthy: node.is_healthy(),
            slots: node.slots.clone(),
        }
    }
}

/// Memory used by one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyMemory {
    pub key: String,
    /// `None` when the key vanished between listing and measuring.
    pub bytes: Option<u64>,
}

/// Commands against one master, with slot-aware helpers on top.
#[derive(Debug, Clone)]
pub struct MasterNode<N> {
    node: N,
}

impl<N: NodeCommands> MasterNode<N> {
    pub fn new(node: N) -> Self {
        Self { node }
    }

    pub fn address(&self) -> &NodeAddress {
        self.node.address()
    }

    /// The underlying command handle.
    pub fn commands(&self) -> &N {
        &self.node
    }

    /// `CLUSTER MYID`
    pub async fn node_id(&self) -> Result<String> {
        Ok(self.node.cluster_myid().await?)
    }

    /// Ask the node whether it serves `slot`.
    ///
    /// Reads a synthetic key hashed into the slot. Any reply means the node
    /// serves it; a MOVED or ASK redirect means it does not.
    #[instrument(skip(self), fields(node = %self.address()))]
    pub async fn is_slot_owner(&self, slot: u16) -> Result<bool> {
        let key = ownership_probe_key(check_slot(slot)?).unwrap_or_default();
        match self.node.get(&key).await {
            Ok(_) => Ok(true),
            Err(ValkeyError::Redirect(redirect)) => {
                let redirect = redirect.or_host(&self.address().host);
                debug!(%redirect, "Not the slot owner");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All keys the node holds in `slot`.
    pub async fn keys_in_slot(&self, slot: u16) -> Result<Vec<String>> {
        let slot = check_slot(slot)?;
        let count = self.node.cluster_count_keys_in_slot(slot).await?;
        if count == 0 {
            return Ok(Vec::new());
        }
        Ok(self.node.cluster_get_keys_in_slot(slot, count).await?)
    }

    /// Every key on the node.
    pub async fn all_keys(&self) -> Result<Vec<String>> {
        Ok(self.node.keys().await?)
    }

    pub async fn memory_usage(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.node.memory_usage(key).await?)
    }

    /// Parsed `INFO memory`.
    pub async fn memory_info(&self) -> Result<MemoryInfo> {
        let raw = self.node.info_raw("memory").await?;
        MemoryInfo::parse(&raw).map_err(|e| ValkeyError::from(e).into())
    }

    /// Every key on the node with its `MEMORY USAGE`, sorted by key.
    pub async fn all_keys_with_memory_usage(&self) -> Result<Vec<KeyMemory>> {
        let keys = self.all_keys().await?;
        let node = &self.node;
        let mut usage: Vec<KeyMemory> = stream::iter(keys)
            .map(|key| async move {
                let bytes = node.memory_usage(&key).await?;
                Ok::<_, ValkeyError>(KeyMemory { key, bytes })
            })
            .buffer_unordered(MEMORY_SCAN_CONCURRENCY)
            .try_collect()
            .await?;
        usage.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(usage)
    }

    /// `FLUSHALL`
    pub async fn flush_all(&self) -> Result<()> {
        Ok(self.node.flush_all().await?)
    }

    /// Topology as seen by this node.
    pub async fn cluster_nodes(&self) -> Result<ParsedClusterNodes> {
        let raw = self.node.cluster_nodes_raw().await?;
        Ok(ParsedClusterNodes::parse(&raw).map_err(ValkeyError::from)?)
    }
}
