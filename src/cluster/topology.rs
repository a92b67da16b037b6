//! Master discovery and slot ownership resolution.
//!
//! The topology itself is never cached: every call reads it again, so results
//! reflect migrations that happened since the last call. Node connections are
//! kept and reused until [`Topology::disconnect`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, instrument, warn};

use super::node::{MasterNode, NodeInfo};
use crate::client::{NodeAddress, NodeCommands, NodeConnector, ParsedClusterNodes, ValkeyError};
use crate::error::{Error, Result};

type NodeCache<N> = Arc<Mutex<HashMap<NodeAddress, N>>>;

/// Resolves masters and slot owners through a seed node.
///
/// Clones share the connector and the open node connections.
pub struct Topology<C: NodeConnector> {
    connector: Arc<C>,
    seed: NodeAddress,
    nodes: NodeCache<C::Node>,
}

impl<C: NodeConnector> Clone for Topology<C> {
    fn clone(&self) -> Self {
        Self {
            connector: Arc::clone(&self.connector),
            seed: self.seed.clone(),
            nodes: Arc::clone(&self.nodes),
        }
    }
}

impl<C: NodeConnector> Topology<C> {
    pub fn new(connector: Arc<C>, seed: NodeAddress) -> Self {
        Self {
            connector,
            seed,
            nodes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn seed(&self) -> &NodeAddress {
        &self.seed
    }

    pub fn connector(&self) -> &Arc<C> {
        &self.connector
    }

    /// A handle to the node at `address`, reusing an open connection.
    pub async fn master_node(&self, address: &NodeAddress) -> Result<MasterNode<C::Node>> {
        Ok(MasterNode::new(self.connection(address).await?))
    }

    async fn connection(&self, address: &NodeAddress) -> std::result::Result<C::Node, ValkeyError> {
        let cached = lock(&self.nodes).get(address).cloned();
        if let Some(node) = cached {
            if node.is_connected() {
                return Ok(node);
            }
            debug!(node = %address, "Reconnecting dropped node connection");
        }
        let node = self.connector.connect_node(address).await?;
        let (node, spare) = {
            let mut nodes = lock(&self.nodes);
            match nodes.get(address) {
                // Another caller connected first.
                Some(existing) if existing.is_connected() => (existing.clone(), Some(node)),
                _ => {
                    nodes.insert(address.clone(), node.clone());
                    (node, None)
                }
            }
        };
        if let Some(spare) = spare
            && let Err(e) = spare.close().await
        {
            debug!(node = %address, error = %e, "Failed to close spare connection");
        }
        Ok(node)
    }

    /// Number of node connections currently held.
    pub fn open_connections(&self) -> usize {
        lock(&self.nodes).len()
    }

    /// Close every held node connection. Later calls connect again.
    pub async fn disconnect(&self) {
        let nodes: Vec<(NodeAddress, C::Node)> = lock(&self.nodes).drain().collect();
        for (address, node) in nodes {
            if let Err(e) = node.close().await {
                warn!(node = %address, error = %e, "Failed to close node connection");
            }
        }
    }

    /// `CLUSTER NODES` from the seed.
    pub async fn cluster_nodes(&self) -> Result<ParsedClusterNodes> {
        let unavailable = |source: ValkeyError| Error::TopologyUnavailable {
            address: self.seed.clone(),
            source,
        };
        let seed = self.connection(&self.seed).await.map_err(unavailable)?;
        let raw = seed.cluster_nodes_raw().await.map_err(unavailable)?;
        ParsedClusterNodes::parse(&raw).map_err(|e| unavailable(e.into()))
    }

    /// Every node flagged `master`, failing ones included.
    #[instrument(skip(self), fields(seed = %self.seed))]
    pub async fn list_master_nodes(&self) -> Result<Vec<NodeInfo>> {
        let parsed = self.cluster_nodes().await?;
        let masters: Vec<NodeInfo> = parsed.masters().into_iter().map(NodeInfo::from).collect();
        debug!(count = masters.len(), "Listed masters");
        Ok(masters)
    }

    /// The master currently serving `slot`, found by asking each one.
    #[instrument(skip(self), fields(seed = %self.seed))]
    pub async fn get_slot_owner(&self, slot: u16) -> Result<NodeInfo> {
        for master in self.list_master_nodes().await? {
            if !master.healthy {
                warn!(node = %master.address, "Skipping unhealthy master");
                continue;
            }
            let node = self.master_node(&master.address).await?;
            if node.is_slot_owner(slot).await? {
                debug!(node = %master.address, "Found slot owner");
                return Ok(master);
            }
        }
        Err(Error::NoOwnerFound { slot })
    }

    /// Every key on every healthy master, sorted.
    #[instrument(skip(self), fields(seed = %self.seed))]
    pub async fn all_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for master in self.list_master_nodes().await? {
            if !master.healthy {
                warn!(node = %master.address, "Skipping unhealthy master");
                continue;
            }
            let node = self.master_node(&master.address).await?;
            keys.extend(node.all_keys().await?);
        }
        keys.sort();
        Ok(keys)
    }

    /// The master at `address`, as listed by the seed.
    pub async fn node_info(&self, address: &NodeAddress) -> Result<Option<NodeInfo>> {
        let parsed = self.cluster_nodes().await?;
        Ok(parsed.node_at(address).map(NodeInfo::from))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
