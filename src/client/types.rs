//! Types for parsed Valkey cluster information.
//!
//! These types represent node addresses, redirect replies, and the parsed
//! output of `CLUSTER NODES`.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::slots::{SlotError, SlotRange};

/// Errors that can occur when parsing cluster data.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Invalid cluster nodes format: {0}")]
    InvalidClusterNodes(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Invalid slot data: {0}")]
    InvalidSlot(#[from] SlotError),
    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Host and client port of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseError::InvalidAddress(s.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| ParseError::InvalidAddress(s.to_string()))?;
        Ok(NodeAddress::new(host, port))
    }
}

impl From<(String, u16)> for NodeAddress {
    fn from((host, port): (String, u16)) -> Self {
        NodeAddress { host, port }
    }
}

impl From<(&str, u16)> for NodeAddress {
    fn from((host, port): (&str, u16)) -> Self {
        NodeAddress::new(host, port)
    }
}

/// Kind of redirect returned for a key the node does not serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RedirectKind {
    /// The slot is permanently served elsewhere.
    Moved,
    /// Retry once at the target, preceded by `ASKING`.
    Ask,
}

impl std::fmt::Display for RedirectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RedirectKind::Moved => write!(f, "MOVED"),
            RedirectKind::Ask => write!(f, "ASK"),
        }
    }
}

/// A `MOVED` or `ASK` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Redirect {
    pub kind: RedirectKind,
    pub slot: u16,
    pub address: NodeAddress,
}

impl Redirect {
    /// Parse the text of an error reply. Returns `None` for non-redirect errors.
    pub fn parse(message: &str) -> Option<Self> {
        crate::client::parsing::parse_redirect(message)
    }

    /// Fill an empty host with `host`, the address of the node that replied.
    pub fn or_host(mut self, host: &str) -> Self {
        if self.address.host.is_empty() {
            self.address.host = host.to_string();
        }
        self
    }
}

impl std::fmt::Display for Redirect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.kind, self.slot, self.address)
    }
}

/// Role of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Node is a master serving hash slots.
    Master,
    /// Node is a replica of a master.
    Replica,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Master => write!(f, "master"),
            NodeRole::Replica => write!(f, "slave"),
        }
    }
}

/// Flags of a node as printed by `CLUSTER NODES`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeFlags {
    pub myself: bool,
    pub master: bool,
    pub slave: bool,
    pub pfail: bool,
    pub fail: bool,
    pub handshake: bool,
    pub noaddr: bool,
    pub noflags: bool,
}

impl NodeFlags {
    /// Parse the comma separated flags field.
    pub fn parse(flags_str: &str) -> Self {
        let mut flags = NodeFlags::default();
        for flag in flags_str.split(',') {
            match flag.trim() {
                "myself" => flags.myself = true,
                "master" => flags.master = true,
                "slave" | "replica" => flags.slave = true,
                "fail?" | "pfail" => flags.pfail = true,
                "fail" => flags.fail = true,
                "handshake" => flags.handshake = true,
                "noaddr" => flags.noaddr = true,
                "noflags" => flags.noflags = true,
                _ => {}
            }
        }
        flags
    }

    pub fn role(&self) -> NodeRole {
        if self.master {
            NodeRole::Master
        } else {
            NodeRole::Replica
        }
    }

    /// Not failing, not handshaking, and reachable.
    pub fn is_healthy(&self) -> bool {
        !self.fail && !self.pfail && !self.handshake && !self.noaddr
    }
}

/// An in-progress migration marker from the slot list of `CLUSTER NODES`.
///
/// Only the node printing the table (`myself`) shows these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotMarker {
    /// `[slot->-node]`: this node is migrating `slot` to `node`.
    Migrating { slot: u16, node_id: String },
    /// `[slot-<-node]`: this node is importing `slot` from `node`.
    Importing { slot: u16, node_id: String },
}

impl SlotMarker {
    pub fn parse(s: &str) -> Option<Self> {
        let inner = s.trim().strip_prefix('[')?.strip_suffix(']')?;
        if let Some((slot, node)) = inner.split_once("->-") {
            return Some(SlotMarker::Migrating {
                slot: slot.parse().ok()?,
                node_id: node.to_string(),
            });
        }
        if let Some((slot, node)) = inner.split_once("-<-") {
            return Some(SlotMarker::Importing {
                slot: slot.parse().ok()?,
                node_id: node.to_string(),
            });
        }
        None
    }

    pub fn slot(&self) -> u16 {
        match self {
            SlotMarker::Migrating { slot, .. } | SlotMarker::Importing { slot, .. } => *slot,
        }
    }
}

impl std::fmt::Display for SlotMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotMarker::Migrating { slot, node_id } => write!(f, "[{}->-{}]", slot, node_id),
            SlotMarker::Importing { slot, node_id } => write!(f, "[{}-<-{}]", slot, node_id),
        }
    }
}

/// A cluster node as reported by `CLUSTER NODES`.
#[derive(Debug, Clone)]
pub struct ClusterNode {
    /// Unique node ID (40 hex characters).
    pub node_id: String,
    /// Client address.
    pub address: NodeAddress,
    /// Cluster bus port.
    pub cluster_bus_port: u16,
    /// Announced hostname, if any.
    pub hostname: Option<String>,
    pub flags: NodeFlags,
    /// Master node ID if this is a replica.
    pub master_id: Option<String>,
    pub config_epoch: u64,
    /// Link state ("connected" or "disconnected").
    pub link_state: String,
    /// Slot ranges owned by this node (masters only).
    pub slots: Vec<SlotRange>,
    /// Migration markers, present only on the `myself` line.
    pub markers: Vec<SlotMarker>,
}

impl ClusterNode {
    pub fn role(&self) -> NodeRole {
        self.flags.role()
    }

    pub fn is_master(&self) -> bool {
        self.flags.master
    }

    pub fn is_replica(&self) -> bool {
        self.flags.slave
    }

    pub fn is_myself(&self) -> bool {
        self.flags.myself
    }

    pub fn is_connected(&self) -> bool {
        self.link_state == "connected"
    }

    pub fn is_healthy(&self) -> bool {
        self.flags.is_healthy() && self.is_connected()
    }

    /// Total number of slots listed for this node.
    pub fn slot_count(&self) -> u32 {
        self.slots.iter().map(|r| u32::from(r.count())).sum()
    }

    /// Whether the slot table lists `slot` for this node.
    pub fn lists_slot(&self, slot: u16) -> bool {
        self.slots.iter().any(|r| r.contains(slot))
    }

    /// Parse a single line from `CLUSTER NODES` output.
    ///
    /// Format: `<id> <ip:port@cport[,hostname]> <flags> <master> <ping-sent>
    /// <pong-recv> <config-epoch> <link-state> <slot> <slot> ...`
    pub fn parse_line(line: &str) -> Result<Self, ParseError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let field = |idx: usize, name: &str| -> Result<&str, ParseError> {
            parts.get(idx).copied().ok_or_else(|| {
                ParseError::InvalidClusterNodes(format!("missing {} in line: {}", name, line))
            })
        };

        let node_id = field(0, "node id")?.to_string();
        let raw_address = field(1, "address")?;
        let flags = NodeFlags::parse(field(2, "flags")?);
        let master = field(3, "master")?;
        let config_epoch = field(6, "config epoch")?.parse().unwrap_or(0);
        let link_state = field(7, "link state")?.to_string();

        let (ip_port, bus_part) = match raw_address.split_once('@') {
            Some((ip_port, bus)) => (ip_port, Some(bus)),
            None => (raw_address, None),
        };
        let address: NodeAddress = ip_port.parse()?;
        let mut hostname = None;
        let cluster_bus_port = match bus_part {
            Some(bus) => {
                let mut pieces = bus.split(',');
                let port = pieces.next().and_then(|p| p.parse().ok());
                hostname = pieces.next().filter(|h| !h.is_empty()).map(str::to_string);
                port.unwrap_or(address.port.saturating_add(10000))
            }
            None => address.port.saturating_add(10000),
        };

        let master_id = (master != "-").then(|| master.to_string());

        let mut slots = Vec::new();
        let mut markers = Vec::new();
        for token in parts.iter().skip(8) {
            if token.starts_with('[') {
                if let Some(marker) = SlotMarker::parse(token) {
                    markers.push(marker);
                }
            } else {
                slots.push(SlotRange::parse(token)?);
            }
        }

        Ok(ClusterNode {
            node_id,
            address,
            cluster_bus_port,
            hostname,
            flags,
            master_id,
            config_epoch,
            link_state,
            slots,
            markers,
        })
    }
}

/// Parsed output of `CLUSTER NODES`.
#[derive(Debug, Clone, Default)]
pub struct ParsedClusterNodes {
    pub nodes: Vec<ClusterNode>,
}

impl ParsedClusterNodes {
    pub fn parse(output: &str) -> Result<Self, ParseError> {
        let nodes = output
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(ClusterNode::parse_line)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ParsedClusterNodes { nodes })
    }

    pub fn masters(&self) -> Vec<&ClusterNode> {
        self.nodes.iter().filter(|n| n.is_master()).collect()
    }

    pub fn replicas(&self) -> Vec<&ClusterNode> {
        self.nodes.iter().filter(|n| n.is_replica()).collect()
    }

    /// The node that printed the table.
    pub fn myself(&self) -> Option<&ClusterNode> {
        self.nodes.iter().find(|n| n.is_myself())
    }

    pub fn get_node(&self, node_id: &str) -> Option<&ClusterNode> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    pub fn node_at(&self, address: &NodeAddress) -> Option<&ClusterNode> {
        self.nodes.iter().find(|n| &n.address == address)
    }

    /// Owner of `slot` according to the slot table.
    pub fn listed_owner(&self, slot: u16) -> Option<&ClusterNode> {
        self.masters().into_iter().find(|n| n.lists_slot(slot))
    }

    /// Slots the printing node has in migrating or importing state.
    pub fn open_slots(&self) -> Vec<&SlotMarker> {
        self.nodes.iter().flat_map(|n| n.markers.iter()).collect()
    }

    pub fn total_slots_assigned(&self) -> u32 {
        self.masters().iter().map(|m| m.slot_count()).sum()
    }
}
