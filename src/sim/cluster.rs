//! Shared state of a simulated cluster.
//!
//! All nodes live behind one mutex, so every command is atomic with respect to
//! every other command, which is the guarantee a single-threaded server gives
//! for its own keyspace. Slot assignment is global: a `SETSLOT NODE` accepted
//! by any node is seen by all of them at once.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use super::client::SimClusterClient;
use super::node::SimNode;
use crate::client::{NodeAddress, NodeConnector, Redirect, RedirectKind, SetSlotState, ValkeyError};
use crate::slots::{TOTAL_SLOTS, calculate_distribution, compress_slots, key_slot};

/// First client port; node `i` listens on `BASE_PORT + i`.
pub const BASE_PORT: u16 = 50001;
const BUS_PORT_OFFSET: u16 = 10000;
const BASE_USED_MEMORY: u64 = 1_048_576;
const KEY_OVERHEAD_BYTES: u64 = 56;

/// What happens to a write hit by an injected fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFault {
    /// The write fails with an error reply.
    Reject,
    /// The write is acknowledged but never stored.
    Drop,
}

/// How an injected `MIGRATE` failure shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrateFault {
    /// The destination does not answer within the timeout.
    Timeout,
    /// An error reply with this text.
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Value {
    Str(String),
    Hash(BTreeMap<String, String>),
    ZSet(BTreeMap<String, f64>),
}

impl Value {
    fn size(&self) -> u64 {
        let bytes = match self {
            Value::Str(s) => s.len(),
            Value::Hash(fields) => fields.iter().map(|(f, v)| f.len() + v.len()).sum(),
            Value::ZSet(members) => members.keys().map(|m| m.len() + 8).sum(),
        };
        bytes as u64
    }
}

/// A data command routed by key.
#[derive(Debug, Clone)]
pub(crate) enum Command {
    Get(String),
    Set(String, String),
    HGet(String, String),
    HSet(String, String, String),
    ZAdd(String, f64, String),
    ZScore(String, String),
}

impl Command {
    pub(crate) fn key(&self) -> &str {
        match self {
            Command::Get(k)
            | Command::Set(k, _)
            | Command::HGet(k, _)
            | Command::HSet(k, _, _)
            | Command::ZAdd(k, _, _)
            | Command::ZScore(k, _) => k,
        }
    }

    fn is_write(&self) -> bool {
        matches!(
            self,
            Command::Set(..) | Command::HSet(..) | Command::ZAdd(..)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Reply {
    Ok,
    Nil,
    Text(String),
    Score(f64),
}

#[derive(Debug)]
pub(crate) struct NodeState {
    pub(crate) id: String,
    pub(crate) address: NodeAddress,
    reachable: bool,
    data: HashMap<String, Value>,
    /// slot -> destination node id
    migrating: BTreeMap<u16, String>,
    /// slot -> source node id
    importing: BTreeMap<u16, String>,
}

impl NodeState {
    fn keys_in_slot(&self, slot: u16) -> Vec<String> {
        let mut keys: Vec<String> = self
            .data
            .keys()
            .filter(|k| key_slot(k) == slot)
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[derive(Debug, Default)]
struct Faults {
    writes: HashMap<String, WriteFault>,
    reads: HashMap<String, u32>,
    migrate: HashMap<NodeAddress, MigrateFault>,
    /// (node, SETSLOT subcommand) -> error text
    setslot: HashMap<(NodeAddress, String), String>,
}

/// Node handles opened through [`NodeConnector`] and closed again.
#[derive(Debug, Default)]
pub(crate) struct Connections {
    pub(crate) opened: usize,
    pub(crate) closed: usize,
}

#[derive(Debug)]
pub(crate) struct State {
    nodes: Vec<NodeState>,
    /// Owning node index per slot.
    owners: Vec<Option<usize>>,
    faults: Faults,
    pub(crate) connections: Connections,
}

fn wrong_type() -> ValkeyError {
    ValkeyError::Server(
        "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
    )
}

fn unreachable(address: &NodeAddress) -> ValkeyError {
    ValkeyError::Connection(format!("connection refused: {}", address))
}

impl State {
    fn index_of(&self, address: &NodeAddress) -> Option<usize> {
        self.nodes.iter().position(|n| n.address == *address)
    }

    fn index_of_id(&self, id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    fn peer(&self, id: &str) -> Result<usize, ValkeyError> {
        self.index_of_id(id)
            .ok_or_else(|| ValkeyError::Server(format!("ERR I don't know about node {}", id)))
    }

    pub(crate) fn node(&self, index: usize) -> Result<&NodeState, ValkeyError> {
        self.nodes
            .get(index)
            .ok_or_else(|| ValkeyError::Connection(format!("no node #{}", index)))
    }

    fn node_mut(&mut self, index: usize) -> Result<&mut NodeState, ValkeyError> {
        self.nodes
            .get_mut(index)
            .ok_or_else(|| ValkeyError::Connection(format!("no node #{}", index)))
    }

    /// Index of the node at `address`, if it exists and answers.
    pub(crate) fn reachable(&self, address: &NodeAddress) -> Result<usize, ValkeyError> {
        match self.index_of(address) {
            Some(index) if self.node(index)?.reachable => Ok(index),
            _ => Err(unreachable(address)),
        }
    }

    fn owner(&self, slot: u16) -> Option<usize> {
        self.owners.get(usize::from(slot)).copied().flatten()
    }

    fn redirect(&self, kind: RedirectKind, slot: u16, to: usize) -> Result<ValkeyError, ValkeyError> {
        Ok(ValkeyError::Redirect(Redirect {
            kind,
            slot,
            address: self.node(to)?.address.clone(),
        }))
    }

    /// Run a data command on the node at `index`, as a server would.
    pub(crate) fn execute(
        &mut self,
        index: usize,
        command: &Command,
        asking: bool,
    ) -> Result<Reply, ValkeyError> {
        let node = self.node(index)?;
        if !node.reachable {
            return Err(unreachable(&node.address));
        }

        let key = command.key();
        let slot = key_slot(key);
        let Some(owner) = self.owner(slot) else {
            return Err(ValkeyError::Server(format!(
                "CLUSTERDOWN Hash slot {} not served",
                slot
            )));
        };

        if owner == index {
            if let Some(dest_id) = node.migrating.get(&slot)
                && !node.data.contains_key(key)
            {
                let dest = self
                    .index_of_id(dest_id)
                    .ok_or_else(|| ValkeyError::Server(format!("ERR unknown node {}", dest_id)))?;
                return Err(self.redirect(RedirectKind::Ask, slot, dest)?);
            }
        } else if !(asking && node.importing.contains_key(&slot)) {
            return Err(self.redirect(RedirectKind::Moved, slot, owner)?);
        }

        if command.is_write() {
            if let Some(fault) = self.faults.writes.remove(key) {
                debug!(key, ?fault, "Injected write fault");
                match fault {
                    WriteFault::Reject => {
                        return Err(ValkeyError::Server(
                            "ERR injected write failure".to_string(),
                        ));
                    }
                    WriteFault::Drop => return Ok(Reply::Ok),
                }
            }
        } else if let Some(remaining) = self.faults.reads.get_mut(key)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(ValkeyError::Server(
                "TRYAGAIN injected read failure".to_string(),
            ));
        }

        let data = &mut self.node_mut(index)?.data;
        match command {
            Command::Get(key) => match data.get(key) {
                None => Ok(Reply::Nil),
                Some(Value::Str(s)) => Ok(Reply::Text(s.clone())),
                Some(_) => Err(wrong_type()),
            },
            Command::Set(key, value) => {
                data.insert(key.clone(), Value::Str(value.clone()));
                Ok(Reply::Ok)
            }
            Command::HGet(key, field) => match data.get(key) {
                None => Ok(Reply::Nil),
                Some(Value::Hash(fields)) => Ok(fields
                    .get(field)
                    .map_or(Reply::Nil, |v| Reply::Text(v.clone()))),
                Some(_) => Err(wrong_type()),
            },
            Command::HSet(key, field, value) => {
                match data
                    .entry(key.clone())
                    .or_insert_with(|| Value::Hash(BTreeMap::new()))
                {
                    Value::Hash(fields) => {
                        fields.insert(field.clone(), value.clone());
                        Ok(Reply::Ok)
                    }
                    _ => Err(wrong_type()),
                }
            }
            Command::ZAdd(key, score, member) => {
                match data
                    .entry(key.clone())
                    .or_insert_with(|| Value::ZSet(BTreeMap::new()))
                {
                    Value::ZSet(members) => {
                        members.insert(member.clone(), *score);
                        Ok(Reply::Ok)
                    }
                    _ => Err(wrong_type()),
                }
            }
            Command::ZScore(key, member) => match data.get(key) {
                None => Ok(Reply::Nil),
                Some(Value::ZSet(members)) => {
                    Ok(members.get(member).map_or(Reply::Nil, |s| Reply::Score(*s)))
                }
                Some(_) => Err(wrong_type()),
            },
        }
    }

    pub(crate) fn setslot(
        &mut self,
        index: usize,
        slot: u16,
        state: &SetSlotState,
    ) -> Result<(), ValkeyError> {
        let address = self.node(index)?.address.clone();
        let subcommand = state.args().into_iter().next().unwrap_or_default();
        if let Some(message) = self.faults.setslot.remove(&(address, subcommand)) {
            return Err(ValkeyError::Server(message));
        }
        if usize::from(slot) >= self.owners.len() {
            return Err(ValkeyError::Server("ERR Invalid or out of range slot".to_string()));
        }
        let owner = self.owner(slot);

        match state {
            SetSlotState::Importing(source_id) => {
                self.peer(source_id)?;
                if owner == Some(index) {
                    return Err(ValkeyError::Server(format!(
                        "ERR I'm already the owner of hash slot {}",
                        slot
                    )));
                }
                self.node_mut(index)?
                    .importing
                    .insert(slot, source_id.clone());
            }
            SetSlotState::Migrating(dest_id) => {
                self.peer(dest_id)?;
                if owner != Some(index) {
                    return Err(ValkeyError::Server(format!(
                        "ERR I'm not the owner of hash slot {}",
                        slot
                    )));
                }
                self.node_mut(index)?.migrating.insert(slot, dest_id.clone());
            }
            SetSlotState::Node(owner_id) => {
                let new_owner = self.peer(owner_id)?;
                let node = self.node(index)?;
                if owner == Some(index)
                    && new_owner != index
                    && !node.keys_in_slot(slot).is_empty()
                {
                    return Err(ValkeyError::Server(format!(
                        "ERR Can't assign hashslot {} to a different node while I still hold keys for this hash slot.",
                        slot
                    )));
                }
                if let Some(entry) = self.owners.get_mut(usize::from(slot)) {
                    *entry = Some(new_owner);
                }
                let node = self.node_mut(index)?;
                node.migrating.remove(&slot);
                if new_owner == index {
                    node.importing.remove(&slot);
                }
                if let Some(previous) = owner
                    && previous != new_owner
                {
                    self.node_mut(previous)?.migrating.remove(&slot);
                }
            }
            SetSlotState::Stable => {
                let node = self.node_mut(index)?;
                node.migrating.remove(&slot);
                node.importing.remove(&slot);
            }
        }
        Ok(())
    }

    pub(crate) fn migrate(
        &mut self,
        index: usize,
        destination: &NodeAddress,
        keys: &[String],
        timeout: Duration,
    ) -> Result<(), ValkeyError> {
        let source = self.node(index)?.address.clone();
        // MIGRATE is routed like a keyed command, except that an open slot
        // on this node lets it run.
        for key in keys {
            let slot = key_slot(key);
            let node = self.node(index)?;
            if node.migrating.contains_key(&slot) || node.importing.contains_key(&slot) {
                continue;
            }
            match self.owner(slot) {
                Some(owner) if owner == index => {}
                Some(owner) => return Err(self.redirect(RedirectKind::Moved, slot, owner)?),
                None => {
                    return Err(ValkeyError::Server(
                        "CLUSTERDOWN Hash slot not served".to_string(),
                    ));
                }
            }
        }
        if let Some(fault) = self.faults.migrate.remove(&source) {
            return Err(match fault {
                MigrateFault::Timeout => ValkeyError::Timeout {
                    operation: format!("MIGRATE to {}", destination),
                    duration: timeout,
                },
                MigrateFault::Error(message) => ValkeyError::Server(message),
            });
        }
        let dest = self.reachable(destination).map_err(|_| {
            ValkeyError::Server(format!(
                "IOERR error or timeout connecting to the client {}",
                destination
            ))
        })?;

        let present: Vec<&String> = {
            let node = self.node(index)?;
            keys.iter().filter(|k| node.data.contains_key(*k)).collect()
        };
        if let Some(busy) = present
            .iter()
            .find(|k| self.node(dest).is_ok_and(|n| n.data.contains_key(**k)))
        {
            return Err(ValkeyError::Server(format!(
                "BUSYKEY Target key name already exists: {}",
                busy
            )));
        }

        let mut moved = Vec::with_capacity(present.len());
        for key in present {
            if let Some(value) = self.node_mut(index)?.data.remove(key) {
                moved.push((key.clone(), value));
            }
        }
        let count = moved.len();
        self.node_mut(dest)?.data.extend(moved);
        debug!(%source, %destination, count, "Migrated keys");
        Ok(())
    }

    pub(crate) fn count_keys_in_slot(&self, index: usize, slot: u16) -> Result<u64, ValkeyError> {
        Ok(self.node(index)?.keys_in_slot(slot).len() as u64)
    }

    pub(crate) fn keys_in_slot(
        &self,
        index: usize,
        slot: u16,
        count: u64,
    ) -> Result<Vec<String>, ValkeyError> {
        let limit = usize::try_from(count).unwrap_or(usize::MAX);
        Ok(self
            .node(index)?
            .keys_in_slot(slot)
            .into_iter()
            .take(limit)
            .collect())
    }

    pub(crate) fn keys(&self, index: usize) -> Result<Vec<String>, ValkeyError> {
        let mut keys: Vec<String> = self.node(index)?.data.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    pub(crate) fn memory_usage(&self, index: usize, key: &str) -> Result<Option<u64>, ValkeyError> {
        Ok(self
            .node(index)?
            .data
            .get(key)
            .map(|v| key.len() as u64 + v.size() + KEY_OVERHEAD_BYTES))
    }

    pub(crate) fn info_memory(&self, index: usize) -> Result<String, ValkeyError> {
        let node = self.node(index)?;
        let dataset: u64 = node
            .data
            .iter()
            .map(|(k, v)| k.len() as u64 + v.size() + KEY_OVERHEAD_BYTES)
            .sum();
        let used = BASE_USED_MEMORY + dataset;
        Ok(format!(
            "# Memory\r\nused_memory:{used}\r\nused_memory_human:{:.2}M\r\nused_memory_rss:{used}\r\nused_memory_peak:{used}\r\nused_memory_dataset:{dataset}\r\nmaxmemory:0\r\nmem_fragmentation_ratio:1.00\r\n",
            used as f64 / 1_048_576.0
        ))
    }

    pub(crate) fn flush_all(&mut self, index: usize) -> Result<(), ValkeyError> {
        self.node_mut(index)?.data.clear();
        Ok(())
    }

    /// `CLUSTER NODES` as printed by the node at `index`.
    pub(crate) fn cluster_nodes(&self, index: usize) -> Result<String, ValkeyError> {
        let mut out = String::new();
        for (i, node) in self.nodes.iter().enumerate() {
            let mut flags = Vec::new();
            if i == index {
                flags.push("myself");
            }
            flags.push("master");
            if !node.reachable {
                flags.push("fail");
            }
            let link = if node.reachable { "connected" } else { "disconnected" };
            let owned = compress_slots(
                self.owners
                    .iter()
                    .enumerate()
                    .filter(|(_, owner)| **owner == Some(i))
                    .filter_map(|(slot, _)| u16::try_from(slot).ok()),
            );

            let mut line = format!(
                "{} {}@{} {} - 0 0 {} {}",
                node.id,
                node.address,
                node.address.port.saturating_add(BUS_PORT_OFFSET),
                flags.join(","),
                i + 1,
                link
            );
            for range in owned {
                line.push(' ');
                line.push_str(&range.to_string());
            }
            if i == index {
                for (slot, dest) in &node.migrating {
                    line.push_str(&format!(" [{}->-{}]", slot, dest));
                }
                for (slot, source) in &node.importing {
                    line.push_str(&format!(" [{}-<-{}]", slot, source));
                }
            }
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out)
    }
}

/// An in-process cluster of masters that answers like a real one: slot
/// ownership, `MOVED`/`ASK` redirects, migration flags and `MIGRATE`.
///
/// Cheap to clone; clones share the same cluster.
#[derive(Debug, Clone)]
pub struct SimCluster {
    state: Arc<Mutex<State>>,
    latency: Duration,
}

impl SimCluster {
    /// `master_count` masters on `127.0.0.1:50001` and up, with the slots
    /// split evenly between them.
    pub fn new(master_count: u16) -> Self {
        let master_count = master_count.max(1);
        let nodes: Vec<NodeState> = (0..master_count)
            .map(|i| NodeState {
                id: format!("51a1c0de{:032x}", u128::from(i) + 1),
                address: NodeAddress::new("127.0.0.1", BASE_PORT.saturating_add(i)),
                reachable: true,
                data: HashMap::new(),
                migrating: BTreeMap::new(),
                importing: BTreeMap::new(),
            })
            .collect();

        let mut owners = vec![None; usize::from(TOTAL_SLOTS)];
        for (index, range) in calculate_distribution(master_count).into_iter().enumerate() {
            for slot in range.iter() {
                if let Some(entry) = owners.get_mut(usize::from(slot)) {
                    *entry = Some(index);
                }
            }
        }

        Self {
            state: Arc::new(Mutex::new(State {
                nodes,
                owners,
                faults: Faults::default(),
                connections: Connections::default(),
            })),
            latency: Duration::ZERO,
        }
    }

    /// Delay every command by `latency` before it runs.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    /// A cluster-aware client that follows redirects, seeded at the first node.
    pub fn client(&self) -> SimClusterClient {
        SimClusterClient::new(self.clone())
    }

    /// Node addresses in port order.
    pub fn addresses(&self) -> Vec<NodeAddress> {
        self.lock().nodes.iter().map(|n| n.address.clone()).collect()
    }

    pub fn node_id(&self, address: &NodeAddress) -> Option<String> {
        let state = self.lock();
        state
            .index_of(address)
            .and_then(|i| state.node(i).ok().map(|n| n.id.clone()))
    }

    /// Address of the node that currently owns `slot`.
    pub fn owner_of(&self, slot: u16) -> Option<NodeAddress> {
        let state = self.lock();
        state
            .owner(slot)
            .and_then(|i| state.node(i).ok().map(|n| n.address.clone()))
    }

    /// Number of slots each node owns, in port order.
    pub fn slot_counts(&self) -> Vec<usize> {
        let state = self.lock();
        (0..state.nodes.len())
            .map(|i| state.owners.iter().filter(|o| **o == Some(i)).count())
            .collect()
    }

    /// Keys stored on `address` that hash to `slot`.
    pub fn keys_on(&self, address: &NodeAddress, slot: u16) -> Vec<String> {
        let state = self.lock();
        state
            .index_of(address)
            .and_then(|i| state.node(i).ok().map(|n| n.keys_in_slot(slot)))
            .unwrap_or_default()
    }

    /// Whether any node still has a migrating or importing flag set.
    pub fn has_open_slots(&self) -> bool {
        self.lock()
            .nodes
            .iter()
            .any(|n| !n.migrating.is_empty() || !n.importing.is_empty())
    }

    /// Node handles opened so far.
    pub fn connections_opened(&self) -> usize {
        self.lock().connections.opened
    }

    /// Node handles opened and not yet closed.
    pub fn open_connections(&self) -> usize {
        let state = self.lock();
        state.connections.opened.saturating_sub(state.connections.closed)
    }

    /// Take a node down or bring it back. Its data is kept.
    pub fn set_reachable(&self, address: &NodeAddress, reachable: bool) {
        let mut state = self.lock();
        if let Some(index) = state.index_of(address)
            && let Ok(node) = state.node_mut(index)
        {
            node.reachable = reachable;
        }
    }

    /// Apply `fault` to the next write of `key`.
    pub fn fail_next_write(&self, key: &str, fault: WriteFault) {
        self.lock().faults.writes.insert(key.to_string(), fault);
    }

    /// Fail the next `count` reads of `key` with a retryable error.
    pub fn fail_reads(&self, key: &str, count: u32) {
        self.lock().faults.reads.insert(key.to_string(), count);
    }

    /// Fail the next `MIGRATE` issued by the node at `source`.
    pub fn fail_next_migrate(&self, source: &NodeAddress, fault: MigrateFault) {
        self.lock().faults.migrate.insert(source.clone(), fault);
    }

    /// Fail the next `CLUSTER SETSLOT <slot> <subcommand>` sent to `address`,
    /// where `subcommand` is `IMPORTING`, `MIGRATING`, `NODE` or `STABLE`.
    pub fn fail_next_setslot(&self, address: &NodeAddress, subcommand: &str, message: &str) {
        self.lock().faults.setslot.insert(
            (address.clone(), subcommand.to_ascii_uppercase()),
            message.to_string(),
        );
    }
}

impl NodeConnector for SimCluster {
    type Node = SimNode;

    async fn connect_node(&self, address: &NodeAddress) -> Result<SimNode, ValkeyError> {
        self.delay().await;
        let index = {
            let mut state = self.lock();
            let index = state.reachable(address)?;
            state.connections.opened += 1;
            index
        };
        Ok(SimNode::new(self.clone(), index, address.clone()))
    }
}
