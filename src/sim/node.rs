//! Direct connection to one simulated node. Redirects are returned, not followed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::cluster::{Command, Reply, SimCluster};
use crate::client::{DataCommands, NodeAddress, NodeCommands, SetSlotState, ValkeyError};

/// A handle bound to one node of a [`SimCluster`].
#[derive(Debug, Clone)]
pub struct SimNode {
    cluster: SimCluster,
    index: usize,
    address: NodeAddress,
    open: Arc<AtomicBool>,
}

impl SimNode {
    pub(crate) fn new(cluster: SimCluster, index: usize, address: NodeAddress) -> Self {
        Self {
            cluster,
            index,
            address,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    fn check_open(&self) -> Result<(), ValkeyError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ValkeyError::Connection(format!(
                "connection to {} is closed",
                self.address
            )))
        }
    }

    async fn run(&self, command: Command) -> Result<Reply, ValkeyError> {
        self.check_open()?;
        self.cluster.delay().await;
        self.cluster.lock().execute(self.index, &command, false)
    }

    /// Run `f` against the shared state once this node is known to answer.
    async fn admin<T>(
        &self,
        f: impl FnOnce(&mut super::cluster::State) -> Result<T, ValkeyError>,
    ) -> Result<T, ValkeyError> {
        self.check_open()?;
        self.cluster.delay().await;
        let mut state = self.cluster.lock();
        state.reachable(&self.address)?;
        f(&mut state)
    }
}

pub(crate) fn text(reply: Reply) -> Result<Option<String>, ValkeyError> {
    match reply {
        Reply::Nil => Ok(None),
        Reply::Text(s) => Ok(Some(s)),
        other => Err(ValkeyError::Server(format!("unexpected reply {:?}", other))),
    }
}

pub(crate) fn score(reply: Reply) -> Result<Option<f64>, ValkeyError> {
    match reply {
        Reply::Nil => Ok(None),
        Reply::Score(s) => Ok(Some(s)),
        other => Err(ValkeyError::Server(format!("unexpected reply {:?}", other))),
    }
}

impl DataCommands for SimNode {
    async fn get(&self, key: &str) -> Result<Option<String>, ValkeyError> {
        text(self.run(Command::Get(key.to_string())).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ValkeyError> {
        self.run(Command::Set(key.to_string(), value.to_string()))
            .await
            .map(|_| ())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, ValkeyError> {
        text(
            self.run(Command::HGet(key.to_string(), field.to_string()))
                .await?,
        )
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), ValkeyError> {
        self.run(Command::HSet(
            key.to_string(),
            field.to_string(),
            value.to_string(),
        ))
        .await
        .map(|_| ())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), ValkeyError> {
        self.run(Command::ZAdd(key.to_string(), score, member.to_string()))
            .await
            .map(|_| ())
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, ValkeyError> {
        score(
            self.run(Command::ZScore(key.to_string(), member.to_string()))
                .await?,
        )
    }
}

impl NodeCommands for SimNode {
    fn address(&self) -> &NodeAddress {
        &self.address
    }

    async fn cluster_myid(&self) -> Result<String, ValkeyError> {
        let index = self.index;
        self.admin(|state| Ok(state.node(index)?.id.clone())).await
    }

    async fn cluster_nodes_raw(&self) -> Result<String, ValkeyError> {
        let index = self.index;
        self.admin(|state| state.cluster_nodes(index)).await
    }

    async fn cluster_setslot(&self, slot: u16, state: SetSlotState) -> Result<(), ValkeyError> {
        let index = self.index;
        self.admin(|s| s.setslot(index, slot, &state)).await
    }

    async fn cluster_count_keys_in_slot(&self, slot: u16) -> Result<u64, ValkeyError> {
        let index = self.index;
        self.admin(|state| state.count_keys_in_slot(index, slot))
            .await
    }

    async fn cluster_get_keys_in_slot(
        &self,
        slot: u16,
        count: u64,
    ) -> Result<Vec<String>, ValkeyError> {
        let index = self.index;
        self.admin(|state| state.keys_in_slot(index, slot, count))
            .await
    }

    async fn migrate_keys(
        &self,
        destination: &NodeAddress,
        keys: &[String],
        timeout: Duration,
    ) -> Result<(), ValkeyError> {
        let index = self.index;
        self.admin(|state| state.migrate(index, destination, keys, timeout))
            .await
    }

    async fn keys(&self) -> Result<Vec<String>, ValkeyError> {
        let index = self.index;
        self.admin(|state| state.keys(index)).await
    }

    async fn memory_usage(&self, key: &str) -> Result<Option<u64>, ValkeyError> {
        let index = self.index;
        self.admin(|state| state.memory_usage(index, key)).await
    }

    async fn info_raw(&self, section: &str) -> Result<String, ValkeyError> {
        let index = self.index;
        self.admin(|state| match section {
            "memory" => state.info_memory(index),
            other => Err(ValkeyError::Server(format!(
                "ERR unsupported INFO section {}",
                other
            ))),
        })
        .await
    }

    async fn flush_all(&self) -> Result<(), ValkeyError> {
        let index = self.index;
        self.admin(|state| state.flush_all(index)).await
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), ValkeyError> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.cluster.lock().connections.closed += 1;
        }
        Ok(())
    }
}
