//! Cluster-aware client for a [`SimCluster`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::trace;

use super::cluster::{Command, Reply, SimCluster};
use super::node::{score, text};
use crate::client::{DataCommands, NodeAddress, RedirectKind, ValkeyError};
use crate::slots::key_slot;

/// Redirects followed for one command before the last one is returned.
const MAX_REDIRECTS: usize = 5;

/// Routes each command to the node serving its key, like a cluster client.
///
/// `MOVED` updates the client's slot map and retries; `ASK` retries once on
/// the named node with `ASKING` and leaves the map alone.
#[derive(Debug, Clone)]
pub struct SimClusterClient {
    cluster: SimCluster,
    slots: Arc<Mutex<HashMap<u16, NodeAddress>>>,
    seed: NodeAddress,
}

impl SimClusterClient {
    pub(crate) fn new(cluster: SimCluster) -> Self {
        let seed = cluster
            .addresses()
            .into_iter()
            .next()
            .unwrap_or_else(|| NodeAddress::new("127.0.0.1", super::cluster::BASE_PORT));
        Self {
            cluster,
            slots: Arc::new(Mutex::new(HashMap::new())),
            seed,
        }
    }

    fn cached(&self, slot: u16) -> NodeAddress {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&slot)
            .cloned()
            .unwrap_or_else(|| self.seed.clone())
    }

    async fn route(&self, command: Command) -> Result<Reply, ValkeyError> {
        let slot = key_slot(command.key());
        let mut target = self.cached(slot);
        let mut asking = false;

        for _ in 0..MAX_REDIRECTS {
            self.cluster.delay().await;
            let result = {
                let mut state = self.cluster.lock();
                state
                    .reachable(&target)
                    .and_then(|index| state.execute(index, &command, asking))
            };
            match result {
                Err(ValkeyError::Redirect(redirect)) => {
                    trace!(%redirect, key = command.key(), "Following redirect");
                    asking = redirect.kind == RedirectKind::Ask;
                    if redirect.kind == RedirectKind::Moved {
                        self.slots
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(redirect.slot, redirect.address.clone());
                    }
                    target = redirect.address;
                }
                other => return other,
            }
        }

        // One more attempt so the caller sees the final redirect.
        let mut state = self.cluster.lock();
        state
            .reachable(&target)
            .and_then(|index| state.execute(index, &command, asking))
    }
}

impl DataCommands for SimClusterClient {
    async fn get(&self, key: &str) -> Result<Option<String>, ValkeyError> {
        text(self.route(Command::Get(key.to_string())).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ValkeyError> {
        self.route(Command::Set(key.to_string(), value.to_string()))
            .await
            .map(|_| ())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, ValkeyError> {
        text(
            self.route(Command::HGet(key.to_string(), field.to_string()))
                .await?,
        )
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), ValkeyError> {
        self.route(Command::HSet(
            key.to_string(),
            field.to_string(),
            value.to_string(),
        ))
        .await
        .map(|_| ())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), ValkeyError> {
        self.route(Command::ZAdd(key.to_string(), score, member.to_string()))
            .await
            .map(|_| ())
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, ValkeyError> {
        score(
            self.route(Command::ZScore(key.to_string(), member.to_string()))
                .await?,
        )
    }
}
