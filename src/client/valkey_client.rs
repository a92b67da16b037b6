//! Valkey client wrapper using the fred crate.
//!
//! [`ValkeyClient`] talks either to a whole cluster (redirects followed by
//! fred) or to a single node (redirects surfaced as [`ValkeyError::Redirect`]).

use std::path::Path;
use std::time::Duration;

use fred::error::ErrorKind;
use fred::prelude::*;
use fred::types::{FromValue, Value};
use fred::types::config::ClusterDiscoveryPolicy;
use rustls::pki_types::CertificateDer;
use thiserror::Error;
use tracing::{debug, instrument};

use super::commands::{DataCommands, NodeCommands, NodeConnector, SetSlotState};
use super::types::{NodeAddress, Redirect};

/// Errors that can occur during Valkey operations.
#[derive(Error, Debug)]
pub enum ValkeyError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Valkey error: {0}")]
    Fred(fred::error::Error),

    /// The node does not serve the key's slot.
    #[error("Redirected: {0}")]
    Redirect(Redirect),

    /// Error reply text from a server.
    #[error("Server error: {0}")]
    Server(String),

    #[error("Parse error: {0}")]
    Parse(#[from] crate::client::types::ParseError),

    #[error("INFO parse error: {0}")]
    Info(#[from] crate::client::parsing::ParseError),

    #[error("Timeout after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<fred::error::Error> for ValkeyError {
    fn from(err: fred::error::Error) -> Self {
        match Redirect::parse(err.details()) {
            Some(redirect) => ValkeyError::Redirect(redirect),
            None => ValkeyError::Fred(err),
        }
    }
}

impl ValkeyError {
    /// Build an error from server reply text, recognizing redirects.
    pub fn from_reply(message: impl Into<String>) -> Self {
        let message = message.into();
        match Redirect::parse(&message) {
            Some(redirect) => ValkeyError::Redirect(redirect),
            None => ValkeyError::Server(message),
        }
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self, ValkeyError::Redirect(_))
    }

    pub fn redirect(&self) -> Option<&Redirect> {
        match self {
            ValkeyError::Redirect(redirect) => Some(redirect),
            _ => None,
        }
    }

    /// A command or transfer ran out of time.
    ///
    /// `MIGRATE` reports a timeout as `IOERR error or timeout ...`.
    pub fn is_timeout(&self) -> bool {
        match self {
            ValkeyError::Timeout { .. } => true,
            ValkeyError::Fred(e) => {
                *e.kind() == ErrorKind::Timeout || e.details().starts_with("IOERR")
            }
            ValkeyError::Server(msg) => msg.starts_with("IOERR") || msg.contains("timeout"),
            _ => false,
        }
    }

    /// Worth retrying later without changing anything.
    pub fn is_transient(&self) -> bool {
        match self {
            ValkeyError::Connection(_) | ValkeyError::Timeout { .. } => true,
            ValkeyError::Fred(e) => matches!(
                e.kind(),
                ErrorKind::IO | ErrorKind::Timeout | ErrorKind::Canceled
            ),
            ValkeyError::Server(msg) => ["TRYAGAIN", "CLUSTERDOWN", "LOADING", "IOERR"]
                .iter()
                .any(|prefix| msg.starts_with(prefix)),
            _ => false,
        }
    }
}

/// Configuration for connecting to Valkey nodes.
#[derive(Clone, Debug)]
pub struct ValkeyClientConfig {
    /// Seed addresses for the initial connection.
    pub hosts: Vec<NodeAddress>,
    /// TLS configuration.
    pub tls: Option<TlsClientConfig>,
    /// Connection timeout.
    pub connection_timeout: Duration,
    /// Command timeout.
    pub command_timeout: Duration,
    /// Password for authentication.
    pub password: Option<String>,
}

impl Default for ValkeyClientConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            tls: None,
            connection_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            password: None,
        }
    }
}

/// TLS configuration for Valkey connections (PEM file paths).
#[derive(Clone, Debug)]
pub struct TlsClientConfig {
    /// Path to CA certificate file.
    pub ca_cert_path: String,
    /// Path to client certificate file, for mTLS.
    pub cert_path: Option<String>,
    /// Path to client key file, for mTLS.
    pub key_path: Option<String>,
}

impl ValkeyClientConfig {
    /// Create a new configuration with seed hosts.
    pub fn new(hosts: Vec<NodeAddress>) -> Self {
        Self {
            hosts,
            ..Default::default()
        }
    }

    pub fn with_tls(mut self, tls: TlsClientConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn fred_config(&self, server: ServerConfig) -> Result<Config, ValkeyError> {
        let mut config = Config {
            server,
            ..Default::default()
        };
        config.password = self.password.clone();
        if let Some(tls) = &self.tls {
            config.tls = Some(build_tls_connector(tls)?.into());
        }
        Ok(config)
    }

    fn build(&self, server: ServerConfig) -> Result<Client, ValkeyError> {
        let command_timeout = self.command_timeout;
        let connection_timeout = self.connection_timeout;
        let client = Builder::from_config(self.fred_config(server)?)
            .with_performance_config(|perf| {
                perf.default_command_timeout = command_timeout;
            })
            .with_connection_config(|conn| {
                conn.connection_timeout = connection_timeout;
            })
            .build()?;
        Ok(client)
    }
}

/// Valkey client backed by fred.
#[derive(Clone)]
pub struct ValkeyClient {
    client: Client,
    address: NodeAddress,
}

impl ValkeyClient {
    /// Connect to the cluster through the configured seed hosts.
    ///
    /// Keyed commands are routed and redirected by fred.
    #[instrument(skip(config), fields(hosts = ?config.hosts))]
    pub async fn connect(config: &ValkeyClientConfig) -> Result<Self, ValkeyError> {
        let Some(first) = config.hosts.first().cloned() else {
            return Err(ValkeyError::InvalidConfig("No hosts provided".to_string()));
        };

        let servers: Vec<Server> = config
            .hosts
            .iter()
            .map(|addr| Server::new(addr.host.clone(), addr.port))
            .collect();
        let client = config.build(ServerConfig::Clustered {
            hosts: servers,
            policy: ClusterDiscoveryPolicy::ConfigEndpoint,
        })?;

        debug!("Connecting to Valkey cluster");
        client.init().await?;
        debug!("Connected to Valkey cluster");

        Ok(Self {
            client,
            address: first,
        })
    }

    /// Connect to exactly one node. Commands are never redirected.
    #[instrument(skip(config), fields(node = %address))]
    pub async fn connect_single(
        address: &NodeAddress,
        config: &ValkeyClientConfig,
    ) -> Result<Self, ValkeyError> {
        let client = config.build(ServerConfig::Centralized {
            server: Server::new(address.host.clone(), address.port),
        })?;

        client.init().await.map_err(|e| {
            ValkeyError::Connection(format!("failed to connect to {}: {}", address, e))
        })?;

        Ok(Self {
            client,
            address: address.clone(),
        })
    }

    /// Get the underlying fred client.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub async fn close(&self) -> Result<(), ValkeyError> {
        self.client.quit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn ping(&self) -> Result<String, ValkeyError> {
        let response: String = self.client.ping(None).await?;
        Ok(response)
    }

    async fn cluster_custom<R: FromValue>(&self, args: Vec<Value>) -> Result<R, ValkeyError> {
        let reply: R = self.client.custom(fred::cmd!("CLUSTER"), args).await?;
        Ok(reply)
    }
}

impl DataCommands for ValkeyClient {
    #[instrument(skip(self), level = "trace")]
    async fn get(&self, key: &str) -> Result<Option<String>, ValkeyError> {
        Ok(self.client.get(key).await?)
    }

    #[instrument(skip(self, value), level = "trace")]
    async fn set(&self, key: &str, value: &str) -> Result<(), ValkeyError> {
        self.client
            .set::<(), _, _>(key, value, None, None, false)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "trace")]
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, ValkeyError> {
        Ok(self.client.hget(key, field).await?)
    }

    #[instrument(skip(self, value), level = "trace")]
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), ValkeyError> {
        self.client.hset::<(), _, _>(key, (field, value)).await?;
        Ok(())
    }

    #[instrument(skip(self), level = "trace")]
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), ValkeyError> {
        self.client
            .zadd::<(), _, _>(key, None, None, false, false, (score, member))
            .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "trace")]
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, ValkeyError> {
        Ok(self.client.zscore(key, member).await?)
    }
}

impl NodeCommands for ValkeyClient {
    fn address(&self) -> &NodeAddress {
        &self.address
    }

    #[instrument(skip(self), fields(node = %self.address))]
    async fn cluster_myid(&self) -> Result<String, ValkeyError> {
        Ok(self.client.cluster_myid().await?)
    }

    #[instrument(skip(self), fields(node = %self.address))]
    async fn cluster_nodes_raw(&self) -> Result<String, ValkeyError> {
        Ok(self.client.cluster_nodes().await?)
    }

    #[instrument(skip(self), fields(node = %self.address, state = %state))]
    async fn cluster_setslot(&self, slot: u16, state: SetSlotState) -> Result<(), ValkeyError> {
        let mut args = vec![Value::from("SETSLOT"), Value::from(i64::from(slot))];
        args.extend(state.args().into_iter().map(Value::from));
        self.cluster_custom::<()>(args).await
    }

    #[instrument(skip(self), fields(node = %self.address))]
    async fn cluster_count_keys_in_slot(&self, slot: u16) -> Result<u64, ValkeyError> {
        Ok(self.client.cluster_count_keys_in_slot(slot).await?)
    }

    #[instrument(skip(self), fields(node = %self.address))]
    async fn cluster_get_keys_in_slot(
        &self,
        slot: u16,
        count: u64,
    ) -> Result<Vec<String>, ValkeyError> {
        Ok(self.client.cluster_get_keys_in_slot(slot, count).await?)
    }

    #[instrument(skip(self, keys), fields(node = %self.address, key_count = keys.len()))]
    async fn migrate_keys(
        &self,
        destination: &NodeAddress,
        keys: &[String],
        timeout: Duration,
    ) -> Result<(), ValkeyError> {
        if keys.is_empty() {
            return Ok(());
        }

        let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        let mut args = vec![
            Value::from(destination.host.as_str()),
            Value::from(i64::from(destination.port)),
            Value::from(""),
            Value::from(0_i64),
            Value::from(timeout_ms),
            Value::from("KEYS"),
        ];
        args.extend(keys.iter().map(|k| Value::from(k.as_str())));

        let reply: String = self.client.custom(fred::cmd!("MIGRATE"), args).await?;
        debug!(reply = %reply, "MIGRATE finished");
        Ok(())
    }

    #[instrument(skip(self), fields(node = %self.address))]
    async fn keys(&self) -> Result<Vec<String>, ValkeyError> {
        Ok(self
            .client
            .custom(fred::cmd!("KEYS"), vec![Value::from("*")])
            .await?)
    }

    #[instrument(skip(self), fields(node = %self.address), level = "debug")]
    async fn memory_usage(&self, key: &str) -> Result<Option<u64>, ValkeyError> {
        Ok(self.client.memory_usage(key, None).await?)
    }

    #[instrument(skip(self), fields(node = %self.address))]
    async fn info_raw(&self, section: &str) -> Result<String, ValkeyError> {
        Ok(self
            .client
            .custom(fred::cmd!("INFO"), vec![Value::from(section)])
            .await?)
    }

    #[instrument(skip(self), fields(node = %self.address))]
    async fn flush_all(&self) -> Result<(), ValkeyError> {
        self.client.flushall::<()>(false).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        ValkeyClient::is_connected(self)
    }

    async fn close(&self) -> Result<(), ValkeyError> {
        ValkeyClient::close(self).await
    }
}

/// Opens single-node fred clients sharing one configuration.
#[derive(Clone, Debug)]
pub struct ValkeyConnector {
    config: ValkeyClientConfig,
}

impl ValkeyConnector {
    pub fn new(config: ValkeyClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValkeyClientConfig {
        &self.config
    }
}

impl NodeConnector for ValkeyConnector {
    type Node = ValkeyClient;

    async fn connect_node(&self, address: &NodeAddress) -> Result<ValkeyClient, ValkeyError> {
        ValkeyClient::connect_single(address, &self.config).await
    }
}

fn read_pem(path: &str) -> Result<Vec<u8>, ValkeyError> {
    std::fs::read(Path::new(path))
        .map_err(|e| ValkeyError::InvalidConfig(format!("Failed to read {}: {}", path, e)))
}

/// Build a TLS connector from PEM files.
///
/// The CA bundle becomes the only trust root. When both a client certificate
/// and key are given, the connection uses mTLS.
fn build_tls_connector(tls: &TlsClientConfig) -> Result<TlsConnector, ValkeyError> {
    use rustls::{ClientConfig, RootCertStore};

    let ca_pem = read_pem(&tls.ca_cert_path)?;
    let mut root_store = RootCertStore::empty();
    let ca_certs = rustls_pemfile::certs(&mut ca_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ValkeyError::Connection(format!("Failed to parse CA certificate: {}", e)))?;
    for cert in ca_certs {
        root_store
            .add(cert)
            .map_err(|e| ValkeyError::Connection(format!("Failed to add CA certificate: {}", e)))?;
    }

    let builder = ClientConfig::builder().with_root_certificates(root_store);
    let config = match (&tls.cert_path, &tls.key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert_pem = read_pem(cert_path)?;
            let key_pem = read_pem(key_path)?;
            let client_certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
                .collect::<Result<Vec<CertificateDer<'static>>, _>>()
                .map_err(|e| {
                    ValkeyError::Connection(format!("Failed to parse client certificate: {}", e))
                })?;
            let client_key = rustls_pemfile::private_key(&mut key_pem.as_slice())
                .map_err(|e| ValkeyError::Connection(format!("Failed to parse client key: {}", e)))?
                .ok_or_else(|| ValkeyError::Connection("No private key found in PEM".to_string()))?;

            builder
                .with_client_auth_cert(client_certs, client_key)
                .map_err(|e| ValkeyError::Connection(format!("Failed to build TLS config: {}", e)))?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(TlsConnector::from(config))
}
