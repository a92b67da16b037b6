//! Environment configuration for the `valkey-reshard` binary.
//!
//! | Variable | Default |
//! |---|---|
//! | `RESHARD_SEED` | `127.0.0.1:50001` |
//! | `RESHARD_MODE` | `probe` (`probe` or `migrate`) |
//! | `RESHARD_SLOT` | required for `migrate`, e.g. `15495` or `100-110,15495` |
//! | `RESHARD_DESTINATION` | required for `migrate`, `host:port` |
//! | `RESHARD_TIMEOUT_MS` | `2000` |
//! | `RESHARD_PROBE_DURATION_MS` | `60000` |
//! | `RESHARD_PROBE_INTERVAL_MS` | `1000` |
//! | `RESHARD_PROBE_DELAY_MS` | `50` |
//! | `RESHARD_KEY_PREFIX` | `reshard-probe` |
//! | `RESHARD_ZSET_KEY`, `RESHARD_HASH_KEY` | `<prefix>:zset`, `<prefix>:hash` |
//! | `RESHARD_RUN_ID` | generated per run |
//! | `RESHARD_PASSWORD` | none |
//! | `RESHARD_TLS_CA_CERT`, `RESHARD_TLS_CERT`, `RESHARD_TLS_KEY` | none |
//! | `RESHARD_METRICS_PORT` | `8080` |

use std::str::FromStr;
use std::time::Duration;

use crate::client::{NodeAddress, TlsClientConfig, ValkeyClientConfig};
use crate::error::ConfigError;
use crate::probe::ProberConfig;
use crate::slots::{MigrationConfig, SlotRange};

const DEFAULT_SEED: &str = "127.0.0.1:50001";
const DEFAULT_METRICS_PORT: u16 = 8080;

/// What the binary does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Run the consistency prober for its configured duration.
    Probe,
    /// Move slots to a destination.
    Migrate,
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "probe" => Ok(Mode::Probe),
            "migrate" => Ok(Mode::Migrate),
            other => Err(ConfigError::Invalid {
                var: "RESHARD_MODE",
                value: other.to_string(),
                reason: "expected probe or migrate".to_string(),
            }),
        }
    }
}

/// Slots and destination of a `migrate` run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationTarget {
    pub slots: Vec<u16>,
    pub destination: NodeAddress,
}

/// Everything the binary needs, read from `RESHARD_*` variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mode: Mode,
    pub seed: NodeAddress,
    pub client: ValkeyClientConfig,
    pub prober: ProberConfig,
    pub migration: MigrationConfig,
    /// Set when `mode` is `Migrate`.
    pub target: Option<MigrationTarget>,
    pub metrics_port: u16,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let mode = match get("RESHARD_MODE") {
            Some(value) => value.parse()?,
            None => Mode::Probe,
        };
        let seed: NodeAddress = parse_var(
            "RESHARD_SEED",
            &get("RESHARD_SEED").unwrap_or_else(|| DEFAULT_SEED.to_string()),
        )?;

        let mut client = ValkeyClientConfig::new(vec![seed.clone()]);
        if let Some(password) = get("RESHARD_PASSWORD") {
            client = client.with_password(password);
        }
        if let Some(ca_cert_path) = get("RESHARD_TLS_CA_CERT") {
            client = client.with_tls(TlsClientConfig {
                ca_cert_path,
                cert_path: get("RESHARD_TLS_CERT"),
                key_path: get("RESHARD_TLS_KEY"),
            });
        }

        let millis = |var: &'static str, default: u64| -> Result<Duration, ConfigError> {
            match get(var) {
                Some(value) => Ok(Duration::from_millis(parse_var(var, &value)?)),
                None => Ok(Duration::from_millis(default)),
            }
        };

        let interval = millis("RESHARD_PROBE_INTERVAL_MS", 1000)?;
        if interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: "RESHARD_PROBE_INTERVAL_MS",
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        let mut prober = ProberConfig::default()
            .with_duration(millis("RESHARD_PROBE_DURATION_MS", 60_000)?)
            .with_interval(interval)
            .with_read_after_write_delay(millis("RESHARD_PROBE_DELAY_MS", 50)?);
        if let Some(prefix) = get("RESHARD_KEY_PREFIX") {
            prober.key_prefix = prefix;
        }
        if let Some(key) = get("RESHARD_ZSET_KEY") {
            prober = prober.with_zset_key(key);
        }
        if let Some(key) = get("RESHARD_HASH_KEY") {
            prober = prober.with_hash_key(key);
        }
        if let Some(run_id) = get("RESHARD_RUN_ID") {
            prober = prober.with_run_id(run_id);
        }

        let migration = MigrationConfig::default().with_timeout(millis("RESHARD_TIMEOUT_MS", 2000)?);

        let target = match mode {
            Mode::Probe => None,
            Mode::Migrate => {
                let slots = get("RESHARD_SLOT").ok_or(ConfigError::Missing("RESHARD_SLOT"))?;
                let destination = get("RESHARD_DESTINATION")
                    .ok_or(ConfigError::Missing("RESHARD_DESTINATION"))?;
                Some(MigrationTarget {
                    slots: parse_slots(&slots)?,
                    destination: parse_var("RESHARD_DESTINATION", &destination)?,
                })
            }
        };

        let metrics_port = match get("RESHARD_METRICS_PORT") {
            Some(value) => parse_var("RESHARD_METRICS_PORT", &value)?,
            None => DEFAULT_METRICS_PORT,
        };

        Ok(AppConfig {
            mode,
            seed,
            client,
            prober,
            migration,
            target,
            metrics_port,
        })
    }
}

fn parse_var<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// `"15495"`, `"100-110"` or a comma separated mix, in the given order.
fn parse_slots(value: &str) -> Result<Vec<u16>, ConfigError> {
    let mut slots = Vec::new();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let range = SlotRange::parse(part).map_err(|e| ConfigError::Invalid {
            var: "RESHARD_SLOT",
            value: value.to_string(),
            reason: e.to_string(),
        })?;
        slots.extend(range.iter());
    }
    if slots.is_empty() {
        return Err(ConfigError::Missing("RESHARD_SLOT"));
    }
    Ok(slots)
}
