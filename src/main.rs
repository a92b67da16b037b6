//! valkey-reshard - live slot migration and consistency probing for Valkey clusters.
//!
//! This is the main entry point that:
//! - Initializes structured logging
//! - Reads `RESHARD_*` configuration
//! - Starts the health and metrics server
//! - Runs either the consistency prober or a slot migration

use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use valkey_reshard::client::{ValkeyClient, ValkeyConnector};
use valkey_reshard::cluster::Topology;
use valkey_reshard::config::{AppConfig, Mode};
use valkey_reshard::error::ConfigError;
use valkey_reshard::events::EventLog;
use valkey_reshard::health::{HealthState, run_health_server};
use valkey_reshard::probe::Prober;
use valkey_reshard::slots::SlotMigrator;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("valkey_reshard=info".parse()?),
        )
        .json()
        .init();

    let config = AppConfig::from_env()?;
    info!(mode = ?config.mode, seed = %config.seed, "Starting valkey-reshard");

    let health_state = Arc::new(HealthState::new());
    let health_handle = {
        let health_state = health_state.clone();
        let port = config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, port).await {
                error!("Health server error: {}", e);
            }
        })
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Received shutdown signal");
            shutdown.cancel();
        });
    }

    let log = EventLog::new();
    let result = match config.mode {
        Mode::Probe => run_probe(&config, &health_state, log, shutdown).await,
        Mode::Migrate => run_migrate(&config, &health_state, log, shutdown).await,
    };

    health_state.set_ready(false).await;
    health_handle.abort();
    info!("valkey-reshard stopped");
    result
}

/// Probe until the configured duration ends or a shutdown signal arrives,
/// then print the summary as JSON.
async fn run_probe(
    config: &AppConfig,
    health_state: &HealthState,
    log: EventLog,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = Arc::new(ValkeyClient::connect(&config.client).await?);
    info!(prefix = %config.prober.key_prefix, "Connected, starting probe");

    let prober = Prober::new(Arc::clone(&client), config.prober.clone(), log);
    prober.start()?;
    health_state.set_ready(true).await;

    let report = tokio::select! {
        report = prober.wait() => report?,
        _ = shutdown.cancelled() => {
            warn!("Stopping probe early");
            prober.stop_or_wait().await?
        }
    };

    health_state.metrics.record_probe_report(&report);
    println!("{}", serde_json::to_string_pretty(&report.summary())?);

    if let Err(e) = client.close().await {
        warn!("Failed to close client: {}", e);
    }
    Ok(())
}

/// Migrate the configured slots one by one. A shutdown signal takes effect
/// between slots so no slot is left half moved.
async fn run_migrate(
    config: &AppConfig,
    health_state: &HealthState,
    log: EventLog,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let target = config
        .target
        .as_ref()
        .ok_or(ConfigError::Missing("RESHARD_SLOT"))?;

    let connector = Arc::new(ValkeyConnector::new(config.client.clone()));
    let topology = Topology::new(connector, config.seed.clone());
    let migrator = SlotMigrator::new(topology, config.migration.clone(), log)
        .with_metrics(Arc::clone(&health_state.metrics));
    health_state.set_ready(true).await;

    let mut outcomes = Vec::with_capacity(target.slots.len());
    let mut failure = None;
    for &slot in &target.slots {
        if shutdown.is_cancelled() {
            warn!(
                remaining = target.slots.len() - outcomes.len(),
                "Stopping before all slots were migrated"
            );
            break;
        }
        match migrator
            .migrate_slot(slot, &target.destination, config.migration.timeout)
            .await
        {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    migrator.topology().disconnect().await;

    if let Some(e) = failure {
        return Err(e.into());
    }
    println!("{}", serde_json::to_string_pretty(&outcomes)?);
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Note: Signal handler setup failures are fatal - the process cannot stop
/// a probe cleanly without them. Using expect() here is intentional.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
