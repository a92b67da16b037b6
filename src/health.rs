//! Health server and Prometheus metrics.
//!
//! Provides:
//! - `/healthz` - Liveness probe (always returns 200 if server is running)
//! - `/readyz` - Readiness probe (returns 200 once the run is underway)
//! - `/metrics` - Prometheus metrics endpoint

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tracing::info;

use crate::probe::{ProbeReport, ProbeTarget};

/// Label for per-target probe metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct TargetLabels {
    pub target: ProbeTarget,
}

impl EncodeLabelSet for TargetLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("target", self.target.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Label for migration results
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ResultLabels {
    pub result: String,
}

impl EncodeLabelSet for ResultLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("result", self.result.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics for probe runs and migrations
pub struct Metrics {
    /// Probe cycles started
    pub probe_cycles_total: Counter,
    /// Failed read-after-write checks per target
    pub probe_misses_total: Family<TargetLabels, Counter>,
    /// Values missing at final verification per target
    pub probe_missing_after_total: Family<TargetLabels, Counter>,
    /// Downtime of the last probe run, in hundredths of a percent
    pub probe_downtime_basis_points: Gauge,
    /// Migrations by result
    pub migrations_total: Family<ResultLabels, Counter>,
    /// Keys moved by successful migrations
    pub keys_migrated_total: Counter,
    /// Migration duration histogram
    pub migration_duration_seconds: Family<ResultLabels, Histogram>,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let probe_cycles_total = Counter::default();
        registry.register(
            "reshard_probe_cycles",
            "Total number of probe cycles started",
            probe_cycles_total.clone(),
        );

        let probe_misses_total = Family::<TargetLabels, Counter>::default();
        registry.register(
            "reshard_probe_misses",
            "Read-after-write checks that failed",
            probe_misses_total.clone(),
        );

        let probe_missing_after_total = Family::<TargetLabels, Counter>::default();
        registry.register(
            "reshard_probe_missing_after",
            "Values missing when the probe run was verified",
            probe_missing_after_total.clone(),
        );

        let probe_downtime_basis_points = Gauge::default();
        registry.register(
            "reshard_probe_downtime_basis_points",
            "Downtime of the last probe run in hundredths of a percent",
            probe_downtime_basis_points.clone(),
        );

        let migrations_total = Family::<ResultLabels, Counter>::default();
        registry.register(
            "reshard_migrations",
            "Total number of slot migrations by result",
            migrations_total.clone(),
        );

        let keys_migrated_total = Counter::default();
        registry.register(
            "reshard_keys_migrated",
            "Keys moved by successful slot migrations",
            keys_migrated_total.clone(),
        );

        let migration_duration_seconds =
            Family::<ResultLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "reshard_migration_duration_seconds",
            "Duration of slot migrations in seconds",
            migration_duration_seconds.clone(),
        );

        Self {
            probe_cycles_total,
            probe_misses_total,
            probe_missing_after_total,
            probe_downtime_basis_points,
            migrations_total,
            keys_migrated_total,
            migration_duration_seconds,
            registry,
        }
    }

    /// Record one finished migration
    pub fn record_migration(&self, result: &str, keys_moved: u64, duration: Duration) {
        let labels = ResultLabels {
            result: result.to_string(),
        };
        self.migrations_total.get_or_create(&labels).inc();
        self.migration_duration_seconds
            .get_or_create(&labels)
            .observe(duration.as_secs_f64());
        self.keys_migrated_total.inc_by(keys_moved);
    }

    /// Record the totals of a finished probe run
    pub fn record_probe_report(&self, report: &ProbeReport) {
        self.probe_cycles_total.inc_by(report.total_cycles);
        for target in ProbeTarget::ALL {
            let labels = TargetLabels { target };
            self.probe_misses_total
                .get_or_create(&labels)
                .inc_by(report.misses_for(target));
            self.probe_missing_after_total
                .get_or_create(&labels)
                .inc_by(report.missing_after_for(target));
        }
        self.probe_downtime_basis_points
            .set((report.downtime() * 100.0).round() as i64);
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    ready: RwLock<bool>,
    pub metrics: Arc<Metrics>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve health and metrics endpoints on `0.0.0.0:<port>`.
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!(port, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
