//! Health server and Prometheus metrics for the `envcheck` sidecar.
//!
//! Provides:
//! - `/healthz` - Liveness probe (always returns 200 if server is running)
//! - `/readyz` - Readiness probe (200 once the before-snapshot is captured)
//! - `/metrics` - Prometheus metrics endpoint

use std::sync::Arc;

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

use crate::check::CaptureStage;
use crate::diff::DeltaReport;

/// Labels for per-capture metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct StageLabels {
    pub stage: &'static str,
}

impl EncodeLabelSet for StageLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("stage", self.stage).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for capture outcomes
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct CaptureLabels {
    pub stage: &'static str,
    pub outcome: &'static str,
}

impl EncodeLabelSet for CaptureLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("stage", self.stage).encode(encoder.encode_label())?;
        ("outcome", self.outcome).encode(encoder.encode_label())?;
        Ok(())
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct OperationLabels {
    pub operation: String,
}

impl EncodeLabelSet for OperationLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("operation", self.operation.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct CategoryLabels {
    pub category: &'static str,
}

impl EncodeLabelSet for CategoryLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("category", self.category).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics for environment checks
pub struct Metrics {
    /// Snapshot captures by stage and outcome
    pub snapshots_total: Family<CaptureLabels, Counter>,
    /// Snapshot capture duration, including retries
    pub snapshot_duration_seconds: Family<StageLabels, Histogram>,
    /// Records in the most recent snapshot of each stage
    pub snapshot_resources: Family<StageLabels, Gauge>,
    /// Objects skipped because they could not be normalized
    pub malformed_resources_total: Counter,
    /// Attempts made by the retry engine per operation
    pub retry_attempts_total: Family<OperationLabels, Counter>,
    /// Reported delta entries by category
    pub delta_entries_total: Family<CategoryLabels, Counter>,
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

        let snapshots_total = Family::<CaptureLabels, Counter>::default();
        registry.register(
            "envcheck_snapshots",
            "Total number of snapshot captures",
            snapshots_total.clone(),
        );

        let snapshot_duration_seconds =
            Family::<StageLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.01, 2.0, 15))
            });
        registry.register(
            "envcheck_snapshot_duration_seconds",
            "Duration of snapshot capture in seconds",
            snapshot_duration_seconds.clone(),
        );

        let snapshot_resources = Family::<StageLabels, Gauge>::default();
        registry.register(
            "envcheck_snapshot_resources",
            "Number of resources in the latest snapshot",
            snapshot_resources.clone(),
        );

        let malformed_resources_total = Counter::default();
        registry.register(
            "envcheck_malformed_resources",
            "Total number of objects skipped as malformed",
            malformed_resources_total.clone(),
        );

        let retry_attempts_total = Family::<OperationLabels, Counter>::default();
        registry.register(
            "envcheck_retry_attempts",
            "Total number of attempts made by the retry engine",
            retry_attempts_total.clone(),
        );

        let delta_entries_total = Family::<CategoryLabels, Counter>::default();
        registry.register(
            "envcheck_delta_entries",
            "Total number of reported delta entries",
            delta_entries_total.clone(),
        );

        Self {
            snapshots_total,
            snapshot_duration_seconds,
            snapshot_resources,
            malformed_resources_total,
            retry_attempts_total,
            delta_entries_total,
            registry,
        }
    }

    /// Record a completed snapshot capture
    pub fn record_snapshot(
        &self,
        stage: CaptureStage,
        duration_secs: f64,
        resources: usize,
        skipped: usize,
    ) {
        let stage = stage.as_str();
        self.snapshots_total
            .get_or_create(&CaptureLabels {
                stage,
                outcome: "success",
            })
            .inc();
        self.snapshot_duration_seconds
            .get_or_create(&StageLabels { stage })
            .observe(duration_secs);
        self.snapshot_resources
            .get_or_create(&StageLabels { stage })
            .set(i64::try_from(resources).unwrap_or(i64::MAX));
        self.malformed_resources_total
            .inc_by(u64::try_from(skipped).unwrap_or(u64::MAX));
    }

    /// Record a failed snapshot capture
    pub fn record_snapshot_failure(&self, stage: CaptureStage, duration_secs: f64) {
        let stage = stage.as_str();
        self.snapshots_total
            .get_or_create(&CaptureLabels {
                stage,
                outcome: "failure",
            })
            .inc();
        self.snapshot_duration_seconds
            .get_or_create(&StageLabels { stage })
            .observe(duration_secs);
    }

    /// Record attempts made by the retry engine
    pub fn record_retry_attempts(&self, operation: &str, attempts: u32) {
        self.retry_attempts_total
            .get_or_create(&OperationLabels {
                operation: operation.to_string(),
            })
            .inc_by(u64::from(attempts));
    }

    /// Record the entries of a delta report
    pub fn record_report(&self, report: &DeltaReport) {
        for (category, count) in [
            ("added", report.added.len()),
            ("removed", report.removed.len()),
            ("changed", report.changed.len()),
        ] {
            self.delta_entries_total
                .get_or_create(&CategoryLabels { category })
                .inc_by(u64::try_from(count).unwrap_or(u64::MAX));
        }
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
    /// Whether the before-snapshot has been captured
    ready: RwLock<bool>,
    /// Metrics registry, shared with the orchestrator
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
        Self::with_metrics(Arc::new(Metrics::new()))
    }

    /// Create a health state serving the given metrics
    pub fn with_metrics(metrics: Arc<Metrics>) -> Self {
        Self {
            ready: RwLock::new(false),
            metrics,
        }
    }

    /// Mark the sidecar as ready or not ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the sidecar is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

/// Liveness probe handler
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 503 until the before-snapshot is in place, so a CI job can wait on
/// it before starting the test.
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

/// Run the health server on `0.0.0.0:port`.
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!(port, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
