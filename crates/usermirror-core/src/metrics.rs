//! Prometheus metrics helpers for usermirror.
//!
//! # Usage
//!
//! ```rust,ignore
//! use usermirror_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9090, handle).await.unwrap();
//!
//!     metrics::counter!("usermirror_pull_runs_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: `usermirror_` then the component (`apply_`, `pull_`, `backfill_`, `store_`)
//! - Suffix: Unit or type (e.g., `_total`, `_seconds`)
//! - Labels: only the bounded `outcome` label on apply counters

use axum::{Json, Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// Must be called once at startup before any metrics are recorded.
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_common_metrics();
    Some(handle)
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Start the metrics HTTP server.
///
/// Serves `/metrics` (Prometheus text format) and `/health`. Binds before
/// returning so a port conflict surfaces to the caller; serving happens on a
/// background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<SocketAddr, std::io::Error> {
    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        )
        .route(
            "/health",
            get(|| async {
                Json(HealthResponse {
                    status: "ok",
                    version: env!("CARGO_PKG_VERSION"),
                })
            }),
        );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!("Metrics server listening on http://{}/metrics", local_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(local_addr)
}

/// Register descriptions for the metrics emitted by the pipeline.
fn register_common_metrics() {
    // =========================================================================
    // Applier
    // =========================================================================

    describe_counter!(
        "usermirror_apply_events_total",
        "Events passed to the applier (label: outcome)"
    );
    describe_counter!(
        "usermirror_apply_handler_failures_total",
        "Post-event handler invocations that failed"
    );
    describe_counter!(
        "usermirror_apply_handler_retries_total",
        "Queued handler deliveries attempted again"
    );
    describe_histogram!(
        "usermirror_apply_duration_seconds",
        "Time spent applying a single event, handler included, whatever the outcome"
    );

    // =========================================================================
    // Live sync puller
    // =========================================================================

    describe_counter!("usermirror_pull_runs_total", "Live sync runs started");
    describe_counter!(
        "usermirror_pull_runs_superseded_total",
        "Live sync runs abandoned because a newer trigger arrived"
    );
    describe_counter!("usermirror_pull_errors_total", "Live sync runs that failed");
    describe_counter!("usermirror_pull_pages_total", "Feed pages fetched by live sync");
    describe_gauge!(
        "usermirror_pull_in_progress",
        "Whether a live sync run is executing (1=yes, 0=no)"
    );
    describe_histogram!(
        "usermirror_pull_duration_seconds",
        "Wall time of completed live sync runs"
    );

    // =========================================================================
    // Backfill reconciler
    // =========================================================================

    describe_counter!("usermirror_backfill_runs_total", "Reconciliation passes started");
    describe_counter!(
        "usermirror_backfill_errors_total",
        "Reconciliation passes that failed"
    );
    describe_counter!(
        "usermirror_backfill_events_processed_total",
        "Missing events found and applied by reconciliation"
    );
    describe_counter!(
        "usermirror_backfill_events_skipped_total",
        "Events reconciliation found already present"
    );
    describe_gauge!(
        "usermirror_backfill_checkpoint_creation_time",
        "Creation time (microseconds) of the verified checkpoint"
    );
    describe_gauge!(
        "usermirror_backfill_last_run_unix",
        "Unix time of the last completed reconciliation pass"
    );
    describe_histogram!(
        "usermirror_backfill_duration_seconds",
        "Wall time of completed reconciliation passes"
    );

    // =========================================================================
    // Store
    // =========================================================================

    describe_gauge!(
        "usermirror_store_events_approximate",
        "Approximate number of recorded events"
    );
    describe_gauge!(
        "usermirror_store_users_approximate",
        "Approximate number of mirrored users"
    );
}

// =============================================================================
// Metric Recording Helpers
// =============================================================================

/// Increment a counter.
#[inline]
pub fn increment(name: &'static str, count: u64) {
    metrics::counter!(name).increment(count);
}

/// Set a gauge value.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}
