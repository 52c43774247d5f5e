//! Prometheus metrics for chunkyard.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides the HTTP RED middleware, and
//! exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::warn;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "chunkyard_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "chunkyard_http_request_duration_seconds";

/// Chunk ingest attempts (counter). Labels: outcome (stored, already_present).
pub const CHUNKS_INGESTED_TOTAL: &str = "chunkyard_chunks_ingested_total";

/// Bytes of chunk payload written to the store (counter).
pub const CHUNK_BYTES_RECEIVED_TOTAL: &str = "chunkyard_chunk_bytes_received_total";

/// Merge attempts (counter). Labels: outcome (completed, incomplete, failed).
pub const MERGES_TOTAL: &str = "chunkyard_merges_total";

/// Existence checks (counter). Labels: result (present, absent, error).
pub const EXISTENCE_CHECKS_TOTAL: &str = "chunkyard_existence_checks_total";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder.  Idempotent.  Returns `None`
/// when another recorder is already installed in this process.
pub fn init_metrics() -> Option<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Some(handle);
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(PROMETHEUS_HANDLE.get_or_init(|| handle)),
        Err(e) => {
            warn!("Prometheus recorder not installed: {}", e);
            PROMETHEUS_HANDLE.get()
        }
    }
}

/// Register metric descriptions with the global recorder.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(CHUNKS_INGESTED_TOTAL, "Chunk ingest attempts by outcome");
    describe_counter!(
        CHUNK_BYTES_RECEIVED_TOTAL,
        "Chunk payload bytes written to the store"
    );
    describe_counter!(MERGES_TOTAL, "Merge attempts by outcome");
    describe_counter!(EXISTENCE_CHECKS_TOTAL, "Existence checks by result");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// `/metrics` itself is not instrumented.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Map a request path to a low-cardinality route label.
///
/// - `/minio/merge` -> `/minio/merge`
/// - `/objects/files/abc.png` -> `/objects/{key}`
/// - anything unknown -> `/{other}`
fn normalize_path(path: &str) -> String {
    match path {
        "/" | "/health" | "/openapi.json" | "/metrics" | "/minio/checkExits"
        | "/minio/upload" | "/minio/merge" => path.to_string(),
        _ if path.starts_with("/objects/") => "/objects/{key}".to_string(),
        _ => "/{other}".to_string(),
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}
