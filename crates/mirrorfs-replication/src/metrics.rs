//! Prometheus metrics
//!
//! Rendered at `GET /metrics` on the replication listener.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;

/// Metric names
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "mirrorfs_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "mirrorfs_http_request_duration_seconds";

    // Replication metrics
    pub const FRAMES_SENT_TOTAL: &str = "mirrorfs_frames_sent_total";
    pub const STREAMS_DROPPED_TOTAL: &str = "mirrorfs_streams_dropped_total";
    pub const CONNECTED_FOLLOWERS: &str = "mirrorfs_connected_followers";
    pub const SNAPSHOTS_SERVED_TOTAL: &str = "mirrorfs_snapshots_served_total";
    pub const SNAPSHOTS_INSTALLED_TOTAL: &str = "mirrorfs_snapshots_installed_total";
    pub const RECONNECTS_TOTAL: &str = "mirrorfs_reconnects_total";

    // Process metrics
    pub const UPTIME_SECONDS: &str = "mirrorfs_uptime_seconds";
    pub const INFO: &str = "mirrorfs_info";
}

/// One recorder per process; rebuilding it in tests must not fail
static PROMETHEUS: Lazy<PrometheusHandle> = Lazy::new(|| {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
});

/// Metrics recorder, cheap to clone
#[derive(Clone)]
pub struct MetricsRecorder {
    handle: PrometheusHandle,
    start_time: Instant,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let handle = PROMETHEUS.clone();
        gauge!(names::INFO, "version" => mirrorfs_core::VERSION).set(1.0);
        Self {
            handle,
            start_time: Instant::now(),
        }
    }

    /// Render current metrics in the Prometheus exposition format
    pub fn render(&self) -> String {
        gauge!(names::UPTIME_SECONDS).set(self.start_time.elapsed().as_secs_f64());
        self.handle.render()
    }

    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        counter!(
            names::HTTP_REQUESTS_TOTAL,
            "method" => method.to_string(),
            "path" => path.to_string(),
            "status" => status.to_string(),
        )
        .increment(1);
        histogram!(
            names::HTTP_REQUEST_DURATION_SECONDS,
            "method" => method.to_string(),
            "path" => path.to_string(),
        )
        .record(duration_secs);
    }

    pub fn record_frames_sent(&self, db: &str, count: u64) {
        counter!(names::FRAMES_SENT_TOTAL, "db" => db.to_string()).increment(count);
    }

    pub fn record_stream_dropped(&self, db: &str, reason: &'static str) {
        counter!(names::STREAMS_DROPPED_TOTAL, "db" => db.to_string(), "reason" => reason)
            .increment(1);
    }

    pub fn set_connected_followers(&self, count: u64) {
        gauge!(names::CONNECTED_FOLLOWERS).set(count as f64);
    }

    pub fn record_snapshot_served(&self, db: &str) {
        counter!(names::SNAPSHOTS_SERVED_TOTAL, "db" => db.to_string()).increment(1);
    }

    pub fn record_snapshot_installed(&self, db: &str) {
        counter!(names::SNAPSHOTS_INSTALLED_TOTAL, "db" => db.to_string()).increment(1);
    }

    pub fn record_reconnect(&self, db: &str) {
        counter!(names::RECONNECTS_TOTAL, "db" => db.to_string()).increment(1);
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Axum middleware recording request counts and latency
pub async fn metrics_middleware(
    State(metrics): State<Arc<MetricsRecorder>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    metrics.record_http_request(
        &method,
        &path,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

/// `GET /metrics`
pub async fn metrics_handler(State(metrics): State<Arc<MetricsRecorder>>) -> impl IntoResponse {
    metrics.render()
}
