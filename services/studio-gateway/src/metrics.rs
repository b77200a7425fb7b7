//! Prometheus metrics exposition
//!
//! - `studio_requests_total` (counter): labels `route`, `status`
//! - `studio_request_duration_seconds` (histogram): label `route`
//! - `genai_key_attempts_total` (counter): label `outcome`, recorded by the
//!   key rotation layer on every attempt
//!
//! `ServiceMetrics` holds the plain counters reported by `/health` and used
//! to observe draining on shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Generation calls range from sub-second text to multi-minute video.
const DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("studio_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `studio_request_duration_seconds` gets explicit buckets so it renders as a
/// histogram (with `_bucket` lines for `histogram_quantile()`) rather than a
/// summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed API request.
pub fn record_request(route: &'static str, status: u16, duration_secs: f64) {
    metrics::counter!("studio_requests_total", "route" => route, "status" => status.to_string())
        .increment(1);
    metrics::histogram!("studio_request_duration_seconds", "route" => route)
        .record(duration_secs);
}

/// Process-local counters for health reporting and drain observability.
#[derive(Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    /// Count a request as started; it stays in flight until the guard drops.
    pub fn begin(&self) -> InFlight {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlight {
            in_flight: self.in_flight.clone(),
        }
    }
}

/// Decrements the in-flight gauge on drop, including when the client
/// disconnects and the handler future is cancelled.
pub struct InFlight {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
