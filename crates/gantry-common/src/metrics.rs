//! Prometheus metrics for cloud API calls
//!
//! Every SDK wrapper wraps its provider calls in an [`ApiTimer`], so each
//! call produces one latency observation labeled with the cloud, the
//! operation name and the outcome (success, error or timeout).

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use prometheus::{
    CounterVec, HistogramVec, TextEncoder, register_counter_vec, register_histogram_vec,
};

// Outcome label values
pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";
pub const STATUS_TIMEOUT: &str = "timeout";

static GLOBAL_METRICS: LazyLock<CloudMetrics> =
    LazyLock::new(|| CloudMetrics::new().expect("failed to register cloud metrics"));

/// Process-wide metrics instance
///
/// The prometheus default registry rejects duplicate registration, so the
/// collectors are created once and shared by every cloud client.
pub fn global() -> &'static CloudMetrics {
    &GLOBAL_METRICS
}

/// Prometheus collectors for provider API traffic
pub struct CloudMetrics {
    /// Cloud API call latency histogram
    pub api_latency: HistogramVec,

    /// Total cloud API calls counter
    pub api_calls: CounterVec,

    /// Failed cloud API calls counter
    pub api_errors: CounterVec,
}

impl CloudMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let api_latency = register_histogram_vec!(
            "gantry_cloud_api_duration_seconds",
            "Cloud API call latency in seconds",
            &["cloud", "operation", "status"]
        )?;

        let api_calls = register_counter_vec!(
            "gantry_cloud_api_calls_total",
            "Total number of cloud API calls",
            &["cloud", "operation"]
        )?;

        let api_errors = register_counter_vec!(
            "gantry_cloud_api_errors_total",
            "Total number of failed cloud API calls",
            &["cloud", "operation", "error_type"]
        )?;

        Ok(Self { api_latency, api_calls, api_errors })
    }

    /// Record one finished call
    pub fn record_call(&self, cloud: &str, operation: &str, status: &str, duration: Duration) {
        self.api_latency
            .with_label_values(&[cloud, operation, status])
            .observe(duration.as_secs_f64());
        self.api_calls.with_label_values(&[cloud, operation]).inc();
    }

    /// Record one failed call
    pub fn record_error(&self, cloud: &str, operation: &str, error_type: &str) {
        self.api_errors
            .with_label_values(&[cloud, operation, error_type])
            .inc();
    }

    /// Render all registered metrics in Prometheus text format
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = prometheus::gather();
        encoder.encode_to_string(&metric_families).unwrap_or_default()
    }
}

/// Measures one cloud API call and reports its outcome
pub struct ApiTimer<'a> {
    metrics: &'a CloudMetrics,
    cloud: &'static str,
    operation: String,
    start: Instant,
}

impl<'a> ApiTimer<'a> {
    pub fn start(metrics: &'a CloudMetrics, cloud: &'static str, operation: &str) -> Self {
        Self {
            metrics,
            cloud,
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    /// Stop the timer and record a successful call
    pub fn success(self) {
        let duration = self.start.elapsed();
        self.metrics
            .record_call(self.cloud, &self.operation, STATUS_SUCCESS, duration);
    }

    /// Stop the timer and record a failed call
    pub fn failure(self, error_type: &str) {
        let duration = self.start.elapsed();
        self.metrics
            .record_call(self.cloud, &self.operation, STATUS_ERROR, duration);
        self.metrics.record_error(self.cloud, &self.operation, error_type);
    }

    /// Stop the timer and record a timed out call
    pub fn timeout(self) {
        let duration = self.start.elapsed();
        self.metrics
            .record_call(self.cloud, &self.operation, STATUS_TIMEOUT, duration);
        self.metrics
            .record_error(self.cloud, &self.operation, STATUS_TIMEOUT);
    }
}
