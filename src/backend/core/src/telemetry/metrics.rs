//! Prometheus metrics for the job queue and error counters.
//!
//! # Example
//!
//! ```rust,no_run
//! use labkit_core::telemetry::metrics::JobMetrics;
//!
//! JobMetrics::record_enqueued("ModelJob");
//! JobMetrics::set_queue_depth(3);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Histogram buckets for job durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

// Jobs run from milliseconds (a cancelled-looking predict) up to hours (a search).
fn default_duration_buckets() -> Vec<f64> {
    vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]
}

/// Handle to the installed Prometheus recorder, if any.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry with no recorder; renders an empty exposition.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the global Prometheus recorder.
///
/// # Errors
///
/// Returns an error if the bucket list is empty or a recorder is already installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new();
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = builder.install_recorder()?;
    register_metric_descriptions();

    tracing::info!(service_name = %service_name, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!(
        "labkit_jobs_enqueued_total",
        "Total number of jobs accepted onto the queue"
    );
    describe_counter!(
        "labkit_jobs_completed_total",
        "Total number of jobs whose run finished successfully"
    );
    describe_counter!(
        "labkit_jobs_failed_total",
        "Total number of jobs whose run failed or panicked"
    );
    describe_histogram!(
        "labkit_job_duration_seconds",
        metrics::Unit::Seconds,
        "Wall-clock duration of a job run"
    );
    describe_gauge!("labkit_queue_depth", "Number of jobs waiting in the queue");
    describe_counter!("errors_total", "Total number of errors by code");
}

/// Job lifecycle metrics.
pub struct JobMetrics;

impl JobMetrics {
    pub fn record_enqueued(kind: &str) {
        counter!("labkit_jobs_enqueued_total", "kind" => kind.to_string()).increment(1);
    }

    pub fn record_cancelled(kind: &str) {
        counter!("labkit_jobs_cancelled_total", "kind" => kind.to_string()).increment(1);
    }

    /// Record a successful run and its duration.
    pub fn record_completed(kind: &str, duration: Duration) {
        counter!("labkit_jobs_completed_total", "kind" => kind.to_string()).increment(1);
        histogram!("labkit_job_duration_seconds", "kind" => kind.to_string())
            .record(duration.as_secs_f64());
    }

    /// Record a failed run. `reason` is `job_error` or `panic`.
    pub fn record_failed(kind: &str, reason: &'static str, duration: Duration) {
        counter!(
            "labkit_jobs_failed_total",
            "kind" => kind.to_string(),
            "reason" => reason,
        )
        .increment(1);
        histogram!("labkit_job_duration_seconds", "kind" => kind.to_string())
            .record(duration.as_secs_f64());
    }

    pub fn set_queue_depth(depth: usize) {
        gauge!("labkit_queue_depth").set(depth as f64);
    }
}
