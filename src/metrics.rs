//! Prometheus metrics for producers and consumers.
//!
//! Metrics cover:
//! - Enqueue throughput per topic
//! - Callback outcomes and latency
//! - Stale record reclaims
//! - Partition ownership and rebalances
//! - Heartbeats, lease losses and fencing
//! - Retry behaviour
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the "logq" prefix to
//! avoid name collisions with other libraries using the default Prometheus
//! registry. Registration errors are handled gracefully: if a metric fails to
//! register, an unregistered metric is used instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Registry,
    TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for queue metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("logq".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================

macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_gauge_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntGaugeVec> = Lazy::new(|| {
            register_int_gauge_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Producer metrics
// =============================================================================

define_counter_vec!(
    JOBS_ENQUEUED,
    "jobs_enqueued_total",
    "Total number of jobs appended to partition logs",
    ["topic"]
);
define_counter_vec!(
    ENQUEUE_ERRORS,
    "enqueue_errors_total",
    "Total number of failed enqueue calls",
    ["topic", "error"]
);
define_gauge_vec!(
    TOPIC_PARTITION_COUNT,
    "topic_partition_count",
    "Last observed partition count per topic",
    ["topic"]
);
define_counter_vec!(
    PARTITION_INCREASES,
    "partition_increases_total",
    "Partition count increase requests by result",
    ["topic", "result"]
);

// =============================================================================
// Consumer metrics
// =============================================================================

define_counter_vec!(
    JOBS_PROCESSED,
    "jobs_processed_total",
    "Total number of callback invocations by outcome",
    ["topic", "outcome"]
);
define_histogram_vec!(
    HANDLER_DURATION,
    "handler_duration_seconds",
    "Callback duration in seconds",
    ["topic"],
    [
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0
    ]
);
define_counter_vec!(
    JOBS_RECLAIMED,
    "jobs_reclaimed_total",
    "Total number of stale pending records reclaimed",
    ["topic"]
);
define_gauge_vec!(
    OWNED_PARTITIONS,
    "owned_partitions",
    "Number of partitions currently read by a consumer",
    ["topic", "group", "consumer"]
);
define_counter_vec!(
    REBALANCES,
    "rebalances_total",
    "Total number of assignment recomputations by trigger",
    ["topic", "trigger"]
);
define_counter_vec!(
    HEARTBEAT_FAILURES,
    "heartbeat_failures_total",
    "Total number of failed heartbeats",
    ["topic", "group"]
);
define_counter_vec!(
    LEASE_LOSSES,
    "lease_losses_total",
    "Total number of consumer lease losses",
    ["topic", "group"]
);
define_gauge!(
    FENCED_CONSUMERS,
    "fenced_consumers",
    "Consumers in this process currently fenced after missing their lease deadline"
);
define_counter_vec!(
    STORE_ERRORS,
    "store_errors_total",
    "Store operation failures seen by consumer loops",
    ["operation"]
);

// =============================================================================
// Retry metrics
// =============================================================================

define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Retry attempts by policy and outcome",
    ["policy", "outcome"]
);

// =============================================================================
// Safe Registration
// =============================================================================

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGaugeVec metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Force registration of every metric so they show up before first use.
///
/// Idempotent.
pub fn init_metrics() {
    let _ = &*JOBS_ENQUEUED;
    let _ = &*ENQUEUE_ERRORS;
    let _ = &*TOPIC_PARTITION_COUNT;
    let _ = &*PARTITION_INCREASES;
    let _ = &*JOBS_PROCESSED;
    let _ = &*HANDLER_DURATION;
    let _ = &*JOBS_RECLAIMED;
    let _ = &*OWNED_PARTITIONS;
    let _ = &*REBALANCES;
    let _ = &*HEARTBEAT_FAILURES;
    let _ = &*LEASE_LOSSES;
    let _ = &*FENCED_CONSUMERS;
    let _ = &*STORE_ERRORS;
    let _ = &*RETRY_ATTEMPTS;
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Gather all metric families from the registry.
pub fn gather_metrics() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}

// =============================================================================
// Recording helpers
// =============================================================================

pub fn record_enqueue(topic: &str, count: u64) {
    JOBS_ENQUEUED.with_label_values(&[topic]).inc_by(count);
}

pub fn record_enqueue_error(topic: &str, error: &crate::error::QueueError) {
    ENQUEUE_ERRORS
        .with_label_values(&[topic, error.as_metric_label()])
        .inc();
}

pub fn set_partition_count(topic: &str, count: u32) {
    TOPIC_PARTITION_COUNT
        .with_label_values(&[topic])
        .set(i64::from(count));
}

/// Record a partition increase request: `increased` or `unchanged`.
pub fn record_partition_increase(topic: &str, increased: bool) {
    let result = if increased { "increased" } else { "unchanged" };
    PARTITION_INCREASES
        .with_label_values(&[topic, result])
        .inc();
}

/// Record one callback invocation: `success`, `failure` or `panic`.
pub fn record_processed(topic: &str, outcome: &str, count: u64, duration_secs: f64) {
    JOBS_PROCESSED
        .with_label_values(&[topic, outcome])
        .inc_by(count);
    HANDLER_DURATION
        .with_label_values(&[topic])
        .observe(duration_secs);
}

pub fn record_reclaimed(topic: &str, count: u64) {
    JOBS_RECLAIMED.with_label_values(&[topic]).inc_by(count);
}

pub fn set_owned_partitions(topic: &str, group: &str, consumer: &str, count: usize) {
    OWNED_PARTITIONS
        .with_label_values(&[topic, group, consumer])
        .set(count as i64);
}

/// Record a rebalance: `join`, `notification`, `poll` or `lease_lost`.
pub fn record_rebalance(topic: &str, trigger: &str) {
    REBALANCES.with_label_values(&[topic, trigger]).inc();
}

pub fn record_heartbeat_failure(topic: &str, group: &str) {
    HEARTBEAT_FAILURES.with_label_values(&[topic, group]).inc();
}

pub fn record_lease_loss(topic: &str, group: &str) {
    LEASE_LOSSES.with_label_values(&[topic, group]).inc();
}

pub fn record_store_error(operation: &str) {
    STORE_ERRORS.with_label_values(&[operation]).inc();
}
