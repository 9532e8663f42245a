//! Retry policies for store calls.
//!
//! Every retry in the crate goes through one of the named policies below so
//! backoff behaviour stays consistent between producers and consumers.
//!
//! # Available Policies
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `store_policy` | 10ms | 500ms | 3 | Append, read, ack, claim |
//! | `join_policy` | 100ms | 5s | 10 | Joining a group |
//! | `heartbeat_policy` | 50ms | 1s | 3 | Lease renewal |
//!
//! All policies include jitter, so a fleet of consumers that lost the store
//! at the same moment does not come back in lockstep.
//!
//! # Example
//!
//! ```rust,no_run
//! use logq::retry;
//! use backon::Retryable;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let result = (|| async {
//!         Ok::<_, std::io::Error>(())
//!     })
//!     .retry(retry::store_policy())
//!     .when(|e| e.kind() == std::io::ErrorKind::TimedOut)
//!     .await?;
//!
//!     Ok(result)
//! }
//! ```

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::error::QueueError;

/// Policy for individual log store operations.
///
/// Short delays: a record loop that cannot reach the store should notice
/// quickly and fall back to its own polling cadence.
pub fn store_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(3)
        .with_jitter()
}

/// Policy for joining a consumer group.
///
/// Joining happens once per consumer lifetime (and after a lease loss), so it
/// can afford to wait out a store restart.
pub fn join_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(10)
        .with_jitter()
}

/// Policy for a single heartbeat.
///
/// Bounded well below the heartbeat interval; the heartbeat loop itself
/// tracks consecutive failures against the lease deadline.
pub fn heartbeat_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(3)
        .with_jitter()
}

/// Run a store operation under [`store_policy`], retrying connection errors.
pub async fn with_store_policy<F, Fut, T>(
    policy_name: &'static str,
    operation: F,
) -> Result<T, QueueError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, QueueError>>,
{
    retry_retriable(policy_name, store_policy(), operation).await
}

/// Run an operation under `policy`, retrying only [`QueueError::is_retriable`] errors.
pub async fn retry_retriable<F, Fut, T>(
    policy_name: &'static str,
    policy: ExponentialBuilder,
    operation: F,
) -> Result<T, QueueError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, QueueError>>,
{
    let result = operation
        .retry(policy)
        .when(|e: &QueueError| e.is_retriable())
        .notify(|e: &QueueError, delay: Duration| {
            record_retry_attempt(policy_name);
            tracing::debug!(
                policy = policy_name,
                error = %e,
                delay_ms = delay.as_millis() as u64,
                "Retrying store operation"
            );
        })
        .await;

    match &result {
        Ok(_) => record_retry_success(policy_name),
        Err(e) if e.is_retriable() => record_retry_exhausted(policy_name),
        Err(_) => {}
    }
    result
}

/// Record a retry attempt for metrics.
pub fn record_retry_attempt(policy_name: &str) {
    crate::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "attempt"])
        .inc();
}

/// Record a retry exhaustion (all retries failed).
pub fn record_retry_exhausted(policy_name: &str) {
    crate::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "exhausted"])
        .inc();

    tracing::warn!(policy = policy_name, "Retry policy exhausted");
}

/// Record a retry success.
pub fn record_retry_success(policy_name: &str) {
    crate::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "success"])
        .inc();
}
