//! Producer and consumer configuration.
//!
//! Both configs start from [`Default`] (values from [`crate::constants`]), can
//! be adjusted with `with_*` setters, or loaded from `LOGQ_*` environment
//! variables. Call `validate()` before use; it reports every problem at once.
//!
//! ```rust
//! use std::time::Duration;
//! use logq::config::ConsumerConfig;
//!
//! let config = ConsumerConfig::new("send_email", "email_group")
//!     .with_consumer_name("worker-1")
//!     .with_heartbeat_interval(Duration::from_secs(2))
//!     .with_lease_timeout(Duration::from_secs(10));
//! assert!(config.validate().is_ok());
//! ```

use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_CLAIM_MIN_IDLE_MS, DEFAULT_HEARTBEAT_INTERVAL_MS,
    DEFAULT_INIT_PARTITIONS, DEFAULT_LEASE_TIMEOUT_MS, DEFAULT_READ_BLOCK_MS,
    DEFAULT_REBALANCE_INTERVAL_MS, DEFAULT_SHUTDOWN_GRACE_MS, LEASE_SAFETY_MARGIN_RATIO,
    MAX_PARTITIONS,
};
use crate::error::{QueueError, QueueResult};
use crate::validation::{validate_consumer_name, validate_group_name, validate_topic_name};

/// Configuration for a [`crate::producer::Producer`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerConfig {
    pub topic: String,
    /// Minimum partition count ensured on connect.
    pub init_partitions: u32,
    /// Default cap on each partition log's length. `None` keeps everything.
    pub max_len: Option<usize>,
    /// Allow approximate trimming when `max_len` is set.
    pub approximate_trim: bool,
    /// Default job timeout when an enqueue does not set one. Zero means none.
    pub default_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            init_partitions: DEFAULT_INIT_PARTITIONS,
            max_len: None,
            approximate_trim: true,
            default_timeout: Duration::ZERO,
        }
    }
}

impl ProducerConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Self::default()
        }
    }

    pub fn with_init_partitions(mut self, init_partitions: u32) -> Self {
        self.init_partitions = init_partitions;
        self
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    pub fn with_approximate_trim(mut self, approximate: bool) -> Self {
        self.approximate_trim = approximate;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Load from environment variables.
    ///
    /// - `LOGQ_TOPIC` (required)
    /// - `LOGQ_INIT_PARTITIONS` (default: 1)
    /// - `LOGQ_MAX_LEN` (default: unbounded)
    /// - `LOGQ_APPROXIMATE_TRIM`: "true" or "false" (default: true)
    /// - `LOGQ_JOB_TIMEOUT_MS` (default: 0, no timeout)
    pub fn from_env() -> QueueResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            topic: required_env("LOGQ_TOPIC")?,
            init_partitions: env_or("LOGQ_INIT_PARTITIONS", defaults.init_partitions)?,
            max_len: optional_env("LOGQ_MAX_LEN")?,
            approximate_trim: env_or("LOGQ_APPROXIMATE_TRIM", defaults.approximate_trim)?,
            default_timeout: env_millis_or("LOGQ_JOB_TIMEOUT_MS", defaults.default_timeout)?,
        })
    }

    /// Validate the configuration and return any errors found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = validate_topic_name(&self.topic) {
            errors.push(e.to_string());
        }

        if self.init_partitions == 0 || self.init_partitions > MAX_PARTITIONS {
            errors.push(format!(
                "init_partitions ({}) must be between 1 and {MAX_PARTITIONS}",
                self.init_partitions
            ));
        }

        if self.max_len == Some(0) {
            errors.push("max_len must be at least 1 when set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration for a [`crate::consumer::Consumer`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    pub topic: String,
    pub group: String,
    /// Unique within the group. Defaults to a random name.
    pub consumer_name: String,
    /// Maximum records per read.
    pub batch_size: usize,
    /// How long a read waits for new records.
    pub read_block: Duration,
    pub heartbeat_interval: Duration,
    /// How long the membership lease lasts without renewal.
    pub lease_timeout: Duration,
    /// Period of the registry poll that backs up notifications.
    pub rebalance_interval: Duration,
    /// Reclaim threshold for records whose job has no timeout.
    pub claim_min_idle: Duration,
    /// How long shutdown and partition hand-off wait for in-flight callbacks.
    pub shutdown_grace: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            group: String::new(),
            consumer_name: random_consumer_name(),
            batch_size: DEFAULT_BATCH_SIZE,
            read_block: Duration::from_millis(DEFAULT_READ_BLOCK_MS),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            lease_timeout: Duration::from_millis(DEFAULT_LEASE_TIMEOUT_MS),
            rebalance_interval: Duration::from_millis(DEFAULT_REBALANCE_INTERVAL_MS),
            claim_min_idle: Duration::from_millis(DEFAULT_CLAIM_MIN_IDLE_MS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
        }
    }
}

impl ConsumerConfig {
    pub fn new(topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            ..Self::default()
        }
    }

    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_read_block(mut self, read_block: Duration) -> Self {
        self.read_block = read_block;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    pub fn with_rebalance_interval(mut self, interval: Duration) -> Self {
        self.rebalance_interval = interval;
        self
    }

    pub fn with_claim_min_idle(mut self, min_idle: Duration) -> Self {
        self.claim_min_idle = min_idle;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Part of the lease kept in reserve when computing the local fencing
    /// deadline.
    pub fn lease_safety_margin(&self) -> Duration {
        self.lease_timeout.mul_f64(LEASE_SAFETY_MARGIN_RATIO)
    }

    /// Load from environment variables.
    ///
    /// - `LOGQ_TOPIC`, `LOGQ_GROUP` (required)
    /// - `LOGQ_CONSUMER_NAME` (default: random)
    /// - `LOGQ_BATCH_SIZE` (default: 10)
    /// - `LOGQ_READ_BLOCK_MS` (default: 1000)
    /// - `LOGQ_HEARTBEAT_INTERVAL_MS` (default: 5000)
    /// - `LOGQ_LEASE_TIMEOUT_MS` (default: 30000)
    /// - `LOGQ_REBALANCE_INTERVAL_MS` (default: 5000)
    /// - `LOGQ_CLAIM_MIN_IDLE_MS` (default: 60000)
    /// - `LOGQ_SHUTDOWN_GRACE_MS` (default: 10000)
    pub fn from_env() -> QueueResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            topic: required_env("LOGQ_TOPIC")?,
            group: required_env("LOGQ_GROUP")?,
            consumer_name: optional_env("LOGQ_CONSUMER_NAME")?
                .unwrap_or(defaults.consumer_name),
            batch_size: env_or("LOGQ_BATCH_SIZE", defaults.batch_size)?,
            read_block: env_millis_or("LOGQ_READ_BLOCK_MS", defaults.read_block)?,
            heartbeat_interval: env_millis_or(
                "LOGQ_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval,
            )?,
            lease_timeout: env_millis_or("LOGQ_LEASE_TIMEOUT_MS", defaults.lease_timeout)?,
            rebalance_interval: env_millis_or(
                "LOGQ_REBALANCE_INTERVAL_MS",
                defaults.rebalance_interval,
            )?,
            claim_min_idle: env_millis_or("LOGQ_CLAIM_MIN_IDLE_MS", defaults.claim_min_idle)?,
            shutdown_grace: env_millis_or("LOGQ_SHUTDOWN_GRACE_MS", defaults.shutdown_grace)?,
        })
    }

    /// Validate the configuration and return any errors found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for result in [
            validate_topic_name(&self.topic),
            validate_group_name(&self.group),
            validate_consumer_name(&self.consumer_name),
        ] {
            if let Err(e) = result {
                errors.push(e.to_string());
            }
        }

        if self.batch_size == 0 {
            errors.push("batch_size must be at least 1".to_string());
        }

        if self.heartbeat_interval.is_zero() {
            errors.push("heartbeat_interval must be greater than 0".to_string());
        }

        // Renewal must land before the fencing deadline.
        let fencing_window = self.lease_timeout.saturating_sub(self.lease_safety_margin());
        if self.heartbeat_interval >= fencing_window {
            errors.push(format!(
                "heartbeat_interval ({:?}) must be less than lease_timeout ({:?}) minus its safety margin ({:?})",
                self.heartbeat_interval,
                self.lease_timeout,
                self.lease_safety_margin()
            ));
        }

        // A worker blocked in a read cannot notice it has been fenced.
        if self.read_block >= self.lease_timeout {
            errors.push(format!(
                "read_block ({:?}) must be less than lease_timeout ({:?})",
                self.read_block, self.lease_timeout
            ));
        }

        if self.rebalance_interval.is_zero() {
            errors.push("rebalance_interval must be greater than 0".to_string());
        }

        if self.claim_min_idle.is_zero() {
            errors.push("claim_min_idle must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Convert a list of validation errors into a single [`QueueError::Config`].
pub(crate) fn config_error(errors: Vec<String>) -> QueueError {
    QueueError::Config(errors.join("; "))
}

fn random_consumer_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("consumer-{}", &id[..8])
}

fn required_env(name: &str) -> QueueResult<String> {
    std::env::var(name).map_err(|_| QueueError::Config(format!("{name} must be set")))
}

fn optional_env<T: FromStr>(name: &str) -> QueueResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| QueueError::Config(format!("Invalid {name}: {e}"))),
        Err(_) => Ok(None),
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> QueueResult<T>
where
    T::Err: std::fmt::Display,
{
    Ok(optional_env(name)?.unwrap_or(default))
}

fn env_millis_or(name: &str, default: Duration) -> QueueResult<Duration> {
    Ok(optional_env::<u64>(name)?
        .map(Duration::from_millis)
        .unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_producer_defaults_validate() {
        let config = ProducerConfig::new("send_email");
        assert_eq!(config.init_partitions, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_producer_validation_collects_all_errors() {
        let config = ProducerConfig::new("bad topic")
            .with_init_partitions(0)
            .with_max_len(0);
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_consumer_defaults_validate() {
        let config = ConsumerConfig::new("send_email", "email_group");
        assert!(config.consumer_name.starts_with("consumer-"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_random_names_differ() {
        assert_ne!(
            ConsumerConfig::default().consumer_name,
            ConsumerConfig::default().consumer_name
        );
    }

    #[test]
    fn test_heartbeat_must_fit_in_lease() {
        let config = ConsumerConfig::new("t", "g")
            .with_heartbeat_interval(Duration::from_secs(10))
            .with_lease_timeout(Duration::from_secs(10));
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("heartbeat_interval")));
    }

    #[test]
    fn test_read_block_must_fit_in_lease() {
        let config = ConsumerConfig::new("t", "g")
            .with_read_block(Duration::from_secs(60))
            .with_lease_timeout(Duration::from_secs(30));
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("read_block")));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config = ConsumerConfig::new("t", "g").with_batch_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_safety_margin() {
        let config = ConsumerConfig::new("t", "g").with_lease_timeout(Duration::from_secs(30));
        assert_eq!(config.lease_safety_margin(), Duration::from_secs(3));
    }

    #[test]
    fn test_config_error_joins_messages() {
        let err = config_error(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(err.to_string(), "Configuration error: a; b");
    }
}
