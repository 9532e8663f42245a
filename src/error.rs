//! Error types for producers, consumers and store backends.
//!
//! # Error Handling Patterns
//!
//! ## Fail-Fast (Propagate Errors)
//!
//! Used wherever the caller has to decide what happens next:
//! - Enqueue and batch enqueue
//! - Partition count changes
//! - Group join, heartbeat and leave
//!
//! Store and network failures surface as [`QueueError::Connection`] so the
//! caller can retry the call. Protocol invariant violations get their own
//! variants ([`QueueError::DuplicateConsumer`], [`QueueError::LeaseLost`]) so a
//! caller can tell "rejoin" from "abort".
//!
//! ## Best-Effort (Log and Continue)
//!
//! Used inside the consumer runtime's background loops:
//! - Notification publishing
//! - Claim release during shutdown
//! - Callback failures (see [`HandlerError`]), which never reach the runtime
//!
//! # Partial Batches
//!
//! [`QueueError::PartialBatch`] is the one documented case of partial success:
//! the ids that were appended before the store failed are returned alongside
//! the failure.

use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Error returned by user callbacks.
///
/// Callback failures are isolated per record (or per batch): they are logged,
/// the record stays unacknowledged and becomes reclaimable once idle.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur in the job queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The store could not be reached or rejected the operation.
    #[error("Store connection error: {0}")]
    Connection(String),

    /// The routing key is not a field of the payload.
    #[error("Routing key `{key}` is not in payload")]
    RoutingKey { key: String },

    /// A live consumer with this name already exists in the group.
    #[error("Consumer {consumer} is already a live member of group {group}")]
    DuplicateConsumer { group: String, consumer: String },

    /// The consumer's lease expired; it must rejoin before reading again.
    #[error("Consumer {consumer} lost its lease in group {group}")]
    LeaseLost { group: String, consumer: String },

    /// Some jobs of a batch were appended before the store failed.
    #[error("Batch enqueue stopped after {} jobs ({failed} not enqueued): {source}", .enqueued.len())]
    PartialBatch {
        /// Ids of the jobs that were appended.
        enqueued: Vec<String>,
        /// Number of jobs that were not appended.
        failed: usize,
        /// The failure that stopped the batch.
        #[source]
        source: Box<QueueError>,
    },

    /// The producer or consumer was used before `connect()` or after `close()`.
    #[error("Not connected. Call connect() first")]
    NotConnected,

    /// A topic, group or consumer name failed validation.
    #[error("Invalid {kind}: {reason}")]
    InvalidName { kind: &'static str, reason: String },

    /// A partition count outside the accepted range was requested.
    #[error("Invalid partition count {requested} for topic {topic}")]
    InvalidPartitionCount { topic: String, requested: u32 },

    /// A payload or stored record could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A stored record is missing a field or has a malformed one.
    #[error("Malformed record {id}: {reason}")]
    MalformedRecord { id: String, reason: String },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl QueueError {
    /// Returns true if the failed call may succeed when retried unchanged.
    ///
    /// Only store/network failures are retriable. Everything else needs the
    /// caller to change something first (payload, consumer name, rejoin).
    pub fn is_retriable(&self) -> bool {
        match self {
            QueueError::Connection(_) => true,
            QueueError::PartialBatch { source, .. } => source.is_retriable(),

            QueueError::RoutingKey { .. } => false,
            QueueError::DuplicateConsumer { .. } => false,
            QueueError::LeaseLost { .. } => false,
            QueueError::NotConnected => false,
            QueueError::InvalidName { .. } => false,
            QueueError::InvalidPartitionCount { .. } => false,
            QueueError::Serialization(_) => false,
            QueueError::MalformedRecord { .. } => false,
            QueueError::Config(_) => false,
        }
    }

    /// Returns true if the consumer should rejoin its group.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, QueueError::LeaseLost { .. })
    }

    /// Returns a short label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            QueueError::Connection(_) => "connection",
            QueueError::RoutingKey { .. } => "routing_key",
            QueueError::DuplicateConsumer { .. } => "duplicate_consumer",
            QueueError::LeaseLost { .. } => "lease_lost",
            QueueError::PartialBatch { .. } => "partial_batch",
            QueueError::NotConnected => "not_connected",
            QueueError::InvalidName { .. } => "invalid_name",
            QueueError::InvalidPartitionCount { .. } => "invalid_partition_count",
            QueueError::Serialization(_) => "serialization",
            QueueError::MalformedRecord { .. } => "malformed_record",
            QueueError::Config(_) => "config",
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Serialization(e.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        QueueError::Connection(e.to_string())
    }
}
