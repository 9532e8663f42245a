//! Centralized key-layout and configuration constants.
//!
//! Having the store key segments and the tuning defaults in one place makes it
//! easier to keep producers, consumers and store backends in agreement.
//!
//! # Categories
//!
//! - **Key Layout**: segments used by [`crate::keys`] to build store identifiers
//! - **Record Fields**: field names of a job inside a partition log entry
//! - **Producer Defaults**
//! - **Consumer Defaults**: heartbeat, lease, polling and reclaim timings

// =============================================================================
// Key Layout
// =============================================================================

/// Prefix shared by every key this crate writes.
pub const APPLICATION_PREFIX: &str = "logq";

/// Separator between key segments. Names may not contain it.
pub const KEY_SEPARATOR: char = ':';

/// Segment for cluster-wide metadata (`logq:metadata:topics`).
pub const METADATA_SEGMENT: &str = "metadata";

/// Segment naming the topic registry set.
pub const TOPICS_SEGMENT: &str = "topics";

/// Segment for the per-topic partition count record.
pub const PARTITION_SEGMENT: &str = "partition";

/// Segment for the per-topic registry of consumer groups.
pub const CONSUMER_GROUP_SEGMENT: &str = "consumer_group";

/// Segment for per-group rebalance notification channels.
pub const REBALANCE_CHANNEL_SEGMENT: &str = "rebalance";

/// Segment for the per-group membership record.
pub const CONSUMER_SEGMENT: &str = "consumer";

/// Segment for the per-group partition claim record.
pub const OWNER_SEGMENT: &str = "owner";

/// Segment for per-partition message logs.
pub const MESSAGE_SEGMENT: &str = "message";

// =============================================================================
// Record Fields
// =============================================================================

pub const FIELD_MSG_ID: &str = "msg_id";
pub const FIELD_TOPIC: &str = "topic";
pub const FIELD_PAYLOAD: &str = "payload";
pub const FIELD_PARTITION_KEY: &str = "partition_key";
pub const FIELD_PARTITION: &str = "partition";
pub const FIELD_CREATED_AT: &str = "created_at";
pub const FIELD_ENQUEUED_AT: &str = "enqueued_at";
pub const FIELD_TIMEOUT: &str = "timeout";

// =============================================================================
// Producer Defaults
// =============================================================================

/// Partition count a topic is bootstrapped with when none is configured.
pub const DEFAULT_INIT_PARTITIONS: u32 = 1;

/// Upper bound accepted for a partition count request.
///
/// Partition growth is irreversible, so an accidental huge request would
/// leave a topic with that many logs forever.
pub const MAX_PARTITIONS: u32 = 4096;

// =============================================================================
// Consumer Defaults
// =============================================================================

/// How often a consumer renews its membership lease.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;

/// How long a lease stays valid without renewal.
///
/// Must be comfortably larger than the heartbeat interval so a single slow
/// heartbeat does not cost the consumer its partitions.
pub const DEFAULT_LEASE_TIMEOUT_MS: u64 = 30_000;

/// How often the control loop re-derives the assignment even without a
/// notification.
pub const DEFAULT_REBALANCE_INTERVAL_MS: u64 = 5_000;

/// Maximum records fetched per read.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// How long a read waits for new records before returning empty.
pub const DEFAULT_READ_BLOCK_MS: u64 = 1_000;

/// Idle threshold for reclaiming records whose job carries no timeout.
pub const DEFAULT_CLAIM_MIN_IDLE_MS: u64 = 60_000;

/// How long shutdown waits for in-flight callbacks.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 10_000;

/// Fraction of the lease timeout a consumer keeps as a safety margin when
/// computing its local fencing deadline.
pub const LEASE_SAFETY_MARGIN_RATIO: f64 = 0.1;

/// Capacity of the in-process notification channel.
pub const NOTIFICATION_CHANNEL_CAPACITY: usize = 64;

/// How often a fenced worker checks whether it may read again.
pub const FENCED_POLL_INTERVAL_MS: u64 = 100;

/// Pause after a failed read or reclaim before a worker tries again.
pub const WORKER_ERROR_BACKOFF_MS: u64 = 500;
