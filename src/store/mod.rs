//! Store traits the queue is built on.
//!
//! Producers and consumers never talk to a backend directly. They go through
//! two traits:
//!
//! - [`LogStore`]: append-only per-partition logs with consumer-group
//!   delivery tracking (read, acknowledge, reclaim).
//! - [`CoordinationStore`]: small shared records used for coordination:
//!   registries, the partition count, membership leases, partition claims and
//!   a notification channel.
//!
//! [`QueueStore`] combines both and is implemented automatically.
//!
//! # Available Implementations
//!
//! - [`MemoryStore`]: in-process, used by tests and single-process deployments
//! - `RedisStore`: Redis Streams backend (requires the `redis` feature)
//!
//! # Atomicity
//!
//! Every method is a single atomic step against the store. In particular
//! [`CoordinationStore::raise_partition_count`] is a compare-and-set,
//! [`CoordinationStore::try_register_member`] and
//! [`CoordinationStore::claim_partition`] check liveness and write in one
//! step, and [`LogStore::claim_stale`] re-checks idleness while reassigning.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::QueueResult;
use crate::types::{LogRecord, RecordFields};

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

/// Length cap applied to a partition log on append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trim {
    pub max_len: usize,
    /// Allow the backend to keep slightly more entries than `max_len` when
    /// that is cheaper.
    pub approximate: bool,
}

/// A delivered-but-unacknowledged entry of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    /// Consumer the entry is currently assigned to.
    pub consumer: String,
    /// Time since the entry was last delivered.
    pub idle: Duration,
    pub delivery_count: u64,
}

/// A live member of a group and the remaining time on its lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberLease {
    pub consumer: String,
    pub remaining: Duration,
}

/// Result of a membership scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberScan {
    /// Members whose lease is still valid, sorted by name.
    pub live: Vec<MemberLease>,
    /// Members whose lease had expired; they were removed by the scan.
    pub evicted: Vec<String>,
}

impl MemberScan {
    pub fn live_names(&self) -> BTreeSet<String> {
        self.live.iter().map(|m| m.consumer.clone()).collect()
    }
}

/// Append-only partition logs with consumer-group delivery tracking.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append a record to `stream`, creating the log if needed. Returns the
    /// store-assigned id.
    async fn append(
        &self,
        stream: &str,
        fields: &RecordFields,
        trim: Option<Trim>,
    ) -> QueueResult<String>;

    /// Create `group`'s delivery cursor on `stream` at the start of the log
    /// if it does not exist yet. Idempotent.
    async fn ensure_group(&self, stream: &str, group: &str) -> QueueResult<()>;

    /// Read up to `max_count` records never delivered to `group`, waiting up
    /// to `block` for at least one. Returned records become pending for
    /// `consumer`.
    async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> QueueResult<Vec<LogRecord>>;

    /// Acknowledge records, removing them from the group's pending set.
    /// Idempotent; returns how many were actually pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> QueueResult<u64>;

    /// Reassign pending records idle for longer than their threshold to
    /// `consumer`, resetting their idle time.
    ///
    /// The threshold is the record's own positive `timeout` field when it has
    /// one, `min_idle` otherwise.
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        max_count: usize,
    ) -> QueueResult<Vec<LogRecord>>;

    /// Pending entries of `group`, oldest first.
    async fn pending(&self, stream: &str, group: &str) -> QueueResult<Vec<PendingEntry>>;

    /// Number of records currently in the log.
    async fn len(&self, stream: &str) -> QueueResult<u64>;
}

/// Shared coordination records.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    // ========================================================================
    // Registries
    // ========================================================================

    /// Add `member` to the set at `key`. Returns true if it was not present.
    async fn set_add(&self, key: &str, member: &str) -> QueueResult<bool>;

    async fn set_members(&self, key: &str) -> QueueResult<BTreeSet<String>>;

    // ========================================================================
    // Partition count
    // ========================================================================

    /// Current value of the count record, `None` if it was never written.
    async fn partition_count(&self, key: &str) -> QueueResult<Option<u32>>;

    /// Compare-and-set: store `n` only if it is greater than the current
    /// value (an absent record counts as 1). Returns the value after the call.
    async fn raise_partition_count(&self, key: &str, n: u32) -> QueueResult<u32>;

    // ========================================================================
    // Membership
    // ========================================================================

    /// Insert `consumer` with a lease of `lease`, unless a member with that
    /// name holds an unexpired lease. Returns false in that case.
    async fn try_register_member(
        &self,
        key: &str,
        consumer: &str,
        lease: Duration,
    ) -> QueueResult<bool>;

    /// Extend `consumer`'s lease. Returns false if the record is missing or
    /// already expired; an expired record is removed.
    async fn renew_member(&self, key: &str, consumer: &str, lease: Duration) -> QueueResult<bool>;

    /// Remove `consumer`. Returns true if it was present.
    async fn remove_member(&self, key: &str, consumer: &str) -> QueueResult<bool>;

    /// Evict expired members and return the remaining ones.
    async fn scan_members(&self, key: &str) -> QueueResult<MemberScan>;

    // ========================================================================
    // Partition claims
    // ========================================================================

    /// Record `consumer` as the reader of `partition`.
    ///
    /// Succeeds if `consumer` is live in `members_key` and the partition is
    /// unclaimed, already claimed by `consumer`, or claimed by a consumer that
    /// is no longer live.
    async fn claim_partition(
        &self,
        owners_key: &str,
        members_key: &str,
        partition: u32,
        consumer: &str,
    ) -> QueueResult<bool>;

    /// Drop the claim on `partition` if `consumer` holds it.
    async fn release_partition(
        &self,
        owners_key: &str,
        partition: u32,
        consumer: &str,
    ) -> QueueResult<bool>;

    /// Drop every claim held by `consumer`. Returns the released partitions.
    async fn release_all(&self, owners_key: &str, consumer: &str) -> QueueResult<Vec<u32>>;

    async fn partition_owners(&self, owners_key: &str) -> QueueResult<BTreeMap<u32, String>>;

    // ========================================================================
    // Notifications
    // ========================================================================

    /// Publish `message` on `channel`. Delivery is best-effort.
    async fn publish(&self, channel: &str, message: &str) -> QueueResult<()>;

    /// Subscribe to `channel`. The stream ends if the subscription is lost.
    async fn subscribe(&self, channel: &str) -> QueueResult<BoxStream<'static, String>>;
}

/// Full store interface needed by producers and consumers.
pub trait QueueStore: LogStore + CoordinationStore {}

impl<T> QueueStore for T where T: LogStore + CoordinationStore {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_implements_queue_store() {
        fn assert_queue_store<T: QueueStore>() {}
        assert_queue_store::<MemoryStore>();
    }

    #[test]
    fn test_member_scan_names() {
        let scan = MemberScan {
            live: vec![
                MemberLease {
                    consumer: "b".to_string(),
                    remaining: Duration::from_secs(1),
                },
                MemberLease {
                    consumer: "a".to_string(),
                    remaining: Duration::from_secs(2),
                },
            ],
            evicted: vec!["c".to_string()],
        };
        let names: Vec<_> = scan.live_names().into_iter().collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
