//! Partition routing.
//!
//! Jobs with a routing key are hashed: the key's payload value is rendered to
//! text, digested with MD5, and the 128-bit digest (big-endian) is reduced
//! modulo the partition count. Every producer, in any process, therefore
//! sends the same key value to the same partition for as long as the count
//! does not change.
//!
//! Jobs without a routing key go round-robin, continuing after the partition
//! the producer used last.

use serde_json::Value;

use crate::error::{QueueError, QueueResult};

/// Pick the partition for a payload.
///
/// `last_partition` is the partition of the producer's previous enqueue, or
/// `None` for a fresh producer. `partition_count` is clamped to at least 1.
pub fn route(
    payload: &Value,
    routing_key: Option<&str>,
    partition_count: u32,
    last_partition: Option<u32>,
) -> QueueResult<u32> {
    let partition_count = partition_count.max(1);
    match routing_key.filter(|key| !key.is_empty()) {
        Some(key) => {
            let value = payload.get(key).ok_or_else(|| QueueError::RoutingKey {
                key: key.to_string(),
            })?;
            Ok(hash_partition(value, partition_count))
        }
        None => Ok(next_round_robin(last_partition, partition_count)),
    }
}

/// MD5-based partition of a routing-key value.
pub fn hash_partition(value: &Value, partition_count: u32) -> u32 {
    let digest = md5::compute(routing_text(value).as_bytes());
    let hash = u128::from_be_bytes(digest.0);
    (hash % u128::from(partition_count.max(1))) as u32
}

/// Partition after `last`, wrapping at `partition_count`.
///
/// `last` may be out of range if the count changed since it was recorded.
pub fn next_round_robin(last: Option<u32>, partition_count: u32) -> u32 {
    let partition_count = partition_count.max(1);
    match last {
        None => 0,
        Some(last) => ((u64::from(last) + 1) % u64::from(partition_count)) as u32,
    }
}

/// Text that is hashed for a routing-key value.
///
/// Strings hash their raw text, so `"a@x.com"` and `a@x.com` are the same key;
/// any other value hashes its compact JSON form. Booleans and null therefore
/// hash as `true`, `false` and `null`, not the `True` / `None` spelling of
/// Python producers, so such keys do not co-locate across the two.
fn routing_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
