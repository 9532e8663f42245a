//! Redis Streams backend.
//!
//! Partition logs are Redis streams read through consumer groups
//! (`XADD`/`XREADGROUP`/`XACK`/`XCLAIM`). Coordination records are plain keys:
//!
//! | Record | Redis type |
//! |--------|------------|
//! | Topic and group registries | set |
//! | Partition count | string |
//! | Membership | sorted set, score = lease expiry (server ms) |
//! | Partition claims | hash, partition -> consumer |
//! | Rebalance channel | pub/sub channel |
//!
//! Lease checks run inside Lua scripts against the server clock (`TIME`), so
//! consumers never compare expiries across machines.
//!
//! Blocking reads hold a connection for up to the block time, so they use a
//! small pool of dedicated connections instead of the shared multiplexed one.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use once_cell::sync::Lazy;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamRangeReply, StreamReadReply};
use redis::{Client, Script};
use tokio::sync::Mutex;

use super::{CoordinationStore, LogStore, MemberLease, MemberScan, PendingEntry, Trim};
use crate::error::{QueueError, QueueResult};
use crate::types::{LogRecord, RecordFields};

/// Upper bound on idle dedicated connections kept for blocking reads.
const MAX_IDLE_BLOCKING_CONNECTIONS: usize = 16;

/// How many pending entries are inspected per reclaim pass, per record wanted.
const PENDING_SCAN_FACTOR: usize = 4;

const SERVER_NOW_MS: &str = r"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
";

static RAISE_COUNT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
local current = tonumber(redis.call('GET', KEYS[1])) or 1
local requested = tonumber(ARGV[1])
if requested > current then
  redis.call('SET', KEYS[1], requested)
  return requested
end
return current
",
    )
});

static REGISTER_MEMBER: Lazy<Script> = Lazy::new(|| {
    Script::new(&format!(
        r"{SERVER_NOW_MS}
local expiry = redis.call('ZSCORE', KEYS[1], ARGV[1])
if expiry and tonumber(expiry) > now then
  return 0
end
redis.call('ZADD', KEYS[1], now + tonumber(ARGV[2]), ARGV[1])
return 1
"
    ))
});

static RENEW_MEMBER: Lazy<Script> = Lazy::new(|| {
    Script::new(&format!(
        r"{SERVER_NOW_MS}
local expiry = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not expiry then
  return 0
end
if tonumber(expiry) <= now then
  redis.call('ZREM', KEYS[1], ARGV[1])
  return 0
end
redis.call('ZADD', KEYS[1], now + tonumber(ARGV[2]), ARGV[1])
return 1
"
    ))
});

static SCAN_MEMBERS: Lazy<Script> = Lazy::new(|| {
    Script::new(&format!(
        r"{SERVER_NOW_MS}
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now)
if #expired > 0 then
  redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now)
end
local members = redis.call('ZRANGE', KEYS[1], 0, -1, 'WITHSCORES')
local live = {{}}
for i = 1, #members, 2 do
  live[#live + 1] = members[i]
  live[#live + 1] = tostring(tonumber(members[i + 1]) - now)
end
return {{expired, live}}
"
    ))
});

static CLAIM_PARTITION: Lazy<Script> = Lazy::new(|| {
    Script::new(&format!(
        r"{SERVER_NOW_MS}
local function live(name)
  local expiry = redis.call('ZSCORE', KEYS[2], name)
  return expiry and tonumber(expiry) > now
end
if not live(ARGV[2]) then
  return 0
end
local holder = redis.call('HGET', KEYS[1], ARGV[1])
if holder and holder ~= ARGV[2] and live(holder) then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
return 1
"
    ))
});

static RELEASE_PARTITION: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
  redis.call('HDEL', KEYS[1], ARGV[1])
  return 1
end
return 0
",
    )
});

static RELEASE_ALL: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
local owners = redis.call('HGETALL', KEYS[1])
local released = {}
for i = 1, #owners, 2 do
  if owners[i + 1] == ARGV[1] then
    redis.call('HDEL', KEYS[1], owners[i])
    released[#released + 1] = owners[i]
  end
end
return released
",
    )
});

/// [`LogStore`] and [`CoordinationStore`] on a Redis server.
pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
    blocking: Mutex<Vec<MultiplexedConnection>>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("client", &self.client.get_connection_info().addr)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect using a `redis://` URL.
    pub async fn connect(url: &str) -> QueueResult<Self> {
        let client = Client::open(url)
            .map_err(|e| QueueError::Connection(format!("failed to parse URL: {e}")))?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::info!(url, "Connected to Redis");
        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(Vec::new()),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    async fn take_blocking_conn(&self) -> QueueResult<MultiplexedConnection> {
        if let Some(conn) = self.blocking.lock().await.pop() {
            return Ok(conn);
        }
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn return_blocking_conn(&self, conn: MultiplexedConnection) {
        let mut pool = self.blocking.lock().await;
        if pool.len() < MAX_IDLE_BLOCKING_CONNECTIONS {
            pool.push(conn);
        }
    }

    async fn fetch_record(&self, stream: &str, id: &str) -> QueueResult<Option<LogRecord>> {
        let reply: StreamRangeReply = redis::cmd("XRANGE")
            .arg(stream)
            .arg(id)
            .arg(id)
            .query_async(&mut self.conn())
            .await?;
        reply.ids.into_iter().next().map(to_record).transpose()
    }
}

fn to_record(entry: StreamId) -> QueueResult<LogRecord> {
    let mut fields = RecordFields::new();
    for (name, value) in entry.map {
        let value: String =
            redis::from_redis_value(&value).map_err(|e| QueueError::MalformedRecord {
                id: entry.id.clone(),
                reason: format!("field {name}: {e}"),
            })?;
        fields.insert(name, value);
    }
    Ok(LogRecord::new(entry.id, fields))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl LogStore for RedisStore {
    async fn append(
        &self,
        stream: &str,
        fields: &RecordFields,
        trim: Option<Trim>,
    ) -> QueueResult<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(trim) = trim {
            cmd.arg("MAXLEN");
            if trim.approximate {
                cmd.arg("~");
            }
            cmd.arg(trim.max_len);
        }
        cmd.arg("*");
        for (name, value) in fields {
            cmd.arg(name).arg(value);
        }
        Ok(cmd.query_async(&mut self.conn()).await?)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> QueueResult<()> {
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut self.conn())
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> QueueResult<Vec<LogRecord>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(max_count);
        // BLOCK 0 would wait forever.
        let blocking = !block.is_zero();
        if blocking {
            cmd.arg("BLOCK").arg(millis(block).max(1));
        }
        cmd.arg("STREAMS").arg(stream).arg(">");

        let reply: Option<StreamReadReply> = if blocking {
            let mut conn = self.take_blocking_conn().await?;
            let reply = cmd.query_async(&mut conn).await;
            if reply.is_ok() {
                self.return_blocking_conn(conn).await;
            }
            reply?
        } else {
            cmd.query_async(&mut self.conn()).await?
        };

        reply
            .map(|reply| reply.keys.into_iter().flat_map(|key| key.ids))
            .into_iter()
            .flatten()
            .map(to_record)
            .collect()
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> QueueResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        Ok(redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(ids)
            .query_async(&mut self.conn())
            .await?)
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        max_count: usize,
    ) -> QueueResult<Vec<LogRecord>> {
        let candidates: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(max_count.saturating_mul(PENDING_SCAN_FACTOR))
            .query_async(&mut self.conn())
            .await?;

        let mut claimed = Vec::new();
        for (id, _owner, idle_ms, _deliveries) in candidates {
            if claimed.len() >= max_count {
                break;
            }
            let Some(record) = self.fetch_record(stream, &id).await? else {
                // Trimmed away; nothing left to deliver.
                self.ack(stream, group, std::slice::from_ref(&id)).await?;
                continue;
            };
            let threshold = record.timeout().unwrap_or(min_idle);
            if idle_ms < millis(threshold) {
                continue;
            }
            // XCLAIM re-checks idleness atomically.
            let reply: StreamClaimReply = redis::cmd("XCLAIM")
                .arg(stream)
                .arg(group)
                .arg(consumer)
                .arg(millis(threshold))
                .arg(&id)
                .query_async(&mut self.conn())
                .await?;
            for entry in reply.ids {
                claimed.push(to_record(entry)?);
            }
        }
        Ok(claimed)
    }

    async fn pending(&self, stream: &str, group: &str) -> QueueResult<Vec<PendingEntry>> {
        let entries: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(10_000)
            .query_async(&mut self.conn())
            .await?;
        Ok(entries
            .into_iter()
            .map(|(id, consumer, idle_ms, delivery_count)| PendingEntry {
                id,
                consumer,
                idle: Duration::from_millis(idle_ms),
                delivery_count,
            })
            .collect())
    }

    async fn len(&self, stream: &str) -> QueueResult<u64> {
        Ok(redis::cmd("XLEN")
            .arg(stream)
            .query_async(&mut self.conn())
            .await?)
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn set_add(&self, key: &str, member: &str) -> QueueResult<bool> {
        let added: i64 = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn())
            .await?;
        Ok(added > 0)
    }

    async fn set_members(&self, key: &str) -> QueueResult<BTreeSet<String>> {
        Ok(redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut self.conn())
            .await?)
    }

    async fn partition_count(&self, key: &str) -> QueueResult<Option<u32>> {
        Ok(redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn())
            .await?)
    }

    async fn raise_partition_count(&self, key: &str, n: u32) -> QueueResult<u32> {
        Ok(RAISE_COUNT
            .key(key)
            .arg(n)
            .invoke_async(&mut self.conn())
            .await?)
    }

    async fn try_register_member(
        &self,
        key: &str,
        consumer: &str,
        lease: Duration,
    ) -> QueueResult<bool> {
        let registered: i64 = REGISTER_MEMBER
            .key(key)
            .arg(consumer)
            .arg(millis(lease))
            .invoke_async(&mut self.conn())
            .await?;
        Ok(registered == 1)
    }

    async fn renew_member(&self, key: &str, consumer: &str, lease: Duration) -> QueueResult<bool> {
        let renewed: i64 = RENEW_MEMBER
            .key(key)
            .arg(consumer)
            .arg(millis(lease))
            .invoke_async(&mut self.conn())
            .await?;
        Ok(renewed == 1)
    }

    async fn remove_member(&self, key: &str, consumer: &str) -> QueueResult<bool> {
        let removed: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(consumer)
            .query_async(&mut self.conn())
            .await?;
        Ok(removed > 0)
    }

    async fn scan_members(&self, key: &str) -> QueueResult<MemberScan> {
        let (evicted, flat): (Vec<String>, Vec<String>) = SCAN_MEMBERS
            .key(key)
            .invoke_async(&mut self.conn())
            .await?;

        let mut live: Vec<MemberLease> = flat
            .chunks_exact(2)
            .map(|pair| MemberLease {
                consumer: pair[0].clone(),
                remaining: Duration::from_millis(pair[1].parse::<f64>().unwrap_or(0.0) as u64),
            })
            .collect();
        live.sort_by(|a, b| a.consumer.cmp(&b.consumer));
        Ok(MemberScan { live, evicted })
    }

    async fn claim_partition(
        &self,
        owners_key: &str,
        members_key: &str,
        partition: u32,
        consumer: &str,
    ) -> QueueResult<bool> {
        let claimed: i64 = CLAIM_PARTITION
            .key(owners_key)
            .key(members_key)
            .arg(partition)
            .arg(consumer)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(claimed == 1)
    }

    async fn release_partition(
        &self,
        owners_key: &str,
        partition: u32,
        consumer: &str,
    ) -> QueueResult<bool> {
        let released: i64 = RELEASE_PARTITION
            .key(owners_key)
            .arg(partition)
            .arg(consumer)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(released == 1)
    }

    async fn release_all(&self, owners_key: &str, consumer: &str) -> QueueResult<Vec<u32>> {
        let released: Vec<String> = RELEASE_ALL
            .key(owners_key)
            .arg(consumer)
            .invoke_async(&mut self.conn())
            .await?;
        let mut partitions: Vec<u32> = released.iter().filter_map(|p| p.parse().ok()).collect();
        partitions.sort_unstable();
        Ok(partitions)
    }

    async fn partition_owners(&self, owners_key: &str) -> QueueResult<BTreeMap<u32, String>> {
        let owners: BTreeMap<String, String> = redis::cmd("HGETALL")
            .arg(owners_key)
            .query_async(&mut self.conn())
            .await?;
        Ok(owners
            .into_iter()
            .filter_map(|(partition, consumer)| Some((partition.parse().ok()?, consumer)))
            .collect())
    }

    async fn publish(&self, channel: &str, message: &str) -> QueueResult<()> {
        let _receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> QueueResult<BoxStream<'static, String>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        Ok(pubsub
            .into_on_message()
            .map(|msg| msg.get_payload::<String>().unwrap_or_default())
            .boxed())
    }
}
