//! In-process store.
//!
//! Implements both store traits on plain maps behind async mutexes. Every
//! contract of the traits holds here as it does on a networked backend:
//! delivery tracking with idle times, lease expiry, compare-and-set partition
//! counts and claims, and a broadcast notification channel. Clones share the
//! same state, so a producer and several consumers handed clones of one
//! `MemoryStore` behave like separate processes against one server.
//!
//! Time is measured with `tokio::time::Instant`, so tests may pause and
//! advance the clock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::time::Instant;

use super::{CoordinationStore, LogStore, MemberLease, MemberScan, PendingEntry, Trim};
use crate::constants::NOTIFICATION_CHANNEL_CAPACITY;
use crate::error::{QueueError, QueueResult};
use crate::types::{LogRecord, RecordFields};

/// Per-log state.
#[derive(Debug, Default)]
struct Stream {
    last_seq: u64,
    entries: BTreeMap<u64, RecordFields>,
    groups: HashMap<String, GroupCursor>,
}

/// Per-group delivery state on one log.
#[derive(Debug, Default)]
struct GroupCursor {
    last_delivered: u64,
    pending: BTreeMap<u64, Pending>,
}

#[derive(Debug, Clone)]
struct Pending {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct Coordination {
    sets: HashMap<String, BTreeSet<String>>,
    counts: HashMap<String, u32>,
    /// key -> consumer -> lease expiry
    members: HashMap<String, BTreeMap<String, Instant>>,
    /// key -> partition -> consumer
    owners: HashMap<String, BTreeMap<u32, String>>,
}

impl Coordination {
    fn is_live(&self, members_key: &str, consumer: &str, now: Instant) -> bool {
        self.members
            .get(members_key)
            .and_then(|members| members.get(consumer))
            .is_some_and(|expiry| *expiry > now)
    }
}

#[derive(Default)]
struct Inner {
    logs: Mutex<HashMap<String, Stream>>,
    coordination: Mutex<Coordination>,
    wakers: DashMap<String, Arc<Notify>>,
    channels: DashMap<String, broadcast::Sender<String>>,
    offline: AtomicBool,
    /// Calls left before going offline, plus one. Zero when disarmed.
    offline_after: AtomicU64,
}

/// In-process implementation of [`LogStore`] and [`CoordinationStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("offline", &self.inner.offline.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`QueueError::Connection`] until set back.
    ///
    /// Used to simulate an unreachable store.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline_after.store(0, Ordering::SeqCst);
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Let `calls` more calls succeed, then behave as
    /// [`set_offline(true)`](Self::set_offline).
    pub fn set_offline_after(&self, calls: u64) {
        self.inner.offline.store(false, Ordering::SeqCst);
        self.inner.offline_after.store(calls + 1, Ordering::SeqCst);
    }

    fn check_online(&self) -> QueueResult<()> {
        let tripped = self
            .inner
            .offline_after
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            == Ok(1);
        if tripped {
            self.inner.offline.store(true, Ordering::SeqCst);
        }
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(QueueError::Connection("memory store is offline".to_string()));
        }
        Ok(())
    }

    fn waker(&self, stream: &str) -> Arc<Notify> {
        self.inner
            .wakers
            .entry(stream.to_string())
            .or_default()
            .clone()
    }

    fn channel(&self, channel: &str) -> broadcast::Sender<String> {
        self.inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Deliver never-delivered entries of `stream` to `consumer`.
    async fn deliver(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Vec<LogRecord> {
        let mut logs = self.inner.logs.lock().await;
        let log = logs.entry(stream.to_string()).or_default();
        let Stream {
            entries, groups, ..
        } = log;
        let cursor = groups.entry(group.to_string()).or_default();

        let now = Instant::now();
        let mut records = Vec::new();
        for (seq, fields) in entries.range(cursor.last_delivered + 1..).take(max_count) {
            cursor.last_delivered = *seq;
            cursor.pending.insert(
                *seq,
                Pending {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            records.push(LogRecord::new(format_id(*seq), fields.clone()));
        }
        records
    }
}

fn format_id(seq: u64) -> String {
    format!("{seq}-0")
}

fn parse_id(id: &str) -> Option<u64> {
    let seq = id.split_once('-').map_or(id, |(seq, _)| seq);
    seq.parse().ok()
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn append(
        &self,
        stream: &str,
        fields: &RecordFields,
        trim: Option<Trim>,
    ) -> QueueResult<String> {
        self.check_online()?;
        let id = {
            let mut logs = self.inner.logs.lock().await;
            let log = logs.entry(stream.to_string()).or_default();
            log.last_seq += 1;
            let seq = log.last_seq;
            log.entries.insert(seq, fields.clone());

            if let Some(trim) = trim {
                while log.entries.len() > trim.max_len.max(1) {
                    log.entries.pop_first();
                }
            }
            format_id(seq)
        };
        self.waker(stream).notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> QueueResult<()> {
        self.check_online()?;
        let mut logs = self.inner.logs.lock().await;
        logs.entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> QueueResult<Vec<LogRecord>> {
        self.check_online()?;
        let deadline = Instant::now() + block;
        let waker = self.waker(stream);

        loop {
            let notified = waker.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let records = self.deliver(stream, group, consumer, max_count).await;
            if !records.is_empty() {
                return Ok(records);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(records);
            }
            let _ = tokio::time::timeout(remaining, notified).await;
            self.check_online()?;
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> QueueResult<u64> {
        self.check_online()?;
        let mut logs = self.inner.logs.lock().await;
        let Some(cursor) = logs
            .get_mut(stream)
            .and_then(|log| log.groups.get_mut(group))
        else {
            return Ok(0);
        };

        let acked = ids
            .iter()
            .filter_map(|id| parse_id(id))
            .filter(|seq| cursor.pending.remove(seq).is_some())
            .count();
        Ok(acked as u64)
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        max_count: usize,
    ) -> QueueResult<Vec<LogRecord>> {
        self.check_online()?;
        let mut logs = self.inner.logs.lock().await;
        let Some(log) = logs.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Stream {
            entries, groups, ..
        } = log;
        let Some(cursor) = groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut claimed = Vec::new();
        let mut trimmed = Vec::new();
        for (seq, pending) in cursor.pending.iter_mut() {
            if claimed.len() >= max_count {
                break;
            }
            let Some(fields) = entries.get(seq) else {
                trimmed.push(*seq);
                continue;
            };
            let record = LogRecord::new(format_id(*seq), fields.clone());
            let threshold = record.timeout().unwrap_or(min_idle);
            if now.duration_since(pending.delivered_at) < threshold {
                continue;
            }
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.delivery_count += 1;
            claimed.push(record);
        }
        for seq in trimmed {
            cursor.pending.remove(&seq);
        }
        Ok(claimed)
    }

    async fn pending(&self, stream: &str, group: &str) -> QueueResult<Vec<PendingEntry>> {
        self.check_online()?;
        let logs = self.inner.logs.lock().await;
        let now = Instant::now();
        Ok(logs
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .map(|cursor| {
                cursor
                    .pending
                    .iter()
                    .map(|(seq, pending)| PendingEntry {
                        id: format_id(*seq),
                        consumer: pending.consumer.clone(),
                        idle: now.duration_since(pending.delivered_at),
                        delivery_count: pending.delivery_count,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn len(&self, stream: &str) -> QueueResult<u64> {
        self.check_online()?;
        let logs = self.inner.logs.lock().await;
        Ok(logs.get(stream).map_or(0, |log| log.entries.len() as u64))
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn set_add(&self, key: &str, member: &str) -> QueueResult<bool> {
        self.check_online()?;
        let mut state = self.inner.coordination.lock().await;
        Ok(state
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_members(&self, key: &str) -> QueueResult<BTreeSet<String>> {
        self.check_online()?;
        let state = self.inner.coordination.lock().await;
        Ok(state.sets.get(key).cloned().unwrap_or_default())
    }

    async fn partition_count(&self, key: &str) -> QueueResult<Option<u32>> {
        self.check_online()?;
        let state = self.inner.coordination.lock().await;
        Ok(state.counts.get(key).copied())
    }

    async fn raise_partition_count(&self, key: &str, n: u32) -> QueueResult<u32> {
        self.check_online()?;
        let mut state = self.inner.coordination.lock().await;
        let current = state.counts.get(key).copied().unwrap_or(1);
        if n > current {
            state.counts.insert(key.to_string(), n);
            Ok(n)
        } else {
            Ok(current)
        }
    }

    async fn try_register_member(
        &self,
        key: &str,
        consumer: &str,
        lease: Duration,
    ) -> QueueResult<bool> {
        self.check_online()?;
        let mut state = self.inner.coordination.lock().await;
        let now = Instant::now();
        let members = state.members.entry(key.to_string()).or_default();
        if members.get(consumer).is_some_and(|expiry| *expiry > now) {
            return Ok(false);
        }
        members.insert(consumer.to_string(), now + lease);
        Ok(true)
    }

    async fn renew_member(&self, key: &str, consumer: &str, lease: Duration) -> QueueResult<bool> {
        self.check_online()?;
        let mut state = self.inner.coordination.lock().await;
        let now = Instant::now();
        let Some(members) = state.members.get_mut(key) else {
            return Ok(false);
        };
        match members.get_mut(consumer) {
            Some(expiry) if *expiry > now => {
                *expiry = now + lease;
                Ok(true)
            }
            Some(_) => {
                members.remove(consumer);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn remove_member(&self, key: &str, consumer: &str) -> QueueResult<bool> {
        self.check_online()?;
        let mut state = self.inner.coordination.lock().await;
        Ok(state
            .members
            .get_mut(key)
            .is_some_and(|members| members.remove(consumer).is_some()))
    }

    async fn scan_members(&self, key: &str) -> QueueResult<MemberScan> {
        self.check_online()?;
        let mut state = self.inner.coordination.lock().await;
        let now = Instant::now();
        let Some(members) = state.members.get_mut(key) else {
            return Ok(MemberScan::default());
        };

        let evicted: Vec<String> = members
            .iter()
            .filter(|(_, expiry)| **expiry <= now)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &evicted {
            members.remove(name);
        }

        let live = members
            .iter()
            .map(|(name, expiry)| MemberLease {
                consumer: name.clone(),
                remaining: expiry.saturating_duration_since(now),
            })
            .collect();
        Ok(MemberScan { live, evicted })
    }

    async fn claim_partition(
        &self,
        owners_key: &str,
        members_key: &str,
        partition: u32,
        consumer: &str,
    ) -> QueueResult<bool> {
        self.check_online()?;
        let mut state = self.inner.coordination.lock().await;
        let now = Instant::now();
        if !state.is_live(members_key, consumer, now) {
            return Ok(false);
        }

        let holder = state
            .owners
            .get(owners_key)
            .and_then(|owners| owners.get(&partition))
            .cloned();
        let claimable = match holder {
            None => true,
            Some(holder) if holder == consumer => true,
            Some(holder) => !state.is_live(members_key, &holder, now),
        };
        if claimable {
            state
                .owners
                .entry(owners_key.to_string())
                .or_default()
                .insert(partition, consumer.to_string());
        }
        Ok(claimable)
    }

    async fn release_partition(
        &self,
        owners_key: &str,
        partition: u32,
        consumer: &str,
    ) -> QueueResult<bool> {
        self.check_online()?;
        let mut state = self.inner.coordination.lock().await;
        let Some(owners) = state.owners.get_mut(owners_key) else {
            return Ok(false);
        };
        if owners.get(&partition).is_some_and(|holder| holder == consumer) {
            owners.remove(&partition);
            return Ok(true);
        }
        Ok(false)
    }

    async fn release_all(&self, owners_key: &str, consumer: &str) -> QueueResult<Vec<u32>> {
        self.check_online()?;
        let mut state = self.inner.coordination.lock().await;
        let Some(owners) = state.owners.get_mut(owners_key) else {
            return Ok(Vec::new());
        };
        let released: Vec<u32> = owners
            .iter()
            .filter(|(_, holder)| *holder == consumer)
            .map(|(partition, _)| *partition)
            .collect();
        for partition in &released {
            owners.remove(partition);
        }
        Ok(released)
    }

    async fn partition_owners(&self, owners_key: &str) -> QueueResult<BTreeMap<u32, String>> {
        self.check_online()?;
        let state = self.inner.coordination.lock().await;
        Ok(state.owners.get(owners_key).cloned().unwrap_or_default())
    }

    async fn publish(&self, channel: &str, message: &str) -> QueueResult<()> {
        self.check_online()?;
        // No subscribers is not an error.
        let _ = self.channel(channel).send(message.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> QueueResult<BoxStream<'static, String>> {
        self.check_online()?;
        let rx = self.channel(channel).subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(message) => Some((message, rx)),
                // Missed messages only mean "something changed".
                Err(broadcast::error::RecvError::Lagged(_)) => Some((String::new(), rx)),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        Ok(stream.boxed())
    }
}
