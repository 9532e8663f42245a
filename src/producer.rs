//! Job producer.
//!
//! A [`Producer`] writes jobs of one topic into the topic's partition logs.
//! On [`connect`](Producer::connect) it registers the topic and makes sure
//! the topic has at least `init_partitions` partitions. Each enqueue then
//! reads the current partition count, picks a partition with
//! [`crate::router::route`] and appends the job.
//!
//! Enqueues of one producer are serialized: the round-robin cursor advances
//! once per appended job, in call order, batches included.
//!
//! Appends are not retried. A failed append surfaces to the caller, who
//! decides whether to enqueue again (and risk a duplicate job).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{ProducerConfig, config_error};
use crate::constants::MAX_PARTITIONS;
use crate::error::{QueueError, QueueResult};
use crate::keys::{TopicKeys, topics_registry_key};
use crate::metrics;
use crate::registry::{RebalanceEvent, notify_all_groups};
use crate::retry::with_store_policy;
use crate::router;
use crate::store::{QueueStore, Trim};
use crate::types::Job;

/// Per-call enqueue settings. Unset fields fall back to the producer config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Payload field whose value picks the partition. Jobs sharing the value
    /// share a partition.
    pub routing_key: Option<String>,
    pub timeout: Option<Duration>,
    /// Cap the partition log at this many entries.
    pub max_len: Option<usize>,
    pub approximate: Option<bool>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    pub fn approximate(mut self, approximate: bool) -> Self {
        self.approximate = Some(approximate);
        self
    }
}

/// Producer for one topic.
pub struct Producer<S: ?Sized> {
    store: Arc<S>,
    config: ProducerConfig,
    keys: TopicKeys,
    connected: AtomicBool,
    /// Partition of the last appended job.
    cursor: Mutex<Option<u32>>,
}

impl<S> Producer<S>
where
    S: QueueStore + ?Sized,
{
    pub fn new(store: Arc<S>, config: ProducerConfig) -> Self {
        let keys = TopicKeys::new(&config.topic);
        Self {
            store,
            config,
            keys,
            connected: AtomicBool::new(false),
            cursor: Mutex::new(None),
        }
    }

    pub fn topic(&self) -> &str {
        &self.keys.topic
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Register the topic and ensure it has `init_partitions` partitions.
    pub async fn connect(&self) -> QueueResult<()> {
        self.config.validate().map_err(config_error)?;

        let registry_key = topics_registry_key();
        let added = with_store_policy("register_topic", || {
            self.store.set_add(&registry_key, &self.keys.topic)
        })
        .await?;
        if added {
            info!(topic = %self.keys.topic, "Registered new topic");
        }

        self.connected.store(true, Ordering::SeqCst);
        let count = match self.bootstrap(self.config.init_partitions).await {
            Ok(count) => count,
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        info!(topic = %self.keys.topic, partition_count = count, "Producer connected");
        Ok(())
    }

    /// Disconnect. Later calls fail with [`QueueError::NotConnected`].
    pub async fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!(topic = %self.keys.topic, "Producer closed");
        }
    }

    fn ensure_connected(&self) -> QueueResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(QueueError::NotConnected)
        }
    }

    /// Ensure the topic has at least `min_partitions` partitions. Returns the
    /// resulting count.
    pub async fn bootstrap(&self, min_partitions: u32) -> QueueResult<u32> {
        let current = self.partition_count().await?;
        if min_partitions > current {
            self.request_partition_increase(min_partitions).await
        } else {
            Ok(current)
        }
    }

    /// Current partition count of the topic. A topic with no count record
    /// has one partition.
    pub async fn partition_count(&self) -> QueueResult<u32> {
        self.ensure_connected()?;
        let count = with_store_policy("partition_count", || {
            self.store.partition_count(&self.keys.partition_count_key)
        })
        .await?
        .unwrap_or(1)
        .max(1);
        metrics::set_partition_count(&self.keys.topic, count);
        Ok(count)
    }

    /// Raise the partition count to `n` if it is currently lower.
    ///
    /// Never lowers the count. Returns the count after the call. Consumer
    /// groups of the topic are notified when the count actually changed.
    pub async fn request_partition_increase(&self, n: u32) -> QueueResult<u32> {
        self.ensure_connected()?;
        if n == 0 || n > MAX_PARTITIONS {
            return Err(QueueError::InvalidPartitionCount {
                topic: self.keys.topic.clone(),
                requested: n,
            });
        }

        let before = self
            .store
            .partition_count(&self.keys.partition_count_key)
            .await?
            .unwrap_or(1);
        let after = self
            .store
            .raise_partition_count(&self.keys.partition_count_key, n)
            .await?;
        let increased = after > before && after == n;
        metrics::record_partition_increase(&self.keys.topic, increased);
        metrics::set_partition_count(&self.keys.topic, after);

        if increased {
            info!(
                topic = %self.keys.topic,
                from = before,
                to = after,
                "Partition count increased"
            );
            let event = RebalanceEvent::PartitionsIncreased {
                partition_count: after,
            };
            notify_all_groups(self.store.as_ref(), &self.keys, &event).await;
        } else {
            debug!(
                topic = %self.keys.topic,
                requested = n,
                current = after,
                "Partition count not increased"
            );
        }
        Ok(after)
    }

    /// Enqueue one job. Returns the job as appended, with its partition and
    /// store id set.
    pub async fn enqueue<T>(&self, payload: &T, options: &EnqueueOptions) -> QueueResult<Job>
    where
        T: Serialize + ?Sized,
    {
        self.ensure_connected()?;
        let job = self.build_job(payload, options).inspect_err(|e| {
            metrics::record_enqueue_error(&self.keys.topic, e);
        })?;

        let mut cursor = self.cursor.lock().await;
        match self.append_job(job, options, &mut cursor).await {
            Ok(job) => {
                metrics::record_enqueue(&self.keys.topic, 1);
                Ok(job)
            }
            Err(e) => {
                metrics::record_enqueue_error(&self.keys.topic, &e);
                Err(e)
            }
        }
    }

    /// Enqueue several jobs in order.
    ///
    /// Every payload is checked against the routing key before anything is
    /// appended. If the store fails part way, the jobs appended so far stay
    /// and [`QueueError::PartialBatch`] lists them.
    pub async fn batch_enqueue<T>(
        &self,
        payloads: &[T],
        options: &EnqueueOptions,
    ) -> QueueResult<Vec<Job>>
    where
        T: Serialize,
    {
        self.ensure_connected()?;
        let jobs = payloads
            .iter()
            .map(|payload| self.build_job(payload, options))
            .collect::<QueueResult<Vec<_>>>()
            .inspect_err(|e| metrics::record_enqueue_error(&self.keys.topic, e))?;

        let total = jobs.len();
        let mut appended = Vec::with_capacity(total);
        let mut cursor = self.cursor.lock().await;
        for job in jobs {
            match self.append_job(job, options, &mut cursor).await {
                Ok(job) => appended.push(job),
                Err(e) => {
                    metrics::record_enqueue(&self.keys.topic, appended.len() as u64);
                    metrics::record_enqueue_error(&self.keys.topic, &e);
                    let failed = total - appended.len();
                    warn!(
                        topic = %self.keys.topic,
                        enqueued = appended.len(),
                        failed,
                        error = %e,
                        "Batch enqueue stopped part way"
                    );
                    return Err(QueueError::PartialBatch {
                        enqueued: appended.into_iter().map(|job| job.id).collect(),
                        failed,
                        source: Box::new(e),
                    });
                }
            }
        }

        metrics::record_enqueue(&self.keys.topic, appended.len() as u64);
        Ok(appended)
    }

    fn build_job<T>(&self, payload: &T, options: &EnqueueOptions) -> QueueResult<Job>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload)?;
        let timeout = options.timeout.unwrap_or(self.config.default_timeout);
        Job::new(
            &self.keys.topic,
            payload,
            options.routing_key.as_deref(),
            timeout,
        )
    }

    fn trim(&self, options: &EnqueueOptions) -> Option<Trim> {
        options.max_len.or(self.config.max_len).map(|max_len| Trim {
            max_len,
            approximate: options.approximate.unwrap_or(self.config.approximate_trim),
        })
    }

    async fn append_job(
        &self,
        mut job: Job,
        options: &EnqueueOptions,
        cursor: &mut Option<u32>,
    ) -> QueueResult<Job> {
        let partition_count = self.partition_count().await?;
        let partition = router::route(
            &job.payload,
            job.routing_key.as_deref(),
            partition_count,
            *cursor,
        )?;

        job.partition = Some(partition);
        job.enqueued_at = Some(Utc::now().timestamp());
        let fields = job.to_fields()?;
        let stream = self.keys.stream_key(partition);

        let record_id = self
            .store
            .append(&stream, &fields, self.trim(options))
            .await
            .inspect_err(|_| metrics::record_store_error("append"))?;
        *cursor = Some(partition);
        job.record_id = Some(record_id);

        debug!(
            topic = %self.keys.topic,
            partition,
            job_id = %job.id,
            record_id = ?job.record_id,
            "Enqueued job"
        );
        Ok(job)
    }
}
