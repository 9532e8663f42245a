//! Per-partition read loop.
//!
//! A worker owns one partition of the group for as long as the control loop
//! keeps it running. Each round it first reclaims records left pending past
//! their timeout, and only reads new records when there is nothing to
//! reclaim. Records are handed to the callback in log order and only
//! successfully handled ones are acknowledged.
//!
//! Stopping a worker cancels a blocked read but never a running callback:
//! the stop signal is checked between records.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::handler::{Dispatch, Outcome, run_guarded};
use super::lease::LeaseFence;
use crate::constants::{FENCED_POLL_INTERVAL_MS, WORKER_ERROR_BACKOFF_MS};
use crate::error::QueueResult;
use crate::metrics;
use crate::retry::with_store_policy;
use crate::store::LogStore;
use crate::types::{Job, LogRecord};

/// Everything a worker needs to read one partition.
pub(crate) struct WorkerContext<S: ?Sized> {
    pub store: Arc<S>,
    pub topic: String,
    pub group: String,
    pub consumer: String,
    pub partition: u32,
    pub stream: String,
    pub batch_size: usize,
    pub read_block: Duration,
    pub claim_min_idle: Duration,
    pub fence: Arc<LeaseFence>,
    pub dispatch: Dispatch,
}

/// A running worker.
pub(crate) struct WorkerHandle {
    partition: u32,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn spawn<S>(ctx: WorkerContext<S>) -> Self
    where
        S: LogStore + ?Sized + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let partition = ctx.partition;
        let handle = tokio::spawn(run(ctx, stop_rx));
        Self {
            partition,
            stop_tx,
            handle,
        }
    }

    pub(crate) fn partition(&self) -> u32 {
        self.partition
    }

    /// True if the worker ended without being stopped.
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the worker without waiting for it.
    pub(crate) fn signal_stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Stop the worker and wait for its in-flight callback, at most `grace`.
    ///
    /// Returns `false` if the worker had to be aborted.
    pub(crate) async fn stop(mut self, grace: Duration) -> bool {
        self.signal_stop();
        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(partition = self.partition, error = %e, "Partition worker panicked");
                true
            }
            Err(_) => {
                warn!(
                    partition = self.partition,
                    grace_ms = grace.as_millis() as u64,
                    "Partition worker did not stop within grace period, aborting"
                );
                self.handle.abort();
                false
            }
        }
    }
}

fn stop_requested(stop_rx: &watch::Receiver<bool>) -> bool {
    *stop_rx.borrow()
}

/// Sleep for `duration` unless stopped first. Returns `false` on stop.
async fn pause(stop_rx: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = stop_rx.changed() => false,
    }
}

async fn run<S>(ctx: WorkerContext<S>, mut stop_rx: watch::Receiver<bool>)
where
    S: LogStore + ?Sized,
{
    info!(
        topic = %ctx.topic,
        group = %ctx.group,
        consumer = %ctx.consumer,
        partition = ctx.partition,
        "Partition worker started"
    );
    let error_backoff = Duration::from_millis(WORKER_ERROR_BACKOFF_MS);

    while !stop_requested(&stop_rx) {
        if !ctx.fence.allows_reads() {
            if !pause(&mut stop_rx, Duration::from_millis(FENCED_POLL_INTERVAL_MS)).await {
                break;
            }
            continue;
        }

        let records = match ctx.reclaim().await {
            Ok(records) if !records.is_empty() => records,
            Ok(_) => {
                let read = tokio::select! {
                    read = ctx.read() => read,
                    _ = stop_rx.changed() => break,
                };
                match read {
                    Ok(records) => records,
                    Err(e) => {
                        warn!(
                            topic = %ctx.topic,
                            partition = ctx.partition,
                            error = %e,
                            "Failed to read partition"
                        );
                        metrics::record_store_error("read");
                        if !pause(&mut stop_rx, error_backoff).await {
                            break;
                        }
                        continue;
                    }
                }
            }
            Err(e) => {
                warn!(
                    topic = %ctx.topic,
                    partition = ctx.partition,
                    error = %e,
                    "Failed to reclaim stale records"
                );
                metrics::record_store_error("claim_stale");
                if !pause(&mut stop_rx, error_backoff).await {
                    break;
                }
                continue;
            }
        };

        if records.is_empty() {
            continue;
        }
        match &ctx.dispatch {
            Dispatch::PerJob(handler) => {
                for record in records {
                    if stop_requested(&stop_rx) || !ctx.fence.allows_reads() {
                        break;
                    }
                    let Some(job) = ctx.decode(&record).await else {
                        continue;
                    };
                    let started = Instant::now();
                    let outcome = run_guarded(handler.handle(job)).await;
                    ctx.finish(&[record.id], &outcome, 1, started).await;
                }
            }
            Dispatch::Batch(handler) => {
                if !ctx.fence.allows_reads() {
                    continue;
                }
                let mut jobs = Vec::with_capacity(records.len());
                for record in &records {
                    if let Some(job) = ctx.decode(record).await {
                        jobs.push(job);
                    }
                }
                if jobs.is_empty() {
                    continue;
                }
                let ids: Vec<String> = jobs.iter().filter_map(|j| j.record_id.clone()).collect();
                let count = jobs.len() as u64;
                let started = Instant::now();
                let outcome = run_guarded(handler.handle_batch(jobs)).await;
                ctx.finish(&ids, &outcome, count, started).await;
            }
        }
    }

    debug!(
        topic = %ctx.topic,
        consumer = %ctx.consumer,
        partition = ctx.partition,
        "Partition worker stopped"
    );
}

impl<S> WorkerContext<S>
where
    S: LogStore + ?Sized,
{
    async fn reclaim(&self) -> QueueResult<Vec<LogRecord>> {
        let records = self
            .store
            .claim_stale(
                &self.stream,
                &self.group,
                &self.consumer,
                self.claim_min_idle,
                self.batch_size,
            )
            .await?;
        if !records.is_empty() {
            info!(
                topic = %self.topic,
                consumer = %self.consumer,
                partition = self.partition,
                count = records.len(),
                "Reclaimed stale records"
            );
            metrics::record_reclaimed(&self.topic, records.len() as u64);
        }
        Ok(records)
    }

    async fn read(&self) -> QueueResult<Vec<LogRecord>> {
        self.store
            .read(
                &self.stream,
                &self.group,
                &self.consumer,
                self.batch_size,
                self.read_block,
            )
            .await
    }

    /// Decode a record. Undecodable records are acknowledged and dropped so
    /// they are not redelivered forever.
    async fn decode(&self, record: &LogRecord) -> Option<Job> {
        match Job::from_record(record) {
            Ok(job) => Some(job),
            Err(e) => {
                error!(
                    topic = %self.topic,
                    partition = self.partition,
                    record_id = %record.id,
                    error = %e,
                    "Dropping malformed record"
                );
                metrics::record_processed(&self.topic, "malformed", 1, 0.0);
                self.ack(std::slice::from_ref(&record.id)).await;
                None
            }
        }
    }

    async fn finish(&self, ids: &[String], outcome: &Outcome, count: u64, started: Instant) {
        metrics::record_processed(
            &self.topic,
            outcome.as_metric_label(),
            count,
            started.elapsed().as_secs_f64(),
        );
        match outcome {
            Outcome::Success => self.ack(ids).await,
            Outcome::Failed(reason) => warn!(
                topic = %self.topic,
                partition = self.partition,
                records = ?ids,
                error = %reason,
                "Callback failed, leaving records pending"
            ),
            Outcome::Panicked(reason) => error!(
                topic = %self.topic,
                partition = self.partition,
                records = ?ids,
                panic = %reason,
                "Callback panicked, leaving records pending"
            ),
        }
    }

    async fn ack(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let result =
            with_store_policy("ack", || self.store.ack(&self.stream, &self.group, ids)).await;
        if let Err(e) = result {
            metrics::record_store_error("ack");
            warn!(
                topic = %self.topic,
                partition = self.partition,
                records = ?ids,
                error = %e,
                "Failed to acknowledge records, they will be redelivered"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::handler::JobHandler;
    use crate::error::HandlerError;
    use crate::keys::TopicKeys;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Mutex;

    fn context(
        store: &MemoryStore,
        consumer: &str,
        dispatch: Dispatch,
    ) -> WorkerContext<MemoryStore> {
        WorkerContext {
            store: Arc::new(store.clone()),
            topic: "jobs".to_string(),
            group: "g".to_string(),
            consumer: consumer.to_string(),
            partition: 0,
            stream: TopicKeys::new("jobs").stream_key(0),
            batch_size: 10,
            read_block: Duration::from_millis(50),
            claim_min_idle: Duration::from_secs(60),
            fence: Arc::new(LeaseFence::new(Instant::now() + Duration::from_secs(3600))),
            dispatch,
        }
    }

    async fn append(store: &MemoryStore, n: i64) {
        let job = Job::new("jobs", json!({ "n": n }), None, Duration::ZERO).unwrap();
        store
            .append(
                &TopicKeys::new("jobs").stream_key(0),
                &job.to_fields().unwrap(),
                None,
            )
            .await
            .unwrap();
    }

    struct Recorder {
        seen: Mutex<Vec<i64>>,
        fail_on: Option<i64>,
    }

    #[async_trait::async_trait]
    impl JobHandler for Recorder {
        async fn handle(&self, job: Job) -> Result<(), HandlerError> {
            let n = job.payload["n"].as_i64().unwrap_or_default();
            self.seen.lock().unwrap().push(n);
            if Some(n) == self.fail_on {
                return Err("rejected".into());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_worker_processes_in_order_and_acks_successes() {
        let store = MemoryStore::new();
        for n in 0..5 {
            append(&store, n).await;
        }
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail_on: Some(2),
        });
        let worker = WorkerHandle::spawn(context(
            &store,
            "c1",
            Dispatch::PerJob(recorder.clone()),
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(worker.stop(Duration::from_secs(1)).await);

        assert_eq!(*recorder.seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        let pending = store
            .pending(&TopicKeys::new("jobs").stream_key(0), "g")
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].consumer, "c1");
    }

    #[tokio::test]
    async fn test_batch_failure_leaves_all_pending() {
        let store = MemoryStore::new();
        for n in 0..3 {
            append(&store, n).await;
        }
        let handler = |_jobs: Vec<Job>| async { Err::<(), HandlerError>("nope".into()) };
        let worker = WorkerHandle::spawn(context(
            &store,
            "c1",
            Dispatch::Batch(Arc::new(handler)),
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        worker.stop(Duration::from_secs(1)).await;
        let pending = store
            .pending(&TopicKeys::new("jobs").stream_key(0), "g")
            .await
            .unwrap();
        assert_eq!(pending.len(), 3);
    }

    #[tokio::test]
    async fn test_fenced_worker_does_not_read() {
        let store = MemoryStore::new();
        append(&store, 1).await;
        let ctx = context(&store, "c1", Dispatch::PerJob(Arc::new(|_job: Job| async {
            Ok::<(), HandlerError>(())
        })));
        ctx.fence.fence();
        let fence = Arc::clone(&ctx.fence);
        let worker = WorkerHandle::spawn(ctx);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(worker.stop(Duration::from_secs(1)).await);
        fence.clear();
        assert_eq!(
            store.len(&TopicKeys::new("jobs").stream_key(0)).await.unwrap(),
            1
        );
        let pending = store
            .pending(&TopicKeys::new("jobs").stream_key(0), "g")
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_stop_waits_for_inflight_callback() {
        let store = MemoryStore::new();
        append(&store, 1).await;
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let handler = move |_job: Job| {
            let flag = Arc::clone(&flag);
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        };
        let worker = WorkerHandle::spawn(context(&store, "c1", Dispatch::PerJob(Arc::new(handler))));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(worker.stop(Duration::from_secs(2)).await);
        assert!(finished.load(std::sync::atomic::Ordering::SeqCst));
        let pending = store
            .pending(&TopicKeys::new("jobs").stream_key(0), "g")
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_record_is_dropped() {
        let store = MemoryStore::new();
        let stream = TopicKeys::new("jobs").stream_key(0);
        store
            .append(&stream, &Default::default(), None)
            .await
            .unwrap();
        let worker = WorkerHandle::spawn(context(
            &store,
            "c1",
            Dispatch::PerJob(Arc::new(|_job: Job| async { Ok::<(), HandlerError>(()) })),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.stop(Duration::from_secs(1)).await;
        assert!(store.pending(&stream, "g").await.unwrap().is_empty());
    }
}
