//! Consumer runtime.
//!
//! A [`Consumer`] is one member of a consumer group. While
//! [`consume`](Consumer::consume) runs it:
//!
//! 1. joins the group and keeps its lease alive with a heartbeat task,
//! 2. listens on the group's rebalance channel and polls the registry every
//!    `rebalance_interval`,
//! 3. on every trigger recomputes the group assignment from the live members
//!    and the partition count, stops and releases partitions it no longer
//!    owns, then claims and starts the ones it gained,
//! 4. runs one worker task per owned partition.
//!
//! Every member computes the same assignment from the same inputs, so no
//! leader is needed. The partition claim record covers the window in which
//! members have not all observed a change yet: a partition is only read by
//! the consumer holding its claim, and a claim is only handed over after
//! the previous holder stopped its worker or lost its lease.
//!
//! If the heartbeat cannot renew the lease before the local deadline, the
//! consumer fences itself (workers stop reading), drops its partitions and
//! joins again.

mod handler;
mod lease;
mod state;
mod worker;

pub use handler::{BatchJobHandler, JobHandler};
pub use lease::LeaseFence;
pub use state::ConsumerState;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::assignor;
use crate::background_tasks::BackgroundTaskRegistry;
use crate::config::{ConsumerConfig, config_error};
use crate::constants::NOTIFICATION_CHANNEL_CAPACITY;
use crate::error::{QueueError, QueueResult};
use crate::keys::TopicKeys;
use crate::metrics;
use crate::registry::{MembershipRegistry, RebalanceEvent};
use crate::retry::{join_policy, retry_retriable, with_store_policy};
use crate::store::QueueStore;
use handler::Dispatch;
use lease::{heartbeat_loop, with_jitter};
use worker::{WorkerContext, WorkerHandle};

const HEARTBEAT_TASK: &str = "heartbeat";
const LISTENER_TASK: &str = "rebalance-listener";

/// Why a group session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Stopped,
    LeaseLost,
}

struct Inner<S: ?Sized> {
    store: Arc<S>,
    config: ConsumerConfig,
    keys: TopicKeys,
    registry: MembershipRegistry<S>,
    fence: Arc<LeaseFence>,
    state_tx: watch::Sender<ConsumerState>,
    stop_tx: watch::Sender<bool>,
    started: AtomicBool,
}

/// A member of a consumer group.
///
/// Cloning gives another handle to the same consumer, e.g. to call
/// [`stop`](Consumer::stop) from another task.
pub struct Consumer<S: ?Sized> {
    inner: Arc<Inner<S>>,
}

impl<S: ?Sized> Clone for Consumer<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> Consumer<S>
where
    S: QueueStore + ?Sized + 'static,
{
    pub fn new(store: Arc<S>, config: ConsumerConfig) -> Self {
        let keys = TopicKeys::new(&config.topic);
        let registry =
            MembershipRegistry::new(Arc::clone(&store), &config.topic, config.lease_timeout);
        let fence = Arc::new(LeaseFence::new(Instant::now()));
        let (state_tx, _) = watch::channel(ConsumerState::Joining);
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                keys,
                registry,
                fence,
                state_tx,
                stop_tx,
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.consumer_name
    }

    pub fn group(&self) -> &str {
        &self.inner.config.group
    }

    pub fn topic(&self) -> &str {
        &self.inner.config.topic
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConsumerState {
        self.inner.state_tx.borrow().clone()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.inner.state_tx.subscribe()
    }

    /// Partitions this consumer is reading right now.
    pub fn owned_partitions(&self) -> BTreeSet<u32> {
        self.state().partitions()
    }

    /// Process jobs one at a time until [`stop`](Self::stop) is called.
    ///
    /// Returns an error if the consumer cannot join its group: the name is
    /// taken by a live member, the configuration is invalid, or the store
    /// stays unreachable past the join retries.
    pub async fn consume<H>(&self, handler: H) -> QueueResult<()>
    where
        H: JobHandler,
    {
        self.run(Dispatch::PerJob(Arc::new(handler))).await
    }

    /// Like [`consume`](Self::consume), with one callback per read batch.
    pub async fn consume_batch<H>(&self, handler: H) -> QueueResult<()>
    where
        H: BatchJobHandler,
    {
        self.run(Dispatch::Batch(Arc::new(handler))).await
    }

    /// Stop consuming and wait until the consumer has left its group.
    pub async fn stop(&self) {
        self.inner.stop_tx.send_replace(true);
        if !self.inner.started.load(Ordering::SeqCst) {
            self.set_state(ConsumerState::Dead);
            return;
        }
        let mut state_rx = self.inner.state_tx.subscribe();
        let _ = state_rx.wait_for(ConsumerState::is_terminal).await;
    }

    fn set_state(&self, state: ConsumerState) {
        let previous = self.inner.state_tx.send_replace(state.clone());
        if previous != state {
            debug!(
                topic = %self.inner.keys.topic,
                group = %self.inner.config.group,
                consumer = %self.inner.config.consumer_name,
                from = %previous,
                to = %state,
                "Consumer state changed"
            );
        }
    }

    async fn run(&self, dispatch: Dispatch) -> QueueResult<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(QueueError::Config(
                "consumer has already been started".to_string(),
            ));
        }
        let result = self.run_sessions(dispatch).await;
        self.inner.fence.clear();
        self.set_state(ConsumerState::Dead);
        if let Err(e) = &result {
            error!(
                topic = %self.inner.keys.topic,
                group = %self.inner.config.group,
                consumer = %self.inner.config.consumer_name,
                error = %e,
                "Consumer stopped with error"
            );
        }
        result
    }

    async fn run_sessions(&self, dispatch: Dispatch) -> QueueResult<()> {
        self.inner.config.validate().map_err(config_error)?;
        let mut stop_rx = self.inner.stop_tx.subscribe();
        let mut first_join = true;

        loop {
            if *stop_rx.borrow() {
                return Ok(());
            }
            self.set_state(ConsumerState::Joining);

            match self.join(&mut stop_rx).await {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(e) if first_join || !rejoin_retriable(&e) => return Err(e),
                Err(e) => {
                    warn!(
                        topic = %self.inner.keys.topic,
                        group = %self.inner.config.group,
                        consumer = %self.inner.config.consumer_name,
                        error = %e,
                        "Rejoin failed, retrying"
                    );
                    let retry_in = with_jitter(self.inner.config.rebalance_interval);
                    tokio::select! {
                        _ = tokio::time::sleep(retry_in) => continue,
                        _ = stop_rx.changed() => return Ok(()),
                    }
                }
            }
            first_join = false;

            match self.session(&dispatch, &mut stop_rx).await {
                SessionEnd::Stopped => {
                    self.leave_group().await;
                    return Ok(());
                }
                SessionEnd::LeaseLost => {
                    metrics::record_rebalance(&self.inner.keys.topic, "lease_lost");
                    warn!(
                        topic = %self.inner.keys.topic,
                        group = %self.inner.config.group,
                        consumer = %self.inner.config.consumer_name,
                        "Lease lost, rejoining group"
                    );
                    // A locally fenced lease can still be live in the store.
                    self.leave_group().await;
                }
            }
        }
    }

    /// Best-effort removal of this consumer's membership and claims.
    async fn leave_group(&self) {
        let config = &self.inner.config;
        if let Err(e) = self
            .inner
            .registry
            .leave(&config.group, &config.consumer_name)
            .await
        {
            warn!(
                topic = %self.inner.keys.topic,
                group = %config.group,
                consumer = %config.consumer_name,
                error = %e,
                "Failed to leave group, membership will expire with the lease"
            );
        }
    }

    /// Join the group. Returns `false` if stopped before the join finished.
    async fn join(&self, stop_rx: &mut watch::Receiver<bool>) -> QueueResult<bool> {
        let config = &self.inner.config;
        let started = Instant::now();
        let join = retry_retriable("join", join_policy(), || {
            self.inner
                .registry
                .join(&config.group, &config.consumer_name)
        });
        tokio::select! {
            result = join => result?,
            _ = stop_rx.changed() => return Ok(false),
        }

        let local_lease = config
            .lease_timeout
            .saturating_sub(config.lease_safety_margin());
        self.inner.fence.reset(started + local_lease);
        info!(
            topic = %self.inner.keys.topic,
            group = %config.group,
            consumer = %config.consumer_name,
            "Joined consumer group"
        );
        Ok(true)
    }

    /// Run one group membership until stopped or the lease is lost.
    async fn session(
        &self,
        dispatch: &Dispatch,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let config = &self.inner.config;
        let mut tasks = BackgroundTaskRegistry::new();

        let (wake_tx, mut wake_rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let mut listening = match self.inner.registry.subscribe(&config.group).await {
            Ok(events) => {
                tasks.spawn(LISTENER_TASK, forward_notifications(events, wake_tx));
                true
            }
            Err(e) => {
                warn!(
                    topic = %self.inner.keys.topic,
                    group = %config.group,
                    error = %e,
                    "Failed to subscribe to rebalance notifications, relying on polling"
                );
                false
            }
        };

        tasks.spawn_essential(
            HEARTBEAT_TASK,
            heartbeat_loop(
                self.inner.registry.clone(),
                config.group.clone(),
                config.consumer_name.clone(),
                Arc::clone(&self.inner.fence),
                config.heartbeat_interval,
                config.lease_safety_margin(),
            ),
        );

        let mut workers: BTreeMap<u32, WorkerHandle> = BTreeMap::new();
        self.rebalance(&mut workers, dispatch, "join").await;

        let mut poll = tokio::time::interval_at(
            Instant::now() + config.rebalance_interval,
            config.rebalance_interval,
        );
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let end = loop {
            tokio::select! {
                _ = stop_rx.changed() => break SessionEnd::Stopped,
                _ = self.inner.fence.wait_fenced() => break SessionEnd::LeaseLost,
                event = wake_rx.recv(), if listening => match event {
                    Some(event) => {
                        debug!(
                            topic = %self.inner.keys.topic,
                            group = %config.group,
                            event = ?event,
                            "Rebalance notification"
                        );
                        while wake_rx.try_recv().is_ok() {}
                        self.rebalance(&mut workers, dispatch, "notification").await;
                    }
                    None => {
                        warn!(
                            topic = %self.inner.keys.topic,
                            group = %config.group,
                            "Rebalance notifications ended, relying on polling"
                        );
                        listening = false;
                    }
                },
                _ = poll.tick() => {
                    let failed = tasks.essential_failures();
                    if !failed.is_empty() {
                        error!(
                            topic = %self.inner.keys.topic,
                            group = %config.group,
                            consumer = %config.consumer_name,
                            tasks = ?failed,
                            "Essential background task ended, fencing consumer"
                        );
                        self.inner.fence.fence();
                        break SessionEnd::LeaseLost;
                    }
                    self.rebalance(&mut workers, dispatch, "poll").await;
                }
            }
        };

        self.set_state(match end {
            SessionEnd::Stopped => ConsumerState::Leaving,
            SessionEnd::LeaseLost => ConsumerState::Joining,
        });
        self.stop_workers(std::mem::take(&mut workers)).await;
        tasks.shutdown_all_with_timeout(config.shutdown_grace).await;
        if let Err(e) = self
            .inner
            .registry
            .release_all(&config.group, &config.consumer_name)
            .await
        {
            warn!(
                topic = %self.inner.keys.topic,
                group = %config.group,
                error = %e,
                "Failed to release partition claims"
            );
        }
        metrics::set_owned_partitions(
            &self.inner.keys.topic,
            &config.group,
            &config.consumer_name,
            0,
        );
        end
    }

    /// Stop every worker, sharing one grace period between them.
    async fn stop_workers(&self, workers: BTreeMap<u32, WorkerHandle>) {
        for worker in workers.values() {
            worker.signal_stop();
        }
        let deadline = Instant::now() + self.inner.config.shutdown_grace;
        for (_, worker) in workers {
            worker
                .stop(deadline.saturating_duration_since(Instant::now()))
                .await;
        }
    }

    async fn partition_count(&self) -> QueueResult<u32> {
        let key = &self.inner.keys.partition_count_key;
        let count = with_store_policy("partition_count", || self.inner.store.partition_count(key))
            .await?
            .unwrap_or(1);
        Ok(count.max(1))
    }

    /// Bring the running workers in line with the current assignment.
    ///
    /// Partitions that moved away are stopped and released before any gained
    /// partition is claimed. A gained partition whose claim is still held by
    /// its previous owner is retried on the next trigger.
    async fn rebalance(
        &self,
        workers: &mut BTreeMap<u32, WorkerHandle>,
        dispatch: &Dispatch,
        trigger: &str,
    ) {
        let config = &self.inner.config;
        let topic = &self.inner.keys.topic;
        if !self.inner.fence.allows_reads() {
            debug!(topic = %topic, group = %config.group, trigger, "Skipping rebalance while fenced");
            return;
        }

        let members = match self.inner.registry.live_members(&config.group).await {
            Ok(members) => members,
            Err(e) => {
                warn!(topic = %topic, group = %config.group, trigger, error = %e, "Failed to read group members");
                return;
            }
        };
        if !members.contains(&config.consumer_name) {
            warn!(
                topic = %topic,
                group = %config.group,
                consumer = %config.consumer_name,
                "Consumer is no longer a live member, fencing"
            );
            self.inner.fence.fence();
            return;
        }
        let partition_count = match self.partition_count().await {
            Ok(count) => count,
            Err(e) => {
                warn!(topic = %topic, trigger, error = %e, "Failed to read partition count");
                return;
            }
        };

        let target = assignor::partitions_for(&members, partition_count, &config.consumer_name);
        let before: BTreeSet<u32> = workers.keys().copied().collect();

        let crashed: Vec<u32> = workers
            .iter()
            .filter(|(_, worker)| worker.is_finished())
            .map(|(partition, _)| *partition)
            .collect();
        for partition in crashed {
            if let Some(worker) = workers.remove(&partition) {
                error!(topic = %topic, partition = worker.partition(), "Partition worker ended unexpectedly, restarting");
                worker.stop(Duration::ZERO).await;
            }
        }

        let removed: Vec<u32> = workers
            .keys()
            .filter(|partition| !target.contains(partition))
            .copied()
            .collect();
        for partition in removed {
            if let Some(worker) = workers.remove(&partition) {
                worker.stop(config.shutdown_grace).await;
            }
            match self
                .inner
                .registry
                .release_partition(&config.group, &config.consumer_name, partition)
                .await
            {
                Ok(_) => info!(
                    topic = %topic,
                    group = %config.group,
                    consumer = %config.consumer_name,
                    partition,
                    "Released partition"
                ),
                Err(e) => warn!(
                    topic = %topic,
                    group = %config.group,
                    partition,
                    error = %e,
                    "Failed to release partition, claim lapses with the lease"
                ),
            }
        }

        for partition in target.iter().copied() {
            if workers.contains_key(&partition) || !self.inner.fence.allows_reads() {
                continue;
            }
            if let Err(e) = self.start_partition(partition, dispatch, workers).await {
                warn!(
                    topic = %topic,
                    group = %config.group,
                    partition,
                    error = %e,
                    "Failed to start partition"
                );
            }
        }

        let owned: BTreeSet<u32> = workers.keys().copied().collect();
        if owned != before {
            info!(
                topic = %topic,
                group = %config.group,
                consumer = %config.consumer_name,
                trigger,
                members = members.len(),
                partition_count,
                partitions = ?owned,
                "Rebalanced"
            );
            metrics::record_rebalance(topic, trigger);
        }
        metrics::set_owned_partitions(topic, &config.group, &config.consumer_name, owned.len());
        self.set_state(ConsumerState::from_partitions(owned));
    }

    async fn start_partition(
        &self,
        partition: u32,
        dispatch: &Dispatch,
        workers: &mut BTreeMap<u32, WorkerHandle>,
    ) -> QueueResult<()> {
        let config = &self.inner.config;
        let stream = self.inner.keys.stream_key(partition);
        self.inner.store.ensure_group(&stream, &config.group).await?;

        let claimed = self
            .inner
            .registry
            .claim_partition(&config.group, &config.consumer_name, partition)
            .await?;
        if !claimed {
            debug!(
                topic = %self.inner.keys.topic,
                group = %config.group,
                partition,
                "Partition still claimed by its previous owner, retrying later"
            );
            return Ok(());
        }

        let worker = WorkerHandle::spawn(WorkerContext {
            store: Arc::clone(&self.inner.store),
            topic: self.inner.keys.topic.clone(),
            group: config.group.clone(),
            consumer: config.consumer_name.clone(),
            partition,
            stream,
            batch_size: config.batch_size,
            read_block: config.read_block,
            claim_min_idle: config.claim_min_idle,
            fence: Arc::clone(&self.inner.fence),
            dispatch: dispatch.clone(),
        });
        workers.insert(partition, worker);
        Ok(())
    }
}

/// Forward notifications to the control loop. A full channel already holds
/// a wake-up, so extra events are dropped.
async fn forward_notifications(
    mut events: BoxStream<'static, RebalanceEvent>,
    wake_tx: mpsc::Sender<RebalanceEvent>,
) {
    while let Some(event) = events.next().await {
        if let Err(mpsc::error::TrySendError::Closed(_)) = wake_tx.try_send(event) {
            break;
        }
    }
}

/// Errors a rejoin waits out. After a lease loss our own record may
/// outlive the local deadline, which reads as a duplicate until it expires.
fn rejoin_retriable(error: &QueueError) -> bool {
    error.is_retriable() || matches!(error, QueueError::DuplicateConsumer { .. })
}
