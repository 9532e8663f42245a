//! Local view of the consumer's group lease.
//!
//! The store decides when a lease expires, but the consumer cannot ask the
//! store before every read. Instead it keeps a conservative local deadline:
//! the time the last successful heartbeat was *sent*, plus the lease timeout,
//! minus a safety margin. Past that deadline another member may already own
//! our partitions, so workers stop issuing reads. Once the heartbeat loop
//! gives up (or the store reports the lease gone) the consumer is fenced
//! until it rejoins.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::metrics;
use crate::registry::MembershipRegistry;
use crate::retry::{heartbeat_policy, retry_retriable};
use crate::store::CoordinationStore;

/// Adds +/- 15% pseudo-random jitter to `base` so the members of a group do
/// not heartbeat or poll in lockstep.
pub(crate) fn with_jitter(base: Duration) -> Duration {
    let jitter_factor = 0.85 + fastrand::f64() * 0.30;
    Duration::from_secs_f64(base.as_secs_f64() * jitter_factor)
}

/// Lease deadline and fencing flag shared by a consumer's tasks.
#[derive(Debug)]
pub struct LeaseFence {
    /// Reference point for `deadline_micros`.
    epoch: Instant,
    deadline_micros: AtomicU64,
    fenced: AtomicBool,
    notify: Notify,
}

impl LeaseFence {
    /// A fence whose lease is valid until `deadline`.
    pub fn new(deadline: Instant) -> Self {
        let fence = Self {
            epoch: Instant::now(),
            deadline_micros: AtomicU64::new(0),
            fenced: AtomicBool::new(false),
            notify: Notify::new(),
        };
        fence.store_deadline(deadline);
        fence
    }

    fn store_deadline(&self, deadline: Instant) {
        let micros = deadline.saturating_duration_since(self.epoch).as_micros() as u64;
        self.deadline_micros.store(micros, Ordering::SeqCst);
    }

    pub fn deadline(&self) -> Instant {
        self.epoch + Duration::from_micros(self.deadline_micros.load(Ordering::SeqCst))
    }

    /// Time left before the local deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline().saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    #[inline]
    pub fn is_fenced(&self) -> bool {
        self.fenced.load(Ordering::SeqCst)
    }

    /// True while the consumer may issue reads.
    pub fn allows_reads(&self) -> bool {
        !self.is_fenced() && !self.expired()
    }

    /// Record a successful heartbeat sent at `sent_at`. The deadline only
    /// moves forward.
    pub fn renew(&self, sent_at: Instant, lease: Duration, margin: Duration) {
        let deadline = sent_at + lease.saturating_sub(margin);
        let micros = deadline.saturating_duration_since(self.epoch).as_micros() as u64;
        self.deadline_micros.fetch_max(micros, Ordering::SeqCst);
    }

    /// Stop all reads until [`reset`](Self::reset).
    ///
    /// Returns `true` if this call fenced the consumer, `false` if it already
    /// was.
    pub fn fence(&self) -> bool {
        if !self.fenced.swap(true, Ordering::SeqCst) {
            metrics::FENCED_CONSUMERS.inc();
            self.notify.notify_one();
            true
        } else {
            false
        }
    }

    /// Lift the fence after a successful rejoin.
    pub fn reset(&self, deadline: Instant) {
        self.store_deadline(deadline);
        self.clear();
    }

    /// Lift the fence without touching the deadline.
    pub fn clear(&self) {
        if self.fenced.swap(false, Ordering::SeqCst) {
            metrics::FENCED_CONSUMERS.dec();
        }
    }

    /// Resolves once the consumer is fenced.
    pub async fn wait_fenced(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_fenced() {
                return;
            }
            notified.await;
        }
    }
}

/// Renew the lease every `interval` until it is lost.
///
/// Store errors are retried with [`heartbeat_policy`] and then counted; the
/// loop only gives up once the local deadline has passed or the store says
/// the lease is gone. Either way the fence is raised before returning.
pub(crate) async fn heartbeat_loop<S>(
    registry: MembershipRegistry<S>,
    group: String,
    consumer: String,
    fence: Arc<LeaseFence>,
    interval: Duration,
    margin: Duration,
) where
    S: CoordinationStore + ?Sized,
{
    let topic = registry.topic().to_string();
    let lease = registry.lease_timeout();
    let mut consecutive_failures: u32 = 0;

    loop {
        tokio::time::sleep(with_jitter(interval)).await;

        let sent_at = Instant::now();
        let result = retry_retriable("heartbeat", heartbeat_policy(), || {
            registry.heartbeat(&group, &consumer)
        })
        .await;

        match result {
            Ok(()) => {
                if consecutive_failures > 0 {
                    info!(
                        topic = %topic,
                        group = %group,
                        consumer = %consumer,
                        previous_failures = consecutive_failures,
                        "Heartbeat recovered after failures"
                    );
                }
                consecutive_failures = 0;
                fence.renew(sent_at, lease, margin);
            }
            Err(e) if e.is_lease_lost() => {
                warn!(
                    topic = %topic,
                    group = %group,
                    consumer = %consumer,
                    "Lease expired before renewal, fencing consumer"
                );
                metrics::record_lease_loss(&topic, &group);
                fence.fence();
                return;
            }
            Err(e) => {
                consecutive_failures += 1;
                metrics::record_heartbeat_failure(&topic, &group);
                if fence.expired() {
                    error!(
                        topic = %topic,
                        group = %group,
                        consumer = %consumer,
                        consecutive_failures,
                        error = %e,
                        "Lease deadline passed without a successful heartbeat, fencing consumer"
                    );
                    metrics::record_lease_loss(&topic, &group);
                    fence.fence();
                    return;
                }
                warn!(
                    topic = %topic,
                    group = %group,
                    consumer = %consumer,
                    consecutive_failures,
                    remaining_ms = fence.remaining().as_millis() as u64,
                    error = %e,
                    "Failed to send heartbeat"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let jittered = with_jitter(base);
            assert!(jittered >= Duration::from_millis(8500));
            assert!(jittered <= Duration::from_millis(11500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_and_renew() {
        let fence = LeaseFence::new(Instant::now() + Duration::from_secs(5));
        assert!(fence.allows_reads());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(fence.expired());
        assert!(!fence.allows_reads());

        fence.renew(Instant::now(), Duration::from_secs(10), Duration::from_secs(1));
        assert!(fence.allows_reads());
        assert_eq!(fence.remaining(), Duration::from_secs(9));

        // An older heartbeat never pulls the deadline back.
        fence.renew(
            Instant::now() - Duration::from_secs(5),
            Duration::from_secs(10),
            Duration::from_secs(1),
        );
        assert_eq!(fence.remaining(), Duration::from_secs(9));
    }

    #[tokio::test]
    async fn test_fence_once_and_reset() {
        let fence = LeaseFence::new(Instant::now() + Duration::from_secs(5));
        assert!(fence.fence());
        assert!(!fence.fence());
        assert!(!fence.allows_reads());
        fence.wait_fenced().await;

        fence.reset(Instant::now() + Duration::from_secs(5));
        assert!(!fence.is_fenced());
        assert!(fence.allows_reads());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_loop_fences_on_lease_loss() {
        let store = Arc::new(MemoryStore::new());
        let registry = MembershipRegistry::new(store, "jobs", Duration::from_secs(2));
        let fence = Arc::new(LeaseFence::new(Instant::now() + Duration::from_secs(2)));

        // Never joined, so the first renewal reports the lease gone.
        heartbeat_loop(
            registry,
            "g".to_string(),
            "c".to_string(),
            Arc::clone(&fence),
            Duration::from_millis(500),
            Duration::from_millis(200),
        )
        .await;
        assert!(fence.is_fenced());
        fence.clear();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_loop_fences_after_deadline_while_offline() {
        let store = Arc::new(MemoryStore::new());
        let registry =
            MembershipRegistry::new(Arc::clone(&store), "jobs", Duration::from_secs(2));
        registry.join("g", "c").await.unwrap();
        store.set_offline(true);

        let fence = Arc::new(LeaseFence::new(Instant::now() + Duration::from_millis(1800)));
        heartbeat_loop(
            registry,
            "g".to_string(),
            "c".to_string(),
            Arc::clone(&fence),
            Duration::from_millis(500),
            Duration::from_millis(200),
        )
        .await;
        assert!(fence.is_fenced());
        assert!(fence.expired());
        fence.clear();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_loop_keeps_lease_alive() {
        let store = Arc::new(MemoryStore::new());
        let registry = MembershipRegistry::new(store, "jobs", Duration::from_secs(2));
        registry.join("g", "c").await.unwrap();
        let fence = Arc::new(LeaseFence::new(Instant::now() + Duration::from_millis(1800)));

        let task = tokio::spawn(heartbeat_loop(
            registry.clone(),
            "g".to_string(),
            "c".to_string(),
            Arc::clone(&fence),
            Duration::from_millis(500),
            Duration::from_millis(200),
        ));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!fence.is_fenced());
        assert!(fence.allows_reads());
        assert!(registry.live_members("g").await.unwrap().contains("c"));
        task.abort();
    }
}
