//! Consumer groups end to end against the in-memory store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use logq::assignor::assign;
use logq::keys::{GroupKeys, TopicKeys};
use logq::prelude::*;
use logq::registry::MembershipRegistry;
use serde_json::json;
use tokio::task::JoinHandle;

const TOPIC: &str = "resize_image";
const GROUP: &str = "resizers";

fn fast_config(name: &str) -> ConsumerConfig {
    ConsumerConfig::new(TOPIC, GROUP)
        .with_consumer_name(name)
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_lease_timeout(Duration::from_millis(600))
        .with_rebalance_interval(Duration::from_millis(100))
        .with_read_block(Duration::from_millis(20))
        .with_claim_min_idle(Duration::from_millis(300))
        .with_shutdown_grace(Duration::from_secs(2))
}

async fn connected_producer(store: &Arc<MemoryStore>, partitions: u32) -> Producer<MemoryStore> {
    let producer = Producer::new(
        Arc::clone(store),
        ProducerConfig::new(TOPIC).with_init_partitions(partitions),
    );
    producer.connect().await.expect("connect");
    producer
}

async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// Tracks how many callbacks run per partition at the same time.
#[derive(Default)]
struct InFlight {
    running: DashMap<u32, usize>,
    overlap: AtomicBool,
    processed: DashMap<String, usize>,
}

impl InFlight {
    fn enter(&self, partition: u32) {
        let mut running = self.running.entry(partition).or_insert(0);
        *running += 1;
        if *running > 1 {
            self.overlap.store(true, Ordering::SeqCst);
        }
    }

    fn exit(&self, partition: u32) {
        if let Some(mut running) = self.running.get_mut(&partition) {
            *running -= 1;
        }
    }
}

fn spawn_consumer(
    store: &Arc<MemoryStore>,
    name: &str,
    tracker: &Arc<InFlight>,
) -> (Consumer<MemoryStore>, JoinHandle<QueueResult<()>>) {
    let consumer = Consumer::new(Arc::clone(store), fast_config(name));
    let runner = consumer.clone();
    let tracker = Arc::clone(tracker);
    let task = tokio::spawn(async move {
        runner
            .consume(move |job: Job| {
                let tracker = Arc::clone(&tracker);
                async move {
                    let partition = job.partition.unwrap_or_default();
                    tracker.enter(partition);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    tracker.exit(partition);
                    *tracker.processed.entry(job.id).or_insert(0) += 1;
                    Ok::<(), HandlerError>(())
                }
            })
            .await
    });
    (consumer, task)
}

#[test]
fn test_assignment_is_a_disjoint_cover_for_any_membership() {
    for _ in 0..200 {
        let members: Vec<String> = (0..fastrand::usize(1..8))
            .map(|_| format!("c{}", fastrand::u8(..20)))
            .collect();
        let partitions = fastrand::u32(0..40);

        let assignment = assign(&members, partitions);
        let mut seen = BTreeSet::new();
        for owned in assignment.values() {
            for partition in owned {
                assert!(seen.insert(*partition), "partition {partition} assigned twice");
            }
        }
        assert_eq!(seen, (0..partitions).collect::<BTreeSet<_>>());

        let mut shuffled = members.clone();
        fastrand::shuffle(&mut shuffled);
        assert_eq!(assign(&shuffled, partitions), assignment);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rebalance_never_runs_a_partition_twice() {
    let store = Arc::new(MemoryStore::new());
    let producer = connected_producer(&store, 4).await;
    let tracker = Arc::new(InFlight::default());

    let stop_producing = Arc::new(AtomicBool::new(false));
    let produced = Arc::new(AtomicUsize::new(0));
    let feeder = {
        let stop = Arc::clone(&stop_producing);
        let produced = Arc::clone(&produced);
        tokio::spawn(async move {
            let mut n = 0u64;
            while !stop.load(Ordering::SeqCst) {
                producer
                    .enqueue(&json!({ "n": n }), &EnqueueOptions::new())
                    .await
                    .expect("enqueue");
                produced.fetch_add(1, Ordering::SeqCst);
                n += 1;
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };

    let (c1, t1) = spawn_consumer(&store, "c1", &tracker);
    wait_until("c1 owns every partition", || {
        let c1 = c1.clone();
        async move { c1.owned_partitions().len() == 4 }
    })
    .await;

    // Forced membership change: a second member joins.
    let (c2, t2) = spawn_consumer(&store, "c2", &tracker);
    wait_until("partitions split between c1 and c2", || {
        let (c1, c2) = (c1.clone(), c2.clone());
        async move { c1.owned_partitions().len() == 2 && c2.owned_partitions().len() == 2 }
    })
    .await;
    assert!(c1.owned_partitions().is_disjoint(&c2.owned_partitions()));

    // And leaves again.
    c1.stop().await;
    t1.await.unwrap().unwrap();
    wait_until("c2 owns every partition", || {
        let c2 = c2.clone();
        async move { c2.owned_partitions().len() == 4 }
    })
    .await;

    stop_producing.store(true, Ordering::SeqCst);
    feeder.await.unwrap();
    let total = produced.load(Ordering::SeqCst);
    wait_until("every job processed", || {
        let tracker = Arc::clone(&tracker);
        async move { tracker.processed.len() == total }
    })
    .await;

    c2.stop().await;
    t2.await.unwrap().unwrap();
    assert!(!tracker.overlap.load(Ordering::SeqCst), "two callbacks ran on one partition");
}

#[tokio::test]
async fn test_claims_follow_assignment() {
    let store = Arc::new(MemoryStore::new());
    let _producer = connected_producer(&store, 3).await;
    let tracker = Arc::new(InFlight::default());
    let registry = MembershipRegistry::new(Arc::clone(&store), TOPIC, Duration::from_secs(1));

    let (a, ta) = spawn_consumer(&store, "a", &tracker);
    let (b, tb) = spawn_consumer(&store, "b", &tracker);

    let expected: BTreeMap<u32, String> = [(0, "a"), (1, "b"), (2, "a")]
        .into_iter()
        .map(|(p, c)| (p, c.to_string()))
        .collect();
    wait_until("claims and workers match the assignment", || {
        let registry = registry.clone();
        let expected = expected.clone();
        let (a, b) = (a.clone(), b.clone());
        async move {
            registry.partition_owners(GROUP).await.unwrap() == expected
                && a.owned_partitions() == BTreeSet::from([0, 2])
                && b.owned_partitions() == BTreeSet::from([1])
        }
    })
    .await;

    a.stop().await;
    b.stop().await;
    ta.await.unwrap().unwrap();
    tb.await.unwrap().unwrap();
    assert!(registry.partition_owners(GROUP).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_partition_increase_is_picked_up() {
    let store = Arc::new(MemoryStore::new());
    let producer = connected_producer(&store, 1).await;
    let tracker = Arc::new(InFlight::default());
    let (consumer, task) = spawn_consumer(&store, "solo", &tracker);

    wait_until("consumer owns partition 0", || {
        let consumer = consumer.clone();
        async move { consumer.owned_partitions().len() == 1 }
    })
    .await;

    producer.request_partition_increase(3).await.unwrap();
    wait_until("consumer owns the new partitions", || {
        let consumer = consumer.clone();
        async move { consumer.owned_partitions().len() == 3 }
    })
    .await;

    let jobs = producer
        .batch_enqueue(&[json!({"n": 1}), json!({"n": 2}), json!({"n": 3})], &EnqueueOptions::new())
        .await
        .unwrap();
    assert_eq!(
        jobs.iter().filter_map(|job| job.partition).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    wait_until("jobs on every partition processed", || {
        let tracker = Arc::clone(&tracker);
        let ids: Vec<String> = jobs.iter().map(|job| job.id.clone()).collect();
        async move { ids.iter().all(|id| tracker.processed.contains_key(id)) }
    })
    .await;

    consumer.stop().await;
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stale_record_is_reclaimed_once_idle_exceeds_timeout() {
    let store = MemoryStore::new();
    let stream = TopicKeys::new(TOPIC).stream_key(0);
    store.ensure_group(&stream, GROUP).await.unwrap();

    let job = Job::new(TOPIC, json!({"n": 1}), None, Duration::from_secs(2)).unwrap();
    store
        .append(&stream, &job.to_fields().unwrap(), None)
        .await
        .unwrap();

    // Delivered to a consumer that never acknowledges it.
    let delivered = store
        .read(&stream, GROUP, "crashed", 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(delivered.len(), 1);

    let min_idle = Duration::from_secs(60);
    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(
        store
            .claim_stale(&stream, GROUP, "rescuer", min_idle, 10)
            .await
            .unwrap()
            .is_empty()
    );

    tokio::time::advance(Duration::from_millis(1500)).await;
    let reclaimed = store
        .claim_stale(&stream, GROUP, "rescuer", min_idle, 10)
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(Job::from_record(&reclaimed[0]).unwrap().id, job.id);

    // Reassigned exactly once: the idle time restarted.
    assert!(
        store
            .claim_stale(&stream, GROUP, "third", min_idle, 10)
            .await
            .unwrap()
            .is_empty()
    );
    let pending = store.pending(&stream, GROUP).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].consumer, "rescuer");
    assert_eq!(pending[0].delivery_count, 2);
}

#[tokio::test]
async fn test_consumer_reclaims_jobs_of_a_crashed_member() {
    let store = Arc::new(MemoryStore::new());
    let producer = connected_producer(&store, 1).await;
    let job = producer
        .enqueue(
            &json!({"n": 1}),
            &EnqueueOptions::new().timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap();

    // A member that read the job and died without acknowledging it.
    let stream = TopicKeys::new(TOPIC).stream_key(0);
    store.ensure_group(&stream, GROUP).await.unwrap();
    let delivered = store
        .read(&stream, GROUP, "crashed", 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(delivered.len(), 1);

    let tracker = Arc::new(InFlight::default());
    let (consumer, task) = spawn_consumer(&store, "rescuer", &tracker);
    wait_until("reclaimed job processed", || {
        let tracker = Arc::clone(&tracker);
        let id = job.id.clone();
        async move { tracker.processed.contains_key(&id) }
    })
    .await;

    consumer.stop().await;
    task.await.unwrap().unwrap();
    assert_eq!(*tracker.processed.get(&job.id).unwrap(), 1);
    assert!(store.pending(&stream, GROUP).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_job_is_retried_after_its_timeout() {
    let store = Arc::new(MemoryStore::new());
    let producer = connected_producer(&store, 1).await;
    producer
        .enqueue(
            &json!({"flaky": true}),
            &EnqueueOptions::new().timeout(Duration::from_millis(150)),
        )
        .await
        .unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let consumer = Consumer::new(Arc::clone(&store), fast_config("retrier"));
    let runner = consumer.clone();
    let counter = Arc::clone(&attempts);
    let task = tokio::spawn(async move {
        runner
            .consume(move |_job: Job| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err::<(), HandlerError>("first attempt fails".into())
                    } else {
                        Ok(())
                    }
                }
            })
            .await
    });

    wait_until("second attempt", || {
        let attempts = Arc::clone(&attempts);
        async move { attempts.load(Ordering::SeqCst) >= 2 }
    })
    .await;
    consumer.stop().await;
    task.await.unwrap().unwrap();

    let stream = TopicKeys::new(TOPIC).stream_key(0);
    assert!(store.pending(&stream, GROUP).await.unwrap().is_empty());
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_batch_consumer_acknowledges_whole_batches() {
    let store = Arc::new(MemoryStore::new());
    let producer = connected_producer(&store, 1).await;
    producer
        .batch_enqueue(
            &[json!({"n": 1}), json!({"n": 2}), json!({"n": 3})],
            &EnqueueOptions::new(),
        )
        .await
        .unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let consumer = Consumer::new(Arc::clone(&store), fast_config("batcher"));
    let runner = consumer.clone();
    let counter = Arc::clone(&seen);
    let task = tokio::spawn(async move {
        runner
            .consume_batch(move |jobs: Vec<Job>| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(jobs.len(), Ordering::SeqCst);
                    Ok::<(), HandlerError>(())
                }
            })
            .await
    });

    wait_until("batch processed", || {
        let seen = Arc::clone(&seen);
        async move { seen.load(Ordering::SeqCst) == 3 }
    })
    .await;
    consumer.stop().await;
    task.await.unwrap().unwrap();

    let stream = TopicKeys::new(TOPIC).stream_key(0);
    assert!(store.pending(&stream, GROUP).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_crashed_member_loses_its_partitions() {
    let store = Arc::new(MemoryStore::new());
    let _producer = connected_producer(&store, 2).await;

    // A member that joined, claimed a partition and then went silent.
    let keys = GroupKeys::new(TOPIC, GROUP);
    store
        .try_register_member(&keys.members_key, "ghost", Duration::from_millis(300))
        .await
        .unwrap();
    assert!(
        store
            .claim_partition(&keys.owners_key, &keys.members_key, 0, "ghost")
            .await
            .unwrap()
    );

    let tracker = Arc::new(InFlight::default());
    let (consumer, task) = spawn_consumer(&store, "survivor", &tracker);
    wait_until("survivor owns both partitions", || {
        let consumer = consumer.clone();
        async move { consumer.owned_partitions().len() == 2 }
    })
    .await;

    consumer.stop().await;
    task.await.unwrap().unwrap();
}
