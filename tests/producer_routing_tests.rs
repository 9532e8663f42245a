//! End-to-end routing and partition growth through the producer.

use std::sync::Arc;

use logq::keys::TopicKeys;
use logq::prelude::*;
use serde_json::json;

async fn connected_producer(store: &Arc<MemoryStore>, topic: &str, partitions: u32) -> Producer<MemoryStore> {
    let producer = Producer::new(
        Arc::clone(store),
        ProducerConfig::new(topic).with_init_partitions(partitions),
    );
    producer.connect().await.expect("connect");
    producer
}

#[tokio::test]
async fn test_same_routing_value_lands_on_same_partition() {
    let store = Arc::new(MemoryStore::new());
    let producer = connected_producer(&store, "send_email", 4).await;
    let options = EnqueueOptions::new().routing_key("to");

    let first = producer
        .enqueue(&json!({"to": "a@x.com"}), &options)
        .await
        .unwrap();
    let second = producer
        .enqueue(&json!({"to": "a@x.com"}), &options)
        .await
        .unwrap();

    assert_eq!(first.partition, second.partition);
    let partition = first.partition.unwrap();
    assert!(partition < 4);
    let stream = TopicKeys::new("send_email").stream_key(partition);
    assert_eq!(store.len(&stream).await.unwrap(), 2);
}

#[tokio::test]
async fn test_routing_is_shared_between_producers() {
    let store = Arc::new(MemoryStore::new());
    let a = connected_producer(&store, "send_email", 8).await;
    let b = connected_producer(&store, "send_email", 8).await;
    let options = EnqueueOptions::new().routing_key("user");

    for user in ["alice", "bob", "carol", "dave"] {
        let from_a = a.enqueue(&json!({ "user": user }), &options).await.unwrap();
        let from_b = b.enqueue(&json!({ "user": user }), &options).await.unwrap();
        assert_eq!(from_a.partition, from_b.partition, "user {user}");
    }
}

#[tokio::test]
async fn test_keyless_batch_into_fresh_topic_is_round_robin() {
    let store = Arc::new(MemoryStore::new());
    let producer = connected_producer(&store, "resize", 3).await;

    let jobs = producer
        .batch_enqueue(
            &[json!({"n": 1}), json!({"n": 2}), json!({"n": 3})],
            &EnqueueOptions::new(),
        )
        .await
        .unwrap();

    let partitions: Vec<u32> = jobs.iter().map(|job| job.partition.unwrap()).collect();
    assert_eq!(partitions, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_partial_batch_reports_appended_jobs() {
    let store = Arc::new(MemoryStore::new());
    let producer = connected_producer(&store, "resize", 2).await;
    store.set_offline(true);

    let err = producer
        .batch_enqueue(&[json!({"n": 1}), json!({"n": 2})], &EnqueueOptions::new())
        .await
        .unwrap_err();
    match err {
        QueueError::PartialBatch {
            enqueued,
            failed,
            source,
        } => {
            assert!(enqueued.is_empty());
            assert_eq!(failed, 2);
            assert!(matches!(*source, QueueError::Connection(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(QueueError::Connection(String::new()).is_retriable());
}

#[tokio::test]
async fn test_partition_count_never_decreases() {
    let store = Arc::new(MemoryStore::new());
    let producer = connected_producer(&store, "grow", 2).await;

    let mut counts = Vec::new();
    for requested in [1, 3, 2, 3, 5, 4] {
        counts.push(producer.request_partition_increase(requested).await.unwrap());
    }
    assert_eq!(counts, vec![2, 3, 3, 3, 5, 5]);

    // A second producer with a smaller bootstrap does not shrink the topic.
    let other = connected_producer(&store, "grow", 1).await;
    assert_eq!(other.partition_count().await.unwrap(), 5);
}

#[tokio::test]
async fn test_growth_spreads_keyless_jobs_over_new_partitions() {
    let store = Arc::new(MemoryStore::new());
    let producer = connected_producer(&store, "grow", 1).await;
    let options = EnqueueOptions::new();

    let first = producer.enqueue(&json!({}), &options).await.unwrap();
    assert_eq!(first.partition, Some(0));

    producer.request_partition_increase(3).await.unwrap();
    let mut partitions = Vec::new();
    for _ in 0..3 {
        partitions.push(producer.enqueue(&json!({}), &options).await.unwrap().partition.unwrap());
    }
    assert_eq!(partitions, vec![1, 2, 0]);
}
