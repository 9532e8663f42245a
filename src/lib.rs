//! # logq
//! Partitioned, at-least-once job queue over an append-only log store.
//!
//! Producers append jobs to the partitions of a topic. Consumers join a
//! consumer group, split the topic's partitions between the live members
//! and process each partition's jobs in order. There is no leader: every
//! consumer derives the group's assignment from the same registry state,
//! and a per-partition claim makes sure a partition is never read by two
//! members at once while they catch up with a change.
//!
//! # Goals
//! - Same routing-key value, same partition (for a fixed partition count)
//! - Partition counts only grow, via compare-and-set
//! - Crashed consumers lose their partitions when their lease expires, and
//!   their unacknowledged jobs are reclaimed by whoever takes over
//! - Pluggable stores: [`store::MemoryStore`] in-process, `RedisStore` with
//!   the `redis` feature
//!
//! ## Producing
//!
//! ```rust,no_run
//! use logq::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), QueueError> {
//!     let store = Arc::new(MemoryStore::new());
//!     let producer = Producer::new(store, ProducerConfig::new("send_email").with_init_partitions(4));
//!     producer.connect().await?;
//!
//!     let job = producer
//!         .enqueue(&json!({"to": "a@x.com"}), &EnqueueOptions::new().routing_key("to"))
//!         .await?;
//!     println!("job {} on partition {:?}", job.id, job.partition);
//!     Ok(())
//! }
//! ```
//!
//! ## Consuming
//!
//! ```rust,no_run
//! use logq::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), QueueError> {
//!     let store = Arc::new(MemoryStore::new());
//!     let consumer = Consumer::new(store, ConsumerConfig::new("send_email", "mailers"));
//!
//!     let handle = consumer.clone();
//!     tokio::spawn(async move {
//!         tokio::signal::ctrl_c().await.ok();
//!         handle.stop().await;
//!     });
//!
//!     consumer
//!         .consume(|job: Job| async move {
//!             println!("sending {}", job.payload);
//!             Ok::<(), HandlerError>(())
//!         })
//!         .await
//! }
//! ```

#![forbid(unsafe_code)]

pub mod assignor;
pub mod background_tasks;
pub mod config;
pub mod constants;
pub mod consumer;
pub mod error;
pub mod keys;
pub mod metrics;
pub mod producer;
pub mod registry;
pub mod retry;
pub mod router;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod validation;

pub mod prelude {
    //! Everything needed to produce and consume jobs.
    pub use crate::config::{ConsumerConfig, ProducerConfig};
    pub use crate::consumer::{BatchJobHandler, Consumer, ConsumerState, JobHandler};
    pub use crate::error::{HandlerError, QueueError, QueueResult};
    pub use crate::producer::{EnqueueOptions, Producer};
    pub use crate::store::{CoordinationStore, LogStore, MemoryStore, QueueStore};
    #[cfg(feature = "redis")]
    pub use crate::store::RedisStore;
    pub use crate::types::Job;
}
