//! Group membership, leases and partition claims.
//!
//! A [`MembershipRegistry`] is the consumer-side view of a topic's groups in
//! the store:
//!
//! - **Membership**: each consumer holds a lease that it renews by
//!   heartbeat. A consumer whose lease expired is no longer a member, even if
//!   it has not noticed yet.
//! - **Claims**: per partition, the consumer currently allowed to read it. A
//!   claim only counts while its holder is a live member, so a crashed
//!   consumer's claims lapse with its lease.
//! - **Notifications**: every membership change and every partition count
//!   increase is announced on the group's rebalance channel. The channel is
//!   only a wake-up; listeners always re-read membership from the store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{QueueError, QueueResult};
use crate::keys::{GroupKeys, TopicKeys};
use crate::store::{CoordinationStore, MemberScan};
use crate::validation::{validate_consumer_name, validate_group_name};

/// Message published on a group's rebalance channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RebalanceEvent {
    MemberJoined { consumer: String },
    MemberLeft { consumer: String },
    MembersExpired { consumers: Vec<String> },
    PartitionsIncreased { partition_count: u32 },
    /// Anything that could not be decoded. Still a reason to re-check.
    #[serde(other)]
    Unknown,
}

impl RebalanceEvent {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(message: &str) -> Self {
        serde_json::from_str(message).unwrap_or(RebalanceEvent::Unknown)
    }
}

/// Publish `event` to every group registered on the topic. Failures are
/// logged and skipped.
pub(crate) async fn notify_all_groups<S>(store: &S, keys: &TopicKeys, event: &RebalanceEvent)
where
    S: CoordinationStore + ?Sized,
{
    let groups = match store.set_members(&keys.groups_key).await {
        Ok(groups) => groups,
        Err(e) => {
            warn!(topic = %keys.topic, error = %e, "Failed to list consumer groups for notification");
            return;
        }
    };

    let message = event.encode();
    for group in groups {
        let channel = GroupKeys::new(&keys.topic, &group).rebalance_channel;
        if let Err(e) = store.publish(&channel, &message).await {
            warn!(topic = %keys.topic, group = %group, error = %e, "Failed to publish rebalance notification");
        }
    }
}

/// Membership registry for one topic.
pub struct MembershipRegistry<S: ?Sized> {
    store: Arc<S>,
    topic: TopicKeys,
    lease_timeout: Duration,
}

impl<S: ?Sized> Clone for MembershipRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            topic: self.topic.clone(),
            lease_timeout: self.lease_timeout,
        }
    }
}

impl<S> MembershipRegistry<S>
where
    S: CoordinationStore + ?Sized,
{
    pub fn new(store: Arc<S>, topic: &str, lease_timeout: Duration) -> Self {
        Self {
            store,
            topic: TopicKeys::new(topic),
            lease_timeout,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic.topic
    }

    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    fn group_keys(&self, group: &str) -> GroupKeys {
        GroupKeys::new(&self.topic.topic, group)
    }

    async fn announce(&self, keys: &GroupKeys, event: RebalanceEvent) {
        if let Err(e) = self
            .store
            .publish(&keys.rebalance_channel, &event.encode())
            .await
        {
            warn!(
                topic = %self.topic.topic,
                group = %keys.group,
                error = %e,
                "Failed to publish rebalance notification"
            );
        }
    }

    /// Register `consumer` in `group` with a fresh lease.
    ///
    /// Fails with [`QueueError::DuplicateConsumer`] if a consumer of that name
    /// holds a live lease. An expired holder is replaced.
    pub async fn join(&self, group: &str, consumer: &str) -> QueueResult<()> {
        validate_group_name(group)?;
        validate_consumer_name(consumer)?;
        let keys = self.group_keys(group);

        if self.store.set_add(&self.topic.groups_key, group).await? {
            info!(topic = %self.topic.topic, group, "New consumer group registered");
        }

        let registered = self
            .store
            .try_register_member(&keys.members_key, consumer, self.lease_timeout)
            .await?;
        if !registered {
            return Err(QueueError::DuplicateConsumer {
                group: group.to_string(),
                consumer: consumer.to_string(),
            });
        }

        info!(topic = %self.topic.topic, group, consumer, "Consumer joined group");
        self.announce(
            &keys,
            RebalanceEvent::MemberJoined {
                consumer: consumer.to_string(),
            },
        )
        .await;
        Ok(())
    }

    /// Renew `consumer`'s lease.
    ///
    /// Fails with [`QueueError::LeaseLost`] if the lease had already expired or
    /// the member record is gone.
    pub async fn heartbeat(&self, group: &str, consumer: &str) -> QueueResult<()> {
        let keys = self.group_keys(group);
        let renewed = self
            .store
            .renew_member(&keys.members_key, consumer, self.lease_timeout)
            .await?;
        if renewed {
            debug!(topic = %self.topic.topic, group, consumer, "Heartbeat renewed lease");
            Ok(())
        } else {
            Err(QueueError::LeaseLost {
                group: group.to_string(),
                consumer: consumer.to_string(),
            })
        }
    }

    /// Remove `consumer` from `group` and drop all its partition claims.
    pub async fn leave(&self, group: &str, consumer: &str) -> QueueResult<()> {
        let keys = self.group_keys(group);
        let released = self.store.release_all(&keys.owners_key, consumer).await?;
        let removed = self.store.remove_member(&keys.members_key, consumer).await?;
        info!(
            topic = %self.topic.topic,
            group,
            consumer,
            released = ?released,
            was_member = removed,
            "Consumer left group"
        );
        self.announce(
            &keys,
            RebalanceEvent::MemberLeft {
                consumer: consumer.to_string(),
            },
        )
        .await;
        Ok(())
    }

    /// Names of the live members of `group`.
    ///
    /// Members found expired are evicted and announced.
    pub async fn live_members(&self, group: &str) -> QueueResult<BTreeSet<String>> {
        Ok(self.scan(group).await?.live_names())
    }

    /// Live members with their remaining lease, evicting expired ones.
    pub async fn scan(&self, group: &str) -> QueueResult<MemberScan> {
        let keys = self.group_keys(group);
        let scan = self.store.scan_members(&keys.members_key).await?;
        if !scan.evicted.is_empty() {
            warn!(
                topic = %self.topic.topic,
                group,
                evicted = ?scan.evicted,
                "Evicted consumers with expired leases"
            );
            self.announce(
                &keys,
                RebalanceEvent::MembersExpired {
                    consumers: scan.evicted.clone(),
                },
            )
            .await;
        }
        Ok(scan)
    }

    /// Become the reader of `partition`. Returns false while another live
    /// member holds it.
    pub async fn claim_partition(
        &self,
        group: &str,
        consumer: &str,
        partition: u32,
    ) -> QueueResult<bool> {
        let keys = self.group_keys(group);
        self.store
            .claim_partition(&keys.owners_key, &keys.members_key, partition, consumer)
            .await
    }

    pub async fn release_partition(
        &self,
        group: &str,
        consumer: &str,
        partition: u32,
    ) -> QueueResult<bool> {
        let keys = self.group_keys(group);
        self.store
            .release_partition(&keys.owners_key, partition, consumer)
            .await
    }

    /// Drop every claim `consumer` holds in `group`. Returns the released
    /// partitions.
    pub async fn release_all(&self, group: &str, consumer: &str) -> QueueResult<Vec<u32>> {
        let keys = self.group_keys(group);
        self.store.release_all(&keys.owners_key, consumer).await
    }

    /// Current claims of `group`: partition -> consumer.
    pub async fn partition_owners(&self, group: &str) -> QueueResult<BTreeMap<u32, String>> {
        let keys = self.group_keys(group);
        self.store.partition_owners(&keys.owners_key).await
    }

    /// Stream of rebalance notifications for `group`.
    pub async fn subscribe(&self, group: &str) -> QueueResult<BoxStream<'static, RebalanceEvent>> {
        let keys = self.group_keys(group);
        let messages = self.store.subscribe(&keys.rebalance_channel).await?;
        Ok(messages
            .map(|message| RebalanceEvent::decode(&message))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry(store: &MemoryStore, lease: Duration) -> MembershipRegistry<MemoryStore> {
        MembershipRegistry::new(Arc::new(store.clone()), "jobs", lease)
    }

    #[test]
    fn test_event_encoding() {
        let event = RebalanceEvent::PartitionsIncreased { partition_count: 4 };
        let encoded = event.encode();
        assert_eq!(
            encoded,
            r#"{"event":"partitions_increased","partition_count":4}"#
        );
        assert_eq!(RebalanceEvent::decode(&encoded), event);
        assert_eq!(RebalanceEvent::decode(""), RebalanceEvent::Unknown);
        assert_eq!(
            RebalanceEvent::decode(r#"{"event":"something_new"}"#),
            RebalanceEvent::Unknown
        );
    }

    #[tokio::test]
    async fn test_join_rejects_live_duplicate() {
        let store = MemoryStore::new();
        let registry = registry(&store, Duration::from_secs(10));
        registry.join("g", "c1").await.unwrap();
        let err = registry.join("g", "c1").await.unwrap_err();
        assert!(matches!(err, QueueError::DuplicateConsumer { .. }));
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_join_registers_group() {
        let store = MemoryStore::new();
        let registry = registry(&store, Duration::from_secs(10));
        registry.join("g1", "c").await.unwrap();
        registry.join("g2", "c").await.unwrap();
        let groups = store
            .set_members(&TopicKeys::new("jobs").groups_key)
            .await
            .unwrap();
        assert_eq!(groups.into_iter().collect::<Vec<_>>(), vec!["g1", "g2"]);
    }

    #[tokio::test]
    async fn test_join_validates_names() {
        let store = MemoryStore::new();
        let registry = registry(&store, Duration::from_secs(10));
        assert!(matches!(
            registry.join("g", "bad:name").await,
            Err(QueueError::InvalidName { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_after_expiry_is_lease_lost() {
        let store = MemoryStore::new();
        let registry = registry(&store, Duration::from_secs(3));
        registry.join("g", "c1").await.unwrap();
        registry.heartbeat("g", "c1").await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        let err = registry.heartbeat("g", "c1").await.unwrap_err();
        assert!(err.is_lease_lost());

        // Rejoining after the loss works.
        registry.join("g", "c1").await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_member() {
        let store = MemoryStore::new();
        let registry = registry(&store, Duration::from_secs(3));
        assert!(registry.heartbeat("g", "nobody").await.unwrap_err().is_lease_lost());
    }

    #[tokio::test]
    async fn test_leave_releases_claims_and_notifies() {
        let store = MemoryStore::new();
        let registry = registry(&store, Duration::from_secs(10));
        registry.join("g", "c1").await.unwrap();
        let mut events = registry.subscribe("g").await.unwrap();

        assert!(registry.claim_partition("g", "c1", 0).await.unwrap());
        assert!(registry.claim_partition("g", "c1", 1).await.unwrap());
        registry.leave("g", "c1").await.unwrap();

        assert!(registry.partition_owners("g").await.unwrap().is_empty());
        assert!(registry.live_members("g").await.unwrap().is_empty());
        assert_eq!(
            events.next().await,
            Some(RebalanceEvent::MemberLeft {
                consumer: "c1".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_members_evicts_and_announces() {
        let store = MemoryStore::new();
        let short = registry(&store, Duration::from_secs(1));
        let long = registry(&store, Duration::from_secs(60));
        short.join("g", "a").await.unwrap();
        long.join("g", "b").await.unwrap();
        let mut events = long.subscribe("g").await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        let live = long.live_members("g").await.unwrap();
        assert_eq!(live.into_iter().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(
            events.next().await,
            Some(RebalanceEvent::MembersExpired {
                consumers: vec!["a".to_string()]
            })
        );
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_between_live_members() {
        let store = MemoryStore::new();
        let registry = registry(&store, Duration::from_secs(10));
        registry.join("g", "a").await.unwrap();
        registry.join("g", "b").await.unwrap();

        assert!(registry.claim_partition("g", "a", 0).await.unwrap());
        assert!(!registry.claim_partition("g", "b", 0).await.unwrap());
        assert!(!registry.release_partition("g", "b", 0).await.unwrap());
        assert!(registry.release_partition("g", "a", 0).await.unwrap());
        assert!(registry.claim_partition("g", "b", 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_notify_all_groups() {
        let store = MemoryStore::new();
        let registry = registry(&store, Duration::from_secs(10));
        registry.join("g1", "c").await.unwrap();
        registry.join("g2", "c").await.unwrap();
        let mut g1 = registry.subscribe("g1").await.unwrap();
        let mut g2 = registry.subscribe("g2").await.unwrap();

        let event = RebalanceEvent::PartitionsIncreased { partition_count: 3 };
        notify_all_groups(&store, &TopicKeys::new("jobs"), &event).await;
        assert_eq!(g1.next().await, Some(event.clone()));
        assert_eq!(g2.next().await, Some(event));
    }
}
