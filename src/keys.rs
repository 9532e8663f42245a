//! Store key layout.
//!
//! Every identifier the queue persists or publishes on is derived here from a
//! topic name and, for group-scoped state, a group name. The functions are
//! pure: two processes given the same names always agree on the keys.
//!
//! # Key Format (v1)
//!
//! | Purpose                      | Key                                   |
//! |------------------------------|---------------------------------------|
//! | Topic registry (set)         | `logq:metadata:topics`                |
//! | Partition count              | `logq:partition:{topic}`              |
//! | Groups of a topic (set)      | `logq:consumer_group:{topic}`         |
//! | Partition log                | `logq:{topic}:{partition}:message`    |
//! | Group membership (leases)    | `logq:{topic}:{group}:consumer`       |
//! | Partition read claims        | `logq:{topic}:{group}:owner`          |
//! | Rebalance channel            | `logq:rebalance:{topic}:{group}`      |
//!
//! Names are validated (see [`crate::validation`]) so they never contain `:`,
//! which keeps the layout unambiguous.

use crate::constants::{
    APPLICATION_PREFIX, CONSUMER_GROUP_SEGMENT, CONSUMER_SEGMENT, MESSAGE_SEGMENT,
    METADATA_SEGMENT, OWNER_SEGMENT, PARTITION_SEGMENT, REBALANCE_CHANNEL_SEGMENT,
    TOPICS_SEGMENT,
};

/// Key of the set holding every known topic name.
pub fn topics_registry_key() -> String {
    format!("{APPLICATION_PREFIX}:{METADATA_SEGMENT}:{TOPICS_SEGMENT}")
}

/// Key of the record holding a topic's partition count.
pub fn partition_count_key(topic: &str) -> String {
    format!("{APPLICATION_PREFIX}:{PARTITION_SEGMENT}:{topic}")
}

/// Key of the set holding every consumer group of a topic.
pub fn topic_groups_key(topic: &str) -> String {
    format!("{APPLICATION_PREFIX}:{CONSUMER_GROUP_SEGMENT}:{topic}")
}

/// Name of the append-only log backing one partition.
pub fn partition_stream_key(topic: &str, partition: u32) -> String {
    format!("{APPLICATION_PREFIX}:{topic}:{partition}:{MESSAGE_SEGMENT}")
}

/// Key of a group's membership record (consumer name -> lease expiry).
pub fn group_members_key(topic: &str, group: &str) -> String {
    format!("{APPLICATION_PREFIX}:{topic}:{group}:{CONSUMER_SEGMENT}")
}

/// Key of a group's partition claim record (partition -> consumer name).
pub fn group_owners_key(topic: &str, group: &str) -> String {
    format!("{APPLICATION_PREFIX}:{topic}:{group}:{OWNER_SEGMENT}")
}

/// Channel on which a group's membership and partition changes are announced.
pub fn rebalance_channel_key(topic: &str, group: &str) -> String {
    format!("{APPLICATION_PREFIX}:{REBALANCE_CHANNEL_SEGMENT}:{topic}:{group}")
}

/// Topic-scoped keys, resolved once per producer or consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicKeys {
    pub topic: String,
    pub partition_count_key: String,
    pub groups_key: String,
}

impl TopicKeys {
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            partition_count_key: partition_count_key(topic),
            groups_key: topic_groups_key(topic),
        }
    }

    /// Log name for one of this topic's partitions.
    pub fn stream_key(&self, partition: u32) -> String {
        partition_stream_key(&self.topic, partition)
    }
}

/// Group-scoped keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupKeys {
    pub topic: TopicKeys,
    pub group: String,
    pub members_key: String,
    pub owners_key: String,
    pub rebalance_channel: String,
}

impl GroupKeys {
    pub fn new(topic: &str, group: &str) -> Self {
        Self {
            topic: TopicKeys::new(topic),
            group: group.to_string(),
            members_key: group_members_key(topic, group),
            owners_key: group_owners_key(topic, group),
            rebalance_channel: rebalance_channel_key(topic, group),
        }
    }
}
