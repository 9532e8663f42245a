//! Jobs and the log records that carry them.
//!
//! A [`Job`] is what producers enqueue and callbacks receive. On its way
//! through a partition log it travels as a [`LogRecord`]: a store-assigned id
//! plus a string-keyed field map with the job's `msg_id`, `topic`, serialized
//! `payload`, `partition_key`, `partition`, `created_at`, `enqueued_at` and
//! `timeout`.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use crate::constants::{
    FIELD_CREATED_AT, FIELD_ENQUEUED_AT, FIELD_MSG_ID, FIELD_PARTITION, FIELD_PARTITION_KEY,
    FIELD_PAYLOAD, FIELD_TIMEOUT, FIELD_TOPIC,
};
use crate::error::{QueueError, QueueResult};

/// String-keyed field map stored per log entry.
pub type RecordFields = BTreeMap<String, String>;

/// One entry of a partition log as returned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Store-assigned id, used to acknowledge or claim the entry.
    pub id: String,
    pub fields: RecordFields,
}

impl LogRecord {
    pub fn new(id: impl Into<String>, fields: RecordFields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// The job's own processing timeout, if the record carries a positive one.
    pub fn timeout(&self) -> Option<Duration> {
        self.fields
            .get(FIELD_TIMEOUT)
            .and_then(|raw| raw.parse::<f64>().ok())
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .filter(|timeout| !timeout.is_zero())
    }
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Unique id, generated at enqueue time.
    pub id: String,
    pub topic: String,
    pub payload: Value,
    /// Name of the payload field whose value decides the partition.
    pub routing_key: Option<String>,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds, set at enqueue.
    pub enqueued_at: Option<i64>,
    /// Processing deadline hint. A job left unacknowledged for longer than
    /// this becomes reclaimable by other consumers. Zero means "use the
    /// consumer's default".
    pub timeout: Duration,
    /// Resolved at enqueue, immutable afterwards.
    pub partition: Option<u32>,
    /// Store id of the log entry, present on jobs read back from a log.
    pub record_id: Option<String>,
}

impl Job {
    /// Create a job, checking that the routing key names a payload field.
    pub fn new(
        topic: &str,
        payload: Value,
        routing_key: Option<&str>,
        timeout: Duration,
    ) -> QueueResult<Self> {
        let routing_key = routing_key.filter(|key| !key.is_empty());
        if let Some(key) = routing_key {
            let present = payload
                .as_object()
                .is_some_and(|fields| fields.contains_key(key));
            if !present {
                return Err(QueueError::RoutingKey {
                    key: key.to_string(),
                });
            }
        }

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            payload,
            routing_key: routing_key.map(str::to_string),
            created_at: Utc::now().timestamp(),
            enqueued_at: None,
            timeout,
            partition: None,
            record_id: None,
        })
    }

    /// The payload value the router hashes, if the job has a routing key.
    pub fn routing_value(&self) -> Option<&Value> {
        self.routing_key
            .as_deref()
            .and_then(|key| self.payload.get(key))
    }

    /// Encode as a log entry field map.
    pub fn to_fields(&self) -> QueueResult<RecordFields> {
        let mut fields = RecordFields::new();
        fields.insert(FIELD_MSG_ID.to_string(), self.id.clone());
        fields.insert(FIELD_TOPIC.to_string(), self.topic.clone());
        fields.insert(
            FIELD_PAYLOAD.to_string(),
            serde_json::to_string(&self.payload)?,
        );
        fields.insert(
            FIELD_PARTITION_KEY.to_string(),
            self.routing_key.clone().unwrap_or_default(),
        );
        fields.insert(
            FIELD_PARTITION.to_string(),
            self.partition.map(|p| p.to_string()).unwrap_or_default(),
        );
        fields.insert(FIELD_CREATED_AT.to_string(), self.created_at.to_string());
        fields.insert(
            FIELD_ENQUEUED_AT.to_string(),
            self.enqueued_at.map(|t| t.to_string()).unwrap_or_default(),
        );
        fields.insert(
            FIELD_TIMEOUT.to_string(),
            self.timeout.as_secs_f64().to_string(),
        );
        Ok(fields)
    }

    /// Decode a log entry read back from a partition.
    pub fn from_record(record: &LogRecord) -> QueueResult<Self> {
        let malformed = |reason: String| QueueError::MalformedRecord {
            id: record.id.clone(),
            reason,
        };
        let field = |name: &str| record.fields.get(name).map(String::as_str);
        let optional = |name: &str| field(name).filter(|raw| !raw.is_empty());

        let id = field(FIELD_MSG_ID)
            .ok_or_else(|| malformed(format!("missing {FIELD_MSG_ID}")))?
            .to_string();
        let payload: Value = match field(FIELD_PAYLOAD) {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| malformed(format!("payload is not JSON: {e}")))?,
            None => Value::Object(Default::default()),
        };
        let partition = optional(FIELD_PARTITION)
            .map(|raw| {
                raw.parse::<u32>()
                    .map_err(|_| malformed(format!("bad partition '{raw}'")))
            })
            .transpose()?;
        let created_at = optional(FIELD_CREATED_AT)
            .map(|raw| {
                raw.parse::<i64>()
                    .map_err(|_| malformed(format!("bad created_at '{raw}'")))
            })
            .transpose()?
            .unwrap_or_else(|| Utc::now().timestamp());
        let enqueued_at = optional(FIELD_ENQUEUED_AT)
            .map(|raw| {
                raw.parse::<i64>()
                    .map_err(|_| malformed(format!("bad enqueued_at '{raw}'")))
            })
            .transpose()?;

        Ok(Self {
            id,
            topic: field(FIELD_TOPIC).unwrap_or_default().to_string(),
            payload,
            routing_key: optional(FIELD_PARTITION_KEY).map(str::to_string),
            created_at,
            enqueued_at,
            timeout: record.timeout().unwrap_or_default(),
            partition,
            record_id: Some(record.id.clone()),
        })
    }
}
