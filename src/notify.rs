//! Defines S3 event notification subscriptions, and a local model of
//! how the storage service routes object changes through them into
//! the queue.

use crate::template::Token;
use anyhow::{anyhow, Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

/// S3 event types a subscription can be scoped to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EventType {
    ObjectCreated,
    #[default]
    ObjectCreatedPut,
    ObjectCreatedPost,
    ObjectCreatedCopy,
    ObjectCreatedCompleteMultipartUpload,
    ObjectRemoved,
    ObjectRemovedDelete,
    ObjectRemovedDeleteMarkerCreated,
    ObjectRestore,
    ObjectRestorePost,
    ObjectRestoreCompleted,
    ReducedRedundancyLostObject,
}

const ALL_EVENT_TYPES: [EventType; 12] = [
    EventType::ObjectCreated,
    EventType::ObjectCreatedPut,
    EventType::ObjectCreatedPost,
    EventType::ObjectCreatedCopy,
    EventType::ObjectCreatedCompleteMultipartUpload,
    EventType::ObjectRemoved,
    EventType::ObjectRemovedDelete,
    EventType::ObjectRemovedDeleteMarkerCreated,
    EventType::ObjectRestore,
    EventType::ObjectRestorePost,
    EventType::ObjectRestoreCompleted,
    EventType::ReducedRedundancyLostObject,
];

impl EventType {
    /// The name used in notification configurations.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ObjectCreated => "s3:ObjectCreated:*",
            EventType::ObjectCreatedPut => "s3:ObjectCreated:Put",
            EventType::ObjectCreatedPost => "s3:ObjectCreated:Post",
            EventType::ObjectCreatedCopy => "s3:ObjectCreated:Copy",
            EventType::ObjectCreatedCompleteMultipartUpload => {
                "s3:ObjectCreated:CompleteMultipartUpload"
            }
            EventType::ObjectRemoved => "s3:ObjectRemoved:*",
            EventType::ObjectRemovedDelete => "s3:ObjectRemoved:Delete",
            EventType::ObjectRemovedDeleteMarkerCreated => "s3:ObjectRemoved:DeleteMarkerCreated",
            EventType::ObjectRestore => "s3:ObjectRestore:*",
            EventType::ObjectRestorePost => "s3:ObjectRestore:Post",
            EventType::ObjectRestoreCompleted => "s3:ObjectRestore:Completed",
            EventType::ReducedRedundancyLostObject => "s3:ReducedRedundancyLostObject",
        }
    }

    /// The name carried by event records, e.g. `ObjectCreated:Put`.
    pub fn event_name(&self) -> &'static str {
        self.as_str().trim_start_matches("s3:")
    }

    /// Whether this is a wildcard type covering a family of events.
    pub fn is_wildcard(&self) -> bool {
        self.as_str().ends_with(":*")
    }

    /// Whether an event of type `other` is covered by this one.
    pub fn matches(&self, other: &EventType) -> bool {
        if self == other {
            return true;
        }
        match self.as_str().strip_suffix('*') {
            Some(family) => other.as_str().starts_with(family),
            None => false,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = Error;

    /// Parse either a configuration name (`s3:ObjectCreated:Put`) or
    /// a record event name (`ObjectCreated:Put`).
    fn from_str(s: &str) -> Result<Self> {
        ALL_EVENT_TYPES
            .into_iter()
            .find(|t| t.as_str() == s || t.event_name() == s)
            .ok_or_else(|| anyhow!("unknown S3 event type {:?}", s))
    }
}

/// Restricts a subscription to keys with the given prefix and/or
/// suffix. An empty filter matches every key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct NotificationKeyFilter {
    pub prefix: Option<String>,
    pub suffix: Option<String>,
}

impl NotificationKeyFilter {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        NotificationKeyFilter {
            prefix: Some(prefix.into()),
            suffix: None,
        }
    }

    pub fn suffix(suffix: impl Into<String>) -> Self {
        NotificationKeyFilter {
            prefix: None,
            suffix: Some(suffix.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prefix.is_none() && self.suffix.is_none()
    }

    /// Whether the given object key passes the filter.
    pub fn matches(&self, key: &str) -> bool {
        self.prefix.as_deref().map_or(true, |p| key.starts_with(p))
            && self.suffix.as_deref().map_or(true, |s| key.ends_with(s))
    }

    /// The filter as template filter rules.
    fn rules(&self) -> Vec<Value> {
        let mut rules = Vec::with_capacity(2);
        if let Some(prefix) = &self.prefix {
            rules.push(json!({ "Name": "prefix", "Value": prefix }));
        }
        if let Some(suffix) = &self.suffix {
            rules.push(json!({ "Name": "suffix", "Value": suffix }));
        }
        rules
    }
}

/// A notification route from the bucket to the queue.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NotificationSubscription {
    pub event: EventType,
    pub filter: NotificationKeyFilter,
}

impl NotificationSubscription {
    /// Whether the given change is routed by this subscription.
    pub fn matches(&self, change: &ObjectChange) -> bool {
        self.event.matches(&change.event) && self.filter.matches(&change.key)
    }

    /// The queue configuration entry of the bucket's notification
    /// configuration.
    pub fn queue_configuration(&self, queue_arn: &Token) -> Value {
        let mut configuration = json!({
            "Event": self.event.as_str(),
            "Queue": queue_arn,
        });
        if !self.filter.is_empty() {
            configuration["Filter"] = json!({ "S3Key": { "Rules": self.filter.rules() } });
        }
        configuration
    }
}

/// A change made to an object in the bucket.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectChange {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub event: EventType,
    pub region: String,
    pub time: DateTime<Utc>,
}

impl ObjectChange {
    /// A `PutObject` of the given key, happening now.
    pub fn put(bucket: impl Into<String>, key: impl Into<String>, size: u64) -> Self {
        ObjectChange {
            bucket: bucket.into(),
            key: key.into(),
            size,
            event: EventType::ObjectCreatedPut,
            region: String::from("us-east-1"),
            time: Utc::now(),
        }
    }

    /// The event record describing this change, as emitted by the
    /// storage service.
    pub fn record(&self, configuration_id: &str) -> Value {
        json!({
            "eventVersion": "2.1",
            "eventSource": "aws:s3",
            "awsRegion": self.region,
            "eventTime": self.time.to_rfc3339_opts(SecondsFormat::Millis, true),
            "eventName": self.event.event_name(),
            "userIdentity": { "principalId": "AWS:LOCAL" },
            "requestParameters": { "sourceIPAddress": "127.0.0.1" },
            "responseElements": {
                "x-amz-request-id": "LOCAL",
                "x-amz-id-2": "LOCAL"
            },
            "s3": {
                "s3SchemaVersion": "1.0",
                "configurationId": configuration_id,
                "bucket": {
                    "name": self.bucket,
                    "ownerIdentity": { "principalId": "LOCAL" },
                    "arn": format!("arn:aws:s3:::{}", self.bucket)
                },
                "object": {
                    "key": self.key,
                    "size": self.size,
                    "sequencer": format!("{:016X}", self.time.timestamp_millis())
                }
            }
        })
    }
}

/// Route an object change through the given subscriptions, producing
/// the queue message bodies the storage service would send: one per
/// matching subscription.
pub fn route(subscriptions: &[NotificationSubscription], change: &ObjectChange) -> Vec<String> {
    subscriptions
        .iter()
        .enumerate()
        .filter(|(_, subscription)| subscription.matches(change))
        .map(|(index, _)| {
            json!({ "Records": [change.record(&format!("Notification{}", index))] }).to_string()
        })
        .collect()
}
