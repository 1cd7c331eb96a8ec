//! Inbound storage notifications.
//!
//! The inbound queue carries S3 event notifications, either directly or
//! wrapped in an SNS envelope when the bucket publishes to a topic. Only the
//! first record of an event is consulted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CobaltError;

/// One archive blob that landed in object storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundNotification {
    pub bucket: String,
    pub key: String,
    pub size: u64,
}

#[derive(Deserialize)]
struct S3Event {
    #[serde(rename = "Records", default)]
    records: Vec<S3EventRecord>,
}

#[derive(Deserialize)]
struct S3EventRecord {
    s3: S3Entity,
}

#[derive(Deserialize)]
struct S3Entity {
    bucket: S3Bucket,
    object: S3Object,
}

#[derive(Deserialize)]
struct S3Bucket {
    name: String,
}

#[derive(Deserialize)]
struct S3Object {
    key: String,
    #[serde(default)]
    size: u64,
}

impl InboundNotification {
    /// Decode a queue message body.
    ///
    /// Accepts a bare S3 event or an SNS envelope whose `Message` field holds
    /// the S3 event as a JSON string.
    pub fn parse(body: &str) -> Result<Self, CobaltError> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| CobaltError::MalformedNotification(format!("invalid JSON: {e}")))?;

        let event = match value.get("Message").and_then(Value::as_str) {
            Some(inner) if value.get("Records").is_none() => serde_json::from_str::<Value>(inner)
                .map_err(|e| {
                    CobaltError::MalformedNotification(format!("invalid SNS message payload: {e}"))
                })?,
            _ => value,
        };

        let event: S3Event = serde_json::from_value(event)
            .map_err(|e| CobaltError::MalformedNotification(format!("not an S3 event: {e}")))?;

        let record = event
            .records
            .into_iter()
            .next()
            .ok_or_else(|| CobaltError::MalformedNotification("event has no records".into()))?;

        if record.s3.object.key.is_empty() {
            return Err(CobaltError::MalformedNotification("object key is empty".into()));
        }

        Ok(Self {
            bucket: record.s3.bucket.name,
            key: record.s3.object.key,
            size: record.s3.object.size,
        })
    }

    /// Source tag: the second path component of the object key
    /// (`files/acme/batch1.tar.gz` → `acme`).
    pub fn source_tag(&self) -> Option<&str> {
        self.key.split('/').nth(1).filter(|s| !s.is_empty())
    }

    /// Last path component of the object key.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}
