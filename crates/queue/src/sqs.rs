//! AWS SQS consumer and producer.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName, SendMessageBatchRequestEntry};
use aws_sdk_sqs::Client;
use chrono::{TimeZone, Utc};
use tracing::{debug, info};

use cobalt_core::config::{AwsConfig, QueueConfig};

use crate::consumer::{QueueConsumer, QueueHealth, QueueMessage};
use crate::error::QueueError;
use crate::producer::{BatchOutcome, FailedEntry, OutboundEntry, QueueProducer};

/// Build an SQS client from project config.
///
/// Starts from the SDK default chain (profile, IMDS, env) and overrides
/// region, static credentials and endpoint when configured.
pub async fn sqs_client(aws: &AwsConfig) -> Client {
    let shared = aws_config::defaults(BehaviorVersion::latest())
        .region(aws_sdk_sqs::config::Region::new(aws.region.clone()))
        .load()
        .await;

    let mut builder = aws_sdk_sqs::config::Builder::from(&shared);

    if let (Some(key_id), Some(secret)) = (&aws.access_key_id, &aws.secret_access_key) {
        let creds = Credentials::new(
            key_id,
            secret,
            aws.session_token.clone(),
            None,
            "cobalt-queue-static",
        );
        builder = builder.credentials_provider(creds);
    }

    if let Some(url) = aws.endpoint() {
        builder = builder.endpoint_url(url);
    }

    Client::from_conf(builder.build())
}

/// Accept either a full queue URL or a bare queue name.
async fn resolve_queue_url(client: &Client, name_or_url: &str) -> Result<String, QueueError> {
    if name_or_url.starts_with("http://") || name_or_url.starts_with("https://") {
        return Ok(name_or_url.to_string());
    }
    let resp = client
        .get_queue_url()
        .queue_name(name_or_url)
        .send()
        .await
        .map_err(|e| QueueError::NotFound(format!("{name_or_url}: {e:?}")))?;
    resp.queue_url()
        .map(str::to_string)
        .ok_or_else(|| QueueError::NotFound(name_or_url.to_string()))
}

// ── Consumer ──────────────────────────────────────────────────

/// SQS-backed inbound queue.
pub struct SqsConsumer {
    client: Client,
    queue_url: String,
    wait_time_secs: i32,
    visibility_timeout_secs: i32,
}

impl SqsConsumer {
    pub async fn new(client: Client, queue: &QueueConfig) -> Result<Self, QueueError> {
        let queue_url = resolve_queue_url(&client, &queue.inbound).await?;

        info!(queue_url = %queue_url, "SQS consumer initialized");

        Ok(Self {
            client,
            queue_url,
            wait_time_secs: queue.wait_time_secs.min(20) as i32,
            visibility_timeout_secs: queue.visibility_timeout_secs as i32,
        })
    }
}

#[async_trait]
impl QueueConsumer for SqsConsumer {
    async fn poll_batch(&self, max_messages: u32) -> Result<Vec<QueueMessage>, QueueError> {
        // SQS caps at 10 messages per request.
        let capped = max_messages.clamp(1, 10) as i32;

        debug!(max_messages = capped, "Polling SQS");

        let resp = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(capped)
            .wait_time_seconds(self.wait_time_secs)
            .visibility_timeout(self.visibility_timeout_secs)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("SQS receive failed: {e:?}")))?;

        let sqs_messages = resp.messages.unwrap_or_default();
        debug!(count = sqs_messages.len(), "Received SQS messages");

        let mut messages = Vec::with_capacity(sqs_messages.len());
        for msg in sqs_messages {
            let receipt_handle = msg
                .receipt_handle()
                .ok_or_else(|| QueueError::Parse("missing receipt handle".into()))?
                .to_string();

            let attrs = msg.attributes();
            let timestamp = attrs
                .and_then(|a| a.get(&MessageSystemAttributeName::SentTimestamp))
                .and_then(|ts| ts.parse::<i64>().ok())
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or_else(Utc::now);
            let attempt_count = attrs
                .and_then(|a| a.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                .and_then(|c| c.parse::<u32>().ok())
                .unwrap_or(1);

            messages.push(QueueMessage {
                id: msg.message_id().unwrap_or("unknown").to_string(),
                body: msg.body().unwrap_or("").to_string(),
                receipt_handle,
                timestamp,
                attempt_count,
            });
        }

        Ok(messages)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        debug!(receipt_handle, "Acking SQS message");

        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Ack(format!("SQS delete failed: {e:?}")))?;

        Ok(())
    }

    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        debug!(receipt_handle, "Nacking SQS message (visibility=0)");

        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(0)
            .send()
            .await
            .map_err(|e| QueueError::Provider(format!("SQS visibility change failed: {e:?}")))?;

        Ok(())
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        let resp = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("SQS health check failed: {e:?}")))?;

        let count = resp
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse::<u64>().ok());

        Ok(QueueHealth {
            connected: true,
            approximate_message_count: count,
            provider: "sqs".to_string(),
        })
    }
}

// ── Producer ──────────────────────────────────────────────────

/// SQS-backed outbound queue.
pub struct SqsProducer {
    client: Client,
    queue_url: String,
}

impl SqsProducer {
    pub async fn new(client: Client, queue: &QueueConfig) -> Result<Self, QueueError> {
        let queue_url = resolve_queue_url(&client, &queue.outbound).await?;

        info!(queue_url = %queue_url, "SQS producer initialized");

        Ok(Self { client, queue_url })
    }
}

#[async_trait]
impl QueueProducer for SqsProducer {
    async fn send_batch(&self, entries: Vec<OutboundEntry>) -> Result<BatchOutcome, QueueError> {
        if entries.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let mut request = self.client.send_message_batch().queue_url(&self.queue_url);
        for entry in entries {
            let built = SendMessageBatchRequestEntry::builder()
                .id(entry.id)
                .message_body(entry.body)
                .build()
                .map_err(|e| QueueError::Send(format!("invalid batch entry: {e}")))?;
            request = request.entries(built);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| QueueError::Send(format!("SQS send batch failed: {e:?}")))?;

        let failed = resp
            .failed()
            .iter()
            .map(|f| FailedEntry {
                id: f.id().to_string(),
                code: f.code().to_string(),
                message: f.message().unwrap_or_default().to_string(),
            })
            .collect();

        Ok(BatchOutcome {
            sent: resp.successful().len(),
            failed,
        })
    }
}
