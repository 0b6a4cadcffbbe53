//! AWS SQS notification channel.

use std::time::Duration;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_sqs::config::BehaviorVersion;
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client;
use chrono::{TimeZone, Utc};
use tracing::{debug, info};

use slotswap_core::config::{AwsConfig, QueueConfig};
use slotswap_core::ModelId;

use crate::channel::{ChannelHealth, NotificationChannel, QueueMessage};
use crate::error::QueueError;
use crate::parser::encode_notification;

/// SQS-backed notification channel.
pub struct SqsChannel {
    client: Client,
    queue_url: String,
    dlq_url: Option<String>,
    visibility_timeout_secs: i32,
    max_wait_secs: u32,
}

impl SqsChannel {
    /// Create a new SQS channel from env-derived config.
    pub async fn new(aws: &AwsConfig, queue: &QueueConfig) -> Result<Self, QueueError> {
        if !queue.is_configured() {
            return Err(QueueError::NotFound("QUEUE_URL is not set".into()));
        }

        let region = aws_sdk_sqs::config::Region::new(aws.region.clone());

        // Build SQS client config directly. Do NOT use aws_config::defaults()
        // because it reads AWS_ENDPOINT_URL from the environment, which may point
        // at another service and would route all SQS requests there.
        let mut sqs_config = aws_sdk_sqs::Config::builder()
            .region(region.clone())
            .behavior_version(BehaviorVersion::latest());

        if let (Some(key_id), Some(secret)) = (&aws.access_key_id, &aws.secret_access_key) {
            let creds = Credentials::new(
                key_id,
                secret,
                aws.session_token.clone(),
                None,
                "slotswap-queue-static",
            );
            sqs_config = sqs_config.credentials_provider(creds);
        } else {
            // Instance profile, SSO, web identity, etc.
            let chain = aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                .region(region.clone())
                .build()
                .await;
            sqs_config = sqs_config.credentials_provider(chain);
        }

        // Only apply endpoint override if QUEUE_AWS_ENDPOINT_URL is explicitly set.
        if let Some(ref endpoint) = aws.endpoint_url {
            let url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                endpoint.clone()
            } else {
                format!("https://{endpoint}")
            };
            sqs_config = sqs_config.endpoint_url(&url);
        }

        let client = Client::from_conf(sqs_config.build());

        info!(
            queue_url = %queue.queue_url,
            region = %aws.region,
            "SQS notification channel initialized"
        );

        Ok(Self {
            client,
            queue_url: queue.queue_url.clone(),
            dlq_url: queue.dlq_url.clone(),
            visibility_timeout_secs: queue.visibility_timeout_secs as i32,
            max_wait_secs: queue.wait_time_secs.min(20),
        })
    }

    async fn approximate_depth(&self, queue_url: &str) -> Result<Option<u64>, QueueError> {
        let resp = self
            .client
            .get_queue_attributes()
            .queue_url(queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("SQS attribute read failed: {e:?}")))?;

        Ok(resp
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse::<u64>().ok()))
    }
}

/// SQS long polls are whole seconds, capped at 20. Partial seconds round up so
/// a sub-second wait still long-polls instead of returning at once.
fn wait_seconds(wait: Duration, cap: u32) -> i32 {
    let secs = wait.as_millis().div_ceil(1000);
    secs.min(u128::from(cap.min(20))) as i32
}

#[async_trait]
impl NotificationChannel for SqsChannel {
    async fn init(&self) -> Result<(), QueueError> {
        // Fails fast on a wrong URL or missing permissions.
        self.approximate_depth(&self.queue_url).await?;
        Ok(())
    }

    async fn publish(&self, model_id: &ModelId) -> Result<(), QueueError> {
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(encode_notification(model_id))
            .send()
            .await
            .map_err(|e| QueueError::Provider(format!("SQS send failed: {e:?}")))?;

        debug!(model = %model_id, "published notification (sqs)");
        Ok(())
    }

    async fn poll_batch(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        // SQS caps at 10 messages per request.
        let capped = max_messages.clamp(1, 10) as i32;

        debug!(max_messages = capped, "Polling SQS");

        let resp = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(capped)
            .wait_time_seconds(wait_seconds(wait, self.max_wait_secs))
            .visibility_timeout(self.visibility_timeout_secs)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("SQS receive failed: {e:?}")))?;

        let sqs_messages = resp.messages.unwrap_or_default();
        debug!(count = sqs_messages.len(), "Received SQS messages");

        let mut messages = Vec::with_capacity(sqs_messages.len());
        for msg in sqs_messages {
            let id = msg.message_id().unwrap_or("unknown").to_string();
            let body = msg.body().unwrap_or("").to_string();

            let receipt_handle = msg
                .receipt_handle()
                .ok_or_else(|| QueueError::Parse("missing receipt handle".into()))?
                .to_string();

            // SentTimestamp attribute is epoch millis.
            let timestamp = msg
                .attributes()
                .and_then(|attrs| attrs.get(&MessageSystemAttributeName::SentTimestamp))
                .and_then(|ts| ts.parse::<i64>().ok())
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or_else(Utc::now);

            let attempt_count = msg
                .attributes()
                .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                .and_then(|c| c.parse::<u32>().ok())
                .unwrap_or(1);

            messages.push(QueueMessage {
                id,
                body,
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

    async fn health_check(&self) -> Result<ChannelHealth, QueueError> {
        let count = self.approximate_depth(&self.queue_url).await?;
        let dead_letters = match &self.dlq_url {
            Some(url) => self.approximate_depth(url).await?,
            None => None,
        };
        Ok(ChannelHealth {
            connected: true,
            approximate_message_count: count,
            dead_letter_count: dead_letters,
            provider: "sqs".to_string(),
        })
    }
}
