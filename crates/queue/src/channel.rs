//! Notification channel trait and message types.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use slotswap_core::ModelId;

use crate::error::QueueError;

/// A raw notification received from a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Unique message identifier from the channel provider.
    pub id: String,
    /// Raw message body (see [`crate::parser`]).
    pub body: String,
    /// Provider-specific handle for ack/nack (e.g., SQS receipt handle).
    pub receipt_handle: String,
    /// When the message was published.
    pub timestamp: DateTime<Utc>,
    /// Number of times this message has been received (for redelivery tracking).
    pub attempt_count: u32,
}

/// Health status of a channel connection.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelHealth {
    /// Whether the channel is reachable.
    pub connected: bool,
    /// Approximate number of messages waiting in the channel.
    pub approximate_message_count: Option<u64>,
    /// Approximate dead-letter depth, when the provider has a dead-letter queue.
    pub dead_letter_count: Option<u64>,
    /// Provider name (e.g., "sqs", "file", "memory").
    pub provider: String,
}

impl fmt::Display for ChannelHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ChannelHealth {{ connected: {}, messages: {:?}, dead_letters: {:?}, provider: {} }}",
            self.connected, self.approximate_message_count, self.dead_letter_count, self.provider
        )
    }
}

/// Trait for durable notification channel backends.
///
/// Delivery is at-least-once: a message handed out by [`poll_batch`] stays
/// in flight until it is acked. Nacked messages, and messages still in flight
/// when the consumer dies, are delivered again.
///
/// [`poll_batch`]: NotificationChannel::poll_batch
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Prepare the channel for use (create directories, verify the queue).
    async fn init(&self) -> Result<(), QueueError>;

    /// Publish a "new input" notification for a model.
    async fn publish(&self, model_id: &ModelId) -> Result<(), QueueError>;

    /// Receive up to `max_messages`, waiting at most `wait` for the first one.
    ///
    /// Returns an empty vec if nothing arrived in time.
    async fn poll_batch(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Acknowledge a message; it will never be delivered again.
    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError>;

    /// Return a message to the channel for redelivery.
    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError>;

    /// Check channel connectivity and return health status.
    async fn health_check(&self) -> Result<ChannelHealth, QueueError>;
}
