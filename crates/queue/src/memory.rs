//! Process-local notification channel.
//!
//! Keeps the same in-flight/ack bookkeeping as the durable backends, so the
//! reader's at-least-once handling can be exercised without any I/O. Nothing
//! survives the process.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use slotswap_core::ModelId;

use crate::channel::{ChannelHealth, NotificationChannel, QueueMessage};
use crate::error::QueueError;
use crate::parser::encode_notification;

#[derive(Debug, Clone)]
struct Entry {
    id: String,
    body: String,
    timestamp: DateTime<Utc>,
    attempt_count: u32,
}

#[derive(Debug, Default)]
struct State {
    next_seq: u64,
    ready: VecDeque<Entry>,
    /// receipt handle -> entry
    in_flight: HashMap<String, Entry>,
}

/// In-memory [`NotificationChannel`].
#[derive(Debug, Default)]
pub struct MemoryChannel {
    state: Mutex<State>,
    available: Notify,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a raw body (used to inject malformed messages in tests).
    pub fn publish_raw(&self, body: impl Into<String>) {
        let mut state = self.lock();
        state.next_seq += 1;
        let entry = Entry {
            id: format!("mem-{}", state.next_seq),
            body: body.into(),
            timestamp: Utc::now(),
            attempt_count: 0,
        };
        state.ready.push_back(entry);
        drop(state);
        self.available.notify_one();
    }

    /// Messages waiting to be delivered.
    pub fn ready_count(&self) -> usize {
        self.lock().ready.len()
    }

    /// Messages delivered but not yet acked or nacked.
    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_ready(&self, max_messages: u32) -> Vec<QueueMessage> {
        let mut state = self.lock();
        let take = (max_messages as usize).min(state.ready.len());
        let mut out = Vec::with_capacity(take);
        for _ in 0..take {
            let Some(mut entry) = state.ready.pop_front() else {
                break;
            };
            entry.attempt_count += 1;
            let receipt_handle = format!("{}#{}", entry.id, entry.attempt_count);
            out.push(QueueMessage {
                id: entry.id.clone(),
                body: entry.body.clone(),
                receipt_handle: receipt_handle.clone(),
                timestamp: entry.timestamp,
                attempt_count: entry.attempt_count,
            });
            state.in_flight.insert(receipt_handle, entry);
        }
        out
    }
}

#[async_trait]
impl NotificationChannel for MemoryChannel {
    async fn init(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn publish(&self, model_id: &ModelId) -> Result<(), QueueError> {
        self.publish_raw(encode_notification(model_id));
        debug!(model = %model_id, "published notification (memory)");
        Ok(())
    }

    async fn poll_batch(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let batch = self.take_ready(max_messages.max(1));
            if !batch.is_empty() {
                return Ok(batch);
            }
            // A publish between take_ready and here leaves a stored permit,
            // so the wakeup is not lost.
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        match self.lock().in_flight.remove(receipt_handle) {
            Some(_) => Ok(()),
            None => Err(QueueError::Ack(format!(
                "unknown receipt handle {receipt_handle}"
            ))),
        }
    }

    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let mut state = self.lock();
        let entry = state.in_flight.remove(receipt_handle).ok_or_else(|| {
            QueueError::Provider(format!("unknown receipt handle {receipt_handle}"))
        })?;
        state.ready.push_front(entry);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    async fn health_check(&self) -> Result<ChannelHealth, QueueError> {
        Ok(ChannelHealth {
            connected: true,
            approximate_message_count: Some(self.ready_count() as u64),
            dead_letter_count: None,
            provider: "memory".to_string(),
        })
    }
}
