//! Directory-backed notification channel.
//!
//! Each notification is one JSON file named `<publish-nanos>-<uuid>.json`, so
//! a sorted directory listing is publish order. Ack deletes the file. The
//! in-flight set lives in memory only: after a restart every remaining file
//! is delivered again, which is exactly the at-least-once contract.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use slotswap_core::ModelId;

use crate::channel::{ChannelHealth, NotificationChannel, QueueMessage};
use crate::error::QueueError;
use crate::parser::encode_notification;

const EXTENSION: &str = "json";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct Deliveries {
    in_flight: HashSet<String>,
    /// file name -> times delivered by this process
    attempts: HashMap<String, u32>,
}

/// File-spool [`NotificationChannel`].
#[derive(Debug)]
pub struct FileChannel {
    dir: PathBuf,
    deliveries: Mutex<Deliveries>,
}

impl FileChannel {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            deliveries: Mutex::new(Deliveries::default()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn deliveries(&self) -> std::sync::MutexGuard<'_, Deliveries> {
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Sorted names of all notification files currently on disk.
    async fn list(&self) -> Result<Vec<String>, QueueError> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(QueueError::NotFound(self.dir.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if Path::new(&name).extension().and_then(|e| e.to_str()) == Some(EXTENSION) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn take_ready(&self, max_messages: u32) -> Result<Vec<QueueMessage>, QueueError> {
        let names = self.list().await?;
        let candidates: Vec<String> = {
            let deliveries = self.deliveries();
            names
                .into_iter()
                .filter(|n| !deliveries.in_flight.contains(n))
                .take(max_messages as usize)
                .collect()
        };

        let mut out = Vec::with_capacity(candidates.len());
        for name in candidates {
            let body = match tokio::fs::read_to_string(self.dir.join(&name)).await {
                Ok(body) => body,
                // Acked by another consumer between listing and reading.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            let attempt_count = {
                let mut deliveries = self.deliveries();
                deliveries.in_flight.insert(name.clone());
                let attempts = deliveries.attempts.entry(name.clone()).or_default();
                *attempts += 1;
                *attempts
            };

            out.push(QueueMessage {
                id: name.trim_end_matches(".json").to_string(),
                body,
                timestamp: published_at(&name),
                receipt_handle: name,
                attempt_count,
            });
        }
        Ok(out)
    }
}

/// Recover the publish time from the file name prefix.
fn published_at(name: &str) -> chrono::DateTime<Utc> {
    name.split('-')
        .next()
        .and_then(|nanos| nanos.parse::<i64>().ok())
        .map(|nanos| Utc.timestamp_nanos(nanos))
        .unwrap_or_else(Utc::now)
}

#[async_trait]
impl NotificationChannel for FileChannel {
    async fn init(&self) -> Result<(), QueueError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        info!(dir = %self.dir.display(), "file notification channel ready");
        Ok(())
    }

    async fn publish(&self, model_id: &ModelId) -> Result<(), QueueError> {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let name = format!("{:020}-{}.{}", nanos, Uuid::new_v4(), EXTENSION);
        let tmp = self.dir.join(format!(".{name}.tmp"));

        // Write then rename so a consumer never reads a partial body.
        tokio::fs::write(&tmp, encode_notification(model_id)).await?;
        tokio::fs::rename(&tmp, self.dir.join(&name)).await?;

        debug!(model = %model_id, file = %name, "published notification (file)");
        Ok(())
    }

    async fn poll_batch(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let batch = self.take_ready(max_messages.max(1)).await?;
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }
            tokio::time::sleep_until((Instant::now() + POLL_INTERVAL).min(deadline)).await;
        }
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        if !self.deliveries().in_flight.contains(receipt_handle) {
            return Err(QueueError::Ack(format!(
                "unknown receipt handle {receipt_handle}"
            )));
        }

        match tokio::fs::remove_file(self.dir.join(receipt_handle)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(QueueError::Ack(format!("{receipt_handle}: {e}"))),
        }

        let mut deliveries = self.deliveries();
        deliveries.in_flight.remove(receipt_handle);
        deliveries.attempts.remove(receipt_handle);
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        if self.deliveries().in_flight.remove(receipt_handle) {
            Ok(())
        } else {
            Err(QueueError::Provider(format!(
                "unknown receipt handle {receipt_handle}"
            )))
        }
    }

    async fn health_check(&self) -> Result<ChannelHealth, QueueError> {
        let count = self.list().await?.len() as u64;
        Ok(ChannelHealth {
            connected: true,
            approximate_message_count: Some(count),
            dead_letter_count: None,
            provider: "file".to_string(),
        })
    }
}
