//! Backend selection for the notification channel.
//!
//! The set of backends is a closed enum matched once at startup; adding a
//! backend means adding a variant here, not registering it at runtime.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use slotswap_core::config::{AwsConfig, QueueConfig};

use crate::channel::NotificationChannel;
use crate::error::QueueError;
use crate::file::FileChannel;
use crate::memory::MemoryChannel;
use crate::sqs::SqsChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Memory,
    #[default]
    File,
    Sqs,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [ChannelKind::Memory, ChannelKind::File, ChannelKind::Sqs];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Memory => "memory",
            ChannelKind::File => "file",
            ChannelKind::Sqs => "sqs",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                QueueError::NotFound(format!(
                    "unknown channel kind '{s}', expected memory, file or sqs"
                ))
            })
    }
}

/// `[channel]` section of the controller config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    #[serde(default)]
    pub kind: ChannelKind,
    /// Directory for the file backend.
    #[serde(default = "default_channel_dir")]
    pub dir: PathBuf,
}

fn default_channel_dir() -> PathBuf {
    PathBuf::from("data/notifications")
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            kind: ChannelKind::default(),
            dir: default_channel_dir(),
        }
    }
}

/// Construct the configured channel backend.
///
/// SQS settings come from the environment (`QUEUE_URL`, `AWS_*`).
pub async fn connect_channel(
    settings: &ChannelSettings,
) -> Result<Arc<dyn NotificationChannel>, QueueError> {
    let channel: Arc<dyn NotificationChannel> = match settings.kind {
        ChannelKind::Memory => Arc::new(MemoryChannel::new()),
        ChannelKind::File => Arc::new(FileChannel::new(settings.dir.clone())),
        ChannelKind::Sqs => {
            Arc::new(SqsChannel::new(&AwsConfig::from_env(), &QueueConfig::from_env()).await?)
        }
    };
    Ok(channel)
}
