use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use slotswap_queue::ChannelSettings;
use slotswap_storage::StoreSettings;

use crate::slot::FeedSettings;

/// Scheduling parameters (`[scheduler]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapConfig {
    /// Number of execution slots.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// How long `run` waits for the notification reader to come up.
    #[serde(default = "default_reader_start_timeout_ms")]
    pub reader_start_timeout_ms: u64,
    /// Messages requested per channel poll.
    #[serde(default = "default_batch_size")]
    pub notification_batch_size: u32,
    /// Long-poll wait per channel poll.
    #[serde(default = "default_notification_wait_ms")]
    pub notification_wait_ms: u64,
}

fn default_concurrency() -> usize {
    4
}

fn default_reader_start_timeout_ms() -> u64 {
    5_000
}

fn default_batch_size() -> u32 {
    10
}

fn default_notification_wait_ms() -> u64 {
    1_000
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            reader_start_timeout_ms: default_reader_start_timeout_ms(),
            notification_batch_size: default_batch_size(),
            notification_wait_ms: default_notification_wait_ms(),
        }
    }
}

impl SwapConfig {
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Self::default()
        }
    }

    pub fn reader_start_timeout(&self) -> Duration {
        Duration::from_millis(self.reader_start_timeout_ms)
    }

    pub fn notification_wait(&self) -> Duration {
        Duration::from_millis(self.notification_wait_ms)
    }
}

/// How model processes are launched and fed (`[runner]`).
///
/// Each `args` entry may contain `{model_id}`, replaced at launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Input counts as exhausted after this long without a record.
    #[serde(default = "default_idle_timeout_ms")]
    pub input_idle_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub input_poll_interval_ms: u64,
    /// Time a process gets to exit after stdin closes before it is killed.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

fn default_idle_timeout_ms() -> u64 {
    2_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_stop_grace_ms() -> u64 {
    5_000
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            input_idle_timeout_ms: default_idle_timeout_ms(),
            input_poll_interval_ms: default_poll_interval_ms(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

impl RunnerConfig {
    pub fn feed_settings(&self) -> FeedSettings {
        FeedSettings {
            input_idle_timeout: Duration::from_millis(self.input_idle_timeout_ms),
            input_poll_interval: Duration::from_millis(self.input_poll_interval_ms),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
        }
    }
}

/// Top-level `swap-controller.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub scheduler: SwapConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub channel: ChannelSettings,
    #[serde(default)]
    pub spool: StoreSettings,
}
