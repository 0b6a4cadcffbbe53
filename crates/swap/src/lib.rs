//! Multi-slot model swap scheduler.
//!
//! A [`SwapController`] owns a fixed pool of execution slots and decides which
//! models occupy them. Notifications that a model has new input arrive over a
//! [`slotswap_queue::NotificationChannel`]; input itself lives in a
//! [`slotswap_storage::InputStore`]. When demand exceeds the pool, the least
//! recently active model is asked to stop so a waiting one can take its slot.

pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod metrics;
pub mod reader;
pub mod runner;
pub mod slot;

pub use config::{ControllerConfig, RunnerConfig, SwapConfig};
pub use controller::{LoopStatus, RunningModelInfo, SwapController};
pub use error::SwapError;
pub use event::{SwapEvent, SwapHandle};
pub use metrics::SwapMetrics;
pub use runner::{CommandRunner, ModelProcess, ModelRunner};
pub use slot::{FeedSettings, ModelFinishedCallback, ModelSlot, SlotAgent};
