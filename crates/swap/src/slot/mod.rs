//! Execution slots.
//!
//! A slot is either idle or occupied by exactly one model. The controller
//! drives it through [`SlotAgent`]:
//!
//! ```text
//!  idle --start_model--> running --stop_model--> stopping
//!                           |                       |
//!                           +---- on_finished <-----+
//!                                     |
//!  idle <--------release_slot-------- finished
//! ```
//!
//! `on_finished` fires exactly once per occupancy, from the slot's own task,
//! whether the model drained its input, was stopped, or failed.

mod agent;
mod feed;

use std::time::Duration;

use async_trait::async_trait;

use slotswap_core::{ModelExit, ModelId};

use crate::error::SwapError;

pub use agent::ModelSlot;

/// Completion callback handed to [`SlotAgent::start_model`].
pub type ModelFinishedCallback = Box<dyn FnOnce(ModelExit) + Send + 'static>;

#[async_trait]
pub trait SlotAgent: Send {
    fn index(&self) -> usize;

    /// Model currently occupying the slot, including one that has finished
    /// but not been released.
    fn current_model(&self) -> Option<&ModelId>;

    /// Occupy the slot and start the model. Returns without waiting for it.
    fn start_model(
        &mut self,
        model_id: ModelId,
        on_finished: ModelFinishedCallback,
    ) -> Result<(), SwapError>;

    /// Ask the running model to wind down. Non-blocking; completion is
    /// reported through the callback.
    fn stop_model(&mut self) -> Result<(), SwapError>;

    /// Return a finished slot to idle.
    fn release_slot(&mut self) -> Result<(), SwapError>;

    /// Tear down for process shutdown. No callback fires after this returns.
    async fn close(&mut self);
}

/// Timing for the per-occupancy feed loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedSettings {
    pub input_idle_timeout: Duration,
    pub input_poll_interval: Duration,
    pub stop_grace: Duration,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            input_idle_timeout: Duration::from_secs(2),
            input_poll_interval: Duration::from_millis(100),
            stop_grace: Duration::from_secs(5),
        }
    }
}
