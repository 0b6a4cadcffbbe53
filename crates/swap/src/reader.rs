//! Notification reader: turns channel messages into `NewInput` events.
//!
//! Runs as its own task. Each message is handed to the controller before it
//! is acknowledged, so a crash in between redelivers rather than loses it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use slotswap_core::ModelId;
use slotswap_queue::{parse_notification, NotificationChannel};
use slotswap_storage::InputStore;

use crate::error::SwapError;
use crate::event::{EventSender, StopSignal, SwapEvent};

pub struct NotificationReader {
    channel: Arc<dyn NotificationChannel>,
    store: Arc<dyn InputStore>,
    events: EventSender,
    stop: Arc<StopSignal>,
    batch_size: u32,
    wait: Duration,
}

impl NotificationReader {
    pub(crate) fn new(
        channel: Arc<dyn NotificationChannel>,
        store: Arc<dyn InputStore>,
        events: EventSender,
        stop: Arc<StopSignal>,
        batch_size: u32,
        wait: Duration,
    ) -> Self {
        Self {
            channel,
            store,
            events,
            stop,
            batch_size,
            wait,
        }
    }

    /// Initialize the channel, signal `ready`, reconcile persisted input, then
    /// consume until a stop is requested.
    ///
    /// Returns `Ok` only after a stop. Any channel or store error ends the
    /// reader with that error.
    pub async fn run(self, ready: oneshot::Sender<()>) -> Result<(), SwapError> {
        self.channel.init().await?;
        let mut wake = self.stop.subscribe();
        // `run` may have given up waiting; carry on regardless.
        let _ = ready.send(());
        info!(batch_size = self.batch_size, "notification reader ready");

        let pending = self.store.models_with_pending_input().await?;
        if !pending.is_empty() {
            info!(models = pending.len(), "re-notifying models with persisted input");
        }
        for model_id in pending {
            if !self.hand_off(model_id) {
                return Ok(());
            }
        }

        loop {
            if self.stop.is_requested() {
                return Ok(());
            }

            let batch = tokio::select! {
                _ = wake.changed() => return Ok(()),
                batch = self.channel.poll_batch(self.batch_size, self.wait) => batch?,
            };

            for message in batch {
                let model_id = match parse_notification(&message) {
                    Ok(model_id) => model_id,
                    Err(e) => {
                        warn!(
                            message_id = %message.id,
                            attempt = message.attempt_count,
                            error = %e,
                            "discarding malformed notification"
                        );
                        self.channel.ack(&message.receipt_handle).await?;
                        continue;
                    }
                };

                if !self.hand_off(model_id) {
                    // Unacked messages are redelivered to the next run.
                    return Ok(());
                }
                self.channel.ack(&message.receipt_handle).await?;
            }
        }
    }

    /// Enqueue a `NewInput` unless the controller is stopping.
    fn hand_off(&self, model_id: ModelId) -> bool {
        let delivered = self
            .stop
            .unless_stopped(|| self.events.send(SwapEvent::NewInput(model_id.clone())).is_ok());
        match delivered {
            Some(true) => {
                debug!(model = %model_id, "notification handed off");
                true
            }
            Some(false) => {
                debug!(model = %model_id, "controller gone, reader exiting");
                false
            }
            None => {
                debug!(model = %model_id, "stop requested, notification left unacked");
                false
            }
        }
    }
}
