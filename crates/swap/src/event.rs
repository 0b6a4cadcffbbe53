//! Events consumed by the controller loop, and the handle used to feed it.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::{mpsc, watch};
use tracing::info;

use slotswap_core::{ModelExit, ModelId};

use crate::metrics::SwapMetrics;

/// Everything that can change the controller's state. Events are handled
/// one at a time, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum SwapEvent {
    /// A model has (or may have) new input.
    NewInput(ModelId),
    /// The model occupying a slot has finished.
    ModelDone { model_id: ModelId, exit: ModelExit },
    /// Graceful shutdown was requested.
    StopRequested,
}

pub type EventSender = mpsc::UnboundedSender<SwapEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SwapEvent>;

/// The stop flag shared by the controller, its handles and the reader.
///
/// Setting the flag and enqueueing [`SwapEvent::StopRequested`] happen under
/// the same lock the reader holds while enqueueing, so no notification can
/// be handed off after the stop event.
#[derive(Debug)]
pub(crate) struct StopSignal {
    requested: Mutex<bool>,
    wake: watch::Sender<bool>,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        let (wake, _) = watch::channel(false);
        Self {
            requested: Mutex::new(false),
            wake,
        }
    }

    /// Returns `false` if a stop was already requested.
    pub(crate) fn request(&self, events: &EventSender) -> bool {
        let mut requested = self.requested.lock().unwrap_or_else(PoisonError::into_inner);
        if *requested {
            return false;
        }
        *requested = true;
        // The loop may already be gone; the flag alone still stops the reader.
        let _ = events.send(SwapEvent::StopRequested);
        drop(requested);
        self.wake.send_replace(true);
        true
    }

    pub(crate) fn is_requested(&self) -> bool {
        *self.requested.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with the flag held, unless a stop was already requested.
    pub(crate) fn unless_stopped<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        let requested = self.requested.lock().unwrap_or_else(PoisonError::into_inner);
        if *requested {
            None
        } else {
            Some(f())
        }
    }

    /// Receiver that observes the flag flipping to `true`.
    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.wake.subscribe()
    }
}

/// Cloneable handle for talking to a running [`crate::SwapController`].
#[derive(Clone)]
pub struct SwapHandle {
    pub(crate) events: EventSender,
    pub(crate) stop: Arc<StopSignal>,
    pub(crate) metrics: Arc<RwLock<SwapMetrics>>,
}

impl SwapHandle {
    /// Ask the controller to shut down gracefully. Idempotent; returns
    /// immediately.
    pub fn request_stop(&self) {
        if self.stop.request(&self.events) {
            info!("stop requested");
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_requested()
    }

    /// Snapshot of the controller metrics.
    pub fn metrics(&self) -> SwapMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
