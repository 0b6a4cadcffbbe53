use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use slotswap_core::ModelId;
use slotswap_queue::NotificationChannel;
use slotswap_storage::InputStore;

use crate::config::SwapConfig;
use crate::error::SwapError;
use crate::event::{EventReceiver, EventSender, StopSignal, SwapHandle};
use crate::metrics::SwapMetrics;
use crate::reader::NotificationReader;
use crate::runner::ModelRunner;
use crate::slot::{FeedSettings, ModelSlot, SlotAgent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Active,
    /// Stop requested; draining running and waiting models.
    StopPending,
    Terminated,
}

/// Bookkeeping for a model that holds a slot.
#[derive(Debug, Clone)]
pub struct RunningModelInfo {
    pub slot: usize,
    pub started_at: DateTime<Utc>,
    /// Refreshed whenever a notification arrives for the running model.
    pub last_activity: Instant,
    /// Orders models whose `last_activity` compares equal.
    pub activity_seq: u64,
}

type ReaderTask = JoinHandle<Result<(), SwapError>>;

/// Owns the slots and all scheduling state. Every mutation happens on the
/// task that calls [`SwapController::run`], one event at a time.
pub struct SwapController {
    pub(super) config: SwapConfig,
    pub(super) slots: Vec<Box<dyn SlotAgent>>,
    pub(super) free_slots: Vec<usize>,
    /// Models with input that could not get a slot, oldest first.
    pub(super) waiting: VecDeque<ModelId>,
    pub(super) running: HashMap<ModelId, RunningModelInfo>,
    /// Slots already asked to stop whose completion has not arrived.
    pub(super) pending_preempt: HashSet<usize>,
    pub(super) status: LoopStatus,
    pub(super) shutdown_sweep_done: bool,
    pub(super) activity_seq: u64,
    pub(super) store: Arc<dyn InputStore>,
    pub(super) channel: Arc<dyn NotificationChannel>,
    pub(super) events_tx: EventSender,
    pub(super) events_rx: EventReceiver,
    pub(super) stop: Arc<StopSignal>,
    pub(super) metrics: Arc<RwLock<SwapMetrics>>,
}

impl SwapController {
    /// Build a controller over caller-supplied slots. `slots[i].index()`
    /// must equal `i` and there must be exactly `config.concurrency` of them.
    pub fn new(
        config: SwapConfig,
        slots: Vec<Box<dyn SlotAgent>>,
        store: Arc<dyn InputStore>,
        channel: Arc<dyn NotificationChannel>,
    ) -> Result<Self, SwapError> {
        config.validate()?;
        if slots.len() != config.concurrency {
            return Err(SwapError::Config(format!(
                "expected {} slots, got {}",
                config.concurrency,
                slots.len()
            )));
        }
        if let Some((i, slot)) = slots.iter().enumerate().find(|(i, s)| s.index() != *i) {
            return Err(SwapError::Config(format!(
                "slot at position {i} reports index {}",
                slot.index()
            )));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let concurrency = config.concurrency;
        Ok(Self {
            config,
            slots,
            // Popped from the back, so slot 0 is used first.
            free_slots: (0..concurrency).rev().collect(),
            waiting: VecDeque::new(),
            running: HashMap::new(),
            pending_preempt: HashSet::new(),
            status: LoopStatus::Active,
            shutdown_sweep_done: false,
            activity_seq: 0,
            store,
            channel,
            events_tx,
            events_rx,
            stop: Arc::new(StopSignal::new()),
            metrics: Arc::new(RwLock::new(SwapMetrics::new(concurrency))),
        })
    }

    /// Build a controller whose slots launch models through `runner`.
    pub fn with_runner(
        config: SwapConfig,
        runner: Arc<dyn ModelRunner>,
        feed: FeedSettings,
        store: Arc<dyn InputStore>,
        channel: Arc<dyn NotificationChannel>,
    ) -> Result<Self, SwapError> {
        let slots = (0..config.concurrency)
            .map(|i| {
                Box::new(ModelSlot::new(i, Arc::clone(&runner), Arc::clone(&store), feed))
                    as Box<dyn SlotAgent>
            })
            .collect();
        Self::new(config, slots, store, channel)
    }

    pub fn handle(&self) -> SwapHandle {
        SwapHandle {
            events: self.events_tx.clone(),
            stop: Arc::clone(&self.stop),
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// See [`SwapHandle::request_stop`].
    pub fn request_stop(&self) {
        self.handle().request_stop();
    }

    pub fn status(&self) -> LoopStatus {
        self.status
    }

    pub fn concurrency(&self) -> usize {
        self.slots.len()
    }

    pub fn metrics(&self) -> SwapMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn running_models(&self) -> Vec<(ModelId, RunningModelInfo)> {
        let mut running: Vec<_> = self
            .running
            .iter()
            .map(|(id, info)| (id.clone(), info.clone()))
            .collect();
        running.sort_by_key(|(_, info)| info.slot);
        running
    }

    pub fn waiting_models(&self) -> Vec<ModelId> {
        self.waiting.iter().cloned().collect()
    }

    pub(super) fn with_metrics(&self, f: impl FnOnce(&mut SwapMetrics)) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut metrics);
    }

    /// Start the notification reader, then process events until a requested
    /// stop has drained every slot.
    ///
    /// Errors are fatal for the host process; see [`SwapError::exit_code`].
    pub async fn run(mut self) -> Result<(), SwapError> {
        info!(concurrency = self.slots.len(), "swap controller starting");

        let reader = NotificationReader::new(
            Arc::clone(&self.channel),
            Arc::clone(&self.store),
            self.events_tx.clone(),
            Arc::clone(&self.stop),
            self.config.notification_batch_size,
            self.config.notification_wait(),
        );
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut reader_task: ReaderTask = tokio::spawn(reader.run(ready_tx));

        let deadline = self.config.reader_start_timeout();
        if let Err(e) = Self::await_reader_ready(deadline, ready_rx, &mut reader_task).await {
            reader_task.abort();
            return Err(e);
        }

        let reader_done = match self.event_loop(&mut reader_task).await {
            Ok(reader_done) => reader_done,
            Err(e) => {
                error!(error = %e, "swap controller failed");
                reader_task.abort();
                return Err(e);
            }
        };

        if !reader_done {
            match reader_task.await {
                Ok(Ok(())) => debug!("notification reader stopped"),
                Ok(Err(e)) => warn!(error = %e, "notification reader failed during shutdown"),
                Err(e) => warn!(error = %e, "notification reader task ended abnormally"),
            }
        }

        info!("swap controller stopped");
        Ok(())
    }

    async fn await_reader_ready(
        deadline: Duration,
        ready: oneshot::Receiver<()>,
        reader_task: &mut ReaderTask,
    ) -> Result<(), SwapError> {
        match tokio::time::timeout(deadline, ready).await {
            Ok(Ok(())) => {
                debug!("notification reader is ready");
                Ok(())
            }
            // The reader ended before signalling.
            Ok(Err(_)) => match reader_task.await {
                Ok(Err(e)) => Err(SwapError::ReaderFailed(e.to_string())),
                Ok(Ok(())) => Err(SwapError::ReaderExited),
                Err(e) => Err(SwapError::ReaderFailed(e.to_string())),
            },
            Err(_) => {
                error!(
                    timeout_ms = deadline.as_millis() as u64,
                    "notification reader did not start in time"
                );
                Err(SwapError::ReaderStartTimeout(deadline))
            }
        }
    }

    /// Returns whether the reader task has already been joined.
    async fn event_loop(&mut self, reader_task: &mut ReaderTask) -> Result<bool, SwapError> {
        let mut reader_done = false;

        loop {
            let event = tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => event,
                    // The controller holds a sender, so this cannot happen.
                    None => return Err(SwapError::Invariant("event queue closed".into())),
                },
                joined = &mut *reader_task, if !reader_done => {
                    reader_done = true;
                    self.check_reader_exit(joined)?;
                    continue;
                }
            };

            self.handle_event(event).await?;

            if self.advance_shutdown()? {
                break;
            }
        }

        self.close_slots().await;
        self.status = LoopStatus::Terminated;
        Ok(reader_done)
    }

    /// The reader may only finish on its own after a stop was requested.
    fn check_reader_exit(
        &self,
        joined: Result<Result<(), SwapError>, JoinError>,
    ) -> Result<(), SwapError> {
        match joined {
            Ok(Ok(())) if self.stop.is_requested() => {
                debug!("notification reader stopped");
                Ok(())
            }
            Ok(Ok(())) => {
                error!("notification reader exited unexpectedly");
                Err(SwapError::ReaderExited)
            }
            Ok(Err(e)) => {
                error!(error = %e, "notification reader failed");
                Err(SwapError::ReaderFailed(e.to_string()))
            }
            Err(e) => Err(SwapError::ReaderFailed(format!("reader task ended abnormally: {e}"))),
        }
    }

    async fn close_slots(&mut self) {
        for slot in &mut self.slots {
            slot.close().await;
        }
        debug!(slots = self.slots.len(), "all slots closed");
    }
}
