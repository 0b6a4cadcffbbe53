use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use slotswap_core::{ModelExit, ModelId};
use slotswap_storage::InputStore;

use super::{feed, FeedSettings, ModelFinishedCallback, SlotAgent};
use crate::error::SwapError;
use crate::runner::ModelRunner;

/// A slot that runs each occupancy as its own tokio task.
pub struct ModelSlot {
    index: usize,
    runner: Arc<dyn ModelRunner>,
    store: Arc<dyn InputStore>,
    settings: FeedSettings,
    occupant: Option<Occupant>,
}

struct Occupant {
    model_id: ModelId,
    stop_tx: watch::Sender<bool>,
    stop_requested: bool,
    finished: Arc<AtomicBool>,
    /// Set by `close` so a late completion is not reported.
    silenced: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ModelSlot {
    pub fn new(
        index: usize,
        runner: Arc<dyn ModelRunner>,
        store: Arc<dyn InputStore>,
        settings: FeedSettings,
    ) -> Self {
        Self {
            index,
            runner,
            store,
            settings,
            occupant: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.occupant.is_none()
    }
}

#[async_trait]
impl SlotAgent for ModelSlot {
    fn index(&self) -> usize {
        self.index
    }

    fn current_model(&self) -> Option<&ModelId> {
        self.occupant.as_ref().map(|o| &o.model_id)
    }

    fn start_model(
        &mut self,
        model_id: ModelId,
        on_finished: ModelFinishedCallback,
    ) -> Result<(), SwapError> {
        if let Some(occupant) = &self.occupant {
            return Err(SwapError::slot(
                self.index,
                format!(
                    "cannot start {model_id}: still occupied by {}",
                    occupant.model_id
                ),
            ));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let finished = Arc::new(AtomicBool::new(false));
        let silenced = Arc::new(AtomicBool::new(false));

        let task = {
            let slot = self.index;
            let model_id = model_id.clone();
            let runner = Arc::clone(&self.runner);
            let store = Arc::clone(&self.store);
            let settings = self.settings;
            let finished = Arc::clone(&finished);
            let silenced = Arc::clone(&silenced);
            tokio::spawn(async move {
                // A panicking runner still has to free the slot.
                let occupancy = tokio::spawn(feed::run_occupancy(
                    slot,
                    model_id.clone(),
                    runner,
                    store,
                    settings,
                    stop_rx,
                ));
                let exit = match occupancy.await {
                    Ok(exit) => exit,
                    Err(e) => {
                        warn!(slot, model = %model_id, error = %e, "slot task panicked");
                        ModelExit::failure(ModelExit::PANICKED, e.to_string())
                    }
                };

                finished.store(true, Ordering::SeqCst);
                if silenced.load(Ordering::SeqCst) {
                    debug!(slot, model = %model_id, "slot closing, completion not reported");
                } else {
                    on_finished(exit);
                }
            })
        };

        debug!(slot = self.index, model = %model_id, "slot occupied");
        self.occupant = Some(Occupant {
            model_id,
            stop_tx,
            stop_requested: false,
            finished,
            silenced,
            task,
        });
        Ok(())
    }

    fn stop_model(&mut self) -> Result<(), SwapError> {
        let index = self.index;
        let occupant = self
            .occupant
            .as_mut()
            .ok_or_else(|| SwapError::slot(index, "stop requested on an idle slot"))?;
        if occupant.stop_requested {
            return Err(SwapError::slot(
                index,
                format!("stop already requested for {}", occupant.model_id),
            ));
        }

        occupant.stop_requested = true;
        occupant.stop_tx.send_replace(true);
        debug!(slot = index, model = %occupant.model_id, "stop signalled");
        Ok(())
    }

    fn release_slot(&mut self) -> Result<(), SwapError> {
        let finished = match &self.occupant {
            None => return Err(SwapError::slot(self.index, "release of an idle slot")),
            Some(occupant) => occupant.finished.load(Ordering::SeqCst),
        };
        if !finished {
            return Err(SwapError::slot(
                self.index,
                "release before the model reported completion",
            ));
        }

        if let Some(occupant) = self.occupant.take() {
            debug!(slot = self.index, model = %occupant.model_id, "slot released");
        }
        Ok(())
    }

    async fn close(&mut self) {
        let Some(occupant) = self.occupant.take() else {
            return;
        };
        occupant.silenced.store(true, Ordering::SeqCst);
        occupant.stop_tx.send_replace(true);
        if let Err(e) = occupant.task.await {
            warn!(slot = self.index, error = %e, "slot task ended abnormally");
        }
        info!(slot = self.index, model = %occupant.model_id, "slot closed");
    }
}
