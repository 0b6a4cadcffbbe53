use chrono::Utc;
use tracing::{debug, info, warn};

use slotswap_core::{ModelExit, ModelId};

use super::core::{LoopStatus, SwapController};
use crate::error::SwapError;
use crate::event::SwapEvent;

impl SwapController {
    /// Apply one event, then re-check the scheduling invariants.
    pub(crate) async fn handle_event(&mut self, event: SwapEvent) -> Result<(), SwapError> {
        match event {
            SwapEvent::NewInput(model_id) => self.on_new_input(model_id)?,
            SwapEvent::ModelDone { model_id, exit } => self.on_model_done(model_id, exit).await?,
            SwapEvent::StopRequested => self.on_stop_requested(),
        }

        let (running, waiting, pending) =
            (self.running.len(), self.waiting.len(), self.pending_preempt.len());
        self.with_metrics(|m| {
            m.running = running;
            m.waiting = waiting;
            m.pending_preempt = pending;
            m.last_event_at = Some(Utc::now());
        });

        self.verify_invariants()
    }

    fn on_new_input(&mut self, model_id: ModelId) -> Result<(), SwapError> {
        self.with_metrics(|m| m.notifications_handled += 1);

        if self.running.contains_key(&model_id) {
            let seq = self.next_activity_seq();
            if let Some(info) = self.running.get_mut(&model_id) {
                info.touch(seq);
            }
            self.with_metrics(|m| m.duplicate_notifications += 1);
            debug!(model = %model_id, "model already running, activity refreshed");
            return Ok(());
        }

        if self.waiting.contains(&model_id) {
            self.with_metrics(|m| m.duplicate_notifications += 1);
            debug!(model = %model_id, "model already waiting");
            return Ok(());
        }

        if self.status != LoopStatus::Active {
            // Input stays in the store and is reconciled on the next start.
            self.with_metrics(|m| m.dropped_notifications += 1);
            info!(model = %model_id, "shutting down, not scheduling model");
            return Ok(());
        }

        if self.free_slots.is_empty() {
            debug!(model = %model_id, waiting = self.waiting.len() + 1, "no free slot, model waits");
            self.waiting.push_back(model_id);
            self.preempt_if_needed()
        } else {
            self.assign_to_free_slot(model_id)
        }
    }

    async fn on_model_done(&mut self, model_id: ModelId, exit: ModelExit) -> Result<(), SwapError> {
        let info = self.running.remove(&model_id).ok_or_else(|| {
            SwapError::Invariant(format!("completion for {model_id}, which is not running"))
        })?;
        let slot = info.slot;
        let was_preempted = self.pending_preempt.remove(&slot);

        self.slots[slot].release_slot()?;
        self.free_slots.push(slot);

        let occupied = (Utc::now() - info.started_at).to_std().unwrap_or_default();
        self.with_metrics(|m| m.record_done(&exit, occupied));

        if exit.is_success() {
            info!(model = %model_id, slot, preempted = was_preempted, "model finished");
        } else {
            warn!(model = %model_id, slot, preempted = was_preempted, %exit, "model failed");
        }

        // Input that arrived after the model stopped reading must not be
        // stranded; send it back through the normal path.
        if self.store.has_pending_input(&model_id).await? {
            debug!(model = %model_id, "input remains, re-notifying");
            self.with_metrics(|m| m.rescheduled_after_done += 1);
            // The loop owns a receiver, so this send cannot fail.
            let _ = self.events_tx.send(SwapEvent::NewInput(model_id));
        }

        if let Some(next) = self.waiting.pop_front() {
            self.assign_to_free_slot(next)?;
            self.preempt_if_needed()?;
        }
        Ok(())
    }

    fn on_stop_requested(&mut self) {
        if self.status == LoopStatus::Active {
            info!(
                running = self.running.len(),
                waiting = self.waiting.len(),
                "stop requested, draining"
            );
            self.status = LoopStatus::StopPending;
        }
    }
}
