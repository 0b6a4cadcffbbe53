//! Slot assignment, preemption and shutdown draining.

use std::collections::HashSet;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info};

use slotswap_core::ModelId;

use super::core::{LoopStatus, RunningModelInfo, SwapController};
use crate::error::SwapError;
use crate::event::SwapEvent;
use crate::slot::ModelFinishedCallback;

impl RunningModelInfo {
    fn new(slot: usize, seq: u64) -> Self {
        Self {
            slot,
            started_at: Utc::now(),
            last_activity: Instant::now(),
            activity_seq: seq,
        }
    }

    pub(super) fn touch(&mut self, seq: u64) {
        self.last_activity = Instant::now();
        self.activity_seq = seq;
    }
}

impl SwapController {
    pub(super) fn next_activity_seq(&mut self) -> u64 {
        self.activity_seq += 1;
        self.activity_seq
    }

    /// Put `model_id` into a free slot and start it.
    pub(super) fn assign_to_free_slot(&mut self, model_id: ModelId) -> Result<(), SwapError> {
        let slot = self.free_slots.pop().ok_or_else(|| {
            SwapError::Invariant(format!("no free slot to assign {model_id} to"))
        })?;

        let events = self.events_tx.clone();
        let finished_id = model_id.clone();
        let on_finished: ModelFinishedCallback = Box::new(move |exit| {
            let _ = events.send(SwapEvent::ModelDone {
                model_id: finished_id,
                exit,
            });
        });

        if let Err(e) = self.slots[slot].start_model(model_id.clone(), on_finished) {
            self.free_slots.push(slot);
            return Err(e);
        }

        let seq = self.next_activity_seq();
        self.running.insert(model_id.clone(), RunningModelInfo::new(slot, seq));
        self.with_metrics(|m| m.models_started += 1);
        info!(model = %model_id, slot, "model assigned");
        Ok(())
    }

    /// Ask at most one running model to stop so a waiting one can run.
    ///
    /// A stop is only requested while waiting models outnumber stops already
    /// in flight, so each waiting model triggers at most one preemption.
    pub(super) fn preempt_if_needed(&mut self) -> Result<(), SwapError> {
        if !self.free_slots.is_empty() || self.waiting.is_empty() {
            return Ok(());
        }
        if self.waiting.len() <= self.pending_preempt.len() {
            debug!(
                waiting = self.waiting.len(),
                pending = self.pending_preempt.len(),
                "enough stops already in flight"
            );
            return Ok(());
        }
        if self.pending_preempt.len() >= self.slots.len() {
            return Ok(());
        }

        let victim = self
            .running
            .iter()
            .filter(|(_, info)| !self.pending_preempt.contains(&info.slot))
            .min_by_key(|(_, info)| (info.last_activity, info.activity_seq))
            .map(|(model_id, info)| (model_id.clone(), info.slot));

        let Some((model_id, slot)) = victim else {
            return Ok(());
        };

        self.slots[slot].stop_model()?;
        self.pending_preempt.insert(slot);
        self.with_metrics(|m| m.preemptions_requested += 1);
        info!(
            model = %model_id,
            slot,
            waiting = self.waiting.len(),
            "preempting least recently active model"
        );
        Ok(())
    }

    /// Drive a requested stop forward. Returns `true` once nothing is running
    /// or waiting and the loop may exit.
    pub(crate) fn advance_shutdown(&mut self) -> Result<bool, SwapError> {
        if self.status != LoopStatus::StopPending {
            return Ok(false);
        }
        if self.running.is_empty() && self.waiting.is_empty() {
            info!("all models drained");
            return Ok(true);
        }

        // Waiting models still get their turn; stop the rest once the
        // queue is empty.
        if self.waiting.is_empty() && !self.shutdown_sweep_done {
            self.shutdown_sweep_done = true;
            let targets: Vec<(ModelId, usize)> = self
                .running
                .iter()
                .filter(|(_, info)| !self.pending_preempt.contains(&info.slot))
                .map(|(model_id, info)| (model_id.clone(), info.slot))
                .collect();
            for (model_id, slot) in targets {
                self.slots[slot].stop_model()?;
                self.pending_preempt.insert(slot);
                debug!(model = %model_id, slot, "stopping for shutdown");
            }
        }
        Ok(false)
    }

    /// Check the bookkeeping after an event.
    pub(crate) fn verify_invariants(&self) -> Result<(), SwapError> {
        let slots = self.slots.len();
        if self.running.len() + self.free_slots.len() != slots {
            return Err(SwapError::Invariant(format!(
                "{} running + {} free != {} slots",
                self.running.len(),
                self.free_slots.len(),
                slots
            )));
        }

        let mut seen = HashSet::new();
        for &slot in &self.free_slots {
            if slot >= slots || !seen.insert(slot) {
                return Err(SwapError::Invariant(format!("free slot {slot} invalid or listed twice")));
            }
        }

        let mut occupied = HashSet::new();
        for (model_id, info) in &self.running {
            if info.slot >= slots || seen.contains(&info.slot) || !occupied.insert(info.slot) {
                return Err(SwapError::Invariant(format!(
                    "slot {} of {model_id} is invalid, free or shared",
                    info.slot
                )));
            }
            if self.slots[info.slot].current_model() != Some(model_id) {
                return Err(SwapError::Invariant(format!(
                    "slot {} does not hold {model_id}",
                    info.slot
                )));
            }
        }

        let mut queued = HashSet::new();
        for model_id in &self.waiting {
            if self.running.contains_key(model_id) || !queued.insert(model_id) {
                return Err(SwapError::Invariant(format!(
                    "{model_id} is waiting twice or also running"
                )));
            }
        }

        if let Some(slot) = self.pending_preempt.iter().find(|s| !occupied.contains(*s)) {
            return Err(SwapError::Invariant(format!(
                "stop pending for unoccupied slot {slot}"
            )));
        }
        Ok(())
    }
}
