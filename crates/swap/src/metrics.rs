use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use slotswap_core::ModelExit;

/// Controller counters and gauges, updated after every handled event.
#[derive(Debug, Clone, Serialize)]
pub struct SwapMetrics {
    pub concurrency: usize,
    pub models_started: u64,
    pub models_finished: u64,
    /// Occupancies that ended with a non-zero exit.
    pub model_failures: u64,
    pub preemptions_requested: u64,
    pub notifications_handled: u64,
    /// Notifications for a model that was already running or waiting.
    pub duplicate_notifications: u64,
    /// Notifications ignored because shutdown was in progress.
    pub dropped_notifications: u64,
    /// Completions that still had input and were re-notified.
    pub rescheduled_after_done: u64,
    pub running: usize,
    pub waiting: usize,
    pub pending_preempt: usize,
    /// Mean time a model held its slot.
    pub avg_occupancy: Duration,
    pub last_exit: Option<ModelExit>,
    pub started_at: DateTime<Utc>,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl SwapMetrics {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            models_started: 0,
            models_finished: 0,
            model_failures: 0,
            preemptions_requested: 0,
            notifications_handled: 0,
            duplicate_notifications: 0,
            dropped_notifications: 0,
            rescheduled_after_done: 0,
            running: 0,
            waiting: 0,
            pending_preempt: 0,
            avg_occupancy: Duration::ZERO,
            last_exit: None,
            started_at: Utc::now(),
            last_event_at: None,
        }
    }

    /// Record a finished occupancy.
    pub fn record_done(&mut self, exit: &ModelExit, occupied: Duration) {
        self.models_finished += 1;
        if !exit.is_success() {
            self.model_failures += 1;
        }
        self.last_exit = Some(exit.clone());

        // Incremental mean: new_avg = prev_avg + (occupied - prev_avg) / count
        let count = self.models_finished;
        self.avg_occupancy = if count == 1 {
            occupied
        } else {
            let prev = self.avg_occupancy.as_nanos() as f64;
            let cur = occupied.as_nanos() as f64;
            Duration::from_nanos((prev + (cur - prev) / count as f64) as u64)
        };
    }

    /// Fraction of slots currently occupied (0.0 - 1.0).
    pub fn slot_utilization(&self) -> f64 {
        if self.concurrency == 0 {
            return 0.0;
        }
        self.running as f64 / self.concurrency as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_metrics() {
        let m = SwapMetrics::new(4);
        assert_eq!(m.models_started, 0);
        assert_eq!(m.slot_utilization(), 0.0);
        assert!(m.last_event_at.is_none());
    }

    #[test]
    fn record_done_averages_and_counts_failures() {
        let mut m = SwapMetrics::new(2);
        m.record_done(&ModelExit::success(), Duration::from_millis(100));
        m.record_done(
            &ModelExit::failure(ModelExit::KILLED, "killed"),
            Duration::from_millis(200),
        );

        assert_eq!(m.models_finished, 2);
        assert_eq!(m.model_failures, 1);
        assert_eq!(m.last_exit.as_ref().map(|e| e.code), Some(137));
        let avg = m.avg_occupancy.as_millis();
        assert!((140..=160).contains(&avg), "expected ~150ms, got {avg}ms");
    }

    #[test]
    fn utilization() {
        let mut m = SwapMetrics::new(4);
        m.running = 3;
        assert_eq!(m.slot_utilization(), 0.75);
    }
}
