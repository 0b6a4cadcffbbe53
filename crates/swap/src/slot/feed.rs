use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use slotswap_core::{ModelExit, ModelId};
use slotswap_storage::InputStore;

use super::FeedSettings;
use crate::error::SwapError;
use crate::runner::{ModelProcess, ModelRunner};

struct FeedSummary {
    records: u64,
    stopped: bool,
}

/// One occupancy: launch, feed until drained or stopped, finish.
pub(super) async fn run_occupancy(
    slot: usize,
    model_id: ModelId,
    runner: Arc<dyn ModelRunner>,
    store: Arc<dyn InputStore>,
    settings: FeedSettings,
    mut stop: watch::Receiver<bool>,
) -> ModelExit {
    let mut process = match runner.launch(&model_id).await {
        Ok(process) => process,
        Err(e) => {
            warn!(slot, model = %model_id, error = %e, "model launch failed");
            return ModelExit::failure(ModelExit::LAUNCH_FAILED, e.to_string());
        }
    };

    let fed = feed_input(
        &model_id,
        process.as_mut(),
        store.as_ref(),
        &settings,
        &mut stop,
    )
    .await;
    let exit = process.finish(settings.stop_grace).await;

    match fed {
        Ok(summary) => {
            info!(
                slot,
                model = %model_id,
                records = summary.records,
                stopped = summary.stopped,
                %exit,
                "model occupancy ended"
            );
            exit
        }
        Err(e) => {
            warn!(slot, model = %model_id, error = %e, %exit, "feeding model failed");
            if exit.is_success() {
                ModelExit::failure(ModelExit::FEED_FAILED, e.to_string())
            } else {
                exit
            }
        }
    }
}

/// Feed records oldest first. A record is acked only after the process
/// accepted it.
///
/// A stop is honored between records, but only once at least one record has
/// been fed: a model stopped the moment it was started still makes progress.
/// A record the process has not accepted within `stop_grace` of a stop is
/// abandoned unacked.
async fn feed_input(
    model_id: &ModelId,
    process: &mut dyn ModelProcess,
    store: &dyn InputStore,
    settings: &FeedSettings,
    stop: &mut watch::Receiver<bool>,
) -> Result<FeedSummary, SwapError> {
    let mut records = 0;
    let mut last_input = Instant::now();

    loop {
        let stop_requested = *stop.borrow();
        if stop_requested && records > 0 {
            return Ok(FeedSummary {
                records,
                stopped: true,
            });
        }

        if let Some(record) = store.next_record(model_id).await? {
            let fed = tokio::select! {
                fed = process.feed(&record) => Some(fed),
                _ = stop_deadline(stop, settings.stop_grace) => None,
            };
            let Some(fed) = fed else {
                warn!(
                    model = %model_id,
                    record = %record.id,
                    "model not accepting input after stop, leaving record pending"
                );
                return Ok(FeedSummary {
                    records,
                    stopped: true,
                });
            };
            fed?;
            store.ack(&record).await?;
            records += 1;
            last_input = Instant::now();
            continue;
        }

        if stop_requested {
            return Ok(FeedSummary {
                records,
                stopped: true,
            });
        }
        if last_input.elapsed() >= settings.input_idle_timeout {
            debug!(model = %model_id, "input exhausted");
            return Ok(FeedSummary {
                records,
                stopped: false,
            });
        }

        tokio::select! {
            changed = stop.changed() => {
                // Sender gone means the slot was torn down.
                if changed.is_err() {
                    return Ok(FeedSummary { records, stopped: true });
                }
            }
            _ = tokio::time::sleep(settings.input_poll_interval) => {}
        }
    }
}

/// Resolves `grace` after a stop is requested or the slot is torn down.
async fn stop_deadline(stop: &mut watch::Receiver<bool>, grace: Duration) {
    let _ = stop.wait_for(|stopped| *stopped).await;
    tokio::time::sleep(grace).await;
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;
    use slotswap_core::InputRecord;
    use slotswap_storage::MemoryInputStore;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        fed: Mutex<Vec<InputRecord>>,
        fail_feed: bool,
        stall_feed: bool,
    }

    struct RecordingProcess(Arc<Recorder>);

    #[async_trait]
    impl ModelProcess for RecordingProcess {
        async fn feed(&mut self, record: &InputRecord) -> Result<(), SwapError> {
            if self.0.fail_feed {
                return Err(SwapError::Runner("pipe closed".into()));
            }
            if self.0.stall_feed {
                std::future::pending::<()>().await;
            }
            self.0.fed.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn finish(self: Box<Self>, _grace: Duration) -> ModelExit {
            ModelExit::success()
        }
    }

    struct RecordingRunner(Arc<Recorder>);

    #[async_trait]
    impl ModelRunner for RecordingRunner {
        async fn launch(&self, _model_id: &ModelId) -> Result<Box<dyn ModelProcess>, SwapError> {
            Ok(Box::new(RecordingProcess(self.0.clone())))
        }
    }

    struct BrokenRunner;

    #[async_trait]
    impl ModelRunner for BrokenRunner {
        async fn launch(&self, _model_id: &ModelId) -> Result<Box<dyn ModelProcess>, SwapError> {
            Err(SwapError::Runner("no such file".into()))
        }
    }

    fn fast() -> FeedSettings {
        FeedSettings {
            input_idle_timeout: Duration::from_millis(50),
            input_poll_interval: Duration::from_millis(5),
            stop_grace: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn drains_then_exits() {
        let store = Arc::new(MemoryInputStore::new());
        let model = ModelId::new("m");
        for i in 0..3 {
            store.append(&model, json!(i)).await.unwrap();
        }
        let recorder = Arc::new(Recorder::default());
        let (_stop_tx, stop_rx) = watch::channel(false);

        let exit = run_occupancy(
            0,
            model.clone(),
            Arc::new(RecordingRunner(recorder.clone())),
            store.clone(),
            fast(),
            stop_rx,
        )
        .await;

        assert!(exit.is_success());
        let fed = recorder.fed.lock().unwrap();
        assert_eq!(
            fed.iter().map(|r| r.payload.clone()).collect::<Vec<_>>(),
            vec![json!(0), json!(1), json!(2)]
        );
        assert_eq!(store.pending_count(&model), 0);
    }

    #[tokio::test]
    async fn stopped_occupancy_feeds_one_record() {
        let store = Arc::new(MemoryInputStore::new());
        let model = ModelId::new("m");
        store.append(&model, json!(1)).await.unwrap();
        store.append(&model, json!(2)).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        let (stop_tx, stop_rx) = watch::channel(true);

        let exit = run_occupancy(
            1,
            model.clone(),
            Arc::new(RecordingRunner(recorder.clone())),
            store.clone(),
            fast(),
            stop_rx,
        )
        .await;
        drop(stop_tx);

        assert!(exit.is_success());
        assert_eq!(recorder.fed.lock().unwrap().len(), 1);
        assert_eq!(store.pending_count(&model), 1);
    }

    #[tokio::test]
    async fn stop_without_input_ends_at_once() {
        let store = Arc::new(MemoryInputStore::new());
        let recorder = Arc::new(Recorder::default());
        let (_stop_tx, stop_rx) = watch::channel(true);
        let settings = FeedSettings {
            input_idle_timeout: Duration::from_secs(3600),
            ..fast()
        };

        let exit = tokio::time::timeout(
            Duration::from_secs(5),
            run_occupancy(
                0,
                ModelId::new("m"),
                Arc::new(RecordingRunner(recorder)),
                store,
                settings,
                stop_rx,
            ),
        )
        .await
        .expect("stopped occupancy without input should end");
        assert!(exit.is_success());
    }

    #[tokio::test]
    async fn launch_failure_is_reported_as_exit() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let exit = run_occupancy(
            0,
            ModelId::new("m"),
            Arc::new(BrokenRunner),
            Arc::new(MemoryInputStore::new()),
            fast(),
            stop_rx,
        )
        .await;
        assert_eq!(exit.code, ModelExit::LAUNCH_FAILED);
    }

    #[tokio::test]
    async fn feed_failure_keeps_record() {
        let store = Arc::new(MemoryInputStore::new());
        let model = ModelId::new("m");
        store.append(&model, json!(1)).await.unwrap();
        let recorder = Arc::new(Recorder {
            fail_feed: true,
            ..Recorder::default()
        });
        let (_stop_tx, stop_rx) = watch::channel(false);

        let exit = run_occupancy(
            0,
            model.clone(),
            Arc::new(RecordingRunner(recorder)),
            store.clone(),
            fast(),
            stop_rx,
        )
        .await;

        assert_eq!(exit.code, ModelExit::FEED_FAILED);
        assert_eq!(store.pending_count(&model), 1);
    }

    #[tokio::test]
    async fn stop_abandons_a_stalled_feed() {
        let store = Arc::new(MemoryInputStore::new());
        let model = ModelId::new("m");
        store.append(&model, json!(1)).await.unwrap();
        let recorder = Arc::new(Recorder {
            stall_feed: true,
            ..Recorder::default()
        });
        let (stop_tx, stop_rx) = watch::channel(false);

        let occupancy = tokio::spawn(run_occupancy(
            0,
            model.clone(),
            Arc::new(RecordingRunner(recorder)),
            store.clone(),
            fast(),
            stop_rx,
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!occupancy.is_finished());

        stop_tx.send(true).unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), occupancy)
            .await
            .expect("stalled feed should be abandoned after a stop")
            .unwrap();

        assert!(exit.is_success());
        assert_eq!(store.pending_count(&model), 1);
    }

    #[tokio::test]
    async fn stalled_first_record_is_bounded_by_grace() {
        let store = Arc::new(MemoryInputStore::new());
        let model = ModelId::new("m");
        store.append(&model, json!(1)).await.unwrap();
        let recorder = Arc::new(Recorder {
            stall_feed: true,
            ..Recorder::default()
        });
        let (_stop_tx, stop_rx) = watch::channel(true);

        let exit = tokio::time::timeout(
            Duration::from_secs(5),
            run_occupancy(
                0,
                model.clone(),
                Arc::new(RecordingRunner(recorder)),
                store.clone(),
                fast(),
                stop_rx,
            ),
        )
        .await
        .expect("stop should end the occupancy despite the stalled feed");

        assert!(exit.is_success());
        assert_eq!(store.pending_count(&model), 1);
    }
}
