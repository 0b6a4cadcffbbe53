//! End-to-end tests: real slots and reader, in-process or shell model runners.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::timeout;

use slotswap_core::{InputRecord, ModelExit, ModelId};
use slotswap_queue::{FileChannel, MemoryChannel, NotificationChannel};
use slotswap_storage::{InputStore, MemoryInputStore, SpoolStore};
use slotswap_swap::{
    FeedSettings, LoopStatus, ModelProcess, ModelRunner, SwapConfig, SwapController, SwapError,
};

const TIMEOUT: Duration = Duration::from_secs(10);

type Fed = Arc<Mutex<Vec<(ModelId, Value)>>>;

/// Runner whose processes live in-process and record what they are fed.
struct RecordingRunner {
    fed: Fed,
}

struct RecordingProcess {
    model_id: ModelId,
    fed: Fed,
}

#[async_trait]
impl ModelRunner for RecordingRunner {
    async fn launch(&self, model_id: &ModelId) -> Result<Box<dyn ModelProcess>, SwapError> {
        Ok(Box::new(RecordingProcess {
            model_id: model_id.clone(),
            fed: self.fed.clone(),
        }))
    }
}

#[async_trait]
impl ModelProcess for RecordingProcess {
    async fn feed(&mut self, record: &InputRecord) -> Result<(), SwapError> {
        self.fed
            .lock()
            .unwrap()
            .push((self.model_id.clone(), record.payload.clone()));
        Ok(())
    }

    async fn finish(self: Box<Self>, _grace: Duration) -> ModelExit {
        ModelExit::success()
    }
}

fn config(concurrency: usize) -> SwapConfig {
    SwapConfig {
        concurrency,
        reader_start_timeout_ms: 2_000,
        notification_batch_size: 10,
        notification_wait_ms: 20,
    }
}

fn fast_feed() -> FeedSettings {
    FeedSettings {
        input_idle_timeout: Duration::from_millis(50),
        input_poll_interval: Duration::from_millis(5),
        stop_grace: Duration::from_secs(2),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn by_model(fed: &Fed) -> BTreeMap<ModelId, Vec<Value>> {
    let mut out: BTreeMap<ModelId, Vec<Value>> = BTreeMap::new();
    for (model_id, payload) in fed.lock().unwrap().iter() {
        out.entry(model_id.clone()).or_default().push(payload.clone());
    }
    out
}

#[tokio::test]
async fn more_models_than_slots_all_drain() {
    let store = Arc::new(MemoryInputStore::new());
    let channel = Arc::new(MemoryChannel::new());
    let fed = Fed::default();

    let models: Vec<ModelId> = (1..=4).map(|i| ModelId::new(format!("m{i}"))).collect();
    for model_id in &models {
        for seq in 0..2 {
            store.append(model_id, json!({ "seq": seq })).await.unwrap();
        }
        channel.publish(model_id).await.unwrap();
    }

    let controller = SwapController::with_runner(
        config(2),
        Arc::new(RecordingRunner { fed: fed.clone() }),
        fast_feed(),
        store.clone(),
        channel.clone(),
    )
    .unwrap();
    let handle = controller.handle();
    let run = tokio::spawn(controller.run());

    wait_until(|| fed.lock().unwrap().len() == 8).await;
    handle.request_stop();
    timeout(TIMEOUT, run).await.unwrap().unwrap().unwrap();

    let fed = by_model(&fed);
    assert_eq!(fed.len(), 4);
    for payloads in fed.values() {
        assert_eq!(payloads, &vec![json!({ "seq": 0 }), json!({ "seq": 1 })]);
    }
    for model_id in &models {
        assert_eq!(store.pending_count(model_id), 0);
    }

    let metrics = handle.metrics();
    assert!(metrics.models_started >= 4);
    assert_eq!(metrics.models_started, metrics.models_finished);
    assert_eq!(metrics.running, 0);
    assert_eq!(channel.in_flight_count(), 0);
}

#[tokio::test]
async fn spooled_input_is_reconciled_on_start() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SpoolStore::open(dir.path().join("spool")).await.unwrap());
    let channel = Arc::new(FileChannel::new(dir.path().join("notifications")));
    let fed = Fed::default();

    // Input written by a producer that died before notifying.
    store.append(&ModelId::new("orphan"), json!("left behind")).await.unwrap();

    let controller = SwapController::with_runner(
        config(1),
        Arc::new(RecordingRunner { fed: fed.clone() }),
        fast_feed(),
        store.clone(),
        channel,
    )
    .unwrap();
    let handle = controller.handle();
    let run = tokio::spawn(controller.run());

    wait_until(|| !fed.lock().unwrap().is_empty()).await;
    handle.request_stop();
    timeout(TIMEOUT, run).await.unwrap().unwrap().unwrap();

    assert_eq!(
        *fed.lock().unwrap(),
        vec![(ModelId::new("orphan"), json!("left behind"))]
    );
    assert!(store.models_with_pending_input().await.unwrap().is_empty());
}

#[tokio::test]
async fn corrupt_spool_record_does_not_relaunch_model() {
    let dir = tempfile::tempdir().unwrap();
    let spool = dir.path().join("spool");
    let store = Arc::new(SpoolStore::open(spool.clone()).await.unwrap());
    let channel = Arc::new(MemoryChannel::new());
    let fed = Fed::default();

    let model = ModelId::new("m");
    store.append(&model, json!("broken")).await.unwrap();
    store.append(&model, json!("good")).await.unwrap();
    let broken = std::fs::read_dir(spool.join("m"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| std::fs::read_to_string(p).unwrap().contains("broken"))
        .unwrap();
    std::fs::write(&broken, "{not json").unwrap();

    let controller = SwapController::with_runner(
        config(1),
        Arc::new(RecordingRunner { fed: fed.clone() }),
        fast_feed(),
        store.clone(),
        channel,
    )
    .unwrap();
    let handle = controller.handle();
    let run = tokio::spawn(controller.run());

    wait_until(|| handle.metrics().models_finished >= 1).await;
    // Long enough for a relaunch loop to show up in the counters.
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.request_stop();
    timeout(TIMEOUT, run).await.unwrap().unwrap().unwrap();

    assert_eq!(*fed.lock().unwrap(), vec![(model.clone(), json!("good"))]);
    assert!(!store.has_pending_input(&model).await.unwrap());

    let metrics = handle.metrics();
    assert_eq!(metrics.models_started, 1);
    assert_eq!(metrics.model_failures, 0);
}

#[tokio::test]
async fn malformed_notifications_are_skipped() {
    let store = Arc::new(MemoryInputStore::new());
    let channel = Arc::new(MemoryChannel::new());
    let fed = Fed::default();

    channel.publish_raw("{\"model_id\": \"\"}");
    channel.publish_raw("garbage");
    store.append(&ModelId::new("good"), json!(1)).await.unwrap();
    channel.publish(&ModelId::new("good")).await.unwrap();

    let controller = SwapController::with_runner(
        config(1),
        Arc::new(RecordingRunner { fed: fed.clone() }),
        fast_feed(),
        store.clone(),
        channel.clone(),
    )
    .unwrap();
    let handle = controller.handle();
    let run = tokio::spawn(controller.run());

    wait_until(|| fed.lock().unwrap().len() == 1).await;
    handle.request_stop();
    timeout(TIMEOUT, run).await.unwrap().unwrap().unwrap();

    assert_eq!(channel.ready_count() + channel.in_flight_count(), 0);
}

#[tokio::test]
async fn stop_interrupts_busy_models() {
    let store = Arc::new(MemoryInputStore::new());
    let channel = Arc::new(MemoryChannel::new());
    let fed = Fed::default();

    store.append(&ModelId::new("slow"), json!(1)).await.unwrap();
    channel.publish(&ModelId::new("slow")).await.unwrap();

    // Idle timeout far beyond the test timeout: only a stop ends the occupancy.
    let feed = FeedSettings {
        input_idle_timeout: Duration::from_secs(3600),
        ..fast_feed()
    };
    let controller = SwapController::with_runner(
        config(1),
        Arc::new(RecordingRunner { fed: fed.clone() }),
        feed,
        store,
        channel,
    )
    .unwrap();
    assert_eq!(controller.status(), LoopStatus::Active);
    let handle = controller.handle();
    let run = tokio::spawn(controller.run());

    wait_until(|| fed.lock().unwrap().len() == 1).await;
    handle.request_stop();
    timeout(TIMEOUT, run).await.unwrap().unwrap().unwrap();

    let metrics = handle.metrics();
    assert_eq!(metrics.models_finished, 1);
    assert_eq!(metrics.model_failures, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn shell_models_receive_json_lines() {
    use slotswap_swap::{CommandRunner, RunnerConfig};

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    std::fs::create_dir_all(&out).unwrap();

    let store = Arc::new(MemoryInputStore::new());
    let channel = Arc::new(MemoryChannel::new());
    for model in ["alpha", "beta"] {
        let model_id = ModelId::new(model);
        for i in 0..3 {
            store.append(&model_id, json!({ "i": i })).await.unwrap();
        }
        channel.publish(&model_id).await.unwrap();
    }

    let runner = CommandRunner::new(RunnerConfig {
        command: "sh".into(),
        args: vec![
            "-c".into(),
            r#"cat >> "$0/$SLOTSWAP_MODEL_ID.jsonl""#.into(),
            out.display().to_string(),
        ],
        ..RunnerConfig::default()
    });
    let controller = SwapController::with_runner(
        config(2),
        Arc::new(runner),
        fast_feed(),
        store.clone(),
        channel,
    )
    .unwrap();
    let handle = controller.handle();
    let run = tokio::spawn(controller.run());

    wait_until(|| {
        ["alpha", "beta"]
            .iter()
            .all(|m| store.pending_count(&ModelId::new(*m)) == 0)
    })
    .await;
    handle.request_stop();
    timeout(TIMEOUT, run).await.unwrap().unwrap().unwrap();

    for model in ["alpha", "beta"] {
        let written = std::fs::read_to_string(out.join(format!("{model}.jsonl"))).unwrap();
        let records: Vec<InputRecord> = written
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 3, "{model}: {written}");
        assert!(records.iter().all(|r| r.model_id.as_str() == model));
    }
}
