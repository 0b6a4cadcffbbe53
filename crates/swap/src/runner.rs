//! Model processes: how a slot turns a model id into a running process and
//! hands it input.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

use slotswap_core::{InputRecord, ModelExit, ModelId};

use crate::config::RunnerConfig;
use crate::error::SwapError;

/// Env var carrying the model id into the launched process.
pub const MODEL_ID_ENV: &str = "SLOTSWAP_MODEL_ID";
/// Placeholder substituted in runner args.
pub const MODEL_ID_PLACEHOLDER: &str = "{model_id}";

/// Starts model processes.
#[async_trait]
pub trait ModelRunner: Send + Sync {
    async fn launch(&self, model_id: &ModelId) -> Result<Box<dyn ModelProcess>, SwapError>;
}

/// One live model process.
#[async_trait]
pub trait ModelProcess: Send {
    /// Deliver one input record. Returning `Ok` means the record was handed
    /// over and may be consumed from the store.
    async fn feed(&mut self, record: &InputRecord) -> Result<(), SwapError>;

    /// Signal end of input and wait for the process to exit, for at most
    /// `grace` before forcing it down.
    async fn finish(self: Box<Self>, grace: Duration) -> ModelExit;
}

/// Runs the configured command once per occupancy and streams records to it
/// as JSON lines on stdin.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    config: RunnerConfig,
}

impl CommandRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    fn command_for(&self, model_id: &ModelId) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(
            self.config
                .args
                .iter()
                .map(|arg| arg.replace(MODEL_ID_PLACEHOLDER, model_id.as_str())),
        )
        .envs(&self.config.env)
        .env(MODEL_ID_ENV, model_id.as_str())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl ModelRunner for CommandRunner {
    async fn launch(&self, model_id: &ModelId) -> Result<Box<dyn ModelProcess>, SwapError> {
        if self.config.command.trim().is_empty() {
            return Err(SwapError::Runner("no runner command configured".into()));
        }

        let mut child = self.command_for(model_id).spawn().map_err(|e| {
            SwapError::Runner(format!("failed to spawn '{}': {e}", self.config.command))
        })?;

        relay_output(model_id, &mut child);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SwapError::Runner("child stdin was not piped".into()))?;

        info!(model = %model_id, pid = ?child.id(), "model process started");

        Ok(Box::new(CommandProcess {
            model_id: model_id.clone(),
            child,
            stdin: Some(BufWriter::new(stdin)),
        }))
    }
}

/// Re-emit the child's output as tracing events.
fn relay_output(model_id: &ModelId, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        let model_id = model_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(target: "slotswap::model", model = %model_id, "{line}");
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        let model_id = model_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(target: "slotswap::model", model = %model_id, "{line}");
            }
        });
    }
}

struct CommandProcess {
    model_id: ModelId,
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
}

#[async_trait]
impl ModelProcess for CommandProcess {
    async fn feed(&mut self, record: &InputRecord) -> Result<(), SwapError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| SwapError::Runner("stdin already closed".into()))?;

        let mut line = serde_json::to_vec(record)
            .map_err(|e| SwapError::Runner(format!("failed to encode record: {e}")))?;
        line.push(b'\n');

        stdin
            .write_all(&line)
            .await
            .map_err(|e| SwapError::Runner(format!("write to model stdin failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| SwapError::Runner(format!("flush of model stdin failed: {e}")))?;

        debug!(model = %self.model_id, record = %record.id, "record fed");
        Ok(())
    }

    async fn finish(self: Box<Self>, grace: Duration) -> ModelExit {
        let mut this = *self;

        // EOF on stdin is the process's cue to wind down. Flushing can block
        // on a process that stopped reading, so it shares the grace period.
        if let Some(mut stdin) = this.stdin.take() {
            match tokio::time::timeout(grace, stdin.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(model = %this.model_id, error = %e, "closing model stdin failed")
                }
                Err(_) => debug!(model = %this.model_id, "model stdin still full, dropping it"),
            }
        }

        match tokio::time::timeout(grace, this.child.wait()).await {
            Ok(Ok(status)) => exit_from_status(status),
            Ok(Err(e)) => ModelExit::failure(
                ModelExit::SIGNALED,
                format!("waiting for model process failed: {e}"),
            ),
            Err(_) => {
                warn!(
                    model = %this.model_id,
                    grace_ms = grace.as_millis() as u64,
                    "model process did not exit in time, killing"
                );
                if let Err(e) = this.child.kill().await {
                    warn!(model = %this.model_id, error = %e, "kill failed");
                }
                ModelExit::failure(
                    ModelExit::KILLED,
                    format!("killed after {}ms grace", grace.as_millis()),
                )
            }
        }
    }
}

fn exit_from_status(status: ExitStatus) -> ModelExit {
    match status.code() {
        Some(0) => ModelExit::success(),
        Some(code) => ModelExit::failure(code, "model process exited with non-zero status"),
        None => ModelExit::failure(ModelExit::SIGNALED, "model process terminated by signal"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use serde_json::json;

    use super::*;

    fn sh(script: &str) -> CommandRunner {
        CommandRunner::new(RunnerConfig {
            command: "sh".into(),
            args: vec!["-c".into(), script.into(), "sh".into(), "{model_id}".into()],
            ..RunnerConfig::default()
        })
    }

    #[tokio::test]
    async fn feeds_json_lines_and_exits_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.jsonl");
        let runner = sh(&format!("cat > {}", out.display()));
        let model = ModelId::new("m1");

        let mut process = runner.launch(&model).await.unwrap();
        for i in 0..2 {
            let record = InputRecord::new(model.clone(), json!({ "i": i }));
            process.feed(&record).await.unwrap();
        }
        let exit = process.finish(Duration::from_secs(5)).await;
        assert!(exit.is_success(), "{exit}");

        let written = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<InputRecord> = written
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].payload, json!({ "i": 1 }));
    }

    #[tokio::test]
    async fn model_id_reaches_args_and_env() {
        let runner = sh(r#"test "$1" = "abc" && test "$SLOTSWAP_MODEL_ID" = "abc""#);
        let process = runner.launch(&ModelId::new("abc")).await.unwrap();
        assert!(process.finish(Duration::from_secs(5)).await.is_success());
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let process = sh("exit 3").launch(&ModelId::new("m")).await.unwrap();
        assert_eq!(process.finish(Duration::from_secs(5)).await.code, 3);
    }

    #[tokio::test]
    async fn stubborn_process_is_killed_after_grace() {
        let process = sh("trap '' TERM; sleep 5").launch(&ModelId::new("m")).await.unwrap();
        let exit = process.finish(Duration::from_millis(100)).await;
        assert_eq!(exit.code, ModelExit::KILLED);
    }

    #[tokio::test]
    async fn process_ignoring_stdin_is_still_finished() {
        let model = ModelId::new("m");
        let mut process = sh("exec sleep 30").launch(&model).await.unwrap();

        // Larger than any pipe buffer, so the write cannot complete.
        let record = InputRecord::new(model.clone(), json!("x".repeat(1 << 20)));
        let fed = tokio::time::timeout(Duration::from_millis(200), process.feed(&record)).await;
        assert!(fed.is_err());

        let exit = tokio::time::timeout(
            Duration::from_secs(5),
            process.finish(Duration::from_millis(100)),
        )
        .await
        .unwrap();
        assert_eq!(exit.code, ModelExit::KILLED);
    }

    #[tokio::test]
    async fn missing_binary_fails_launch() {
        let runner = CommandRunner::new(RunnerConfig {
            command: "/nonexistent/slotswap-model".into(),
            ..RunnerConfig::default()
        });
        assert!(matches!(
            runner.launch(&ModelId::new("m")).await,
            Err(SwapError::Runner(_))
        ));
    }

    #[tokio::test]
    async fn empty_command_fails_launch() {
        let runner = CommandRunner::new(RunnerConfig::default());
        assert!(runner.launch(&ModelId::new("m")).await.is_err());
    }
}
