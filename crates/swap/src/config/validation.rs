use super::types::{ControllerConfig, SwapConfig};
use crate::error::SwapError;

impl SwapConfig {
    pub fn validate(&self) -> Result<(), SwapError> {
        if self.concurrency == 0 {
            return Err(SwapError::Config(
                "scheduler.concurrency must be at least 1".into(),
            ));
        }
        if !(1..=10).contains(&self.notification_batch_size) {
            return Err(SwapError::Config(format!(
                "scheduler.notification_batch_size must be between 1 and 10, got {}",
                self.notification_batch_size
            )));
        }
        Ok(())
    }
}

impl ControllerConfig {
    /// Validate the whole file. The runner command is checked separately by
    /// [`ControllerConfig::require_runner_command`], since only `run` needs it.
    pub fn validate(&self) -> Result<(), SwapError> {
        self.scheduler.validate()?;
        if self.runner.input_poll_interval_ms == 0 {
            return Err(SwapError::Config(
                "runner.input_poll_interval_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn require_runner_command(&self) -> Result<(), SwapError> {
        if self.runner.command.trim().is_empty() {
            return Err(SwapError::Config(
                "runner.command is not set (config file or SLOTSWAP_RUNNER_COMMAND)".into(),
            ));
        }
        Ok(())
    }
}
