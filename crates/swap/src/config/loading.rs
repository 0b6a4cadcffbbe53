use std::path::{Path, PathBuf};

use tracing::{info, warn};

use slotswap_queue::ChannelKind;

use super::types::ControllerConfig;
use crate::error::SwapError;

/// Config file picked up from the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "swap-controller.toml";

impl ControllerConfig {
    /// Parse config from a TOML string, then apply env overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, SwapError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SwapError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Load from `path`, or from [`DEFAULT_CONFIG_FILE`] if present, or fall
    /// back to defaults plus env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, SwapError> {
        if let Some(path) = path {
            info!(path = %path.display(), "loading controller config");
            return Self::from_file(path);
        }
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        if default_path.is_file() {
            info!(path = %default_path.display(), "loading controller config");
            return Self::from_file(default_path);
        }
        info!("no config file found, using defaults");
        Self::from_toml("")
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// - `SLOTSWAP_SCHEDULER_CONCURRENCY` -> `scheduler.concurrency`
    /// - `SLOTSWAP_RUNNER_COMMAND` -> `runner.command`
    /// - `SLOTSWAP_CHANNEL_KIND` -> `channel.kind`
    /// - `SLOTSWAP_CHANNEL_DIR` -> `channel.dir`
    /// - `SLOTSWAP_SPOOL_DIR` -> `spool.dir`
    pub(crate) fn apply_env_overrides(&mut self) -> Result<(), SwapError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    pub(crate) fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), SwapError> {
        if let Some(v) = lookup("SLOTSWAP_SCHEDULER_CONCURRENCY") {
            match v.trim().parse::<usize>() {
                Ok(n) => self.scheduler.concurrency = n,
                Err(_) => warn!(value = %v, "ignoring unparseable SLOTSWAP_SCHEDULER_CONCURRENCY"),
            }
        }
        if let Some(v) = lookup("SLOTSWAP_RUNNER_COMMAND") {
            self.runner.command = v;
        }
        if let Some(v) = lookup("SLOTSWAP_CHANNEL_KIND") {
            self.channel.kind = v
                .parse::<ChannelKind>()
                .map_err(|e| SwapError::Config(e.to_string()))?;
        }
        if let Some(v) = lookup("SLOTSWAP_CHANNEL_DIR") {
            self.channel.dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("SLOTSWAP_SPOOL_DIR") {
            self.spool.dir = PathBuf::from(v);
        }
        Ok(())
    }
}
