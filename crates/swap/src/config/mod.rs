//! Controller configuration: TOML file, environment overrides, validation.

mod loading;
mod types;
mod validation;


pub use loading::DEFAULT_CONFIG_FILE;
pub use types::{ControllerConfig, RunnerConfig, SwapConfig};
