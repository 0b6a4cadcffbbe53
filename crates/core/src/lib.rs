pub mod config;
pub mod error;
pub mod model;

pub use config::{AwsConfig, QueueConfig};
pub use error::*;
pub use model::*;
