//! Durable "model has new input" notification channel.
//!
//! Producers publish a notification after writing input for a model; the
//! swap controller's notification reader long-polls the channel and acks each
//! message only after handing it to the scheduler (at-least-once).

pub mod channel;
pub mod error;
pub mod factory;
pub mod file;
pub mod memory;
pub mod parser;
pub mod sqs;

pub use channel::{ChannelHealth, NotificationChannel, QueueMessage};
pub use error::QueueError;
pub use factory::{connect_channel, ChannelKind, ChannelSettings};
pub use file::FileChannel;
pub use memory::MemoryChannel;
pub use parser::{encode_notification, parse_notification};
pub use sqs::SqsChannel;
