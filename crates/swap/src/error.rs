use std::time::Duration;

use slotswap_queue::QueueError;
use slotswap_storage::StorageError;

/// Process exit code when the notification reader misses its startup deadline.
pub const EXIT_READER_START_TIMEOUT: i32 = 2;
/// Process exit code when the notification reader fails or exits unexpectedly.
pub const EXIT_READER_FAILED: i32 = 3;
/// Process exit code for every other fatal error.
pub const EXIT_FATAL: i32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    #[error("notification reader did not become ready within {0:?}")]
    ReaderStartTimeout(Duration),

    #[error("notification reader failed: {0}")]
    ReaderFailed(String),

    #[error("notification reader exited before a stop was requested")]
    ReaderExited,

    #[error("notification channel error: {0}")]
    Queue(#[from] QueueError),

    #[error("input store error: {0}")]
    Storage(#[from] StorageError),

    #[error("model runner error: {0}")]
    Runner(String),

    #[error("slot {slot}: {reason}")]
    SlotContract { slot: usize, reason: String },

    #[error("scheduler invariant violated: {0}")]
    Invariant(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config io error: {0}")]
    ConfigIo(#[from] std::io::Error),
}

impl SwapError {
    /// Exit code the host process should terminate with for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            SwapError::ReaderStartTimeout(_) => EXIT_READER_START_TIMEOUT,
            SwapError::ReaderFailed(_) | SwapError::ReaderExited => EXIT_READER_FAILED,
            _ => EXIT_FATAL,
        }
    }

    pub(crate) fn slot(slot: usize, reason: impl Into<String>) -> Self {
        SwapError::SlotContract {
            slot,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(
            SwapError::ReaderStartTimeout(Duration::from_secs(5)).exit_code(),
            EXIT_READER_START_TIMEOUT
        );
        assert_eq!(SwapError::ReaderExited.exit_code(), EXIT_READER_FAILED);
        assert_eq!(
            SwapError::ReaderFailed("boom".into()).exit_code(),
            EXIT_READER_FAILED
        );
        assert_eq!(SwapError::Invariant("x".into()).exit_code(), EXIT_FATAL);
        assert_eq!(SwapError::slot(0, "busy").exit_code(), EXIT_FATAL);
    }

    #[test]
    fn slot_contract_message() {
        assert_eq!(
            SwapError::slot(2, "stop requested twice").to_string(),
            "slot 2: stop requested twice"
        );
    }
}
