//! Model identity, input records, and run outcomes shared by every crate.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CoreError;

/// Opaque identifier of one stateful model (the unit of scheduling).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check that the id is non-empty and usable as a single path component.
    ///
    /// Filesystem-backed stores key directories by model id, so anything that
    /// could escape the spool root is rejected.
    pub fn validate(&self) -> Result<(), CoreError> {
        let reason = if self.0.is_empty() {
            Some("empty")
        } else if self.0 == "." || self.0 == ".." {
            Some("relative path component")
        } else if self.0.contains(['/', '\\', '\0']) {
            Some("contains a path separator or NUL")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(CoreError::InvalidModelId {
                id: self.0.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ModelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One unit of input destined for a single model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRecord {
    pub id: Uuid,
    pub model_id: ModelId,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl InputRecord {
    pub fn new(model_id: ModelId, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            model_id,
            payload,
            created_at: Utc::now(),
        }
    }
}

/// Outcome of one model occupancy of a slot.
///
/// Code `0` means the model drained its input or stopped cleanly. The
/// scheduler frees the slot the same way for every code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelExit {
    pub code: i32,
    pub detail: Option<String>,
}

impl ModelExit {
    /// The runner process could not be started.
    pub const LAUNCH_FAILED: i32 = 125;
    /// Relaying input to the runner process failed.
    pub const FEED_FAILED: i32 = 126;
    /// The process ignored the stop grace period and was killed.
    pub const KILLED: i32 = 137;
    /// The slot's runner task panicked.
    pub const PANICKED: i32 = 134;
    /// The process was terminated by a signal and reported no code.
    pub const SIGNALED: i32 = -1;

    pub fn success() -> Self {
        Self {
            code: 0,
            detail: None,
        }
    }

    pub fn failure(code: i32, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: Some(detail.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

impl fmt::Display for ModelExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "exit {} ({})", self.code, detail),
            None => write!(f, "exit {}", self.code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_id_validation() {
        assert!(ModelId::new("abc").validate().is_ok());
        assert!(ModelId::new("metric-42.cpu").validate().is_ok());
        assert!(ModelId::new("").validate().is_err());
        assert!(ModelId::new("..").validate().is_err());
        assert!(ModelId::new("a/b").validate().is_err());
        assert!(ModelId::new("a\\b").validate().is_err());
    }

    #[test]
    fn model_id_serializes_as_plain_string() {
        let id = ModelId::new("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
        let back: ModelId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn exit_status_helpers() {
        assert!(ModelExit::success().is_success());
        let failed = ModelExit::failure(ModelExit::LAUNCH_FAILED, "no such file");
        assert!(!failed.is_success());
        assert_eq!(failed.to_string(), "exit 125 (no such file)");
    }

    #[test]
    fn input_record_gets_fresh_id() {
        let a = InputRecord::new(ModelId::new("m"), serde_json::json!({"v": 1}));
        let b = InputRecord::new(ModelId::new("m"), serde_json::json!({"v": 1}));
        assert_ne!(a.id, b.id);
        assert_eq!(a.model_id, b.model_id);
    }
}
