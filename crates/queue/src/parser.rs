//! Notification body codec.
//!
//! The canonical body is `{"model_id": "<id>"}`. Producers in other stacks
//! have used `modelId` / `model`, or sent the id as a bare JSON string, so
//! all of those are accepted on the read side.

use serde_json::Value;

use slotswap_core::ModelId;

use crate::channel::QueueMessage;
use crate::error::QueueError;

/// Well-known field names for the model id (tried in order).
const MODEL_ID_KEYS: &[&str] = &["model_id", "modelId", "model"];

/// Encode the canonical notification body for a model.
pub fn encode_notification(model_id: &ModelId) -> String {
    serde_json::json!({ "model_id": model_id.as_str() }).to_string()
}

/// Extract and validate the model id carried by a notification.
pub fn parse_notification(msg: &QueueMessage) -> Result<ModelId, QueueError> {
    let json: Value = serde_json::from_str(&msg.body)
        .map_err(|e| QueueError::Parse(format!("Invalid JSON in message {}: {}", msg.id, e)))?;

    let raw = match &json {
        Value::String(s) => Some(s.as_str()),
        Value::Object(obj) => MODEL_ID_KEYS
            .iter()
            .find_map(|k| obj.get(*k).and_then(|v| v.as_str())),
        _ => None,
    }
    .ok_or_else(|| QueueError::Parse(format!("Message {} carries no model id", msg.id)))?;

    let model_id = ModelId::new(raw);
    model_id
        .validate()
        .map_err(|e| QueueError::Parse(format!("Message {}: {}", msg.id, e)))?;
    Ok(model_id)
}
