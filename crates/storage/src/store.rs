use async_trait::async_trait;
use serde_json::Value;

use slotswap_core::{InputRecord, ModelId};

use crate::error::StorageError;

/// Per-model FIFO of input records with consume-on-ack semantics.
///
/// At most one consumer reads a given model at a time (the slot running it),
/// so `next_record` followed by `ack` needs no further coordination.
#[async_trait]
pub trait InputStore: Send + Sync {
    /// Append a record for a model (producer side).
    async fn append(&self, model_id: &ModelId, payload: Value) -> Result<InputRecord, StorageError>;

    /// Oldest unconsumed record for a model, left in place until acked.
    async fn next_record(&self, model_id: &ModelId) -> Result<Option<InputRecord>, StorageError>;

    /// Mark a record as consumed.
    async fn ack(&self, record: &InputRecord) -> Result<(), StorageError>;

    /// Whether the model has any unconsumed record.
    async fn has_pending_input(&self, model_id: &ModelId) -> Result<bool, StorageError>;

    /// Every model with at least one unconsumed record, sorted.
    async fn models_with_pending_input(&self) -> Result<Vec<ModelId>, StorageError>;
}
