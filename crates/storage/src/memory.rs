use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use slotswap_core::{InputRecord, ModelId};

use crate::error::StorageError;
use crate::store::InputStore;

/// Process-local [`InputStore`], for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryInputStore {
    records: Mutex<BTreeMap<ModelId, VecDeque<InputRecord>>>,
}

impl MemoryInputStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unconsumed records for a model.
    pub fn pending_count(&self, model_id: &ModelId) -> usize {
        self.lock().get(model_id).map_or(0, VecDeque::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<ModelId, VecDeque<InputRecord>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl InputStore for MemoryInputStore {
    async fn append(&self, model_id: &ModelId, payload: Value) -> Result<InputRecord, StorageError> {
        model_id.validate()?;
        let record = InputRecord::new(model_id.clone(), payload);
        self.lock()
            .entry(model_id.clone())
            .or_default()
            .push_back(record.clone());
        Ok(record)
    }

    async fn next_record(&self, model_id: &ModelId) -> Result<Option<InputRecord>, StorageError> {
        Ok(self.lock().get(model_id).and_then(|q| q.front().cloned()))
    }

    async fn ack(&self, record: &InputRecord) -> Result<(), StorageError> {
        let mut records = self.lock();
        let queue = records
            .get_mut(&record.model_id)
            .ok_or_else(|| StorageError::NotFound(record.id.to_string()))?;
        let pos = queue
            .iter()
            .position(|r| r.id == record.id)
            .ok_or_else(|| StorageError::NotFound(record.id.to_string()))?;
        queue.remove(pos);
        if queue.is_empty() {
            records.remove(&record.model_id);
        }
        Ok(())
    }

    async fn has_pending_input(&self, model_id: &ModelId) -> Result<bool, StorageError> {
        Ok(self.pending_count(model_id) > 0)
    }

    async fn models_with_pending_input(&self) -> Result<Vec<ModelId>, StorageError> {
        Ok(self.lock().keys().cloned().collect())
    }
}
