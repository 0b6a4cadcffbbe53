//! Filesystem spool: one directory per model, one JSON file per record.
//!
//! ```text
//! <root>/
//!   <model_id>/
//!     <created-nanos>-<uuid>.json   (InputRecord)
//! ```
//!
//! Records that cannot be decoded are renamed to `<name>.json.bad` and skipped.
//!
//! File names sort in append order. A model has pending input exactly when its
//! directory holds at least one record file.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use slotswap_core::{InputRecord, ModelId};

use crate::error::StorageError;
use crate::store::InputStore;

const EXTENSION: &str = "json";
const BAD_SUFFIX: &str = ".bad";

#[derive(Debug, Clone)]
pub struct SpoolStore {
    root: PathBuf,
}

impl SpoolStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the spool root if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let store = Self::new(root);
        tokio::fs::create_dir_all(&store.root).await?;
        info!(root = %store.root.display(), "input spool opened");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn model_dir(&self, model_id: &ModelId) -> Result<PathBuf, StorageError> {
        model_id.validate()?;
        Ok(self.root.join(model_id.as_str()))
    }

    /// Sorted record file names for one model; empty if the directory is missing.
    async fn record_files(&self, dir: &Path) -> Result<Vec<String>, StorageError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_record_file(Path::new(&name)) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

fn is_record_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'));
    !hidden && path.extension().and_then(|e| e.to_str()) == Some(EXTENSION)
}

/// Rename a record to `<name>.bad` so it no longer counts as pending input.
async fn quarantine(path: &Path) -> Result<(), StorageError> {
    let mut bad = path.as_os_str().to_owned();
    bad.push(BAD_SUFFIX);
    match tokio::fs::rename(path, &bad).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Deterministic file name, so ack can locate a record from its contents.
fn record_file_name(record: &InputRecord) -> String {
    let nanos = record.created_at.timestamp_nanos_opt().unwrap_or_default();
    format!("{:020}-{}.{}", nanos, record.id, EXTENSION)
}

#[async_trait]
impl InputStore for SpoolStore {
    async fn append(&self, model_id: &ModelId, payload: Value) -> Result<InputRecord, StorageError> {
        let dir = self.model_dir(model_id)?;
        tokio::fs::create_dir_all(&dir).await?;

        let record = InputRecord::new(model_id.clone(), payload);
        let name = record_file_name(&record);
        let tmp = dir.join(format!(".{name}.tmp"));

        tokio::fs::write(&tmp, serde_json::to_vec(&record)?).await?;
        tokio::fs::rename(&tmp, dir.join(&name)).await?;

        debug!(model = %model_id, record = %record.id, "input appended");
        Ok(record)
    }

    async fn next_record(&self, model_id: &ModelId) -> Result<Option<InputRecord>, StorageError> {
        let dir = self.model_dir(model_id)?;
        for name in self.record_files(&dir).await? {
            let path = dir.join(&name);
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                // Raced with an ack; try the next file.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_slice::<InputRecord>(&bytes) {
                Ok(record) => return Ok(Some(record)),
                Err(e) => {
                    warn!(
                        model = %model_id,
                        file = %path.display(),
                        error = %e,
                        "undecodable input record, moving it aside"
                    );
                    quarantine(&path).await?;
                }
            }
        }
        Ok(None)
    }

    async fn ack(&self, record: &InputRecord) -> Result<(), StorageError> {
        let path = self.model_dir(&record.model_id)?.join(record_file_name(record));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn has_pending_input(&self, model_id: &ModelId) -> Result<bool, StorageError> {
        let dir = self.model_dir(model_id)?;
        Ok(!self.record_files(&dir).await?.is_empty())
    }

    async fn models_with_pending_input(&self) -> Result<Vec<ModelId>, StorageError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ModelId>, StorageError> {
            if !root.exists() {
                return Ok(Vec::new());
            }
            let mut models = BTreeSet::new();
            for entry in WalkDir::new(&root).min_depth(2).max_depth(2) {
                let entry = entry?;
                if !entry.file_type().is_file() || !is_record_file(entry.path()) {
                    continue;
                }
                let model = entry
                    .path()
                    .parent()
                    .and_then(|p| p.file_name())
                    .and_then(|n| n.to_str())
                    .map(ModelId::new);
                if let Some(model) = model {
                    models.insert(model);
                }
            }
            Ok(models.into_iter().collect())
        })
        .await
        .map_err(|e| StorageError::Join(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn spool() -> (tempfile::TempDir, SpoolStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SpoolStore::open(dir.path().join("spool")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn records_come_back_in_append_order() {
        let (_dir, store) = spool().await;
        let m = ModelId::new("cpu");
        for i in 0..3 {
            store.append(&m, json!({ "seq": i })).await.unwrap();
        }

        for i in 0..3 {
            let record = store.next_record(&m).await.unwrap().unwrap();
            assert_eq!(record.payload, json!({ "seq": i }));
            store.ack(&record).await.unwrap();
        }
        assert!(store.next_record(&m).await.unwrap().is_none());
        assert!(!store.has_pending_input(&m).await.unwrap());
    }

    #[tokio::test]
    async fn pending_models_scan() {
        let (_dir, store) = spool().await;
        store.append(&ModelId::new("b"), json!(1)).await.unwrap();
        store.append(&ModelId::new("a"), json!(1)).await.unwrap();
        let drained = store.append(&ModelId::new("c"), json!(1)).await.unwrap();
        store.ack(&drained).await.unwrap();

        assert_eq!(
            store.models_with_pending_input().await.unwrap(),
            vec![ModelId::new("a"), ModelId::new("b")]
        );
    }

    #[tokio::test]
    async fn survives_reopen() {
        let (dir, store) = spool().await;
        store.append(&ModelId::new("m"), json!("x")).await.unwrap();
        drop(store);

        let reopened = SpoolStore::open(dir.path().join("spool")).await.unwrap();
        assert!(reopened.has_pending_input(&ModelId::new("m")).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_model_has_no_input() {
        let (_dir, store) = spool().await;
        assert!(!store.has_pending_input(&ModelId::new("ghost")).await.unwrap());
        assert!(store.next_record(&ModelId::new("ghost")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_root_means_nothing_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = SpoolStore::new(dir.path().join("absent"));
        assert!(store.models_with_pending_input().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn undecodable_record_is_moved_aside() {
        let (_dir, store) = spool().await;
        let m = ModelId::new("m");
        let broken = store.append(&m, json!("first")).await.unwrap();
        store.append(&m, json!("second")).await.unwrap();

        let path = store.root().join("m").join(record_file_name(&broken));
        std::fs::write(&path, "{not json").unwrap();

        let record = store.next_record(&m).await.unwrap().unwrap();
        assert_eq!(record.payload, json!("second"));
        assert!(!path.exists());
        assert!(store
            .root()
            .join("m")
            .join(format!("{}.bad", record_file_name(&broken)))
            .exists());

        store.ack(&record).await.unwrap();
        assert!(!store.has_pending_input(&m).await.unwrap());
        assert!(store.models_with_pending_input().await.unwrap().is_empty());
        assert!(store.next_record(&m).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_path_escaping_ids() {
        let (_dir, store) = spool().await;
        assert!(matches!(
            store.append(&ModelId::new("../x"), json!(1)).await,
            Err(StorageError::Core(_))
        ));
    }
}
