use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::StorageError;
use crate::memory::MemoryInputStore;
use crate::spool::SpoolStore;
use crate::store::InputStore;

/// Which [`InputStore`] implementation backs the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    #[default]
    Fs,
}

/// `[spool]` section of the controller config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub kind: StoreKind,
    #[serde(default = "default_spool_dir")]
    pub dir: PathBuf,
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("data/spool")
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            dir: default_spool_dir(),
        }
    }
}

/// Open the configured store.
pub async fn open_store(settings: &StoreSettings) -> Result<Arc<dyn InputStore>, StorageError> {
    let store: Arc<dyn InputStore> = match settings.kind {
        StoreKind::Memory => {
            info!("Storage: in-memory input store (nothing persists)");
            Arc::new(MemoryInputStore::new())
        }
        StoreKind::Fs => Arc::new(SpoolStore::open(settings.dir.clone()).await?),
    };
    Ok(store)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use slotswap_core::ModelId;

    use super::*;

    #[tokio::test]
    async fn fs_store_creates_root() {
        let dir = tempfile::tempdir().unwrap();
        let settings = StoreSettings {
            kind: StoreKind::Fs,
            dir: dir.path().join("spool"),
        };
        let store = open_store(&settings).await.unwrap();
        assert!(settings.dir.is_dir());
        store.append(&ModelId::new("m"), json!(1)).await.unwrap();
        assert_eq!(store.models_with_pending_input().await.unwrap().len(), 1);
    }

    #[test]
    fn kind_names() {
        let s: StoreSettings = serde_json::from_str(r#"{"kind":"memory"}"#).unwrap();
        assert_eq!(s.kind, StoreKind::Memory);
        assert_eq!(StoreSettings::default().kind, StoreKind::Fs);
    }
}
