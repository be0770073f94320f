//! Per-module key/value storage.
//!
//! A thin handle over the store's `module_storage` table with the module
//! name fixed, so a module can only reach its own rows. Script modules
//! get it through the `storage_*` and `config_*` host functions.

use std::collections::HashMap;
use std::sync::Arc;

use kote_db::{StorageKind, StorageScope, Store, StoreError};

#[derive(Clone)]
pub struct ModuleStorage {
    module: String,
    store: Arc<Store>,
}

impl ModuleStorage {
    pub fn new(module: &str, store: Arc<Store>) -> Self {
        Self {
            module: module.to_string(),
            store,
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub async fn get(
        &self,
        key: &str,
        kind: StorageKind,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        self.store
            .module_value(&self.module, key, kind, StorageScope::default())
            .await
    }

    pub async fn set(
        &self,
        key: &str,
        value: &serde_json::Value,
        kind: StorageKind,
    ) -> Result<(), StoreError> {
        self.store
            .set_module_value(&self.module, key, value, kind, StorageScope::default())
            .await
    }

    /// Returns whether the key existed.
    pub async fn delete(&self, key: &str, kind: StorageKind) -> Result<bool, StoreError> {
        let removed = self
            .store
            .delete_module_values(&self.module, Some(key), kind, StorageScope::default())
            .await?;
        Ok(removed > 0)
    }

    pub async fn all(
        &self,
        kind: StorageKind,
    ) -> Result<HashMap<String, serde_json::Value>, StoreError> {
        self.store
            .module_values(&self.module, kind, StorageScope::default())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_storage_is_scoped_to_module() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let notes = ModuleStorage::new("notes", store.clone());
        let other = ModuleStorage::new("other", store);

        notes
            .set("k", &serde_json::json!({"n": 1}), StorageKind::Data)
            .await
            .unwrap();
        assert_eq!(
            notes.get("k", StorageKind::Data).await.unwrap(),
            Some(serde_json::json!({"n": 1}))
        );
        assert_eq!(other.get("k", StorageKind::Data).await.unwrap(), None);
        assert_eq!(notes.get("k", StorageKind::Config).await.unwrap(), None);

        assert_eq!(notes.all(StorageKind::Data).await.unwrap().len(), 1);
        assert!(notes.delete("k", StorageKind::Data).await.unwrap());
        assert!(!notes.delete("k", StorageKind::Data).await.unwrap());
    }
}
