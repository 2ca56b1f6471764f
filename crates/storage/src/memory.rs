use std::collections::HashMap;
use std::sync::Mutex;

use snafu::ensure;

use super::error::{InvalidKeySnafu, StorageError, StorageResult};
use super::{KeyValueStore, is_valid_key};

/// Process-local store, used for ephemeral runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(key: impl Into<String>, value: impl Into<String>) -> Self {
        let store = Self::default();
        if let Ok(mut entries) = store.entries.lock() {
            entries.insert(key.into(), value.into());
        }
        store
    }

    fn entries(&self) -> StorageResult<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| StorageError::InvariantViolation {
                stage: "memory-store-lock",
                details: "memory store mutex was poisoned".to_string(),
            })
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        ensure!(
            is_valid_key(key),
            InvalidKeySnafu {
                stage: "memory-store-get",
                key,
            }
        );
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        ensure!(
            is_valid_key(key),
            InvalidKeySnafu {
                stage: "memory-store-set",
                key,
            }
        );
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
