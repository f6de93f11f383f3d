use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage capacity exceeded: {needed} bytes needed, {available} available")]
    CapacityExceeded { needed: usize, available: usize },

    #[error("Database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// A string-keyed medium with a finite write quota.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Replace the value under `key`. Fails with `CapacityExceeded` when the
    /// total stored bytes would pass the quota afterwards.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn used_bytes(&self) -> Result<usize, StorageError>;

    fn quota(&self) -> usize;
}

/// Check a write of `value_len` bytes against a quota, given the bytes used
/// by every other key.
pub fn check_quota(quota: usize, used_by_others: usize, value_len: usize) -> Result<(), StorageError> {
    let available = quota.saturating_sub(used_by_others);
    if value_len > available {
        return Err(StorageError::CapacityExceeded {
            needed: value_len,
            available,
        });
    }
    Ok(())
}

/// Process-local store, used when the database cannot be opened.
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    quota: usize,
}

impl MemoryStore {
    pub fn new(quota: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            quota,
        }
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StorageError> {
        self.entries
            .lock()
            .map_err(|_| StorageError::Database("memory store lock poisoned".to_string()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries()?;
        let used_by_others: usize = entries
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(_, v)| v.len())
            .sum();
        check_quota(self.quota, used_by_others, value.len())?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn used_bytes(&self) -> Result<usize, StorageError> {
        Ok(self.entries()?.values().map(|v| v.len()).sum())
    }

    fn quota(&self) -> usize {
        self.quota
    }
}
