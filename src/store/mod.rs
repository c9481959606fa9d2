//! Persistence
//!
//! A plain keyed blob store ([`KeyValueStore`]) and the typed, expiring
//! [`SequenceStore`] layered over it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod error;
pub mod sequence;

pub use error::{StoreError, StoreResult};
pub use sequence::{Expirable, Pending, PendingStatus, Sequence, SequenceState, SequenceStore};

/// Seconds in a day
pub const DAY: u64 = 86_400;

/// Lifetime of a sequence that has not settled yet
pub const PENDING_TTL: u64 = DAY;

/// Source of the current unix time in seconds
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Current unix time in seconds
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Keyed string store with enumeration
pub trait KeyValueStore: Send + Sync {
    /// Value at `key`
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Insert or overwrite `key`
    fn set(&self, key: &str, value: String) -> StoreResult<()>;

    /// Remove `key`
    fn remove(&self, key: &str) -> StoreResult<()>;

    /// Every key currently stored
    fn keys(&self) -> StoreResult<Vec<String>>;
}

/// In-memory key-value store
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self
            .entries
            .read()
            .map_err(|_| StoreError::Poisoned)?
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: String) -> StoreResult<()> {
        self.entries
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.entries
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .remove(key);
        Ok(())
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        Ok(self
            .entries
            .read()
            .map_err(|_| StoreError::Poisoned)?
            .keys()
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_basics() {
        let store = MemoryKeyValueStore::new();
        assert_eq!(store.get("k").unwrap(), None);

        store.set("k", "v".to_string()).unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        assert_eq!(store.keys().unwrap(), vec!["k".to_string()]);

        store.remove("k").unwrap();
        assert!(store.keys().unwrap().is_empty());
    }
}
