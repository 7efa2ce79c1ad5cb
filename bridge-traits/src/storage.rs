//! Durable Key-Value Storage Abstraction
//!
//! Browser hosts back this with `localStorage`; desktop hosts with a file.
//! Access is synchronous on purpose: the host store is expected to be a
//! small string map that is read on the calling task without suspension.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use crate::error::Result;

/// Durable string key-value storage trait
///
/// Values written here must survive a page reload or process restart and are
/// shared by every component (and, in browsers, every tab) of the host.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::KeyValueStore;
///
/// fn remember(store: &dyn KeyValueStore, token: &str) -> Result<()> {
///     store.set_item("jwt_token", token)
/// }
/// ```
pub trait KeyValueStore: Send + Sync {
    /// Retrieve a value, `Ok(None)` when the key is absent
    fn get_item(&self, key: &str) -> Result<Option<String>>;

    /// Store a value, replacing any previous one
    fn set_item(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value. Removing an absent key succeeds.
    fn remove_item(&self, key: &str) -> Result<()>;

    /// List every stored key
    fn keys(&self) -> Result<Vec<String>>;

    /// Check if a key exists without returning its value
    fn has_item(&self, key: &str) -> Result<bool> {
        Ok(self.get_item(key)?.is_some())
    }

    /// Remove every key matching `predicate`, returning the removed keys.
    fn remove_matching(&self, predicate: &dyn Fn(&str) -> bool) -> Result<Vec<String>> {
        let doomed: Vec<String> = self
            .keys()?
            .into_iter()
            .filter(|key| predicate(key))
            .collect();

        for key in &doomed {
            self.remove_item(key)?;
        }

        Ok(doomed)
    }
}

/// In-memory store for tests and hosts without persistence.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.keys().cloned().collect())
    }
}
