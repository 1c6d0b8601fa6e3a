//! In-memory key-value store.
//!
//! Nothing is persisted beyond the lifetime of the value. Suitable for tests
//! and for hosts that embed the backend in a short-lived process.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use super::error::{StorageError, StorageResult};
use super::traits::Storage;

/// In-memory store backed by an ordered map.
///
/// Thread-safe; concurrent readers do not block each other.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the map lock is poisoned.
    pub fn len(&self) -> StorageResult<usize> {
        Ok(self.read_entries()?.len())
    }

    /// Returns `true` if nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the map lock is poisoned.
    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.read_entries()?.is_empty())
    }

    /// Returns a copy of every stored key and value.
    ///
    /// # Errors
    ///
    /// Returns an error if the map lock is poisoned.
    pub fn snapshot(&self) -> StorageResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .read_entries()?
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn read_entries(
        &self,
    ) -> StorageResult<std::sync::RwLockReadGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.entries
            .read()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))
    }

    fn write_entries(
        &self,
    ) -> StorageResult<std::sync::RwLockWriteGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.entries
            .write()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.read_entries()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.write_entries()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        self.write_entries()?.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let entries = self.read_entries()?;
        let children: BTreeSet<String> = entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| child_of(&key[prefix.len()..]))
            .collect();
        Ok(children.into_iter().collect())
    }
}

/// Returns the first path segment of `rest`, keeping the separator when the
/// key continues below it.
fn child_of(rest: &str) -> String {
    match rest.find('/') {
        Some(idx) => rest[..=idx].to_string(),
        None => rest.to_string(),
    }
}
