//! Key-value storage seam and the record encoding used on top of it.

pub mod error;
pub mod file;
pub mod memory;
pub mod traits;

pub use error::{StorageError, StorageResult};
pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use traits::Storage;

use serde::{de::DeserializeOwned, Serialize};

/// Reads and decodes the JSON record at `key`.
pub(crate) fn read_json<T: DeserializeOwned>(
    storage: &dyn Storage,
    key: &str,
) -> StorageResult<Option<T>> {
    storage
        .get(key)?
        .map(|bytes| {
            serde_json::from_slice(&bytes)
                .map_err(|err| StorageError::corrupted(key, err.to_string()))
        })
        .transpose()
}

/// Encodes `value` as JSON and writes it at `key`.
pub(crate) fn write_json<T: Serialize>(
    storage: &dyn Storage,
    key: &str,
    value: &T,
) -> StorageResult<()> {
    let bytes = serde_json::to_vec(value)?;
    storage.put(key, &bytes)
}

/// Lists the leaf entries directly below `prefix`, skipping sub-directories.
pub(crate) fn list_leaves(storage: &dyn Storage, prefix: &str) -> StorageResult<Vec<String>> {
    Ok(storage
        .list(prefix)?
        .into_iter()
        .filter(|child| !child.ends_with('/'))
        .collect())
}
