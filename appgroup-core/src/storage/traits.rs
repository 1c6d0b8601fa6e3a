//! Host interface for the persistent key-value store.

use super::error::StorageResult;

/// Persistent key-value store provided by the host.
///
/// Keys are `/`-separated strings. Implementations must offer at least
/// read-your-writes consistency: a `get` issued after a successful `put` or
/// `delete` on the same handle observes it.
pub trait Storage: Send + Sync {
    /// Reads the value stored at `key`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Writes `value` at `key`, replacing any previous value in one step.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn put(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Deletes the value at `key`. Deleting a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    fn delete(&self, key: &str) -> StorageResult<()>;

    /// Lists the keys directly below `prefix`, relative to it.
    ///
    /// A child that has further descendants is returned with a trailing `/`,
    /// once. `list("app/")` over `app/web` and `app/web/x` yields
    /// `["web", "web/"]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;
}
