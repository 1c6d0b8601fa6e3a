//! Salted hashing of secret values.
//!
//! Every secret ID, and every accessor used as an index key, is stored only
//! as `hex(SHA-256(salt || value))`. The salt is generated once per storage
//! and persisted under [`SALT_KEY`].

use std::fmt;

use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{AppGroupError, AppGroupResult};
use crate::storage::{Storage, StorageError};

/// Storage key of the persisted salt.
pub const SALT_KEY: &str = "salt";

/// Length of the salt in bytes.
pub const SALT_LEN: usize = 32;

/// Derives deterministic, irreversible digests of raw secret values.
///
/// The salt is owned by the hasher and never changes after construction.
pub struct SaltedHasher {
    salt: Zeroizing<[u8; SALT_LEN]>,
}

impl fmt::Debug for SaltedHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaltedHasher").finish_non_exhaustive()
    }
}

impl SaltedHasher {
    /// Loads the persisted salt, or creates and persists a new one.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store cannot be read or written or the
    /// stored salt is malformed, and an internal error if no randomness is
    /// available.
    pub fn initialize(storage: &dyn Storage) -> AppGroupResult<Self> {
        if let Some(bytes) = storage.get(SALT_KEY)? {
            let salt: [u8; SALT_LEN] = bytes.as_slice().try_into().map_err(|_| {
                StorageError::corrupted(
                    SALT_KEY,
                    format!("expected {SALT_LEN} bytes, got {}", bytes.len()),
                )
            })?;
            tracing::debug!("loaded persisted salt");
            return Ok(Self::from_salt(salt));
        }

        let mut salt = Zeroizing::new([0u8; SALT_LEN]);
        OsRng
            .try_fill_bytes(&mut salt[..])
            .map_err(|err| AppGroupError::Internal(format!("salt generation failed: {err}")))?;
        storage.put(SALT_KEY, &salt[..])?;
        tracing::info!("generated and persisted a new salt");
        Ok(Self { salt })
    }

    /// Builds a hasher around an explicit salt.
    #[must_use]
    pub fn from_salt(salt: [u8; SALT_LEN]) -> Self {
        Self {
            salt: Zeroizing::new(salt),
        }
    }

    /// Returns the lowercase hex digest of `raw` under this hasher's salt.
    #[must_use]
    pub fn hash_with_salt(&self, raw: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.salt[..]);
        hasher.update(raw.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Checks in constant time whether `digest` is the digest of `raw`.
    #[must_use]
    pub fn matches(&self, raw: &str, digest: &str) -> bool {
        self.hash_with_salt(raw)
            .as_bytes()
            .ct_eq(digest.as_bytes())
            .into()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_hash_is_deterministic() {
        let hasher = SaltedHasher::from_salt([1u8; SALT_LEN]);
        let first = hasher.hash_with_salt("secret");
        assert_eq!(first, hasher.hash_with_salt("secret"));
        assert_eq!(first.len(), 64);
        assert_ne!(first, "secret");
    }

    #[test]
    fn test_salt_changes_digest() {
        let a = SaltedHasher::from_salt([1u8; SALT_LEN]);
        let b = SaltedHasher::from_salt([2u8; SALT_LEN]);
        assert_ne!(a.hash_with_salt("secret"), b.hash_with_salt("secret"));
    }

    #[test]
    fn test_distinct_inputs_do_not_collide() {
        let hasher = SaltedHasher::from_salt([9u8; SALT_LEN]);
        let digests: HashSet<String> = (0..2_000)
            .map(|i| hasher.hash_with_salt(&format!("secret-{i}")))
            .collect();
        assert_eq!(digests.len(), 2_000);
    }

    #[test]
    fn test_initialize_persists_and_reloads_salt() {
        let storage = MemoryStorage::new();
        let first = SaltedHasher::initialize(&storage).expect("init");
        let stored = storage.get(SALT_KEY).expect("get").expect("salt stored");
        assert_eq!(stored.len(), SALT_LEN);

        let second = SaltedHasher::initialize(&storage).expect("reinit");
        assert_eq!(first.hash_with_salt("abc"), second.hash_with_salt("abc"));
    }

    #[test]
    fn test_initialize_rejects_corrupt_salt() {
        let storage = MemoryStorage::new();
        storage.put(SALT_KEY, b"short").expect("put");
        match SaltedHasher::initialize(&storage) {
            Err(AppGroupError::Storage(StorageError::Corrupted { key, .. })) => {
                assert_eq!(key, SALT_KEY);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_matches() {
        let hasher = SaltedHasher::from_salt([3u8; SALT_LEN]);
        let digest = hasher.hash_with_salt("secret");
        assert!(hasher.matches("secret", &digest));
        assert!(!hasher.matches("other", &digest));
        assert!(!hasher.matches("secret", "deadbeef"));
    }
}
