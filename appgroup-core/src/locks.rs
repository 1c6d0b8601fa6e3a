//! Structural and per-credential locking.
//!
//! Three coarse reader/writer locks guard the app namespace, the group
//! namespace and generic shared state (composite records, tidy). Lookups take
//! the shared side, definition changes the exclusive side.
//!
//! Consumption of a secret ID is serialized by a credential lock keyed by the
//! secret's digest. The lock must be held across the whole
//! read-validate-decrement-persist sequence, otherwise two concurrent logins
//! could both spend the last use of a secret.
//!
//! # Ordering
//!
//! Callers acquire locks in this order and never in reverse:
//! group → app → generic → credential. Multiple credential locks are taken in
//! ascending digest order by [`LockRegistry::with_credential_locks`].

use std::collections::BTreeSet;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use dashmap::DashMap;

/// Registry of the structural locks and the credential lock table.
///
/// The credential table is a sharded map: looking up an existing entry only
/// touches one shard, and inserting a new one write-locks one shard. An entry
/// is evicted as soon as the last holder releases it, so the table only holds
/// digests that are being validated right now.
#[derive(Debug, Default)]
pub struct LockRegistry {
    app: RwLock<()>,
    group: RwLock<()>,
    generic: RwLock<()>,
    credentials: DashMap<String, Arc<Mutex<()>>>,
}

/// Keeps the credential locks of one call referenced and evicts them once
/// the call is done, including on unwind.
struct HeldLocks<'a> {
    registry: &'a LockRegistry,
    entries: Vec<(String, Arc<Mutex<()>>)>,
}

impl Drop for HeldLocks<'_> {
    fn drop(&mut self) {
        for (digest, lock) in self.entries.drain(..) {
            drop(lock);
            self.registry.evict_if_idle(&digest);
        }
    }
}

impl LockRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared access to the app namespace.
    pub fn app_read(&self) -> RwLockReadGuard<'_, ()> {
        self.app.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access to the app namespace.
    pub fn app_write(&self) -> RwLockWriteGuard<'_, ()> {
        self.app.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shared access to the group namespace.
    pub fn group_read(&self) -> RwLockReadGuard<'_, ()> {
        self.group.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access to the group namespace.
    pub fn group_write(&self) -> RwLockWriteGuard<'_, ()> {
        self.group.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shared access to generic state.
    pub fn generic_read(&self) -> RwLockReadGuard<'_, ()> {
        self.generic.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access to generic state.
    pub fn generic_write(&self) -> RwLockWriteGuard<'_, ()> {
        self.generic.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` while holding the credential lock of `digest`.
    ///
    /// The lock is released when `f` returns, whether it succeeds or fails.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns.
    pub fn with_credential_lock<R, E, F>(&self, digest: &str, f: F) -> Result<R, E>
    where
        F: FnOnce() -> Result<R, E>,
    {
        self.with_credential_locks(std::iter::once(digest), f)
    }

    /// Runs `f` while holding the credential locks of every digest.
    ///
    /// Digests are deduplicated and acquired in ascending order, so two
    /// callers locking overlapping sets cannot deadlock.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns.
    pub fn with_credential_locks<'d, R, E, F, I>(&self, digests: I, f: F) -> Result<R, E>
    where
        I: IntoIterator<Item = &'d str>,
        F: FnOnce() -> Result<R, E>,
    {
        let ordered: BTreeSet<&str> = digests.into_iter().collect();
        let held = HeldLocks {
            registry: self,
            entries: ordered
                .into_iter()
                .map(|digest| (digest.to_string(), self.credential_lock(digest)))
                .collect(),
        };
        let _guards: Vec<MutexGuard<'_, ()>> = held
            .entries
            .iter()
            .map(|(_, lock)| lock.lock().unwrap_or_else(PoisonError::into_inner))
            .collect();
        f()
    }

    /// Number of credential locks currently tracked.
    #[must_use]
    pub fn credential_lock_count(&self) -> usize {
        self.credentials.len()
    }

    fn credential_lock(&self, digest: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.credentials.get(digest) {
            return Arc::clone(lock.value());
        }
        let entry = self.credentials.entry(digest.to_string()).or_default();
        Arc::clone(entry.value())
    }

    /// Drops the table entry when nobody but the table references it. The
    /// check runs under the shard lock, and new references are only handed
    /// out under that same lock, so a lock that is held is never evicted.
    fn evict_if_idle(&self, digest: &str) {
        self.credentials
            .remove_if(digest, |_, lock| Arc::strong_count(lock) == 1);
    }
}
