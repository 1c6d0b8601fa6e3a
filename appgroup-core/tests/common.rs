//! Common test utilities shared across integration tests.

#![allow(dead_code, missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use appgroup_core::storage::{MemoryStorage, Storage, StorageError, StorageResult};
use appgroup_core::{Backend, BackendConfig, ErrorResponse, Operation, Request};
use serde_json::Value;

pub fn memory_backend() -> (Arc<MemoryStorage>, Backend) {
    let storage = Arc::new(MemoryStorage::new());
    let backend = Backend::new(storage.clone(), BackendConfig::default()).expect("backend");
    (storage, backend)
}

pub fn try_call(
    backend: &Backend,
    operation: Operation,
    path: &str,
    data: Value,
    now: u64,
) -> Result<Value, ErrorResponse> {
    backend
        .handle(&Request::new(operation, path, data).at(now))
        .map(|response| response.data)
}

pub fn call(backend: &Backend, operation: Operation, path: &str, data: Value, now: u64) -> Value {
    try_call(backend, operation, path, data, now)
        .unwrap_or_else(|err| panic!("{operation} {path} failed: {err:?}"))
}

pub fn text(value: &Value, field: &str) -> String {
    value[field]
        .as_str()
        .unwrap_or_else(|| panic!("missing string field {field} in {value}"))
        .to_string()
}

/// Memory storage that fails one `put` under the armed prefix, after letting
/// `skip` such writes through.
#[derive(Default)]
pub struct FailingStorage {
    inner: MemoryStorage,
    prefix: Mutex<&'static str>,
    armed: AtomicBool,
    skip: AtomicUsize,
}

impl FailingStorage {
    pub fn arm(&self, prefix: &'static str, skip: usize) {
        *self.prefix.lock().expect("prefix lock") = prefix;
        self.skip.store(skip, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.inner
            .snapshot()
            .expect("snapshot")
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(prefix))
            .collect()
    }
}

impl Storage for FailingStorage {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let prefix = *self.prefix.lock().expect("prefix lock");
        if self.armed.load(Ordering::SeqCst) && key.starts_with(prefix) {
            if self.skip.load(Ordering::SeqCst) == 0 {
                self.armed.store(false, Ordering::SeqCst);
                return Err(StorageError::Backend("injected put failure".to_string()));
            }
            self.skip.fetch_sub(1, Ordering::SeqCst);
        }
        self.inner.put(key, value)
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key)
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix)
    }
}
