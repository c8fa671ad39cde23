//! In-process store for tests and data-dir-less deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{KvStore, StoreError};

#[derive(Default)]
struct Entries {
    values: HashMap<String, Vec<u8>>,
    writes: HashMap<String, u64>,
}

/// `HashMap`-backed [`KvStore`] with failure injection.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<Entries>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value without counting it as a write.
    pub fn insert_raw(&self, key: &str, value: Vec<u8>) {
        if let Ok(mut entries) = self.lock() {
            entries.values.insert(key.to_owned(), value);
        }
    }

    /// Number of successful puts to `key`.
    pub fn write_count(&self, key: &str) -> u64 {
        self.lock()
            .map(|entries| entries.writes.get(key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Successful puts across all keys.
    pub fn total_writes(&self) -> u64 {
        self.lock()
            .map(|entries| entries.writes.values().sum())
            .unwrap_or(0)
    }

    /// Make every subsequent `get` fail with `Unavailable`.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `put` fail with `Unavailable`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.lock().map(|entries| entries.values.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, Entries>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected read failure".into()));
        }
        Ok(self.lock()?.values.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        let mut entries = self.lock()?;
        entries.values.insert(key.to_owned(), value.to_vec());
        *entries.writes.entry(key.to_owned()).or_insert(0) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_absent() {
        let store = MemoryStore::new();
        assert_eq!(store.get("missing").unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_put_replaces_and_counts() {
        let store = MemoryStore::new();
        store.put("k", b"one").unwrap();
        store.put("k", b"two").unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.write_count("k"), 2);
        assert_eq!(store.total_writes(), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_insert_raw_not_counted() {
        let store = MemoryStore::new();
        store.insert_raw("k", vec![1, 2]);
        assert_eq!(store.get("k").unwrap(), Some(vec![1, 2]));
        assert_eq!(store.write_count("k"), 0);
    }

    #[test]
    fn test_failure_injection() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(matches!(store.put("k", b"v"), Err(StoreError::Unavailable(_))));
        assert_eq!(store.write_count("k"), 0);

        store.set_fail_writes(false);
        store.put("k", b"v").unwrap();

        store.set_fail_reads(true);
        assert!(store.get("k").is_err());
        store.set_fail_reads(false);
        assert_eq!(store.get("k").unwrap(), Some(b"v".to_vec()));
    }
}
