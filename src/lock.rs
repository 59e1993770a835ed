//! Per-key async locks
//!
//! Serializes writers of the same target id while leaving distinct targets
//! fully independent. Entries are dropped from the map as soon as no task
//! holds or waits on them, so the map only grows with concurrent keys.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

type KeyMutex = Arc<tokio::sync::Mutex<()>>;

/// A lazily populated map of one async mutex per key
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, KeyMutex>>,
}

/// Holds one key's lock; releasing it prunes the entry when nobody else needs it
pub struct KeyedGuard<'a> {
    owner: &'a KeyedLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.owner.locks.lock().unwrap_or_else(|e| e.into_inner());
        drop(self.guard.take());
        // Waiters hold their own clone, so a count of one means only the map is left
        if locks
            .get(&self.key)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting if another task holds it
    pub async fn lock(&self, key: &str) -> KeyedGuard<'_> {
        let guard = self.entry(key).lock_owned().await;
        self.wrap(key, guard)
    }

    /// Acquire the lock for `key` only if it is free right now
    pub fn try_lock(&self, key: &str) -> Option<KeyedGuard<'_>> {
        let guard = self.entry(key).try_lock_owned().ok()?;
        Some(self.wrap(key, guard))
    }

    /// Number of keys currently locked or awaited
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn wrap(&self, key: &str, guard: OwnedMutexGuard<()>) -> KeyedGuard<'_> {
        KeyedGuard {
            owner: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    fn entry(&self, key: &str) -> KeyMutex {
        // Only held for the map lookup, never across an await
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
