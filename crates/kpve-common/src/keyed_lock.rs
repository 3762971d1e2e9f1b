//! Keyed mutual exclusion
//!
//! One async mutex per key, created on first use. Callers holding different
//! keys never contend; callers on the same key are serialized for as long as
//! the returned guard lives, including across `.await` points.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Guard proving exclusive ownership of a key. Dropping it unlocks the key.
#[derive(Debug)]
pub struct KeyedLockGuard {
    _guard: OwnedMutexGuard<()>,
}

/// A set of named mutexes
#[derive(Debug, Default)]
pub struct KeyedLock {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLock {
    /// Create an empty lock set
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `key` is free and take it
    pub async fn lock(&self, key: &str) -> KeyedLockGuard {
        // Clone the Arc out so the DashMap shard lock is not held while waiting.
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        KeyedLockGuard {
            _guard: mutex.lock_owned().await,
        }
    }
}
