//! Re-entrant, per-key async mutex.
//!
//! Callers contending on the same key are serialized; different keys never
//! block each other. Re-entrancy is scoped to the current tokio task: a
//! future already running under a key may take the same key again without
//! deadlocking. Idle keys are removed once their last user leaves.

use dashmap::DashMap;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static HELD_KEYS: HashSet<(u64, String)>;
}

#[derive(Debug)]
pub struct KeyedMutex {
    instance_id: u64,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self {
            instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            locks: DashMap::new(),
        }
    }

    /// Run `fut` while holding the lock for `key`
    pub async fn run_exclusive<F>(&self, key: &str, fut: F) -> F::Output
    where
        F: Future,
    {
        let held_key = (self.instance_id, key.to_string());
        let already_held = HELD_KEYS
            .try_with(|held| held.contains(&held_key))
            .unwrap_or(false);
        if already_held {
            return fut.await;
        }

        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let output = {
            let _guard = mutex.lock().await;
            let mut held = HELD_KEYS.try_with(|held| held.clone()).unwrap_or_default();
            held.insert(held_key);
            HELD_KEYS.scope(held, fut).await
        };

        drop(mutex);
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);

        output
    }

    /// Number of keys currently locked or awaited
    pub fn active_keys(&self) -> usize {
        self.locks.len()
    }
}

impl Default for KeyedMutex {
    fn default() -> Self {
        Self::new()
    }
}
