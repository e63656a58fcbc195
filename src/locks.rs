//! Per-environment claim locks.
//!
//! The store has no transactions, so every read-decide-write on one
//! Environment runs under that Environment's lock. Locks are in-process only;
//! across processes the lifecycle relies on idempotent steps and
//! last-write-wins.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::environment::EnvironmentKey;

/// Lazily created mutex per [`EnvironmentKey`].
#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<RwLock<HashMap<EnvironmentKey, Arc<Mutex<()>>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get_or_create(&self, key: &EnvironmentKey) -> Arc<Mutex<()>> {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(key) {
                return lock.clone();
            }
        }

        let mut locks = self.locks.write().await;
        // Drop entries nobody holds or waits on.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: &EnvironmentKey) -> OwnedMutexGuard<()> {
        self.get_or_create(key).await.lock_owned().await
    }
}
