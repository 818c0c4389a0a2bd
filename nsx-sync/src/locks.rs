//! Per-key serialization of event handling.
//!
//! Events for the same port or network must not interleave their reads and
//! writes of the mapping table, so each handler holds the lock for its key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Lock namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockScope {
    Port,
    Network,
}

#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<(LockScope, String), Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key` within `scope`.
    pub async fn lock(&self, scope: LockScope, key: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Drop entries nobody holds or waits on
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(
                locks
                    .entry((scope, key.to_string()))
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        entry.lock_owned().await
    }

    pub async fn lock_port(&self, port_id: &str) -> OwnedMutexGuard<()> {
        self.lock(LockScope::Port, port_id).await
    }

    pub async fn lock_network(&self, network_id: &str) -> OwnedMutexGuard<()> {
        self.lock(LockScope::Network, network_id).await
    }
}
