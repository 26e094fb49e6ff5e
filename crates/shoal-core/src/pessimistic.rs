//! Pessimistic per-key advisory locks.
//!
//! One lock table per shard. Commands that need cross-statement
//! isolation on a key take the key lock for the duration; everyone
//! else ignores the table entirely, which is what makes it advisory.
//!
//! Waiters park on a per-table `Notify` and re-check on wakeup, so a
//! release wakes all waiters and exactly one wins the re-check; the
//! rest go back to sleep.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;

struct KeyLockTable {
    locked: Mutex<HashSet<Bytes>>,
    released: Notify,
}

/// Holds a key lock until dropped.
pub struct KeyLockGuard {
    table: Arc<KeyLockTable>,
    key: Bytes,
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        self.table
            .locked
            .lock()
            .expect("key lock table")
            .remove(&self.key);
        self.table.released.notify_waiters();
    }
}

/// Per-shard key lock tables.
pub struct PessimisticMgr {
    tables: Vec<Arc<KeyLockTable>>,
}

impl PessimisticMgr {
    pub fn new(store_count: u32) -> Self {
        let tables = (0..store_count)
            .map(|_| {
                Arc::new(KeyLockTable {
                    locked: Mutex::new(HashSet::new()),
                    released: Notify::new(),
                })
            })
            .collect();
        Self { tables }
    }

    /// Locks `key` in shard `store_id`'s table, waiting for the
    /// current holder if there is one.
    pub async fn lock_key(&self, store_id: u32, key: Bytes) -> KeyLockGuard {
        let table = Arc::clone(&self.tables[store_id as usize]);
        loop {
            // register interest before the check so a release between
            // check and await still wakes us
            let released = table.released.notified();
            {
                let mut locked = table.locked.lock().expect("key lock table");
                if locked.insert(key.clone()) {
                    return KeyLockGuard {
                        table: Arc::clone(&table),
                        key,
                    };
                }
            }
            released.await;
        }
    }
}
