//! The segment manager: key→shard routing plus per-shard locks.
//!
//! The shard for a key is `fnv64(key) % chunk_size % store_count`. The
//! double modulo keeps key placement stable under a future chunk-level
//! resharding scheme: chunks move between shards, keys never move
//! between chunks.
//!
//! Each shard has one read/write lock. Dispatch takes it in an intent
//! mode (shared); administration (mode changes, destroy) takes it
//! exclusively, which drains every in-flight reader first.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use shoal_storage::{Store, StoreMode};

use crate::error::Error;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over a byte string.
fn fnv64(data: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in data {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// How a caller intends to use the shard it is locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared access for reads (`LOCK_IS`).
    IntentShared,
    /// Shared access for row-level writes (`LOCK_IX`); the store's own
    /// data lock serializes the actual mutation.
    IntentExclusive,
    /// Exclusive access for administration (`LOCK_X`).
    Exclusive,
}

#[derive(Debug)]
enum ShardGuard {
    Read(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Write(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// A locked shard: the store handle plus the held lock.
///
/// The lock is released when the guard drops.
#[derive(Debug)]
pub struct DbGuard {
    store: Store,
    store_id: u32,
    _guard: ShardGuard,
}

impl DbGuard {
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_id(&self) -> u32 {
        self.store_id
    }
}

/// Routes keys to shards and hands out per-shard locks.
pub struct SegmentMgr {
    stores: Vec<Store>,
    locks: Vec<Arc<RwLock<()>>>,
    chunk_size: u32,
}

impl SegmentMgr {
    pub fn new(stores: Vec<Store>, chunk_size: u32) -> Self {
        let locks = stores.iter().map(|_| Arc::new(RwLock::new(()))).collect();
        Self {
            stores,
            locks,
            chunk_size,
        }
    }

    pub fn store_count(&self) -> u32 {
        self.stores.len() as u32
    }

    /// The chunk a key hashes into, before shard placement.
    pub fn chunk_id(&self, key: &[u8]) -> u32 {
        (fnv64(key) % u64::from(self.chunk_size)) as u32
    }

    /// The shard that owns a key.
    pub fn store_id_for_key(&self, key: &[u8]) -> u32 {
        self.chunk_id(key) % self.store_count()
    }

    /// Locks a shard by id and returns its store.
    ///
    /// Fails `Internal("store not open")` for destroyed shards — a
    /// warm boot keeps a `StoreNone` shard in the table, but nothing
    /// may dispatch to it.
    pub async fn db(&self, store_id: u32, mode: LockMode) -> Result<DbGuard, Error> {
        let guard = self.lock_shard(store_id, mode).await?;
        let store = &self.stores[store_id as usize];
        if !store.is_open() || store.mode() == StoreMode::StoreNone {
            return Err(Error::Internal("store not open".into()));
        }
        Ok(DbGuard {
            store: store.clone(),
            store_id,
            _guard: guard,
        })
    }

    /// Like [`db`](Self::db) but hands out closed stores too.
    ///
    /// Administration and the index scanner want the handle even when
    /// the store is not serving, and check the mode themselves.
    pub async fn db_allow_closed(
        &self,
        store_id: u32,
        mode: LockMode,
    ) -> Result<DbGuard, Error> {
        let guard = self.lock_shard(store_id, mode).await?;
        Ok(DbGuard {
            store: self.stores[store_id as usize].clone(),
            store_id,
            _guard: guard,
        })
    }

    /// Routes a key to its shard and locks it.
    pub async fn db_for_key(&self, key: &Bytes, mode: LockMode) -> Result<DbGuard, Error> {
        self.db(self.store_id_for_key(key), mode).await
    }

    async fn lock_shard(&self, store_id: u32, mode: LockMode) -> Result<ShardGuard, Error> {
        let lock = self
            .locks
            .get(store_id as usize)
            .ok_or_else(|| Error::NotFound(format!("no store with id {store_id}")))?
            .clone();
        Ok(match mode {
            LockMode::IntentShared | LockMode::IntentExclusive => {
                ShardGuard::Read(lock.read_owned().await)
            }
            LockMode::Exclusive => ShardGuard::Write(lock.write_owned().await),
        })
    }
}
