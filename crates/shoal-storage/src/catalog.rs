//! The catalog: per-shard metadata on its own dedicated store.
//!
//! The catalog records each shard's mode under `store_main_meta/<i>`,
//! written *before* any destructive store operation commits. On a warm
//! boot the server reads these records first, so a shard destroyed in
//! a previous life comes back as `StoreNone` instead of an empty
//! read-write store.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::store::{Store, StoreMode};

/// Name of the dedicated catalog store.
pub const CATALOG_NAME: &str = "CATALOG";

/// All catalog keys live in logical db 0 of the catalog store.
const CATALOG_DB: u32 = 0;

/// Persisted per-shard metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMainMeta {
    pub store_id: u32,
    pub store_mode: StoreMode,
}

/// Typed access to the catalog store.
pub struct Catalog {
    store: Store,
    kv_store_count: u32,
    chunk_size: u32,
}

impl Catalog {
    pub fn new(store: Store, kv_store_count: u32, chunk_size: u32) -> Self {
        Self {
            store,
            kv_store_count,
            chunk_size,
        }
    }

    /// The fixed shard count this deployment was created with.
    pub fn kv_store_count(&self) -> u32 {
        self.kv_store_count
    }

    /// Chunk count used by the segment hash.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Reads a shard's main meta. `Ok(None)` means the shard has never
    /// been recorded (first boot).
    pub fn store_main_meta(&self, store_id: u32) -> Result<Option<StoreMainMeta>, StorageError> {
        let txn = self.store.transaction()?;
        match txn.get(CATALOG_DB, meta_key(store_id).as_bytes()) {
            Some((raw, _)) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Writes a shard's main meta.
    pub fn set_store_main_meta(&self, meta: &StoreMainMeta) -> Result<(), StorageError> {
        let raw = serde_json::to_vec(meta)?;
        let mut txn = self.store.transaction()?;
        txn.put(
            CATALOG_DB,
            Bytes::from(meta_key(meta.store_id).into_bytes()),
            Bytes::from(raw),
            0,
        );
        txn.commit()
    }

    /// Stops the underlying store, flushing its log.
    pub fn stop(&self) -> Result<(), StorageError> {
        self.store.stop()
    }
}

fn meta_key(store_id: u32) -> String {
    format!("store_main_meta/{store_id}")
}
