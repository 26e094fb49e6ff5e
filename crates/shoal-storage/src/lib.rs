//! shoal-storage: the persistent storage engine behind each shard.
//!
//! A [`Store`] keeps its keyspace in memory and makes it durable
//! through a per-store append-only mutation log that is replayed on
//! open. Alongside the keyspace it maintains a TTL index whose encoding
//! sorts by expiry time, a bounded binlog tail for incremental
//! replication, and hooks for snapshot streaming during full sync.
//!
//! The [`Catalog`] is a dedicated store that persists per-shard
//! metadata (currently the store mode), so a restart can tell a
//! destroyed shard from a live one before touching its data.

pub mod cache;
pub mod catalog;
pub mod error;
pub mod format;
pub mod log;
pub mod store;
pub mod ttl;

pub use cache::BlockCache;
pub use catalog::{Catalog, StoreMainMeta, CATALOG_NAME};
pub use error::StorageError;
pub use log::LogRecord;
pub use store::{BinlogRecord, Store, StoreMode, Transaction, TtlIndexCursor};
pub use ttl::{TtlIndexEntry, ValueType};
