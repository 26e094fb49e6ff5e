//! A shard store: log-backed keyspace with a TTL index and binlog.
//!
//! All reads and writes go through a [`Transaction`]. Writes are
//! buffered and applied atomically on commit, which also appends them
//! to the mutation log and publishes binlog records for replication
//! subscribers.
//!
//! A store carries three lifecycle facets the server coordinates:
//! a [`StoreMode`] (mirrored into the catalog by the caller), a
//! `paused` flag gating destruction, and an `open` flag that turns
//! every new transaction away once the store stops.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::cache::BlockCache;
use crate::error::StorageError;
use crate::format::{
    self, read_bytes, read_u32, read_u64, read_u8, write_bytes, write_u32, write_u64, write_u8,
    FORMAT_VERSION, SNAP_MAGIC,
};
use crate::log::{log_path, replay_log, LogRecord, LogWriter};
use crate::ttl::{TtlIndexEntry, ValueType};

/// How many binlog records each store retains in memory for
/// incremental-sync catch-up. A subscriber asking for anything older
/// must fall back to a full sync.
const BINLOG_TAIL_CAP: usize = 4096;

/// Broadcast channel capacity for live binlog subscribers. A lagging
/// subscriber gets a `Lagged` error and must resync.
const BINLOG_CHANNEL_CAP: usize = 1024;

/// Estimated bookkeeping bytes per keyspace entry, charged against the
/// shared cache budget on top of key and value lengths.
const ENTRY_OVERHEAD: u64 = 64;

/// Operating mode of a store, persisted in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreMode {
    /// Normal shard: serves reads and writes.
    ReadWrite,
    /// Replica shard: mutated only by the replication apply path.
    ReplicateOnly,
    /// Destroyed: must never be dispatched to.
    StoreNone,
}

impl StoreMode {
    fn as_u8(self) -> u8 {
        match self {
            StoreMode::ReadWrite => 0,
            StoreMode::ReplicateOnly => 1,
            StoreMode::StoreNone => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => StoreMode::ReadWrite,
            1 => StoreMode::ReplicateOnly,
            _ => StoreMode::StoreNone,
        }
    }
}

/// One committed mutation, as seen by replication subscribers.
#[derive(Debug, Clone)]
pub struct BinlogRecord {
    /// Monotonically increasing per-store id.
    pub id: u64,
    /// Store version at commit time.
    pub version: u64,
    /// The mutation itself, in log-record form.
    pub record: LogRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RecordKey {
    db_id: u32,
    key: Bytes,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    /// Absolute expiry in unix milliseconds; zero means no expiry.
    expire_at_ms: u64,
}

struct StoreData {
    kv: HashMap<RecordKey, Entry>,
    /// Encoded [`TtlIndexEntry`] values; BTreeSet order == expiry order.
    ttl: BTreeSet<Vec<u8>>,
    binlog_tail: VecDeque<BinlogRecord>,
    log: Option<LogWriter>,
}

struct StoreInner {
    db_id: String,
    dir: PathBuf,
    mode: AtomicU8,
    paused: AtomicBool,
    open: AtomicBool,
    version_increase: bool,
    cache: Arc<BlockCache>,
    data: Mutex<StoreData>,
    next_binlog_id: AtomicU64,
    version: AtomicU64,
    binlog_tx: broadcast::Sender<BinlogRecord>,
}

/// A cheaply cloneable handle to one shard store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("db_id", &self.inner.db_id)
            .field("mode", &self.mode())
            .field("open", &self.is_open())
            .finish()
    }
}

impl Store {
    /// Opens the store, replaying its mutation log into memory.
    ///
    /// The replayed footprint is charged against the shared cache
    /// budget unconditionally — existing data is never turned away at
    /// boot, only new writes are.
    pub fn open(
        db_id: &str,
        dir: &Path,
        cache: Arc<BlockCache>,
        mode: StoreMode,
        version_increase: bool,
    ) -> Result<Self, StorageError> {
        std::fs::create_dir_all(dir)?;
        let path = log_path(dir, db_id);
        let records = replay_log(&path)?;

        let mut kv: HashMap<RecordKey, Entry> = HashMap::new();
        let mut ttl: BTreeSet<Vec<u8>> = BTreeSet::new();
        for record in records {
            apply_record(&mut kv, &mut ttl, &record);
        }

        let mut replayed_bytes = 0u64;
        for (rk, entry) in &kv {
            replayed_bytes += entry_size(&rk.key, &entry.value);
        }
        cache.charge(replayed_bytes);

        if !kv.is_empty() {
            info!(
                store = db_id,
                keys = kv.len(),
                "replayed mutation log"
            );
        }

        let log = LogWriter::open(&path)?;
        let (binlog_tx, _) = broadcast::channel(BINLOG_CHANNEL_CAP);

        Ok(Self {
            inner: Arc::new(StoreInner {
                db_id: db_id.to_string(),
                dir: dir.to_path_buf(),
                mode: AtomicU8::new(mode.as_u8()),
                paused: AtomicBool::new(false),
                open: AtomicBool::new(mode != StoreMode::StoreNone),
                version_increase,
                cache,
                data: Mutex::new(StoreData {
                    kv,
                    ttl,
                    binlog_tail: VecDeque::new(),
                    log: Some(log),
                }),
                next_binlog_id: AtomicU64::new(1),
                version: AtomicU64::new(0),
                binlog_tx,
            }),
        })
    }

    /// Stringified shard index, e.g. `"3"` or `"CATALOG"`.
    pub fn db_id(&self) -> &str {
        &self.inner.db_id
    }

    pub fn mode(&self) -> StoreMode {
        StoreMode::from_u8(self.inner.mode.load(Ordering::Acquire))
    }

    /// Flips the store mode. The caller must hold the shard's
    /// exclusive lock and mirror the change into the catalog.
    pub fn set_mode(&self, mode: StoreMode) {
        self.inner.mode.store(mode.as_u8(), Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::Release);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.lock().expect("store lock").kv.is_empty()
    }

    /// Counts live (non-expired) keys, optionally within one logical db.
    pub fn key_count(&self, db_id: Option<u32>) -> usize {
        let now = self.current_time_ms();
        let data = self.inner.data.lock().expect("store lock");
        data.kv
            .iter()
            .filter(|(rk, entry)| {
                db_id.map_or(true, |db| rk.db_id == db)
                    && (entry.expire_at_ms == 0 || entry.expire_at_ms > now)
            })
            .count()
    }

    /// Wall-clock time in unix milliseconds, the reference for every
    /// expiry comparison in this store.
    pub fn current_time_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Begins a transaction. Fails once the store is stopped or
    /// destroyed.
    pub fn transaction(&self) -> Result<Transaction, StorageError> {
        if !self.is_open() {
            return Err(StorageError::NotOpen(self.inner.db_id.clone()));
        }
        Ok(Transaction {
            store: self.clone(),
            writes: Vec::new(),
        })
    }

    /// Flushes the log and closes the store for new transactions.
    pub fn stop(&self) -> Result<(), StorageError> {
        self.inner.open.store(false, Ordering::Release);
        let mut data = self.inner.data.lock().expect("store lock");
        if let Some(log) = data.log.as_mut() {
            log.sync()?;
        }
        data.log = None;
        Ok(())
    }

    /// Destroys the store: drops all in-memory state, removes the
    /// on-disk log, and flips the mode to [`StoreMode::StoreNone`].
    ///
    /// Requires `paused`. The caller is responsible for committing the
    /// catalog's `StoreNone` record *before* calling this, so a crash
    /// mid-destroy cannot resurrect a half-destroyed shard.
    pub fn destroy(&self) -> Result<(), StorageError> {
        if !self.is_paused() {
            return Err(StorageError::NotPaused(self.inner.db_id.clone()));
        }
        self.inner.open.store(false, Ordering::Release);

        let mut data = self.inner.data.lock().expect("store lock");
        let mut freed = 0u64;
        for (rk, entry) in &data.kv {
            freed += entry_size(&rk.key, &entry.value);
        }
        self.inner.cache.release(freed);
        data.kv.clear();
        data.ttl.clear();
        data.binlog_tail.clear();
        data.log = None;

        let path = log_path(&self.inner.dir, &self.inner.db_id);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }

        self.set_mode(StoreMode::StoreNone);
        info!(store = %self.inner.db_id, "store destroyed");
        Ok(())
    }

    // -- replication surface --

    /// Subscribes to live binlog records.
    pub fn subscribe_binlog(&self) -> broadcast::Receiver<BinlogRecord> {
        self.inner.binlog_tx.subscribe()
    }

    /// The id the next committed mutation will get.
    pub fn next_binlog_id(&self) -> u64 {
        self.inner.next_binlog_id.load(Ordering::Acquire)
    }

    /// Returns the retained binlog records with `id >= from_id`, or
    /// `None` if `from_id` has already been evicted from the tail (the
    /// subscriber must full-sync instead).
    pub fn binlog_tail_from(&self, from_id: u64) -> Option<Vec<BinlogRecord>> {
        let data = self.inner.data.lock().expect("store lock");
        let first_retained = data
            .binlog_tail
            .front()
            .map(|r| r.id)
            .unwrap_or_else(|| self.inner.next_binlog_id.load(Ordering::Acquire));
        if from_id < first_retained {
            return None;
        }
        Some(
            data.binlog_tail
                .iter()
                .filter(|r| r.id >= from_id)
                .cloned()
                .collect(),
        )
    }

    /// Serializes the whole keyspace for full-sync streaming.
    ///
    /// Layout: `[SSNP][version][count: u64]([db_id][key][value]
    /// [expire_at_ms])*[crc32]`, CRC over everything after the magic.
    pub fn snapshot_bytes(&self) -> Result<Vec<u8>, StorageError> {
        let data = self.inner.data.lock().expect("store lock");
        let mut body = Vec::new();
        write_u8(&mut body, FORMAT_VERSION)?;
        write_u64(&mut body, data.kv.len() as u64)?;
        for (rk, entry) in &data.kv {
            write_u32(&mut body, rk.db_id)?;
            write_bytes(&mut body, &rk.key)?;
            write_bytes(&mut body, &entry.value)?;
            write_u64(&mut body, entry.expire_at_ms)?;
        }
        let crc = format::crc32(&body);

        let mut out = Vec::with_capacity(4 + body.len() + 4);
        out.extend_from_slice(SNAP_MAGIC);
        out.extend_from_slice(&body);
        out.extend_from_slice(&crc.to_le_bytes());
        Ok(out)
    }

    /// Decodes a snapshot produced by [`snapshot_bytes`](Self::snapshot_bytes).
    ///
    /// Returns `(db_id, key, value, expire_at_ms)` tuples. Used by a
    /// downstream replica applying a full sync.
    pub fn decode_snapshot(
        data: &[u8],
    ) -> Result<Vec<(u32, Bytes, Bytes, u64)>, StorageError> {
        if data.len() < 4 + 4 {
            return Err(StorageError::Corrupt("snapshot too short".into()));
        }
        if &data[..4] != SNAP_MAGIC {
            return Err(StorageError::Corrupt("bad snapshot magic".into()));
        }
        let body = &data[4..data.len() - 4];
        let stored = u32::from_le_bytes(
            data[data.len() - 4..].try_into().expect("4 bytes"),
        );
        let actual = format::crc32(body);
        if stored != actual {
            return Err(StorageError::Corrupt(format!(
                "snapshot crc mismatch (stored {stored:#010x}, actual {actual:#010x})"
            )));
        }

        let mut r = body;
        let version = read_u8(&mut r)?;
        if version != FORMAT_VERSION {
            return Err(StorageError::Corrupt(format!(
                "unsupported snapshot version {version}"
            )));
        }
        let count = read_u64(&mut r)?;
        let mut entries = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let db_id = read_u32(&mut r)?;
            let key = Bytes::from(read_bytes(&mut r)?);
            let value = Bytes::from(read_bytes(&mut r)?);
            let expire_at_ms = read_u64(&mut r)?;
            entries.push((db_id, key, value, expire_at_ms));
        }
        Ok(entries)
    }
}

/// Buffered write operations, applied atomically on commit.
#[derive(Debug, Clone)]
enum WriteOp {
    Put {
        db_id: u32,
        key: Bytes,
        value: Bytes,
        expire_at_ms: u64,
    },
    Del {
        db_id: u32,
        key: Bytes,
    },
    SetExpire {
        db_id: u32,
        key: Bytes,
        expire_at_ms: u64,
    },
}

/// A read/write transaction against one store.
///
/// Reads observe committed state. Writes are buffered and become
/// visible — and durable, and replicated — only on [`commit`]
/// (dropping the transaction discards them).
///
/// [`commit`]: Transaction::commit
pub struct Transaction {
    store: Store,
    writes: Vec<WriteOp>,
}

impl Transaction {
    /// Reads a live value and its absolute expiry.
    ///
    /// Entries past their expiry read as absent; physically removing
    /// them is the TTL reaper's job.
    pub fn get(&self, db_id: u32, key: &[u8]) -> Option<(Bytes, u64)> {
        let now = self.store.current_time_ms();
        let data = self.store.inner.data.lock().expect("store lock");
        let entry = data.kv.get(&RecordKey {
            db_id,
            key: Bytes::copy_from_slice(key),
        })?;
        if entry.expire_at_ms != 0 && entry.expire_at_ms <= now {
            return None;
        }
        Some((entry.value.clone(), entry.expire_at_ms))
    }

    /// Like [`get`](Self::get) but also returns entries that are past
    /// their expiry. Used by the conditional delete path, which must
    /// distinguish "expired" from "gone".
    pub fn get_raw(&self, db_id: u32, key: &[u8]) -> Option<(Bytes, u64)> {
        let data = self.store.inner.data.lock().expect("store lock");
        let entry = data.kv.get(&RecordKey {
            db_id,
            key: Bytes::copy_from_slice(key),
        })?;
        Some((entry.value.clone(), entry.expire_at_ms))
    }

    pub fn put(&mut self, db_id: u32, key: Bytes, value: Bytes, expire_at_ms: u64) {
        self.writes.push(WriteOp::Put {
            db_id,
            key,
            value,
            expire_at_ms,
        });
    }

    pub fn del(&mut self, db_id: u32, key: Bytes) {
        self.writes.push(WriteOp::Del { db_id, key });
    }

    pub fn set_expire(&mut self, db_id: u32, key: Bytes, expire_at_ms: u64) {
        self.writes.push(WriteOp::SetExpire {
            db_id,
            key,
            expire_at_ms,
        });
    }

    /// Opens a cursor over TTL index entries with
    /// `expire_at_ms <= bound_ms` — already-expired entries only.
    pub fn ttl_index_cursor(&self, bound_ms: u64) -> TtlIndexCursor {
        let upper = (bound_ms.saturating_add(1)).to_be_bytes();
        let data = self.store.inner.data.lock().expect("store lock");
        let entries: Vec<Vec<u8>> = data
            .ttl
            .iter()
            .take_while(|encoded| encoded.as_slice() < upper.as_slice())
            .cloned()
            .collect();
        TtlIndexCursor { entries, pos: 0 }
    }

    /// Applies the buffered writes atomically.
    ///
    /// The cache budget is checked for the whole batch before any
    /// mutation lands, so an out-of-memory commit changes nothing.
    pub fn commit(self) -> Result<(), StorageError> {
        let Transaction { store, writes } = self;
        let inner = &store.inner;
        if !store.is_open() {
            return Err(StorageError::NotOpen(inner.db_id.clone()));
        }
        if writes.is_empty() {
            return Ok(());
        }

        let mut guard = inner.data.lock().expect("store lock");
        let data = &mut *guard;

        // net budget delta for the whole batch, computed against an
        // overlay so later ops in the batch see earlier ones
        let mut overlay: HashMap<RecordKey, Option<u64>> = HashMap::new();
        let mut delta: i64 = 0;
        for op in &writes {
            match op {
                WriteOp::Put {
                    db_id, key, value, ..
                } => {
                    let rk = RecordKey {
                        db_id: *db_id,
                        key: key.clone(),
                    };
                    let old = overlay.get(&rk).copied().unwrap_or_else(|| {
                        data.kv.get(&rk).map(|e| entry_size(&rk.key, &e.value))
                    });
                    let new_size = entry_size(key, value);
                    delta += new_size as i64 - old.unwrap_or(0) as i64;
                    overlay.insert(rk, Some(new_size));
                }
                WriteOp::Del { db_id, key } => {
                    let rk = RecordKey {
                        db_id: *db_id,
                        key: key.clone(),
                    };
                    let old = overlay.get(&rk).copied().unwrap_or_else(|| {
                        data.kv.get(&rk).map(|e| entry_size(&rk.key, &e.value))
                    });
                    delta -= old.unwrap_or(0) as i64;
                    overlay.insert(rk, None);
                }
                WriteOp::SetExpire { .. } => {}
            }
        }
        if delta > 0 {
            if !inner.cache.try_charge(delta as u64) {
                return Err(StorageError::OutOfMemory);
            }
        } else if delta < 0 {
            inner.cache.release((-delta) as u64);
        }

        for op in writes {
            let (record, idempotent) = match op {
                WriteOp::Put {
                    db_id,
                    key,
                    value,
                    expire_at_ms,
                } => (
                    LogRecord::Put {
                        db_id,
                        key,
                        value,
                        expire_at_ms,
                    },
                    false,
                ),
                WriteOp::Del { db_id, key } => (LogRecord::Del { db_id, key }, false),
                WriteOp::SetExpire {
                    db_id,
                    key,
                    expire_at_ms,
                } => (
                    LogRecord::SetExpire {
                        db_id,
                        key,
                        expire_at_ms,
                    },
                    true,
                ),
            };

            apply_record(&mut data.kv, &mut data.ttl, &record);

            if let Some(log) = data.log.as_mut() {
                log.append(&record)?;
            }

            let version = if !idempotent || inner.version_increase {
                inner.version.fetch_add(1, Ordering::AcqRel) + 1
            } else {
                inner.version.load(Ordering::Acquire)
            };
            let id = inner.next_binlog_id.fetch_add(1, Ordering::AcqRel);
            let binlog = BinlogRecord {
                id,
                version,
                record,
            };
            data.binlog_tail.push_back(binlog.clone());
            while data.binlog_tail.len() > BINLOG_TAIL_CAP {
                data.binlog_tail.pop_front();
            }
            // no subscribers is fine
            let _ = inner.binlog_tx.send(binlog);
        }

        if let Some(log) = data.log.as_mut() {
            if let Err(e) = log.flush() {
                warn!(store = %inner.db_id, "log flush failed: {e}");
            }
        }
        Ok(())
    }
}

/// Cursor over expired TTL index entries, oldest first.
///
/// Operates on a snapshot taken when the cursor was opened; the
/// scanner's per-shard latch guarantees a single cursor per store.
pub struct TtlIndexCursor {
    entries: Vec<Vec<u8>>,
    pos: usize,
}

impl TtlIndexCursor {
    /// Positions the cursor at the first entry `>= prefix`.
    pub fn seek(&mut self, prefix: &[u8]) {
        self.pos = self.entries.partition_point(|e| e.as_slice() < prefix);
    }

    /// The encoded entry at the cursor, without advancing.
    pub fn key(&self) -> Option<&[u8]> {
        self.entries.get(self.pos).map(|v| v.as_slice())
    }

    /// Advances one entry without decoding it.
    pub fn skip(&mut self) {
        self.pos += 1;
    }

    /// Decodes the entry at the cursor and advances past it.
    pub fn next(&mut self) -> Option<Result<TtlIndexEntry, StorageError>> {
        let encoded = self.entries.get(self.pos)?;
        self.pos += 1;
        Some(TtlIndexEntry::decode(encoded))
    }
}

/// Applies one log record to the keyspace and TTL index.
///
/// Shared between commit, log replay, and (on a replica) binlog apply.
fn apply_record(
    kv: &mut HashMap<RecordKey, Entry>,
    ttl: &mut BTreeSet<Vec<u8>>,
    record: &LogRecord,
) {
    match record {
        LogRecord::Put {
            db_id,
            key,
            value,
            expire_at_ms,
        } => {
            let rk = RecordKey {
                db_id: *db_id,
                key: key.clone(),
            };
            if let Some(old) = kv.get(&rk) {
                remove_ttl_entry(ttl, &rk, old.expire_at_ms);
            }
            if *expire_at_ms != 0 {
                ttl.insert(
                    TtlIndexEntry::new(*expire_at_ms, *db_id, ValueType::String, key.clone())
                        .encode(),
                );
            }
            kv.insert(
                rk,
                Entry {
                    value: value.clone(),
                    expire_at_ms: *expire_at_ms,
                },
            );
        }
        LogRecord::Del { db_id, key } => {
            let rk = RecordKey {
                db_id: *db_id,
                key: key.clone(),
            };
            if let Some(old) = kv.remove(&rk) {
                remove_ttl_entry(ttl, &rk, old.expire_at_ms);
            }
        }
        LogRecord::SetExpire {
            db_id,
            key,
            expire_at_ms,
        } => {
            let rk = RecordKey {
                db_id: *db_id,
                key: key.clone(),
            };
            if let Some(entry) = kv.get_mut(&rk) {
                let old_expire = entry.expire_at_ms;
                entry.expire_at_ms = *expire_at_ms;
                remove_ttl_entry(ttl, &rk, old_expire);
                if *expire_at_ms != 0 {
                    ttl.insert(
                        TtlIndexEntry::new(
                            *expire_at_ms,
                            *db_id,
                            ValueType::String,
                            key.clone(),
                        )
                        .encode(),
                    );
                }
            }
        }
    }
}

fn remove_ttl_entry(ttl: &mut BTreeSet<Vec<u8>>, rk: &RecordKey, expire_at_ms: u64) {
    if expire_at_ms != 0 {
        ttl.remove(
            &TtlIndexEntry::new(expire_at_ms, rk.db_id, ValueType::String, rk.key.clone())
                .encode(),
        );
    }
}

fn entry_size(key: &[u8], value: &[u8]) -> u64 {
    key.len() as u64 + value.len() as u64 + ENTRY_OVERHEAD
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &Path) -> Store {
        Store::open(
            "0",
            dir,
            Arc::new(BlockCache::new(0)),
            StoreMode::ReadWrite,
            true,
        )
        .unwrap()
    }

    fn put(store: &Store, key: &str, value: &str, expire_at_ms: u64) {
        let mut txn = store.transaction().unwrap();
        txn.put(
            0,
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
            expire_at_ms,
        );
        txn.commit().unwrap();
    }

    #[test]
    fn put_get_del() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        put(&store, "k", "v", 0);
        let txn = store.transaction().unwrap();
        assert_eq!(txn.get(0, b"k").unwrap().0, Bytes::from_static(b"v"));
        drop(txn);

        let mut txn = store.transaction().unwrap();
        txn.del(0, Bytes::from_static(b"k"));
        txn.commit().unwrap();

        let txn = store.transaction().unwrap();
        assert!(txn.get(0, b"k").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn dbs_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let mut txn = store.transaction().unwrap();
        txn.put(0, Bytes::from_static(b"k"), Bytes::from_static(b"db0"), 0);
        txn.put(5, Bytes::from_static(b"k"), Bytes::from_static(b"db5"), 0);
        txn.commit().unwrap();

        let txn = store.transaction().unwrap();
        assert_eq!(txn.get(0, b"k").unwrap().0, Bytes::from_static(b"db0"));
        assert_eq!(txn.get(5, b"k").unwrap().0, Bytes::from_static(b"db5"));
        assert_eq!(store.key_count(Some(0)), 1);
        assert_eq!(store.key_count(None), 2);
    }

    #[test]
    fn expired_entry_reads_as_absent_but_stays_indexed() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let past = store.current_time_ms().saturating_sub(10_000);
        put(&store, "gone", "v", past);

        let txn = store.transaction().unwrap();
        assert!(txn.get(0, b"gone").is_none());
        assert!(txn.get_raw(0, b"gone").is_some());

        let mut cursor = txn.ttl_index_cursor(store.current_time_ms());
        let entry = cursor.next().unwrap().unwrap();
        assert_eq!(&entry.primary_key[..], b"gone");
        assert!(cursor.next().is_none());
    }

    #[test]
    fn ttl_cursor_excludes_future_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let now = store.current_time_ms();
        put(&store, "old", "v", now.saturating_sub(5_000));
        put(&store, "new", "v", now + 60_000);

        let txn = store.transaction().unwrap();
        let mut cursor = txn.ttl_index_cursor(now);
        let entry = cursor.next().unwrap().unwrap();
        assert_eq!(&entry.primary_key[..], b"old");
        assert!(cursor.next().is_none());
    }

    #[test]
    fn cursor_seek_and_skip_resume() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let now = store.current_time_ms();
        put(&store, "a", "v", now.saturating_sub(3_000));
        put(&store, "b", "v", now.saturating_sub(2_000));
        put(&store, "c", "v", now.saturating_sub(1_000));

        let txn = store.transaction().unwrap();
        let mut cursor = txn.ttl_index_cursor(now);
        let first = cursor.next().unwrap().unwrap();
        assert_eq!(&first.primary_key[..], b"a");

        // resume from the checkpoint: seek, skip the equal entry
        let checkpoint = first.encode();
        let mut cursor = txn.ttl_index_cursor(now);
        cursor.seek(&checkpoint);
        assert_eq!(cursor.key().unwrap(), checkpoint.as_slice());
        cursor.skip();
        let second = cursor.next().unwrap().unwrap();
        assert_eq!(&second.primary_key[..], b"b");
    }

    #[test]
    fn overwrite_moves_ttl_index_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let now = store.current_time_ms();
        put(&store, "k", "v1", now.saturating_sub(1_000));
        // overwrite with a future expiry: the old expired index entry
        // must disappear
        put(&store, "k", "v2", now + 60_000);

        let txn = store.transaction().unwrap();
        let mut cursor = txn.ttl_index_cursor(now);
        assert!(cursor.next().is_none());
    }

    #[test]
    fn log_replay_restores_keyspace_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let now;
        {
            let store = open_store(dir.path());
            now = store.current_time_ms();
            put(&store, "persist", "p", 0);
            put(&store, "expired", "e", now.saturating_sub(1_000));
            put(&store, "deleted", "d", 0);
            let mut txn = store.transaction().unwrap();
            txn.del(0, Bytes::from_static(b"deleted"));
            txn.commit().unwrap();
            store.stop().unwrap();
        }

        let store = open_store(dir.path());
        let txn = store.transaction().unwrap();
        assert!(txn.get(0, b"persist").is_some());
        assert!(txn.get(0, b"deleted").is_none());
        let mut cursor = txn.ttl_index_cursor(now);
        let entry = cursor.next().unwrap().unwrap();
        assert_eq!(&entry.primary_key[..], b"expired");
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        put(&store, "a", "1", 0);
        put(&store, "b", "2", 123_456_789_000);

        let snap = store.snapshot_bytes().unwrap();
        let mut entries = Store::decode_snapshot(&snap).unwrap();
        entries.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(entries.len(), 2);
        assert_eq!(&entries[0].1[..], b"a");
        assert_eq!(entries[1].3, 123_456_789_000);
    }

    #[test]
    fn corrupt_snapshot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        put(&store, "a", "1", 0);

        let mut snap = store.snapshot_bytes().unwrap();
        let mid = snap.len() / 2;
        snap[mid] ^= 0xFF;
        assert!(matches!(
            Store::decode_snapshot(&snap),
            Err(StorageError::Corrupt(_))
        ));
    }

    #[test]
    fn binlog_tail_and_subscription() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        put(&store, "a", "1", 0);
        put(&store, "b", "2", 0);
        let mut rx = store.subscribe_binlog();
        put(&store, "c", "3", 0);

        // tail replays from a retained id
        let tail = store.binlog_tail_from(2).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].id, 2);

        // live subscription sees the commit after subscribe
        let live = rx.try_recv().unwrap();
        assert_eq!(live.id, 3);

        // an id older than the retained tail means resync
        assert!(store.binlog_tail_from(0).is_none());
    }

    #[test]
    fn version_not_bumped_for_idempotent_ops_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(
            "0",
            dir.path(),
            Arc::new(BlockCache::new(0)),
            StoreMode::ReadWrite,
            false,
        )
        .unwrap();

        put(&store, "k", "v", 0);
        let v_after_put = store.binlog_tail_from(1).unwrap().last().unwrap().version;

        let mut txn = store.transaction().unwrap();
        txn.set_expire(0, Bytes::from_static(b"k"), store.current_time_ms() + 60_000);
        txn.commit().unwrap();

        let v_after_expire = store.binlog_tail_from(1).unwrap().last().unwrap().version;
        assert_eq!(v_after_put, v_after_expire);
    }

    #[test]
    fn oom_commit_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(BlockCache::new(200));
        let store = Store::open("0", dir.path(), cache.clone(), StoreMode::ReadWrite, true)
            .unwrap();

        put(&store, "small", "v", 0);
        let used_before = cache.used();

        let mut txn = store.transaction().unwrap();
        txn.put(
            0,
            Bytes::from_static(b"big"),
            Bytes::from(vec![0u8; 512]),
            0,
        );
        assert!(matches!(txn.commit(), Err(StorageError::OutOfMemory)));

        assert_eq!(cache.used(), used_before);
        let txn = store.transaction().unwrap();
        assert!(txn.get(0, b"big").is_none());
    }

    #[test]
    fn destroy_requires_pause_and_clears_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        put(&store, "k", "v", 0);

        assert!(matches!(store.destroy(), Err(StorageError::NotPaused(_))));

        store.pause();
        store.destroy().unwrap();
        assert_eq!(store.mode(), StoreMode::StoreNone);
        assert!(!store.is_open());
        assert!(store.transaction().is_err());
        assert!(!log_path(dir.path(), "0").exists());
    }

    #[test]
    fn stopped_store_rejects_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.stop().unwrap();
        assert!(matches!(
            store.transaction(),
            Err(StorageError::NotOpen(_))
        ));
    }
}
