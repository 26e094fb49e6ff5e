//! The TTL index manager.
//!
//! One loop task ticks every `pause_secs`: it schedules a scan job for
//! every shard on the scanner pool and, for every shard whose expired
//! queue is non-empty, a delete job on the deleter pool. Per-shard
//! single-shot latches make both jobs idempotent against double
//! scheduling — a tick that fires while the previous job is still
//! running short-circuits instead of stacking up.
//!
//! The scanner walks the store's TTL index cursor (bounded by the
//! store's current time, so only already-expired entries appear),
//! resuming from the shard's `scan_point` checkpoint and skipping the
//! exact entry it stopped at. Forward progress holds because the index
//! encoding leads with the expiry timestamp: entries inserted for
//! later expiries always sort after the checkpoint.
//!
//! The deleter drains the queue through `expire_key_if_needed`, which
//! re-checks expiry under a write-intent lock — a double-enqueued or
//! since-overwritten entry costs a wasted pop, never a wrong delete.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use shoal_core::{Error, LockMode, PoolMatrix, WorkerPool};
use shoal_storage::{StoreMode, TtlIndexEntry};

use crate::commands;
use crate::config::ServerConfig;
use crate::server::ServerInner;
use crate::session::LocalSession;

struct IndexState {
    /// Per-shard resume checkpoint: the encoding of the last index
    /// entry the scanner observed.
    scan_points: Vec<Vec<u8>>,
    /// Per-shard FIFO of expired entries awaiting deletion.
    expired: Vec<VecDeque<TtlIndexEntry>>,
}

struct IndexInner {
    running: AtomicBool,
    server: OnceLock<Weak<ServerInner>>,
    scanner: WorkerPool,
    deleter: WorkerPool,
    scan_batch: usize,
    del_batch: usize,
    scan_jobs: usize,
    del_jobs: usize,
    pause: Duration,
    state: Mutex<IndexState>,
    scan_job_status: Vec<AtomicBool>,
    del_job_status: Vec<AtomicBool>,
    disable_status: Vec<AtomicBool>,
    total_enqueue: AtomicU64,
    total_dequeue: AtomicU64,
    shutdown: Notify,
    runner: Mutex<Option<JoinHandle<()>>>,
}

/// Releases a per-shard job latch on scope exit.
struct Latch<'a>(&'a AtomicBool);

impl Drop for Latch<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// TTL reaping subsystem handle, exclusively owned by the server.
pub struct IndexManager {
    inner: Arc<IndexInner>,
}

impl IndexManager {
    pub fn new(cfg: &ServerConfig, store_count: u32) -> Self {
        let n = store_count as usize;
        Self {
            inner: Arc::new(IndexInner {
                running: AtomicBool::new(false),
                server: OnceLock::new(),
                scanner: WorkerPool::new("tx-idx-scan", Arc::new(PoolMatrix::new())),
                deleter: WorkerPool::new("tx-idx-del", Arc::new(PoolMatrix::new())),
                scan_batch: cfg.scan_batch,
                del_batch: cfg.del_batch,
                scan_jobs: cfg.scan_jobs,
                del_jobs: cfg.del_jobs,
                pause: Duration::from_secs(cfg.pause_secs),
                state: Mutex::new(IndexState {
                    scan_points: vec![Vec::new(); n],
                    expired: (0..n).map(|_| VecDeque::new()).collect(),
                }),
                scan_job_status: (0..n).map(|_| AtomicBool::new(false)).collect(),
                del_job_status: (0..n).map(|_| AtomicBool::new(false)).collect(),
                disable_status: (0..n).map(|_| AtomicBool::new(false)).collect(),
                total_enqueue: AtomicU64::new(0),
                total_dequeue: AtomicU64::new(0),
                shutdown: Notify::new(),
                runner: Mutex::new(None),
            }),
        }
    }

    /// Starts both pools and the tick loop.
    pub fn startup(&self, server: Weak<ServerInner>) -> Result<(), Error> {
        self.inner
            .server
            .set(server)
            .map_err(|_| Error::Internal("index manager started twice".into()))?;
        self.inner.scanner.startup(self.inner.scan_jobs)?;
        self.inner.deleter.startup(self.inner.del_jobs)?;
        self.inner.running.store(true, Ordering::Release);

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            run_loop(inner).await;
        });
        *self.inner.runner.lock().expect("index lock") = Some(handle);
        Ok(())
    }

    /// Freezes all index work for a destroyed store: clears its queue
    /// and checkpoint and disables further scheduling. In-flight jobs
    /// observe the disable flag at their next yield point.
    pub fn stop_store(&self, store_id: u32) -> Result<(), Error> {
        let idx = store_id as usize;
        let mut state = self.inner.state.lock().expect("index lock");
        if idx >= state.scan_points.len() {
            return Err(Error::NotFound(format!("no store with id {store_id}")));
        }
        state.expired[idx].clear();
        state.scan_points[idx].clear();
        self.inner.disable_status[idx].store(true, Ordering::Release);
        Ok(())
    }

    /// Stops the tick loop, then both pools (which drain their queues).
    pub async fn stop(&self) {
        info!("index manager begins to stop");
        self.inner.running.store(false, Ordering::Release);
        // notify_one stores a permit, so a runner that is mid-tick
        // (not parked on the notify yet) still wakes immediately
        self.inner.shutdown.notify_one();
        let runner = self.inner.runner.lock().expect("index lock").take();
        if let Some(runner) = runner {
            let _ = runner.await;
        }
        self.inner.scanner.stop().await;
        self.inner.deleter.stop().await;
        info!("index manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Runs one scan job for a shard right now, bypassing the tick
    /// loop. Used by tests and by admin tooling.
    pub async fn scan_store_once(&self, store_id: u32) -> Result<(), Error> {
        scan_expired_keys_job(&self.inner, store_id).await
    }

    /// Runs one delete job for a shard right now; returns deletions.
    pub async fn del_store_once(&self, store_id: u32) -> usize {
        try_del_expired_keys_job(&self.inner, store_id).await
    }

    /// The shard's current scan checkpoint (empty before any scan).
    pub fn scan_point(&self, store_id: u32) -> Vec<u8> {
        self.inner.state.lock().expect("index lock").scan_points[store_id as usize].clone()
    }

    /// Number of queued expired entries for a shard.
    pub fn expired_queue_len(&self, store_id: u32) -> usize {
        self.inner.state.lock().expect("index lock").expired[store_id as usize].len()
    }

    /// Total entries ever enqueued / dequeued, across shards.
    pub fn totals(&self) -> (u64, u64) {
        (
            self.inner.total_enqueue.load(Ordering::Relaxed),
            self.inner.total_dequeue.load(Ordering::Relaxed),
        )
    }
}

/// The tick loop: schedule scans for all shards, deletes for the
/// shards with queued entries, sleep, repeat.
async fn run_loop(inner: Arc<IndexInner>) {
    info!("index manager running");
    while inner.running.load(Ordering::Acquire) {
        let Some(server) = inner.server.get().and_then(Weak::upgrade) else {
            break;
        };
        let store_count = server.kv_store_count();
        drop(server);

        for store_id in 0..store_count {
            let job = Arc::clone(&inner);
            let scheduled = inner
                .scanner
                .schedule(async move {
                    if let Err(e) = scan_expired_keys_job(&job, store_id).await {
                        warn!(store_id, "ttl scan failed: {e}");
                    }
                })
                .await;
            if scheduled.is_err() {
                break;
            }
        }

        let pending: Vec<u32> = {
            let state = inner.state.lock().expect("index lock");
            (0..store_count)
                .filter(|&i| !state.expired[i as usize].is_empty())
                .collect()
        };
        for store_id in pending {
            let job = Arc::clone(&inner);
            let scheduled = inner
                .deleter
                .schedule(async move {
                    let deleted = try_del_expired_keys_job(&job, store_id).await;
                    if deleted > 0 {
                        debug!(store_id, deleted, "ttl keys reaped");
                    }
                })
                .await;
            if scheduled.is_err() {
                break;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(inner.pause) => {}
            _ = inner.shutdown.notified() => {}
        }
    }
    info!("index manager exiting");
}

/// Scans one shard's TTL index for expired entries.
///
/// Short-circuits on the per-shard latch, the disable flag, replica
/// mode, and closed stores. Reads at most `scan_batch` entries,
/// advancing the shard's `scan_point` for each.
async fn scan_expired_keys_job(inner: &IndexInner, store_id: u32) -> Result<(), Error> {
    let idx = store_id as usize;
    if inner.scan_job_status[idx]
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Ok(());
    }
    let _latch = Latch(&inner.scan_job_status[idx]);

    if inner.disable_status[idx].load(Ordering::Acquire) {
        return Ok(());
    }
    let Some(server) = inner.server.get().and_then(Weak::upgrade) else {
        return Ok(());
    };

    let db = server
        .segment_mgr()
        .db_allow_closed(store_id, LockMode::IntentShared)
        .await?;
    let store = db.store();
    // a replica reaps nothing itself; expirations arrive via binlog
    if store.mode() == StoreMode::ReplicateOnly || !store.is_open() {
        return Ok(());
    }

    let txn = store.transaction()?;
    let mut cursor = txn.ttl_index_cursor(store.current_time_ms());

    let prefix = {
        let state = inner.state.lock().expect("index lock");
        state.scan_points[idx].clone()
    };
    if !prefix.is_empty() {
        // resume where we left off, skipping the already-enqueued entry
        cursor.seek(&prefix);
        match cursor.key() {
            None => return Ok(()),
            Some(key) if key == prefix.as_slice() => cursor.skip(),
            Some(_) => {}
        }
    }

    while let Some(entry) = cursor.next() {
        let entry = entry.map_err(Error::from)?;
        let mut state = inner.state.lock().expect("index lock");
        state.scan_points[idx] = entry.encode();
        state.expired[idx].push_back(entry);
        inner.total_enqueue.fetch_add(1, Ordering::Relaxed);
        if state.expired[idx].len() >= inner.scan_batch {
            break;
        }
    }
    Ok(())
}

/// Drains one shard's expired queue, up to `del_batch` deletions.
///
/// Every entry goes through the conditional delete, which re-checks
/// expiry under a write-intent lock; entries are popped whether or not
/// the delete went through, errors are logged and swallowed.
async fn try_del_expired_keys_job(inner: &IndexInner, store_id: u32) -> usize {
    let idx = store_id as usize;
    if inner.del_job_status[idx]
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return 0;
    }
    let _latch = Latch(&inner.del_job_status[idx]);

    if inner.disable_status[idx].load(Ordering::Acquire) {
        return 0;
    }
    let Some(server) = inner.server.get().and_then(Weak::upgrade) else {
        return 0;
    };

    let mut deletes = 0usize;
    loop {
        let entry = {
            let state = inner.state.lock().expect("index lock");
            state.expired[idx].front().cloned()
        };
        let Some(entry) = entry else { break };

        let sess = LocalSession::new(entry.db_id);
        if let Err(e) = commands::expire_key_if_needed(&server, &sess, &entry).await {
            warn!(store_id, "expire delete failed: {e}");
        }

        {
            let mut state = inner.state.lock().expect("index lock");
            if state.expired[idx].pop_front().is_some() {
                inner.total_dequeue.fetch_add(1, Ordering::Relaxed);
                deletes += 1;
            }
        }
        if deletes >= inner.del_batch {
            break;
        }
    }
    deletes
}
