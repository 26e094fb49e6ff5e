//! The replication manager.
//!
//! Owns every transport the dispatch path hands over. A `FULLSYNC`
//! handshake becomes a one-shot snapshot stream; an `INCRSYNC`
//! handshake becomes a long-lived binlog subscription that replays the
//! retained tail from the requested binlog id and then relays live
//! records.
//!
//! # Wire protocol (after the RESP handshake)
//!
//! All integers are little-endian.
//!
//! ```text
//! // FULLSYNC reply:
//! [MSG_FULL_SYNC: 1B][store_id: 4B][next_binlog_id: 8B]
//! [snapshot_len: 4B][snapshot_bytes]
//!
//! // INCRSYNC accept, then one frame per record:
//! [MSG_SYNC_OK: 1B]
//! [MSG_RECORD: 1B][dst_store_id: 4B][binlog_id: 8B][version: 8B]
//! [record_len: 4B][record_bytes]
//!
//! // When the requested id is gone, the stream lagged, or a gap is
//! // detected — the subscriber must reconnect with FULLSYNC:
//! [MSG_RESYNC: 1B]
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use shoal_core::{Error, LockMode};
use shoal_storage::{BinlogRecord, Store};

use crate::server::ServerInner;

pub const MSG_FULL_SYNC: u8 = 1;
pub const MSG_RECORD: u8 = 4;
pub const MSG_RESYNC: u8 = 5;
pub const MSG_SYNC_OK: u8 = 6;

// -- framed I/O primitives --
//
// thin wrappers for the little-endian binary protocol; each wraps one
// write, buffering is the stream's problem

async fn write_u8(w: &mut (impl AsyncWrite + Unpin), val: u8) -> std::io::Result<()> {
    w.write_all(&[val]).await
}

async fn write_u32_le(w: &mut (impl AsyncWrite + Unpin), val: u32) -> std::io::Result<()> {
    w.write_all(&val.to_le_bytes()).await
}

async fn write_u64_le(w: &mut (impl AsyncWrite + Unpin), val: u64) -> std::io::Result<()> {
    w.write_all(&val.to_le_bytes()).await
}

/// Writes one binlog record frame addressed to the replica's store.
async fn write_record(
    w: &mut (impl AsyncWrite + Unpin),
    dst_store_id: u32,
    record: &BinlogRecord,
) -> std::io::Result<()> {
    let body = record.record.to_bytes();
    write_u8(w, MSG_RECORD).await?;
    write_u32_le(w, dst_store_id).await?;
    write_u64_le(w, record.id).await?;
    write_u64_le(w, record.version).await?;
    write_u32_le(w, body.len() as u32).await?;
    w.write_all(&body).await
}

struct ReplInner {
    running: AtomicBool,
    server: OnceLock<Weak<ServerInner>>,
    /// Per-shard kill switches flipped by `stop_store`.
    disabled: Vec<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Replication subsystem handle, exclusively owned by the server.
pub struct ReplManager {
    inner: Arc<ReplInner>,
}

impl ReplManager {
    pub fn new(store_count: u32) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ReplInner {
                running: AtomicBool::new(false),
                server: OnceLock::new(),
                disabled: (0..store_count).map(|_| AtomicBool::new(false)).collect(),
                shutdown_tx,
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Records the back reference and starts accepting handoffs.
    pub fn startup(&self, server: Weak<ServerInner>) -> Result<(), Error> {
        self.inner
            .server
            .set(server)
            .map_err(|_| Error::Internal("replication manager started twice".into()))?;
        self.inner.running.store(true, Ordering::Release);
        Ok(())
    }

    /// Takes ownership of a handed-off transport and streams a full
    /// snapshot of the requested store on it, then closes it.
    pub fn supply_full_sync(&self, stream: TcpStream, store_id_arg: Bytes) {
        let inner = Arc::clone(&self.inner);
        self.track(tokio::spawn(async move {
            full_sync_task(inner, stream, store_id_arg).await;
        }));
    }

    /// Takes ownership of a handed-off transport and registers it as
    /// an incremental binlog subscriber.
    pub fn register_incr_sync(
        &self,
        stream: TcpStream,
        store_id_arg: Bytes,
        dst_store_id_arg: Bytes,
        binlog_id_arg: Bytes,
    ) {
        let inner = Arc::clone(&self.inner);
        self.track(tokio::spawn(async move {
            incr_sync_task(inner, stream, store_id_arg, dst_store_id_arg, binlog_id_arg).await;
        }));
    }

    /// Stops per-shard replication work for a destroyed store.
    pub fn stop_store(&self, store_id: u32) -> Result<(), Error> {
        let flag = self
            .inner
            .disabled
            .get(store_id as usize)
            .ok_or_else(|| Error::NotFound(format!("no store with id {store_id}")))?;
        flag.store(true, Ordering::Release);
        Ok(())
    }

    /// Ends every replication worker and waits for them.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        let _ = self.inner.shutdown_tx.send(true);
        let workers = {
            let mut guard = self.inner.workers.lock().expect("repl lock");
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            let _ = worker.await;
        }
        info!("replication manager stopped");
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut workers = self.inner.workers.lock().expect("repl lock");
        // drop finished handles so the list doesn't grow with churn
        workers.retain(|w| !w.is_finished());
        workers.push(handle);
    }
}

async fn full_sync_task(inner: Arc<ReplInner>, mut stream: TcpStream, store_id_arg: Bytes) {
    if !inner.running.load(Ordering::Acquire) {
        return;
    }
    let Some(server) = inner.server.get().and_then(Weak::upgrade) else {
        return;
    };
    let Some(store_id) = parse_id(&store_id_arg) else {
        let _ = stream.write_all(b"-ERR invalid store id\r\n").await;
        return;
    };

    let (snapshot, next_binlog_id) = {
        let db = match server
            .segment_mgr()
            .db(store_id, LockMode::IntentShared)
            .await
        {
            Ok(db) => db,
            Err(e) => {
                let _ = stream.write_all(format!("-ERR {e}\r\n").as_bytes()).await;
                return;
            }
        };
        match db.store().snapshot_bytes() {
            Ok(bytes) => (bytes, db.store().next_binlog_id()),
            Err(e) => {
                let _ = stream.write_all(format!("-ERR {e}\r\n").as_bytes()).await;
                return;
            }
        }
    };

    let result: std::io::Result<()> = async {
        write_u8(&mut stream, MSG_FULL_SYNC).await?;
        write_u32_le(&mut stream, store_id).await?;
        write_u64_le(&mut stream, next_binlog_id).await?;
        write_u32_le(&mut stream, snapshot.len() as u32).await?;
        stream.write_all(&snapshot).await?;
        stream.flush().await
    }
    .await;

    match result {
        Ok(()) => info!(store_id, bytes = snapshot.len(), "full sync streamed"),
        Err(e) => warn!(store_id, "full sync aborted: {e}"),
    }
}

async fn incr_sync_task(
    inner: Arc<ReplInner>,
    mut stream: TcpStream,
    store_id_arg: Bytes,
    dst_store_id_arg: Bytes,
    binlog_id_arg: Bytes,
) {
    if !inner.running.load(Ordering::Acquire) {
        return;
    }
    let Some(server) = inner.server.get().and_then(Weak::upgrade) else {
        return;
    };
    let (Some(store_id), Some(dst_store_id), Some(binlog_id)) = (
        parse_id(&store_id_arg),
        parse_id(&dst_store_id_arg),
        parse_id64(&binlog_id_arg),
    ) else {
        let _ = stream
            .write_all(b"-ERR invalid incrsync arguments\r\n")
            .await;
        return;
    };

    let store: Store = {
        match server
            .segment_mgr()
            .db(store_id, LockMode::IntentShared)
            .await
        {
            Ok(db) => db.store().clone(),
            Err(e) => {
                let _ = stream.write_all(format!("-ERR {e}\r\n").as_bytes()).await;
                return;
            }
        }
    };
    // the server handle is only needed for the lookup; holding it for
    // the life of the subscription would keep the server alive
    drop(server);

    // subscribe before reading the tail so no record can fall between
    let mut rx = store.subscribe_binlog();
    let Some(tail) = store.binlog_tail_from(binlog_id) else {
        warn!(store_id, binlog_id, "requested binlog already evicted, resync");
        let _ = write_u8(&mut stream, MSG_RESYNC).await;
        return;
    };

    if write_u8(&mut stream, MSG_SYNC_OK).await.is_err() {
        return;
    }
    let mut next_expected = binlog_id;
    for record in &tail {
        if write_record(&mut stream, dst_store_id, record).await.is_err() {
            return;
        }
        next_expected = record.id + 1;
    }
    if stream.flush().await.is_err() {
        return;
    }
    info!(store_id, dst_store_id, from = binlog_id, replayed = tail.len(),
          "incr sync subscriber registered");

    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    loop {
        if !inner.running.load(Ordering::Acquire)
            || inner.disabled[store_id as usize].load(Ordering::Acquire)
        {
            break;
        }
        tokio::select! {
            msg = rx.recv() => match msg {
                Ok(record) => {
                    // already covered by the tail replay
                    if record.id < next_expected {
                        continue;
                    }
                    if record.id > next_expected {
                        warn!(store_id, expected = next_expected, got = record.id,
                              "binlog gap, resync");
                        let _ = write_u8(&mut stream, MSG_RESYNC).await;
                        break;
                    }
                    if write_record(&mut stream, dst_store_id, &record).await.is_err() {
                        break;
                    }
                    if stream.flush().await.is_err() {
                        break;
                    }
                    next_expected += 1;
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(store_id, lagged = count, "subscriber lagged, resync");
                    let _ = write_u8(&mut stream, MSG_RESYNC).await;
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown_rx.changed() => break,
        }
    }
    info!(store_id, dst_store_id, "incr sync subscriber ended");
}

fn parse_id(arg: &Bytes) -> Option<u32> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}

fn parse_id64(arg: &Bytes) -> Option<u64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}
