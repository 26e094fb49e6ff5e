//! The server entry: lifecycle owner and dispatch core.
//!
//! `startup` assembles the subsystems in dependency order — catalog,
//! shard stores (sharing one cache budget), segment manager,
//! pessimistic manager, request executor, network (bound but not yet
//! accepting), replication manager, index manager — and only then lets
//! the listener accept. `stop` quiesces them in reverse: listener
//! first so no new work arrives, session registry last among the
//! online parts, stores at the very end.
//!
//! Ownership is strictly one-way: the server owns its subsystems, and
//! subsystems hold `Weak` back references they upgrade at use. Nothing
//! keeps the server alive but its handle, so teardown is just drop
//! order — no reference cycles to break by hand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::json;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use shoal_core::{
    Error, LockMode, NetworkMatrix, PessimisticMgr, PoolMatrix, RequestMatrix, SegmentMgr,
    WorkerPool,
};
use shoal_storage::{
    BlockCache, Catalog, Store, StoreMainMeta, StoreMode, CATALOG_NAME,
};

use crate::commands;
use crate::config::ServerConfig;
use crate::index::IndexManager;
use crate::network::Network;
use crate::repl::ReplManager;
use crate::session::Session;

struct AuthKeys {
    requirepass: Option<Arc<String>>,
    masterauth: Option<Arc<String>>,
}

/// Process-wide server state. Subsystems receive `Weak` references to
/// this; only [`Server`] holds it strongly.
pub struct ServerInner {
    cfg: ServerConfig,
    startup_time_ns: u64,

    running: AtomicBool,
    stopped: AtomicBool,
    shutdown_requested: AtomicBool,
    ftmc_enabled: AtomicBool,

    auth: Mutex<AuthKeys>,
    sessions: Mutex<HashMap<u64, Arc<Session>>>,

    kvstores: Vec<Store>,
    catalog: Catalog,
    segment_mgr: SegmentMgr,
    pessimistic_mgr: PessimisticMgr,
    network: Network,
    executor: WorkerPool,
    repl_mgr: ReplManager,
    index_mgr: IndexManager,

    /// Wakes the monitor and `wait_stop_complete` on state changes.
    event: Notify,

    net_matrix: Arc<NetworkMatrix>,
    req_matrix: Arc<RequestMatrix>,
    pool_matrix: Arc<PoolMatrix>,

    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable owner handle. Dropping the last clone drops every
/// subsystem in reverse construction order.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Builds and starts the whole server.
    ///
    /// Any failure leaves nothing running: partially constructed
    /// subsystems are released when the error unwinds.
    pub async fn startup(cfg: ServerConfig) -> Result<Server, Error> {
        cfg.validate()?;
        std::fs::create_dir_all(&cfg.data_dir)
            .map_err(|e| Error::Internal(format!("create data dir failed: {e}")))?;
        info!("server startup");

        // catalog first: it decides the modes every shard opens with
        let catalog_store = Store::open(
            CATALOG_NAME,
            &cfg.data_dir,
            Arc::new(BlockCache::new(0)),
            StoreMode::ReadWrite,
            cfg.version_increase,
        )?;
        let catalog = Catalog::new(catalog_store, cfg.kv_store_count, cfg.chunk_size);

        // shard stores share one cache budget
        let cache = Arc::new(BlockCache::with_mb(cfg.block_cache_mb));
        let mut kvstores = Vec::with_capacity(cfg.kv_store_count as usize);
        for store_id in 0..cfg.kv_store_count {
            let mode = match catalog.store_main_meta(store_id) {
                Ok(Some(meta)) => meta.store_mode,
                Ok(None) => {
                    let meta = StoreMainMeta {
                        store_id,
                        store_mode: StoreMode::ReadWrite,
                    };
                    // the catalog and the shard table must agree; a
                    // catalog we cannot write is a fatal misconfig
                    if let Err(e) = catalog.set_store_main_meta(&meta) {
                        panic!("catalog set_store_main_meta error: {e}");
                    }
                    StoreMode::ReadWrite
                }
                Err(e) => panic!("catalog store_main_meta error: {e}"),
            };
            kvstores.push(Store::open(
                &store_id.to_string(),
                &cfg.data_dir,
                Arc::clone(&cache),
                mode,
                cfg.version_increase,
            )?);
        }

        let segment_mgr = SegmentMgr::new(kvstores.clone(), cfg.chunk_size);
        let pessimistic_mgr = PessimisticMgr::new(cfg.kv_store_count);

        let pool_matrix = Arc::new(PoolMatrix::new());
        let executor = WorkerPool::new("req-exec", Arc::clone(&pool_matrix));
        executor.startup(cfg.executor_size())?;

        let net_matrix = Arc::new(NetworkMatrix::new());
        let network = Network::new(Arc::clone(&net_matrix));
        network.prepare(&cfg.bind_ip, cfg.port).await?;

        // replication dials out through the prepared-but-quiet network
        let repl_mgr = ReplManager::new(cfg.kv_store_count);
        let index_mgr = IndexManager::new(&cfg, cfg.kv_store_count);

        let requirepass = cfg.requirepass.clone().map(Arc::new);
        let masterauth = cfg.masterauth.clone().map(Arc::new);
        let inner = Arc::new(ServerInner {
            startup_time_ns: ns_since_epoch(),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(true),
            shutdown_requested: AtomicBool::new(false),
            ftmc_enabled: AtomicBool::new(false),
            auth: Mutex::new(AuthKeys {
                requirepass,
                masterauth,
            }),
            sessions: Mutex::new(HashMap::new()),
            kvstores,
            catalog,
            segment_mgr,
            pessimistic_mgr,
            network,
            executor,
            repl_mgr,
            index_mgr,
            event: Notify::new(),
            net_matrix,
            req_matrix: Arc::new(RequestMatrix::new()),
            pool_matrix,
            monitor: Mutex::new(None),
            cfg,
        });

        assert_eq!(
            inner.kvstores.len() as u32,
            inner.catalog.kv_store_count(),
            "shard table and catalog disagree on store count"
        );

        inner.repl_mgr.startup(Arc::downgrade(&inner))?;
        inner.index_mgr.startup(Arc::downgrade(&inner))?;

        // the listener is the last one to run
        inner.network.run(Arc::downgrade(&inner))?;
        inner.running.store(true, Ordering::Release);
        inner.stopped.store(false, Ordering::Release);

        let monitor = tokio::spawn(monitor_loop(Arc::downgrade(&inner)));
        *inner.monitor.lock().expect("server lock") = Some(monitor);

        info!(
            addr = %inner.network.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            shards = inner.kvstores.len(),
            "ready to accept connections"
        );
        Ok(Server { inner })
    }

    pub fn inner(&self) -> &Arc<ServerInner> {
        &self.inner
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.network.local_addr()
    }

    pub fn kv_store_count(&self) -> u32 {
        self.inner.kv_store_count()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().expect("server lock").len()
    }

    pub fn handle_shutdown_cmd(&self) {
        self.inner.handle_shutdown_cmd();
    }

    pub fn toggle_ftmc(&self, enable: bool) {
        self.inner.toggle_ftmc(enable);
    }

    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    pub async fn wait_stop_complete(&self) {
        self.inner.wait_stop_complete().await;
    }

    pub async fn destroy_store(&self, store_id: u32, force: bool) -> Result<(), Error> {
        self.inner.destroy_store(store_id, force).await
    }

    pub async fn set_store_mode(&self, store_id: u32, mode: StoreMode) -> Result<(), Error> {
        let db = self
            .inner
            .segment_mgr
            .db_allow_closed(store_id, LockMode::Exclusive)
            .await?;
        self.inner.set_store_mode(db.store(), mode)
    }

    pub fn index_mgr(&self) -> &IndexManager {
        &self.inner.index_mgr
    }

    pub fn store(&self, store_id: u32) -> Option<&Store> {
        self.inner.kvstores.get(store_id as usize)
    }
}

impl ServerInner {
    pub fn startup_time_ns(&self) -> u64 {
        self.startup_time_ns
    }

    pub fn kv_store_count(&self) -> u32 {
        assert_eq!(
            self.kvstores.len() as u32,
            self.catalog.kv_store_count(),
            "shard table and catalog disagree on store count"
        );
        self.catalog.kv_store_count()
    }

    pub fn segment_mgr(&self) -> &SegmentMgr {
        &self.segment_mgr
    }

    pub fn pessimistic_mgr(&self) -> &PessimisticMgr {
        &self.pessimistic_mgr
    }

    pub fn repl_mgr(&self) -> &ReplManager {
        &self.repl_mgr
    }

    pub fn net_matrix(&self) -> &Arc<NetworkMatrix> {
        &self.net_matrix
    }

    pub fn req_matrix(&self) -> &Arc<RequestMatrix> {
        &self.req_matrix
    }

    pub fn requirepass(&self) -> Option<Arc<String>> {
        self.auth.lock().expect("server lock").requirepass.clone()
    }

    pub fn masterauth(&self) -> Option<Arc<String>> {
        self.auth.lock().expect("server lock").masterauth.clone()
    }

    /// Swaps the shared password; in-flight readers keep their Arc.
    pub fn set_requirepass(&self, pass: Option<String>) {
        self.auth.lock().expect("server lock").requirepass = pass.map(Arc::new);
    }

    pub fn set_masterauth(&self, pass: Option<String>) {
        self.auth.lock().expect("server lock").masterauth = pass.map(Arc::new);
    }

    pub fn toggle_ftmc(&self, enable: bool) {
        self.ftmc_enabled.store(enable, Ordering::Release);
    }

    pub fn ftmc_enabled(&self) -> bool {
        self.ftmc_enabled.load(Ordering::Acquire)
    }

    // -- session registry --

    /// Registers a session and arms its read loop.
    ///
    /// Sessions arriving while the server is stopping are dropped —
    /// dropping the handle closes the socket.
    pub fn add_session(&self, sess: Arc<Session>) {
        let mut sessions = self.sessions.lock().expect("server lock");
        if !self.running.load(Ordering::Acquire) {
            warn!(conn_id = sess.id(), "session comes when stopping, ignore it");
            return;
        }
        // first driving force for this connection
        sess.start();
        let id = sess.id();
        if sessions.insert(id, sess).is_some() {
            panic!("add conn:{id}, id already exists");
        }
    }

    /// Asks a session to stop at its next quiescent point.
    pub fn cancel_session(&self, conn_id: u64) -> Result<(), Error> {
        let sessions = self.sessions.lock().expect("server lock");
        if !self.running.load(Ordering::Acquire) {
            return Err(Error::Busy("server is shutting down".into()));
        }
        let sess = sessions
            .get(&conn_id)
            .ok_or_else(|| Error::NotFound("session not found".into()))?;
        sess.cancel();
        Ok(())
    }

    /// Removes a session. A missing id while running is a registry
    /// corruption bug; during shutdown it is a no-op.
    pub fn end_session(&self, conn_id: u64) {
        let mut sessions = self.sessions.lock().expect("server lock");
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        if sessions.remove(&conn_id).is_none() {
            panic!("destroy conn:{conn_id}, not exists");
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().expect("server lock").len()
    }

    // -- dispatch path --

    /// Runs the session's pending request on the executor pool and
    /// reports whether the connection should keep reading.
    pub async fn dispatch_request(self: &Arc<Self>, conn_id: u64) -> Result<bool, Error> {
        let (done_tx, done_rx) = oneshot::channel();
        let server = Arc::clone(self);
        self.executor
            .schedule(async move {
                let started = Instant::now();
                let keep = server.process_request(conn_id).await;
                server
                    .req_matrix
                    .processed
                    .fetch_add(1, Ordering::Relaxed);
                server.req_matrix.process_cost.fetch_add(
                    started.elapsed().as_micros() as u64,
                    Ordering::Relaxed,
                );
                let _ = done_tx.send(keep);
            })
            .await?;
        done_rx
            .await
            .map_err(|_| Error::Busy("request dropped during shutdown".into()))
    }

    /// The per-request entry point: precheck, route, execute.
    ///
    /// Returns `true` when a response is ready for the caller to flush
    /// and the read loop should re-arm; `false` when the session's
    /// transport has been borrowed (replication handshake) or the
    /// server is stopping — either way the network layer must not
    /// issue further reads on that transport.
    pub async fn process_request(self: &Arc<Self>, conn_id: u64) -> bool {
        let sess = {
            let sessions = self.sessions.lock().expect("server lock");
            if !self.running.load(Ordering::Acquire) {
                return false;
            }
            match sessions.get(&conn_id) {
                Some(sess) => Arc::clone(sess),
                None => panic!("conn:{conn_id}, invalid state"),
            }
        };

        self.log_general(&sess);

        let name = match commands::precheck(self, &sess) {
            Ok(name) => name,
            Err(e) => {
                sess.set_response(&commands::error_frame(&e));
                return true;
            }
        };

        if name == commands::CMD_FULLSYNC {
            warn!(conn_id, "socket borrowed for full sync");
            let args = sess.args();
            match sess.detach_transport().await {
                Some(stream) => self.repl_mgr.supply_full_sync(stream, args[1].clone()),
                None => warn!(conn_id, "transport already detached"),
            }
            return false;
        }
        if name == commands::CMD_INCRSYNC {
            warn!(conn_id, "socket borrowed for incr sync");
            let args = sess.args();
            match sess.detach_transport().await {
                Some(stream) => self.repl_mgr.register_incr_sync(
                    stream,
                    args[1].clone(),
                    args[2].clone(),
                    args[3].clone(),
                ),
                None => warn!(conn_id, "transport already detached"),
            }
            return false;
        }

        match commands::run_session_cmd(self, &sess).await {
            Ok(frame) => sess.set_response(&frame),
            Err(e) => sess.set_response(&commands::error_frame(&e)),
        }
        true
    }

    fn log_general(&self, sess: &Session) {
        if !self.cfg.general_log {
            return;
        }
        let rendered: Vec<String> = sess
            .args()
            .iter()
            .map(|a| {
                if a.is_empty() {
                    "\"\"".to_string()
                } else {
                    String::from_utf8_lossy(a).into_owned()
                }
            })
            .collect();
        info!(conn_id = sess.id(), "Command: {}", rendered.join(" "));
    }

    // -- shard administration --

    /// Destroys a shard: catalog first, then the store, then the
    /// per-shard replication and index workers.
    pub async fn destroy_store(&self, store_id: u32, force: bool) -> Result<(), Error> {
        let db = self
            .segment_mgr
            .db_allow_closed(store_id, LockMode::Exclusive)
            .await?;
        let store = db.store();

        if !force && !store.is_empty() {
            return Err(Error::Internal("try to close an unempty store".into()));
        }
        if !store.is_paused() {
            return Err(Error::Internal(
                "please pausestore first before destroystore".into(),
            ));
        }

        // commit StoreNone before destroying, so a crash mid-destroy
        // cannot re-expose a half-destroyed store on restart
        let mut meta = self
            .catalog
            .store_main_meta(store_id)
            .map_err(Error::from)?
            .ok_or_else(|| Error::Internal(format!("no catalog meta for store {store_id}")))?;
        meta.store_mode = StoreMode::StoreNone;
        if let Err(e) = self.catalog.set_store_main_meta(&meta) {
            warn!(store_id, "set store main meta failed: {e}");
            return Err(e.into());
        }

        if let Err(e) = store.destroy() {
            error!(store_id, "destroy store failed: {e}");
            return Err(e.into());
        }

        self.repl_mgr.stop_store(store_id)?;
        self.index_mgr.stop_store(store_id)?;
        Ok(())
    }

    /// Flips a store's mode and mirrors it into the catalog. Caller
    /// must hold the shard's exclusive lock. Idempotent: an unchanged
    /// mode writes nothing.
    pub fn set_store_mode(&self, store: &Store, mode: StoreMode) -> Result<(), Error> {
        if store.mode() == mode {
            return Ok(());
        }
        store.set_mode(mode);
        let store_id: u32 = store
            .db_id()
            .parse()
            .map_err(|_| Error::Internal(format!("store id '{}' is not numeric", store.db_id())))?;
        let mut meta = self
            .catalog
            .store_main_meta(store_id)
            .map_err(Error::from)?
            .unwrap_or(StoreMainMeta {
                store_id,
                store_mode: mode,
            });
        meta.store_mode = mode;
        self.catalog.set_store_main_meta(&meta).map_err(Error::from)
    }

    // -- stats --

    /// Emits the stats document with the requested sections.
    pub fn stats_json(&self, sections: &std::collections::HashSet<String>) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        if sections.contains("network") {
            let s = self.net_matrix.snapshot();
            obj.insert(
                "network".into(),
                json!({
                    "sticky_packets": s.sticky_packets,
                    "conn_created": s.conn_created,
                    "conn_released": s.conn_released,
                    "invalid_packets": s.invalid_packets,
                }),
            );
        }
        if sections.contains("request") {
            let s = self.req_matrix.snapshot();
            obj.insert(
                "request".into(),
                json!({
                    "processed": s.processed,
                    "process_cost": s.process_cost,
                    "send_packet_cost": s.send_packet_cost,
                }),
            );
        }
        if sections.contains("req_pool") {
            let s = self.pool_matrix.snapshot();
            obj.insert(
                "req_pool".into(),
                json!({
                    "in_queue": s.in_queue,
                    "executed": s.executed,
                    "queue_time": s.queue_time,
                    "execute_time": s.execute_time,
                }),
            );
        }
        serde_json::Value::Object(obj)
    }

    // -- lifecycle --

    /// Records a client shutdown request and wakes the waiters;
    /// idempotent, the actual stop happens in `wait_stop_complete`.
    pub fn handle_shutdown_cmd(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
        self.event.notify_waiters();
    }

    /// Stops everything, in order. Idempotent: only the caller that
    /// flips `running` does the work.
    pub async fn stop(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("server is already stopping, ignoring duplicate stop");
            return;
        }
        info!("server begins to stop");
        self.event.notify_waiters();

        // no new connections, then no new request execution
        self.network.stop();
        self.executor.stop().await;
        self.repl_mgr.stop().await;
        self.index_mgr.stop().await;

        // cancel live sessions and clear the registry; their read
        // loops observe the cancel at the next await point
        let sessions: Vec<Arc<Session>> = {
            let mut map = self.sessions.lock().expect("server lock");
            let drained: Vec<_> = map.values().cloned().collect();
            map.clear();
            drained
        };
        for sess in sessions {
            sess.cancel();
        }

        if let Err(e) = self.catalog.stop() {
            error!("stop catalog failed: {e}");
        }
        for store in &self.kvstores {
            if let Err(e) = store.stop() {
                error!(store = store.db_id(), "stop store failed: {e}");
            }
        }

        let monitor = self.monitor.lock().expect("server lock").take();
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }

        self.stopped.store(true, Ordering::Release);
        self.event.notify_waiters();
        info!("server stop complete");
    }

    /// Blocks until `running=false ∧ stopped=true`, polling the event
    /// notify with a one second timeout. A shutdown request observed
    /// during the wait triggers `stop` from here — never from the
    /// command handler, which only sets the flag.
    pub async fn wait_stop_complete(&self) {
        loop {
            if !self.running.load(Ordering::Acquire) && self.stopped.load(Ordering::Acquire) {
                return;
            }
            if self.shutdown_requested.load(Ordering::Acquire)
                && self.running.load(Ordering::Acquire)
            {
                info!("shutdown command");
                self.stop().await;
                continue;
            }
            let _ = tokio::time::timeout(Duration::from_secs(1), self.event.notified()).await;
        }
    }
}

/// Full-time matrix collect: every second (or on an event wakeup),
/// diff the matrix snapshots against the previous tick and log the
/// deltas. Exits when the server stops running.
async fn monitor_loop(server: Weak<ServerInner>) {
    info!("server ftmc thread starts");
    let Some(s) = server.upgrade() else { return };
    let mut old_net = s.net_matrix.snapshot();
    let mut old_req = s.req_matrix.snapshot();
    let mut old_pool = s.pool_matrix.snapshot();
    drop(s);

    loop {
        let Some(s) = server.upgrade() else { break };
        if !s.running.load(Ordering::Acquire) {
            break;
        }
        let _ = tokio::time::timeout(Duration::from_secs(1), s.event.notified()).await;
        if !s.running.load(Ordering::Acquire) {
            break;
        }
        if !s.ftmc_enabled.load(Ordering::Acquire) {
            continue;
        }

        let net = s.net_matrix.snapshot();
        let req = s.req_matrix.snapshot();
        let pool = s.pool_matrix.snapshot();
        info!("network matrix status: {}", net - old_net);
        info!("req matrix status: {}", req - old_req);
        info!("pool matrix status: {}", pool - old_pool);
        old_net = net;
        old_req = req;
        old_pool = pool;
    }
    info!("server ftmc thread exits");
}

fn ns_since_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
