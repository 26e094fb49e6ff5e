//! Client sessions.
//!
//! A session owns its TCP transport in a sum-typed slot: `Owned` while
//! the network loop is reading requests, `Detached` after a
//! replication handshake moves the stream to the replication manager.
//! The read loop only touches the slot between requests, so the
//! handoff is atomic from the wire's point of view: once
//! `process_request` returns `false`, no further read is issued.
//!
//! Commands on one connection are strictly serial — the loop parses a
//! request, waits for the executor to finish it, flushes the response,
//! and only then reads again.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, warn};

use shoal_protocol::{parse_frame, Frame};

use crate::server::ServerInner;

/// Initial read buffer capacity; covers typical commands without
/// over-allocating for PING/GET workloads.
const BUF_CAPACITY: usize = 4096;

/// Read buffer cap. A client streaming an incomplete frame bigger than
/// this gets disconnected instead of holding the memory.
const MAX_BUF_SIZE: usize = 64 * 1024 * 1024;

/// Where the session's transport currently lives.
pub enum TransportSlot {
    Owned(TcpStream),
    Detached,
}

struct SessionState {
    args: Vec<Bytes>,
    response: BytesMut,
    authed: bool,
    db_id: u32,
}

/// One client connection.
pub struct Session {
    id: u64,
    peer: SocketAddr,
    server: Weak<ServerInner>,
    transport: tokio::sync::Mutex<TransportSlot>,
    state: Mutex<SessionState>,
    cancelled: AtomicBool,
    cancel_notify: Notify,
}

impl Session {
    pub fn new(
        id: u64,
        stream: TcpStream,
        peer: SocketAddr,
        server: Weak<ServerInner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            peer,
            server,
            transport: tokio::sync::Mutex::new(TransportSlot::Owned(stream)),
            state: Mutex::new(SessionState {
                args: Vec::new(),
                response: BytesMut::new(),
                authed: false,
                db_id: 0,
            }),
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Arms the read loop for this connection — the first driving
    /// force. Called exactly once, by `add_session`.
    pub fn start(self: &Arc<Self>) {
        let sess = Arc::clone(self);
        tokio::spawn(async move {
            sess.run().await;
        });
    }

    /// Asks the session to stop at its next quiescent point.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.cancel_notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// The current request's argument vector.
    pub fn args(&self) -> Vec<Bytes> {
        self.state.lock().expect("session state").args.clone()
    }

    pub fn is_authed(&self) -> bool {
        self.state.lock().expect("session state").authed
    }

    pub fn set_authed(&self) {
        self.state.lock().expect("session state").authed = true;
    }

    pub fn db_id(&self) -> u32 {
        self.state.lock().expect("session state").db_id
    }

    pub fn set_db_id(&self, db_id: u32) {
        self.state.lock().expect("session state").db_id = db_id;
    }

    /// Serializes a reply frame into the session's response buffer.
    pub fn set_response(&self, frame: &Frame) {
        let mut state = self.state.lock().expect("session state");
        frame.serialize(&mut state.response);
    }

    fn set_args(&self, args: Vec<Bytes>) {
        self.state.lock().expect("session state").args = args;
    }

    fn take_response(&self) -> BytesMut {
        let mut state = self.state.lock().expect("session state");
        std::mem::take(&mut state.response)
    }

    /// Moves the transport out of the session for a replication
    /// handoff. Returns `None` if it was already detached.
    pub async fn detach_transport(&self) -> Option<TcpStream> {
        let mut slot = self.transport.lock().await;
        match std::mem::replace(&mut *slot, TransportSlot::Detached) {
            TransportSlot::Owned(stream) => Some(stream),
            TransportSlot::Detached => None,
        }
    }

    /// The connection read loop.
    ///
    /// Exits when the client disconnects, the session is cancelled,
    /// the transport is detached, or the server stops accepting work.
    /// On exit it reports the session's end to the registry.
    async fn run(self: Arc<Self>) {
        let mut buf = BytesMut::with_capacity(BUF_CAPACITY);

        'conn: loop {
            // drain every complete request already buffered
            loop {
                if self.is_cancelled() {
                    break 'conn;
                }
                let parsed = match parse_frame(&buf) {
                    Ok(Some((frame, consumed))) => {
                        buf.advance(consumed);
                        frame
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.count_invalid_packet();
                        self.try_write(format!("-ERR protocol error: {e}\r\n").into_bytes())
                            .await;
                        break 'conn;
                    }
                };
                // more than one request per read
                if !buf.is_empty() {
                    if let Some(server) = self.server.upgrade() {
                        server
                            .net_matrix()
                            .sticky_packets
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }

                let Some(args) = parsed.into_args() else {
                    self.count_invalid_packet();
                    self.try_write(b"-ERR invalid request\r\n".to_vec()).await;
                    break 'conn;
                };
                self.set_args(args);

                let Some(server) = self.server.upgrade() else {
                    break 'conn;
                };
                let keep = match server.dispatch_request(self.id).await {
                    Ok(keep) => keep,
                    Err(e) => {
                        debug!(conn_id = self.id, "dispatch rejected: {e}");
                        break 'conn;
                    }
                };
                if !keep {
                    break 'conn;
                }

                let response = self.take_response();
                if !response.is_empty() {
                    let started = Instant::now();
                    if !self.try_write(response.to_vec()).await {
                        break 'conn;
                    }
                    server.req_matrix().send_packet_cost.fetch_add(
                        started.elapsed().as_micros() as u64,
                        Ordering::Relaxed,
                    );
                }
            }

            if buf.len() > MAX_BUF_SIZE {
                warn!(conn_id = self.id, "read buffer cap exceeded, closing");
                self.try_write(b"-ERR max buffer size exceeded\r\n".to_vec())
                    .await;
                break 'conn;
            }

            // read more, or leave if the transport moved away
            let mut slot = self.transport.lock().await;
            match &mut *slot {
                TransportSlot::Owned(stream) => {
                    tokio::select! {
                        read = stream.read_buf(&mut buf) => match read {
                            Ok(0) => break 'conn,
                            Ok(_) => {}
                            Err(e) => {
                                debug!(conn_id = self.id, "read error: {e}");
                                break 'conn;
                            }
                        },
                        _ = self.cancel_notify.notified() => break 'conn,
                    }
                }
                TransportSlot::Detached => break 'conn,
            }
        }

        if let Some(server) = self.server.upgrade() {
            server
                .net_matrix()
                .conn_released
                .fetch_add(1, Ordering::Relaxed);
            server.end_session(self.id);
        }
    }

    /// Best-effort write to the owned transport. Returns `false` when
    /// the write failed or the transport is gone.
    async fn try_write(&self, data: Vec<u8>) -> bool {
        let mut slot = self.transport.lock().await;
        match &mut *slot {
            TransportSlot::Owned(stream) => stream.write_all(&data).await.is_ok(),
            TransportSlot::Detached => false,
        }
    }

    fn count_invalid_packet(&self) {
        if let Some(server) = self.server.upgrade() {
            server
                .net_matrix()
                .invalid_packets
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// A privileged server-internal session context.
///
/// Carries only the pieces the command layer reads from a real
/// session: the logical db and an always-authenticated identity. The
/// TTL deleter opens one per expired entry.
pub struct LocalSession {
    db_id: u32,
}

impl LocalSession {
    pub fn new(db_id: u32) -> Self {
        Self { db_id }
    }

    pub fn db_id(&self) -> u32 {
        self.db_id
    }
}
