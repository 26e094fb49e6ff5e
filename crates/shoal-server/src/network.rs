//! The network listener.
//!
//! `prepare` binds the socket without accepting, so replication (which
//! dials *out* from this process) can start against a bound-but-quiet
//! network stack; `run` starts the accept loop as the final startup
//! step. Each accepted connection becomes a [`Session`] registered
//! with the server, which arms its read loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use shoal_core::{Error, NetworkMatrix};

use crate::server::ServerInner;
use crate::session::Session;

pub struct Network {
    net_matrix: Arc<NetworkMatrix>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    next_conn_id: Arc<AtomicU64>,
}

impl Network {
    pub fn new(net_matrix: Arc<NetworkMatrix>) -> Self {
        Self {
            net_matrix,
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
            next_conn_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Binds the listener. No connection is accepted until [`run`].
    ///
    /// [`run`]: Network::run
    pub async fn prepare(&self, bind_ip: &str, port: u16) -> Result<(), Error> {
        let addr = format!("{bind_ip}:{port}");
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Internal(format!("bind {addr} failed: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| Error::Internal(format!("local_addr failed: {e}")))?;
        *self.local_addr.lock().expect("network lock") = Some(local);
        *self.listener.lock().expect("network lock") = Some(listener);
        Ok(())
    }

    /// The bound address; useful when the config asked for port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("network lock")
    }

    /// Starts accepting connections.
    pub fn run(&self, server: Weak<ServerInner>) -> Result<(), Error> {
        let listener = self
            .listener
            .lock()
            .expect("network lock")
            .take()
            .ok_or_else(|| Error::Internal("network not prepared".into()))?;

        let net_matrix = Arc::clone(&self.net_matrix);
        let next_conn_id = Arc::clone(&self.next_conn_id);

        let task = tokio::spawn(async move {
            info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
                  "listener accepting connections");
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let Some(server) = server.upgrade() else { break };
                        net_matrix.conn_created.fetch_add(1, Ordering::Relaxed);
                        let _ = stream.set_nodelay(true);
                        let id = next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
                        let sess =
                            Session::new(id, stream, peer, Arc::downgrade(&server));
                        server.add_session(sess);
                    }
                    Err(e) => {
                        error!("accept error: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        *self.accept_task.lock().expect("network lock") = Some(task);
        Ok(())
    }

    /// Stops accepting: aborts the accept loop, which drops the
    /// listening socket. Established sessions are untouched.
    pub fn stop(&self) {
        if let Some(task) = self.accept_task.lock().expect("network lock").take() {
            task.abort();
        }
        self.listener.lock().expect("network lock").take();
        warn!("listener stopped");
    }
}
