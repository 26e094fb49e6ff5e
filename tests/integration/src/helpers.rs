//! Test helpers: an in-process server and a minimal RESP client.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use shoal_protocol::{parse_frame, Frame};
use shoal_server::{Server, ServerConfig};

/// An in-process server bound to an ephemeral port, with its data in
/// a temp directory that lives as long as the handle.
pub struct TestServer {
    pub server: Server,
    _data_dir: tempfile::TempDir,
}

impl TestServer {
    /// Starts a two-shard server with test-friendly defaults.
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Starts a server after letting the caller adjust the config.
    pub async fn start_with(adjust: impl FnOnce(&mut ServerConfig)) -> Self {
        let data_dir = tempfile::tempdir().unwrap();
        let mut cfg = ServerConfig {
            bind_ip: "127.0.0.1".into(),
            port: 0,
            kv_store_count: 2,
            data_dir: data_dir.path().to_path_buf(),
            executor_threads: Some(2),
            pause_secs: 1,
            ..Default::default()
        };
        adjust(&mut cfg);
        let server = Server::startup(cfg).await.expect("server startup");
        Self {
            server,
            _data_dir: data_dir,
        }
    }

    pub fn port(&self) -> u16 {
        self.server.local_addr().expect("bound").port()
    }

    pub async fn connect(&self) -> TestClient {
        TestClient::connect(self.port()).await
    }

    /// Polls until the session registry holds `expected` sessions.
    pub async fn wait_session_count(&self, expected: usize) {
        for _ in 0..100 {
            if self.server.session_count() == expected {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!(
            "session count never reached {expected} (now {})",
            self.server.session_count()
        );
    }
}

/// A minimal RESP client for integration testing.
pub struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl TestClient {
    pub async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(format!("127.0.0.1:{port}"))
            .await
            .unwrap_or_else(|e| panic!("failed to connect to 127.0.0.1:{port}: {e}"));
        Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Sends a command without waiting for a reply. Used by the
    /// replication tests, where the reply is not RESP.
    pub async fn send(&mut self, args: &[&str]) {
        let parts: Vec<Frame> = args
            .iter()
            .map(|a| Frame::Bulk(Bytes::copy_from_slice(a.as_bytes())))
            .collect();
        let mut out = BytesMut::new();
        Frame::Array(parts).serialize(&mut out);
        self.stream.write_all(&out).await.unwrap();
    }

    /// Writes raw bytes to the connection.
    pub async fn send_raw(&mut self, data: &[u8]) {
        self.stream.write_all(data).await.unwrap();
    }

    /// Sends a command and returns the parsed response frame.
    pub async fn cmd(&mut self, args: &[&str]) -> Frame {
        self.send(args).await;
        self.read_frame().await
    }

    /// Reads the next response frame.
    pub async fn read_frame(&mut self) -> Frame {
        loop {
            match parse_frame(&self.buf) {
                Ok(Some((frame, consumed))) => {
                    let _ = self.buf.split_to(consumed);
                    return frame;
                }
                Ok(None) => {
                    let n = self.stream.read_buf(&mut self.buf).await.unwrap();
                    if n == 0 {
                        panic!("server closed connection while waiting for response");
                    }
                }
                Err(e) => panic!("protocol error: {e}"),
            }
        }
    }

    /// Reads exactly `n` raw bytes (draining any parse buffer first).
    pub async fn read_raw(&mut self, n: usize) -> Vec<u8> {
        while self.buf.len() < n {
            let read = self.stream.read_buf(&mut self.buf).await.unwrap();
            if read == 0 {
                panic!(
                    "server closed connection after {} of {n} raw bytes",
                    self.buf.len()
                );
            }
        }
        self.buf.split_to(n).to_vec()
    }

    /// Sends a command and extracts the bulk string value.
    pub async fn get_bulk(&mut self, args: &[&str]) -> Option<String> {
        match self.cmd(args).await {
            Frame::Bulk(data) => Some(String::from_utf8_lossy(&data).to_string()),
            Frame::Null => None,
            other => panic!("expected Bulk or Null, got {other:?}"),
        }
    }

    /// Sends a command and extracts the integer value.
    pub async fn get_int(&mut self, args: &[&str]) -> i64 {
        match self.cmd(args).await {
            Frame::Integer(n) => n,
            other => panic!("expected Integer, got {other:?}"),
        }
    }

    /// Sends a command and expects a Simple "OK" response.
    pub async fn ok(&mut self, args: &[&str]) {
        match self.cmd(args).await {
            Frame::Simple(s) if s == "OK" => {}
            other => panic!("expected OK, got {other:?}"),
        }
    }

    /// Sends a command and expects an error. Returns the message.
    pub async fn err(&mut self, args: &[&str]) -> String {
        match self.cmd(args).await {
            Frame::Error(msg) => msg,
            other => panic!("expected Error, got {other:?}"),
        }
    }
}
