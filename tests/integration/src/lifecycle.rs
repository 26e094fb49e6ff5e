//! Server lifecycle: shutdown under load, registry behavior while
//! stopping.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use shoal_server::session::Session;

use crate::helpers::TestServer;

#[tokio::test]
async fn stop_under_load_quiesces_everything() {
    let server = TestServer::start().await;

    // a pile of live connections, all registered
    let mut clients = Vec::new();
    for _ in 0..20 {
        let mut c = server.connect().await;
        c.ok(&["SET", "k", "v"]).await;
        clients.push(c);
    }
    server.wait_session_count(20).await;

    // one client asks for shutdown; the handler only records it
    let mut killer = server.connect().await;
    killer.ok(&["SHUTDOWN"]).await;
    assert!(server.server.is_running());

    server.server.wait_stop_complete().await;
    assert!(!server.server.is_running());
    assert!(server.server.is_stopped());
    assert_eq!(server.server.session_count(), 0);
    assert!(!server.server.index_mgr().is_running());

    // the listener is gone
    let port = server.port();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(format!("127.0.0.1:{port}")).await.is_err());
}

#[tokio::test]
async fn shutdown_command_is_idempotent() {
    let server = TestServer::start().await;
    let mut c = server.connect().await;

    c.ok(&["SHUTDOWN"]).await;
    c.ok(&["SHUTDOWN"]).await;

    server.server.wait_stop_complete().await;
    assert!(server.server.is_stopped());
}

#[tokio::test]
async fn sessions_arriving_while_stopping_are_dropped() {
    let server = TestServer::start().await;
    server.server.stop().await;

    // hand-build a session around a loopback pair, as the listener
    // would, and offer it to the stopped registry
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _client = TcpStream::connect(addr).await.unwrap();
    let (stream, peer) = listener.accept().await.unwrap();

    let sess = Session::new(999, stream, peer, Arc::downgrade(server.server.inner()));
    server.server.inner().add_session(sess);
    assert_eq!(server.server.session_count(), 0);
}

#[tokio::test]
async fn cancel_session_stops_the_connection() {
    let server = TestServer::start().await;
    let mut c = server.connect().await;
    c.ok(&["SET", "k", "v"]).await;
    server.wait_session_count(1).await;

    // the first accepted connection gets id 1
    server.server.inner().cancel_session(1).unwrap();
    server.wait_session_count(0).await;
    drop(c);
}

#[tokio::test]
async fn data_survives_restart() {
    let data_dir = tempfile::tempdir().unwrap();
    let path = data_dir.path().to_path_buf();

    {
        let server = {
            let path = path.clone();
            TestServer::start_with(move |cfg| cfg.data_dir = path).await
        };
        let mut c = server.connect().await;
        c.ok(&["SET", "durable", "yes"]).await;
        server.server.stop().await;
    }

    let server = {
        let path = path.clone();
        TestServer::start_with(move |cfg| cfg.data_dir = path).await
    };
    let mut c = server.connect().await;
    assert_eq!(c.get_bulk(&["GET", "durable"]).await, Some("yes".into()));
    server.server.stop().await;
}

#[tokio::test]
async fn destroyed_store_refuses_requests_but_server_serves() {
    let server = TestServer::start_with(|cfg| cfg.kv_store_count = 4).await;
    let mut c = server.connect().await;

    c.ok(&["PAUSESTORE", "2"]).await;
    c.ok(&["DESTROYSTORE", "2"]).await;

    // keys routed to other shards still work; keys on shard 2 error
    let mut hit_destroyed = false;
    let mut hit_live = false;
    for i in 0..64 {
        let key = format!("probe:{i}");
        match c.cmd(&["SET", &key, "v"]).await {
            shoal_protocol::Frame::Simple(_) => hit_live = true,
            shoal_protocol::Frame::Error(msg) => {
                assert!(msg.contains("store not open"), "unexpected error: {msg}");
                hit_destroyed = true;
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }
    assert!(hit_live && hit_destroyed);

    server.server.stop().await;
}
