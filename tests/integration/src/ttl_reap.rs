//! TTL reaping end to end: scanner fills the queues, deleter drains
//! them, checkpoints advance, live keys survive.

use std::time::Duration;

use shoal_protocol::Frame;

use crate::helpers::TestServer;

/// Runs one scan + delete round over every shard.
async fn reap_once(server: &TestServer) {
    for store_id in 0..server.server.kv_store_count() {
        server
            .server
            .index_mgr()
            .scan_store_once(store_id)
            .await
            .unwrap();
        server.server.index_mgr().del_store_once(store_id).await;
    }
}

#[tokio::test]
async fn expired_key_is_reaped_live_key_survives() {
    let server = TestServer::start().await;
    let mut c = server.connect().await;

    c.ok(&["SET", "k1", "old", "PX", "30"]).await;
    c.ok(&["SET", "k2", "new", "EX", "60"]).await;
    tokio::time::sleep(Duration::from_millis(80)).await;

    reap_once(&server).await;

    // k1 physically deleted, not just hidden
    let store_id = server
        .server
        .inner()
        .segment_mgr()
        .store_id_for_key(b"k1");
    let store = server.server.store(store_id).unwrap();
    let txn = store.transaction().unwrap();
    assert!(txn.get_raw(0, b"k1").is_none(), "k1 should be gone from the store");
    drop(txn);

    assert_eq!(c.get_bulk(&["GET", "k2"]).await, Some("new".into()));

    // the checkpoint for k1's shard advanced past its index entry
    assert!(!server.server.index_mgr().scan_point(store_id).is_empty());

    let (enq, deq) = server.server.index_mgr().totals();
    assert_eq!(enq, 1);
    assert_eq!(deq, 1);

    server.server.stop().await;
}

#[tokio::test]
async fn scanner_on_empty_store_enqueues_nothing() {
    let server = TestServer::start().await;

    reap_once(&server).await;
    let (enq, deq) = server.server.index_mgr().totals();
    assert_eq!((enq, deq), (0, 0));
    for store_id in 0..server.server.kv_store_count() {
        assert_eq!(server.server.index_mgr().expired_queue_len(store_id), 0);
        assert!(server.server.index_mgr().scan_point(store_id).is_empty());
    }

    server.server.stop().await;
}

#[tokio::test]
async fn deleter_with_empty_queue_returns_zero() {
    let server = TestServer::start().await;
    assert_eq!(server.server.index_mgr().del_store_once(0).await, 0);
    server.server.stop().await;
}

#[tokio::test]
async fn ttl_reset_between_scan_and_delete_spares_the_key() {
    let server = TestServer::start().await;
    let mut c = server.connect().await;

    c.ok(&["SET", "racy", "v", "PX", "30"]).await;
    tokio::time::sleep(Duration::from_millis(80)).await;

    // scan picks the expired entry up
    for store_id in 0..server.server.kv_store_count() {
        server
            .server
            .index_mgr()
            .scan_store_once(store_id)
            .await
            .unwrap();
    }
    let (enq, _) = server.server.index_mgr().totals();
    assert_eq!(enq, 1);

    // the user overwrites the key before the deleter runs
    c.ok(&["SET", "racy", "reborn", "EX", "60"]).await;

    for store_id in 0..server.server.kv_store_count() {
        server.server.index_mgr().del_store_once(store_id).await;
    }

    // re-check under the write lock spared the new value
    assert_eq!(c.get_bulk(&["GET", "racy"]).await, Some("reborn".into()));

    server.server.stop().await;
}

#[tokio::test]
async fn background_loop_reaps_on_its_own() {
    // pause_secs = 1: the tick loop should reap without manual driving
    let server = TestServer::start_with(|cfg| cfg.pause_secs = 1).await;
    let mut c = server.connect().await;

    c.ok(&["SET", "doomed", "v", "PX", "30"]).await;

    let mut reaped = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let store_id = server
            .server
            .inner()
            .segment_mgr()
            .store_id_for_key(b"doomed");
        let store = server.server.store(store_id).unwrap();
        let txn = store.transaction().unwrap();
        if txn.get_raw(0, b"doomed").is_none() {
            reaped = true;
            break;
        }
    }
    assert!(reaped, "background index manager never reaped the key");

    server.server.stop().await;
}

#[tokio::test]
async fn scan_resumes_from_checkpoint_without_requeueing() {
    // scan_batch = 1 forces one entry per scan pass
    let server = TestServer::start_with(|cfg| {
        cfg.kv_store_count = 1;
        cfg.chunk_size = 16384;
        cfg.scan_batch = 1;
    })
    .await;
    let mut c = server.connect().await;

    c.ok(&["SET", "a", "1", "PX", "20"]).await;
    c.ok(&["SET", "b", "2", "PX", "40"]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    server.server.index_mgr().scan_store_once(0).await.unwrap();
    assert_eq!(server.server.index_mgr().expired_queue_len(0), 1);

    // second pass resumes past the checkpoint and takes the other key
    server.server.index_mgr().scan_store_once(0).await.unwrap();
    assert_eq!(server.server.index_mgr().expired_queue_len(0), 2);

    // a third pass finds nothing new
    server.server.index_mgr().scan_store_once(0).await.unwrap();
    let (enq, _) = server.server.index_mgr().totals();
    assert_eq!(enq, 2);

    assert_eq!(server.server.index_mgr().del_store_once(0).await, 2);
    assert!(matches!(c.cmd(&["GET", "a"]).await, Frame::Null));
    assert!(matches!(c.cmd(&["GET", "b"]).await, Frame::Null));

    server.server.stop().await;
}
