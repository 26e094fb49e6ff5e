//! Replication handshakes: transport handoff, full-sync snapshot
//! streaming, incremental binlog subscription.

use std::time::Duration;

use shoal_storage::{LogRecord, Store};

use crate::helpers::TestServer;

// wire tags, mirroring the replication manager
const MSG_FULL_SYNC: u8 = 1;
const MSG_RECORD: u8 = 4;
const MSG_RESYNC: u8 = 5;
const MSG_SYNC_OK: u8 = 6;

fn u32_le(b: &[u8]) -> u32 {
    u32::from_le_bytes(b.try_into().unwrap())
}

fn u64_le(b: &[u8]) -> u64 {
    u64::from_le_bytes(b.try_into().unwrap())
}

#[tokio::test]
async fn fullsync_hands_off_the_transport_and_streams_a_snapshot() {
    let server = TestServer::start().await;

    // seed shard 0 through the normal path: keep setting until a key
    // lands on shard 0
    let mut c = server.connect().await;
    let seg = server.server.inner().segment_mgr();
    let mut seeded = None;
    for i in 0..64 {
        let key = format!("seed:{i}");
        if seg.store_id_for_key(key.as_bytes()) == 0 {
            c.ok(&["SET", &key, "snapshot-me"]).await;
            seeded = Some(key);
            break;
        }
    }
    let seeded = seeded.expect("some key should hash to shard 0");

    // the handshake client: sends FULLSYNC and then reads raw bytes
    let mut replica = server.connect().await;
    server.wait_session_count(2).await;
    replica.send(&["FULLSYNC", "0"]).await;

    let header = replica.read_raw(1 + 4 + 8 + 4).await;
    assert_eq!(header[0], MSG_FULL_SYNC);
    assert_eq!(u32_le(&header[1..5]), 0);
    let next_binlog_id = u64_le(&header[5..13]);
    assert!(next_binlog_id >= 2, "one mutation committed on shard 0");
    let snap_len = u32_le(&header[13..17]) as usize;
    let snapshot = replica.read_raw(snap_len).await;

    let entries = Store::decode_snapshot(&snapshot).unwrap();
    assert!(entries
        .iter()
        .any(|(_, key, value, _)| key[..] == *seeded.as_bytes() && value[..] == *b"snapshot-me"));

    // the session registry dropped the handed-off session
    server.wait_session_count(1).await;

    server.server.stop().await;
}

#[tokio::test]
async fn incrsync_replays_tail_then_relays_live_records() {
    let server = TestServer::start_with(|cfg| cfg.kv_store_count = 1).await;
    let mut c = server.connect().await;

    c.ok(&["SET", "before", "1"]).await;

    // subscribe from the very first binlog id
    let mut replica = server.connect().await;
    replica.send(&["INCRSYNC", "0", "0", "1"]).await;

    let ok = replica.read_raw(1).await;
    assert_eq!(ok[0], MSG_SYNC_OK);

    // tail replay: the SET committed before subscribing
    let header = replica.read_raw(1 + 4 + 8 + 8 + 4).await;
    assert_eq!(header[0], MSG_RECORD);
    assert_eq!(u32_le(&header[1..5]), 0, "dst store id echoed");
    assert_eq!(u64_le(&header[5..13]), 1, "first binlog id");
    let len = u32_le(&header[21..25]) as usize;
    let body = replica.read_raw(len).await;
    match LogRecord::from_bytes(&body).unwrap() {
        LogRecord::Put { key, value, .. } => {
            assert_eq!(&key[..], b"before");
            assert_eq!(&value[..], b"1");
        }
        other => panic!("expected Put, got {other:?}"),
    }

    // live relay: a mutation committed after subscribing
    c.ok(&["SET", "after", "2"]).await;
    let header = replica.read_raw(1 + 4 + 8 + 8 + 4).await;
    assert_eq!(header[0], MSG_RECORD);
    assert_eq!(u64_le(&header[5..13]), 2);
    let len = u32_le(&header[21..25]) as usize;
    let body = replica.read_raw(len).await;
    match LogRecord::from_bytes(&body).unwrap() {
        LogRecord::Put { key, .. } => assert_eq!(&key[..], b"after"),
        other => panic!("expected Put, got {other:?}"),
    }

    server.server.stop().await;
}

#[tokio::test]
async fn incrsync_from_evicted_binlog_id_gets_resync() {
    let server = TestServer::start_with(|cfg| cfg.kv_store_count = 1).await;

    // binlog id 0 predates any retained record
    let mut replica = server.connect().await;
    replica.send(&["INCRSYNC", "0", "0", "0"]).await;

    let msg = replica.read_raw(1).await;
    assert_eq!(msg[0], MSG_RESYNC);

    server.server.stop().await;
}

#[tokio::test]
async fn fullsync_with_bad_store_id_keeps_error_on_the_wire() {
    let server = TestServer::start().await;

    let mut replica = server.connect().await;
    replica.send(&["FULLSYNC", "99"]).await;

    // the transport was handed off, so the error arrives as a raw
    // RESP error line from the replication manager
    let reply = replica.read_raw(5).await;
    assert_eq!(&reply[..5], b"-ERR ");

    server.server.stop().await;
}

#[tokio::test]
async fn handshake_with_wrong_arity_is_rejected_before_handoff() {
    let server = TestServer::start().await;
    let mut c = server.connect().await;

    // precheck rejects it, the session keeps its transport, and the
    // connection still serves normal commands afterwards
    let err = c.err(&["FULLSYNC"]).await;
    assert!(err.contains("wrong number of arguments"));
    c.ok(&["SET", "still", "alive"]).await;

    server.server.stop().await;
}

#[tokio::test]
async fn stopped_store_ends_incr_subscription_scheduling() {
    let server = TestServer::start_with(|cfg| cfg.kv_store_count = 1).await;
    let mut c = server.connect().await;
    c.ok(&["SET", "k", "v"]).await;

    let mut replica = server.connect().await;
    replica.send(&["INCRSYNC", "0", "0", "1"]).await;
    assert_eq!(replica.read_raw(1).await[0], MSG_SYNC_OK);
    // drain the tail record
    let header = replica.read_raw(25).await;
    let len = u32_le(&header[21..25]) as usize;
    replica.read_raw(len).await;

    // disabling the store stops the subscriber at its next yield
    server.server.inner().repl_mgr().stop_store(0).unwrap();
    c.ok(&["SET", "k2", "v2"]).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    server.server.stop().await;
}
