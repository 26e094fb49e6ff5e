//! Basic command surface: strings, TTLs, multi-key, stats.

use shoal_protocol::Frame;

use crate::helpers::TestServer;

#[tokio::test]
async fn ping_pong() {
    let server = TestServer::start().await;
    let mut c = server.connect().await;

    let resp = c.cmd(&["PING"]).await;
    assert!(matches!(resp, Frame::Simple(ref s) if s == "PONG"));
}

#[tokio::test]
async fn ping_with_message_and_echo() {
    let server = TestServer::start().await;
    let mut c = server.connect().await;

    assert_eq!(c.get_bulk(&["PING", "hello"]).await, Some("hello".into()));
    assert_eq!(c.get_bulk(&["ECHO", "test"]).await, Some("test".into()));
}

#[tokio::test]
async fn set_get_roundtrip() {
    let server = TestServer::start().await;
    let mut c = server.connect().await;

    c.ok(&["SET", "foo", "bar"]).await;
    assert_eq!(c.get_bulk(&["GET", "foo"]).await, Some("bar".into()));
}

#[tokio::test]
async fn get_missing_key_is_null() {
    let server = TestServer::start().await;
    let mut c = server.connect().await;

    let resp = c.cmd(&["GET", "nonexistent"]).await;
    assert!(matches!(resp, Frame::Null));
}

#[tokio::test]
async fn del_and_exists_count_across_shards() {
    let server = TestServer::start().await;
    let mut c = server.connect().await;

    c.ok(&["SET", "a", "1"]).await;
    c.ok(&["SET", "b", "2"]).await;
    assert_eq!(c.get_int(&["EXISTS", "a", "b", "missing"]).await, 2);
    assert_eq!(c.get_int(&["DEL", "a", "b", "missing"]).await, 2);
    assert_eq!(c.get_int(&["EXISTS", "a", "b"]).await, 0);
}

#[tokio::test]
async fn set_with_expiry_and_ttl() {
    let server = TestServer::start().await;
    let mut c = server.connect().await;

    c.ok(&["SET", "ttl", "val", "EX", "10"]).await;
    let ttl = c.get_int(&["TTL", "ttl"]).await;
    assert!(ttl > 0 && ttl <= 10, "ttl was {ttl}");

    c.ok(&["SET", "pttl", "val", "PX", "10000"]).await;
    let pttl = c.get_int(&["PTTL", "pttl"]).await;
    assert!(pttl > 0 && pttl <= 10_000);
}

#[tokio::test]
async fn expire_persist_and_sentinels() {
    let server = TestServer::start().await;
    let mut c = server.connect().await;

    assert_eq!(c.get_int(&["TTL", "missing"]).await, -2);

    c.ok(&["SET", "k", "v"]).await;
    assert_eq!(c.get_int(&["TTL", "k"]).await, -1);

    assert_eq!(c.get_int(&["EXPIRE", "k", "100"]).await, 1);
    assert!(c.get_int(&["TTL", "k"]).await > 0);

    assert_eq!(c.get_int(&["PERSIST", "k"]).await, 1);
    assert_eq!(c.get_int(&["TTL", "k"]).await, -1);
    assert_eq!(c.get_int(&["PERSIST", "k"]).await, 0);

    assert_eq!(c.get_int(&["EXPIRE", "missing", "100"]).await, 0);
}

#[tokio::test]
async fn expired_key_reads_as_gone() {
    let server = TestServer::start().await;
    let mut c = server.connect().await;

    c.ok(&["SET", "brief", "v", "PX", "30"]).await;
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    assert!(matches!(c.cmd(&["GET", "brief"]).await, Frame::Null));
}

#[tokio::test]
async fn select_isolates_logical_dbs() {
    let server = TestServer::start().await;
    let mut c = server.connect().await;

    c.ok(&["SELECT", "1"]).await;
    c.ok(&["SET", "k", "db1"]).await;
    c.ok(&["SELECT", "0"]).await;
    assert!(matches!(c.cmd(&["GET", "k"]).await, Frame::Null));
    c.ok(&["SELECT", "1"]).await;
    assert_eq!(c.get_bulk(&["GET", "k"]).await, Some("db1".into()));

    let err = c.err(&["SELECT", "99"]).await;
    assert!(err.contains("out of range"));
}

#[tokio::test]
async fn dbsize_counts_current_db() {
    let server = TestServer::start().await;
    let mut c = server.connect().await;

    assert_eq!(c.get_int(&["DBSIZE"]).await, 0);
    c.ok(&["SET", "a", "1"]).await;
    c.ok(&["SET", "b", "2"]).await;
    assert_eq!(c.get_int(&["DBSIZE"]).await, 2);

    c.ok(&["SELECT", "3"]).await;
    assert_eq!(c.get_int(&["DBSIZE"]).await, 0);
}

#[tokio::test]
async fn unknown_command_and_bad_arity() {
    let server = TestServer::start().await;
    let mut c = server.connect().await;

    let err = c.err(&["FROBNICATE"]).await;
    assert!(err.contains("unknown command"));

    let err = c.err(&["GET"]).await;
    assert!(err.contains("wrong number of arguments"));
}

#[tokio::test]
async fn inline_command_works() {
    let server = TestServer::start().await;
    let mut c = server.connect().await;

    // bypass the array encoding entirely
    c.send_raw(b"PING\r\n").await;
    let resp = c.read_frame().await;
    assert!(matches!(resp, Frame::Simple(ref s) if s == "PONG"));
}

#[tokio::test]
async fn pipelined_commands_all_answered_in_order() {
    let server = TestServer::start().await;
    let mut c = server.connect().await;

    c.send_raw(b"*3\r\n$3\r\nSET\r\n$1\r\np\r\n$1\r\n1\r\n*2\r\n$3\r\nGET\r\n$1\r\np\r\n")
        .await;
    assert!(matches!(c.read_frame().await, Frame::Simple(ref s) if s == "OK"));
    assert!(matches!(c.read_frame().await, Frame::Bulk(ref b) if &b[..] == b"1"));
}

#[tokio::test]
async fn stats_document_has_requested_sections() {
    let server = TestServer::start().await;
    let mut c = server.connect().await;

    c.ok(&["SET", "k", "v"]).await;
    let doc: serde_json::Value =
        serde_json::from_str(&c.get_bulk(&["STATS"]).await.unwrap()).unwrap();
    assert!(doc["network"]["conn_created"].as_u64().unwrap() >= 1);
    assert!(doc["request"]["processed"].as_u64().unwrap() >= 1);
    assert!(doc["req_pool"]["executed"].as_u64().unwrap() >= 1);

    let doc: serde_json::Value =
        serde_json::from_str(&c.get_bulk(&["STATS", "network"]).await.unwrap()).unwrap();
    assert!(doc.get("network").is_some());
    assert!(doc.get("request").is_none());
}

#[tokio::test]
async fn config_get_set_round_trip() {
    let server = TestServer::start().await;
    let mut c = server.connect().await;

    c.ok(&["CONFIG", "SET", "ftmc", "yes"]).await;
    let resp = c.cmd(&["CONFIG", "GET", "ftmc"]).await;
    match resp {
        Frame::Array(items) => {
            assert!(matches!(&items[1], Frame::Bulk(b) if &b[..] == b"yes"));
        }
        other => panic!("expected array, got {other:?}"),
    }
}
