//! The password gate.

use crate::helpers::TestServer;

#[tokio::test]
async fn commands_require_auth_when_password_is_set() {
    let server =
        TestServer::start_with(|cfg| cfg.requirepass = Some("sesame".into())).await;
    let mut c = server.connect().await;

    let err = c.err(&["SET", "k", "v"]).await;
    assert!(err.starts_with("NOAUTH"));

    // PING is allowed pre-auth
    let resp = c.cmd(&["PING"]).await;
    assert!(matches!(resp, shoal_protocol::Frame::Simple(ref s) if s == "PONG"));

    let err = c.err(&["AUTH", "wrong"]).await;
    assert!(err.contains("invalid password"));

    c.ok(&["AUTH", "sesame"]).await;
    c.ok(&["SET", "k", "v"]).await;
    assert_eq!(c.get_bulk(&["GET", "k"]).await, Some("v".into()));

    server.server.stop().await;
}

#[tokio::test]
async fn auth_without_password_set_is_an_error() {
    let server = TestServer::start().await;
    let mut c = server.connect().await;

    let err = c.err(&["AUTH", "whatever"]).await;
    assert!(err.contains("no password is set"));

    server.server.stop().await;
}

#[tokio::test]
async fn auth_is_per_connection() {
    let server =
        TestServer::start_with(|cfg| cfg.requirepass = Some("sesame".into())).await;

    let mut first = server.connect().await;
    first.ok(&["AUTH", "sesame"]).await;
    first.ok(&["SET", "k", "v"]).await;

    // a fresh connection is still gated
    let mut second = server.connect().await;
    let err = second.err(&["GET", "k"]).await;
    assert!(err.starts_with("NOAUTH"));

    server.server.stop().await;
}

#[tokio::test]
async fn config_set_requirepass_swaps_the_gate() {
    let server = TestServer::start().await;
    let mut c = server.connect().await;

    // no password at first
    c.ok(&["SET", "open", "1"]).await;

    c.ok(&["CONFIG", "SET", "requirepass", "newpass"]).await;

    // this connection never authenticated, so the new gate applies
    let err = c.err(&["SET", "closed", "1"]).await;
    assert!(err.starts_with("NOAUTH"));

    c.ok(&["AUTH", "newpass"]).await;
    c.ok(&["SET", "closed", "1"]).await;

    // clearing the password reopens the server
    c.ok(&["CONFIG", "SET", "requirepass", ""]).await;
    let mut fresh = server.connect().await;
    fresh.ok(&["SET", "reopened", "1"]).await;

    server.server.stop().await;
}
