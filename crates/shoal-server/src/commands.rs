//! Command prechecking and execution.
//!
//! The dispatch path runs [`precheck`] first — argument shape, known
//! name, arity, auth — so replication handshakes can be recognised
//! before normal execution tries to take shard locks. Everything else
//! flows through [`run_session_cmd`], which routes single-key commands
//! to the owning shard via the segment manager.
//!
//! [`expire_key_if_needed`] is the deleter's conditional-delete
//! primitive: it re-checks expiry under a write-intent shard lock,
//! because the user may have reset the TTL or overwritten the key
//! between scan and delete.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use shoal_core::{Error, LockMode};
use shoal_protocol::Frame;
use shoal_storage::{StoreMode, TtlIndexEntry};

use crate::server::ServerInner;
use crate::session::{LocalSession, Session};

/// Reserved handshake command: the replication manager takes the
/// transport and streams a snapshot.
pub const CMD_FULLSYNC: &str = "fullsync";
/// Reserved handshake command: the transport becomes an incremental
/// binlog subscription.
pub const CMD_INCRSYNC: &str = "incrsync";

/// Logical databases addressable with SELECT.
const DB_COUNT: u32 = 16;

/// `(min, max)` argument counts per command, including the name.
fn arity(name: &str) -> Option<(usize, usize)> {
    Some(match name {
        "ping" => (1, 2),
        "echo" => (2, 2),
        "auth" => (2, 2),
        "select" => (2, 2),
        "set" => (3, 5),
        "get" => (2, 2),
        "del" => (2, usize::MAX),
        "exists" => (2, usize::MAX),
        "expire" => (3, 3),
        "pexpire" => (3, 3),
        "persist" => (2, 2),
        "ttl" => (2, 2),
        "pttl" => (2, 2),
        "dbsize" => (1, 1),
        "stats" => (1, usize::MAX),
        "config" => (3, 4),
        "shutdown" => (1, 1),
        "pausestore" => (2, 2),
        "resumestore" => (2, 2),
        "destroystore" => (2, 3),
        CMD_FULLSYNC => (2, 2),
        CMD_INCRSYNC => (4, 4),
        _ => return None,
    })
}

/// Commands allowed before AUTH when a password is required.
fn allowed_before_auth(name: &str) -> bool {
    matches!(name, "auth" | "ping")
}

/// Validates the session's current request and returns the lowercased
/// command name.
pub fn precheck(server: &ServerInner, sess: &Session) -> Result<String, Error> {
    let args = sess.args();
    let first = args
        .first()
        .ok_or_else(|| Error::Parse("empty command".into()))?;
    let name = String::from_utf8_lossy(first).to_ascii_lowercase();

    let (min, max) =
        arity(&name).ok_or_else(|| Error::NotFound(format!("unknown command '{name}'")))?;
    if args.len() < min || args.len() > max {
        return Err(Error::Parse(format!(
            "wrong number of arguments for '{name}' command"
        )));
    }

    if server.requirepass().is_some() && !sess.is_authed() && !allowed_before_auth(&name) {
        return Err(Error::Auth("NOAUTH Authentication required.".into()));
    }

    Ok(name)
}

/// Turns a dispatch error into its wire reply.
pub fn error_frame(e: &Error) -> Frame {
    match e {
        // auth errors carry their own redis-style prefix
        Error::Auth(msg) => Frame::Error(msg.clone()),
        other => Frame::Error(format!("ERR {other}")),
    }
}

/// Executes the session's current request and returns the reply frame.
pub async fn run_session_cmd(
    server: &Arc<ServerInner>,
    sess: &Arc<Session>,
) -> Result<Frame, Error> {
    let args = sess.args();
    let name = String::from_utf8_lossy(&args[0]).to_ascii_lowercase();

    match name.as_str() {
        "ping" => Ok(match args.get(1) {
            Some(msg) => Frame::Bulk(msg.clone()),
            None => Frame::Simple("PONG".into()),
        }),
        "echo" => Ok(Frame::Bulk(args[1].clone())),

        "auth" => cmd_auth(server, sess, &args[1]),
        "select" => cmd_select(sess, &args[1]),

        "set" => cmd_set(server, sess, &args).await,
        "get" => cmd_get(server, sess, &args[1]).await,
        "del" => cmd_del(server, sess, &args[1..]).await,
        "exists" => cmd_exists(server, sess, &args[1..]).await,
        "expire" => cmd_expire(server, sess, &args[1], &args[2], 1000).await,
        "pexpire" => cmd_expire(server, sess, &args[1], &args[2], 1).await,
        "persist" => cmd_persist(server, sess, &args[1]).await,
        "ttl" => cmd_ttl(server, sess, &args[1], 1000).await,
        "pttl" => cmd_ttl(server, sess, &args[1], 1).await,
        "dbsize" => cmd_dbsize(server, sess).await,

        "stats" => cmd_stats(server, &args[1..]),
        "config" => cmd_config(server, &args),
        "shutdown" => {
            server.handle_shutdown_cmd();
            Ok(Frame::Simple("OK".into()))
        }

        "pausestore" => cmd_pause_store(server, &args[1], true).await,
        "resumestore" => cmd_pause_store(server, &args[1], false).await,
        "destroystore" => cmd_destroy_store(server, &args).await,

        // the dispatch path intercepts these before normal execution
        CMD_FULLSYNC | CMD_INCRSYNC => Err(Error::Internal(
            "replication handshake reached the command path".into(),
        )),

        other => Err(Error::NotFound(format!("unknown command '{other}'"))),
    }
}

fn cmd_auth(server: &ServerInner, sess: &Session, pass: &Bytes) -> Result<Frame, Error> {
    let Some(required) = server.requirepass() else {
        return Err(Error::Auth(
            "ERR Client sent AUTH, but no password is set".into(),
        ));
    };
    if required.as_bytes() == &pass[..] {
        sess.set_authed();
        Ok(Frame::Simple("OK".into()))
    } else {
        Err(Error::Auth("ERR invalid password".into()))
    }
}

fn cmd_select(sess: &Session, index: &Bytes) -> Result<Frame, Error> {
    let db_id = parse_u32(index)?;
    if db_id >= DB_COUNT {
        return Err(Error::Parse("DB index is out of range".into()));
    }
    sess.set_db_id(db_id);
    Ok(Frame::Simple("OK".into()))
}

/// Rejects user mutations against a shard that only replication may
/// write to.
fn ensure_writable(db: &shoal_core::DbGuard) -> Result<(), Error> {
    if db.store().mode() == StoreMode::ReplicateOnly {
        return Err(Error::Internal("store is replicate-only".into()));
    }
    Ok(())
}

async fn cmd_set(
    server: &ServerInner,
    sess: &Session,
    args: &[Bytes],
) -> Result<Frame, Error> {
    let key = args[1].clone();
    let value = args[2].clone();
    let expire = match args.len() {
        3 => None,
        5 => {
            let unit = String::from_utf8_lossy(&args[3]).to_ascii_lowercase();
            let count = parse_u64(&args[4])?;
            match unit.as_str() {
                "ex" => Some(Duration::from_secs(count)),
                "px" => Some(Duration::from_millis(count)),
                _ => return Err(Error::Parse("syntax error".into())),
            }
        }
        _ => return Err(Error::Parse("syntax error".into())),
    };

    let db = server
        .segment_mgr()
        .db_for_key(&key, LockMode::IntentExclusive)
        .await?;
    ensure_writable(&db)?;
    let expire_at_ms = expire
        .map(|d| db.store().current_time_ms() + d.as_millis() as u64)
        .unwrap_or(0);
    let mut txn = db.store().transaction()?;
    txn.put(sess.db_id(), key, value, expire_at_ms);
    txn.commit()?;
    Ok(Frame::Simple("OK".into()))
}

async fn cmd_get(server: &ServerInner, sess: &Session, key: &Bytes) -> Result<Frame, Error> {
    let db = server
        .segment_mgr()
        .db_for_key(key, LockMode::IntentShared)
        .await?;
    let txn = db.store().transaction()?;
    Ok(match txn.get(sess.db_id(), key) {
        Some((value, _)) => Frame::Bulk(value),
        None => Frame::Null,
    })
}

async fn cmd_del(
    server: &ServerInner,
    sess: &Session,
    keys: &[Bytes],
) -> Result<Frame, Error> {
    let mut removed = 0i64;
    for key in keys {
        let db = server
            .segment_mgr()
            .db_for_key(key, LockMode::IntentExclusive)
            .await?;
        ensure_writable(&db)?;
        // read-then-delete needs the advisory key lock so a racing
        // reaper or expiry rewrite cannot slip between the statements
        let _key_lock = server
            .pessimistic_mgr()
            .lock_key(db.store_id(), key.clone())
            .await;
        let mut txn = db.store().transaction()?;
        if txn.get(sess.db_id(), key).is_some() {
            txn.del(sess.db_id(), key.clone());
            txn.commit()?;
            removed += 1;
        }
    }
    Ok(Frame::Integer(removed))
}

async fn cmd_exists(
    server: &ServerInner,
    sess: &Session,
    keys: &[Bytes],
) -> Result<Frame, Error> {
    let mut found = 0i64;
    for key in keys {
        let db = server
            .segment_mgr()
            .db_for_key(key, LockMode::IntentShared)
            .await?;
        let txn = db.store().transaction()?;
        if txn.get(sess.db_id(), key).is_some() {
            found += 1;
        }
    }
    Ok(Frame::Integer(found))
}

async fn cmd_expire(
    server: &ServerInner,
    sess: &Session,
    key: &Bytes,
    count: &Bytes,
    unit_ms: u64,
) -> Result<Frame, Error> {
    let count = parse_u64(count)?;
    let db = server
        .segment_mgr()
        .db_for_key(key, LockMode::IntentExclusive)
        .await?;
    ensure_writable(&db)?;
    let _key_lock = server
        .pessimistic_mgr()
        .lock_key(db.store_id(), key.clone())
        .await;
    let mut txn = db.store().transaction()?;
    if txn.get(sess.db_id(), key).is_none() {
        return Ok(Frame::Integer(0));
    }
    let expire_at_ms = db.store().current_time_ms() + count * unit_ms;
    txn.set_expire(sess.db_id(), key.clone(), expire_at_ms);
    txn.commit()?;
    Ok(Frame::Integer(1))
}

async fn cmd_persist(
    server: &ServerInner,
    sess: &Session,
    key: &Bytes,
) -> Result<Frame, Error> {
    let db = server
        .segment_mgr()
        .db_for_key(key, LockMode::IntentExclusive)
        .await?;
    ensure_writable(&db)?;
    let _key_lock = server
        .pessimistic_mgr()
        .lock_key(db.store_id(), key.clone())
        .await;
    let mut txn = db.store().transaction()?;
    match txn.get(sess.db_id(), key) {
        Some((_, expire_at)) if expire_at != 0 => {
            txn.set_expire(sess.db_id(), key.clone(), 0);
            txn.commit()?;
            Ok(Frame::Integer(1))
        }
        _ => Ok(Frame::Integer(0)),
    }
}

async fn cmd_ttl(
    server: &ServerInner,
    sess: &Session,
    key: &Bytes,
    unit_ms: u64,
) -> Result<Frame, Error> {
    let db = server
        .segment_mgr()
        .db_for_key(key, LockMode::IntentShared)
        .await?;
    let txn = db.store().transaction()?;
    Ok(match txn.get(sess.db_id(), key) {
        None => Frame::Integer(-2),
        Some((_, 0)) => Frame::Integer(-1),
        Some((_, expire_at)) => {
            let now = db.store().current_time_ms();
            let remaining_ms = expire_at.saturating_sub(now);
            // round up so a live key never reports zero
            Frame::Integer(remaining_ms.div_ceil(unit_ms) as i64)
        }
    })
}

async fn cmd_dbsize(server: &ServerInner, sess: &Session) -> Result<Frame, Error> {
    let mut total = 0usize;
    for store_id in 0..server.kv_store_count() {
        let db = server
            .segment_mgr()
            .db_allow_closed(store_id, LockMode::IntentShared)
            .await?;
        if db.store().is_open() {
            total += db.store().key_count(Some(sess.db_id()));
        }
    }
    Ok(Frame::Integer(total as i64))
}

fn cmd_stats(server: &ServerInner, sections: &[Bytes]) -> Result<Frame, Error> {
    let requested: HashSet<String> = if sections.is_empty() {
        ["network", "request", "req_pool"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    } else {
        sections
            .iter()
            .map(|s| String::from_utf8_lossy(s).to_ascii_lowercase())
            .collect()
    };
    let doc = server.stats_json(&requested);
    Ok(Frame::Bulk(Bytes::from(doc.to_string())))
}

fn cmd_config(server: &ServerInner, args: &[Bytes]) -> Result<Frame, Error> {
    let op = String::from_utf8_lossy(&args[1]).to_ascii_lowercase();
    let name = String::from_utf8_lossy(&args[2]).to_ascii_lowercase();
    match (op.as_str(), args.len()) {
        ("get", 3) => {
            let value = match name.as_str() {
                "requirepass" => server
                    .requirepass()
                    .map(|p| p.as_str().to_string())
                    .unwrap_or_default(),
                "masterauth" => server
                    .masterauth()
                    .map(|p| p.as_str().to_string())
                    .unwrap_or_default(),
                "ftmc" => if server.ftmc_enabled() { "yes" } else { "no" }.to_string(),
                _ => return Err(Error::NotFound(format!("unknown config '{name}'"))),
            };
            Ok(Frame::Array(vec![
                Frame::Bulk(args[2].clone()),
                Frame::Bulk(Bytes::from(value)),
            ]))
        }
        ("set", 4) => {
            let value = String::from_utf8_lossy(&args[3]).to_string();
            match name.as_str() {
                "requirepass" => {
                    server.set_requirepass((!value.is_empty()).then_some(value));
                }
                "masterauth" => {
                    server.set_masterauth((!value.is_empty()).then_some(value));
                }
                "ftmc" => match value.as_str() {
                    "yes" | "on" => server.toggle_ftmc(true),
                    "no" | "off" => server.toggle_ftmc(false),
                    _ => return Err(Error::Parse("ftmc expects yes or no".into())),
                },
                _ => return Err(Error::NotFound(format!("unknown config '{name}'"))),
            }
            Ok(Frame::Simple("OK".into()))
        }
        _ => Err(Error::Parse("syntax error".into())),
    }
}

async fn cmd_pause_store(
    server: &ServerInner,
    store_id: &Bytes,
    pause: bool,
) -> Result<Frame, Error> {
    let store_id = parse_u32(store_id)?;
    let db = server
        .segment_mgr()
        .db_allow_closed(store_id, LockMode::Exclusive)
        .await?;
    if pause {
        db.store().pause();
    } else {
        db.store().resume();
    }
    Ok(Frame::Simple("OK".into()))
}

async fn cmd_destroy_store(server: &ServerInner, args: &[Bytes]) -> Result<Frame, Error> {
    let store_id = parse_u32(&args[1])?;
    let force = match args.get(2) {
        None => false,
        Some(flag) if flag.eq_ignore_ascii_case(b"force") => true,
        Some(_) => return Err(Error::Parse("syntax error".into())),
    };
    server.destroy_store(store_id, force).await?;
    Ok(Frame::Simple("OK".into()))
}

/// Conditionally deletes an expired key under a write-intent lock.
///
/// Returns `true` if the key was deleted, `false` if it was gone
/// already or no longer expired (TTL reset or value overwritten since
/// the scan picked it up).
pub async fn expire_key_if_needed(
    server: &ServerInner,
    sess: &LocalSession,
    entry: &TtlIndexEntry,
) -> Result<bool, Error> {
    let store_id = server.segment_mgr().store_id_for_key(&entry.primary_key);
    let db = server
        .segment_mgr()
        .db(store_id, LockMode::IntentExclusive)
        .await?;
    // the re-check and the delete must be one isolated unit, or a
    // client writing between them would lose its new value
    let _key_lock = server
        .pessimistic_mgr()
        .lock_key(store_id, entry.primary_key.clone())
        .await;
    let mut txn = db.store().transaction()?;

    match txn.get_raw(sess.db_id(), &entry.primary_key) {
        None => Ok(false),
        Some((_, expire_at)) => {
            if expire_at != 0 && expire_at <= db.store().current_time_ms() {
                txn.del(sess.db_id(), entry.primary_key.clone());
                txn.commit()?;
                Ok(true)
            } else {
                debug!(
                    key = %String::from_utf8_lossy(&entry.primary_key),
                    "expiry re-check skipped deletion"
                );
                Ok(false)
            }
        }
    }
}

fn parse_u32(arg: &Bytes) -> Result<u32, Error> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Parse("value is not an integer or out of range".into()))
}

fn parse_u64(arg: &Bytes) -> Result<u64, Error> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Parse("value is not an integer or out of range".into()))
}
