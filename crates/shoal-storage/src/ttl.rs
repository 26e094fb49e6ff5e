//! TTL index entries and their sortable encoding.
//!
//! Every key with an expiry gets one index entry. The encoding puts a
//! big-endian `expire_at_ms` first, so the lexicographic order of the
//! encoded entries equals expiry order. Two things depend on that:
//!
//! - a cursor bounded by "now" yields exactly the already-expired
//!   entries, oldest first;
//! - the scanner's per-shard resume point stays correct across ticks,
//!   because an index entry inserted for a *later* expiry always sorts
//!   after the checkpoint.

use bytes::Bytes;

use crate::error::StorageError;
use crate::format::{read_bytes, read_u8, write_bytes, write_u8};

/// The type of value a TTL index entry points at.
///
/// Only string values exist today; the tag is in the encoding so new
/// types extend the index without a format break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
}

impl ValueType {
    pub fn as_u8(self) -> u8 {
        match self {
            ValueType::String => 1,
        }
    }

    pub fn from_u8(tag: u8) -> Result<Self, StorageError> {
        match tag {
            1 => Ok(ValueType::String),
            other => Err(StorageError::Corrupt(format!(
                "unknown value type tag {other}"
            ))),
        }
    }
}

/// One TTL index entry: `(expire_at, db_id, type, primary_key)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlIndexEntry {
    pub expire_at_ms: u64,
    pub db_id: u32,
    pub value_type: ValueType,
    pub primary_key: Bytes,
}

impl TtlIndexEntry {
    pub fn new(expire_at_ms: u64, db_id: u32, value_type: ValueType, primary_key: Bytes) -> Self {
        Self {
            expire_at_ms,
            db_id,
            value_type,
            primary_key,
        }
    }

    /// Encodes the entry so that byte order equals
    /// `(expire_at, db_id, type, key)` order.
    ///
    /// `expire_at_ms` and `db_id` are big-endian for exactly that
    /// reason; the key is length-prefixed last, where its encoding no
    /// longer affects relative ordering of different expiry times.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 4 + 1 + 4 + self.primary_key.len());
        buf.extend_from_slice(&self.expire_at_ms.to_be_bytes());
        buf.extend_from_slice(&self.db_id.to_be_bytes());
        write_u8(&mut buf, self.value_type.as_u8()).expect("vec write");
        write_bytes(&mut buf, &self.primary_key).expect("vec write");
        buf
    }

    /// Decodes an entry produced by [`encode`](Self::encode).
    pub fn decode(data: &[u8]) -> Result<Self, StorageError> {
        if data.len() < 13 {
            return Err(StorageError::Corrupt("ttl index entry too short".into()));
        }
        let expire_at_ms = u64::from_be_bytes(data[..8].try_into().expect("8 bytes"));
        let db_id = u32::from_be_bytes(data[8..12].try_into().expect("4 bytes"));
        let mut r = &data[12..];
        let value_type = ValueType::from_u8(read_u8(&mut r)?)?;
        let primary_key = Bytes::from(read_bytes(&mut r)?);
        Ok(Self {
            expire_at_ms,
            db_id,
            value_type,
            primary_key,
        })
    }
}
