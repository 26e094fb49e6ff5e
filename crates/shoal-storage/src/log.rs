//! Append-only mutation log.
//!
//! Each store writes its own log file (`store-<id>.log`). Records are
//! appended after successful commits and replayed on open to rebuild
//! the in-memory keyspace and TTL index.
//!
//! File layout:
//! ```text
//! [SLOG magic: 4B][version: 1B]
//! [record]*
//! ```
//!
//! Record layout:
//! ```text
//! [tag: 1B][payload...][crc32: 4B]
//! ```
//! The CRC32 covers the tag + payload bytes. A torn tail (crash during
//! append) is detected by the checksum and dropped at replay.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::warn;

use crate::error::StorageError;
use crate::format::{
    self, read_bytes, read_u32, read_u64, read_u8, write_bytes, write_u32, write_u64, write_u8,
    FORMAT_VERSION, LOG_MAGIC,
};

const TAG_PUT: u8 = 1;
const TAG_DEL: u8 = 2;
const TAG_SET_EXPIRE: u8 = 3;

/// A single mutation record stored in the log.
///
/// `expire_at_ms` is an absolute unix timestamp in milliseconds;
/// zero means no expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Put {
        db_id: u32,
        key: Bytes,
        value: Bytes,
        expire_at_ms: u64,
    },
    Del {
        db_id: u32,
        key: Bytes,
    },
    SetExpire {
        db_id: u32,
        key: Bytes,
        expire_at_ms: u64,
    },
}

impl LogRecord {
    /// Serializes this record into tag + payload bytes (no CRC).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            LogRecord::Put {
                db_id,
                key,
                value,
                expire_at_ms,
            } => {
                write_u8(&mut buf, TAG_PUT).expect("vec write");
                write_u32(&mut buf, *db_id).expect("vec write");
                write_bytes(&mut buf, key).expect("vec write");
                write_bytes(&mut buf, value).expect("vec write");
                write_u64(&mut buf, *expire_at_ms).expect("vec write");
            }
            LogRecord::Del { db_id, key } => {
                write_u8(&mut buf, TAG_DEL).expect("vec write");
                write_u32(&mut buf, *db_id).expect("vec write");
                write_bytes(&mut buf, key).expect("vec write");
            }
            LogRecord::SetExpire {
                db_id,
                key,
                expire_at_ms,
            } => {
                write_u8(&mut buf, TAG_SET_EXPIRE).expect("vec write");
                write_u32(&mut buf, *db_id).expect("vec write");
                write_bytes(&mut buf, key).expect("vec write");
                write_u64(&mut buf, *expire_at_ms).expect("vec write");
            }
        }
        buf
    }

    /// Deserializes a record from tag + payload bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, StorageError> {
        let mut r = data;
        let tag = read_u8(&mut r)?;
        match tag {
            TAG_PUT => {
                let db_id = read_u32(&mut r)?;
                let key = Bytes::from(read_bytes(&mut r)?);
                let value = Bytes::from(read_bytes(&mut r)?);
                let expire_at_ms = read_u64(&mut r)?;
                Ok(LogRecord::Put {
                    db_id,
                    key,
                    value,
                    expire_at_ms,
                })
            }
            TAG_DEL => {
                let db_id = read_u32(&mut r)?;
                let key = Bytes::from(read_bytes(&mut r)?);
                Ok(LogRecord::Del { db_id, key })
            }
            TAG_SET_EXPIRE => {
                let db_id = read_u32(&mut r)?;
                let key = Bytes::from(read_bytes(&mut r)?);
                let expire_at_ms = read_u64(&mut r)?;
                Ok(LogRecord::SetExpire {
                    db_id,
                    key,
                    expire_at_ms,
                })
            }
            other => Err(StorageError::Corrupt(format!("unknown log tag {other}"))),
        }
    }
}

/// Returns the log file path for a store inside `dir`.
pub fn log_path(dir: &Path, db_id: &str) -> PathBuf {
    dir.join(format!("store-{db_id}.log"))
}

/// Appends mutation records to a store's log file.
pub struct LogWriter {
    file: BufWriter<File>,
}

impl LogWriter {
    /// Opens (or creates) a log file for appending.
    ///
    /// Writes the file header if the file is new or empty.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let is_new = file.metadata()?.len() == 0;
        let mut writer = BufWriter::new(file);
        if is_new {
            writer.write_all(LOG_MAGIC)?;
            writer.write_all(&[FORMAT_VERSION])?;
        }
        Ok(Self { file: writer })
    }

    /// Appends one record with its trailing CRC32.
    pub fn append(&mut self, record: &LogRecord) -> Result<(), StorageError> {
        let body = record.to_bytes();
        self.file.write_all(&body)?;
        self.file.write_all(&format::crc32(&body).to_le_bytes())?;
        Ok(())
    }

    /// Flushes buffered records to the OS without forcing an fsync.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        self.file.flush()?;
        Ok(())
    }

    /// Flushes buffered records and fsyncs the file.
    pub fn sync(&mut self) -> Result<(), StorageError> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }
}

/// Replays a log file, returning the records in append order.
///
/// A missing file is an empty history. A corrupt or torn tail ends the
/// replay with a warning — everything before it is still returned, so
/// a crash mid-append loses at most the record being written.
pub fn replay_log(path: &Path) -> Result<Vec<LogRecord>, StorageError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut r = BufReader::new(file);

    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)
        .map_err(|_| StorageError::Corrupt("log header truncated".into()))?;
    if &magic != LOG_MAGIC {
        return Err(StorageError::Corrupt("bad log magic".into()));
    }
    let version = read_u8(&mut r)?;
    if version != FORMAT_VERSION {
        return Err(StorageError::Corrupt(format!(
            "unsupported log version {version}"
        )));
    }

    let mut remaining = Vec::new();
    r.read_to_end(&mut remaining)?;

    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset < remaining.len() {
        match read_record(&remaining[offset..]) {
            Ok((record, consumed)) => {
                records.push(record);
                offset += consumed;
            }
            Err(e) => {
                warn!(path = %path.display(), offset, "dropping torn log tail: {e}");
                break;
            }
        }
    }
    Ok(records)
}

/// Reads one record + CRC from the front of `data`, returning the
/// record and the number of bytes consumed.
fn read_record(data: &[u8]) -> Result<(LogRecord, usize), StorageError> {
    // measure the record body by decoding it, then verify the CRC
    // against exactly those bytes
    let (record, body_len) = decode_body(data)?;
    if data.len() < body_len + 4 {
        return Err(StorageError::Corrupt("truncated record crc".into()));
    }
    let stored = u32::from_le_bytes(
        data[body_len..body_len + 4]
            .try_into()
            .expect("slice is 4 bytes"),
    );
    let actual = format::crc32(&data[..body_len]);
    if stored != actual {
        return Err(StorageError::Corrupt(format!(
            "crc mismatch (stored {stored:#010x}, actual {actual:#010x})"
        )));
    }
    Ok((record, body_len + 4))
}

fn decode_body(data: &[u8]) -> Result<(LogRecord, usize), StorageError> {
    let mut r = data;
    let before = r.len();
    let tag = read_u8(&mut r)?;
    let record = match tag {
        TAG_PUT => {
            let db_id = read_u32(&mut r)?;
            let key = Bytes::from(read_bytes(&mut r)?);
            let value = Bytes::from(read_bytes(&mut r)?);
            let expire_at_ms = read_u64(&mut r)?;
            LogRecord::Put {
                db_id,
                key,
                value,
                expire_at_ms,
            }
        }
        TAG_DEL => {
            let db_id = read_u32(&mut r)?;
            let key = Bytes::from(read_bytes(&mut r)?);
            LogRecord::Del { db_id, key }
        }
        TAG_SET_EXPIRE => {
            let db_id = read_u32(&mut r)?;
            let key = Bytes::from(read_bytes(&mut r)?);
            let expire_at_ms = read_u64(&mut r)?;
            LogRecord::SetExpire {
                db_id,
                key,
                expire_at_ms,
            }
        }
        other => return Err(StorageError::Corrupt(format!("unknown log tag {other}"))),
    };
    Ok((record, before - r.len()))
}
