//! RESP frame types.
//!
//! The [`Frame`] enum represents a single parsed RESP value. Bulk
//! strings use `Bytes` for reference-counted storage that avoids
//! copies when moving request data between the network loop and the
//! command handlers.

use bytes::Bytes;

/// A single RESP protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Simple string response, e.g. `+OK\r\n`.
    /// Used for short, non-binary status replies.
    Simple(String),

    /// Error response, e.g. `-ERR unknown command\r\n`.
    Error(String),

    /// 64-bit signed integer, e.g. `:42\r\n`.
    Integer(i64),

    /// Bulk (binary-safe) string, e.g. `$5\r\nhello\r\n`.
    Bulk(Bytes),

    /// Ordered array of frames, e.g. `*2\r\n+hello\r\n+world\r\n`.
    Array(Vec<Frame>),

    /// Null value, serialized as the RESP2 null bulk `$-1\r\n`.
    Null,
}

impl Frame {
    /// Returns `true` if this frame is a null value.
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null)
    }

    /// Extracts a request argument vector from the frame.
    ///
    /// A request is an array of bulk strings (inline commands parse to
    /// the same shape). Returns `None` for any other frame, including
    /// an empty array — the dispatcher treats both as invalid packets.
    pub fn into_args(self) -> Option<Vec<Bytes>> {
        let items = match self {
            Frame::Array(items) => items,
            _ => return None,
        };
        if items.is_empty() {
            return None;
        }
        let mut args = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Frame::Bulk(data) => args.push(data),
                _ => return None,
            }
        }
        Some(args)
    }
}
