//! Single-pass RESP parser.
//!
//! Operates on buffered byte slices. The caller is responsible for
//! reading data from the network into a buffer — this parser is purely
//! synchronous. A `Cursor<&[u8]>` tracks the position through the
//! input without consuming it, so the caller can retry the same bytes
//! once more data arrives.
//!
//! Two request shapes are accepted at the top level:
//!
//! - multibulk: `*<n>\r\n` followed by `n` bulk strings — the normal
//!   client encoding;
//! - inline: a bare line of whitespace-separated words, parsed into the
//!   same `Frame::Array` of bulks.
//!
//! Replies (simple, error, integer, bulk, null) are also parsed so the
//! same function serves test clients reading responses.

use std::io::Cursor;

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::types::Frame;

/// Maximum nesting depth for arrays. Request frames are flat, but a
/// malicious peer could still nest `*1\r\n*1\r\n...`; bound it.
const MAX_NESTING_DEPTH: usize = 16;

/// Maximum number of elements in an array. Prevents memory
/// amplification where a tiny declared header forces a huge Vec.
const MAX_ARRAY_ELEMENTS: usize = 1_048_576;

/// Maximum length of a bulk string in bytes (512 MB, matching Redis).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Maximum length of an inline request line.
const MAX_INLINE_LEN: usize = 64 * 1024;

/// Cap for `Vec::with_capacity` in array parsing. Lets the Vec grow
/// organically instead of trusting the declared element count.
const PREALLOC_CAP: usize = 1024;

/// Parses one complete frame from the front of `buf`.
///
/// Returns `Ok(Some((frame, consumed)))` if a complete frame was
/// parsed, `Ok(None)` if the buffer doesn't contain enough data yet,
/// or `Err(...)` if the data is malformed.
pub fn parse_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut cursor = Cursor::new(buf);
    match try_parse(&mut cursor, 0) {
        Ok(frame) => {
            let consumed = cursor.position() as usize;
            Ok(Some((frame, consumed)))
        }
        Err(ProtocolError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Parses a complete frame from the cursor position, returning
/// `Incomplete` if the buffer doesn't contain enough data.
fn try_parse(cursor: &mut Cursor<&[u8]>, depth: usize) -> Result<Frame, ProtocolError> {
    // skip stray CRLF bytes between inline commands
    let mut prefix = peek_byte(cursor)?;
    while depth == 0 && (prefix == b'\r' || prefix == b'\n') {
        advance(cursor);
        prefix = peek_byte(cursor)?;
    }

    match prefix {
        b'+' | b'-' | b':' | b'$' | b'*' => {
            advance(cursor);
            parse_typed(cursor, prefix, depth)
        }
        _ if depth == 0 => parse_inline(cursor),
        other => Err(ProtocolError::InvalidPrefix(other)),
    }
}

fn parse_typed(
    cursor: &mut Cursor<&[u8]>,
    prefix: u8,
    depth: usize,
) -> Result<Frame, ProtocolError> {
    match prefix {
        b'+' => {
            let line = read_line(cursor)?;
            Ok(Frame::Simple(String::from_utf8_lossy(line).into_owned()))
        }
        b'-' => {
            let line = read_line(cursor)?;
            Ok(Frame::Error(String::from_utf8_lossy(line).into_owned()))
        }
        b':' => {
            let line = read_line(cursor)?;
            Ok(Frame::Integer(parse_int(line)?))
        }
        b'$' => {
            let len = parse_int(read_line(cursor)?)?;
            if len == -1 {
                return Ok(Frame::Null);
            }
            if len < 0 || len > MAX_BULK_LEN {
                return Err(ProtocolError::InvalidFrameLength(len));
            }
            let len = len as usize;
            let start = cursor.position() as usize;
            let data = cursor.get_ref();
            if data.len() < start + len + 2 {
                return Err(ProtocolError::Incomplete);
            }
            if &data[start + len..start + len + 2] != b"\r\n" {
                return Err(ProtocolError::MissingTerminator);
            }
            let bulk = Bytes::copy_from_slice(&data[start..start + len]);
            cursor.set_position((start + len + 2) as u64);
            Ok(Frame::Bulk(bulk))
        }
        b'*' => {
            if depth >= MAX_NESTING_DEPTH {
                return Err(ProtocolError::InvalidPrefix(b'*'));
            }
            let count = parse_int(read_line(cursor)?)?;
            if count == -1 {
                return Ok(Frame::Null);
            }
            if count < 0 || count as usize > MAX_ARRAY_ELEMENTS {
                return Err(ProtocolError::InvalidFrameLength(count));
            }
            let count = count as usize;
            let mut items = Vec::with_capacity(count.min(PREALLOC_CAP));
            for _ in 0..count {
                items.push(try_parse(cursor, depth + 1)?);
            }
            Ok(Frame::Array(items))
        }
        _ => unreachable!("caller matched the prefix"),
    }
}

/// Parses an inline request: one line of whitespace-separated words.
///
/// Produces the same `Array`-of-`Bulk` shape as a multibulk request so
/// the dispatcher never has to care which encoding the client used.
fn parse_inline(cursor: &mut Cursor<&[u8]>) -> Result<Frame, ProtocolError> {
    let start = cursor.position() as usize;
    let data = cursor.get_ref();
    let rest = &data[start..];

    let nl = match rest.iter().position(|&b| b == b'\n') {
        Some(pos) => pos,
        None if rest.len() > MAX_INLINE_LEN => return Err(ProtocolError::InlineTooLong),
        None => return Err(ProtocolError::Incomplete),
    };
    if nl > MAX_INLINE_LEN {
        return Err(ProtocolError::InlineTooLong);
    }

    let line = &rest[..nl];
    let line = line.strip_suffix(b"\r").unwrap_or(line);

    let words: Vec<Frame> = line
        .split(|&b| b == b' ' || b == b'\t')
        .filter(|w| !w.is_empty())
        .map(|w| Frame::Bulk(Bytes::copy_from_slice(w)))
        .collect();

    cursor.set_position((start + nl + 1) as u64);
    Ok(Frame::Array(words))
}

// -- low-level cursor helpers --

fn peek_byte(cursor: &Cursor<&[u8]>) -> Result<u8, ProtocolError> {
    let pos = cursor.position() as usize;
    cursor
        .get_ref()
        .get(pos)
        .copied()
        .ok_or(ProtocolError::Incomplete)
}

fn advance(cursor: &mut Cursor<&[u8]>) {
    cursor.set_position(cursor.position() + 1);
}

/// Reads up to (not including) the next CRLF, advancing past it.
fn read_line<'a>(cursor: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], ProtocolError> {
    let start = cursor.position() as usize;
    let data = *cursor.get_ref();

    let mut i = start;
    while i + 1 < data.len() {
        if data[i] == b'\r' && data[i + 1] == b'\n' {
            cursor.set_position((i + 2) as u64);
            return Ok(&data[start..i]);
        }
        i += 1;
    }
    Err(ProtocolError::Incomplete)
}

fn parse_int(line: &[u8]) -> Result<i64, ProtocolError> {
    let s = std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidInteger)?;
    s.parse().map_err(|_| ProtocolError::InvalidInteger)
}
