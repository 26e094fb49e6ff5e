//! Binary format helpers shared by the mutation log and snapshots.
//!
//! Provides TLV-style encoding primitives, CRC32 checksums, and magic
//! byte constants. All multi-byte integers are stored in little-endian,
//! except where an encoding's sort order matters (the TTL index uses
//! big-endian so lexicographic order equals numeric order).

use std::io::{self, Read, Write};

use crc32fast::Hasher;

use crate::error::StorageError;

/// Magic bytes for the mutation log file header.
pub const LOG_MAGIC: &[u8; 4] = b"SLOG";

/// Magic bytes for a serialized snapshot.
pub const SNAP_MAGIC: &[u8; 4] = b"SSNP";

/// Current format version for both log and snapshot.
pub const FORMAT_VERSION: u8 = 1;

/// Computes a CRC32 checksum over a byte slice.
pub fn crc32(data: &[u8]) -> u32 {
    let mut h = Hasher::new();
    h.update(data);
    h.finalize()
}

// ---------------------------------------------------------------------------
// write helpers
// ---------------------------------------------------------------------------

/// Writes a `u8` to the writer.
pub fn write_u8(w: &mut impl Write, val: u8) -> io::Result<()> {
    w.write_all(&[val])
}

/// Writes a `u32` in little-endian.
pub fn write_u32(w: &mut impl Write, val: u32) -> io::Result<()> {
    w.write_all(&val.to_le_bytes())
}

/// Writes a `u64` in little-endian.
pub fn write_u64(w: &mut impl Write, val: u64) -> io::Result<()> {
    w.write_all(&val.to_le_bytes())
}

/// Writes a length-prefixed byte slice: `[len: u32][data]`.
///
/// Returns an error if the data length exceeds `u32::MAX`.
pub fn write_bytes(w: &mut impl Write, data: &[u8]) -> io::Result<()> {
    let len = u32::try_from(data.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("data length {} exceeds u32::MAX", data.len()),
        )
    })?;
    write_u32(w, len)?;
    w.write_all(data)
}

// ---------------------------------------------------------------------------
// read helpers
// ---------------------------------------------------------------------------

/// Reads a `u8` from the reader.
pub fn read_u8(r: &mut impl Read) -> Result<u8, StorageError> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)
        .map_err(|e| eof_as_corrupt(e, "u8"))?;
    Ok(buf[0])
}

/// Reads a little-endian `u32`.
pub fn read_u32(r: &mut impl Read) -> Result<u32, StorageError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|e| eof_as_corrupt(e, "u32"))?;
    Ok(u32::from_le_bytes(buf))
}

/// Reads a little-endian `u64`.
pub fn read_u64(r: &mut impl Read) -> Result<u64, StorageError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)
        .map_err(|e| eof_as_corrupt(e, "u64"))?;
    Ok(u64::from_le_bytes(buf))
}

/// Reads a length-prefixed byte vector.
pub fn read_bytes(r: &mut impl Read) -> Result<Vec<u8>, StorageError> {
    let len = read_u32(r)? as usize;
    let mut data = vec![0u8; len];
    r.read_exact(&mut data)
        .map_err(|e| eof_as_corrupt(e, "length-prefixed bytes"))?;
    Ok(data)
}

fn eof_as_corrupt(e: io::Error, what: &str) -> StorageError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        StorageError::Corrupt(format!("truncated {what}"))
    } else {
        StorageError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_integers() {
        let mut buf = Vec::new();
        write_u8(&mut buf, 7).unwrap();
        write_u32(&mut buf, 0xDEAD_BEEF).unwrap();
        write_u64(&mut buf, u64::MAX - 1).unwrap();

        let mut r = &buf[..];
        assert_eq!(read_u8(&mut r).unwrap(), 7);
        assert_eq!(read_u32(&mut r).unwrap(), 0xDEAD_BEEF);
        assert_eq!(read_u64(&mut r).unwrap(), u64::MAX - 1);
    }

    #[test]
    fn round_trip_bytes() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, b"payload").unwrap();
        let mut r = &buf[..];
        assert_eq!(read_bytes(&mut r).unwrap(), b"payload");
    }

    #[test]
    fn truncated_read_is_corrupt() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, b"payload").unwrap();
        buf.truncate(buf.len() - 2);
        let mut r = &buf[..];
        assert!(matches!(
            read_bytes(&mut r),
            Err(StorageError::Corrupt(_))
        ));
    }

    #[test]
    fn crc_is_stable() {
        assert_eq!(crc32(b"abc"), crc32(b"abc"));
        assert_ne!(crc32(b"abc"), crc32(b"abd"));
    }
}
