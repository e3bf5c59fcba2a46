//! Wire format for chunked values.
//!
//! A chunked value is one contiguous byte stream sliced into chunks; the
//! framing below belongs to the stream, never to individual chunks. Layout:
//!
//! ```text
//! [0..2)  magic  b"SL"
//! [2]     version (currently 1)
//! [3]     flags   (bit 0: zlib-compressed record stream)
//! [4..]   record stream, compressed as a whole when flagged
//! ```
//!
//! The record stream is a sequence of `u32` little-endian length prefixes,
//! each followed by that many bytes of serde_json. Decoding is sequential
//! until the stream is exhausted, so sequences need no up-front item count.
//!
//! The header stays plaintext even for compressed streams - a reader must be
//! able to learn the flags before decompressing. Compression state spans
//! chunk boundaries, which is why decompression always happens once over the
//! full concatenation and never per chunk.

use flate2::read::ZlibDecoder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use thiserror::Error;

/// Stream magic, `b"SL"`.
pub const MAGIC: [u8; 2] = *b"SL";
/// Current stream version.
pub const VERSION: u8 = 1;
/// Flag bit: record stream is zlib-compressed.
pub const FLAG_ZLIB: u8 = 0b0000_0001;
/// Header length in bytes.
pub const HEADER_LEN: usize = 4;

/// Default chunk size: 1 MiB minus 1 KiB of headroom, staying under the slab
/// limit of typical memcached-family backends.
pub const DEFAULT_CHUNK_SIZE: usize = (1 << 20) - 1024;

/// Errors produced while encoding or decoding the chunk stream.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("stream header missing or malformed")]
    BadHeader,

    #[error("unsupported stream version {0}")]
    UnsupportedVersion(u8),

    #[error("record declares {declared} bytes but only {remaining} remain")]
    TruncatedRecord { declared: usize, remaining: usize },

    #[error("record serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("record deserialization failed: {0}")]
    Deserialize(#[source] serde_json::Error),

    #[error("stream decompression failed: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("stream write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Build a stream header.
pub fn header(compressed: bool) -> [u8; HEADER_LEN] {
    let flags = if compressed { FLAG_ZLIB } else { 0 };
    [MAGIC[0], MAGIC[1], VERSION, flags]
}

/// Serialize one record (length prefix + serde_json payload) into a sink.
pub fn write_record<T: Serialize, W: Write>(sink: &mut W, item: &T) -> Result<(), WireError> {
    let payload = serde_json::to_vec(item).map_err(WireError::Serialize)?;
    let len = payload.len() as u32;
    sink.write_all(&len.to_le_bytes())?;
    sink.write_all(&payload)?;
    Ok(())
}

/// Encode a single value as a complete uncompressed stream.
///
/// Used for small scalar memoization where the value is stored whole under
/// its own key rather than chunked.
pub fn encode_single<T: Serialize>(item: &T) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&header(false));
    write_record(&mut buf, item)?;
    Ok(buf)
}

/// Sequential reader over a reassembled chunk stream.
///
/// Validates the header, decompresses the record stream once when flagged,
/// then yields records one at a time.
#[derive(Debug)]
pub struct RecordCursor {
    records: Vec<u8>,
    pos: usize,
}

impl RecordCursor {
    /// Parse a full stream (the in-order concatenation of all chunks).
    pub fn from_stream(stream: &[u8]) -> Result<Self, WireError> {
        if stream.len() < HEADER_LEN || stream[0..2] != MAGIC {
            return Err(WireError::BadHeader);
        }
        if stream[2] != VERSION {
            return Err(WireError::UnsupportedVersion(stream[2]));
        }

        let body = &stream[HEADER_LEN..];
        let records = if stream[3] & FLAG_ZLIB != 0 {
            let mut plain = Vec::new();
            ZlibDecoder::new(body)
                .read_to_end(&mut plain)
                .map_err(WireError::Decompress)?;
            plain
        } else {
            body.to_vec()
        };

        Ok(Self { records, pos: 0 })
    }

    /// Decode the next record, or `None` when the stream is exhausted.
    pub fn next_record<T: DeserializeOwned>(&mut self) -> Result<Option<T>, WireError> {
        let remaining = self.records.len() - self.pos;
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < 4 {
            return Err(WireError::TruncatedRecord {
                declared: 4,
                remaining,
            });
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&self.records[self.pos..self.pos + 4]);
        let declared = u32::from_le_bytes(len_bytes) as usize;

        let start = self.pos + 4;
        if declared > self.records.len() - start {
            return Err(WireError::TruncatedRecord {
                declared,
                remaining: self.records.len() - start,
            });
        }

        let item = serde_json::from_slice(&self.records[start..start + declared])
            .map_err(WireError::Deserialize)?;
        self.pos = start + declared;
        Ok(Some(item))
    }

    /// Bytes of record data not yet consumed.
    pub fn remaining(&self) -> usize {
        self.records.len() - self.pos
    }
}

/// Decode a stream expected to hold exactly one record.
pub fn decode_single<T: DeserializeOwned>(stream: &[u8]) -> Result<T, WireError> {
    let mut cursor = RecordCursor::from_stream(stream)?;
    match cursor.next_record::<T>()? {
        Some(item) => Ok(item),
        None => Err(WireError::TruncatedRecord {
            declared: 4,
            remaining: 0,
        }),
    }
}
