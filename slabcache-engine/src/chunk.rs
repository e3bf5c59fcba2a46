//! Chunked storage of large serialized payloads.
//!
//! A payload too large for one backend slot is stored as `N` blob chunks at
//! `{base}-0 .. {base}-{N-1}` plus a manifest at `{base}` holding the decimal
//! chunk count. The manifest is written last: its presence asserts that the
//! full chunk set is in place, and its absence is an ordinary miss. A
//! manifest whose chunks cannot all be fetched is invalid and surfaces as
//! [`ChunkError::MissingChunk`], which callers treat as a full miss - partial
//! reconstruction is never attempted.
//!
//! Chunks carry no framing of their own; the wire header, record lengths, and
//! compressor state all live in the concatenated stream (see [`crate::wire`]).

use crate::backend::KvBackend;
use crate::wire::{self, WireError};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::Serialize;
use slabcache_core::{BackendError, CacheKey, CacheValue};
use std::sync::Arc;
use std::time::Duration;

/// Errors from the chunk read/write paths.
///
/// These never escape the memoization engine; they are caught at its boundary
/// and degraded to a miss (reads) or logged (writes).
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("manifest at {base} is not a decimal chunk count: {raw:?}")]
    BadManifest { base: String, raw: String },

    #[error("chunk {index} of {expected} missing under {base}")]
    MissingChunk {
        base: String,
        index: u64,
        expected: u64,
    },

    #[error("chunk {index} under {base} is not a blob")]
    NotABlob { base: String, index: u64 },

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Rolling sink: plain bytes, or a zlib encoder appending to the same buffer.
enum Sink {
    Plain(Vec<u8>),
    Zlib(ZlibEncoder<Vec<u8>>),
}

impl Sink {
    fn new(compress: bool) -> Self {
        let seed = wire::header(compress).to_vec();
        if compress {
            Sink::Zlib(ZlibEncoder::new(seed, Compression::default()))
        } else {
            Sink::Plain(seed)
        }
    }

    fn buffer_mut(&mut self) -> &mut Vec<u8> {
        match self {
            Sink::Plain(buf) => buf,
            Sink::Zlib(enc) => enc.get_mut(),
        }
    }

    fn write_record<T: Serialize>(&mut self, item: &T) -> Result<(), WireError> {
        match self {
            Sink::Plain(buf) => wire::write_record(buf, item),
            Sink::Zlib(enc) => wire::write_record(enc, item),
        }
    }

    fn finish(self) -> Result<Vec<u8>, WireError> {
        match self {
            Sink::Plain(buf) => Ok(buf),
            Sink::Zlib(enc) => Ok(enc.finish()?),
        }
    }
}

/// Streaming writer of a chunked value.
///
/// Records accumulate in a rolling buffer; every full `chunk_size` slice is
/// flushed in one batched `set_many` under sequential subkeys. [`finish`]
/// flushes the remainder and writes the manifest. Dropping a writer without
/// finishing leaves no manifest, so readers see a miss rather than a torn
/// value.
///
/// [`finish`]: ChunkWriter::finish
pub struct ChunkWriter<B: KvBackend> {
    backend: Arc<B>,
    base: CacheKey,
    chunk_size: usize,
    ttl: Option<Duration>,
    sink: Sink,
    next_index: u64,
}

impl<B: KvBackend> ChunkWriter<B> {
    pub fn new(
        backend: Arc<B>,
        base: CacheKey,
        chunk_size: usize,
        compress: bool,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            backend,
            base,
            chunk_size,
            ttl,
            sink: Sink::new(compress),
            next_index: 0,
        }
    }

    /// Append one record, flushing any chunks the buffer now fully covers.
    pub async fn write<T: Serialize>(&mut self, item: &T) -> Result<(), ChunkError> {
        self.sink.write_record(item)?;
        self.flush_full_chunks().await
    }

    async fn flush_full_chunks(&mut self) -> Result<(), ChunkError> {
        let mut batch = Vec::new();
        {
            let buf = self.sink.buffer_mut();
            while buf.len() >= self.chunk_size {
                let chunk: Vec<u8> = buf.drain(..self.chunk_size).collect();
                batch.push((self.base.subkey(self.next_index), CacheValue::Blob(chunk)));
                self.next_index += 1;
            }
        }
        if !batch.is_empty() {
            self.backend.set_many(batch, self.ttl).await?;
        }
        Ok(())
    }

    /// Flush the remaining partial buffer and write the manifest.
    ///
    /// Returns the chunk count. A stream holding nothing but the header still
    /// produces chunk 0, so every finished value has at least one chunk.
    pub async fn finish(self) -> Result<u64, ChunkError> {
        let Self {
            backend,
            base,
            chunk_size,
            ttl,
            sink,
            mut next_index,
        } = self;

        // The compressor may emit trailing bytes on finish; chunk those too.
        let remainder = sink.finish()?;
        let mut batch = Vec::new();
        for piece in remainder.chunks(chunk_size) {
            batch.push((base.subkey(next_index), CacheValue::Blob(piece.to_vec())));
            next_index += 1;
        }
        if !batch.is_empty() {
            backend.set_many(batch, ttl).await?;
        }

        backend
            .set(&base, CacheValue::Text(next_index.to_string()), ttl)
            .await?;
        Ok(next_index)
    }

    /// Chunks flushed so far (not counting the unflushed remainder).
    pub fn flushed_chunks(&self) -> u64 {
        self.next_index
    }
}

/// Read a chunked value back into its full byte stream.
///
/// `Ok(None)` is a plain miss (no manifest). Every other deviation - a
/// malformed manifest, a missing or mistyped chunk - is an error the caller
/// degrades to a miss.
pub async fn read_stream<B: KvBackend>(
    backend: &B,
    base: &CacheKey,
) -> Result<Option<Vec<u8>>, ChunkError> {
    let manifest = match backend.get(base).await? {
        Some(value) => value,
        None => return Ok(None),
    };

    let raw = manifest.as_text().ok_or_else(|| ChunkError::BadManifest {
        base: base.to_string(),
        raw: manifest.to_string(),
    })?;
    let count: u64 = raw.parse().map_err(|_| ChunkError::BadManifest {
        base: base.to_string(),
        raw: raw.to_string(),
    })?;

    let keys: Vec<CacheKey> = (0..count).map(|i| base.subkey(i)).collect();
    let mut found = backend.get_many(&keys).await?;

    // Concatenate strictly in index order; the stream framing and compressor
    // state span chunk boundaries.
    let mut stream = Vec::new();
    for (index, key) in keys.iter().enumerate() {
        match found.remove(key) {
            Some(CacheValue::Blob(bytes)) => stream.extend_from_slice(&bytes),
            Some(_) => {
                return Err(ChunkError::NotABlob {
                    base: base.to_string(),
                    index: index as u64,
                })
            }
            None => {
                return Err(ChunkError::MissingChunk {
                    base: base.to_string(),
                    index: index as u64,
                    expected: count,
                })
            }
        }
    }
    Ok(Some(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::wire::RecordCursor;
    use slabcache_core::KeyNormalizer;

    fn base_key(raw: &str) -> CacheKey {
        KeyNormalizer::new().normalize(raw)
    }

    async fn chunk_len(backend: &MemoryBackend, base: &CacheKey, index: u64) -> usize {
        backend
            .get(&base.subkey(index))
            .await
            .unwrap()
            .and_then(|v| v.into_blob())
            .map(|b| b.len())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_exact_2500_byte_stream_yields_three_chunks() {
        let backend = Arc::new(MemoryBackend::new());
        let base = base_key("k");

        // Header (4) + length prefix (4) + JSON string (2 quotes + 2490
        // chars) = exactly 2500 serialized bytes.
        let payload = "x".repeat(2490);
        let mut writer = ChunkWriter::new(backend.clone(), base.clone(), 1000, false, None);
        writer.write(&payload).await.unwrap();
        let count = writer.finish().await.unwrap();

        assert_eq!(count, 3);
        assert_eq!(
            backend.get(&base).await.unwrap(),
            Some(CacheValue::Text("3".into()))
        );
        assert_eq!(chunk_len(&backend, &base, 0).await, 1000);
        assert_eq!(chunk_len(&backend, &base, 1).await, 1000);
        assert_eq!(chunk_len(&backend, &base, 2).await, 500);

        let stream = read_stream(backend.as_ref(), &base).await.unwrap().unwrap();
        assert_eq!(stream.len(), 2500);
        let mut cursor = RecordCursor::from_stream(&stream).unwrap();
        let decoded: String = cursor.next_record().unwrap().unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn test_exact_chunk_multiple_has_no_trailing_partial() {
        let backend = Arc::new(MemoryBackend::new());
        let base = base_key("even");

        // Header (4) + prefix (4) + 24-byte JSON = 32 bytes = 2 chunks of 16.
        let payload = "y".repeat(22);
        let mut writer = ChunkWriter::new(backend.clone(), base.clone(), 16, false, None);
        writer.write(&payload).await.unwrap();
        let count = writer.finish().await.unwrap();

        assert_eq!(count, 2);
        assert_eq!(chunk_len(&backend, &base, 0).await, 16);
        assert_eq!(chunk_len(&backend, &base, 1).await, 16);
        assert!(backend.get(&base.subkey(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_stream_still_writes_one_chunk() {
        let backend = Arc::new(MemoryBackend::new());
        let base = base_key("empty");

        let writer: ChunkWriter<MemoryBackend> =
            ChunkWriter::new(backend.clone(), base.clone(), 1000, false, None);
        let count = writer.finish().await.unwrap();

        assert_eq!(count, 1);
        let stream = read_stream(backend.as_ref(), &base).await.unwrap().unwrap();
        let mut cursor = RecordCursor::from_stream(&stream).unwrap();
        assert_eq!(cursor.next_record::<String>().unwrap(), None);
    }

    #[tokio::test]
    async fn test_compressed_stream_spans_chunk_boundaries() {
        let backend = Arc::new(MemoryBackend::new());
        let base = base_key("zipped");

        let mut writer = ChunkWriter::new(backend.clone(), base.clone(), 64, true, None);
        let items: Vec<String> = (0..200).map(|i| format!("row {i} payload")).collect();
        for item in &items {
            writer.write(item).await.unwrap();
        }
        let count = writer.finish().await.unwrap();
        assert!(count > 1, "stream should have spilled into multiple chunks");

        let stream = read_stream(backend.as_ref(), &base).await.unwrap().unwrap();
        let mut cursor = RecordCursor::from_stream(&stream).unwrap();
        for item in &items {
            let decoded: String = cursor.next_record().unwrap().unwrap();
            assert_eq!(&decoded, item);
        }
        assert_eq!(cursor.next_record::<String>().unwrap(), None);
    }

    #[tokio::test]
    async fn test_absent_manifest_is_a_miss() {
        let backend = MemoryBackend::new();
        let result = read_stream(&backend, &base_key("nothing")).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_missing_chunk_is_an_error_not_a_partial_read() {
        let backend = Arc::new(MemoryBackend::new());
        let base = base_key("holey");

        let payload = "z".repeat(2490);
        let mut writer = ChunkWriter::new(backend.clone(), base.clone(), 1000, false, None);
        writer.write(&payload).await.unwrap();
        writer.finish().await.unwrap();

        backend.delete(&base.subkey(1)).await.unwrap();

        let err = read_stream(backend.as_ref(), &base).await.unwrap_err();
        assert!(matches!(
            err,
            ChunkError::MissingChunk {
                index: 1,
                expected: 3,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_bad_manifest_is_an_error() {
        let backend = MemoryBackend::new();
        let base = base_key("mangled");
        backend
            .set(&base, CacheValue::Text("not a number".into()), None)
            .await
            .unwrap();

        let err = read_stream(&backend, &base).await.unwrap_err();
        assert!(matches!(err, ChunkError::BadManifest { .. }));
    }
}
