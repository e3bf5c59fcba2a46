//! Cache-backed memoization of scalars and sequences.
//!
//! [`ChunkedMemo`] computes-or-fetches values under normalized keys. Small
//! scalars are stored whole; large scalars and sequences go through the
//! chunk writer. Every environmental failure is absorbed here: read and
//! decode errors degrade to a miss and recompute, write errors are logged
//! while the freshly computed value is still returned. Only the caller's
//! compute closure can make a memoized call "fail", and it can't - closures
//! are infallible by contract.
//!
//! The engine performs no mutual exclusion. Concurrent callers may both
//! recompute and both write; the last complete chunk set wins and readers
//! never observe a torn mix, because the manifest is written only after its
//! chunks. Callers needing a single-computation guarantee wrap the call in a
//! [`crate::CacheLock`].

use crate::backend::KvBackend;
use crate::chunk::{self, ChunkError, ChunkWriter};
use crate::wire::{self, RecordCursor, DEFAULT_CHUNK_SIZE};
use serde::de::DeserializeOwned;
use serde::Serialize;
use slabcache_core::{CacheKey, CacheValue, KeyNormalizer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Configuration for the memoization engine.
#[derive(Debug, Clone)]
pub struct MemoConfig {
    /// Maximum stored chunk size in bytes.
    pub chunk_size: usize,
    /// Feed the serialized stream through zlib, spanning chunk boundaries.
    pub compress: bool,
    /// TTL applied to chunks, manifests, and small scalar entries.
    pub ttl: Option<Duration>,
}

impl Default for MemoConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            compress: false,
            ttl: None,
        }
    }
}

impl MemoConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Counters for memoization outcomes.
///
/// `decode_failures` surfaces silently-degraded corrupt entries, which would
/// otherwise be indistinguishable from ordinary misses operationally.
#[derive(Debug, Default)]
pub struct MemoStats {
    hits: AtomicU64,
    misses: AtomicU64,
    decode_failures: AtomicU64,
    write_failures: AtomicU64,
}

impl MemoStats {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MemoStatsSnapshot {
        MemoStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`MemoStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoStatsSnapshot {
    /// Reads served from cache.
    pub hits: u64,
    /// Reads that fell through to the compute closure (including degraded
    /// reads).
    pub misses: u64,
    /// Cached entries discarded because their stream would not decode.
    pub decode_failures: u64,
    /// Store attempts that failed; the computed value was still returned.
    pub write_failures: u64,
}

impl MemoStatsSnapshot {
    /// Hit rate in `0.0..=1.0`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Chunked memoization engine over a KV backend.
pub struct ChunkedMemo<B: KvBackend> {
    backend: Arc<B>,
    normalizer: KeyNormalizer,
    config: MemoConfig,
    stats: Arc<MemoStats>,
}

impl<B: KvBackend> ChunkedMemo<B> {
    pub fn new(backend: Arc<B>, config: MemoConfig) -> Self {
        Self {
            backend,
            normalizer: KeyNormalizer::new(),
            config,
            stats: Arc::new(MemoStats::default()),
        }
    }

    pub fn with_defaults(backend: Arc<B>) -> Self {
        Self::new(backend, MemoConfig::default())
    }

    /// Replace the key normalizer (e.g. to attach a tenant scope).
    pub fn with_normalizer(mut self, normalizer: KeyNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn config(&self) -> &MemoConfig {
        &self.config
    }

    pub fn stats(&self) -> MemoStatsSnapshot {
        self.stats.snapshot()
    }

    /// Memoize a small scalar, stored whole and uncompressed under its key.
    ///
    /// `force` skips the read path and always recomputes and rewrites.
    /// A value whose serialized size reaches the chunk boundary is stored
    /// anyway but logged: slab-limited backends may truncate it silently.
    /// Use [`get_or_compute_chunked`] for values of that size.
    ///
    /// [`get_or_compute_chunked`]: ChunkedMemo::get_or_compute_chunked
    pub async fn get_or_compute<T, F>(&self, key: &str, force: bool, compute: F) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        let key = self.normalizer.normalize(key);

        if !force {
            match self.backend.get(&key).await {
                Ok(Some(CacheValue::Blob(stream))) => match wire::decode_single::<T>(&stream) {
                    Ok(value) => {
                        self.stats.record_hit();
                        return value;
                    }
                    Err(e) => {
                        self.stats.record_miss();
                        self.stats.record_decode_failure();
                        warn!(key = %key, error = %e, "cached value undecodable; recomputing");
                    }
                },
                Ok(Some(other)) => {
                    self.stats.record_miss();
                    self.stats.record_decode_failure();
                    warn!(key = %key, found = %other, "cached value has unexpected type; recomputing");
                }
                Ok(None) => self.stats.record_miss(),
                Err(e) => {
                    self.stats.record_miss();
                    warn!(key = %key, error = %e, "cache read failed; recomputing");
                }
            }
        }

        let value = compute();
        match wire::encode_single(&value) {
            Ok(stream) => {
                if stream.len() >= self.config.chunk_size {
                    warn!(
                        key = %key,
                        size = stream.len(),
                        limit = self.config.chunk_size,
                        "memoized value reaches the chunk size; the backend may truncate it silently"
                    );
                }
                if let Err(e) = self
                    .backend
                    .set(&key, CacheValue::Blob(stream), self.config.ttl)
                    .await
                {
                    self.stats.record_write_failure();
                    error!(key = %key, error = %e, "failed to store memoized value");
                }
            }
            Err(e) => {
                self.stats.record_write_failure();
                error!(key = %key, error = %e, "failed to serialize memoized value");
            }
        }
        value
    }

    /// Memoize a scalar through the chunk writer.
    ///
    /// The single-item adapter over the sequence machinery: the value is one
    /// record in a (possibly compressed) chunked stream, so its size is
    /// bounded only by the backend's capacity, not by one slab.
    pub async fn get_or_compute_chunked<T, F>(&self, key: &str, force: bool, compute: F) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        let key = self.normalizer.normalize(key);

        if !force {
            match chunk::read_stream(self.backend.as_ref(), &key).await {
                Ok(Some(stream)) => match wire::decode_single::<T>(&stream) {
                    Ok(value) => {
                        self.stats.record_hit();
                        return value;
                    }
                    Err(e) => {
                        self.stats.record_miss();
                        self.stats.record_decode_failure();
                        warn!(key = %key, error = %e, "cached chunk stream undecodable; recomputing");
                    }
                },
                Ok(None) => self.stats.record_miss(),
                Err(e) => self.note_degraded_read(&key, &e),
            }
        }

        let value = compute();
        let mut writer = ChunkWriter::new(
            self.backend.clone(),
            key.clone(),
            self.config.chunk_size,
            self.config.compress,
            self.config.ttl,
        );
        let stored = match writer.write(&value).await {
            Ok(()) => writer.finish().await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = stored {
            self.stats.record_write_failure();
            error!(key = %key, error = %e, "failed to store chunked value");
        }
        value
    }

    /// Memoize an ordered sequence, exposed lazily.
    ///
    /// Neither the cache nor the factory is touched until the first
    /// [`MemoSequence::next`] call. On a hit, records decode one at a time
    /// from the fetched stream. On a miss, the factory's iterator feeds both
    /// the caller and the chunk writer; the manifest lands when the iterator
    /// is exhausted, so the cache is populated as a side effect of one full
    /// consumption. Abandoning the sequence midway leaves no manifest and
    /// therefore no readable entry - full consumption is the caller's
    /// obligation.
    pub fn sequence<I, F>(&self, key: &str, force: bool, factory: F) -> MemoSequence<B, I, F>
    where
        I: IntoIterator,
        F: FnOnce() -> I,
    {
        MemoSequence {
            backend: self.backend.clone(),
            key: self.normalizer.normalize(key),
            chunk_size: self.config.chunk_size,
            compress: self.config.compress,
            ttl: self.config.ttl,
            force,
            stats: self.stats.clone(),
            state: SeqState::Pending { factory },
        }
    }

    /// Drop a memoized entry by deleting its manifest (or small value).
    ///
    /// Orphaned chunks become unreadable immediately and age out via TTL.
    pub async fn invalidate(&self, key: &str) {
        let key = self.normalizer.normalize(key);
        if let Err(e) = self.backend.delete(&key).await {
            warn!(key = %key, error = %e, "failed to invalidate memoized entry");
        }
    }

    fn note_degraded_read(&self, key: &CacheKey, e: &ChunkError) {
        self.stats.record_miss();
        match e {
            ChunkError::MissingChunk { .. } => {
                warn!(key = %key, error = %e, "chunk set incomplete; treating as full miss");
            }
            ChunkError::Backend(_) => {
                warn!(key = %key, error = %e, "cache read failed; recomputing");
            }
            _ => {
                self.stats.record_decode_failure();
                warn!(key = %key, error = %e, "cached entry corrupt; recomputing");
            }
        }
    }
}

impl<B: KvBackend> Clone for ChunkedMemo<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            normalizer: self.normalizer.clone(),
            config: self.config.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

enum SeqState<B: KvBackend, I: IntoIterator, F: FnOnce() -> I> {
    /// Nothing has happened yet; the first `next()` decides hit or miss.
    Pending { factory: F },
    /// Cache hit: decoding records out of the fetched stream. The factory is
    /// kept so a corrupt tail can still fall back to recomputation.
    Replaying {
        cursor: RecordCursor,
        yielded: usize,
        factory: F,
    },
    /// Cache miss (or fallback): pulling from the factory's iterator while
    /// writing chunks. `writer` is dropped after the first write failure.
    /// `skip_yield` suppresses re-yielding items the caller already received
    /// before a replay failed; they are still written.
    Computing {
        iter: I::IntoIter,
        writer: Option<ChunkWriter<B>>,
        skip_yield: usize,
    },
    Done,
}

/// Lazy memoized sequence. See [`ChunkedMemo::sequence`].
pub struct MemoSequence<B: KvBackend, I: IntoIterator, F: FnOnce() -> I> {
    backend: Arc<B>,
    key: CacheKey,
    chunk_size: usize,
    compress: bool,
    ttl: Option<Duration>,
    force: bool,
    stats: Arc<MemoStats>,
    state: SeqState<B, I, F>,
}

impl<B, I, F> MemoSequence<B, I, F>
where
    B: KvBackend,
    I: IntoIterator,
    F: FnOnce() -> I,
    I::Item: Serialize + DeserializeOwned,
{
    /// Pull the next item, performing cache I/O on first use.
    pub async fn next(&mut self) -> Option<I::Item> {
        loop {
            match std::mem::replace(&mut self.state, SeqState::Done) {
                SeqState::Done => return None,

                SeqState::Pending { factory } => {
                    self.state = self.start(factory).await;
                }

                SeqState::Replaying {
                    mut cursor,
                    yielded,
                    factory,
                } => match cursor.next_record::<I::Item>() {
                    Ok(Some(item)) => {
                        self.state = SeqState::Replaying {
                            cursor,
                            yielded: yielded + 1,
                            factory,
                        };
                        return Some(item);
                    }
                    Ok(None) => return None,
                    Err(e) => {
                        self.stats.record_decode_failure();
                        warn!(
                            key = %self.key,
                            error = %e,
                            yielded,
                            "cached sequence corrupt mid-replay; recomputing"
                        );
                        self.state = self.begin_compute(factory, yielded);
                    }
                },

                SeqState::Computing {
                    mut iter,
                    mut writer,
                    skip_yield,
                } => match iter.next() {
                    Some(item) => {
                        if let Some(w) = writer.as_mut() {
                            if let Err(e) = w.write(&item).await {
                                self.stats.record_write_failure();
                                error!(
                                    key = %self.key,
                                    error = %e,
                                    "sequence chunk write failed; caching aborted for this entry"
                                );
                                writer = None;
                            }
                        }
                        if skip_yield > 0 {
                            self.state = SeqState::Computing {
                                iter,
                                writer,
                                skip_yield: skip_yield - 1,
                            };
                            continue;
                        }
                        self.state = SeqState::Computing {
                            iter,
                            writer,
                            skip_yield,
                        };
                        return Some(item);
                    }
                    None => {
                        if let Some(w) = writer {
                            if let Err(e) = w.finish().await {
                                self.stats.record_write_failure();
                                error!(
                                    key = %self.key,
                                    error = %e,
                                    "failed to finish sequence chunk set"
                                );
                            }
                        }
                        return None;
                    }
                },
            }
        }
    }

    /// Consume the whole sequence into a `Vec`.
    pub async fn collect(mut self) -> Vec<I::Item> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item);
        }
        out
    }

    async fn start(&self, factory: F) -> SeqState<B, I, F> {
        if self.force {
            return self.begin_compute(factory, 0);
        }

        match chunk::read_stream(self.backend.as_ref(), &self.key).await {
            Ok(Some(stream)) => match RecordCursor::from_stream(&stream) {
                Ok(cursor) => {
                    self.stats.record_hit();
                    SeqState::Replaying {
                        cursor,
                        yielded: 0,
                        factory,
                    }
                }
                Err(e) => {
                    self.stats.record_miss();
                    self.stats.record_decode_failure();
                    warn!(key = %self.key, error = %e, "cached sequence stream corrupt; recomputing");
                    self.begin_compute(factory, 0)
                }
            },
            Ok(None) => {
                self.stats.record_miss();
                self.begin_compute(factory, 0)
            }
            Err(e) => {
                self.stats.record_miss();
                match &e {
                    ChunkError::MissingChunk { .. } => {
                        warn!(key = %self.key, error = %e, "chunk set incomplete; treating as full miss");
                    }
                    ChunkError::Backend(_) => {
                        warn!(key = %self.key, error = %e, "cache read failed; recomputing");
                    }
                    _ => {
                        self.stats.record_decode_failure();
                        warn!(key = %self.key, error = %e, "cached sequence corrupt; recomputing");
                    }
                }
                self.begin_compute(factory, 0)
            }
        }
    }

    fn begin_compute(&self, factory: F, skip_yield: usize) -> SeqState<B, I, F> {
        let writer = ChunkWriter::new(
            self.backend.clone(),
            self.key.clone(),
            self.chunk_size,
            self.compress,
            self.ttl,
        );
        SeqState::Computing {
            iter: factory().into_iter(),
            writer: Some(writer),
            skip_yield,
        }
    }
}
