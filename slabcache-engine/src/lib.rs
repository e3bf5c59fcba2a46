//! slabcache-engine - Memoization, Invalidation, and Locking
//!
//! The three coordination primitives of the slabcache toolkit, all built on
//! one abstraction: an external atomic KV backend ([`KvBackend`]) in the
//! memcached family. There is no storage engine of its own.
//!
//! # Components
//!
//! - [`ChunkedMemo`]: memoize scalars and lazy sequences, splitting large
//!   serialized payloads into backend-sized chunks with optional streaming
//!   compression across chunk boundaries.
//! - [`GenerationSync`]: cheap cross-process staleness detection via a shared
//!   counter. Best-effort by design; every backend failure degrades to a
//!   no-op.
//! - [`CacheLock`]: advisory mutual exclusion scoped to a cache key, with a
//!   backend TTL as the deadlock safety net.
//!
//! The components are mutually independent; callers compose them. In
//! particular the memoization engine performs no locking of its own - two
//! concurrent writers both recompute and the last complete chunk set wins.
//! Wrap compute-and-store in a [`CacheLock`] when a single computation must
//! be guaranteed:
//!
//! ```ignore
//! let mut lock = CacheLock::new(backend.clone(), "report:2026", LockConfig::default());
//! let report = lock
//!     .with_acquired(|| memo.get_or_compute_chunked("report:2026", false, build_report))
//!     .await?;
//! ```

pub mod backend;
pub mod chunk;
pub mod lock;
pub mod memo;
pub mod memory;
pub mod sync;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::KvBackend;
pub use chunk::{ChunkError, ChunkWriter};
pub use lock::{CacheLock, LockConfig};
pub use memo::{ChunkedMemo, MemoConfig, MemoSequence, MemoStats, MemoStatsSnapshot};
pub use memory::MemoryBackend;
pub use sync::GenerationSync;
pub use wire::{RecordCursor, WireError, DEFAULT_CHUNK_SIZE};

// Re-export core vocabulary so engine users need a single dependency.
pub use slabcache_core::{
    BackendError, CacheKey, CacheValue, KeyNormalizer, KeyScope, LockError, SlabError, SlabResult,
    StaticScope,
};
