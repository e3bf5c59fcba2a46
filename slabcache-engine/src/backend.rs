//! KV backend trait.
//!
//! Abstracts over the external atomic key-value store (memcached, Redis, an
//! in-process map) that every slabcache component runs against.
//! Implementations must be thread-safe; operations may block on network I/O.
//!
//! # Atomicity requirements
//!
//! Three operations carry the contract the toolkit depends on:
//!
//! - `add` is atomic create-if-absent; the cache lock's exclusion rests on it.
//! - `incr` is an atomic increment that fails with
//!   [`BackendError::KeyMissing`] when the key is absent; the generation
//!   synchronizer rests on it.
//! - `touch` atomically refreshes a TTL and reports whether the key existed;
//!   the lock's touch-then-delete release sequence rests on it.
//!
//! Everything else is plain get/set plumbing, batched where the chunk engine
//! needs it.

use async_trait::async_trait;
use slabcache_core::{BackendError, CacheKey, CacheValue};
use std::collections::HashMap;
use std::time::Duration;

/// An external atomic KV store.
///
/// `ttl` of `None` means no expiry. Backends without a notion of persistence
/// may substitute their maximum TTL.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Get a value, `None` on miss.
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheValue>, BackendError>;

    /// Batched get. Missing keys are simply absent from the result map.
    async fn get_many(
        &self,
        keys: &[CacheKey],
    ) -> Result<HashMap<CacheKey, CacheValue>, BackendError>;

    /// Unconditionally store a value.
    async fn set(
        &self,
        key: &CacheKey,
        value: CacheValue,
        ttl: Option<Duration>,
    ) -> Result<(), BackendError>;

    /// Batched store. All entries share one TTL.
    async fn set_many(
        &self,
        entries: Vec<(CacheKey, CacheValue)>,
        ttl: Option<Duration>,
    ) -> Result<(), BackendError>;

    /// Atomic create-if-absent. `Ok(false)` when the key already exists.
    async fn add(
        &self,
        key: &CacheKey,
        value: CacheValue,
        ttl: Option<Duration>,
    ) -> Result<bool, BackendError>;

    /// Atomic increment of a counter value, returning the new value.
    ///
    /// Fails with [`BackendError::KeyMissing`] if the key is absent and
    /// [`BackendError::TypeMismatch`] if the stored value is not a counter.
    async fn incr(&self, key: &CacheKey) -> Result<u64, BackendError>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn delete(&self, key: &CacheKey) -> Result<(), BackendError>;

    /// Atomically refresh a key's TTL, reporting whether the key existed.
    async fn touch(&self, key: &CacheKey, ttl: Option<Duration>) -> Result<bool, BackendError>;

    /// Membership check without fetching the value.
    async fn contains(&self, key: &CacheKey) -> Result<bool, BackendError> {
        Ok(self.get(key).await?.is_some())
    }
}
