//! In-memory reference backend.
//!
//! Implements [`KvBackend`] over a `tokio::sync::RwLock`-guarded map with
//! lazy TTL expiry. Serves embedded use and the engine's own tests; a real
//! deployment implements the trait over its memcached/Redis client instead.
//!
//! Expiry is measured against `tokio::time::Instant`, so paused-clock tests
//! can advance time deterministically.

use crate::backend::KvBackend;
use async_trait::async_trait;
use slabcache_core::{BackendError, CacheKey, CacheValue};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: CacheValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: CacheValue, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_live(&self) -> bool {
        match self.expires_at {
            Some(deadline) => Instant::now() < deadline,
            None => true,
        }
    }
}

/// In-memory [`KvBackend`] with per-entry TTLs.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<CacheKey, Entry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries. Expired-but-unswept entries are not counted.
    pub async fn len(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.is_live())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheValue>, BackendError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live())
            .map(|e| e.value.clone()))
    }

    async fn get_many(
        &self,
        keys: &[CacheKey],
    ) -> Result<HashMap<CacheKey, CacheValue>, BackendError> {
        let entries = self.entries.read().await;
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = entries.get(key).filter(|e| e.is_live()) {
                found.insert(key.clone(), entry.value.clone());
            }
        }
        Ok(found)
    }

    async fn set(
        &self,
        key: &CacheKey,
        value: CacheValue,
        ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        self.entries
            .write()
            .await
            .insert(key.clone(), Entry::new(value, ttl));
        Ok(())
    }

    async fn set_many(
        &self,
        batch: Vec<(CacheKey, CacheValue)>,
        ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        let mut entries = self.entries.write().await;
        for (key, value) in batch {
            entries.insert(key, Entry::new(value, ttl));
        }
        Ok(())
    }

    async fn add(
        &self,
        key: &CacheKey,
        value: CacheValue,
        ttl: Option<Duration>,
    ) -> Result<bool, BackendError> {
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(existing) if existing.is_live() => Ok(false),
            _ => {
                entries.insert(key.clone(), Entry::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn incr(&self, key: &CacheKey) -> Result<u64, BackendError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(key)
            .filter(|e| e.is_live())
            .ok_or_else(|| BackendError::KeyMissing {
                key: key.to_string(),
            })?;
        match &mut entry.value {
            CacheValue::Counter(n) => {
                *n = n.wrapping_add(1);
                Ok(*n)
            }
            _ => Err(BackendError::TypeMismatch {
                key: key.to_string(),
                expected: "counter",
            }),
        }
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), BackendError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn touch(&self, key: &CacheKey, ttl: Option<Duration>) -> Result<bool, BackendError> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if entry.is_live() => {
                entry.expires_at = ttl.map(|t| Instant::now() + t);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn contains(&self, key: &CacheKey) -> Result<bool, BackendError> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).is_some_and(|e| e.is_live()))
    }
}
