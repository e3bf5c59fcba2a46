//! Generation-counter staleness tracking.
//!
//! A [`GenerationSync`] pairs a shared counter in the backend with a local
//! copy of the generation it last observed. Any process that mutates the
//! underlying data bumps the shared counter via [`mark_updated`]; every other
//! process sees [`is_expired`] flip to true and refreshes whatever local
//! state the counter guards. Versions only ever grow, so a reader can never
//! mistake an older generation for a newer one.
//!
//! Backend failures degrade: an unreachable counter reads as "not expired",
//! trading staleness for availability.
//!
//! [`mark_updated`]: GenerationSync::mark_updated
//! [`is_expired`]: GenerationSync::is_expired

use crate::backend::KvBackend;
use chrono::Utc;
use slabcache_core::{BackendError, CacheKey, CacheValue, KeyNormalizer};
use std::sync::Arc;
use tracing::warn;

/// Tracks a shared generation counter against a locally observed value.
pub struct GenerationSync<B: KvBackend> {
    backend: Arc<B>,
    key: CacheKey,
    /// Generation this instance last observed; `None` when the backend was
    /// unreachable at construction.
    local: Option<u64>,
}

impl<B: KvBackend> GenerationSync<B> {
    /// Create a tracker for `key`, seeding the shared counter if absent.
    ///
    /// The seed is the current unix timestamp rather than zero, so a counter
    /// that is evicted and re-seeded still compares as a new generation to
    /// holders of the old one.
    pub async fn new(backend: Arc<B>, key: &str) -> Self {
        let key = KeyNormalizer::new().normalize(key);
        let local = Self::seed(backend.as_ref(), &key).await;
        Self {
            backend,
            key,
            local,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Generation this instance last observed, if any.
    pub fn local_generation(&self) -> Option<u64> {
        self.local
    }

    /// Whether the shared counter has moved past the locally observed value.
    ///
    /// A vanished counter counts as expired when we had observed one (the
    /// marker was evicted, so the guarded state is unverifiable). Backend
    /// errors read as fresh.
    pub async fn is_expired(&self) -> bool {
        match self.backend.get(&self.key).await {
            Ok(Some(value)) => match value.as_counter() {
                Some(current) => self.local != Some(current),
                None => {
                    warn!(key = %self.key, found = %value, "generation marker has unexpected type");
                    false
                }
            },
            Ok(None) => self.local.is_some(),
            Err(e) => {
                warn!(key = %self.key, error = %e, "generation check failed; assuming fresh");
                false
            }
        }
    }

    /// Bump the shared counter and adopt the new generation locally.
    ///
    /// Call after mutating the guarded data; other trackers then report
    /// expired until they refresh.
    pub async fn mark_updated(&mut self) {
        match self.backend.incr(&self.key).await {
            Ok(current) => self.local = Some(current),
            Err(BackendError::KeyMissing { .. }) => {
                // Marker evicted; re-seed. The timestamp seed is itself a new
                // generation from every other tracker's point of view.
                self.local = Self::seed(self.backend.as_ref(), &self.key).await;
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "failed to bump generation");
            }
        }
    }

    /// Adopt the current shared generation without bumping it.
    pub async fn refresh(&mut self) {
        match self.backend.get(&self.key).await {
            Ok(Some(value)) => match value.as_counter() {
                Some(current) => self.local = Some(current),
                None => {
                    warn!(key = %self.key, found = %value, "generation marker has unexpected type");
                }
            },
            Ok(None) => {
                self.local = Self::seed(self.backend.as_ref(), &self.key).await;
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "failed to refresh generation");
            }
        }
    }

    /// Delete the shared counter. Other trackers holding a generation then
    /// read as expired until someone re-seeds.
    pub async fn clear(&mut self) {
        if let Err(e) = self.backend.delete(&self.key).await {
            warn!(key = %self.key, error = %e, "failed to clear generation marker");
        }
        self.local = None;
    }

    async fn seed(backend: &B, key: &CacheKey) -> Option<u64> {
        let initial = Utc::now().timestamp() as u64;
        match backend
            .add(key, CacheValue::Counter(initial), None)
            .await
        {
            Ok(true) => Some(initial),
            // Lost the race; adopt whatever the winner seeded.
            Ok(false) => match backend.get(key).await {
                Ok(Some(value)) => value.as_counter(),
                Ok(None) => None,
                Err(e) => {
                    warn!(key = %key, error = %e, "failed to read seeded generation");
                    None
                }
            },
            Err(e) => {
                warn!(key = %key, error = %e, "failed to seed generation marker");
                None
            }
        }
    }
}
