//! Shared test support.

use crate::backend::KvBackend;
use async_trait::async_trait;
use slabcache_core::{BackendError, CacheKey, CacheValue};
use std::collections::HashMap;
use std::time::Duration;

/// Route engine logs through the test harness's capture.
///
/// Degraded-path tests call this so the warn/error lines they provoke land
/// in the per-test output instead of vanishing. Idempotent across tests.
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("slabcache_engine=debug")
        .try_init();
}

/// Backend where every operation fails, simulating a full outage.
pub(crate) struct DownBackend;

impl DownBackend {
    fn outage() -> BackendError {
        BackendError::Unavailable {
            reason: "injected outage".to_string(),
        }
    }
}

#[async_trait]
impl KvBackend for DownBackend {
    async fn get(&self, _key: &CacheKey) -> Result<Option<CacheValue>, BackendError> {
        Err(Self::outage())
    }

    async fn get_many(
        &self,
        _keys: &[CacheKey],
    ) -> Result<HashMap<CacheKey, CacheValue>, BackendError> {
        Err(Self::outage())
    }

    async fn set(
        &self,
        _key: &CacheKey,
        _value: CacheValue,
        _ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        Err(Self::outage())
    }

    async fn set_many(
        &self,
        _entries: Vec<(CacheKey, CacheValue)>,
        _ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        Err(Self::outage())
    }

    async fn add(
        &self,
        _key: &CacheKey,
        _value: CacheValue,
        _ttl: Option<Duration>,
    ) -> Result<bool, BackendError> {
        Err(Self::outage())
    }

    async fn incr(&self, _key: &CacheKey) -> Result<u64, BackendError> {
        Err(Self::outage())
    }

    async fn delete(&self, _key: &CacheKey) -> Result<(), BackendError> {
        Err(Self::outage())
    }

    async fn touch(&self, _key: &CacheKey, _ttl: Option<Duration>) -> Result<bool, BackendError> {
        Err(Self::outage())
    }
}
