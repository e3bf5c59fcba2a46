//! Error types for slabcache operations.
//!
//! The propagation policy splits errors in two: environmental failures
//! ([`BackendError`]) are absorbed and degraded at each operation boundary by
//! the engine, while programmer contract violations and acquire timeouts
//! ([`LockError`]) are always returned to the caller.

use std::time::Duration;
use thiserror::Error;

/// Errors reported by a KV backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("{op} failed for key {key}: {reason}")]
    Operation {
        op: &'static str,
        key: String,
        reason: String,
    },

    #[error("value at {key} is not a {expected}")]
    TypeMismatch { key: String, expected: &'static str },

    #[error("key not found: {key}")]
    KeyMissing { key: String },
}

/// Errors raised by the distributed cache lock.
///
/// All variants except `Timeout` are caller programming errors; `Timeout`
/// is an environmental outcome the caller must handle explicitly.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("lock {key} is already acquired by this instance")]
    AlreadyAcquired { key: String },

    #[error("lock {key} is not acquired")]
    NotAcquired { key: String },

    #[error("lock {key} was released; instances are single-use")]
    AlreadyReleased { key: String },

    #[error("timed out acquiring lock {key} after {waited:?}")]
    Timeout { key: String, waited: Duration },
}

/// Master error type for all slabcache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SlabError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),
}

/// Result type alias for slabcache operations.
pub type SlabResult<T> = Result<T, SlabError>;
