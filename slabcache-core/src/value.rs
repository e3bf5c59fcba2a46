//! Typed value model for the external KV backend.
//!
//! Backends that speak text protocols are prone to coercing raw bytes into
//! strings (and back) behind the caller's back. Storing chunk payloads as a
//! dedicated [`CacheValue::Blob`] variant keeps the byte stream opaque to the
//! backend: a chunk is bytes, a manifest is text, a generation is a counter,
//! and nothing is ever reinterpreted.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A value stored in the cache backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheValue {
    /// Textual value. Manifests (decimal chunk counts) and lock tokens.
    Text(String),
    /// Raw byte payload. Chunk bodies; never subject to text coercion.
    Blob(Vec<u8>),
    /// Integer value supporting atomic increment. Generation counters.
    Counter(u64),
}

impl CacheValue {
    /// The text content, if this is a `Text` value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            CacheValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The byte payload, if this is a `Blob` value.
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            CacheValue::Blob(b) => Some(b),
            _ => None,
        }
    }

    /// The counter value, if this is a `Counter`.
    pub fn as_counter(&self) -> Option<u64> {
        match self {
            CacheValue::Counter(n) => Some(*n),
            _ => None,
        }
    }

    /// Consume the value and return the byte payload, if this is a `Blob`.
    pub fn into_blob(self) -> Option<Vec<u8>> {
        match self {
            CacheValue::Blob(b) => Some(b),
            _ => None,
        }
    }

    /// Size of the stored payload in bytes.
    pub fn payload_len(&self) -> usize {
        match self {
            CacheValue::Text(s) => s.len(),
            CacheValue::Blob(b) => b.len(),
            CacheValue::Counter(_) => std::mem::size_of::<u64>(),
        }
    }
}

impl fmt::Display for CacheValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheValue::Text(s) => write!(f, "text({} bytes)", s.len()),
            CacheValue::Blob(b) => write!(f, "blob({} bytes)", b.len()),
            CacheValue::Counter(n) => write!(f, "counter({})", n),
        }
    }
}

impl From<String> for CacheValue {
    fn from(s: String) -> Self {
        CacheValue::Text(s)
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(b: Vec<u8>) -> Self {
        CacheValue::Blob(b)
    }
}

impl From<u64> for CacheValue {
    fn from(n: u64) -> Self {
        CacheValue::Counter(n)
    }
}
