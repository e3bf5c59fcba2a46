//! slabcache-core - Key, Value, and Error Types
//!
//! Defines the vocabulary shared by every slabcache component: normalized
//! cache keys, the typed value model stored in the external KV backend, and
//! the error taxonomy. The engine (chunked memoization, generation
//! synchronizer, cache lock) lives in slabcache-engine.

pub mod error;
pub mod key;
pub mod value;

pub use error::{BackendError, LockError, SlabError, SlabResult};
pub use key::{CacheKey, KeyNormalizer, KeyScope, StaticScope, MAX_KEY_BYTES};
pub use value::CacheValue;
