//! Cache key normalization.
//!
//! Backends in the memcached family reject keys containing control bytes or
//! spaces and silently misbehave past their length limit. [`KeyNormalizer`]
//! produces keys that are safe by construction: every byte in `0x00..=0x20`
//! and `0x7F` is escaped as `\xHH`, and keys longer than [`MAX_KEY_BYTES`]
//! keep their leading characters for debuggability while the overflow tail is
//! replaced by a SHA-256 digest of the full key.
//!
//! Normalization is pure and total: the same raw key and scope state always
//! yield the same [`CacheKey`], and no input can make it fail.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Maximum length of a normalized key in bytes.
///
/// Kept below the memcached protocol limit of 250 so that chunk subkey
/// suffixes (`-{index}`) still fit.
pub const MAX_KEY_BYTES: usize = 240;

/// Hex length of a SHA-256 digest, the tail substituted into overlong keys.
const DIGEST_LEN: usize = 64;

/// Provider of a tenant/site scope prefix for cache keys.
///
/// Implementations typically resolve the current site domain, optionally
/// suffixed with an install root so that several deployments sharing one
/// backend stay isolated. Returning `None` is the silent fallback the
/// normalizer requires: scope resolution has no way to raise.
pub trait KeyScope: Send + Sync {
    /// The scope prefix for the current context, or `None` when it cannot
    /// be resolved.
    fn scope(&self) -> Option<String>;
}

/// A scope provider built from a fixed domain and optional install root.
#[derive(Debug, Clone)]
pub struct StaticScope {
    domain: String,
    install_root: Option<String>,
}

impl StaticScope {
    /// Scope keys by a site domain.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            install_root: None,
        }
    }

    /// Append an install-root suffix to the domain scope.
    pub fn with_install_root(mut self, root: impl Into<String>) -> Self {
        self.install_root = Some(root.into());
        self
    }
}

impl KeyScope for StaticScope {
    fn scope(&self) -> Option<String> {
        match &self.install_root {
            Some(root) => Some(format!("{}{}", self.domain, root)),
            None => Some(self.domain.clone()),
        }
    }
}

/// A normalized cache key.
///
/// Can only be produced by [`KeyNormalizer::normalize`] or derived from an
/// existing key via [`CacheKey::subkey`], so every key reaching a backend
/// satisfies the charset and length invariants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive the chunk subkey `{base}-{index}`.
    pub fn subkey(&self, index: u64) -> CacheKey {
        CacheKey(format!("{}-{}", self.0, index))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Produces canonical, size- and charset-safe cache keys.
#[derive(Clone, Default)]
pub struct KeyNormalizer {
    scope: Option<Arc<dyn KeyScope>>,
}

impl KeyNormalizer {
    /// A normalizer without tenant scoping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a scope provider; its prefix is prepended to every key.
    pub fn with_scope(mut self, scope: Arc<dyn KeyScope>) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Normalize a raw key into a backend-safe [`CacheKey`].
    pub fn normalize(&self, raw: &str) -> CacheKey {
        let scoped = match self.scope.as_ref().and_then(|s| s.scope()) {
            Some(prefix) => format!("{}:{}", prefix, raw),
            None => raw.to_string(),
        };

        let escaped = escape_control_bytes(&scoped);
        if escaped.len() <= MAX_KEY_BYTES {
            return CacheKey(escaped);
        }

        let digest = hex::encode(Sha256::digest(escaped.as_bytes()));
        debug_assert_eq!(digest.len(), DIGEST_LEN);

        // Keep the leading characters of the original key; cut on a char
        // boundary so the prefix stays valid UTF-8.
        let mut cut = MAX_KEY_BYTES - DIGEST_LEN;
        while !escaped.is_char_boundary(cut) {
            cut -= 1;
        }
        CacheKey(format!("{}{}", &escaped[..cut], digest))
    }
}

impl fmt::Debug for KeyNormalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyNormalizer")
            .field("scoped", &self.scope.is_some())
            .finish()
    }
}

/// Escape every byte in `0x00..=0x20` and `0x7F` as `\xHH`.
///
/// The escaped bytes never occur inside a multi-byte UTF-8 sequence, so
/// replacing them byte-wise preserves the validity of the rest of the string.
fn escape_control_bytes(input: &str) -> String {
    let mut out = Vec::with_capacity(input.len());
    for byte in input.bytes() {
        if byte <= 0x20 || byte == 0x7F {
            out.extend_from_slice(format!("\\x{:02x}", byte).as_bytes());
        } else {
            out.push(byte);
        }
    }
    // Only ASCII was substituted; the remainder is untouched UTF-8.
    String::from_utf8_lossy(&out).into_owned()
}
