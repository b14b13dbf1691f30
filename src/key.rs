//! Derives a stable cache key from a normalized URL and a device dimension.

use crate::normalize::NormalizedUrl;

/// A hex-encoded cache key, stable across process restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for (normalized URL, dimension).
    ///
    /// The canonical byte sequence hashed is `dimension "\0" normalized_url`;
    /// the NUL separator can never appear in either operand, so there is no
    /// ambiguity between where the dimension name ends and the URL begins.
    pub fn derive(url: &NormalizedUrl, dimension: &str) -> Self {
        let mut buf = Vec::with_capacity(dimension.len() + 1 + url.as_str().len());
        buf.extend_from_slice(dimension.as_bytes());
        buf.push(0);
        buf.extend_from_slice(url.as_str().as_bytes());

        let digest = blake3::hash(&buf);
        CacheKey(hex::encode(digest.as_bytes()))
    }

    /// Reconstruct a key from its hex digest, as received in a URL path
    /// segment by the admin introspection endpoints. Not validated against
    /// the digest alphabet — an unknown key simply looks up nothing.
    pub fn from_hex(hex: String) -> Self {
        CacheKey(hex)
    }

    /// The hex-encoded digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `meta:<key>` KV-store key for this cache key.
    pub fn meta_key(&self) -> String {
        format!("meta:{}", self.0)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
