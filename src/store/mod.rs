//! The cache store: a metadata keyspace (`meta:<key>`) over an ordered,
//! per-key-TTL KV backend, paired with a content-addressed blob store for
//! bodies.
//!
//! [`CacheStore`] is generic over [`KvBackend`] so the same fresh/stale
//! lifecycle logic runs against a real Redis connection in production
//! ([`redis::RedisKv`]) and an in-memory fake in tests
//! ([`memory::MemoryKv`]).

pub mod blob;
pub mod memory;
pub mod redis;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::key::CacheKey;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use blob::BlobStore;

/// A cache metadata record, as written on a successful render and replayed
/// on every subsequent hit/stale response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub source: String,
    pub status_code: u16,
    pub created_at: i64,
    pub expires_at: i64,
    pub headers: HashMap<String, String>,
    pub location: Option<String>,
}

impl Metadata {
    /// Build a fresh metadata record for a render produced at `created_at`.
    pub fn new(
        status_code: u16,
        created_at: i64,
        cache_ttl: Duration,
        headers: HashMap<String, String>,
        location: Option<String>,
    ) -> Self {
        Metadata {
            source: "render".to_string(),
            status_code,
            created_at,
            expires_at: created_at + cache_ttl.as_secs() as i64,
            headers,
            location,
        }
    }

    fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("source".to_string(), self.source.clone()),
            ("status_code".to_string(), self.status_code.to_string()),
            ("created_at".to_string(), self.created_at.to_string()),
            ("expires_at".to_string(), self.expires_at.to_string()),
            ("headers".to_string(), encode_headers(&self.headers)),
        ];
        if let Some(loc) = &self.location {
            fields.push(("location".to_string(), loc.clone()));
        }
        fields
    }

    fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let get = |k: &str| {
            fields.get(k).cloned().ok_or_else(|| {
                Error::StoreUnavailable(format!("metadata missing field \"{k}\""))
            })
        };
        Ok(Metadata {
            source: get("source")?,
            status_code: get("status_code")?
                .parse()
                .map_err(|_| Error::StoreUnavailable("bad status_code".to_string()))?,
            created_at: get("created_at")?
                .parse()
                .map_err(|_| Error::StoreUnavailable("bad created_at".to_string()))?,
            expires_at: get("expires_at")?
                .parse()
                .map_err(|_| Error::StoreUnavailable("bad expires_at".to_string()))?,
            headers: decode_headers(fields.get("headers").map(|s| s.as_str()).unwrap_or("")),
            location: fields.get("location").cloned(),
        })
    }
}

fn encode_headers(headers: &HashMap<String, String>) -> String {
    headers
        .iter()
        .map(|(k, v)| format!("{}\x01{}", k, v))
        .collect::<Vec<_>>()
        .join("\x02")
}

fn decode_headers(raw: &str) -> HashMap<String, String> {
    if raw.is_empty() {
        return HashMap::new();
    }
    raw.split('\x02')
        .filter_map(|pair| pair.split_once('\x01'))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// The three-way result of a cache lookup.
pub enum Lookup {
    None,
    Fresh(Metadata, Vec<u8>),
    Stale(Metadata, Vec<u8>),
}

/// An ordered, per-key-TTL KV store. Treated as opaque per §6 — any backend
/// supporting field-addressable hash records and a key TTL can implement
/// this.
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    /// Write every field of a hash record, then set the key's TTL.
    async fn hset_all(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        ttl: Duration,
    ) -> Result<()>;

    /// Read every field of a hash record. `None` if the key does not exist.
    async fn hgetall(&self, key: &str) -> Result<Option<HashMap<String, String>>>;

    /// Shorten or lengthen a key's TTL without touching its value.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Delete a key outright.
    async fn del(&self, key: &str) -> Result<()>;

    /// Whether the key currently exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remaining TTL on a key, if it has one.
    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>>;
}

/// The cache store: metadata in a [`KvBackend`], bodies in a [`BlobStore`].
pub struct CacheStore<K: KvBackend> {
    kv: Arc<K>,
    blob: BlobStore,
    clock: Arc<dyn Clock>,
}

// Manual impl: `Arc<K>` is `Clone` regardless of whether `K` is, so a
// derived impl would wrongly require `K: Clone`.
impl<K: KvBackend> Clone for CacheStore<K> {
    fn clone(&self) -> Self {
        CacheStore {
            kv: self.kv.clone(),
            blob: self.blob.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<K: KvBackend> CacheStore<K> {
    pub fn new(kv: K, blob: BlobStore, clock: Arc<dyn Clock>) -> Self {
        CacheStore { kv: Arc::new(kv), blob, clock }
    }

    /// Look up a key, classifying the result as fresh, stale, or absent by
    /// comparing `now` against the metadata's `expires_at` (and, for a
    /// stale candidate, `expires_at + stale_ttl`).
    ///
    /// A blob-missing-with-meta-present condition is treated as `None`, and
    /// the orphaned metadata is best-effort deleted — it can never be
    /// served correctly, and leaving it around would only cause the same
    /// confusion on the next lookup.
    pub async fn lookup(&self, key: &CacheKey, stale_ttl: Duration) -> Result<Lookup> {
        let meta_key = key.meta_key();
        let fields = match self.kv.hgetall(&meta_key).await {
            Ok(f) => f,
            Err(e) => return Err(Error::StoreUnavailable(e.to_string())),
        };
        let Some(fields) = fields else {
            return Ok(Lookup::None);
        };
        let meta = Metadata::from_fields(&fields)?;

        let body = match self.blob.get(key.as_str()).await {
            Ok(Some(b)) => b,
            Ok(None) => {
                let _ = self.kv.del(&meta_key).await;
                return Ok(Lookup::None);
            }
            Err(_) => {
                let _ = self.kv.del(&meta_key).await;
                return Ok(Lookup::None);
            }
        };

        let now = self.clock.now();
        if now < meta.expires_at {
            Ok(Lookup::Fresh(meta, body))
        } else if stale_ttl.is_zero() {
            Ok(Lookup::None)
        } else if now < meta.expires_at + stale_ttl.as_secs() as i64 {
            Ok(Lookup::Stale(meta, body))
        } else {
            Ok(Lookup::None)
        }
    }

    /// Write blob then metadata, in that order, so that "meta implies blob"
    /// holds even if the process is interrupted between the two writes.
    pub async fn write(
        &self,
        key: &CacheKey,
        meta: &Metadata,
        body: &[u8],
        cache_ttl: Duration,
        stale_ttl: Duration,
    ) -> Result<()> {
        self.blob
            .put(key.as_str(), body)
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;

        let ttl = cache_ttl + stale_ttl;
        self.kv
            .hset_all(&key.meta_key(), meta.to_fields(), ttl)
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))
    }

    /// Metadata presence only, ignoring the blob.
    pub async fn exists(&self, key: &CacheKey) -> Result<bool> {
        self.kv.exists(&key.meta_key()).await
    }

    /// Read the raw metadata record, for introspection.
    pub async fn metadata(&self, key: &CacheKey) -> Result<Option<Metadata>> {
        match self.kv.hgetall(&key.meta_key()).await? {
            Some(fields) => Ok(Some(Metadata::from_fields(&fields)?)),
            None => Ok(None),
        }
    }

    /// Shorten a key's TTL directly, for callers that already know the
    /// desired remaining lifetime.
    pub async fn set_ttl(&self, key: &CacheKey, ttl: Duration) -> Result<()> {
        self.kv.expire(&key.meta_key(), ttl).await
    }

    /// The admin `make-stale` hook: rewrite `expires_at` into the past so
    /// the very next lookup classifies the entry as stale (or, if its
    /// `stale_ttl` window has also elapsed, as gone) without waiting for
    /// real time to pass.
    pub async fn make_stale(&self, key: &CacheKey) -> Result<bool> {
        let meta_key = key.meta_key();
        let Some(fields) = self.kv.hgetall(&meta_key).await? else {
            return Ok(false);
        };
        let mut meta = Metadata::from_fields(&fields)?;
        meta.expires_at = self.clock.now() - 1;

        let remaining = self.kv.ttl_remaining(&meta_key).await?.unwrap_or(Duration::from_secs(3600));
        self.kv.hset_all(&meta_key, meta.to_fields(), remaining).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::normalize::normalize;
    use crate::store::memory::MemoryKv;
    use std::collections::HashMap as Map;

    fn store(clock: Arc<TestClock>) -> CacheStore<MemoryKv> {
        let dir = tempfile::tempdir().unwrap();
        CacheStore::new(MemoryKv::new(), BlobStore::new(dir.into_path()), clock)
    }

    fn key() -> CacheKey {
        let url = normalize("https://example.com/p", "ignored", "https").unwrap();
        CacheKey::derive(&url, "desktop")
    }

    #[tokio::test]
    async fn write_then_fresh_lookup() {
        let clock = Arc::new(TestClock::new(1_000));
        let store = store(clock.clone());
        let key = key();
        let meta = Metadata::new(200, 1_000, Duration::from_secs(2), Map::new(), None);
        store
            .write(&key, &meta, b"body", Duration::from_secs(2), Duration::from_secs(10))
            .await
            .unwrap();

        match store.lookup(&key, Duration::from_secs(10)).await.unwrap() {
            Lookup::Fresh(m, body) => {
                assert_eq!(m.status_code, 200);
                assert_eq!(body, b"body");
            }
            _ => panic!("expected fresh"),
        }
    }

    #[tokio::test]
    async fn becomes_stale_after_expiry() {
        let clock = Arc::new(TestClock::new(1_000));
        let store = store(clock.clone());
        let key = key();
        let meta = Metadata::new(200, 1_000, Duration::from_secs(2), Map::new(), None);
        store
            .write(&key, &meta, b"body", Duration::from_secs(2), Duration::from_secs(10))
            .await
            .unwrap();

        clock.advance(3);
        match store.lookup(&key, Duration::from_secs(10)).await.unwrap() {
            Lookup::Stale(_, body) => assert_eq!(body, b"body"),
            _ => panic!("expected stale"),
        }
    }

    #[tokio::test]
    async fn becomes_none_after_stale_window() {
        let clock = Arc::new(TestClock::new(1_000));
        let store = store(clock.clone());
        let key = key();
        let meta = Metadata::new(200, 1_000, Duration::from_secs(2), Map::new(), None);
        store
            .write(&key, &meta, b"body", Duration::from_secs(2), Duration::from_secs(10))
            .await
            .unwrap();

        clock.advance(13);
        assert!(matches!(
            store.lookup(&key, Duration::from_secs(10)).await.unwrap(),
            Lookup::None
        ));
    }

    #[tokio::test]
    async fn zero_stale_ttl_skips_straight_to_none() {
        let clock = Arc::new(TestClock::new(1_000));
        let store = store(clock.clone());
        let key = key();
        let meta = Metadata::new(200, 1_000, Duration::from_secs(2), Map::new(), None);
        store.write(&key, &meta, b"body", Duration::from_secs(2), Duration::ZERO).await.unwrap();

        clock.advance(3);
        assert!(matches!(store.lookup(&key, Duration::ZERO).await.unwrap(), Lookup::None));
    }

    #[tokio::test]
    async fn make_stale_flips_fresh_entry_to_stale() {
        let clock = Arc::new(TestClock::new(1_000));
        let store = store(clock.clone());
        let key = key();
        let meta = Metadata::new(200, 1_000, Duration::from_secs(60), Map::new(), None);
        store
            .write(&key, &meta, b"body", Duration::from_secs(60), Duration::from_secs(10))
            .await
            .unwrap();

        assert!(matches!(
            store.lookup(&key, Duration::from_secs(10)).await.unwrap(),
            Lookup::Fresh(_, _)
        ));

        assert!(store.make_stale(&key).await.unwrap());
        assert!(matches!(
            store.lookup(&key, Duration::from_secs(10)).await.unwrap(),
            Lookup::Stale(_, _)
        ));
    }

    #[tokio::test]
    async fn absent_key_is_none() {
        let clock = Arc::new(TestClock::new(1_000));
        let store = store(clock);
        assert!(matches!(
            store.lookup(&key(), Duration::from_secs(10)).await.unwrap(),
            Lookup::None
        ));
    }
}
