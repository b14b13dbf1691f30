//! An in-memory [`KvBackend`](super::KvBackend), standing in for Redis in
//! tests.

use super::KvBackend;
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

struct Entry {
    fields: HashMap<String, String>,
    expires_at: u64,
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

/// Dashmap-backed fake KV store. TTLs are checked lazily on read, since
/// there's no background expiry sweep to imitate Redis with here.
#[derive(Default)]
pub struct MemoryKv {
    entries: DashMap<String, Entry>,
}

impl MemoryKv {
    pub fn new() -> Self {
        MemoryKv { entries: DashMap::new() }
    }

    fn is_live(entry: &Entry) -> bool {
        now_secs() < entry.expires_at
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn hset_all(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        ttl: Duration,
    ) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                fields: fields.into_iter().collect(),
                expires_at: now_secs() + ttl.as_secs(),
            },
        );
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<Option<HashMap<String, String>>> {
        match self.entries.get(key) {
            Some(entry) if Self::is_live(&entry) => Ok(Some(entry.fields.clone())),
            Some(_) => {
                self.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = now_secs() + ttl.as_secs();
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(matches!(self.entries.get(key), Some(e) if Self::is_live(&e)))
    }

    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self.entries.get(key).and_then(|e| {
            let now = now_secs();
            (e.expires_at > now).then(|| Duration::from_secs(e.expires_at - now))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_fields() {
        let kv = MemoryKv::new();
        kv.hset_all("k", vec![("a".into(), "1".into())], Duration::from_secs(60))
            .await
            .unwrap();
        let fields = kv.hgetall("k").await.unwrap().unwrap();
        assert_eq!(fields.get("a").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn del_removes_key() {
        let kv = MemoryKv::new();
        kv.hset_all("k", vec![("a".into(), "1".into())], Duration::from_secs(60))
            .await
            .unwrap();
        kv.del("k").await.unwrap();
        assert!(!kv.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn expire_shortens_ttl_to_immediate_expiry() {
        let kv = MemoryKv::new();
        kv.hset_all("k", vec![("a".into(), "1".into())], Duration::from_secs(60))
            .await
            .unwrap();
        kv.expire("k", Duration::from_secs(0)).await.unwrap();
        assert!(!kv.exists("k").await.unwrap());
    }
}
