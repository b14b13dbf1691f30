//! Redis-backed [`KvBackend`](super::KvBackend): a lazily-established
//! `ConnectionManager` shared across requests, with hash writes and their
//! TTL set atomically via a pipeline.

use super::KvBackend;
use crate::error::{Error, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::OnceCell;

/// A Redis connection, lazily established on first use and shared across
/// requests behind a cloneable `ConnectionManager`.
pub struct RedisKv {
    url: String,
    conn: OnceCell<ConnectionManager>,
}

impl RedisKv {
    pub fn new(url: impl Into<String>) -> Self {
        RedisKv { url: url.into(), conn: OnceCell::new() }
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let client = redis::Client::open(self.url.as_str())
                    .map_err(|e| Error::StoreUnavailable(e.to_string()))?;
                client
                    .get_connection_manager()
                    .await
                    .map_err(|e| Error::StoreUnavailable(e.to_string()))
            })
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl KvBackend for RedisKv {
    async fn hset_all(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.connection().await?;
        let ttl_secs = ttl.as_secs().max(1);
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(key, &fields).ignore();
        pipe.expire(key, ttl_secs as i64).ignore();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))
    }

    async fn hgetall(&self, key: &str) -> Result<Option<HashMap<String, String>>> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> = conn
            .hgetall(key)
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;
        if fields.is_empty() {
            Ok(None)
        } else {
            Ok(Some(fields))
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn
            .expire(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.del(key).await.map_err(|e| Error::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        conn.exists(key).await.map_err(|e| Error::StoreUnavailable(e.to_string()))
    }

    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.connection().await?;
        let millis: i64 = conn
            .pttl(key)
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;
        Ok(if millis > 0 { Some(Duration::from_millis(millis as u64)) } else { None })
    }
}
