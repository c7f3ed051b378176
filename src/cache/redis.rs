//! Redis implementation of [`KvBackend`].

use super::backend::KvBackend;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// Redis-backed key-value store.
///
/// A single multiplexed connection is opened by `connect` and shared by every call;
/// `disconnect` drops it.
pub struct RedisBackend {
    url: String,
    conn: RwLock<Option<MultiplexedConnection>>,
}

impl RedisBackend {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            conn: RwLock::new(None),
        }
    }

    fn connection(&self) -> Result<MultiplexedConnection> {
        self.conn
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                Error::backend_with_context(
                    "redis connection not established",
                    ErrorContext::new().with_source("redis"),
                )
            })
    }
}

fn redis_err(op: &str, e: redis::RedisError) -> Error {
    Error::backend_with_context(
        format!("Redis {} error: {}", op, e),
        ErrorContext::new().with_source("redis"),
    )
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn connect(&self) -> Result<()> {
        let client = redis::Client::open(self.url.as_str()).map_err(|e| {
            Error::connection_with_context(
                format!("invalid Redis URL: {}", e),
                ErrorContext::new()
                    .with_field_path("redis.url")
                    .with_source("redis"),
            )
        })?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                Error::connection_with_context(
                    format!("failed to connect to Redis: {}", e),
                    ErrorContext::new().with_source("redis"),
                )
            })?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await.map_err(|e| {
            Error::connection_with_context(
                format!("Redis PING failed: {}", e),
                ErrorContext::new().with_source("redis"),
            )
        })?;
        debug!(reply = %pong, "redis liveness check");
        *self.conn.write().unwrap_or_else(PoisonError::into_inner) = Some(conn);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.conn
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection()?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_err("GET", e))?;
        Ok(raw)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection()?;
        // EX 0 is rejected by Redis.
        let secs = ttl.as_secs().max(1);
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_err("SET", e))?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection()?;
        let deleted: u64 = redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_err("DEL", e))?;
        Ok(deleted)
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        let mut conn = self.connection()?;
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_err("SCAN", e))?;
        Ok((next, keys))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
