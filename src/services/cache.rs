//! Redis cache for chat answers.
//!
//! - values are JSON via serde
//! - every entry carries a TTL
//! - an upload or deletion drops the owner's cached answers by key pattern

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// Redis cache client with connection pooling.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    default_ttl: Duration,
}

impl RedisCache {
    pub async fn new(redis_url: &str, default_ttl_seconds: u64) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        tracing::info!("Redis cache connected");

        Ok(Self {
            conn,
            default_ttl: Duration::from_secs(default_ttl_seconds),
        })
    }

    /// Get a value; misses, Redis errors and stale shapes all read as `None`.
    #[instrument(skip(self), fields(cache_hit))]
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = self.conn.clone();

        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(data)) => match serde_json::from_str(&data) {
                Ok(value) => {
                    debug!(key = key, "Cache hit");
                    tracing::Span::current().record("cache_hit", true);
                    Some(value)
                }
                Err(e) => {
                    warn!(key = key, error = %e, "Failed to deserialize cached value");
                    tracing::Span::current().record("cache_hit", false);
                    None
                }
            },
            Ok(None) => {
                debug!(key = key, "Cache miss");
                tracing::Span::current().record("cache_hit", false);
                None
            }
            Err(e) => {
                error!(key = key, error = %e, "Redis get error");
                tracing::Span::current().record("cache_hit", false);
                None
            }
        }
    }

    /// Set a value with the default TTL.
    #[instrument(skip(self, value))]
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set_with_ttl(key, value, self.default_ttl).await
    }

    #[instrument(skip(self, value))]
    pub async fn set_with_ttl<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn.clone();

        let data = serde_json::to_string(value).context("Failed to serialize value for cache")?;

        conn.set_ex::<_, _, ()>(key, data, ttl.as_secs())
            .await
            .context("Failed to set cache value")?;

        debug!(key = key, ttl_secs = ttl.as_secs(), "Cached value");
        Ok(())
    }

    /// Delete all keys matching a pattern (e.g. "chat:user:12:*").
    #[instrument(skip(self))]
    pub async fn delete_pattern(&self, pattern: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut deleted = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(1000)
                .query_async(&mut conn)
                .await
                .context("Failed to scan cache keys")?;

            if !keys.is_empty() {
                let n: i64 = conn.del(&keys).await.context("Failed to delete cache keys")?;
                deleted += n as usize;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern = pattern, deleted = deleted, "Cache pattern delete");
        Ok(deleted)
    }

    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis health check failed")?;
        Ok(())
    }
}

/// Cache key builders.
pub mod keys {
    use sha2::{Digest, Sha256};

    use crate::domain::chat::Language;

    /// Chat answer for one user, scope and language; the question is hashed.
    pub fn chat_answer(
        user_id: i64,
        property_id: Option<i64>,
        language: Language,
        question: &str,
    ) -> String {
        let scope = property_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "all".to_string());
        let digest = hex::encode(Sha256::digest(question.trim().as_bytes()));
        format!(
            "chat:user:{}:property:{}:{}:{}",
            user_id,
            scope,
            language.code(),
            digest
        )
    }

    /// Pattern matching every cached answer of a user
    pub fn chat_user_pattern(user_id: i64) -> String {
        format!("chat:user:{}:*", user_id)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn chat_keys_are_scoped_and_stable() {
            let a = chat_answer(3, Some(9), Language::De, "Wann ist die ETV?");
            let b = chat_answer(3, Some(9), Language::De, "  Wann ist die ETV?  ");
            assert_eq!(a, b);
            assert!(a.starts_with("chat:user:3:property:9:de:"));

            let all = chat_answer(3, None, Language::En, "Wann ist die ETV?");
            assert!(all.starts_with("chat:user:3:property:all:en:"));
            assert_ne!(a, all);
        }

        #[test]
        fn user_pattern_covers_user_keys_only() {
            let pattern = chat_user_pattern(3);
            assert_eq!(pattern, "chat:user:3:*");
            let key = chat_answer(3, None, Language::Fr, "q");
            assert!(key.starts_with(pattern.trim_end_matches('*')));
            assert!(!chat_answer(31, None, Language::Fr, "q").starts_with("chat:user:3:"));
        }
    }
}
