//! TTL'd checkpoint cache backed by moka.

use anyhow::Result;
use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use serde_json::Value;
use std::time::{Duration, Instant};

use mangaforge_common::CacheStore;

/// Default interim-result TTL in seconds.
pub const DEFAULT_TTL_SECS: u64 = 3600;

#[derive(Clone)]
struct Entry {
    value: Value,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &Entry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// In-process cache store with a per-entry TTL.
pub struct MokaCache {
    inner: Cache<String, Entry>,
}

impl Default for MokaCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MokaCache {
    pub fn new() -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(10_000)
                .expire_after(PerEntryTtl)
                .build(),
        }
    }
}

#[async_trait]
impl CacheStore for MokaCache {
    async fn set(&self, key: &str, value: Value, ttl_seconds: u64) -> Result<()> {
        self.inner
            .insert(
                key.to_string(),
                Entry {
                    value,
                    ttl: Duration::from_secs(ttl_seconds.max(1)),
                },
            )
            .await;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.inner.get(key).await.map(|entry| entry.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mangaforge_common::agent_result_key;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = MokaCache::new();
        let key = agent_result_key(1, Uuid::nil());
        cache
            .set(&key, json!({"genre": "fantasy"}), DEFAULT_TTL_SECS)
            .await
            .unwrap();
        let value = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(value["genre"], "fantasy");
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let cache = MokaCache::new();
        assert!(cache.get("agent_result:9:none").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn entries_expire_after_their_ttl() {
        let cache = MokaCache::new();
        cache.set("short-lived", json!(1), 1).await.unwrap();
        assert!(cache.get("short-lived").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(cache.get("short-lived").await.unwrap().is_none());
    }
}
