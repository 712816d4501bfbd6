//! Cache Tier
//!
//! Moka-backed in-process cache. Entries expire after their own TTL, or the
//! tier default when written without one (promotions, default routing).

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{MemoryEntry, Tier, TierBackend, TierCounters, TierStats};
use crate::error::CoreResult;

struct EntryExpiry {
    default_ttl: Duration,
}

impl Expiry<String, MemoryEntry> for EntryExpiry {
    fn expire_after_create(&self, _key: &String, value: &MemoryEntry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl.unwrap_or(self.default_ttl))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &MemoryEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl.unwrap_or(self.default_ttl))
    }
}

/// In-process cache tier
#[derive(Clone)]
pub struct CacheTier {
    cache: Cache<String, MemoryEntry>,
    counters: std::sync::Arc<TierCounters>,
}

impl CacheTier {
    /// Create a cache holding at most `max_entries`, with `default_ttl` for entries without one
    pub fn new(max_entries: u64, default_ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(EntryExpiry { default_ttl })
            .build();

        Self {
            cache,
            counters: Default::default(),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }
}

#[async_trait]
impl TierBackend for CacheTier {
    fn tier(&self) -> Tier {
        Tier::Cache
    }

    async fn get(&self, key: &str) -> CoreResult<Option<MemoryEntry>> {
        let entry = self.cache.get(key).await.filter(|e| !e.is_expired());
        self.counters.read(entry.is_some());

        if entry.is_some() {
            debug!("Cache HIT: {}", key);
        } else {
            debug!("Cache MISS: {}", key);
        }
        Ok(entry)
    }

    async fn put(&self, entry: MemoryEntry) -> CoreResult<()> {
        self.counters.write();
        self.cache.insert(entry.key.clone(), entry).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CoreResult<bool> {
        self.counters.delete();
        Ok(self.cache.remove(key).await.is_some())
    }

    async fn delete_older(&self, key: &str, stamp: u64) -> CoreResult<bool> {
        match self.cache.get(key).await {
            Some(existing) if existing.written_at < stamp => self.delete(key).await,
            _ => Ok(false),
        }
    }

    fn stats(&self) -> TierStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiers::Payload;

    #[tokio::test]
    async fn test_cache_hit_miss() {
        let cache = CacheTier::new(100, Duration::from_secs(60));

        assert!(cache.get("k").await.unwrap().is_none());

        let entry = MemoryEntry::new("k", Tier::Cache, Payload::text("v"), "default", 1);
        cache.put(entry.clone()).await.unwrap();

        let hit = cache.get("k").await.unwrap().unwrap();
        assert_eq!(hit.payload, entry.payload);

        let stats = cache.stats();
        assert_eq!(stats.reads, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.writes, 1);
    }

    #[tokio::test]
    async fn test_entry_ttl_expires() {
        let cache = CacheTier::new(100, Duration::from_secs(60));

        let entry = MemoryEntry::new("short", Tier::Cache, Payload::text("v"), "default", 1)
            .with_ttl(Duration::from_millis(20));
        cache.put(entry).await.unwrap();
        assert!(cache.get("short").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("short").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let cache = CacheTier::new(100, Duration::from_secs(60));
        cache
            .put(MemoryEntry::new("k", Tier::Cache, Payload::text("v"), "default", 1))
            .await
            .unwrap();

        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());
        assert!(cache.get("k").await.unwrap().is_none());
    }
}
