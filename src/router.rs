//! Memory Router
//!
//! Single entry point for memory reads and writes across the four tiers.
//!
//! - Writes: `WritePolicy` picks a tier from the caller's hints; if that
//!   tier's breaker is open or the write fails, the documented fallbacks are
//!   tried in order. After a successful write, older copies of the key in other
//!   tiers are removed best-effort.
//! - Reads: `Tier::FALLBACK_CHAIN` order. A hit below the cache is copied back
//!   into the cache unless the caller disabled promotion.
//! - Every backend call goes through the tier's circuit breaker.
//!
//! Each put gets a stamp from the router's `WriteClock`. The router remembers
//! the newest stamp it handed out per key, so a leftover copy from an older
//! write is never returned even when invalidation failed.

use futures_util::future::join_all;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::circuit::{CircuitBreakerRegistry, CircuitState};
use crate::error::{CoreError, CoreResult};
use crate::policy::{TierHint, WritePolicy};
use crate::tiers::{
    FieldCondition, MemoryEntry, Payload, StructuredFilter, Tier, TierBackend, TierStats, WriteClock,
};

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Maximum entries held by the cache tier
    pub cache_capacity: u64,
    /// TTL for cache entries written without one (promotions, default routing)
    #[serde(with = "crate::config::duration_ms")]
    pub cache_ttl: Duration,
    /// TTLs at or below this are routed to the cache
    #[serde(with = "crate::config::duration_ms")]
    pub short_ttl: Duration,
    /// Payloads larger than this go to the archival tier
    pub archival_threshold_bytes: usize,
    /// How many per-key write stamps the router remembers
    pub watermark_capacity: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            cache_ttl: Duration::from_secs(3600),
            short_ttl: Duration::from_secs(300),
            archival_threshold_bytes: 64 * 1024,
            watermark_capacity: 100_000,
        }
    }
}

/// Value handed to `MemoryRouter::put`
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryValue {
    pub payload: Payload,
    pub embedding: Option<Vec<f32>>,
    pub domain: String,
    pub entity: Option<String>,
}

impl MemoryValue {
    pub fn new(payload: Payload, domain: &str) -> Self {
        Self {
            payload,
            embedding: None,
            domain: domain.to_string(),
            entity: None,
        }
    }

    pub fn json(value: serde_json::Value, domain: &str) -> Self {
        Self::new(Payload::Json(value), domain)
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Tag the value with the entity it describes, for `MemoryRouter::query` joins
    pub fn with_entity(mut self, entity: &str) -> Self {
        self.entity = Some(entity.to_string());
        self
    }
}

/// Similarity half of a hybrid query
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticQuery {
    pub embedding: Vec<f32>,
    pub top_k: usize,
    pub min_score: f32,
}

impl SemanticQuery {
    pub fn new(embedding: Vec<f32>, top_k: usize) -> Self {
        Self {
            embedding,
            top_k,
            min_score: 0.0,
        }
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }
}

/// One hybrid query result
#[derive(Debug, Clone)]
pub struct RankedResult {
    /// Entity the vector and structured records share
    pub entity: String,
    pub score: f32,
    /// The vector-tier record that matched
    pub entry: MemoryEntry,
    /// The structured record that satisfied the filters, if filters were given
    pub record: Option<MemoryEntry>,
}

/// The four tier backends
#[derive(Clone)]
pub struct TierBackends {
    pub cache: Arc<dyn TierBackend>,
    pub vector: Arc<dyn TierBackend>,
    pub structured: Arc<dyn TierBackend>,
    pub archival: Arc<dyn TierBackend>,
}

impl TierBackends {
    pub fn for_tier(&self, tier: Tier) -> &Arc<dyn TierBackend> {
        match tier {
            Tier::Cache => &self.cache,
            Tier::Vector => &self.vector,
            Tier::Structured => &self.structured,
            Tier::Archival => &self.archival,
        }
    }
}

/// Per-tier view used by `RouterStats`
#[derive(Debug, Clone)]
pub struct TierReport {
    pub tier: Tier,
    pub stats: TierStats,
    pub circuit: CircuitState,
}

/// Router statistics
#[derive(Debug, Clone)]
pub struct RouterStats {
    pub tiers: Vec<TierReport>,
    /// Writes that landed on a fallback tier
    pub fallback_writes: u64,
    /// Read hits copied into the cache
    pub promotions: u64,
    /// Hits discarded because a newer write exists
    pub stale_skips: u64,
}

#[derive(Debug, Default)]
struct RouterCounters {
    fallback_writes: AtomicU64,
    promotions: AtomicU64,
    stale_skips: AtomicU64,
}

/// Tiered memory router
pub struct MemoryRouter {
    backends: TierBackends,
    breakers: Arc<CircuitBreakerRegistry>,
    policy: WritePolicy,
    clock: WriteClock,
    /// Newest write stamp issued per key
    watermarks: Cache<String, u64>,
    counters: RouterCounters,
}

impl MemoryRouter {
    pub fn new(config: &RouterConfig, backends: TierBackends, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        info!(
            "Memory router ready (short_ttl={:?}, archival_threshold={}B)",
            config.short_ttl, config.archival_threshold_bytes
        );

        Self {
            backends,
            breakers,
            policy: WritePolicy::new(config.short_ttl, config.archival_threshold_bytes),
            clock: WriteClock::new(),
            watermarks: Cache::builder().max_capacity(config.watermark_capacity).build(),
            counters: RouterCounters::default(),
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Store a value, returning the tier it landed in
    pub async fn put(&self, key: &str, value: MemoryValue, hints: &TierHint) -> CoreResult<Tier> {
        let decision = self
            .policy
            .route_write(hints, value.payload.size_bytes(), value.embedding.is_some())?;

        let stamp = self.clock.tick();
        let mut entry = MemoryEntry::new(key, decision.tier, value.payload, &value.domain, stamp);
        if let Some(embedding) = value.embedding {
            entry = entry.with_embedding(embedding);
        }
        if let Some(ref entity) = value.entity {
            entry = entry.with_entity(entity);
        }
        if let Some(ttl) = hints.expected_ttl {
            entry = entry.with_ttl(ttl);
        }

        let candidates =
            std::iter::once(decision.tier).chain(WritePolicy::write_fallbacks(decision.tier).iter().copied());

        let mut last_error: Option<CoreError> = None;
        let mut written = None;
        for tier in candidates {
            let scope = tier.scope();
            if !self.breakers.allow(&scope) {
                debug!("Skipping {} for PUT {}: circuit open", tier, key);
                continue;
            }

            match self.backends.for_tier(tier).put(entry.relocated(tier)).await {
                Ok(()) => {
                    self.breakers.record_success(&scope);
                    written = Some(tier);
                    break;
                }
                Err(e) if e.is_caller_error() => {
                    // The tier answered, so a HalfOpen trial still closes
                    self.breakers.record_success(&scope);
                    debug!("PUT {} rejected by {}: {}", key, tier, e);
                    return Err(e);
                }
                Err(e) => {
                    self.breakers.record_failure(&scope);
                    warn!("PUT {} failed on {}: {}", key, tier, e);
                    last_error = Some(e);
                }
            }
        }

        let Some(tier) = written else {
            return Err(CoreError::TierUnavailable(match last_error {
                Some(e) => format!("write of {} failed: {}", key, e),
                None => format!("write of {}: every candidate tier is circuit-open", key),
            }));
        };

        if tier != decision.tier {
            self.counters.fallback_writes.fetch_add(1, Ordering::Relaxed);
            info!("PUT {} fell back from {} to {}", key, decision.tier, tier);
        }

        self.raise_watermark(key, stamp).await;
        self.invalidate_others(key, tier, stamp).await;

        debug!("PUT {} -> {} ({:?})", key, tier, decision.reason);
        Ok(tier)
    }

    /// Read a value, walking the fallback chain
    ///
    /// Returns the entry and the tier that served it.
    pub async fn get(&self, key: &str, hints: &TierHint) -> CoreResult<(MemoryEntry, Tier)> {
        let chain = Tier::FALLBACK_CHAIN;
        let watermark = self.watermarks.get(key).await.unwrap_or(0);

        for (i, tier) in chain.iter().copied().enumerate() {
            let last = i == chain.len() - 1;
            let scope = tier.scope();

            if !self.breakers.allow(&scope) {
                if last {
                    return Err(CoreError::TierUnavailable(format!(
                        "read of {}: {} circuit open",
                        key, tier
                    )));
                }
                debug!("Skipping {} for GET {}: circuit open", tier, key);
                continue;
            }

            let entry = match self.backends.for_tier(tier).get(key).await {
                Ok(entry) => {
                    self.breakers.record_success(&scope);
                    entry
                }
                Err(e) => {
                    self.breakers.record_failure(&scope);
                    warn!("GET {} failed on {}: {}", key, tier, e);
                    if last {
                        return Err(CoreError::TierUnavailable(format!("read of {}: {}", key, e)));
                    }
                    continue;
                }
            };

            let Some(entry) = entry else {
                continue;
            };

            self.clock.observe(entry.written_at);
            if entry.written_at < watermark {
                self.counters.stale_skips.fetch_add(1, Ordering::Relaxed);
                debug!("Discarding stale {} copy of {}", tier, key);
                if let Err(e) = self.backends.for_tier(tier).delete_older(key, watermark).await {
                    debug!("Failed to evict stale {} copy of {}: {}", tier, key, e);
                }
                continue;
            }

            if tier != Tier::Cache && hints.allow_promotion {
                self.promote(&entry).await;
            }
            return Ok((entry, tier));
        }

        Err(CoreError::NotFound(key.to_string()))
    }

    /// Remove a key from every tier
    ///
    /// Tiers whose breaker refuses the call are skipped; the raised watermark
    /// hides whatever they still hold.
    pub async fn delete(&self, key: &str) -> CoreResult<bool> {
        let stamp = self.clock.tick();
        self.raise_watermark(key, stamp).await;

        let mut removed = false;
        let mut failures = Vec::new();
        for tier in Tier::FALLBACK_CHAIN {
            let scope = tier.scope();
            if !self.breakers.allow(&scope) {
                continue;
            }
            match self.backends.for_tier(tier).delete(key).await {
                Ok(existed) => {
                    self.breakers.record_success(&scope);
                    removed |= existed;
                }
                Err(e) => {
                    self.breakers.record_failure(&scope);
                    warn!("DELETE {} failed on {}: {}", key, tier, e);
                    failures.push(format!("{}: {}", tier, e));
                }
            }
        }

        if !removed && failures.len() == Tier::FALLBACK_CHAIN.len() {
            return Err(CoreError::TierUnavailable(failures.join("; ")));
        }
        Ok(removed)
    }

    /// Hybrid query: vector similarity, optionally narrowed by structured filters
    ///
    /// Without filters, results come straight from the vector tier. With
    /// filters, only entities that also have a structured record in `domain`
    /// satisfying every condition are kept, in similarity order.
    pub async fn query(
        &self,
        semantic: &SemanticQuery,
        domain: &str,
        filters: &[FieldCondition],
    ) -> CoreResult<Vec<RankedResult>> {
        if semantic.top_k == 0 {
            return Ok(Vec::new());
        }

        let limit = if filters.is_empty() { semantic.top_k } else { usize::MAX };
        let scored = self
            .call(Tier::Vector, |backend| {
                let embedding = semantic.embedding.clone();
                async move { backend.search_similar(&embedding, Some(domain), limit).await }
            })
            .await?;

        let hits = scored.into_iter().filter(|s| s.score >= semantic.min_score);

        if filters.is_empty() {
            return Ok(hits
                .take(semantic.top_k)
                .map(|s| RankedResult {
                    entity: s.entry.entity().to_string(),
                    score: s.score,
                    entry: s.entry,
                    record: None,
                })
                .collect());
        }

        let filter = StructuredFilter {
            domain: Some(domain.to_string()),
            key_prefix: None,
            conditions: filters.to_vec(),
        };
        let records = self
            .call(Tier::Structured, |backend| {
                let filter = filter.clone();
                async move { backend.filter(&filter).await }
            })
            .await?;

        let mut by_entity: HashMap<String, MemoryEntry> = HashMap::with_capacity(records.len());
        for record in records {
            by_entity.entry(record.entity().to_string()).or_insert(record);
        }

        let results: Vec<RankedResult> = hits
            .filter_map(|s| {
                let entity = s.entry.entity().to_string();
                by_entity.get(&entity).cloned().map(|record| RankedResult {
                    entity,
                    score: s.score,
                    entry: s.entry,
                    record: Some(record),
                })
            })
            .take(semantic.top_k)
            .collect();

        debug!(
            "QUERY {} -> {} results ({} filters)",
            domain,
            results.len(),
            filters.len()
        );
        Ok(results)
    }

    /// Filtered scan over the durable tiers
    ///
    /// Structured and archival results are merged by key, newest write first.
    /// One failing tier degrades the scan; both failing is an error.
    pub async fn scan(&self, filter: &StructuredFilter) -> CoreResult<Vec<MemoryEntry>> {
        let mut merged: BTreeMap<String, MemoryEntry> = BTreeMap::new();
        let mut failures = Vec::new();

        for tier in [Tier::Structured, Tier::Archival] {
            let found = self
                .call(tier, |backend| {
                    let filter = filter.clone();
                    async move { backend.filter(&filter).await }
                })
                .await;

            let entries = match found {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("SCAN degraded, {} skipped: {}", tier, e);
                    failures.push(e.to_string());
                    continue;
                }
            };

            for entry in entries {
                self.clock.observe(entry.written_at);
                let watermark = self.watermarks.get(&entry.key).await.unwrap_or(0);
                if entry.written_at < watermark {
                    self.counters.stale_skips.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                match merged.get(&entry.key) {
                    Some(existing) if existing.written_at >= entry.written_at => {}
                    _ => {
                        merged.insert(entry.key.clone(), entry);
                    }
                }
            }
        }

        if failures.len() == 2 {
            return Err(CoreError::TierUnavailable(format!("scan failed: {}", failures.join("; "))));
        }
        Ok(merged.into_values().collect())
    }

    pub fn stats(&self) -> RouterStats {
        let tiers = Tier::FALLBACK_CHAIN
            .iter()
            .map(|&tier| TierReport {
                tier,
                stats: self.backends.for_tier(tier).stats(),
                circuit: self.breakers.state(&tier.scope()),
            })
            .collect();

        RouterStats {
            tiers,
            fallback_writes: self.counters.fallback_writes.load(Ordering::Relaxed),
            promotions: self.counters.promotions.load(Ordering::Relaxed),
            stale_skips: self.counters.stale_skips.load(Ordering::Relaxed),
        }
    }

    /// Run one backend call behind the tier's breaker
    async fn call<'a, T, F, Fut>(&'a self, tier: Tier, f: F) -> CoreResult<T>
    where
        F: FnOnce(&'a Arc<dyn TierBackend>) -> Fut,
        Fut: std::future::Future<Output = CoreResult<T>>,
    {
        let scope = tier.scope();
        if !self.breakers.allow(&scope) {
            return Err(CoreError::TierUnavailable(format!("{} circuit open", tier)));
        }

        match f(self.backends.for_tier(tier)).await {
            Ok(value) => {
                self.breakers.record_success(&scope);
                Ok(value)
            }
            Err(e) if e.is_caller_error() => {
                self.breakers.record_success(&scope);
                Err(e)
            }
            Err(e) => {
                self.breakers.record_failure(&scope);
                warn!("{} call failed: {}", tier, e);
                Err(CoreError::TierUnavailable(format!("{}: {}", tier, e)))
            }
        }
    }

    async fn promote(&self, entry: &MemoryEntry) {
        let mut cached = entry.relocated(Tier::Cache);
        if let Some(expires_at) = entry.expires_at {
            let remaining = expires_at - chrono::Utc::now().timestamp_millis();
            if remaining <= 0 {
                return;
            }
            cached.ttl = Some(Duration::from_millis(remaining as u64));
        }

        let scope = Tier::Cache.scope();
        if !self.breakers.allow(&scope) {
            return;
        }
        match self.backends.cache.put(cached).await {
            Ok(()) => {
                self.breakers.record_success(&scope);
                self.counters.promotions.fetch_add(1, Ordering::Relaxed);
                debug!("Promoted {} from {} to cache", entry.key, entry.tier_origin);
            }
            Err(e) => {
                self.breakers.record_failure(&scope);
                warn!("Promotion of {} failed: {}", entry.key, e);
            }
        }
    }

    async fn raise_watermark(&self, key: &str, stamp: u64) {
        self.watermarks
            .entry(key.to_string())
            .and_upsert_with(|existing| {
                let next = existing.map(|e| e.into_value().max(stamp)).unwrap_or(stamp);
                std::future::ready(next)
            })
            .await;
    }

    /// Drop copies of `key` older than `stamp` from every tier except `written`
    async fn invalidate_others(&self, key: &str, written: Tier, stamp: u64) {
        let targets: Vec<Tier> = Tier::FALLBACK_CHAIN
            .into_iter()
            .filter(|&tier| tier != written && self.breakers.allow(&tier.scope()))
            .collect();

        let results = join_all(
            targets
                .iter()
                .map(|&tier| self.backends.for_tier(tier).delete_older(key, stamp)),
        )
        .await;

        for (tier, result) in targets.into_iter().zip(results) {
            let scope = tier.scope();
            match result {
                Ok(removed) => {
                    self.breakers.record_success(&scope);
                    if removed {
                        debug!("Invalidated {} copy of {}", tier, key);
                    }
                }
                Err(e) => {
                    self.breakers.record_failure(&scope);
                    debug!("Invalidation of {} in {} failed: {}", key, tier, e);
                }
            }
        }
    }
}
