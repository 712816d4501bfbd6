//! Storage Tiers
//!
//! Four backends with different latency/durability trade-offs:
//! - **Cache**: in-process Moka cache, per-entry TTL
//! - **Vector**: in-memory embedding index, cosine similarity ranking
//! - **Structured**: SQLite rows with a minimal key/filter contract
//! - **Archival**: content-addressed JSON files on disk
//!
//! Each backend is individually concurrency-safe. None of them knows about the
//! others; cross-tier decisions belong to the router.

pub mod archival;
pub mod cache;
pub mod structured;
pub mod vector;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::CoreResult;

pub use archival::ArchivalTier;
pub use cache::CacheTier;
pub use structured::StructuredTier;
pub use vector::VectorTier;

/// Storage tier identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Cache,
    Vector,
    Structured,
    Archival,
}

impl Tier {
    /// Read order used by `MemoryRouter::get`
    pub const FALLBACK_CHAIN: [Tier; 4] = [Tier::Cache, Tier::Vector, Tier::Structured, Tier::Archival];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Cache => "cache",
            Tier::Vector => "vector",
            Tier::Structured => "structured",
            Tier::Archival => "archival",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "cache" => Some(Tier::Cache),
            "vector" => Some(Tier::Vector),
            "structured" => Some(Tier::Structured),
            "archival" => Some(Tier::Archival),
            _ => None,
        }
    }

    /// Circuit breaker scope for this tier
    pub fn scope(&self) -> String {
        format!("tier:{}", self.as_str())
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored value: opaque bytes or a structured JSON document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Payload {
    pub fn text(s: &str) -> Self {
        Payload::Json(serde_json::Value::String(s.to_string()))
    }

    /// Approximate stored size, used for size classification
    pub fn size_bytes(&self) -> usize {
        match self {
            Payload::Bytes(b) => b.len(),
            Payload::Json(v) => serde_json::to_vec(v).map(|b| b.len()).unwrap_or(0),
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(v) => Some(v),
            Payload::Bytes(_) => None,
        }
    }
}

/// A stored memory record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub tier_origin: Tier,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, with = "crate::config::optional_duration_ms")]
    pub ttl: Option<Duration>,
    pub domain_tag: String,
    /// Entity this record describes, shared across tiers for query joins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_key: Option<String>,
    /// Monotonic write stamp (microseconds), strictly increasing per key
    pub written_at: u64,
    /// Wall clock expiry in unix milliseconds, derived from `ttl` at write time
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl MemoryEntry {
    pub fn new(key: &str, tier: Tier, payload: Payload, domain_tag: &str, written_at: u64) -> Self {
        Self {
            key: key.to_string(),
            tier_origin: tier,
            payload,
            embedding: None,
            ttl: None,
            domain_tag: domain_tag.to_string(),
            entity_key: None,
            written_at,
            expires_at: None,
        }
    }

    pub fn with_entity(mut self, entity_key: &str) -> Self {
        self.entity_key = Some(entity_key.to_string());
        self
    }

    /// Join key for cross-tier queries: the entity if set, else the storage key
    pub fn entity(&self) -> &str {
        self.entity_key.as_deref().unwrap_or(&self.key)
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self.expires_at = Some(chrono::Utc::now().timestamp_millis() + ttl.as_millis() as i64);
        self
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|at| chrono::Utc::now().timestamp_millis() >= at)
            .unwrap_or(false)
    }

    /// Copy of this entry as stored in another tier
    pub fn relocated(&self, tier: Tier) -> Self {
        let mut entry = self.clone();
        entry.tier_origin = tier;
        entry
    }
}

/// Entry with a similarity score
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry: MemoryEntry,
    pub score: f32,
}

/// Strictly increasing write stamps
///
/// Wall clock microseconds, bumped past the previous stamp when the clock
/// stalls or steps backwards.
#[derive(Debug, Default)]
pub struct WriteClock {
    last: AtomicU64,
}

impl WriteClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_micros().max(0) as u64;
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }

    /// Make sure future stamps are above `stamp` (used after reading persisted entries)
    pub fn observe(&self, stamp: u64) {
        self.last.fetch_max(stamp, Ordering::AcqRel);
    }
}

/// Comparison used by a field condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Lt,
}

/// Condition on a dotted field path inside a JSON payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCondition {
    pub field: String,
    pub op: FilterOp,
    pub value: serde_json::Value,
}

impl FieldCondition {
    pub fn eq(field: &str, value: impl Into<serde_json::Value>) -> Self {
        Self {
            field: field.to_string(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    pub fn ne(field: &str, value: impl Into<serde_json::Value>) -> Self {
        Self {
            field: field.to_string(),
            op: FilterOp::Ne,
            value: value.into(),
        }
    }

    pub fn gt(field: &str, value: impl Into<serde_json::Value>) -> Self {
        Self {
            field: field.to_string(),
            op: FilterOp::Gt,
            value: value.into(),
        }
    }

    pub fn lt(field: &str, value: impl Into<serde_json::Value>) -> Self {
        Self {
            field: field.to_string(),
            op: FilterOp::Lt,
            value: value.into(),
        }
    }

    pub fn matches(&self, payload: &Payload) -> bool {
        let Some(doc) = payload.as_json() else {
            return false;
        };
        let pointer = format!("/{}", self.field.replace('.', "/"));
        let actual = doc.pointer(&pointer);

        match self.op {
            FilterOp::Eq => actual == Some(&self.value),
            FilterOp::Ne => actual != Some(&self.value),
            FilterOp::Gt => compare(actual, &self.value) == Some(CmpOrdering::Greater),
            FilterOp::Lt => compare(actual, &self.value) == Some(CmpOrdering::Less),
        }
    }
}

fn compare(actual: Option<&serde_json::Value>, expected: &serde_json::Value) -> Option<CmpOrdering> {
    let actual = actual?;
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (actual.as_str(), expected.as_str()) {
            (Some(a), Some(b)) => Some(a.cmp(b)),
            _ => None,
        },
    }
}

/// Minimal structured-tier query: domain, key prefix and field conditions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredFilter {
    pub domain: Option<String>,
    pub key_prefix: Option<String>,
    pub conditions: Vec<FieldCondition>,
}

impl StructuredFilter {
    pub fn domain(domain: &str) -> Self {
        Self {
            domain: Some(domain.to_string()),
            ..Default::default()
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = Some(prefix.to_string());
        self
    }

    pub fn with_condition(mut self, condition: FieldCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn matches(&self, entry: &MemoryEntry) -> bool {
        if let Some(ref domain) = self.domain {
            if &entry.domain_tag != domain {
                return false;
            }
        }
        if let Some(ref prefix) = self.key_prefix {
            if !entry.key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        self.conditions.iter().all(|c| c.matches(&entry.payload))
    }
}

/// Per-backend counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierStats {
    pub reads: u64,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub deletes: u64,
}

#[derive(Debug, Default)]
pub(crate) struct TierCounters {
    reads: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl TierCounters {
    pub(crate) fn read(&self, hit: bool) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TierStats {
        TierStats {
            reads: self.reads.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

/// A storage backend
#[async_trait]
pub trait TierBackend: Send + Sync {
    fn tier(&self) -> Tier;

    /// Fetch a live (non-expired) entry
    async fn get(&self, key: &str) -> CoreResult<Option<MemoryEntry>>;

    /// Store an entry, replacing any previous entry for the key
    async fn put(&self, entry: MemoryEntry) -> CoreResult<()>;

    /// Remove an entry, returning whether it existed
    async fn delete(&self, key: &str) -> CoreResult<bool>;

    /// Remove the entry only if it was written before `stamp`
    async fn delete_older(&self, key: &str, stamp: u64) -> CoreResult<bool>;

    /// Rank stored embeddings by similarity to `embedding`
    async fn search_similar(
        &self,
        _embedding: &[f32],
        _domain: Option<&str>,
        _limit: usize,
    ) -> CoreResult<Vec<ScoredEntry>> {
        Ok(Vec::new())
    }

    /// Entries matching a structured filter
    async fn filter(&self, _filter: &StructuredFilter) -> CoreResult<Vec<MemoryEntry>> {
        Ok(Vec::new())
    }

    fn stats(&self) -> TierStats;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_clock_strictly_increasing() {
        let clock = WriteClock::new();
        let mut last = 0;
        for _ in 0..1000 {
            let stamp = clock.tick();
            assert!(stamp > last);
            last = stamp;
        }

        clock.observe(last + 1_000_000_000);
        assert!(clock.tick() > last + 1_000_000_000);
    }

    #[test]
    fn test_field_conditions() {
        let payload = Payload::Json(json!({"status": "open", "owner": {"team": "infra"}, "score": 7}));

        assert!(FieldCondition::eq("status", "open").matches(&payload));
        assert!(FieldCondition::eq("owner.team", "infra").matches(&payload));
        assert!(FieldCondition::ne("status", "closed").matches(&payload));
        assert!(FieldCondition::gt("score", 5).matches(&payload));
        assert!(!FieldCondition::lt("score", 5).matches(&payload));
        assert!(!FieldCondition::gt("missing", 1).matches(&payload));
        assert!(!FieldCondition::eq("status", "open").matches(&Payload::Bytes(vec![1, 2])));
    }

    #[test]
    fn test_structured_filter_matches() {
        let entry = MemoryEntry::new("ticket:1", Tier::Structured, Payload::Json(json!({"status": "open"})), "crm", 1);

        assert!(StructuredFilter::domain("crm").matches(&entry));
        assert!(!StructuredFilter::domain("billing").matches(&entry));
        assert!(StructuredFilter::default().with_prefix("ticket:").matches(&entry));
        assert!(!StructuredFilter::default()
            .with_condition(FieldCondition::eq("status", "closed"))
            .matches(&entry));
    }

    #[test]
    fn test_entry_ttl_expiry() {
        let entry = MemoryEntry::new("k", Tier::Cache, Payload::text("v"), "d", 1);
        assert!(!entry.is_expired());

        let expired = entry.clone().with_ttl(Duration::from_millis(0));
        assert!(expired.is_expired());
    }

    #[test]
    fn test_tier_parse_and_scope() {
        assert_eq!(Tier::parse("Vector"), Some(Tier::Vector));
        assert_eq!(Tier::parse("disk"), None);
        assert_eq!(Tier::Archival.scope(), "tier:archival");
    }
}
