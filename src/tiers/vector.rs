//! Vector Tier
//!
//! In-memory embedding index with brute-force cosine similarity. Embeddings are
//! supplied by callers; this tier never generates them.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use super::{MemoryEntry, ScoredEntry, Tier, TierBackend, TierCounters, TierStats};
use crate::error::{CoreError, CoreResult};

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Semantic tier over caller-provided embeddings
pub struct VectorTier {
    entries: RwLock<HashMap<String, MemoryEntry>>,
    /// Fixed on first insert unless configured up front
    dimension: RwLock<Option<usize>>,
    counters: Arc<TierCounters>,
}

impl VectorTier {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            dimension: RwLock::new(None),
            counters: Default::default(),
        }
    }

    /// Create an index that only accepts embeddings of `dimension`
    pub fn with_dimension(dimension: usize) -> Self {
        let tier = Self::new();
        *tier.dimension.write() = Some(dimension);
        tier
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn check_dimension(&self, len: usize) -> CoreResult<()> {
        let mut dimension = self.dimension.write();
        match *dimension {
            Some(expected) if expected != len => {
                warn!("Embedding dimension mismatch: expected {}, got {}", expected, len);
                Err(CoreError::InvalidInput(format!(
                    "embedding dimension mismatch: expected {}, got {}",
                    expected, len
                )))
            }
            Some(_) => Ok(()),
            None => {
                *dimension = Some(len);
                Ok(())
            }
        }
    }
}

impl Default for VectorTier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TierBackend for VectorTier {
    fn tier(&self) -> Tier {
        Tier::Vector
    }

    async fn get(&self, key: &str) -> CoreResult<Option<MemoryEntry>> {
        let entry = self.entries.read().get(key).filter(|e| !e.is_expired()).cloned();
        self.counters.read(entry.is_some());
        Ok(entry)
    }

    async fn put(&self, entry: MemoryEntry) -> CoreResult<()> {
        let len = match entry.embedding {
            Some(ref embedding) if !embedding.is_empty() => embedding.len(),
            _ => {
                return Err(CoreError::InvalidInput(format!(
                    "entry {} has no embedding",
                    entry.key
                )))
            }
        };
        self.check_dimension(len)?;

        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&entry.key) {
            if existing.written_at >= entry.written_at {
                return Ok(());
            }
        }
        self.counters.write();
        entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CoreResult<bool> {
        self.counters.delete();
        Ok(self.entries.write().remove(key).is_some())
    }

    async fn delete_older(&self, key: &str, stamp: u64) -> CoreResult<bool> {
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(existing) if existing.written_at < stamp => {
                self.counters.delete();
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn search_similar(
        &self,
        embedding: &[f32],
        domain: Option<&str>,
        limit: usize,
    ) -> CoreResult<Vec<ScoredEntry>> {
        let entries = self.entries.read();
        let mut results: Vec<ScoredEntry> = entries
            .values()
            .filter(|e| !e.is_expired())
            .filter(|e| domain.map(|d| e.domain_tag == d).unwrap_or(true))
            .filter_map(|e| {
                e.embedding.as_ref().map(|emb| ScoredEntry {
                    entry: e.clone(),
                    score: cosine_similarity(embedding, emb),
                })
            })
            .collect();

        // Sort by similarity (descending), key as a stable tie-break
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entry.key.cmp(&b.entry.key))
        });
        results.truncate(limit);
        Ok(results)
    }

    fn stats(&self) -> TierStats {
        self.counters.snapshot()
    }
}
