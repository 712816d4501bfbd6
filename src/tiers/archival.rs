//! Archival Tier
//!
//! One JSON document per key under a directory, named by the SHA-256 of the
//! key. Writes go to a temp file and are renamed into place, so a reader never
//! sees a torn document.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{MemoryEntry, StructuredFilter, Tier, TierBackend, TierCounters, TierStats};
use crate::error::{CoreError, CoreResult};

/// File-backed archival tier
pub struct ArchivalTier {
    root: PathBuf,
    /// Serializes read-compare-rename so last-write-wins holds per key
    write_lock: Mutex<()>,
    counters: Arc<TierCounters>,
}

impl ArchivalTier {
    /// Open an archive rooted at `root`, creating the directory if needed
    pub async fn open(root: &Path) -> CoreResult<Self> {
        tokio::fs::create_dir_all(root).await?;
        info!("Archival tier opened: {}", root.display());

        Ok(Self {
            root: root.to_path_buf(),
            write_lock: Mutex::new(()),
            counters: Default::default(),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        self.root.join(format!("{}.json", hex::encode(hasher.finalize())))
    }

    async fn read_entry(&self, path: &Path) -> CoreResult<Option<MemoryEntry>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::storage(Tier::Archival, e.to_string())),
        }
    }
}

#[async_trait]
impl TierBackend for ArchivalTier {
    fn tier(&self) -> Tier {
        Tier::Archival
    }

    async fn get(&self, key: &str) -> CoreResult<Option<MemoryEntry>> {
        let entry = self
            .read_entry(&self.path_for(key))
            .await?
            .filter(|e| e.key == key && !e.is_expired());
        self.counters.read(entry.is_some());
        Ok(entry)
    }

    async fn put(&self, entry: MemoryEntry) -> CoreResult<()> {
        let path = self.path_for(&entry.key);
        let bytes = serde_json::to_vec(&entry)?;

        let _guard = self.write_lock.lock().await;
        if let Some(existing) = self.read_entry(&path).await? {
            if existing.written_at >= entry.written_at {
                debug!("Archival PUT skipped, newer entry exists: {}", entry.key);
                return Ok(());
            }
        }

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        self.counters.write();
        debug!("Archival PUT: {} ({} bytes)", entry.key, bytes.len());
        Ok(())
    }

    async fn delete(&self, key: &str) -> CoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        self.counters.delete();
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_older(&self, key: &str, stamp: u64) -> CoreResult<bool> {
        let path = self.path_for(key);
        let _guard = self.write_lock.lock().await;
        match self.read_entry(&path).await? {
            Some(existing) if existing.written_at < stamp => {
                self.counters.delete();
                tokio::fs::remove_file(&path).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Full directory walk; the archive keeps no secondary index
    async fn filter(&self, filter: &StructuredFilter) -> CoreResult<Vec<MemoryEntry>> {
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        let mut entries = Vec::new();

        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_entry(&path).await {
                Ok(Some(entry)) if !entry.is_expired() && filter.matches(&entry) => entries.push(entry),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable archive file {}: {}", path.display(), e),
            }
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    fn stats(&self) -> TierStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiers::Payload;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let tier = ArchivalTier::open(dir.path()).await.unwrap();

        let payload = Payload::Bytes(vec![7u8; 4096]);
        tier.put(MemoryEntry::new("blob:1", Tier::Archival, payload.clone(), "docs", 5))
            .await
            .unwrap();

        let loaded = tier.get("blob:1").await.unwrap().unwrap();
        assert_eq!(loaded.payload, payload);
        assert!(tier.get("blob:2").await.unwrap().is_none());

        assert!(tier.delete("blob:1").await.unwrap());
        assert!(!tier.delete("blob:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let dir = TempDir::new().unwrap();
        let tier = ArchivalTier::open(dir.path()).await.unwrap();

        tier.put(MemoryEntry::new("k", Tier::Archival, Payload::text("new"), "d", 20))
            .await
            .unwrap();
        tier.put(MemoryEntry::new("k", Tier::Archival, Payload::text("old"), "d", 10))
            .await
            .unwrap();

        let loaded = tier.get("k").await.unwrap().unwrap();
        assert_eq!(loaded.payload, Payload::text("new"));
        assert_eq!(tier.stats().writes, 1);
    }

    #[tokio::test]
    async fn test_filter_walks_directory() {
        let dir = TempDir::new().unwrap();
        let tier = ArchivalTier::open(dir.path()).await.unwrap();

        for (key, domain) in [("run/1", "runs"), ("run/2", "runs"), ("doc/1", "docs")] {
            tier.put(MemoryEntry::new(key, Tier::Archival, Payload::text(key), domain, 1))
                .await
                .unwrap();
        }

        let runs = tier.filter(&StructuredFilter::domain("runs")).await.unwrap();
        let keys: Vec<&str> = runs.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["run/1", "run/2"]);
    }
}
