//! Structured Tier
//!
//! SQLite-backed durable rows. Supports the minimal key/filter contract:
//! lookups by key, and scans by domain + key prefix + JSON field conditions.
//! Swarm run and subtask records live here.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{MemoryEntry, Payload, StructuredFilter, Tier, TierBackend, TierCounters, TierStats};
use crate::error::CoreResult;

/// Serialize embedding to bytes for SQLite BLOB storage
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Deserialize embedding from bytes
pub fn embedding_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// SQLite structured tier
pub struct StructuredTier {
    conn: Mutex<Connection>,
    counters: Arc<TierCounters>,
}

impl StructuredTier {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> CoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let tier = Self::from_connection(conn)?;
        info!("Structured tier opened: {}", path.display());
        Ok(tier)
    }

    /// Private in-memory database (tests, ephemeral deployments)
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> CoreResult<Self> {
        let tier = Self {
            conn: Mutex::new(conn),
            counters: Default::default(),
        };
        tier.init_schema()?;
        Ok(tier)
    }

    fn init_schema(&self) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                key TEXT PRIMARY KEY,
                domain TEXT NOT NULL,
                entity_key TEXT,
                payload TEXT NOT NULL,
                embedding BLOB,
                ttl_ms INTEGER,
                expires_at INTEGER,
                written_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_entries_domain ON entries(domain);
            CREATE INDEX IF NOT EXISTS idx_entries_entity ON entries(entity_key);
            CREATE INDEX IF NOT EXISTS idx_entries_expires ON entries(expires_at)
                WHERE expires_at IS NOT NULL;
            "#,
        )?;
        Ok(())
    }

    /// Delete expired rows, returning how many were removed
    pub fn purge_expired(&self) -> CoreResult<usize> {
        let now = chrono::Utc::now().timestamp_millis();
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now],
        )?;
        if removed > 0 {
            debug!("Purged {} expired structured entries", removed);
        }
        Ok(removed)
    }

    /// Delete `key` only if its stored row is still expired
    ///
    /// A row rewritten after the caller saw it expire is left alone.
    pub fn purge_expired_key(&self, key: &str) -> CoreResult<bool> {
        let now = chrono::Utc::now().timestamp_millis();
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM entries WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
            params![key, now],
        )?;
        Ok(removed > 0)
    }

    pub fn count(&self) -> CoreResult<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<(MemoryEntry, String)> {
        let payload_json: String = row.get(2)?;
        let embedding: Option<Vec<u8>> = row.get(3)?;
        let ttl_ms: Option<i64> = row.get(4)?;
        let written_at: i64 = row.get(6)?;

        let entry = MemoryEntry {
            key: row.get(0)?,
            tier_origin: Tier::Structured,
            // Decoded by the caller so a bad row surfaces as a serialization error
            payload: Payload::Bytes(Vec::new()),
            embedding: embedding.map(|b| embedding_from_bytes(&b)),
            ttl: ttl_ms.map(|ms| Duration::from_millis(ms.max(0) as u64)),
            domain_tag: row.get(1)?,
            entity_key: row.get(7)?,
            written_at: written_at.max(0) as u64,
            expires_at: row.get(5)?,
        };
        Ok((entry, payload_json))
    }

    fn decode((mut entry, payload_json): (MemoryEntry, String)) -> CoreResult<MemoryEntry> {
        entry.payload = serde_json::from_str(&payload_json)?;
        Ok(entry)
    }
}

#[async_trait]
impl TierBackend for StructuredTier {
    fn tier(&self) -> Tier {
        Tier::Structured
    }

    async fn get(&self, key: &str) -> CoreResult<Option<MemoryEntry>> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                r#"
                SELECT key, domain, payload, embedding, ttl_ms, expires_at, written_at, entity_key
                FROM entries WHERE key = ?1
                "#,
                params![key],
                Self::row_to_entry,
            )
            .optional()?
        };

        let entry = match row {
            Some(row) => Some(Self::decode(row)?),
            None => None,
        };

        let entry = match entry {
            Some(e) if e.is_expired() => {
                self.purge_expired_key(key)?;
                None
            }
            other => other,
        };

        self.counters.read(entry.is_some());
        Ok(entry)
    }

    async fn put(&self, entry: MemoryEntry) -> CoreResult<()> {
        let payload = serde_json::to_string(&entry.payload)?;
        let embedding = entry.embedding.as_deref().map(embedding_to_bytes);
        let ttl_ms = entry.ttl.map(|t| t.as_millis() as i64);

        {
            let conn = self.conn.lock();
            // Last write wins: an older stamp never replaces a newer row
            conn.execute(
                r#"
                INSERT INTO entries (key, domain, payload, embedding, ttl_ms, expires_at, written_at, entity_key)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(key) DO UPDATE SET
                    domain = excluded.domain,
                    entity_key = excluded.entity_key,
                    payload = excluded.payload,
                    embedding = excluded.embedding,
                    ttl_ms = excluded.ttl_ms,
                    expires_at = excluded.expires_at,
                    written_at = excluded.written_at
                WHERE excluded.written_at > entries.written_at
                "#,
                params![
                    entry.key,
                    entry.domain_tag,
                    payload,
                    embedding,
                    ttl_ms,
                    entry.expires_at,
                    entry.written_at as i64,
                    entry.entity_key
                ],
            )?;
        }

        self.counters.write();
        debug!("Structured PUT: {} ({})", entry.key, entry.domain_tag);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CoreResult<bool> {
        let removed = {
            let conn = self.conn.lock();
            conn.execute("DELETE FROM entries WHERE key = ?1", params![key])?
        };
        self.counters.delete();
        Ok(removed > 0)
    }

    async fn delete_older(&self, key: &str, stamp: u64) -> CoreResult<bool> {
        let removed = {
            let conn = self.conn.lock();
            conn.execute(
                "DELETE FROM entries WHERE key = ?1 AND written_at < ?2",
                params![key, stamp as i64],
            )?
        };
        if removed > 0 {
            self.counters.delete();
        }
        Ok(removed > 0)
    }

    async fn filter(&self, filter: &StructuredFilter) -> CoreResult<Vec<MemoryEntry>> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                r#"
                SELECT key, domain, payload, embedding, ttl_ms, expires_at, written_at, entity_key
                FROM entries
                WHERE (?1 IS NULL OR domain = ?1)
                  AND (?2 IS NULL OR substr(key, 1, length(?2)) = ?2)
                ORDER BY key
                "#,
            )?;
            let rows = stmt
                .query_map(params![filter.domain, filter.key_prefix], Self::row_to_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let entry = Self::decode(row)?;
            if !entry.is_expired() && filter.matches(&entry) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    fn stats(&self) -> TierStats {
        self.counters.snapshot()
    }
}
