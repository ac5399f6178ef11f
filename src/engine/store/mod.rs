// ── kmem: Memory Store ──────────────────────────────────────────────────────
//
// Durable encrypted item storage in SQLite via rusqlite, plus the in-memory
// vector index that shadows it.
//
// The SQLite rows are the source of truth; the index is a rebuildable cache
// holding plaintext (normalized) embeddings and is cleared whenever the engine
// locks.
//
// Module layout:
//   schema  idempotent migrations
//   items   put/get/delete, candidate loading, usage + cooldown updates
//   bulk    snapshot export/import and index rebuilds
//
// Everything else here: opening, stats, the wrapped-key record and the
// key/value `engine_meta` table.

mod bulk;
mod items;
pub(crate) mod schema;

use chrono::{DateTime, SecondsFormat, Utc};
use log::info;
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;

use crate::atoms::constants::{
    META_DEVICE_ID, META_SYNC_STATS, STORAGE_ENGINE_ID, WRAPPED_DEK_RECORD,
};
use crate::atoms::crypto_types::WrappedDek;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{AnnStats, EngineStats, SyncStats};
use crate::engine::ann::VectorIndex;
use crate::engine::config::{AnnConfig, EngineConfig};
use crate::engine::paths;

/// Timestamps are stored as fixed-width RFC 3339 so text order is time order.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_ts(s: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| EngineError::Storage(format!("bad timestamp '{s}': {e}")))
}

/// SQLite store + vector index.
pub struct MemoryStore {
    pub(crate) conn: Mutex<Connection>,
    index: RwLock<VectorIndex>,
    /// Rows the last rebuild or import could not decrypt into the index.
    unindexed: AtomicU64,
    ann_config: AnnConfig,
    dimension: usize,
    db_path: Option<PathBuf>,
}

impl MemoryStore {
    /// Open (or create) the database described by `config` and run migrations.
    pub fn open(config: &EngineConfig) -> EngineResult<Self> {
        let (conn, db_path) = if config.storage.in_memory {
            (Connection::open_in_memory()?, None)
        } else {
            let path = paths::db_path(&config.storage)?;
            info!("[kmem-store] Opening store at {:?}", path);
            (Connection::open(&path)?, Some(path))
        };

        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        // Freed pages are zeroed so deleted ciphertext does not linger.
        conn.execute_batch("PRAGMA secure_delete = ON;").ok();
        conn.execute_batch("PRAGMA foreign_keys = ON;").ok();

        schema::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            index: RwLock::new(VectorIndex::new(
                config.ann.clone(),
                config.embedding.dimension,
            )),
            unindexed: AtomicU64::new(0),
            ann_config: config.ann.clone(),
            dimension: config.embedding.dimension,
            db_path,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub(crate) fn check_dimension(&self, vector: &[f32]) -> EngineResult<()> {
        if vector.len() != self.dimension {
            return Err(EngineError::dimension(self.dimension, vector.len()));
        }
        Ok(())
    }

    // ── Stats ──────────────────────────────────────────────────────────

    pub fn stats(&self) -> EngineResult<EngineStats> {
        let conn = self.conn.lock();
        let (items, owners, sensitive): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT owner_id), COALESCE(SUM(sensitive), 0)
             FROM memory_items",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;
        Ok(EngineStats {
            item_count: items as u64,
            owner_count: owners as u64,
            sensitive_count: sensitive as u64,
            storage_engine: STORAGE_ENGINE_ID.to_string(),
            db_path: self.db_path.as_ref().map(|p| p.display().to_string()),
        })
    }

    pub fn item_count(&self) -> EngineResult<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM memory_items", [], |r| r.get(0))?;
        Ok(n as u64)
    }

    pub fn ann_stats(&self) -> AnnStats {
        self.index.read().stats()
    }

    // ── Wrapped key record ─────────────────────────────────────────────

    pub fn save_wrapped_dek(&self, record: &WrappedDek) -> EngineResult<()> {
        let json = serde_json::to_string(record)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO key_records (name, record, updated_at) VALUES (?1, ?2, ?3)",
            params![WRAPPED_DEK_RECORD, json, ts(&Utc::now())],
        )?;
        Ok(())
    }

    pub fn load_wrapped_dek(&self) -> EngineResult<Option<WrappedDek>> {
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT record FROM key_records WHERE name = ?1",
                params![WRAPPED_DEK_RECORD],
                |r| r.get(0),
            )
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    // ── engine_meta ────────────────────────────────────────────────────

    pub fn get_meta(&self, key: &str) -> EngineResult<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT value FROM engine_meta WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()?)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO engine_meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// The configured device id, else the persisted one, else a fresh UUID
    /// that is persisted for next time.
    pub fn device_id(&self, configured: Option<&str>) -> EngineResult<String> {
        if let Some(id) = configured {
            return Ok(id.to_string());
        }
        if let Some(id) = self.get_meta(META_DEVICE_ID)? {
            return Ok(id);
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.set_meta(META_DEVICE_ID, &id)?;
        info!("[kmem-store] Generated device id {}", id);
        Ok(id)
    }

    pub fn sync_stats(&self) -> EngineResult<SyncStats> {
        match self.get_meta(META_SYNC_STATS)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(SyncStats::default()),
        }
    }

    /// Read-modify-write of the sync counters.
    pub fn update_sync_stats(&self, f: impl FnOnce(&mut SyncStats)) -> EngineResult<SyncStats> {
        let mut stats = self.sync_stats()?;
        f(&mut stats);
        self.set_meta(META_SYNC_STATS, &serde_json::to_string(&stats)?)?;
        Ok(stats)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn wrapped_dek_persists() {
        let store = store();
        assert!(store.load_wrapped_dek().unwrap().is_none());
        let crypto = unlocked_crypto();
        let record = crypto.wrapped_dek().cloned().unwrap();
        store.save_wrapped_dek(&record).unwrap();
        assert_eq!(store.load_wrapped_dek().unwrap(), Some(record));
    }

    #[test]
    fn device_id_is_stable() {
        let store = store();
        let first = store.device_id(None).unwrap();
        assert_eq!(store.device_id(None).unwrap(), first);
        assert_eq!(store.device_id(Some("laptop")).unwrap(), "laptop");
    }

    #[test]
    fn sync_stats_accumulate() {
        let store = store();
        store.update_sync_stats(|s| s.snapshots_exported += 1).unwrap();
        let stats = store.update_sync_stats(|s| s.snapshots_exported += 1).unwrap();
        assert_eq!(stats.snapshots_exported, 2);
        assert_eq!(store.sync_stats().unwrap().snapshots_exported, 2);
    }

    #[test]
    fn empty_store_stats() {
        let stats = store().stats().unwrap();
        assert_eq!(stats.item_count, 0);
        assert_eq!(stats.storage_engine, "sqlite");
        assert!(stats.db_path.is_none());
    }

    #[test]
    fn timestamps_sort_as_text() {
        let a = Utc::now();
        let b = a + chrono::Duration::milliseconds(1);
        assert!(ts(&a) < ts(&b));
        assert_eq!(parse_ts(&ts(&a)).unwrap(), a);
    }
}
