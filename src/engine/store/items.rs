// ── kmem: Memory Items ──────────────────────────────────────────────────────
//
// Row-level access to `memory_items`. Content and embedding are sealed
// separately under the DEK; everything else is stored in the clear so rows
// can be filtered and ordered without decrypting them.
//

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use rusqlite::{params, OptionalExtension, Row};
use std::collections::BTreeSet;

use super::{parse_ts, ts, MemoryStore};
use crate::atoms::error::{CryptoError, EngineError, EngineResult};
use crate::atoms::types::{Candidate, CandidateSource, MemoryItem, MemoryType};
use crate::engine::ann::distance::cosine_similarity;
use crate::engine::crypto::CryptoModule;
use crate::engine::pii::safe_log_preview;

pub(super) const ITEM_COLUMNS: &str = "id, owner_id, memory_type, content_ct, content_iv, \
     embedding_ct, embedding_iv, salience, sensitive, usage_count, last_used_at, \
     cooldown_until, topic_tags, source, created_at, updated_at";

/// A `memory_items` row as stored: ciphertext still sealed.
pub(super) struct SealedRow {
    id: String,
    owner_id: String,
    memory_type: String,
    content_ct: Vec<u8>,
    content_iv: Vec<u8>,
    embedding_ct: Vec<u8>,
    embedding_iv: Vec<u8>,
    salience: f64,
    sensitive: bool,
    usage_count: i64,
    last_used_at: Option<String>,
    cooldown_until: Option<String>,
    topic_tags: String,
    source: String,
    created_at: String,
    updated_at: String,
}

impl SealedRow {
    /// Map a row selected with `ITEM_COLUMNS`.
    pub(super) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(SealedRow {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            memory_type: row.get(2)?,
            content_ct: row.get(3)?,
            content_iv: row.get(4)?,
            embedding_ct: row.get(5)?,
            embedding_iv: row.get(6)?,
            salience: row.get(7)?,
            sensitive: row.get(8)?,
            usage_count: row.get(9)?,
            last_used_at: row.get(10)?,
            cooldown_until: row.get(11)?,
            topic_tags: row.get(12)?,
            source: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }

    pub(super) fn open(self, crypto: &CryptoModule) -> EngineResult<MemoryItem> {
        let content = String::from_utf8(crypto.decrypt_content(&self.content_ct, &self.content_iv)?)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        let embedding = crypto.decrypt_embedding(&self.embedding_ct, &self.embedding_iv)?;
        let memory_type = self
            .memory_type
            .parse::<MemoryType>()
            .map_err(EngineError::Storage)?;
        let topic_tags: BTreeSet<String> = serde_json::from_str(&self.topic_tags)?;

        Ok(MemoryItem {
            id: self.id,
            owner_id: self.owner_id,
            memory_type,
            content,
            embedding,
            salience: self.salience as f32,
            sensitive: self.sensitive,
            usage_count: self.usage_count.max(0) as u64,
            last_used_at: self.last_used_at.as_deref().map(parse_ts).transpose()?,
            cooldown_until: self.cooldown_until.as_deref().map(parse_ts).transpose()?,
            topic_tags,
            source: self.source,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }

    pub(super) fn id(&self) -> &str {
        &self.id
    }

    /// Only the embedding, for index rebuilds.
    pub(super) fn open_embedding(&self, crypto: &CryptoModule) -> EngineResult<Vec<f32>> {
        Ok(crypto.decrypt_embedding(&self.embedding_ct, &self.embedding_iv)?)
    }
}

/// Encrypted column values for one item, ready to bind.
pub(super) struct SealedItem<'a> {
    pub item: &'a MemoryItem,
    content: (Vec<u8>, Vec<u8>),
    embedding: (Vec<u8>, Vec<u8>),
    tags: String,
}

impl<'a> SealedItem<'a> {
    pub(super) fn seal(crypto: &CryptoModule, item: &'a MemoryItem) -> EngineResult<Self> {
        Ok(SealedItem {
            item,
            content: crypto.encrypt_content(item.content.as_bytes())?,
            embedding: crypto.encrypt_embedding(&item.embedding)?,
            tags: serde_json::to_string(&item.topic_tags)?,
        })
    }

    pub(super) fn insert(&self, conn: &rusqlite::Connection) -> rusqlite::Result<usize> {
        let item = self.item;
        conn.execute(
            &format!(
                "INSERT INTO memory_items ({ITEM_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ),
            params![
                item.id,
                item.owner_id,
                item.memory_type.to_string(),
                self.content.0,
                self.content.1,
                self.embedding.0,
                self.embedding.1,
                item.salience as f64,
                item.sensitive,
                item.usage_count as i64,
                item.last_used_at.as_ref().map(ts),
                item.cooldown_until.as_ref().map(ts),
                self.tags,
                item.source,
                ts(&item.created_at),
                ts(&item.updated_at),
            ],
        )
    }
}

impl MemoryStore {
    // ── Write path ─────────────────────────────────────────────────────

    /// Persist a new item and index its embedding. Both land or neither does:
    /// the row's transaction commits only after the index accepted the vector.
    pub fn put(&self, crypto: &CryptoModule, item: &MemoryItem) -> EngineResult<()> {
        self.check_dimension(&item.embedding)?;
        let sealed = SealedItem::seal(crypto, item)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        sealed.insert(&tx)?;
        self.index.write().insert(&item.id, &item.embedding)?;
        if let Err(e) = tx.commit() {
            self.index.write().remove(&item.id);
            return Err(e.into());
        }

        debug!(
            "[kmem-store] Stored {} for {} ({})",
            item.id,
            item.owner_id,
            safe_log_preview(&item.content, 40)
        );
        Ok(())
    }

    /// Remove an item owned by `owner_id`. Returns whether a row was deleted.
    pub fn delete(&self, owner_id: &str, item_id: &str) -> EngineResult<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let n = tx.execute(
            "DELETE FROM memory_items WHERE id = ?1 AND owner_id = ?2",
            params![item_id, owner_id],
        )?;
        tx.commit()?;
        if n > 0 {
            self.index.write().remove(item_id);
        }
        Ok(n > 0)
    }

    /// `usage_count += 1`, `last_used_at = now`, and push `cooldown_until`
    /// forward to `now + cooldown` (never backwards). A zero cooldown leaves
    /// `cooldown_until` alone.
    pub fn update_usage(&self, item_id: &str, now: DateTime<Utc>, cooldown: Duration) -> EngineResult<()> {
        let conn = self.conn.lock();
        let n = if cooldown > Duration::zero() {
            let until = ts(&(now + cooldown));
            conn.execute(
                "UPDATE memory_items
                 SET usage_count = usage_count + 1,
                     last_used_at = ?2,
                     updated_at = ?2,
                     cooldown_until = CASE
                         WHEN cooldown_until IS NULL OR cooldown_until < ?3 THEN ?3
                         ELSE cooldown_until END
                 WHERE id = ?1",
                params![item_id, ts(&now), until],
            )?
        } else {
            conn.execute(
                "UPDATE memory_items
                 SET usage_count = usage_count + 1, last_used_at = ?2, updated_at = ?2
                 WHERE id = ?1",
                params![item_id, ts(&now)],
            )?
        };
        if n == 0 {
            return Err(EngineError::NotFound(format!("memory {item_id}")));
        }
        Ok(())
    }

    pub fn clear_cooldown(&self, item_id: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE memory_items SET cooldown_until = NULL WHERE id = ?1",
            params![item_id],
        )?;
        if n == 0 {
            return Err(EngineError::NotFound(format!("memory {item_id}")));
        }
        Ok(())
    }

    // ── Read path ──────────────────────────────────────────────────────

    fn sealed_row(&self, item_id: &str) -> EngineResult<Option<SealedRow>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {ITEM_COLUMNS} FROM memory_items WHERE id = ?1"))?;
        let row = stmt.query_row(params![item_id], SealedRow::from_row).optional()?;
        Ok(row)
    }

    pub fn get(&self, crypto: &CryptoModule, owner_id: &str, item_id: &str) -> EngineResult<Option<MemoryItem>> {
        match self.sealed_row(item_id)? {
            Some(row) if row.owner_id == owner_id => Ok(Some(row.open(crypto)?)),
            _ => Ok(None),
        }
    }

    /// Index shortlist for `owner_id`, decrypted. Over-fetches adaptively when
    /// other owners' vectors crowd the shortlist. An index that is missing
    /// rows, or a hit with no row, surfaces as an error so the caller can fall
    /// back and rebuild.
    pub fn get_candidates(
        &self,
        crypto: &CryptoModule,
        owner_id: &str,
        query: &[f32],
        limit: usize,
    ) -> EngineResult<Vec<Candidate>> {
        if !crypto.is_unlocked() {
            return Err(CryptoError::Locked.into());
        }
        if !self.index_in_sync()? {
            return Err(EngineError::Storage("index not built".into()));
        }
        let indexed = self.index.read().len();
        let mut k = limit;
        loop {
            let hits = self.index.read().search(query, k)?;
            let exhausted = hits.len() < k || k >= indexed;

            let mut rows = Vec::with_capacity(hits.len());
            for (id, similarity) in &hits {
                match self.sealed_row(id)? {
                    Some(row) if row.owner_id == owner_id => rows.push((row, *similarity)),
                    Some(_) => {}
                    None => {
                        warn!("[kmem-store] Index drift: {} has no row", id);
                        return Err(EngineError::Storage(format!("index drift at {id}")));
                    }
                }
            }

            if rows.len() >= limit || exhausted {
                rows.truncate(limit);
                return rows
                    .into_iter()
                    .map(|(row, similarity)| {
                        Ok(Candidate {
                            item: row.open(crypto)?,
                            similarity,
                            source: CandidateSource::LocalSearch,
                        })
                    })
                    .collect();
            }
            k = k.saturating_mul(2);
        }
    }

    /// Exhaustive fallback: the owner's most recent `scan_limit` rows, scored
    /// by exact cosine similarity. Rows that no longer decrypt are skipped.
    pub fn scan_candidates(
        &self,
        crypto: &CryptoModule,
        owner_id: &str,
        query: &[f32],
        scan_limit: usize,
    ) -> EngineResult<Vec<Candidate>> {
        if !crypto.is_unlocked() {
            return Err(CryptoError::Locked.into());
        }
        self.check_dimension(query)?;
        let rows: Vec<SealedRow> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {ITEM_COLUMNS} FROM memory_items
                 WHERE owner_id = ?1 ORDER BY created_at DESC, id LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![owner_id, scan_limit as i64], SealedRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id().to_string();
            match row.open(crypto) {
                Ok(item) => candidates.push(Candidate {
                    similarity: cosine_similarity(query, &item.embedding),
                    item,
                    source: CandidateSource::FallbackSearch,
                }),
                Err(e) => warn!("[kmem-store] Skipping unreadable row {}: {}", id, e),
            }
        }
        candidates.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        Ok(candidates)
    }

    /// Every row of `owner_id`, oldest first.
    pub fn owner_items(&self, crypto: &CryptoModule, owner_id: &str) -> EngineResult<Vec<MemoryItem>> {
        let rows: Vec<SealedRow> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {ITEM_COLUMNS} FROM memory_items WHERE owner_id = ?1 ORDER BY created_at, id"
            ))?;
            let rows = stmt
                .query_map(params![owner_id], SealedRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(|row| row.open(crypto)).collect()
    }
}
