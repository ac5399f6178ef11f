// ── kmem: Snapshot Export/Import & Index Maintenance ───────────────────────
//
// Snapshots are per owner. Import is staged: verify signature → open blocks →
// check integrity hash → parse + validate every record → build the new index.
// Only then does one transaction replace that owner's rows, after which the
// staged index is swapped in. Rows of other owners stay as they are. Any
// failure before the commit leaves rows, index and key untouched.

use chrono::Utc;
use log::{debug, info, warn};
use rusqlite::params;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use zeroize::Zeroizing;

use super::items::{SealedItem, SealedRow, ITEM_COLUMNS};
use super::{ts, MemoryStore};
use crate::atoms::constants::{SNAPSHOT_FORMAT_VERSION, WRAPPED_DEK_RECORD};
use crate::atoms::crypto_types::{
    EncryptedSnapshot, EncryptedSnapshotHeader, EncryptedSnapshotPayload, WrappedDek,
};
use crate::atoms::error::{CryptoError, EngineError, EngineResult, FormatError};
use crate::atoms::types::{AnnStats, ExportOptions, ImportReport, MemoryItem};
use crate::engine::ann::{AnnGraph, VectorIndex};
use crate::engine::crypto::{digest_eq, CryptoModule};
use crate::engine::snapshot;

/// SHA-256 over the plaintext blocks, each tagged present/absent and
/// length-prefixed so block boundaries are unambiguous.
pub(crate) fn integrity_hash(memories: &[u8], ann_index: Option<&[u8]>, ann_metadata: Option<&[u8]>) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for block in [Some(memories), ann_index, ann_metadata] {
        match block {
            Some(bytes) => {
                hasher.update([1u8]);
                hasher.update((bytes.len() as u64).to_le_bytes());
                hasher.update(bytes);
            }
            None => hasher.update([0u8]),
        }
    }
    hasher.finalize().to_vec()
}

fn malformed(msg: impl Into<String>) -> EngineError {
    EngineError::Format(FormatError::Malformed(msg.into()))
}

/// A fully verified snapshot waiting to replace its owner's rows.
pub(crate) struct StagedImport {
    header: EncryptedSnapshotHeader,
    items: Vec<MemoryItem>,
    index: VectorIndex,
    unindexed: u64,
}

impl MemoryStore {
    // ── Export ─────────────────────────────────────────────────────────

    pub fn export_all(
        &self,
        crypto: &CryptoModule,
        owner_id: &str,
        options: &ExportOptions,
    ) -> EngineResult<EncryptedSnapshot> {
        let wrapped = crypto.wrapped_dek().ok_or(CryptoError::NotInitialized)?;
        if !crypto.is_unlocked() {
            return Err(CryptoError::Locked.into());
        }

        let items = self.owner_items(crypto, owner_id)?;
        let memories = Zeroizing::new(serde_json::to_vec(&items)?);

        let (ann_index, ann_metadata) = if options.include_index {
            let (graph, stats) = self.owner_graph(&items)?;
            (
                Some(Zeroizing::new(serde_json::to_vec(&graph)?)),
                Some(serde_json::to_vec(&stats)?),
            )
        } else {
            (None, None)
        };

        let integrity = integrity_hash(
            &memories,
            ann_index.as_ref().map(|b| b.as_slice()),
            ann_metadata.as_deref(),
        );

        let now = Utc::now();
        let payload = EncryptedSnapshotPayload {
            memories: crypto.seal_packed(&memories)?,
            ann_index: ann_index.as_ref().map(|b| crypto.seal_packed(b)).transpose()?,
            ann_metadata: ann_metadata.as_deref().map(|b| crypto.seal_packed(b)).transpose()?,
            wrapped_dek: serde_json::to_vec(wrapped)?,
            timestamp: now.timestamp_millis(),
            integrity_hash: integrity,
        };
        let header = EncryptedSnapshotHeader {
            version: SNAPSHOT_FORMAT_VERSION,
            item_count: items.len() as u64,
            created_at: now,
            owner_id: owner_id.to_string(),
        };
        let signature = crypto.sign(&snapshot::signing_input(&header, &payload)?)?;

        info!(
            "[kmem-store] Exported {} items for {} (index: {})",
            items.len(),
            owner_id,
            options.include_index
        );
        Ok(EncryptedSnapshot {
            header,
            payload,
            signature,
        })
    }

    /// Graph over exactly `items`: the live index when it holds nothing else,
    /// otherwise a throwaway build.
    fn owner_graph(&self, items: &[MemoryItem]) -> EngineResult<(AnnGraph, AnnStats)> {
        {
            let index = self.index.read();
            if index.len() == items.len() && items.iter().all(|i| index.contains(&i.id)) {
                return Ok((index.export(), index.stats()));
            }
        }
        let staged = VectorIndex::build(
            self.ann_config.clone(),
            self.dimension,
            items
                .iter()
                .map(|i| (i.id.clone(), i.embedding.clone()))
                .collect(),
        )?;
        Ok((staged.export(), staged.stats()))
    }

    // ── Import ─────────────────────────────────────────────────────────

    /// Verify, decrypt and validate `snapshot` with `crypto`, then replace
    /// the snapshot owner's rows with its contents. `adopt_key` is persisted
    /// in the same transaction when the snapshot brings its own key.
    pub fn import_all(
        &self,
        crypto: &CryptoModule,
        snapshot: &EncryptedSnapshot,
        adopt_key: Option<&WrappedDek>,
    ) -> EngineResult<ImportReport> {
        self.import_resealed(crypto, crypto, snapshot, adopt_key)
    }

    /// Like [`import_all`](Self::import_all), but the snapshot is opened with
    /// `open` and its rows are stored sealed under `seal`.
    pub fn import_resealed(
        &self,
        open: &CryptoModule,
        seal: &CryptoModule,
        snapshot: &EncryptedSnapshot,
        adopt_key: Option<&WrappedDek>,
    ) -> EngineResult<ImportReport> {
        let staged = self.prepare_import(open, seal, snapshot)?;
        self.commit_import(seal, staged, adopt_key)
    }

    pub(crate) fn prepare_import(
        &self,
        open: &CryptoModule,
        seal: &CryptoModule,
        snapshot: &EncryptedSnapshot,
    ) -> EngineResult<StagedImport> {
        if !open.is_unlocked() || !seal.is_unlocked() {
            return Err(CryptoError::Locked.into());
        }
        let signed = snapshot::signing_input(&snapshot.header, &snapshot.payload)?;
        open.verify(&signed, &snapshot.signature)?;

        let payload = &snapshot.payload;
        let memories = Zeroizing::new(open.open_packed(&payload.memories)?);
        let ann_index = payload
            .ann_index
            .as_deref()
            .map(|b| open.open_packed(b))
            .transpose()?
            .map(Zeroizing::new);
        let ann_metadata = payload
            .ann_metadata
            .as_deref()
            .map(|b| open.open_packed(b))
            .transpose()?;

        let expected = integrity_hash(
            &memories,
            ann_index.as_ref().map(|b| b.as_slice()),
            ann_metadata.as_deref(),
        );
        if !digest_eq(&expected, &payload.integrity_hash) {
            return Err(CryptoError::IntegrityCheckFailed.into());
        }

        let items: Vec<MemoryItem> = serde_json::from_slice(&memories)
            .map_err(|e| malformed(format!("memories: {e}")))?;
        self.validate_items(&snapshot.header, &items)?;

        if let Some(meta) = ann_metadata.as_deref() {
            match serde_json::from_slice::<AnnStats>(meta) {
                Ok(stats) => debug!(
                    "[kmem-store] Snapshot index metadata: {} elements",
                    stats.current_elements
                ),
                Err(e) => warn!("[kmem-store] Ignoring unreadable index metadata: {}", e),
            }
        }

        let others = self.load_vectors(seal, Some(&snapshot.header.owner_id))?;
        {
            let taken = others.ids();
            if let Some(item) = items.iter().find(|i| taken.contains(i.id.as_str())) {
                return Err(malformed(format!(
                    "item {} already belongs to another owner",
                    item.id
                )));
            }
        }

        let index = self.stage_index(
            &items,
            ann_index.as_ref().map(|b| b.as_slice()),
            others.vectors,
        )?;
        Ok(StagedImport {
            header: snapshot.header.clone(),
            items,
            index,
            unindexed: others.unreadable.len() as u64,
        })
    }

    fn validate_items(&self, header: &EncryptedSnapshotHeader, items: &[MemoryItem]) -> EngineResult<()> {
        if items.len() as u64 != header.item_count {
            return Err(malformed(format!(
                "header declares {} items, payload holds {}",
                header.item_count,
                items.len()
            )));
        }
        let mut seen: HashSet<&str> = HashSet::with_capacity(items.len());
        for item in items {
            if item.owner_id != header.owner_id {
                return Err(malformed(format!("item {} belongs to another owner", item.id)));
            }
            if item.id.is_empty() || !seen.insert(item.id.as_str()) {
                return Err(malformed(format!("duplicate or empty item id '{}'", item.id)));
            }
            self.check_dimension(&item.embedding)?;
            if item.embedding.iter().any(|x| !x.is_finite()) {
                return Err(malformed(format!("item {} has a non-finite embedding", item.id)));
            }
            if !(0.0..=1.0).contains(&item.salience) {
                return Err(malformed(format!("item {} has salience {}", item.id, item.salience)));
            }
        }
        Ok(())
    }

    /// The exported graph is used only when the snapshot owner is alone on
    /// the device and it matches the items; otherwise the index is built over
    /// the imported items plus `others`.
    fn stage_index(
        &self,
        items: &[MemoryItem],
        graph: Option<&[u8]>,
        others: Vec<(String, Vec<f32>)>,
    ) -> EngineResult<VectorIndex> {
        if let (Some(raw), true) = (graph, others.is_empty()) {
            let vectors: HashMap<String, Vec<f32>> = items
                .iter()
                .map(|i| (i.id.clone(), i.embedding.clone()))
                .collect();
            let restored = serde_json::from_slice::<AnnGraph>(raw)
                .map_err(|e| malformed(format!("ann_index: {e}")))
                .and_then(|g| VectorIndex::restore(self.ann_config.clone(), self.dimension, g, &vectors));
            match restored {
                Ok(index) => return Ok(index),
                Err(e) => warn!("[kmem-store] Snapshot index unusable, rebuilding: {}", e),
            }
        }
        let mut vectors = others;
        vectors.extend(items.iter().map(|i| (i.id.clone(), i.embedding.clone())));
        VectorIndex::build(self.ann_config.clone(), self.dimension, vectors)
    }

    /// Replace the staged owner's rows. Adopting a key is refused while other
    /// owners have rows, since those are sealed under the current key.
    pub(crate) fn commit_import(
        &self,
        crypto: &CryptoModule,
        staged: StagedImport,
        adopt_key: Option<&WrappedDek>,
    ) -> EngineResult<ImportReport> {
        let owner_id = staged.header.owner_id.as_str();
        let sealed = staged
            .items
            .iter()
            .map(|item| SealedItem::seal(crypto, item))
            .collect::<EngineResult<Vec<_>>>()?;
        let key_json = adopt_key.map(serde_json::to_string).transpose()?;

        let replaced = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            if key_json.is_some() {
                let others: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM memory_items WHERE owner_id != ?1",
                    params![owner_id],
                    |r| r.get(0),
                )?;
                if others > 0 {
                    return Err(EngineError::InvalidInput(format!(
                        "{others} rows of other owners are sealed under the current key"
                    )));
                }
            }
            let replaced = tx.execute(
                "DELETE FROM memory_items WHERE owner_id = ?1",
                params![owner_id],
            )?;
            for row in &sealed {
                row.insert(&tx)?;
            }
            if let Some(json) = &key_json {
                tx.execute(
                    "INSERT OR REPLACE INTO key_records (name, record, updated_at) VALUES (?1, ?2, ?3)",
                    params![WRAPPED_DEK_RECORD, json, ts(&Utc::now())],
                )?;
            }
            tx.commit()?;
            replaced
        };
        *self.index.write() = staged.index;
        self.unindexed.store(staged.unindexed, Ordering::Relaxed);

        info!(
            "[kmem-store] Imported {} items for {} ({} replaced, key replaced: {})",
            staged.items.len(),
            owner_id,
            replaced,
            adopt_key.is_some()
        );
        Ok(ImportReport {
            items_imported: staged.items.len() as u64,
            owner_id: staged.header.owner_id.clone(),
            snapshot_created_at: staged.header.created_at,
            key_replaced: adopt_key.is_some(),
        })
    }

    /// Rows on the device that belong to someone other than `owner_id`.
    pub fn other_owner_count(&self, owner_id: &str) -> EngineResult<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memory_items WHERE owner_id != ?1",
            params![owner_id],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    // ── Index maintenance ──────────────────────────────────────────────

    /// Decrypt the embeddings of every row (except those of `except_owner`).
    /// Rows that fail to decrypt are logged and reported, never fatal.
    fn load_vectors(&self, crypto: &CryptoModule, except_owner: Option<&str>) -> EngineResult<RowVectors> {
        let rows: Vec<SealedRow> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {ITEM_COLUMNS} FROM memory_items
                 WHERE ?1 IS NULL OR owner_id != ?1 ORDER BY created_at, id"
            ))?;
            let rows = stmt
                .query_map(params![except_owner], SealedRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        let mut out = RowVectors::default();
        for row in &rows {
            match row.open_embedding(crypto) {
                Ok(vector) => out.vectors.push((row.id().to_string(), vector)),
                Err(e) => {
                    warn!("[kmem-store] Leaving {} out of the index: {}", row.id(), e);
                    out.unreadable.push(row.id().to_string());
                }
            }
        }
        Ok(out)
    }

    /// Decrypt every embedding and rebuild the index from scratch. Rows that
    /// no longer decrypt are left out; returns the number indexed.
    pub fn rebuild_index(&self, crypto: &CryptoModule) -> EngineResult<usize> {
        if !crypto.is_unlocked() {
            return Err(CryptoError::Locked.into());
        }
        let loaded = self.load_vectors(crypto, None)?;
        let staged = VectorIndex::build(self.ann_config.clone(), self.dimension, loaded.vectors)?;
        let n = staged.len();
        *self.index.write() = staged;
        self.unindexed.store(loaded.unreadable.len() as u64, Ordering::Relaxed);
        if !loaded.unreadable.is_empty() {
            warn!(
                "[kmem-store] Rebuilt index with {} items, {} unreadable rows skipped",
                n,
                loaded.unreadable.len()
            );
        }
        Ok(n)
    }

    /// Drop all plaintext vectors (on lock).
    pub fn clear_index(&self) {
        self.index.write().clear();
        self.unindexed.store(0, Ordering::Relaxed);
    }

    /// Whether the index accounts for every row: built, and each row either
    /// indexed or known to be unreadable.
    pub(crate) fn index_in_sync(&self) -> EngineResult<bool> {
        let rows = self.item_count()?;
        let index = self.index.read();
        if rows == 0 {
            return Ok(index.is_empty());
        }
        let accounted = index.len() as u64 + self.unindexed.load(Ordering::Relaxed);
        Ok(index.stats().is_indexed && accounted == rows)
    }

    /// Rebuild when the index and the table disagree.
    pub fn ensure_index_consistent(&self, crypto: &CryptoModule) -> EngineResult<bool> {
        if self.index_in_sync()? {
            return Ok(false);
        }
        warn!(
            "[kmem-store] Index drift ({} indexed, {} rows); rebuilding",
            self.index.read().len(),
            self.item_count()?
        );
        self.rebuild_index(crypto)?;
        Ok(true)
    }
}

/// Embeddings loaded for indexing, and the ids of rows that would not open.
#[derive(Default)]
struct RowVectors {
    vectors: Vec<(String, Vec<f32>)>,
    unreadable: Vec<String>,
}

impl RowVectors {
    fn ids(&self) -> HashSet<&str> {
        self.vectors
            .iter()
            .map(|(id, _)| id.as_str())
            .chain(self.unreadable.iter().map(String::as_str))
            .collect()
    }
}
