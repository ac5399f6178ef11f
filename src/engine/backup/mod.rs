// ── kmem: Backups ──────────────────────────────────────────────────────────
//
// Off-device copies of a snapshot:
//
//   create:  export (worker) → seal with backup key → upload blob → upload sidecar
//   restore: fetch sidecar + blob → checksum → open envelope → decode → import (worker)
//
// A `CancelSignal` is checked between phases. Once an import has been handed
// to the worker it runs to completion or fails atomically there.
//
// Objects per backup, under the owner's namespace:
//   <id>.kbak       transport envelope (opaque to the object store)
//   <id>.meta.json  BackupMetadata

pub mod envelope;
pub mod http;
pub mod object_store;

use chrono::Utc;
use log::{info, warn};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::atoms::constants::{BACKUP_BLOB_SUFFIX, BACKUP_META_SUFFIX};
use crate::atoms::error::{CryptoError, EngineError, EngineResult};
use crate::atoms::types::{BackupMetadata, BackupSummary, ImportReport};
use crate::engine::crypto::digest_eq;
use crate::engine::facade::EngineHandle;
use crate::engine::snapshot;
use crate::engine::worker::SyncEvent;
use object_store::{check_segment, ObjectStore};

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn checkpoint(cancel: &Option<CancelSignal>, phase: &str) -> EngineResult<()> {
    match cancel {
        Some(signal) if signal.is_cancelled() => {
            info!("[kmem-backup] Cancelled before {}", phase);
            Err(EngineError::Cancelled)
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Accept a session-derived key for this backup.
    pub allow_session_key: bool,
    pub cancel: Option<CancelSignal>,
}

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Unlocks the snapshot's own wrapped key when it differs from the live one.
    pub unlock_secret: Option<String>,
    pub cancel: Option<CancelSignal>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn blob_key(backup_id: &str) -> String {
    format!("{backup_id}{BACKUP_BLOB_SUFFIX}")
}

fn meta_key(backup_id: &str) -> String {
    format!("{backup_id}{BACKUP_META_SUFFIX}")
}

fn task_failed(e: tokio::task::JoinError) -> EngineError {
    EngineError::Storage(format!("backup crypto task failed: {e}"))
}

pub struct BackupCoordinator {
    engine: EngineHandle,
    store: Arc<dyn ObjectStore>,
    envelope_iterations: u32,
}

impl BackupCoordinator {
    pub fn new(engine: EngineHandle, store: Arc<dyn ObjectStore>, envelope_iterations: u32) -> Self {
        Self {
            engine,
            store,
            envelope_iterations,
        }
    }

    pub async fn create_backup(
        &self,
        owner_id: &str,
        backup_key: &str,
        options: BackupOptions,
    ) -> EngineResult<BackupMetadata> {
        check_segment("owner id", owner_id)?;
        checkpoint(&options.cancel, "export")?;
        let export = self
            .engine
            .export_for_backup(owner_id, options.allow_session_key)
            .await?;

        checkpoint(&options.cancel, "seal")?;
        let key = Zeroizing::new(backup_key.to_string());
        let iterations = self.envelope_iterations;
        let snapshot_bytes = export.bytes;
        let blob = tokio::task::spawn_blocking(move || envelope::seal(&snapshot_bytes, &key, iterations))
            .await
            .map_err(task_failed)??;

        let metadata = BackupMetadata {
            backup_id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            device_id: self.engine.device_id().await?,
            created_at: Utc::now(),
            size_bytes: blob.len() as u64,
            item_count: export.item_count,
            checksum: sha256_hex(&blob),
        };
        let sidecar = serde_json::to_vec_pretty(&metadata)?;

        checkpoint(&options.cancel, "upload")?;
        let blob_name = blob_key(&metadata.backup_id);
        self.store.put(owner_id, &blob_name, blob).await?;
        if let Err(e) = self
            .store
            .put(owner_id, &meta_key(&metadata.backup_id), sidecar)
            .await
        {
            if let Err(cleanup) = self.store.delete(owner_id, &blob_name).await {
                warn!("[kmem-backup] Orphaned blob {} left behind: {}", blob_name, cleanup);
            }
            return Err(e);
        }

        if let Err(e) = self.engine.record_sync(SyncEvent::BackupCreated).await {
            warn!("[kmem-backup] Could not record backup: {}", e);
        }
        info!(
            "[kmem-backup] Backup {} for {}: {} items, {} bytes via {}",
            metadata.backup_id,
            owner_id,
            metadata.item_count,
            metadata.size_bytes,
            self.store.name()
        );
        Ok(metadata)
    }

    pub async fn restore_backup(
        &self,
        owner_id: &str,
        backup_id: &str,
        decryption_key: &str,
        options: RestoreOptions,
    ) -> EngineResult<ImportReport> {
        check_segment("owner id", owner_id)?;
        check_segment("backup id", backup_id)?;
        checkpoint(&options.cancel, "download")?;

        let metadata = self
            .metadata(owner_id, backup_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("backup {backup_id}")))?;
        let blob = self
            .store
            .get(owner_id, &blob_key(backup_id))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("backup blob {backup_id}")))?;
        if !digest_eq(sha256_hex(&blob).as_bytes(), metadata.checksum.as_bytes()) {
            warn!("[kmem-backup] Checksum mismatch for backup {}", backup_id);
            return Err(CryptoError::IntegrityCheckFailed.into());
        }

        checkpoint(&options.cancel, "open")?;
        let key = Zeroizing::new(decryption_key.to_string());
        let bytes = tokio::task::spawn_blocking(move || envelope::open(&blob, &key))
            .await
            .map_err(task_failed)??;

        checkpoint(&options.cancel, "decode")?;
        let snap = snapshot::deserialize(&bytes)?;
        if snap.header.owner_id != owner_id {
            return Err(EngineError::InvalidInput(format!(
                "backup {backup_id} belongs to another owner"
            )));
        }

        checkpoint(&options.cancel, "import")?;
        let report = self
            .engine
            .import_snapshot(bytes, options.unlock_secret)
            .await?;

        if let Err(e) = self.engine.record_sync(SyncEvent::BackupRestored).await {
            warn!("[kmem-backup] Could not record restore: {}", e);
        }
        info!(
            "[kmem-backup] Restored backup {} for {} ({} items)",
            backup_id, owner_id, report.items_imported
        );
        Ok(report)
    }

    async fn metadata(&self, owner_id: &str, backup_id: &str) -> EngineResult<Option<BackupMetadata>> {
        match self.store.get(owner_id, &meta_key(backup_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Newest first. Unreadable sidecars are skipped.
    pub async fn list_backups(&self, owner_id: &str) -> EngineResult<Vec<BackupMetadata>> {
        check_segment("owner id", owner_id)?;
        let mut backups = Vec::new();
        for key in self.store.list(owner_id).await? {
            let Some(backup_id) = key.strip_suffix(BACKUP_META_SUFFIX) else {
                continue;
            };
            match self.metadata(owner_id, backup_id).await {
                Ok(Some(meta)) => backups.push(meta),
                Ok(None) => {}
                Err(e) => warn!("[kmem-backup] Skipping unreadable sidecar {}: {}", key, e),
            }
        }
        backups.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.backup_id.cmp(&b.backup_id))
        });
        Ok(backups)
    }

    pub async fn delete_backup(&self, owner_id: &str, backup_id: &str) -> EngineResult<()> {
        check_segment("owner id", owner_id)?;
        check_segment("backup id", backup_id)?;
        let had_meta = self.store.delete(owner_id, &meta_key(backup_id)).await?;
        let had_blob = self.store.delete(owner_id, &blob_key(backup_id)).await?;
        if !had_meta && !had_blob {
            return Err(EngineError::NotFound(format!("backup {backup_id}")));
        }
        info!("[kmem-backup] Deleted backup {} for {}", backup_id, owner_id);
        Ok(())
    }

    pub async fn summary(&self, owner_id: &str) -> EngineResult<BackupSummary> {
        let backups = self.list_backups(owner_id).await?;
        let devices: HashSet<&str> = backups.iter().map(|b| b.device_id.as_str()).collect();
        Ok(BackupSummary {
            total_backups: backups.len(),
            total_size_bytes: backups.iter().map(|b| b.size_bytes).sum(),
            device_count: devices.len(),
            latest_backup: backups.first().cloned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::object_store::MemoryObjectStore;
    use super::*;
    use crate::atoms::crypto_types::EncryptionSecret;
    use crate::engine::config::EngineConfig;
    use crate::engine::facade::EngineFacade;

    async fn engine_with(store: Arc<MemoryObjectStore>) -> EngineFacade {
        let engine = EngineFacade::init(EngineConfig::in_memory(4))
            .unwrap()
            .with_object_store(store);
        engine
            .setup_encryption(EncryptionSecret::Passphrase("pw".into()))
            .await
            .unwrap();
        engine
            .remember("u1", "likes green tea", vec![1.0, 0.0, 0.0, 0.0])
            .await
            .unwrap();
        engine
    }

    #[test]
    fn checksum_is_lowercase_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn cancelled_backup_uploads_nothing() {
        let store = Arc::new(MemoryObjectStore::new());
        let engine = engine_with(store.clone()).await;
        let cancel = CancelSignal::new();
        cancel.cancel();
        let err = engine
            .create_backup(
                "u1",
                "backup-key",
                BackupOptions {
                    cancel: Some(cancel),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(store.object_count(), 0);
    }

    #[tokio::test]
    async fn corrupted_blob_fails_checksum() {
        let store = Arc::new(MemoryObjectStore::new());
        let engine = engine_with(store.clone()).await;
        let meta = engine
            .create_backup("u1", "backup-key", BackupOptions::default())
            .await
            .unwrap();

        let key = blob_key(&meta.backup_id);
        let mut blob = store.get("u1", &key).await.unwrap().unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        store.put("u1", &key, blob).await.unwrap();

        let err = engine
            .restore_backup("u1", &meta.backup_id, "backup-key", RestoreOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Crypto(CryptoError::IntegrityCheckFailed)));
    }

    #[tokio::test]
    async fn restore_into_other_owner_is_refused() {
        let store = Arc::new(MemoryObjectStore::new());
        let engine = engine_with(store.clone()).await;
        let meta = engine
            .create_backup("u1", "backup-key", BackupOptions::default())
            .await
            .unwrap();
        // Copy u1's objects under u2.
        for key in store.list("u1").await.unwrap() {
            let bytes = store.get("u1", &key).await.unwrap().unwrap();
            store.put("u2", &key, bytes).await.unwrap();
        }
        let err = engine
            .restore_backup("u2", &meta.backup_id, "backup-key", RestoreOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn delete_unknown_backup_is_not_found() {
        let store = Arc::new(MemoryObjectStore::new());
        let engine = engine_with(store).await;
        assert!(matches!(
            engine.delete_backup("u1", "nope").await,
            Err(EngineError::NotFound(_))
        ));
    }
}
