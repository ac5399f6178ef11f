// ── kmem: Engine Facade ─────────────────────────────────────────────────────
//
// The single entry point. `EngineFacade::init` opens the store, starts the
// worker thread and hands back an async API; `shutdown` locks the engine and
// joins the worker. `EngineHandle` is the cheap, cloneable command sender the
// facade and the backup coordinator share.

use log::info;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use zeroize::Zeroizing;

use crate::atoms::constants::COMMAND_CHANNEL_CAPACITY;
use crate::atoms::crypto_types::{CryptoState, EncryptionSecret};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{
    AnnStats, BackupMetadata, BackupSummary, EngineStats, ExportOptions, ImportReport, MemoryItem,
    NewMemory, RecallOptions, RecalledMemory, SyncStats,
};
use crate::engine::backup::object_store::ObjectStore;
use crate::engine::backup::{BackupCoordinator, BackupOptions, RestoreOptions};
use crate::engine::config::EngineConfig;
use crate::engine::store::MemoryStore;
use crate::engine::worker::{BackupExport, Command, EngineWorker, Reply, SyncEvent};

// ═════════════════════════════════════════════════════════════════════════════
// Handle
// ═════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
}

impl EngineHandle {
    async fn ask<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> EngineResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| EngineError::Shutdown)?;
        rx.await.map_err(|_| EngineError::Shutdown)?
    }

    pub async fn remember(&self, owner_id: &str, content: &str, embedding: Vec<f32>) -> EngineResult<String> {
        self.remember_with(NewMemory::new(owner_id, content, embedding)).await
    }

    pub async fn remember_with(&self, memory: NewMemory) -> EngineResult<String> {
        self.ask(|reply| Command::Remember { memory, reply }).await
    }

    pub async fn forget(&self, owner_id: &str, item_id: &str) -> EngineResult<bool> {
        self.ask(|reply| Command::Forget {
            owner_id: owner_id.to_string(),
            item_id: item_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn get_memory(&self, owner_id: &str, item_id: &str) -> EngineResult<Option<MemoryItem>> {
        self.ask(|reply| Command::GetMemory {
            owner_id: owner_id.to_string(),
            item_id: item_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn clear_cooldown(&self, item_id: &str) -> EngineResult<()> {
        self.ask(|reply| Command::ClearCooldown {
            item_id: item_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn recall(
        &self,
        owner_id: &str,
        query: Vec<f32>,
        options: RecallOptions,
    ) -> EngineResult<Vec<RecalledMemory>> {
        self.ask(|reply| Command::Recall {
            owner_id: owner_id.to_string(),
            query,
            options,
            reply,
        })
        .await
    }

    pub async fn setup_encryption(&self, secret: EncryptionSecret) -> EngineResult<CryptoState> {
        self.ask(|reply| Command::SetupEncryption { secret, reply }).await
    }

    pub async fn unlock(&self, secret: &str) -> EngineResult<()> {
        let secret = Zeroizing::new(secret.to_string());
        self.ask(|reply| Command::Unlock { secret, reply }).await
    }

    pub async fn lock(&self) -> EngineResult<()> {
        self.ask(|reply| Command::Lock { reply }).await
    }

    pub async fn rotate_key(&self, new_secret: EncryptionSecret) -> EngineResult<()> {
        self.ask(|reply| Command::RotateKey {
            secret: new_secret,
            reply,
        })
        .await
    }

    pub async fn export_snapshot(&self, owner_id: &str, options: ExportOptions) -> EngineResult<Vec<u8>> {
        self.ask(|reply| Command::ExportSnapshot {
            owner_id: owner_id.to_string(),
            options,
            reply,
        })
        .await
    }

    pub async fn import_snapshot(&self, bytes: Vec<u8>, unlock_secret: Option<String>) -> EngineResult<ImportReport> {
        let secret = unlock_secret.map(Zeroizing::new);
        self.ask(|reply| Command::ImportSnapshot { bytes, secret, reply })
            .await
    }

    pub async fn engine_stats(&self) -> EngineResult<EngineStats> {
        self.ask(|reply| Command::EngineStats { reply }).await
    }

    pub async fn ann_stats(&self) -> EngineResult<AnnStats> {
        self.ask(|reply| Command::AnnStats { reply }).await
    }

    pub async fn sync_stats(&self) -> EngineResult<SyncStats> {
        self.ask(|reply| Command::SyncStats { reply }).await
    }

    pub async fn crypto_state(&self) -> EngineResult<CryptoState> {
        self.ask(|reply| Command::CryptoState { reply }).await
    }

    pub async fn device_id(&self) -> EngineResult<String> {
        self.ask(|reply| Command::DeviceId { reply }).await
    }

    pub(crate) async fn export_for_backup(
        &self,
        owner_id: &str,
        allow_session_key: bool,
    ) -> EngineResult<BackupExport> {
        self.ask(|reply| Command::ExportForBackup {
            owner_id: owner_id.to_string(),
            allow_session_key,
            reply,
        })
        .await
    }

    pub(crate) async fn record_sync(&self, event: SyncEvent) -> EngineResult<()> {
        self.ask(|reply| Command::RecordSync { event, reply }).await
    }

    async fn shutdown(&self) -> EngineResult<()> {
        self.ask(|reply| Command::Shutdown { reply }).await
    }
}

// ═════════════════════════════════════════════════════════════════════════════
// Facade
// ═════════════════════════════════════════════════════════════════════════════

pub struct EngineFacade {
    config: EngineConfig,
    handle: EngineHandle,
    worker: Mutex<Option<JoinHandle<()>>>,
    backups: Option<BackupCoordinator>,
}

impl EngineFacade {
    /// Validate `config`, open the store and start the worker. An existing
    /// key is loaded but left locked.
    pub fn init(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let store = MemoryStore::open(&config)?;
        let worker = EngineWorker::new(config.clone(), store)?;
        let (tx, join) = worker.spawn(COMMAND_CHANNEL_CAPACITY)?;
        info!(
            "[kmem-engine] Engine initialized (dim {}, {})",
            config.embedding.dimension,
            if config.storage.in_memory { "in-memory" } else { "on-disk" }
        );
        Ok(Self {
            config,
            handle: EngineHandle { tx },
            worker: Mutex::new(Some(join)),
            backups: None,
        })
    }

    /// Enable the backup operations against `store`.
    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.backups = Some(BackupCoordinator::new(
            self.handle.clone(),
            store,
            self.config.crypto.passphrase_iterations,
        ));
        self
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Lock, stop and join the worker. Later calls fail with `Shutdown`.
    pub async fn shutdown(&self) -> EngineResult<()> {
        let Some(join) = self.worker.lock().take() else {
            return Ok(());
        };
        self.handle.shutdown().await?;
        tokio::task::spawn_blocking(move || join.join())
            .await
            .map_err(|e| EngineError::Storage(format!("worker join failed: {e}")))?
            .map_err(|_| EngineError::Storage("engine worker panicked".into()))?;
        info!("[kmem-engine] Engine shut down");
        Ok(())
    }

    // ── Memories ───────────────────────────────────────────────────────

    pub async fn remember(&self, owner_id: &str, content: &str, embedding: Vec<f32>) -> EngineResult<String> {
        self.handle.remember(owner_id, content, embedding).await
    }

    pub async fn remember_with(&self, memory: NewMemory) -> EngineResult<String> {
        self.handle.remember_with(memory).await
    }

    pub async fn forget(&self, owner_id: &str, item_id: &str) -> EngineResult<bool> {
        self.handle.forget(owner_id, item_id).await
    }

    pub async fn get_memory(&self, owner_id: &str, item_id: &str) -> EngineResult<Option<MemoryItem>> {
        self.handle.get_memory(owner_id, item_id).await
    }

    pub async fn clear_cooldown(&self, item_id: &str) -> EngineResult<()> {
        self.handle.clear_cooldown(item_id).await
    }

    pub async fn recall(
        &self,
        owner_id: &str,
        query: Vec<f32>,
        options: RecallOptions,
    ) -> EngineResult<Vec<RecalledMemory>> {
        self.handle.recall(owner_id, query, options).await
    }

    // ── Keys ───────────────────────────────────────────────────────────

    pub async fn setup_encryption(&self, secret: EncryptionSecret) -> EngineResult<CryptoState> {
        self.handle.setup_encryption(secret).await
    }

    pub async fn unlock(&self, secret: &str) -> EngineResult<()> {
        self.handle.unlock(secret).await
    }

    pub async fn lock(&self) -> EngineResult<()> {
        self.handle.lock().await
    }

    pub async fn rotate_key(&self, new_secret: EncryptionSecret) -> EngineResult<()> {
        self.handle.rotate_key(new_secret).await
    }

    // ── Snapshots ──────────────────────────────────────────────────────

    pub async fn export_snapshot(&self, owner_id: &str, options: ExportOptions) -> EngineResult<Vec<u8>> {
        self.handle.export_snapshot(owner_id, options).await
    }

    pub async fn import_snapshot(&self, bytes: Vec<u8>, unlock_secret: Option<String>) -> EngineResult<ImportReport> {
        self.handle.import_snapshot(bytes, unlock_secret).await
    }

    // ── Stats ──────────────────────────────────────────────────────────

    pub async fn engine_stats(&self) -> EngineResult<EngineStats> {
        self.handle.engine_stats().await
    }

    pub async fn ann_stats(&self) -> EngineResult<AnnStats> {
        self.handle.ann_stats().await
    }

    pub async fn sync_stats(&self) -> EngineResult<SyncStats> {
        self.handle.sync_stats().await
    }

    pub async fn crypto_state(&self) -> EngineResult<CryptoState> {
        self.handle.crypto_state().await
    }

    // ── Backups ────────────────────────────────────────────────────────

    fn backups(&self) -> EngineResult<&BackupCoordinator> {
        self.backups
            .as_ref()
            .ok_or_else(|| EngineError::Config("no object store attached".into()))
    }

    pub async fn create_backup(
        &self,
        owner_id: &str,
        backup_key: &str,
        options: BackupOptions,
    ) -> EngineResult<BackupMetadata> {
        self.backups()?.create_backup(owner_id, backup_key, options).await
    }

    pub async fn restore_backup(
        &self,
        owner_id: &str,
        backup_id: &str,
        decryption_key: &str,
        options: RestoreOptions,
    ) -> EngineResult<ImportReport> {
        self.backups()?
            .restore_backup(owner_id, backup_id, decryption_key, options)
            .await
    }

    pub async fn list_backups(&self, owner_id: &str) -> EngineResult<Vec<BackupMetadata>> {
        self.backups()?.list_backups(owner_id).await
    }

    pub async fn delete_backup(&self, owner_id: &str, backup_id: &str) -> EngineResult<()> {
        self.backups()?.delete_backup(owner_id, backup_id).await
    }

    pub async fn backup_summary(&self, owner_id: &str) -> EngineResult<BackupSummary> {
        self.backups()?.summary(owner_id).await
    }
}
