// ── kmem: Engine Worker ─────────────────────────────────────────────────────
//
// One dedicated OS thread owns the CryptoModule, the MemoryStore (and through
// it the VectorIndex) and the RetrievalEngine. Callers send `Command`s over a
// bounded mpsc channel and await a oneshot reply. Commands run strictly in
// submission order, so reads queue behind in-flight writes and an import is a
// barrier for everything sent after it.
//
// The unwrapped DEK never leaves this thread. It is zeroized on lock, on
// shutdown, and when the last handle is dropped.

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use zeroize::Zeroizing;

use crate::atoms::constants::WORKER_THREAD_NAME;
use crate::atoms::crypto_types::{
    CryptoState, CryptoStatus, EncryptionSecret, KeyDerivation, WrappedDek,
};
use crate::atoms::error::{CryptoError, EngineError, EngineResult, FormatError};
use crate::atoms::types::{
    AnnStats, EngineStats, ExportOptions, ImportReport, MemoryItem, NewMemory, RecallOptions,
    RecalledMemory, SyncStats,
};
use crate::engine::config::EngineConfig;
use crate::engine::crypto::CryptoModule;
use crate::engine::pii::{resolve_sensitive, safe_log_preview, validate_memory_input};
use crate::engine::retrieval::RetrievalEngine;
use crate::engine::snapshot;
use crate::engine::store::MemoryStore;

pub(crate) type Reply<T> = oneshot::Sender<EngineResult<T>>;

/// Snapshot bytes produced for a backup, with the item count for its metadata.
#[derive(Debug)]
pub(crate) struct BackupExport {
    pub bytes: Vec<u8>,
    pub item_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncEvent {
    BackupCreated,
    BackupRestored,
}

pub(crate) enum Command {
    Remember {
        memory: NewMemory,
        reply: Reply<String>,
    },
    Forget {
        owner_id: String,
        item_id: String,
        reply: Reply<bool>,
    },
    GetMemory {
        owner_id: String,
        item_id: String,
        reply: Reply<Option<MemoryItem>>,
    },
    ClearCooldown {
        item_id: String,
        reply: Reply<()>,
    },
    Recall {
        owner_id: String,
        query: Vec<f32>,
        options: RecallOptions,
        reply: Reply<Vec<RecalledMemory>>,
    },
    SetupEncryption {
        secret: EncryptionSecret,
        reply: Reply<CryptoState>,
    },
    Unlock {
        secret: Zeroizing<String>,
        reply: Reply<()>,
    },
    Lock {
        reply: Reply<()>,
    },
    RotateKey {
        secret: EncryptionSecret,
        reply: Reply<()>,
    },
    ExportSnapshot {
        owner_id: String,
        options: ExportOptions,
        reply: Reply<Vec<u8>>,
    },
    ExportForBackup {
        owner_id: String,
        allow_session_key: bool,
        reply: Reply<BackupExport>,
    },
    ImportSnapshot {
        bytes: Vec<u8>,
        secret: Option<Zeroizing<String>>,
        reply: Reply<ImportReport>,
    },
    EngineStats {
        reply: Reply<EngineStats>,
    },
    AnnStats {
        reply: Reply<AnnStats>,
    },
    SyncStats {
        reply: Reply<SyncStats>,
    },
    CryptoState {
        reply: Reply<CryptoState>,
    },
    DeviceId {
        reply: Reply<String>,
    },
    RecordSync {
        event: SyncEvent,
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

pub(crate) struct EngineWorker {
    config: EngineConfig,
    crypto: CryptoModule,
    store: MemoryStore,
    retrieval: RetrievalEngine,
}

impl EngineWorker {
    /// Any persisted wrapped key is installed, which leaves the engine Locked.
    pub(crate) fn new(config: EngineConfig, store: MemoryStore) -> EngineResult<Self> {
        let mut crypto = CryptoModule::new(&config.crypto);
        if let Some(record) = store.load_wrapped_dek()? {
            crypto.load_wrapped_dek(record);
        }
        let retrieval = RetrievalEngine::new(config.retrieval.clone());
        Ok(Self {
            config,
            crypto,
            store,
            retrieval,
        })
    }

    /// Start the worker thread and return the receiving end's sender.
    pub(crate) fn spawn(
        self,
        capacity: usize,
    ) -> EngineResult<(mpsc::Sender<Command>, std::thread::JoinHandle<()>)> {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || self.run(rx))?;
        Ok((tx, handle))
    }

    fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        info!("[kmem-engine] Worker started ({:?})", self.crypto.status());
        while let Some(command) = rx.blocking_recv() {
            if let Command::Shutdown { reply } = command {
                self.seal();
                let _ = reply.send(Ok(()));
                info!("[kmem-engine] Worker stopped");
                return;
            }
            self.dispatch(command);
        }
        self.seal();
        info!("[kmem-engine] All handles dropped; worker stopped");
    }

    /// Drop the DEK and every plaintext vector.
    fn seal(&mut self) {
        self.crypto.lock();
        self.store.clear_index();
    }

    fn dispatch(&mut self, command: Command) {
        // A dropped receiver means the caller gave up; nothing to do.
        match command {
            Command::Remember { memory, reply } => {
                let _ = reply.send(self.remember(memory));
            }
            Command::Forget {
                owner_id,
                item_id,
                reply,
            } => {
                let _ = reply.send(self.store.delete(&owner_id, &item_id));
            }
            Command::GetMemory {
                owner_id,
                item_id,
                reply,
            } => {
                let _ = reply.send(self.get_memory(&owner_id, &item_id));
            }
            Command::ClearCooldown { item_id, reply } => {
                let _ = reply.send(self.store.clear_cooldown(&item_id));
            }
            Command::Recall {
                owner_id,
                query,
                options,
                reply,
            } => {
                let _ = reply.send(self.recall(&owner_id, &query, &options));
            }
            Command::SetupEncryption { secret, reply } => {
                let _ = reply.send(self.setup_encryption(&secret));
            }
            Command::Unlock { secret, reply } => {
                let _ = reply.send(self.unlock(&secret));
            }
            Command::Lock { reply } => {
                self.seal();
                let _ = reply.send(Ok(()));
            }
            Command::RotateKey { secret, reply } => {
                let _ = reply.send(self.rotate_key(&secret));
            }
            Command::ExportSnapshot {
                owner_id,
                options,
                reply,
            } => {
                let _ = reply.send(self.export_snapshot(&owner_id, &options));
            }
            Command::ExportForBackup {
                owner_id,
                allow_session_key,
                reply,
            } => {
                let _ = reply.send(self.export_for_backup(&owner_id, allow_session_key));
            }
            Command::ImportSnapshot {
                bytes,
                secret,
                reply,
            } => {
                let _ = reply.send(self.import_snapshot(&bytes, secret.as_deref().map(|s| s.as_str())));
            }
            Command::EngineStats { reply } => {
                let _ = reply.send(self.store.stats());
            }
            Command::AnnStats { reply } => {
                let _ = reply.send(Ok(self.store.ann_stats()));
            }
            Command::SyncStats { reply } => {
                let _ = reply.send(self.store.sync_stats());
            }
            Command::CryptoState { reply } => {
                let _ = reply.send(Ok(self.crypto.state()));
            }
            Command::DeviceId { reply } => {
                let _ = reply.send(self.store.device_id(self.config.device.device_id.as_deref()));
            }
            Command::RecordSync { event, reply } => {
                let _ = reply.send(self.record_sync(event));
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    // ── Memories ───────────────────────────────────────────────────────

    fn remember(&mut self, memory: NewMemory) -> EngineResult<String> {
        validate_memory_input(&memory)?;
        self.store.check_dimension(&memory.embedding)?;
        if !self.crypto.is_unlocked() {
            return Err(CryptoError::Locked.into());
        }

        let now = Utc::now();
        let sensitive = resolve_sensitive(memory.sensitive, &memory.content);
        let item = MemoryItem {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: memory.owner_id,
            memory_type: memory.memory_type,
            content: memory.content,
            embedding: memory.embedding,
            salience: memory.salience,
            sensitive,
            usage_count: 0,
            last_used_at: None,
            cooldown_until: None,
            topic_tags: memory.topic_tags,
            source: memory.source,
            created_at: now,
            updated_at: now,
        };
        self.store.put(&self.crypto, &item)?;
        info!(
            "[kmem-engine] Remembered {} for {} ({}{})",
            item.id,
            item.owner_id,
            safe_log_preview(&item.content, 50),
            if sensitive { ", sensitive" } else { "" }
        );
        Ok(item.id)
    }

    fn get_memory(&self, owner_id: &str, item_id: &str) -> EngineResult<Option<MemoryItem>> {
        if !self.crypto.is_unlocked() {
            return Err(CryptoError::Locked.into());
        }
        self.store.get(&self.crypto, owner_id, item_id)
    }

    fn recall(
        &mut self,
        owner_id: &str,
        query: &[f32],
        options: &RecallOptions,
    ) -> EngineResult<Vec<RecalledMemory>> {
        if !self.crypto.is_unlocked() {
            return Err(CryptoError::Locked.into());
        }
        self.store.check_dimension(query)?;
        let now = options.now.unwrap_or_else(Utc::now);

        let shortlist = self
            .retrieval
            .shortlist(&self.store, &self.crypto, owner_id, query, options)?;
        if shortlist.degraded {
            if let Err(e) = self.store.ensure_index_consistent(&self.crypto) {
                error!("[kmem-engine] Index rebuild after drift failed: {}", e);
            }
        }

        let mut selected = self.retrieval.select(shortlist.candidates, options, now);
        if options.record_usage {
            let cooldown = self.retrieval.cooldown();
            for recalled in &mut selected {
                let item = &mut recalled.item;
                if let Err(e) = self.store.update_usage(&item.id, now, cooldown) {
                    warn!("[kmem-engine] Usage update for {} failed: {}", item.id, e);
                    continue;
                }
                item.usage_count += 1;
                item.last_used_at = Some(now);
                item.updated_at = now;
                if cooldown > chrono::Duration::zero() {
                    let until = now + cooldown;
                    item.cooldown_until = Some(item.cooldown_until.map_or(until, |c| c.max(until)));
                }
            }
        }
        debug!(
            "[kmem-engine] Recall for {}: {} results",
            owner_id,
            selected.len()
        );
        Ok(selected)
    }

    // ── Keys ───────────────────────────────────────────────────────────

    fn setup_encryption(&mut self, secret: &EncryptionSecret) -> EngineResult<CryptoState> {
        let record = self.crypto.setup(secret)?;
        if let Err(e) = self.store.save_wrapped_dek(&record) {
            // Never run on a key that is not on disk.
            self.crypto = CryptoModule::new(&self.config.crypto);
            return Err(e);
        }
        self.store.ensure_index_consistent(&self.crypto)?;
        Ok(self.crypto.state())
    }

    fn unlock(&mut self, secret: &str) -> EngineResult<()> {
        self.crypto.unlock(secret)?;
        match self.store.rebuild_index(&self.crypto) {
            Ok(n) => info!("[kmem-engine] Unlocked; indexed {} memories", n),
            // Local search refuses an unbuilt index, so recall scans until a rebuild succeeds.
            Err(e) => error!("[kmem-engine] Index rebuild on unlock failed: {}", e),
        }
        Ok(())
    }

    fn rotate_key(&mut self, secret: &EncryptionSecret) -> EngineResult<()> {
        let previous = self
            .crypto
            .wrapped_dek()
            .cloned()
            .ok_or(CryptoError::NotInitialized)?;
        let record = self.crypto.rotate_key(secret)?;
        if let Err(e) = self.store.save_wrapped_dek(&record) {
            // The old record is still the persisted one; fall back to it.
            self.crypto.load_wrapped_dek(previous);
            self.store.clear_index();
            return Err(e);
        }
        Ok(())
    }

    // ── Snapshots ──────────────────────────────────────────────────────

    fn export_snapshot(&mut self, owner_id: &str, options: &ExportOptions) -> EngineResult<Vec<u8>> {
        let snap = self.store.export_all(&self.crypto, owner_id, options)?;
        let bytes = snapshot::serialize(&snap)?;
        let now = Utc::now();
        if let Err(e) = self.store.update_sync_stats(|s| {
            s.snapshots_exported += 1;
            s.last_export_at = Some(now);
        }) {
            warn!("[kmem-engine] Could not record export: {}", e);
        }
        Ok(bytes)
    }

    fn export_for_backup(&mut self, owner_id: &str, allow_session_key: bool) -> EngineResult<BackupExport> {
        match self.crypto.status() {
            CryptoStatus::Uninitialized => return Err(CryptoError::NotInitialized.into()),
            CryptoStatus::Locked => return Err(CryptoError::Locked.into()),
            CryptoStatus::Unlocked => {}
        }
        if self.crypto.key_derivation() == Some(KeyDerivation::SessionDerived)
            && !(allow_session_key || self.config.device.allow_session_key_backups)
        {
            warn!("[kmem-engine] Refusing durable backup under a session-derived key");
            return Err(CryptoError::LowAssurance.into());
        }
        let snap = self
            .store
            .export_all(&self.crypto, owner_id, &ExportOptions::default())?;
        Ok(BackupExport {
            item_count: snap.header.item_count,
            bytes: snapshot::serialize(&snap)?,
        })
    }

    /// Decode and import. The snapshot is tried under the live key first. If
    /// it was sealed under a different key, `secret` unlocks the snapshot's
    /// own wrapped key. An unlocked engine then re-seals the rows under its
    /// live key; otherwise the snapshot key is adopted once the import has
    /// committed, which a locked engine allows only when no other owner's
    /// rows depend on its current key.
    fn import_snapshot(&mut self, bytes: &[u8], secret: Option<&str>) -> EngineResult<ImportReport> {
        let snap = snapshot::deserialize(bytes)?;

        if self.crypto.is_unlocked() {
            match self.store.import_all(&self.crypto, &snap, None) {
                Ok(report) => return Ok(self.imported(report)),
                Err(EngineError::Crypto(CryptoError::IntegrityCheckFailed)) if secret.is_some() => {
                    debug!("[kmem-engine] Snapshot not sealed under the live key; trying its own");
                }
                Err(e) => return Err(e),
            }
        }

        let Some(secret) = secret else {
            return Err(match self.crypto.status() {
                CryptoStatus::Uninitialized => CryptoError::NotInitialized,
                _ => CryptoError::Locked,
            }
            .into());
        };

        let record: WrappedDek = serde_json::from_slice(&snap.payload.wrapped_dek)
            .map_err(|e| FormatError::Malformed(format!("wrapped_dek: {e}")))?;
        let mut staged = CryptoModule::new(&self.config.crypto);
        staged.load_wrapped_dek(record.clone());
        staged.unlock(secret)?;

        if self.crypto.is_unlocked() {
            let report = self
                .store
                .import_resealed(&staged, &self.crypto, &snap, None)?;
            return Ok(self.imported(report));
        }

        if matches!(self.crypto.status(), CryptoStatus::Locked) {
            let others = self.store.other_owner_count(&snap.header.owner_id)?;
            if others > 0 {
                warn!(
                    "[kmem-engine] Import needs an unlock: {} rows of other owners use the current key",
                    others
                );
                return Err(CryptoError::Locked.into());
            }
        }

        let report = self.store.import_all(&staged, &snap, Some(&record))?;
        self.crypto = staged;
        Ok(self.imported(report))
    }

    fn imported(&mut self, report: ImportReport) -> ImportReport {
        let now = Utc::now();
        if let Err(e) = self.store.update_sync_stats(|s| {
            s.snapshots_imported += 1;
            s.last_import_at = Some(now);
        }) {
            warn!("[kmem-engine] Could not record import: {}", e);
        }
        report
    }

    fn record_sync(&mut self, event: SyncEvent) -> EngineResult<()> {
        let now = Utc::now();
        self.store.update_sync_stats(|s| match event {
            SyncEvent::BackupCreated => {
                s.backups_created += 1;
                s.last_backup_at = Some(now);
            }
            SyncEvent::BackupRestored => {
                s.backups_restored += 1;
                s.last_restore_at = Some(now);
            }
        })?;
        Ok(())
    }
}
