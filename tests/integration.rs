// End-to-end tests through the public facade.

use std::sync::Arc;

use chrono::{Duration, Utc};
use kmem::*;

const DIM: usize = 8;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::in_memory(DIM);
    config.retrieval.cooldown_minutes = 30;
    config
}

fn axis(i: usize) -> Vec<f32> {
    let mut v = vec![0.0; DIM];
    v[i % DIM] = 1.0;
    v
}

fn blend(i: usize, j: usize, w: f32) -> Vec<f32> {
    let mut v = axis(i);
    v[j % DIM] += w;
    v
}

async fn unlocked(config: EngineConfig, passphrase: &str) -> EngineFacade {
    init_logging();
    let engine = EngineFacade::init(config).unwrap();
    engine
        .setup_encryption(EncryptionSecret::Passphrase(passphrase.into()))
        .await
        .unwrap();
    engine
}

fn peek() -> RecallOptions {
    RecallOptions {
        record_usage: false,
        ..Default::default()
    }
}

#[tokio::test]
async fn remember_recall_export_import_roundtrip() {
    let source = unlocked(config(), "pw").await;
    let tea = source.remember("u1", "prefers green tea", axis(0)).await.unwrap();
    source.remember("u1", "runs on weekends", axis(1)).await.unwrap();
    source.remember("u2", "someone else's fact", axis(0)).await.unwrap();

    let hits = source.recall("u1", axis(0), peek()).await.unwrap();
    assert_eq!(hits[0].item.id, tea);
    assert!(hits.iter().all(|h| h.item.owner_id == "u1"));

    let bytes = source
        .export_snapshot("u1", ExportOptions { include_index: true })
        .await
        .unwrap();
    assert_eq!(&bytes[..4], b"KMEM");
    assert!(!bytes.windows(9).any(|w| w == b"green tea"));
    assert_eq!(source.sync_stats().await.unwrap().snapshots_exported, 1);

    let target = EngineFacade::init(config()).unwrap();
    let report = target
        .import_snapshot(bytes, Some("pw".into()))
        .await
        .unwrap();
    assert_eq!(report.items_imported, 2);
    assert_eq!(report.owner_id, "u1");
    assert!(report.key_replaced);

    let hits = target.recall("u1", axis(0), peek()).await.unwrap();
    assert_eq!(hits[0].item.id, tea);
    assert_eq!(hits[0].item.content, "prefers green tea");
    assert_eq!(target.engine_stats().await.unwrap().item_count, 2);
    assert_eq!(target.ann_stats().await.unwrap().current_elements, 2);

    // The adopted key survives a lock cycle.
    target.lock().await.unwrap();
    target.unlock("pw").await.unwrap();
    assert_eq!(target.recall("u1", axis(1), peek()).await.unwrap()[0].item.content, "runs on weekends");

    source.shutdown().await.unwrap();
    target.shutdown().await.unwrap();
}

#[tokio::test]
async fn lock_gates_every_content_operation() {
    let engine = unlocked(config(), "pw").await;
    let id = engine.remember("u1", "likes jazz", axis(2)).await.unwrap();
    engine.lock().await.unwrap();

    let state = engine.crypto_state().await.unwrap();
    assert_eq!(state.status, CryptoStatus::Locked);
    assert!(state.is_locked);
    assert_eq!(engine.ann_stats().await.unwrap().current_elements, 0);

    let locked = |r: EngineResult<()>| matches!(r, Err(EngineError::Crypto(CryptoError::Locked)));
    assert!(locked(engine.remember("u1", "x", axis(0)).await.map(|_| ())));
    assert!(locked(engine.recall("u1", axis(2), peek()).await.map(|_| ())));
    assert!(locked(engine.get_memory("u1", &id).await.map(|_| ())));
    assert!(locked(engine.export_snapshot("u1", ExportOptions::default()).await.map(|_| ())));
    assert!(locked(
        engine
            .rotate_key(EncryptionSecret::Passphrase("new".into()))
            .await
    ));

    assert!(matches!(
        engine.unlock("wrong").await,
        Err(EngineError::Crypto(CryptoError::BadCredential))
    ));
    engine.unlock("pw").await.unwrap();
    assert_eq!(engine.recall("u1", axis(2), peek()).await.unwrap()[0].item.id, id);
}

#[tokio::test]
async fn reopening_a_store_starts_locked() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config();
    cfg.storage.in_memory = false;
    cfg.storage.data_dir = Some(dir.path().to_path_buf());

    let first = unlocked(cfg.clone(), "pw").await;
    first.remember("u1", "allergic to cats", axis(3)).await.unwrap();
    first.shutdown().await.unwrap();

    let second = EngineFacade::init(cfg).unwrap();
    assert_eq!(second.crypto_state().await.unwrap().status, CryptoStatus::Locked);
    second.unlock("pw").await.unwrap();
    let hits = second.recall("u1", axis(3), peek()).await.unwrap();
    assert_eq!(hits[0].item.content, "allergic to cats");
    let stats = second.engine_stats().await.unwrap();
    assert!(stats.db_path.unwrap().ends_with("memories.db"));
}

#[tokio::test]
async fn rotation_keeps_content_and_retires_old_secret() {
    let engine = unlocked(config(), "old").await;
    let id = engine.remember("u1", "birthday in May", axis(4)).await.unwrap();
    engine
        .rotate_key(EncryptionSecret::Passphrase("new".into()))
        .await
        .unwrap();
    engine.lock().await.unwrap();

    assert!(matches!(
        engine.unlock("old").await,
        Err(EngineError::Crypto(CryptoError::BadCredential))
    ));
    engine.unlock("new").await.unwrap();
    let item = engine.get_memory("u1", &id).await.unwrap().unwrap();
    assert_eq!(item.content, "birthday in May");
}

#[tokio::test]
async fn cooldown_hides_then_releases_items() {
    let engine = unlocked(config(), "pw").await;
    let id = engine.remember("u1", "likes hiking", axis(5)).await.unwrap();

    let now = Utc::now();
    let first = engine
        .recall(
            "u1",
            axis(5),
            RecallOptions {
                now: Some(now),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].item.cooldown_until, Some(now + Duration::minutes(30)));

    let during = RecallOptions {
        now: Some(now + Duration::minutes(10)),
        ..Default::default()
    };
    assert!(engine.recall("u1", axis(5), during.clone()).await.unwrap().is_empty());

    let after = RecallOptions {
        now: Some(now + Duration::minutes(31)),
        record_usage: false,
        ..Default::default()
    };
    assert_eq!(engine.recall("u1", axis(5), after).await.unwrap().len(), 1);

    engine.clear_cooldown(&id).await.unwrap();
    assert_eq!(engine.recall("u1", axis(5), during).await.unwrap().len(), 1);
}

#[tokio::test]
async fn sensitive_memories_need_opt_in() {
    let engine = unlocked(config(), "pw").await;
    engine
        .remember("u1", "my password is hunter2", axis(6))
        .await
        .unwrap();
    engine
        .remember_with(NewMemory::new("u1", "likes chess", blend(6, 7, 0.5)).sensitive(false))
        .await
        .unwrap();

    let hits = engine.recall("u1", axis(6), peek()).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].item.content, "likes chess");

    let opts = RecallOptions {
        include_sensitive: true,
        record_usage: false,
        ..Default::default()
    };
    let hits = engine.recall("u1", axis(6), opts).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits[0].item.sensitive);
    assert_eq!(engine.engine_stats().await.unwrap().sensitive_count, 1);
}

#[tokio::test]
async fn diversity_spreads_results() {
    let engine = unlocked(config(), "pw").await;
    let coffee = |w: f32| {
        let mut v = axis(0);
        v[1] = w;
        v[2] = 0.1;
        v
    };
    engine.remember("u1", "coffee, black", coffee(0.05)).await.unwrap();
    engine.remember("u1", "coffee, no sugar", coffee(0.06)).await.unwrap();
    engine.remember("u1", "tea in the evening", axis(2)).await.unwrap();

    // Halfway between the coffee cluster and tea; coffee is slightly closer.
    let query = blend(0, 2, 1.0);

    let plain = engine
        .recall("u1", query.clone(), RecallOptions { max_results: Some(2), ..peek() })
        .await
        .unwrap();
    assert!(plain.iter().all(|h| h.item.content.starts_with("coffee")));

    let diverse = engine
        .recall(
            "u1",
            query,
            RecallOptions {
                max_results: Some(2),
                diversity: 0.6,
                ..peek()
            },
        )
        .await
        .unwrap();
    assert_eq!(diverse.len(), 2);
    assert!(diverse.iter().any(|h| h.item.content.starts_with("tea")));
    assert!(diverse.iter().any(|h| h.item.content.starts_with("coffee")));
}

#[tokio::test]
async fn corrupt_import_leaves_store_untouched() {
    let engine = unlocked(config(), "pw").await;
    engine.remember("u1", "speaks French", axis(0)).await.unwrap();
    let bytes = engine.export_snapshot("u1", ExportOptions::default()).await.unwrap();
    engine.remember("u1", "learning Italian", axis(1)).await.unwrap();

    let truncated = bytes[..bytes.len() / 2].to_vec();
    assert!(matches!(
        engine.import_snapshot(truncated, None).await,
        Err(EngineError::Format(FormatError::Truncated { .. }))
    ));

    let mut tampered = bytes.clone();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    assert!(matches!(
        engine.import_snapshot(tampered, None).await,
        Err(EngineError::Crypto(CryptoError::IntegrityCheckFailed))
    ));

    assert_eq!(engine.engine_stats().await.unwrap().item_count, 2);
    assert_eq!(engine.ann_stats().await.unwrap().current_elements, 2);

    // The intact snapshot replaces the store wholesale.
    engine.import_snapshot(bytes, None).await.unwrap();
    assert_eq!(engine.engine_stats().await.unwrap().item_count, 1);
}

#[tokio::test]
async fn dimension_mismatch_is_rejected() {
    let engine = unlocked(config(), "pw").await;
    assert!(matches!(
        engine.remember("u1", "x", vec![1.0; DIM + 1]).await,
        Err(EngineError::DimensionMismatch { expected: DIM, actual })
            if actual == DIM + 1
    ));
    assert!(matches!(
        engine.recall("u1", vec![1.0; 3], peek()).await,
        Err(EngineError::DimensionMismatch { .. })
    ));
    assert_eq!(engine.engine_stats().await.unwrap().item_count, 0);
}

#[tokio::test]
async fn forget_removes_item() {
    let engine = unlocked(config(), "pw").await;
    let id = engine.remember("u1", "owns a bike", axis(7)).await.unwrap();
    assert!(!engine.forget("u2", &id).await.unwrap());
    assert!(engine.forget("u1", &id).await.unwrap());
    assert!(engine.get_memory("u1", &id).await.unwrap().is_none());
    assert!(engine.recall("u1", axis(7), peek()).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_remembers_all_land() {
    let engine = Arc::new(unlocked(config(), "pw").await);
    let mut tasks = Vec::new();
    for i in 0..40 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .remember("u1", &format!("fact number {i}"), blend(i, i + 1, 0.1 * (i % 7) as f32))
                .await
        }));
    }
    let mut ids = std::collections::HashSet::new();
    for task in tasks {
        ids.insert(task.await.unwrap().unwrap());
    }
    assert_eq!(ids.len(), 40);
    assert_eq!(engine.engine_stats().await.unwrap().item_count, 40);
    assert_eq!(engine.ann_stats().await.unwrap().current_elements, 40);
}

// ── Backups ────────────────────────────────────────────────────────────────

async fn backup_roundtrip(store: Arc<dyn ObjectStore>) {
    let source = unlocked(config(), "pw").await.with_object_store(store.clone());
    source.remember("u1", "plays the cello", axis(0)).await.unwrap();
    source.remember("u1", "vegetarian", axis(1)).await.unwrap();

    let first = source
        .create_backup("u1", "backup-key", BackupOptions::default())
        .await
        .unwrap();
    assert_eq!(first.item_count, 2);
    assert_eq!(first.checksum.len(), 64);
    source.remember("u1", "moved to Lisbon", axis(2)).await.unwrap();
    let second = source
        .create_backup("u1", "backup-key", BackupOptions::default())
        .await
        .unwrap();

    let listed = source.list_backups("u1").await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].backup_id, second.backup_id);

    let summary = source.backup_summary("u1").await.unwrap();
    assert_eq!(summary.total_backups, 2);
    assert_eq!(summary.total_size_bytes, first.size_bytes + second.size_bytes);
    assert_eq!(summary.device_count, 1);
    assert_eq!(summary.latest_backup.map(|b| b.backup_id), Some(second.backup_id.clone()));
    assert_eq!(source.sync_stats().await.unwrap().backups_created, 2);

    // Restore on a fresh device.
    let target = EngineFacade::init(config()).unwrap().with_object_store(store.clone());
    let options = RestoreOptions {
        unlock_secret: Some("pw".into()),
        ..Default::default()
    };
    let report = target
        .restore_backup("u1", &first.backup_id, "backup-key", options)
        .await
        .unwrap();
    assert_eq!(report.items_imported, 2);
    let hits = target.recall("u1", axis(0), peek()).await.unwrap();
    assert_eq!(hits[0].item.content, "plays the cello");
    assert_eq!(target.sync_stats().await.unwrap().backups_restored, 1);

    source.delete_backup("u1", &first.backup_id).await.unwrap();
    assert_eq!(source.list_backups("u1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn backups_against_memory_store() {
    backup_roundtrip(Arc::new(MemoryObjectStore::new())).await;
}

#[tokio::test]
async fn backups_against_directory_store() {
    let dir = tempfile::tempdir().unwrap();
    backup_roundtrip(Arc::new(LocalDirObjectStore::new(dir.path()))).await;
    assert!(dir.path().join("u1").is_dir());
}

#[tokio::test]
async fn wrong_backup_key_is_bad_credential() {
    let store = Arc::new(MemoryObjectStore::new());
    let engine = unlocked(config(), "pw").await.with_object_store(store);
    engine.remember("u1", "drinks oat milk", axis(0)).await.unwrap();
    let meta = engine
        .create_backup("u1", "right-key", BackupOptions::default())
        .await
        .unwrap();

    let err = engine
        .restore_backup("u1", &meta.backup_id, "wrong-key", RestoreOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Crypto(CryptoError::BadCredential)));
    assert_eq!(err.user_message(), "please re-enter your passphrase");
    assert_eq!(engine.engine_stats().await.unwrap().item_count, 1);
}

#[tokio::test]
async fn restoring_one_owner_keeps_the_others() {
    let store = Arc::new(MemoryObjectStore::new());
    let engine = unlocked(config(), "pw").await.with_object_store(store);
    engine.remember("u1", "plays the cello", axis(0)).await.unwrap();
    engine.remember("u2", "keeps bees", axis(1)).await.unwrap();
    let meta = engine
        .create_backup("u1", "backup-key", BackupOptions::default())
        .await
        .unwrap();
    engine.remember("u1", "moved to Lisbon", axis(2)).await.unwrap();

    let report = engine
        .restore_backup("u1", &meta.backup_id, "backup-key", RestoreOptions::default())
        .await
        .unwrap();
    assert_eq!(report.items_imported, 1);
    assert!(!report.key_replaced);
    assert_eq!(engine.engine_stats().await.unwrap().item_count, 2);

    let bees = engine.recall("u2", axis(1), peek()).await.unwrap();
    assert_eq!(bees[0].item.content, "keeps bees");
    assert!(engine.recall("u1", axis(2), peek()).await.unwrap().is_empty());
    assert_eq!(engine.ann_stats().await.unwrap().current_elements, 2);
}

#[tokio::test]
async fn cancelled_backup_leaves_no_objects() {
    let store = Arc::new(MemoryObjectStore::new());
    let engine = unlocked(config(), "pw").await.with_object_store(store.clone());
    engine.remember("u1", "collects stamps", axis(0)).await.unwrap();

    let cancel = CancelSignal::new();
    let options = BackupOptions {
        cancel: Some(cancel.clone()),
        ..Default::default()
    };
    cancel.cancel();
    assert!(matches!(
        engine.create_backup("u1", "k", options).await,
        Err(EngineError::Cancelled)
    ));
    assert_eq!(store.object_count(), 0);
    assert!(engine.list_backups("u1").await.unwrap().is_empty());
}

#[tokio::test]
async fn session_keys_need_explicit_opt_in_for_backups() {
    init_logging();
    let store = Arc::new(MemoryObjectStore::new());
    let engine = EngineFacade::init(config()).unwrap().with_object_store(store.clone());
    engine
        .setup_encryption(EncryptionSecret::Session("tab-secret".into()))
        .await
        .unwrap();
    let state = engine.crypto_state().await.unwrap();
    assert_eq!(state.key_derivation, Some(KeyDerivation::SessionDerived));

    let err = engine
        .create_backup("u1", "k", BackupOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Crypto(CryptoError::LowAssurance)));
    assert_eq!(store.object_count(), 0);

    let opted_in = BackupOptions {
        allow_session_key: true,
        ..Default::default()
    };
    engine.create_backup("u1", "k", opted_in).await.unwrap();
    assert_eq!(store.object_count(), 2);
}
