//! kmem: an on-device encrypted memory engine.
//!
//! Short personal facts are stored envelope-encrypted in SQLite, indexed in a
//! graph-based ANN index for semantic recall, filtered through a retrieval
//! policy (relevance, diversity, cooldown, sensitivity) and exported as signed,
//! encrypted snapshots for backup and cross-device sync.
//!
//! ```no_run
//! use kmem::{EncryptionSecret, EngineConfig, EngineFacade, RecallOptions};
//!
//! # async fn demo() -> kmem::EngineResult<()> {
//! let engine = EngineFacade::init(EngineConfig::default())?;
//! engine
//!     .setup_encryption(EncryptionSecret::Passphrase("correct horse".into()))
//!     .await?;
//! engine.remember("user-1", "prefers green tea", vec![0.1; 384]).await?;
//! let hits = engine
//!     .recall("user-1", vec![0.1; 384], RecallOptions::default())
//!     .await?;
//! # let _ = hits;
//! engine.shutdown().await
//! # }
//! ```

pub mod atoms;
pub mod engine;

pub use atoms::crypto_types::{
    CryptoState, CryptoStatus, EncryptedSnapshot, EncryptionSecret, KeyDerivation, WrappedDek,
};
pub use atoms::error::{CryptoError, EngineError, EngineResult, FormatError};
pub use atoms::types::{
    AnnStats, BackupMetadata, BackupSummary, EngineStats, ExportOptions, ImportReport, MemoryItem,
    MemoryType, NewMemory, RecallOptions, RecalledMemory, SearchStrategy, SyncStats,
};
pub use engine::backup::http::HttpObjectStore;
pub use engine::backup::object_store::{LocalDirObjectStore, MemoryObjectStore, ObjectStore};
pub use engine::backup::{BackupOptions, CancelSignal, RestoreOptions};
pub use engine::config::EngineConfig;
pub use engine::facade::{EngineFacade, EngineHandle};
