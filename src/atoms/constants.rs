// ── kmem Atoms: Constants ──────────────────────────────────────────────────
// All named constants for the crate live here so every layer's defaults can be
// audited in one place.

// ── Key hierarchy ──────────────────────────────────────────────────────────
// DEK: AES-256-GCM. KEK: PBKDF2-HMAC-SHA256 over the user's secret.
pub const DEK_LEN: usize = 32;
pub const KEK_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
pub const IV_LEN: usize = 12;
pub const GCM_TAG_LEN: usize = 16;

/// PBKDF2 rounds for passphrase-derived KEKs.
pub const PASSPHRASE_KDF_ITERATIONS: u32 = 100_000;
/// PBKDF2 rounds for session-derived KEKs. Lower assurance: session secrets are
/// short-lived and re-derived often, so speed wins over brute-force cost.
pub const SESSION_KDF_ITERATIONS: u32 = 10_000;

/// AAD bound into every DEK wrap so a wrapped key cannot be replayed as content.
pub(crate) const DEK_WRAP_AAD: &[u8] = b"kmem/dek-wrap/v1";
/// HKDF info label for the snapshot MAC key derived from the DEK.
pub(crate) const SNAPSHOT_MAC_INFO: &[u8] = b"kmem/snapshot-mac/v1";

// ── Snapshot wire format ───────────────────────────────────────────────────
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"KMEM";
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

// ── Backup transport envelope ──────────────────────────────────────────────
pub const BACKUP_MAGIC: [u8; 4] = *b"KBAK";
pub const BACKUP_ENVELOPE_VERSION: u8 = 1;
pub(crate) const BACKUP_BLOB_SUFFIX: &str = ".kbak";
pub(crate) const BACKUP_META_SUFFIX: &str = ".meta.json";

// ── Embeddings / ANN ───────────────────────────────────────────────────────
/// MiniLM-class sentence embeddings.
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 384;
pub const DEFAULT_ANN_MAX_ELEMENTS: usize = 100_000;
pub const DEFAULT_ANN_MAX_DEGREE: usize = 24;
pub const DEFAULT_ANN_SEARCH_LIST_SIZE: usize = 64;
pub const DEFAULT_ANN_ALPHA: f32 = 1.2;
/// At or below this many live vectors, search scans exhaustively.
pub const DEFAULT_ANN_EXACT_SEARCH_THRESHOLD: usize = 256;

// ── Retrieval policy ───────────────────────────────────────────────────────
pub const DEFAULT_MAX_RESULTS: usize = 5;
pub const DEFAULT_OVERFETCH_FACTOR: usize = 4;
pub const DEFAULT_MIN_RELEVANCE: f32 = 0.1;
pub const DEFAULT_SALIENCE_WEIGHT: f32 = 0.1;
pub const DEFAULT_REUSE_PENALTY: f32 = 0.15;
/// Cooldown applied by the usage update. Zero keeps surfaced items eligible;
/// deployments opt in to a real window via config.
pub const DEFAULT_COOLDOWN_MINUTES: i64 = 0;
pub const DEFAULT_FALLBACK_SCAN_LIMIT: usize = 500;

// ── Memory input limits ────────────────────────────────────────────────────
pub const MAX_MEMORY_CONTENT_BYTES: usize = 64 * 1024;
pub const MAX_TOPIC_TAGS: usize = 32;
pub const MAX_TAG_LENGTH: usize = 64;
pub const DEFAULT_SALIENCE: f32 = 0.5;
pub const DEFAULT_SOURCE: &str = "user";

// ── Storage ────────────────────────────────────────────────────────────────
pub const STORAGE_ENGINE_ID: &str = "sqlite";
pub(crate) const DATA_DIR_NAME: &str = "kmem";
pub(crate) const DB_FILE_NAME: &str = "memories.db";
pub(crate) const WRAPPED_DEK_RECORD: &str = "wrapped_dek";
pub(crate) const META_DEVICE_ID: &str = "device_id";
pub(crate) const META_SYNC_STATS: &str = "sync_stats";

// ── Worker ─────────────────────────────────────────────────────────────────
pub(crate) const COMMAND_CHANNEL_CAPACITY: usize = 64;
pub(crate) const WORKER_THREAD_NAME: &str = "kmem-engine";
