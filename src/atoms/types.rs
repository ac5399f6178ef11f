// ── kmem Atoms: Memory & Engine Types ──────────────────────────────────────
//
// Pure data types for memory items, recall options, statistics and backup
// metadata. Structs live here, behaviour lives in engine/.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::atoms::constants::{DEFAULT_SALIENCE, DEFAULT_SOURCE};

// ═════════════════════════════════════════════════════════════════════════════
// Memory items
// ═════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Episodic,
    Preference,
    Fact,
    Other,
}

impl Default for MemoryType {
    fn default() -> Self {
        Self::Fact
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Episodic => write!(f, "episodic"),
            Self::Preference => write!(f, "preference"),
            Self::Fact => write!(f, "fact"),
            Self::Other => write!(f, "other"),
        }
    }
}

impl std::str::FromStr for MemoryType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "episodic" => Ok(Self::Episodic),
            "preference" => Ok(Self::Preference),
            "fact" => Ok(Self::Fact),
            "other" => Ok(Self::Other),
            _ => Err(format!("Unknown memory type: {}", s)),
        }
    }
}

/// A single remembered fact, decrypted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub owner_id: String,
    pub memory_type: MemoryType,
    pub content: String,
    pub embedding: Vec<f32>,
    /// Importance in [0, 1].
    pub salience: f32,
    pub sensitive: bool,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Excluded from recall while now < this instant.
    pub cooldown_until: Option<DateTime<Utc>>,
    pub topic_tags: BTreeSet<String>,
    /// Provenance tag, e.g. "user", "import".
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryItem {
    /// True while the item is cooling down relative to `now`.
    pub fn is_cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map(|until| now < until).unwrap_or(false)
    }
}

/// Input for `remember_with`. Unset fields take engine defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMemory {
    pub owner_id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub memory_type: MemoryType,
    #[serde(default = "default_salience")]
    pub salience: f32,
    /// `None` lets PII detection decide.
    #[serde(default)]
    pub sensitive: Option<bool>,
    #[serde(default)]
    pub topic_tags: BTreeSet<String>,
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_salience() -> f32 {
    DEFAULT_SALIENCE
}

fn default_source() -> String {
    DEFAULT_SOURCE.to_string()
}

impl NewMemory {
    pub fn new(owner_id: impl Into<String>, content: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            owner_id: owner_id.into(),
            content: content.into(),
            embedding,
            memory_type: MemoryType::default(),
            salience: DEFAULT_SALIENCE,
            sensitive: None,
            topic_tags: BTreeSet::new(),
            source: DEFAULT_SOURCE.to_string(),
        }
    }

    pub fn memory_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = memory_type;
        self
    }

    pub fn salience(mut self, salience: f32) -> Self {
        self.salience = salience;
        self
    }

    pub fn sensitive(mut self, sensitive: bool) -> Self {
        self.sensitive = Some(sensitive);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.topic_tags.insert(tag.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

// ═════════════════════════════════════════════════════════════════════════════
// Recall
// ═════════════════════════════════════════════════════════════════════════════

/// Where the candidate shortlist comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    /// ANN search; on a search *error* fall back to a bounded scan.
    LocalFirst,
    LocalOnly,
    FallbackOnly,
}

impl Default for SearchStrategy {
    fn default() -> Self {
        Self::LocalFirst
    }
}

/// Which path produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    LocalSearch,
    FallbackSearch,
}

/// A decrypted shortlist entry before policy is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub item: MemoryItem,
    /// Cosine similarity to the query.
    pub similarity: f32,
    pub source: CandidateSource,
}

/// Per-call recall policy. `None` fields inherit the engine's retrieval config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallOptions {
    pub max_results: Option<usize>,
    pub include_sensitive: bool,
    /// 0 disables the diversity pass.
    pub diversity: f32,
    pub penalize_recent_reuse_minutes: Option<i64>,
    pub min_relevance: Option<f32>,
    pub strategy: SearchStrategy,
    /// Record usage (and apply cooldown) for surfaced items.
    pub record_usage: bool,
    /// Overrides the clock; tests and replay use this.
    pub now: Option<DateTime<Utc>>,
}

impl Default for RecallOptions {
    fn default() -> Self {
        Self {
            max_results: None,
            include_sensitive: false,
            diversity: 0.0,
            penalize_recent_reuse_minutes: None,
            min_relevance: None,
            strategy: SearchStrategy::default(),
            record_usage: true,
            now: None,
        }
    }
}

impl RecallOptions {
    pub fn limit(max_results: usize) -> Self {
        Self {
            max_results: Some(max_results),
            ..Default::default()
        }
    }
}

/// A policy-selected memory with its final ranking score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecalledMemory {
    pub item: MemoryItem,
    pub similarity: f32,
    pub score: f32,
}

// ═════════════════════════════════════════════════════════════════════════════
// Statistics
// ═════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub item_count: u64,
    pub owner_count: u64,
    pub sensitive_count: u64,
    pub storage_engine: String,
    pub db_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnStats {
    pub current_elements: usize,
    pub max_elements: usize,
    pub dimension: usize,
    pub is_indexed: bool,
    pub last_rebuild_time: Option<DateTime<Utc>>,
    pub deleted_elements: usize,
    pub incremental_inserts: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub snapshots_exported: u64,
    pub snapshots_imported: u64,
    pub last_export_at: Option<DateTime<Utc>>,
    pub last_import_at: Option<DateTime<Utc>>,
    pub backups_created: u64,
    pub backups_restored: u64,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub last_restore_at: Option<DateTime<Utc>>,
}

// ═════════════════════════════════════════════════════════════════════════════
// Snapshot export / import
// ═════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportOptions {
    /// Carry the serialized ANN graph and its stats in the snapshot.
    pub include_index: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    pub items_imported: u64,
    pub owner_id: String,
    pub snapshot_created_at: DateTime<Utc>,
    /// Whether the store adopted the snapshot's wrapped key.
    pub key_replaced: bool,
}

// ═════════════════════════════════════════════════════════════════════════════
// Backups
// ═════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub backup_id: String,
    pub owner_id: String,
    pub device_id: String,
    pub created_at: DateTime<Utc>,
    /// Size of the uploaded transport blob.
    pub size_bytes: u64,
    pub item_count: u64,
    /// SHA-256 (hex) of the uploaded blob.
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSummary {
    pub total_backups: usize,
    pub total_size_bytes: u64,
    pub latest_backup: Option<BackupMetadata>,
    pub device_count: usize,
}
