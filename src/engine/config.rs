// kmem: Engine Configuration
//
// All serde structs for `kmem.toml`. Every section and field has a default so
// an empty file (or no file) yields a working configuration.
//
//   [storage]    where the SQLite database lives
//   [embedding]  deployment-wide vector dimension
//   [crypto]     PBKDF2 iteration counts
//   [ann]        vector index tuning
//   [retrieval]  default recall policy
//   [device]     device identity and backup policy

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::atoms::constants::*;
use crate::atoms::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub crypto: CryptoConfig,
    pub ann: AnnConfig,
    pub retrieval: RetrievalConfig,
    pub device: DeviceConfig,
}

/// `[storage]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Defaults to `<platform data dir>/kmem`.
    pub data_dir: Option<PathBuf>,
    pub db_file: String,
    /// Keep everything in an in-memory SQLite database (tests, ephemeral sessions).
    pub in_memory: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            db_file: DB_FILE_NAME.to_string(),
            in_memory: false,
        }
    }
}

/// `[embedding]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimension: DEFAULT_EMBEDDING_DIMENSION,
        }
    }
}

/// `[crypto]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    pub passphrase_iterations: u32,
    pub session_iterations: u32,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            passphrase_iterations: PASSPHRASE_KDF_ITERATIONS,
            session_iterations: SESSION_KDF_ITERATIONS,
        }
    }
}

/// `[ann]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnConfig {
    pub max_elements: usize,
    /// Out-degree bound R of every graph node.
    pub max_degree: usize,
    /// Beam width L for greedy search and construction.
    pub search_list_size: usize,
    /// Robust-prune slack; > 1 keeps longer edges.
    pub alpha: f32,
    pub exact_search_threshold: usize,
}

impl Default for AnnConfig {
    fn default() -> Self {
        Self {
            max_elements: DEFAULT_ANN_MAX_ELEMENTS,
            max_degree: DEFAULT_ANN_MAX_DEGREE,
            search_list_size: DEFAULT_ANN_SEARCH_LIST_SIZE,
            alpha: DEFAULT_ANN_ALPHA,
            exact_search_threshold: DEFAULT_ANN_EXACT_SEARCH_THRESHOLD,
        }
    }
}

/// `[retrieval]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub max_results: usize,
    pub overfetch_factor: usize,
    pub min_relevance: f32,
    pub salience_weight: f32,
    pub reuse_penalty: f32,
    pub cooldown_minutes: i64,
    pub fallback_scan_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_results: DEFAULT_MAX_RESULTS,
            overfetch_factor: DEFAULT_OVERFETCH_FACTOR,
            min_relevance: DEFAULT_MIN_RELEVANCE,
            salience_weight: DEFAULT_SALIENCE_WEIGHT,
            reuse_penalty: DEFAULT_REUSE_PENALTY,
            cooldown_minutes: DEFAULT_COOLDOWN_MINUTES,
            fallback_scan_limit: DEFAULT_FALLBACK_SCAN_LIMIT,
        }
    }
}

/// `[device]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Stable device identifier; generated and persisted on first open when unset.
    pub device_id: Option<String>,
    /// Let backups proceed under a session-derived key.
    pub allow_session_key_backups: bool,
}

impl EngineConfig {
    /// Parse a TOML document. Missing sections fall back to defaults.
    pub fn from_toml_str(content: &str) -> EngineResult<Self> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| EngineError::Config(format!("TOML parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> EngineResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| EngineError::Config(format!("TOML serialize error: {e}")))
    }

    /// Ephemeral configuration: in-memory database, fast KDF.
    /// Never use the reduced iteration counts for real data.
    pub fn in_memory(dimension: usize) -> Self {
        let mut config = Self::default();
        config.storage.in_memory = true;
        config.embedding.dimension = dimension;
        config.crypto.passphrase_iterations = 1_000;
        config.crypto.session_iterations = 100;
        config
    }

    pub fn validate(&self) -> EngineResult<()> {
        let bad = |msg: String| Err(EngineError::Config(msg));

        if self.embedding.dimension == 0 {
            return bad("embedding.dimension must be > 0".into());
        }
        if self.crypto.passphrase_iterations == 0 || self.crypto.session_iterations == 0 {
            return bad("crypto iteration counts must be > 0".into());
        }
        if self.ann.max_elements == 0 {
            return bad("ann.max_elements must be > 0".into());
        }
        if self.ann.max_degree < 2 {
            return bad(format!("ann.max_degree must be >= 2, got {}", self.ann.max_degree));
        }
        if self.ann.search_list_size < self.ann.max_degree {
            return bad(format!(
                "ann.search_list_size ({}) must be >= ann.max_degree ({})",
                self.ann.search_list_size, self.ann.max_degree
            ));
        }
        if !(self.ann.alpha >= 1.0 && self.ann.alpha.is_finite()) {
            return bad(format!("ann.alpha must be >= 1.0, got {}", self.ann.alpha));
        }
        if self.retrieval.max_results == 0 {
            return bad("retrieval.max_results must be > 0".into());
        }
        if self.retrieval.overfetch_factor < 2 {
            return bad("retrieval.overfetch_factor must be >= 2".into());
        }
        if !(-1.0..=1.0).contains(&self.retrieval.min_relevance) {
            return bad("retrieval.min_relevance must be within [-1, 1]".into());
        }
        if self.retrieval.cooldown_minutes < 0 {
            return bad("retrieval.cooldown_minutes must be >= 0".into());
        }
        if self.storage.db_file.trim().is_empty() {
            return bad("storage.db_file cannot be empty".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.crypto.passphrase_iterations, 100_000);
        assert_eq!(config.embedding.dimension, 384);
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [embedding]
            dimension = 8

            [retrieval]
            max_results = 3
            cooldown_minutes = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.embedding.dimension, 8);
        assert_eq!(config.retrieval.max_results, 3);
        assert_eq!(config.retrieval.cooldown_minutes, 30);
        assert_eq!(config.retrieval.overfetch_factor, DEFAULT_OVERFETCH_FACTOR);
        assert_eq!(config.ann, AnnConfig::default());
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(EngineConfig::from_toml_str("[embedding]\ndimension = 0").is_err());
        assert!(EngineConfig::from_toml_str("[ann]\nalpha = 0.5").is_err());
        assert!(EngineConfig::from_toml_str("[retrieval]\noverfetch_factor = 1").is_err());
        assert!(EngineConfig::from_toml_str("not toml at all = = =").is_err());
    }

    #[test]
    fn toml_roundtrip() {
        let config = EngineConfig::in_memory(16);
        let text = config.to_toml_string().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }
}
