// ── kmem Atoms: Error Types ────────────────────────────────────────────────
// Canonical error enums for the engine, built with `thiserror`.
//
// Design rules:
//   • `EngineError` is coarse-grained by domain (crypto, format, storage…).
//   • Crypto and snapshot-format failures get their own typed enums so callers
//     can match on `CryptoError::Locked` etc. without string inspection.
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • No variant carries secret material (passphrases, keys) in its message.

use thiserror::Error;

// ── Crypto errors ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// An operation needing the data key ran while the engine was locked.
    #[error("engine is locked")]
    Locked,

    /// Unwrapping the data key failed. Deliberately says nothing about
    /// whether the secret or the stored KDF metadata was at fault.
    #[error("bad credential")]
    BadCredential,

    /// No wrapped data key exists yet; run setup first.
    #[error("encryption has not been set up")]
    NotInitialized,

    /// Setup was requested although a wrapped data key already exists.
    #[error("encryption is already set up; rotate the key instead")]
    AlreadyInitialized,

    /// A session-derived key was used where durable assurance is required.
    #[error("session-derived key is lower assurance and cannot protect a durable backup")]
    LowAssurance,

    /// AES-GCM authentication failed on stored ciphertext.
    #[error("decryption failed: wrong key or corrupted data")]
    DecryptionFailed,

    /// A MAC or integrity hash did not match.
    #[error("integrity check failed")]
    IntegrityCheckFailed,

    /// Primitive-level failure (bad key length, RNG, …).
    #[error("cipher error: {0}")]
    Cipher(String),
}

// ── Snapshot format errors ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("bad snapshot magic")]
    BadMagic,

    /// A declared length runs past the end of the buffer.
    #[error("truncated snapshot: {section} declares {declared} bytes, {remaining} remain")]
    Truncated {
        section: &'static str,
        declared: usize,
        remaining: usize,
    },

    #[error("malformed snapshot: {0}")]
    Malformed(String),

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
}

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("format error: {0}")]
    Format(#[from] FormatError),

    /// Embedding length does not match the index/deployment dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure outside the snapshot codec.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Object-store failure that is not a plain I/O or HTTP error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Engine configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller-supplied input failed validation.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The vector index reached `max_elements`.
    #[error("vector index is full ({0} elements)")]
    IndexFull(usize),

    /// A long-running operation observed its cancel signal.
    #[error("operation cancelled")]
    Cancelled,

    /// The engine worker has stopped; the facade can no longer serve requests.
    #[error("engine has shut down")]
    Shutdown,
}

// ── Classification helpers ─────────────────────────────────────────────────

impl EngineError {
    /// Create a dimension-mismatch error.
    pub fn dimension(expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch { expected, actual }
    }

    /// Storage and network failures are worth retrying; everything else is not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Database(_) | Self::Network(_) | Self::Storage(_)
        )
    }

    /// Message safe to show an end user. Never exposes format internals.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Crypto(CryptoError::Locked)
            | Self::Crypto(CryptoError::BadCredential)
            | Self::Crypto(CryptoError::NotInitialized) => "please re-enter your passphrase",
            Self::Crypto(CryptoError::LowAssurance) => {
                "set up a passphrase before creating a backup"
            }
            Self::Crypto(_)
            | Self::Format(_)
            | Self::Io(_)
            | Self::Database(_)
            | Self::Storage(_)
            | Self::Network(_)
            | Self::Serialization(_) => "this backup could not be read",
            Self::Cancelled => "the operation was cancelled",
            _ => "something went wrong with your memories",
        }
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations return this type.
pub type EngineResult<T> = Result<T, EngineError>;

// ── Conversion: EngineError → String ──────────────────────────────────────
// Lets UI boundaries that speak `Result<T, String>` call `.map_err(String::from)`.

impl From<EngineError> for String {
    fn from(e: EngineError) -> Self {
        e.to_string()
    }
}
