// ── kmem Atoms: Key & Snapshot Types ───────────────────────────────────────
//
// Pure data types shared by the crypto module, the snapshot codec and the
// store. No logic beyond small accessors; no I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

// ═════════════════════════════════════════════════════════════════════════════
// Key derivation
// ═════════════════════════════════════════════════════════════════════════════

/// How the key-encryption key was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyDerivation {
    /// PBKDF2 over a user passphrase, full iteration count.
    PassphraseDerived,
    /// PBKDF2 over a short-lived session secret, reduced iteration count.
    /// Lower assurance: never acceptable for durable off-device backups.
    SessionDerived,
}

impl std::fmt::Display for KeyDerivation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PassphraseDerived => write!(f, "passphrase"),
            Self::SessionDerived => write!(f, "session"),
        }
    }
}

/// Secret supplied to `setup_encryption`. Zeroized on drop; `Debug` never
/// prints the secret.
#[derive(Clone)]
pub enum EncryptionSecret {
    Passphrase(String),
    Session(String),
}

impl EncryptionSecret {
    pub fn key_derivation(&self) -> KeyDerivation {
        match self {
            Self::Passphrase(_) => KeyDerivation::PassphraseDerived,
            Self::Session(_) => KeyDerivation::SessionDerived,
        }
    }

    pub(crate) fn expose(&self) -> &str {
        match self {
            Self::Passphrase(s) | Self::Session(s) => s,
        }
    }
}

impl Drop for EncryptionSecret {
    fn drop(&mut self) {
        match self {
            Self::Passphrase(s) | Self::Session(s) => s.zeroize(),
        }
    }
}

impl std::fmt::Debug for EncryptionSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionSecret::{}(<redacted>)", self.key_derivation())
    }
}

/// The data-encryption key, wrapped under a KEK. Safe to persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedDek {
    /// AES-256-GCM ciphertext of the DEK, tag included.
    pub wrapped_key: Vec<u8>,
    pub salt: Vec<u8>,
    pub iv: Vec<u8>,
    pub key_derivation: KeyDerivation,
    pub iterations: u32,
}

/// Lock state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CryptoStatus {
    Uninitialized,
    Locked,
    Unlocked,
}

/// Process-local view of the key hierarchy. Never contains key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoState {
    pub status: CryptoStatus,
    pub is_locked: bool,
    pub has_wrapped_dek: bool,
    pub key_derivation: Option<KeyDerivation>,
}

// ═════════════════════════════════════════════════════════════════════════════
// Encrypted snapshot
// ═════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSnapshotHeader {
    pub version: u32,
    pub item_count: u64,
    pub created_at: DateTime<Utc>,
    pub owner_id: String,
}

/// Payload blocks. `memories`, `ann_index` and `ann_metadata` are
/// `iv ‖ ciphertext` under the DEK; `wrapped_dek` is the JSON of the
/// `WrappedDek` record; `integrity_hash` is SHA-256 over the plaintext blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSnapshotPayload {
    pub memories: Vec<u8>,
    pub ann_index: Option<Vec<u8>>,
    pub ann_metadata: Option<Vec<u8>>,
    pub wrapped_dek: Vec<u8>,
    /// Unix milliseconds at export.
    pub timestamp: i64,
    pub integrity_hash: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedSnapshot {
    pub header: EncryptedSnapshotHeader,
    pub payload: EncryptedSnapshotPayload,
    /// HMAC-SHA256 over `signing_input(header, payload)`.
    pub signature: Vec<u8>,
}
