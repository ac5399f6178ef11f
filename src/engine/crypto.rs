// ── kmem: Envelope Encryption & Lock State ─────────────────────────────────
//
// Key hierarchy:
//   passphrase / session secret ──PBKDF2-HMAC-SHA256──▶ KEK (never stored)
//   KEK ──AES-256-GCM──▶ wraps the DEK (stored as WrappedDek)
//   DEK ──AES-256-GCM──▶ memory content and embeddings
//   DEK ──HKDF-SHA256──▶ snapshot MAC key (HMAC-SHA256)
//
// State machine:
//   Uninitialized ──setup──▶ Unlocked ──lock──▶ Locked ──unlock──▶ Unlocked
//   load_wrapped_dek always lands in Locked.
//
// The unwrapped DEK lives only inside this struct and is zeroized when the
// module locks or drops. Every encryption draws a fresh random 96-bit IV.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use log::{info, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::atoms::constants::*;
use crate::atoms::crypto_types::{
    CryptoState, CryptoStatus, EncryptionSecret, KeyDerivation, WrappedDek,
};
use crate::atoms::error::CryptoError;
use crate::engine::config::CryptoConfig;

type HmacSha256 = Hmac<Sha256>;
pub(crate) type Key = Zeroizing<[u8; DEK_LEN]>;

pub type CryptoResult<T> = Result<T, CryptoError>;

// ═════════════════════════════════════════════════════════════════════════════
// Primitives
// ═════════════════════════════════════════════════════════════════════════════

pub(crate) fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

pub(crate) fn derive_kek(secret: &str, salt: &[u8], iterations: u32) -> Key {
    let mut kek = Zeroizing::new([0u8; KEK_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, iterations, &mut kek[..]);
    kek
}

fn cipher_for(key: &[u8]) -> CryptoResult<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Cipher("AES key must be 32 bytes".into()))
}

/// AES-256-GCM with a fresh IV. Returns `(ciphertext‖tag, iv)`.
pub(crate) fn gcm_seal(key: &[u8], plaintext: &[u8], aad: &[u8]) -> CryptoResult<(Vec<u8>, Vec<u8>)> {
    let cipher = cipher_for(key)?;
    let iv = random_array::<IV_LEN>();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::Cipher(format!("AES-256-GCM encryption failed: {e}")))?;
    Ok((ciphertext, iv.to_vec()))
}

pub(crate) fn gcm_open(key: &[u8], ciphertext: &[u8], iv: &[u8], aad: &[u8]) -> CryptoResult<Vec<u8>> {
    if iv.len() != IV_LEN || ciphertext.len() < GCM_TAG_LEN {
        return Err(CryptoError::DecryptionFailed);
    }
    let cipher = cipher_for(key)?;
    cipher
        .decrypt(Nonce::from_slice(iv), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Wrap `dek` under a KEK derived from `secret` with a fresh salt.
fn wrap_dek(dek: &[u8], secret: &str, kind: KeyDerivation, iterations: u32) -> CryptoResult<WrappedDek> {
    let salt = random_array::<SALT_LEN>();
    let kek = derive_kek(secret, &salt, iterations);
    let (wrapped_key, iv) = gcm_seal(&kek[..], dek, DEK_WRAP_AAD)?;
    Ok(WrappedDek {
        wrapped_key,
        salt: salt.to_vec(),
        iv,
        key_derivation: kind,
        iterations,
    })
}

fn unwrap_dek(record: &WrappedDek, secret: &str) -> CryptoResult<Key> {
    let kek = derive_kek(secret, &record.salt, record.iterations);
    let plain = Zeroizing::new(
        gcm_open(&kek[..], &record.wrapped_key, &record.iv, DEK_WRAP_AAD)
            .map_err(|_| CryptoError::BadCredential)?,
    );
    if plain.len() != DEK_LEN {
        return Err(CryptoError::BadCredential);
    }
    let mut dek = Zeroizing::new([0u8; DEK_LEN]);
    dek.copy_from_slice(&plain);
    Ok(dek)
}

pub(crate) fn embedding_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

pub(crate) fn bytes_to_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

// ═════════════════════════════════════════════════════════════════════════════
// CryptoModule
// ═════════════════════════════════════════════════════════════════════════════

pub struct CryptoModule {
    wrapped: Option<WrappedDek>,
    dek: Option<Key>,
    passphrase_iterations: u32,
    session_iterations: u32,
}

impl std::fmt::Debug for CryptoModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoModule")
            .field("status", &self.status())
            .field("key_derivation", &self.key_derivation())
            .finish()
    }
}

impl CryptoModule {
    pub fn new(config: &CryptoConfig) -> Self {
        Self {
            wrapped: None,
            dek: None,
            passphrase_iterations: config.passphrase_iterations,
            session_iterations: config.session_iterations,
        }
    }

    // ── State ──────────────────────────────────────────────────────────

    pub fn status(&self) -> CryptoStatus {
        match (&self.wrapped, &self.dek) {
            (None, _) => CryptoStatus::Uninitialized,
            (Some(_), None) => CryptoStatus::Locked,
            (Some(_), Some(_)) => CryptoStatus::Unlocked,
        }
    }

    pub fn state(&self) -> CryptoState {
        let status = self.status();
        CryptoState {
            status,
            is_locked: status != CryptoStatus::Unlocked,
            has_wrapped_dek: self.wrapped.is_some(),
            key_derivation: self.key_derivation(),
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.status() == CryptoStatus::Unlocked
    }

    pub fn key_derivation(&self) -> Option<KeyDerivation> {
        self.wrapped.as_ref().map(|w| w.key_derivation)
    }

    pub fn wrapped_dek(&self) -> Option<&WrappedDek> {
        self.wrapped.as_ref()
    }

    fn iterations_for(&self, kind: KeyDerivation) -> u32 {
        match kind {
            KeyDerivation::PassphraseDerived => self.passphrase_iterations,
            KeyDerivation::SessionDerived => self.session_iterations,
        }
    }

    fn dek(&self) -> CryptoResult<&[u8]> {
        self.dek.as_ref().map(|k| &k[..]).ok_or(CryptoError::Locked)
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Generate a fresh DEK and wrap it under `secret`. Leaves the module unlocked.
    pub fn setup(&mut self, secret: &EncryptionSecret) -> CryptoResult<WrappedDek> {
        if self.wrapped.is_some() {
            return Err(CryptoError::AlreadyInitialized);
        }
        let kind = secret.key_derivation();
        let iterations = self.iterations_for(kind);
        let dek = Zeroizing::new(random_array::<DEK_LEN>());
        let record = wrap_dek(&dek[..], secret.expose(), kind, iterations)?;

        if kind == KeyDerivation::SessionDerived {
            warn!(
                "[kmem-crypto] Encryption set up with a session-derived key ({} iterations); durable backups will be refused",
                iterations
            );
        } else {
            info!("[kmem-crypto] Encryption set up ({} PBKDF2 iterations)", iterations);
        }

        self.wrapped = Some(record.clone());
        self.dek = Some(dek);
        Ok(record)
    }

    pub fn setup_with_passphrase(&mut self, passphrase: &str) -> CryptoResult<WrappedDek> {
        self.setup(&EncryptionSecret::Passphrase(passphrase.to_string()))
    }

    pub fn setup_with_session(&mut self, secret: &str) -> CryptoResult<WrappedDek> {
        self.setup(&EncryptionSecret::Session(secret.to_string()))
    }

    /// Re-derive the KEK from the stored salt and unwrap the DEK.
    /// A wrong secret leaves the module locked.
    pub fn unlock(&mut self, secret: &str) -> CryptoResult<()> {
        let record = self.wrapped.as_ref().ok_or(CryptoError::NotInitialized)?;
        match unwrap_dek(record, secret) {
            Ok(dek) => {
                self.dek = Some(dek);
                info!("[kmem-crypto] Unlocked");
                Ok(())
            }
            Err(e) => {
                warn!("[kmem-crypto] Unlock rejected");
                Err(e)
            }
        }
    }

    /// Drop the DEK. Idempotent.
    pub fn lock(&mut self) {
        if self.dek.take().is_some() {
            info!("[kmem-crypto] Locked");
        }
    }

    /// Re-wrap the live DEK under a new secret with a fresh salt.
    /// Content ciphertext stays valid; the old secret stops working.
    pub fn rotate_key(&mut self, new_secret: &EncryptionSecret) -> CryptoResult<WrappedDek> {
        let dek = self.dek()?;
        let kind = new_secret.key_derivation();
        let record = wrap_dek(dek, new_secret.expose(), kind, self.iterations_for(kind))?;
        self.wrapped = Some(record.clone());
        info!("[kmem-crypto] Key rotated ({})", kind);
        Ok(record)
    }

    /// Install a persisted wrapped key. Any live DEK is discarded.
    pub fn load_wrapped_dek(&mut self, record: WrappedDek) {
        self.dek = None;
        self.wrapped = Some(record);
    }

    // ── Content ────────────────────────────────────────────────────────

    pub fn encrypt_content(&self, plaintext: &[u8]) -> CryptoResult<(Vec<u8>, Vec<u8>)> {
        gcm_seal(self.dek()?, plaintext, &[])
    }

    pub fn decrypt_content(&self, ciphertext: &[u8], iv: &[u8]) -> CryptoResult<Vec<u8>> {
        gcm_open(self.dek()?, ciphertext, iv, &[])
    }

    pub fn encrypt_embedding(&self, embedding: &[f32]) -> CryptoResult<(Vec<u8>, Vec<u8>)> {
        self.encrypt_content(&embedding_to_bytes(embedding))
    }

    pub fn decrypt_embedding(&self, ciphertext: &[u8], iv: &[u8]) -> CryptoResult<Vec<f32>> {
        let bytes = self.decrypt_content(ciphertext, iv)?;
        bytes_to_embedding(&bytes).ok_or(CryptoError::DecryptionFailed)
    }

    /// `iv ‖ ciphertext` in one buffer, for snapshot blocks.
    pub fn seal_packed(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let (ciphertext, iv) = self.encrypt_content(plaintext)?;
        let mut packed = Vec::with_capacity(IV_LEN + ciphertext.len());
        packed.extend_from_slice(&iv);
        packed.extend_from_slice(&ciphertext);
        Ok(packed)
    }

    pub fn open_packed(&self, packed: &[u8]) -> CryptoResult<Vec<u8>> {
        if packed.len() < IV_LEN + GCM_TAG_LEN {
            return Err(CryptoError::DecryptionFailed);
        }
        let (iv, ciphertext) = packed.split_at(IV_LEN);
        self.decrypt_content(ciphertext, iv)
    }

    // ── Signatures ─────────────────────────────────────────────────────

    fn mac_key(&self) -> CryptoResult<Key> {
        let hk = Hkdf::<Sha256>::new(None, self.dek()?);
        let mut okm = Zeroizing::new([0u8; DEK_LEN]);
        hk.expand(SNAPSHOT_MAC_INFO, &mut okm[..])
            .map_err(|_| CryptoError::Cipher("HKDF expand failed".into()))?;
        Ok(okm)
    }

    pub fn sign(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        let key = self.mac_key()?;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&key[..])
            .map_err(|_| CryptoError::Cipher("invalid HMAC key".into()))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Constant-time signature check.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> CryptoResult<()> {
        let expected = self.sign(data)?;
        if expected.len() == signature.len() && bool::from(expected.ct_eq(signature)) {
            Ok(())
        } else {
            Err(CryptoError::IntegrityCheckFailed)
        }
    }
}

/// Constant-time equality for integrity hashes.
pub(crate) fn digest_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

// ═════════════════════════════════════════════════════════════════════════════
// Tests
// ═════════════════════════════════════════════════════════════════════════════
