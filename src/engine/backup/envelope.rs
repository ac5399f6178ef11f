// Transport envelope for backups. The snapshot is already encrypted under the
// DEK; the envelope adds a second layer keyed by the backup key so the object
// store only ever sees opaque bytes.
//
//   [4]  magic "KBAK"
//   [1]  envelope version
//   [4]  PBKDF2 iterations (u32 LE)
//   [16] salt
//   [12] IV
//   [..] AES-256-GCM ciphertext ‖ tag
//
// Everything before the IV is bound as AAD.

use crate::atoms::constants::{BACKUP_ENVELOPE_VERSION, BACKUP_MAGIC, GCM_TAG_LEN, IV_LEN, SALT_LEN};
use crate::atoms::error::{CryptoError, EngineResult, FormatError};
use crate::engine::crypto::{derive_kek, gcm_open, gcm_seal, random_array};

const AAD_LEN: usize = 4 + 1 + 4 + SALT_LEN;
const HEADER_LEN: usize = AAD_LEN + IV_LEN;
/// Refuse envelopes that would make us grind PBKDF2 for minutes.
const MAX_ITERATIONS: u32 = 10_000_000;

pub fn seal(plaintext: &[u8], backup_key: &str, iterations: u32) -> EngineResult<Vec<u8>> {
    if backup_key.is_empty() {
        return Err(CryptoError::BadCredential.into());
    }
    let salt = random_array::<SALT_LEN>();
    let mut out = Vec::with_capacity(HEADER_LEN + plaintext.len() + GCM_TAG_LEN);
    out.extend_from_slice(&BACKUP_MAGIC);
    out.push(BACKUP_ENVELOPE_VERSION);
    out.extend_from_slice(&iterations.to_le_bytes());
    out.extend_from_slice(&salt);

    let kek = derive_kek(backup_key, &salt, iterations);
    let (ciphertext, iv) = gcm_seal(&kek[..], plaintext, &out[..AAD_LEN])?;
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open an envelope. A wrong key and a tampered body are indistinguishable
/// under GCM; both report `BadCredential`.
pub fn open(envelope: &[u8], backup_key: &str) -> EngineResult<Vec<u8>> {
    if envelope.len() < HEADER_LEN + GCM_TAG_LEN {
        return Err(FormatError::Truncated {
            section: "backup envelope",
            declared: HEADER_LEN + GCM_TAG_LEN,
            remaining: envelope.len(),
        }
        .into());
    }
    if envelope[..4] != BACKUP_MAGIC {
        return Err(FormatError::BadMagic.into());
    }
    let version = envelope[4];
    if version != BACKUP_ENVELOPE_VERSION {
        return Err(FormatError::UnsupportedVersion(version as u32).into());
    }
    let iterations = u32::from_le_bytes([envelope[5], envelope[6], envelope[7], envelope[8]]);
    if iterations == 0 || iterations > MAX_ITERATIONS {
        return Err(FormatError::Malformed(format!("backup envelope iterations {iterations}")).into());
    }

    let salt = &envelope[9..AAD_LEN];
    let iv = &envelope[AAD_LEN..HEADER_LEN];
    let kek = derive_kek(backup_key, salt, iterations);
    let plaintext = gcm_open(&kek[..], &envelope[HEADER_LEN..], iv, &envelope[..AAD_LEN])
        .map_err(|_| CryptoError::BadCredential)?;
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::error::EngineError;

    #[test]
    fn seal_then_open() {
        let blob = seal(b"snapshot bytes", "backup-key", 1000).unwrap();
        assert_eq!(&blob[..4], b"KBAK");
        assert_eq!(open(&blob, "backup-key").unwrap(), b"snapshot bytes");
    }

    #[test]
    fn wrong_key_is_bad_credential() {
        let blob = seal(b"snapshot bytes", "backup-key", 1000).unwrap();
        assert!(matches!(
            open(&blob, "other-key"),
            Err(EngineError::Crypto(CryptoError::BadCredential))
        ));
    }

    #[test]
    fn header_is_authenticated() {
        let mut blob = seal(b"snapshot bytes", "backup-key", 1000).unwrap();
        blob[10] ^= 0x01; // salt byte
        assert!(open(&blob, "backup-key").is_err());
    }

    #[test]
    fn framing_errors() {
        assert!(matches!(
            open(b"KBAK", "k"),
            Err(EngineError::Format(FormatError::Truncated { .. }))
        ));
        let mut blob = seal(b"x", "k", 1000).unwrap();
        blob[0] = b'X';
        assert!(matches!(open(&blob, "k"), Err(EngineError::Format(FormatError::BadMagic))));
        blob[0] = b'K';
        blob[4] = 9;
        assert!(matches!(
            open(&blob, "k"),
            Err(EngineError::Format(FormatError::UnsupportedVersion(9)))
        ));
    }

    #[test]
    fn empty_key_refused() {
        assert!(seal(b"x", "", 1000).is_err());
    }
}
