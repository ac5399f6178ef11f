// ── kmem: Snapshot Codec ───────────────────────────────────────────────────
//
// Binary framing for a whole-store snapshot (integers little-endian):
//
//   [4]  magic "KMEM"
//   [4]  header_len
//   [..] header JSON   (EncryptedSnapshotHeader)
//   [4]  payload_len
//   [..] payload JSON  (EncryptedSnapshotPayload, byte fields as number arrays)
//   [..] signature     (everything that remains)
//
// Decoding is pure and never touches engine state. The codec does not
// verify the signature; that needs the DEK and happens in the store.

use crate::atoms::constants::{SNAPSHOT_FORMAT_VERSION, SNAPSHOT_MAGIC};
use crate::atoms::crypto_types::{
    EncryptedSnapshot, EncryptedSnapshotHeader, EncryptedSnapshotPayload,
};
use crate::atoms::error::FormatError;

pub type FormatResult<T> = Result<T, FormatError>;

const LEN_PREFIX: usize = 4;

/// Canonical bytes covered by the snapshot signature: header JSON ‖ payload JSON.
pub fn signing_input(
    header: &EncryptedSnapshotHeader,
    payload: &EncryptedSnapshotPayload,
) -> FormatResult<Vec<u8>> {
    let mut out = header_json(header)?;
    out.extend_from_slice(&payload_json(payload)?);
    Ok(out)
}

fn header_json(header: &EncryptedSnapshotHeader) -> FormatResult<Vec<u8>> {
    serde_json::to_vec(header).map_err(|e| FormatError::Malformed(format!("header: {e}")))
}

fn payload_json(payload: &EncryptedSnapshotPayload) -> FormatResult<Vec<u8>> {
    serde_json::to_vec(payload).map_err(|e| FormatError::Malformed(format!("payload: {e}")))
}

fn put_section(out: &mut Vec<u8>, bytes: &[u8]) -> FormatResult<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| FormatError::Malformed(format!("section of {} bytes is too large", bytes.len())))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

/// Encode a snapshot. Deterministic: identical input, identical bytes.
pub fn serialize(snapshot: &EncryptedSnapshot) -> FormatResult<Vec<u8>> {
    let header = header_json(&snapshot.header)?;
    let payload = payload_json(&snapshot.payload)?;

    let mut out = Vec::with_capacity(
        SNAPSHOT_MAGIC.len() + 2 * LEN_PREFIX + header.len() + payload.len() + snapshot.signature.len(),
    );
    out.extend_from_slice(&SNAPSHOT_MAGIC);
    put_section(&mut out, &header)?;
    put_section(&mut out, &payload)?;
    out.extend_from_slice(&snapshot.signature);
    Ok(out)
}

// ── Decoding ───────────────────────────────────────────────────────────────

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, section: &'static str, len: usize) -> FormatResult<&'a [u8]> {
        if len > self.buf.len() {
            return Err(FormatError::Truncated {
                section,
                declared: len,
                remaining: self.buf.len(),
            });
        }
        let (head, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(head)
    }

    fn take_len(&mut self, section: &'static str) -> FormatResult<usize> {
        let raw = self.take(section, LEN_PREFIX)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize)
    }

    fn take_section(&mut self, section: &'static str) -> FormatResult<&'a [u8]> {
        let len = self.take_len(section)?;
        self.take(section, len)
    }
}

/// Decode snapshot bytes.
///
/// Fails with `BadMagic`, `Truncated` when any declared length runs past the
/// buffer, `Malformed` on bad JSON, and `UnsupportedVersion` for headers newer
/// than this build understands.
pub fn deserialize(bytes: &[u8]) -> FormatResult<EncryptedSnapshot> {
    let mut reader = Reader { buf: bytes };

    let magic = reader.take("magic", SNAPSHOT_MAGIC.len())?;
    if magic != SNAPSHOT_MAGIC {
        return Err(FormatError::BadMagic);
    }

    let header_bytes = reader.take_section("header")?;
    let header: EncryptedSnapshotHeader = serde_json::from_slice(header_bytes)
        .map_err(|e| FormatError::Malformed(format!("header: {e}")))?;
    if header.version == 0 || header.version > SNAPSHOT_FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion(header.version));
    }

    let payload_bytes = reader.take_section("payload")?;
    let payload: EncryptedSnapshotPayload = serde_json::from_slice(payload_bytes)
        .map_err(|e| FormatError::Malformed(format!("payload: {e}")))?;

    Ok(EncryptedSnapshot {
        header,
        payload,
        signature: reader.buf.to_vec(),
    })
}
