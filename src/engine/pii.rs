// ── kmem: PII Guard ────────────────────────────────────────────────────────
//
// Regex-based PII detection run on every memory before it is stored.
// A hit marks the item `sensitive` (excluded from recall unless the caller
// opts in) unless the caller set the flag explicitly.
//
// Also home to input validation and log redaction: no log line in this crate
// prints memory content without passing through `safe_log_preview`.

use log::warn;
use regex::Regex;
use std::sync::LazyLock;

use crate::atoms::constants::{MAX_MEMORY_CONTENT_BYTES, MAX_TAG_LENGTH, MAX_TOPIC_TAGS};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::NewMemory;

// ═════════════════════════════════════════════════════════════════════════════
// PII Kinds
// ═════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiiKind {
    NationalId,
    Email,
    PaymentCard,
    Phone,
    Credential,
    HomeLocation,
    Health,
}

impl std::fmt::Display for PiiKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NationalId => write!(f, "national_id"),
            Self::Email => write!(f, "email"),
            Self::PaymentCard => write!(f, "payment_card"),
            Self::Phone => write!(f, "phone"),
            Self::Credential => write!(f, "credential"),
            Self::HomeLocation => write!(f, "home_location"),
            Self::Health => write!(f, "health"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PiiScan {
    pub kinds: Vec<PiiKind>,
}

impl PiiScan {
    pub fn has_pii(&self) -> bool {
        !self.kinds.is_empty()
    }
}

// ═════════════════════════════════════════════════════════════════════════════
// Patterns (compiled once)
// ═════════════════════════════════════════════════════════════════════════════

struct PiiPattern {
    regex: Regex,
    kind: PiiKind,
}

static PII_PATTERNS: LazyLock<Vec<PiiPattern>> = LazyLock::new(|| {
    let patterns: [(&str, PiiKind); 7] = [
        // US SSN shape: 123-45-6789
        (r"\b\d{3}-\d{2}-\d{4}\b", PiiKind::NationalId),
        (
            r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
            PiiKind::Email,
        ),
        (
            r"\b\d{4}[\s-]?\d{4}[\s-]?\d{4}[\s-]?\d{4}\b",
            PiiKind::PaymentCard,
        ),
        (r"\b\d{3}[-.\s]?\d{3}[-.\s]?\d{4}\b", PiiKind::Phone),
        (
            r"(?i)\b(password|passcode|pin|secret|api.?key)\s*(is|=|:)\s*\S+",
            PiiKind::Credential,
        ),
        (
            r"(?i)\b(i\s+live\s+(in|at|on)|my\s+address\s+is)\s+",
            PiiKind::HomeLocation,
        ),
        (
            r"(?i)\b(diagnosed\s+with|my\s+(medication|prescription)s?\b)",
            PiiKind::Health,
        ),
    ];

    patterns
        .into_iter()
        .filter_map(|(pattern, kind)| match Regex::new(pattern) {
            Ok(regex) => Some(PiiPattern { regex, kind }),
            Err(e) => {
                warn!("[kmem-pii] Failed to compile pattern for {}: {}", kind, e);
                None
            }
        })
        .collect()
});

// ═════════════════════════════════════════════════════════════════════════════
// Detection
// ═════════════════════════════════════════════════════════════════════════════

pub fn detect_pii(content: &str) -> PiiScan {
    let kinds = PII_PATTERNS
        .iter()
        .filter(|p| p.regex.is_match(content))
        .map(|p| p.kind)
        .collect();
    PiiScan { kinds }
}

/// Final `sensitive` flag for a new memory: the caller's explicit choice wins,
/// otherwise any PII hit marks it sensitive.
pub fn resolve_sensitive(explicit: Option<bool>, content: &str) -> bool {
    explicit.unwrap_or_else(|| detect_pii(content).has_pii())
}

// ═════════════════════════════════════════════════════════════════════════════
// Input Validation
// ═════════════════════════════════════════════════════════════════════════════

/// Validate a memory before it reaches the crypto layer.
/// Dimension checks happen in the index, not here.
pub fn validate_memory_input(memory: &NewMemory) -> EngineResult<()> {
    if memory.owner_id.trim().is_empty() {
        return Err(EngineError::InvalidInput("owner_id cannot be empty".into()));
    }
    if memory.content.trim().is_empty() {
        return Err(EngineError::InvalidInput(
            "Memory content cannot be empty".into(),
        ));
    }
    if memory.content.len() > MAX_MEMORY_CONTENT_BYTES {
        return Err(EngineError::InvalidInput(format!(
            "Memory content exceeds maximum size ({} bytes > {} bytes)",
            memory.content.len(),
            MAX_MEMORY_CONTENT_BYTES
        )));
    }
    if memory.content.contains('\0') || memory.owner_id.contains('\0') {
        return Err(EngineError::InvalidInput(
            "Memory content/owner must not contain null bytes".into(),
        ));
    }
    if !(0.0..=1.0).contains(&memory.salience) {
        return Err(EngineError::InvalidInput(format!(
            "salience must be within [0, 1], got {}",
            memory.salience
        )));
    }
    if memory.topic_tags.len() > MAX_TOPIC_TAGS {
        return Err(EngineError::InvalidInput(format!(
            "Too many topic tags ({} > {})",
            memory.topic_tags.len(),
            MAX_TOPIC_TAGS
        )));
    }
    if let Some(tag) = memory
        .topic_tags
        .iter()
        .find(|t| t.is_empty() || t.len() > MAX_TAG_LENGTH)
    {
        return Err(EngineError::InvalidInput(format!(
            "Topic tag length must be 1..={} bytes (got {})",
            MAX_TAG_LENGTH,
            tag.len()
        )));
    }
    if memory.embedding.iter().any(|x| !x.is_finite()) {
        return Err(EngineError::InvalidInput(
            "embedding contains NaN or infinite components".into(),
        ));
    }
    Ok(())
}

// ═════════════════════════════════════════════════════════════════════════════
// Log Redaction
// ═════════════════════════════════════════════════════════════════════════════

pub fn redact_for_log(content: &str) -> String {
    PII_PATTERNS.iter().fold(content.to_string(), |acc, p| {
        p.regex.replace_all(&acc, "[REDACTED]").into_owned()
    })
}

/// Redacted, char-boundary-safe preview of at most `max_chars` characters.
pub fn safe_log_preview(content: &str, max_chars: usize) -> String {
    let redacted = redact_for_log(content);
    match redacted.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &redacted[..cut]),
        None => redacted,
    }
}
