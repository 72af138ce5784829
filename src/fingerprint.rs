// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record sanitization, natural keys, and content fingerprints.
//!
//! Sanitization is an ordered list of named [`NormalizationRule`]s applied to
//! text fields before a record reaches the sink. It never fails: input no rule
//! applies to passes through unchanged.
//!
//! | Rule | Fields | Effect |
//! |------|--------|--------|
//! | `nul_placeholder` | all text | `\0` → `?` |
//! | `collapse_keyword_whitespace` | `sql_text` | `UNLOCK   x` → `UNLOCKx` |
//!
//! # Identity
//!
//! [`IdentityStrategy::Random`] assigns a fresh UUID v4 per insert.
//! [`IdentityStrategy::ContentDerived`] assigns a UUID v5 over the content
//! fingerprint, so the same event always maps to the same identity.

use crate::record::{AuditField, AuditRecord, NaturalKey};
use crate::source::Value;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::sync::LazyLock;
use tracing::trace;
use uuid::Uuid;

/// Namespace for content-derived identities. Changing it changes every
/// content-derived uuid.
const IDENTITY_NAMESPACE: Uuid = Uuid::from_u128(0x6c1f_2a4e_93b7_5d08_a1c4_7e2f_0b9d_3a61);

static UNLOCK_WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(UNLOCK)\s+").expect("static pattern is valid"));

/// How sink identities are assigned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStrategy {
    /// Fresh UUID v4 per insert. The identity check cannot fire.
    #[default]
    Random,
    /// UUID v5 over the content fingerprint.
    ContentDerived,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rules
// ═══════════════════════════════════════════════════════════════════════════════

/// A named text normalization.
#[derive(Debug, Clone)]
pub enum NormalizationRule {
    /// Replace every NUL with a placeholder character.
    NulPlaceholder { placeholder: char },
    /// Drop the whitespace run directly after `keyword` in `sql_text`.
    CollapseKeywordWhitespace { keyword: String, pattern: Regex },
}

impl NormalizationRule {
    pub fn nul_placeholder() -> Self {
        Self::NulPlaceholder { placeholder: '?' }
    }

    /// The `UNLOCK` rule.
    pub fn collapse_unlock_whitespace() -> Self {
        Self::CollapseKeywordWhitespace {
            keyword: "UNLOCK".to_string(),
            pattern: UNLOCK_WHITESPACE.clone(),
        }
    }

    /// Collapse whitespace after an arbitrary keyword. Matching is case-sensitive.
    pub fn collapse_keyword_whitespace(keyword: &str) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&format!(r"({})\s+", regex::escape(keyword)))?;
        Ok(Self::CollapseKeywordWhitespace {
            keyword: keyword.to_string(),
            pattern,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NulPlaceholder { .. } => "nul_placeholder",
            Self::CollapseKeywordWhitespace { .. } => "collapse_keyword_whitespace",
        }
    }

    fn applies_to(&self, field: AuditField) -> bool {
        match self {
            Self::NulPlaceholder { .. } => true,
            Self::CollapseKeywordWhitespace { .. } => field == AuditField::SqlText,
        }
    }

    /// Apply to one string. Borrowed result means nothing changed.
    pub fn apply<'a>(&self, text: &'a str) -> Cow<'a, str> {
        match self {
            Self::NulPlaceholder { placeholder } => {
                if text.contains('\0') {
                    Cow::Owned(text.replace('\0', placeholder.encode_utf8(&mut [0; 4])))
                } else {
                    Cow::Borrowed(text)
                }
            }
            Self::CollapseKeywordWhitespace { pattern, .. } => pattern.replace_all(text, "$1"),
        }
    }

    fn rewrite(&self, text: &str) -> Option<String> {
        match self.apply(text) {
            Cow::Owned(changed) => Some(changed),
            Cow::Borrowed(_) => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RecordFingerprinter
// ═══════════════════════════════════════════════════════════════════════════════

/// Sanitizes records and derives their keys and fingerprints.
#[derive(Debug, Clone)]
pub struct RecordFingerprinter {
    rules: Vec<NormalizationRule>,
}

impl Default for RecordFingerprinter {
    fn default() -> Self {
        Self::new(vec![
            NormalizationRule::nul_placeholder(),
            NormalizationRule::collapse_unlock_whitespace(),
        ])
    }
}

impl RecordFingerprinter {
    /// Build with an explicit ordered rule set.
    pub fn new(rules: Vec<NormalizationRule>) -> Self {
        Self { rules }
    }

    /// Append a rule after the existing ones.
    #[must_use]
    pub fn with_rule(mut self, rule: NormalizationRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[NormalizationRule] {
        &self.rules
    }

    /// Apply every rule, in order, to every text field it covers.
    pub fn sanitize(&self, mut record: AuditRecord) -> AuditRecord {
        let rules = &self.rules;
        record.for_each_text_mut(|field, text| {
            for rule in rules.iter().filter(|r| r.applies_to(field)) {
                if let Some(changed) = rule.rewrite(text) {
                    trace!(rule = rule.name(), field = field.column(), "Normalized text field");
                    *text = changed;
                }
            }
        });
        record
    }

    /// Sanitize a single string as if it were `field`.
    pub fn sanitize_text(&self, field: AuditField, text: &str) -> String {
        let mut out = text.to_string();
        for rule in self.rules.iter().filter(|r| r.applies_to(field)) {
            if let Some(changed) = rule.rewrite(&out) {
                out = changed;
            }
        }
        out
    }

    pub fn natural_key(&self, record: &AuditRecord) -> NaturalKey {
        record.natural_key()
    }

    /// Hex SHA-256 over the record's content fields in canonical order.
    ///
    /// Each field is written as `column`, a type tag, and a length-prefixed
    /// value, so adjacent fields cannot run together. `rnum` is excluded.
    pub fn content_fingerprint(&self, record: &AuditRecord) -> String {
        let mut hasher = Sha256::new();
        for field in AuditField::ALL.iter().filter(|f| f.is_content()) {
            hasher.update(field.column().as_bytes());
            hasher.update([0x1f]);
            match record.value_of(*field) {
                Value::Null => hasher.update(b"N"),
                Value::Integer(i) => {
                    hasher.update(b"I");
                    hasher.update(i.to_be_bytes());
                }
                Value::Real(r) => {
                    hasher.update(b"R");
                    hasher.update(r.to_bits().to_be_bytes());
                }
                Value::Text(s) => {
                    hasher.update(b"T");
                    hasher.update((s.len() as u64).to_be_bytes());
                    hasher.update(s.as_bytes());
                }
                Value::Timestamp(t) => {
                    hasher.update(b"L");
                    hasher.update(t.and_utc().timestamp_nanos_opt().unwrap_or(i64::MIN).to_be_bytes());
                }
                Value::TimestampUtc(t) => {
                    hasher.update(b"U");
                    hasher.update(t.timestamp_nanos_opt().unwrap_or(i64::MIN).to_be_bytes());
                }
            }
            hasher.update([0x1e]);
        }
        hex::encode(hasher.finalize())
    }

    /// Identity for a record about to be inserted.
    pub fn assign_identity(&self, record: &AuditRecord, strategy: IdentityStrategy) -> String {
        match strategy {
            IdentityStrategy::Random => Uuid::new_v4().to_string(),
            IdentityStrategy::ContentDerived => {
                let fingerprint = self.content_fingerprint(record);
                Uuid::new_v5(&IDENTITY_NAMESPACE, fingerprint.as_bytes()).to_string()
            }
        }
    }
}
