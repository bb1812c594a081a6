//! Parsed rule-source contract.
//!
//! The textual rule language is owned by the rule file; this module only
//! defines the parsed shape (identifier, tags, ordered patterns, metadata)
//! and the validation run after deserialization.

use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;

/// Top-level rule document.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleFile {
    /// Schema version; currently must be "1.0".
    pub version: String,
    #[serde(default)]
    pub rules: Vec<RuleDef>,
}

/// A single parsed rule.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleDef {
    /// Unique rule identifier, used in logs and drop attribution.
    pub name: String,
    /// Action tags (`log`, `warn`, `drop`), matched case-insensitively.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Ordered patterns; a rule fires when any pattern matches a chunk.
    #[serde(default)]
    pub patterns: Vec<PatternDef>,
    /// Free-form key/value metadata. The `sub` key, when present, names an
    /// intended replacement for the matched bytes (parsed, never applied).
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

/// A pattern: literal text or a literal byte sequence.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PatternDef {
    Text(String),
    Bytes(Vec<u8>),
}

/// Errors produced by post-deserialization validation.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("unsupported rules version '{0}'; only '1.0' is supported")]
    Version(String),
    #[error("rule name must not be empty")]
    EmptyName,
    #[error("duplicate rule name: '{0}'")]
    DuplicateName(String),
    #[error("rule '{0}' has no patterns")]
    NoPatterns(String),
    #[error("rule '{rule}': malformed sub metadata: {reason}")]
    MalformedSub { rule: String, reason: String },
}

/// Validate a parsed [`RuleFile`]: version gate, unique non-empty names,
/// at least one pattern per rule.
pub fn validate(file: &RuleFile) -> Result<(), SchemaError> {
    if file.version != "1.0" {
        return Err(SchemaError::Version(file.version.clone()));
    }

    let mut seen = HashSet::new();
    for rule in &file.rules {
        if rule.name.is_empty() {
            return Err(SchemaError::EmptyName);
        }
        if !seen.insert(&rule.name) {
            return Err(SchemaError::DuplicateName(rule.name.clone()));
        }
        if rule.patterns.is_empty() {
            return Err(SchemaError::NoPatterns(rule.name.clone()));
        }
    }

    Ok(())
}

/// Parse a `sub` metadata value: a bracketed, space-separated hexadecimal
/// byte sequence such as `{ 41 41 41 41 }`.
pub fn parse_sub_bytes(raw: &str) -> Result<Vec<u8>, String> {
    let inner = raw
        .trim()
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| format!("expected a braced byte sequence, got '{raw}'"))?;

    inner
        .split_whitespace()
        .map(|token| {
            u8::from_str_radix(token, 16).map_err(|_| format!("invalid hex byte '{token}'"))
        })
        .collect()
}
