//! Parsed replacer-config contract and chain construction.
//!
//! The on-disk syntax belongs to the config loader; this module only
//! consumes the parsed shape: an ordered list of `{type, find, replace}`
//! items where `find` / `replace` are each a text value or a byte list.
//!
//! Validation is per-item, not fail-fast: every malformed item is collected
//! into the returned error list while all well-formed items are still
//! assembled into the chain, so a single typo does not take down the whole
//! pipeline.

use regex::bytes::Regex;
use serde::Deserialize;

use crate::replacer::{ByteReplacer, RegexReplacer, Replacer, SubstringReplacer};

/// One parsed configuration item, as produced by the external config loader.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplacerSpec {
    /// Type tag selecting the variant (`substring`, `regex`, or `bytes`,
    /// plus the short aliases accepted by [`build`]).
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub find: Option<SpecValue>,
    #[serde(default)]
    pub replace: Option<SpecValue>,
}

/// A `find` / `replace` value: either text or a list of byte values.
///
/// Byte values deserialize as wide integers so that out-of-range elements
/// (e.g. `256`) survive parsing and can be rejected with their index during
/// validation instead of failing the whole document.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SpecValue {
    Text(String),
    Bytes(Vec<i64>),
}

/// Why a single configuration item was rejected.
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("unsupported replacer type: <{0}>")]
    UnknownType(String),
    #[error("no find text provided")]
    MissingFind,
    #[error("find is not a text value")]
    FindNotText,
    #[error("replacement is not a text value")]
    ReplaceNotText,
    #[error("failed to compile regex: {0}")]
    BadPattern(#[from] regex::Error),
    #[error("no search bytes provided")]
    MissingFindBytes,
    #[error("find is not a byte list")]
    FindNotBytes,
    #[error("replacement is not a byte list")]
    ReplaceNotBytes,
    #[error("byte value {value} at index {index} is out of range (0-255)")]
    ByteOutOfRange { index: usize, value: i64 },
}

/// A [`SpecError`] tagged with the position of the offending item.
#[derive(Debug, thiserror::Error)]
#[error("replacer item {index}: {source}")]
pub struct ChainItemError {
    pub index: usize,
    #[source]
    pub source: SpecError,
}

/// The outcome of loading a replacer list: the chain of every item that
/// validated, plus the errors for every item that did not.
///
/// A non-empty [`errors`](Self::errors) means "some items were dropped",
/// never total failure -- callers log each error and proceed with the
/// partial chain.
pub struct ChainLoad {
    pub chain: Vec<Box<dyn Replacer>>,
    pub errors: Vec<ChainItemError>,
}

impl ChainLoad {
    /// True when at least one item failed validation.
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Build a single replacer from its parsed spec, validating eagerly.
pub fn build(spec: &ReplacerSpec) -> Result<Box<dyn Replacer>, SpecError> {
    match spec.kind.as_str() {
        "substring" | "str" | "string" | "ss" | "substr" => {
            let find = require_text(spec.find.as_ref())?;
            let replace = optional_text(spec.replace.as_ref())?;
            Ok(Box::new(SubstringReplacer::new(find, replace)))
        }
        "regex" | "regexp" | "re" | "reg" => {
            let pattern = require_text(spec.find.as_ref())?;
            let template = optional_text(spec.replace.as_ref())?;
            let compiled = Regex::new(&pattern)?;
            Ok(Box::new(RegexReplacer::new(compiled, template)))
        }
        "bytes" => {
            let find = require_bytes(spec.find.as_ref())?;
            let replace = optional_bytes(spec.replace.as_ref())?;
            Ok(Box::new(ByteReplacer::new(find, replace)))
        }
        other => Err(SpecError::UnknownType(other.to_string())),
    }
}

/// Build the full chain, collecting per-item failures instead of aborting.
pub fn build_chain(specs: &[ReplacerSpec]) -> ChainLoad {
    let mut chain: Vec<Box<dyn Replacer>> = Vec::with_capacity(specs.len());
    let mut errors = Vec::new();

    for (index, spec) in specs.iter().enumerate() {
        match build(spec) {
            Ok(replacer) => chain.push(replacer),
            Err(source) => errors.push(ChainItemError { index, source }),
        }
    }

    ChainLoad { chain, errors }
}

fn require_text(value: Option<&SpecValue>) -> Result<String, SpecError> {
    match value {
        Some(SpecValue::Text(s)) if !s.is_empty() => Ok(s.clone()),
        Some(SpecValue::Text(_)) | None => Err(SpecError::MissingFind),
        Some(SpecValue::Bytes(_)) => Err(SpecError::FindNotText),
    }
}

fn optional_text(value: Option<&SpecValue>) -> Result<String, SpecError> {
    match value {
        Some(SpecValue::Text(s)) => Ok(s.clone()),
        None => Ok(String::new()),
        Some(SpecValue::Bytes(_)) => Err(SpecError::ReplaceNotText),
    }
}

fn require_bytes(value: Option<&SpecValue>) -> Result<Vec<u8>, SpecError> {
    match value {
        Some(SpecValue::Bytes(values)) if !values.is_empty() => narrow_bytes(values),
        Some(SpecValue::Bytes(_)) | None => Err(SpecError::MissingFindBytes),
        Some(SpecValue::Text(_)) => Err(SpecError::FindNotBytes),
    }
}

fn optional_bytes(value: Option<&SpecValue>) -> Result<Vec<u8>, SpecError> {
    match value {
        Some(SpecValue::Bytes(values)) => narrow_bytes(values),
        None => Ok(Vec::new()),
        Some(SpecValue::Text(_)) => Err(SpecError::ReplaceNotBytes),
    }
}

/// Check every element is within `0..=255` and narrow to `u8`.
fn narrow_bytes(values: &[i64]) -> Result<Vec<u8>, SpecError> {
    values
        .iter()
        .enumerate()
        .map(|(index, &value)| {
            u8::try_from(value).map_err(|_| SpecError::ByteOutOfRange { index, value })
        })
        .collect()
}
