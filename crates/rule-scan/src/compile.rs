//! Rule-set compilation and chunk scanning.
//!
//! A [`RuleSet`] is compiled from rule-source text in one shot: a compile
//! failure is fatal to that attempt only and produces no partially built
//! set. The compiled set is immutable and backed by a single
//! [`RegexSet`](regex::bytes::RegexSet) over every pattern of every rule,
//! with individually compiled regexes kept alongside for extracting match
//! offsets.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::SystemTime;

use regex::bytes::{Regex, RegexSet};

use crate::schema::{self, PatternDef, RuleFile, SchemaError};

/// Why a compile attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("rule source is not valid YAML: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("failed to assemble pattern set: {0}")]
    PatternSet(#[from] regex::Error),
}

/// One rule after compilation.
#[derive(Debug)]
pub struct CompiledRule {
    pub name: String,
    /// Tags lowercased at compile time so dispatch is case-insensitive.
    tags: Vec<String>,
    /// Parsed `sub` metadata, surfaced but never applied to the stream.
    pub substitution: Option<Vec<u8>>,
    pub meta: BTreeMap<String, String>,
}

impl CompiledRule {
    /// Case-insensitive tag lookup (`tag` must be lowercase).
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// An immutable compiled collection of rules, stamped with the source
/// modification time it was built from.
#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
    set: RegexSet,
    /// Individually compiled patterns, parallel to the set, for offsets.
    individual: Vec<Regex>,
    /// Pattern index -> owning rule index.
    owner: Vec<usize>,
    mtime: SystemTime,
}

/// An ephemeral match produced by one [`RuleSet::scan`] call: one matching
/// pattern of one rule, with every offset it matched at within the chunk.
/// Consumed immediately by action dispatch, never persisted.
pub struct RuleMatch<'a> {
    pub rule: &'a CompiledRule,
    /// Index of the matching pattern within the whole set.
    pub pattern_index: usize,
    pub offsets: Vec<usize>,
}

impl RuleSet {
    /// Compile rule-source text into an immutable set, or fail the whole
    /// attempt.
    pub fn compile(source: &str, mtime: SystemTime) -> Result<Self, CompileError> {
        let file: RuleFile = serde_yml::from_str(source)?;
        schema::validate(&file)?;

        let mut rules = Vec::with_capacity(file.rules.len());
        let mut patterns: Vec<String> = Vec::new();
        let mut owner = Vec::new();

        for (rule_index, def) in file.rules.into_iter().enumerate() {
            for pattern in &def.patterns {
                patterns.push(literal_pattern(pattern));
                owner.push(rule_index);
            }

            let substitution = match def.meta.get("sub") {
                Some(raw) => Some(schema::parse_sub_bytes(raw).map_err(|reason| {
                    SchemaError::MalformedSub {
                        rule: def.name.clone(),
                        reason,
                    }
                })?),
                None => None,
            };

            rules.push(CompiledRule {
                name: def.name,
                tags: def.tags.iter().map(|t| t.to_ascii_lowercase()).collect(),
                substitution,
                meta: def.meta,
            });
        }

        let individual = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        let set = RegexSet::new(&patterns)?;

        Ok(Self {
            rules,
            set,
            individual,
            owner,
            mtime,
        })
    }

    /// Scan one chunk and return every matching (rule, pattern) pair with
    /// its offsets, ordered by first offset.
    ///
    /// Patterns never span chunks: a match is found only within the bytes
    /// passed to this call.
    pub fn scan(&self, chunk: &[u8]) -> Vec<RuleMatch<'_>> {
        let mut matches: Vec<RuleMatch<'_>> = Vec::new();

        for pattern_index in self.set.matches(chunk) {
            let offsets: Vec<usize> = self.individual[pattern_index]
                .find_iter(chunk)
                .map(|m| m.start())
                .collect();
            matches.push(RuleMatch {
                rule: &self.rules[self.owner[pattern_index]],
                pattern_index,
                offsets,
            });
        }

        matches.sort_by_key(|m| m.offsets.first().copied().unwrap_or(usize::MAX));
        matches
    }

    /// The source modification time this set was compiled from.
    pub fn mtime(&self) -> SystemTime {
        self.mtime
    }

    /// Number of rules in the set.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }
}

/// Render one pattern as a literal regex.
///
/// Text patterns are escaped and match their UTF-8 bytes; byte patterns are
/// rendered as `(?s-u)\xNN...` so the set matches arbitrary binary content.
fn literal_pattern(pattern: &PatternDef) -> String {
    match pattern {
        PatternDef::Text(text) => regex::escape(text),
        PatternDef::Bytes(bytes) => {
            let mut out = String::with_capacity(6 + bytes.len() * 4);
            out.push_str("(?s-u)");
            for b in bytes {
                let _ = write!(out, r"\x{b:02x}");
            }
            out
        }
    }
}
