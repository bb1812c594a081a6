//! The three content-transform variants applied to each relayed chunk.
//!
//! Every variant is immutable once constructed and its
//! [`replace`](Replacer::replace) is pure: all validation happens at
//! construction time (see [`crate::config`]), so applying a replacer can
//! never fail mid-stream.

use regex::bytes::Regex;

/// A single in-flight content transform.
///
/// Replacers are chained in configuration order; each one consumes the
/// previous one's output. Implementations must be binary-safe on input --
/// a chunk is arbitrary bytes, not necessarily valid UTF-8.
pub trait Replacer: Send + Sync + std::fmt::Debug {
    /// Rewrite one chunk, returning the transformed bytes.
    fn replace(&self, input: &[u8]) -> Vec<u8>;

    /// Short human-readable description used in startup logs.
    fn describe(&self) -> String;
}

/// Literal, case-sensitive text replacement.
///
/// Scans left to right and replaces every non-overlapping occurrence of
/// `find`. Operates on the UTF-8 bytes of the configured strings, so it is
/// safe to run over binary chunks -- a chunk that does not contain the byte
/// sequence simply passes through unchanged.
#[derive(Debug)]
pub struct SubstringReplacer {
    find: String,
    replace: String,
}

impl SubstringReplacer {
    pub fn new(find: impl Into<String>, replace: impl Into<String>) -> Self {
        Self {
            find: find.into(),
            replace: replace.into(),
        }
    }
}

impl Replacer for SubstringReplacer {
    fn replace(&self, input: &[u8]) -> Vec<u8> {
        replace_all_literal(input, self.find.as_bytes(), self.replace.as_bytes())
    }

    fn describe(&self) -> String {
        format!("substring: find: {}, replace: {}", self.find, self.replace)
    }
}

/// Compiled-pattern replacement.
///
/// Every non-overlapping match is replaced by the template, which may
/// reference capture groups positionally (`$1`, `$2`, ...).
#[derive(Debug)]
pub struct RegexReplacer {
    pattern: Regex,
    template: String,
}

impl RegexReplacer {
    pub fn new(pattern: Regex, template: impl Into<String>) -> Self {
        Self {
            pattern,
            template: template.into(),
        }
    }
}

impl Replacer for RegexReplacer {
    fn replace(&self, input: &[u8]) -> Vec<u8> {
        self.pattern
            .replace_all(input, self.template.as_bytes())
            .into_owned()
    }

    fn describe(&self) -> String {
        format!(
            "regex: pattern: {}, replace: {}",
            self.pattern, self.template
        )
    }
}

/// Literal byte-for-byte replacement with no text-encoding assumption.
///
/// The only variant guaranteed binary-safe for arbitrary find/replace
/// content (the other two take their needles from text configuration).
#[derive(Debug)]
pub struct ByteReplacer {
    find: Vec<u8>,
    replace: Vec<u8>,
}

impl ByteReplacer {
    pub fn new(find: Vec<u8>, replace: Vec<u8>) -> Self {
        Self { find, replace }
    }
}

impl Replacer for ByteReplacer {
    fn replace(&self, input: &[u8]) -> Vec<u8> {
        replace_all_literal(input, &self.find, &self.replace)
    }

    fn describe(&self) -> String {
        format!("bytes: find: {:02x?}, replace: {:02x?}", self.find, self.replace)
    }
}

/// Replace every non-overlapping occurrence of `find` in `input`, scanning
/// left to right. `find` must be non-empty (enforced at construction).
fn replace_all_literal(input: &[u8], find: &[u8], replace: &[u8]) -> Vec<u8> {
    debug_assert!(!find.is_empty());

    let mut out = Vec::with_capacity(input.len());
    let mut cursor = 0;

    while cursor + find.len() <= input.len() {
        match input[cursor..]
            .windows(find.len())
            .position(|window| window == find)
        {
            Some(rel) => {
                let at = cursor + rel;
                out.extend_from_slice(&input[cursor..at]);
                out.extend_from_slice(replace);
                cursor = at + find.len();
            }
            None => break,
        }
    }

    out.extend_from_slice(&input[cursor..]);
    out
}
