//! # rule-scan
//!
//! Pattern rules for the tapproxy relay: compile rule sources into
//! immutable [`RuleSet`]s, scan relayed chunks, and dispatch the matching
//! rules' actions (log / warn / drop).
//!
//! The crate is organised around four layers:
//!
//! 1. **[`schema`]** -- the parsed rule contract (identifier, tags,
//!    patterns, metadata) and its validation.
//! 2. **[`compile`]** -- one-shot compilation into a
//!    [`RegexSet`](regex::bytes::RegexSet)-backed [`RuleSet`] and per-chunk
//!    scanning.
//! 3. **[`cache`] / [`watcher`]** -- the single-generation mtime-keyed
//!    [`RuleSetCache`] and the background hot-reload task that swaps the
//!    shared [`ActiveRules`] slot.
//! 4. **[`action`]** -- tag dispatch collapsing a chunk's matches into a
//!    [`ScanVerdict`].

pub mod action;
pub mod cache;
pub mod compile;
pub mod schema;
pub mod watcher;

// Re-export the primary public types at the crate root.
pub use action::{dispatch, ScanVerdict};
pub use cache::RuleSetCache;
pub use compile::{CompileError, CompiledRule, RuleMatch, RuleSet};
pub use schema::{PatternDef, RuleDef, RuleFile, SchemaError};
pub use watcher::{ActiveRules, ReloadEvent, RuleWatcher};
