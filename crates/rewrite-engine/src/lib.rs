//! # rewrite-engine
//!
//! In-flight content rewriting for the tapproxy relay. Each chunk flowing
//! through a connection is passed through an ordered chain of
//! [`Replacer`] implementations built once from parsed configuration.
//!
//! The crate is organised around two layers:
//!
//! 1. **[`replacer`]** -- the [`Replacer`] capability and its three
//!    variants: literal substring, compiled regex with `$N` capture
//!    templates, and raw byte sequences.
//! 2. **[`config`]** -- the parsed `{type, find, replace}` contract, a
//!    factory keyed by the type tag, and chain construction that aggregates
//!    per-item validation errors alongside the partial chain.
//!
//! ## Quick start
//!
//! ```rust
//! use rewrite_engine::{build_chain, ReplacerSpec, SpecValue};
//!
//! let specs = vec![ReplacerSpec {
//!     kind: "substring".into(),
//!     find: Some(SpecValue::Text("foo".into())),
//!     replace: Some(SpecValue::Text("bar".into())),
//! }];
//! let load = build_chain(&specs);
//! assert_eq!(load.chain[0].replace(b"a foo"), b"a bar");
//! ```

pub mod config;
pub mod replacer;

// Re-export the primary public types at the crate root.
pub use config::{build, build_chain, ChainItemError, ChainLoad, ReplacerSpec, SpecError, SpecValue};
pub use replacer::{ByteReplacer, RegexReplacer, Replacer, SubstringReplacer};
