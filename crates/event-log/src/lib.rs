//! Append-only structured JSON-lines event logging for tapproxy.
//!
//! Session lifecycle, rule-driven drops, and rule reloads are recorded as
//! newline-terminated JSON objects appended to a log file -- a
//! [JSON Lines](https://jsonlines.org/) stream that is easy to ship, parse,
//! and replay. Producers hold a cheap [`EventSink`] handle; a background
//! task owns the file and flushes periodically.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use event_log::{EventEntry, EventKind, EventSink, EventSource};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (sink, _handle) = EventSink::start("/var/log/tapproxy/events.jsonl").await?;
//!
//! sink.log(EventEntry::new(
//!     EventKind::ProcessStarted,
//!     EventSource::new("tapproxy"),
//!     serde_json::json!({"version": "0.1.0"}),
//! ))
//! .await;
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod sink;

// Re-export primary public types at the crate root for convenience.
pub use entry::{EventEntry, EventKind, EventSource};
pub use sink::{EventSink, EventWriteError};
