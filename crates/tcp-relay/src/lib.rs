//! TCP relay core for tapproxy.
//!
//! Accepts local connections, dials a matching remote connection
//! (optionally unwrapping TLS on the remote leg), and relays bytes
//! bidirectionally. Every chunk passes through the configured
//! [`Replacer`](rewrite_engine::Replacer) chain; outbound chunks are
//! additionally run through the optional report-only matcher and the
//! rule scanner, whose verdict can terminate the session.
//!
//! # Architecture
//!
//! ```text
//! Client  <--TCP-->  Relay  <--TCP/TLS-->  Remote
//!                      |
//!              [Replacer Chain]
//!              [Rule Scanner]
//!                      |
//!               [Event Sink]
//! ```
//!
//! Each accepted connection becomes a [`Session`] running two concurrent
//! [`Pump`](pump::Pump)s, one per direction. The first termination cause
//! (EOF, I/O error, or rule drop) closes both legs exactly once.

pub mod listener;
pub mod pool;
pub mod pump;
pub mod session;

// Re-export the primary public types at the crate root.
pub use listener::{Relay, RelayConfig};
pub use pool::ChunkPool;
pub use pump::{Direction, Matcher, Termination};
pub use session::{Session, SessionConfig, SessionEnv};
