//! The directional pump: one read-transform-write loop per direction.
//!
//! Per chunk, the local-to-remote direction runs: (1) the optional
//! report-only matcher over the raw bytes, (2) the replacer chain in
//! configured order, (3) a scan of the transformed bytes against the
//! current rule set with action dispatch, (4) the write. The reverse
//! direction runs only the replacer chain. Patterns and replacements never
//! span two read chunks.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rewrite_engine::Replacer;
use rule_scan::{dispatch, ActiveRules, ScanVerdict};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::pool::ChunkPool;

/// Read-only callback run over every raw outbound chunk, for reporting
/// only -- it never mutates the stream.
pub type Matcher = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Which leg of the session a pump drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// local -> remote; bytes counted as "sent".
    Outbound,
    /// remote -> local; bytes counted as "received".
    Inbound,
}

impl Direction {
    fn arrow(self) -> &'static str {
        match self {
            Direction::Outbound => ">>>",
            Direction::Inbound => "<<<",
        }
    }
}

/// Why a pump stopped. The first cause delivered to the session terminates
/// it; EOF is a normal close, the others are logged as warnings.
#[derive(Debug)]
pub enum Termination {
    Eof { direction: Direction },
    ReadFailed { direction: Direction, error: io::Error },
    WriteFailed { direction: Direction, error: io::Error },
    RuleDrop { rule: String },
}

/// One direction of a session: the loop state shared with nobody else
/// except the byte counter (written only by this pump) and the rule slot.
pub struct Pump {
    pub session_id: u64,
    pub direction: Direction,
    pub chain: Arc<Vec<Box<dyn Replacer>>>,
    /// Outbound only; `None` on the reverse direction.
    pub matcher: Option<Matcher>,
    /// Outbound only; `None` on the reverse direction.
    pub rules: Option<ActiveRules>,
    pub pool: Arc<ChunkPool>,
    pub counter: Arc<AtomicU64>,
    pub output_hex: bool,
}

impl Pump {
    /// Run until EOF, an I/O error, or a rule-drop verdict.
    pub async fn run<R, W>(self, mut src: R, mut dst: W) -> Termination
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            // The chunk is owned for exactly one cycle and returned to the
            // pool at the end of the iteration.
            let mut chunk = self.pool.get();

            let n = match src.read(&mut chunk).await {
                Ok(0) => {
                    return Termination::Eof {
                        direction: self.direction,
                    }
                }
                Ok(n) => n,
                Err(error) => {
                    return Termination::ReadFailed {
                        direction: self.direction,
                        error,
                    }
                }
            };
            let received = &chunk[..n];

            if let Some(matcher) = &self.matcher {
                matcher(received);
            }

            // Each replacer consumes the previous one's output.
            let mut transformed: Option<Vec<u8>> = None;
            for replacer in self.chain.iter() {
                transformed = Some(replacer.replace(transformed.as_deref().unwrap_or(received)));
            }
            let payload: &[u8] = transformed.as_deref().unwrap_or(received);

            let mut drop_rule = None;
            if let Some(rules) = &self.rules {
                if let Some(set) = rules.current().await {
                    if let ScanVerdict::Drop { rule } = dispatch(&set.scan(payload)) {
                        drop_rule = Some(rule);
                    }
                }
            }

            debug!(
                session = self.session_id,
                "{} {} bytes",
                self.direction.arrow(),
                payload.len()
            );
            if self.output_hex {
                trace!(session = self.session_id, payload = %to_hex(payload));
            } else {
                trace!(session = self.session_id, payload = %String::from_utf8_lossy(payload));
            }

            if let Err(error) = dst.write_all(payload).await {
                return Termination::WriteFailed {
                    direction: self.direction,
                    error,
                };
            }
            if let Err(error) = dst.flush().await {
                return Termination::WriteFailed {
                    direction: self.direction,
                    error,
                };
            }
            self.counter.fetch_add(payload.len() as u64, Ordering::Relaxed);

            // The matching chunk completes its cycle before the session is
            // torn down; nothing further is read.
            if let Some(rule) = drop_rule {
                return Termination::RuleDrop { rule };
            }
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewrite_engine::SubstringReplacer;
    use rule_scan::RuleSet;
    use std::time::SystemTime;
    use tokio::io::duplex;

    fn pump(direction: Direction, chain: Vec<Box<dyn Replacer>>) -> Pump {
        Pump {
            session_id: 1,
            direction,
            chain: Arc::new(chain),
            matcher: None,
            rules: None,
            pool: Arc::new(ChunkPool::with_defaults()),
            counter: Arc::new(AtomicU64::new(0)),
            output_hex: false,
        }
    }

    fn drop_rules(pattern: &str) -> ActiveRules {
        let yaml = format!(
            "version: \"1.0\"\nrules:\n  - name: \"tripwire\"\n    tags: [drop]\n    patterns: [\"{pattern}\"]\n"
        );
        let set = RuleSet::compile(&yaml, SystemTime::UNIX_EPOCH).unwrap();
        ActiveRules::preloaded(Arc::new(set))
    }

    #[tokio::test]
    async fn relays_transformed_chunks_until_eof() {
        let (mut client, src) = duplex(1024);
        let (dst, mut server) = duplex(1024);

        let p = pump(
            Direction::Outbound,
            vec![Box::new(SubstringReplacer::new("foo", "bar"))],
        );
        let counter = Arc::clone(&p.counter);
        let task = tokio::spawn(p.run(src, dst));

        client.write_all(b"say foo twice: foo").await.unwrap();
        client.shutdown().await.unwrap();

        let mut out = Vec::new();
        server.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"say bar twice: bar");

        let end = task.await.unwrap();
        assert!(matches!(
            end,
            Termination::Eof {
                direction: Direction::Outbound
            }
        ));
        assert_eq!(counter.load(Ordering::Relaxed), out.len() as u64);
    }

    #[tokio::test]
    async fn counter_reflects_bytes_actually_written() {
        let (mut client, src) = duplex(1024);
        let (dst, mut server) = duplex(1024);

        // The replacement grows the payload; the counter follows the
        // written length, not the read length.
        let p = pump(
            Direction::Inbound,
            vec![Box::new(SubstringReplacer::new("x", "xxxx"))],
        );
        let counter = Arc::clone(&p.counter);
        let task = tokio::spawn(p.run(src, dst));

        client.write_all(b"x").await.unwrap();
        client.shutdown().await.unwrap();

        let mut out = Vec::new();
        server.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"xxxx");

        task.await.unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn matcher_sees_raw_bytes_before_replacement() {
        let (mut client, src) = duplex(1024);
        let (dst, mut server) = duplex(1024);

        let observed: Arc<std::sync::Mutex<Vec<u8>>> = Arc::default();
        let observed_cb = Arc::clone(&observed);

        let mut p = pump(
            Direction::Outbound,
            vec![Box::new(SubstringReplacer::new("raw", "cooked"))],
        );
        p.matcher = Some(Arc::new(move |chunk: &[u8]| {
            observed_cb.lock().unwrap().extend_from_slice(chunk);
        }));
        let task = tokio::spawn(p.run(src, dst));

        client.write_all(b"raw data").await.unwrap();
        client.shutdown().await.unwrap();

        let mut out = Vec::new();
        server.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"cooked data");
        // The matcher saw the pre-replacement bytes.
        assert_eq!(observed.lock().unwrap().as_slice(), b"raw data");

        task.await.unwrap();
    }

    #[tokio::test]
    async fn drop_rule_ends_the_pump_after_the_matching_chunk_is_written() {
        let (mut client, src) = duplex(1024);
        let (dst, mut server) = duplex(1024);

        let mut p = pump(Direction::Outbound, Vec::new());
        p.rules = Some(drop_rules("BOOM"));
        let task = tokio::spawn(p.run(src, dst));

        client.write_all(b"prefix BOOM suffix").await.unwrap();

        let end = task.await.unwrap();
        match end {
            Termination::RuleDrop { rule } => assert_eq!(rule, "tripwire"),
            other => panic!("expected RuleDrop, got {other:?}"),
        }

        // The matching chunk completed its cycle before termination.
        let mut out = vec![0u8; 18];
        server.read_exact(&mut out).await.unwrap();
        assert_eq!(out, b"prefix BOOM suffix");
    }

    #[tokio::test]
    async fn scanner_runs_on_transformed_bytes() {
        let (mut client, src) = duplex(1024);
        let (dst, _server) = duplex(1024);

        // The raw chunk does not contain the rule pattern; the replacer
        // introduces it, and the scan sees the replacer output.
        let mut p = pump(
            Direction::Outbound,
            vec![Box::new(SubstringReplacer::new("safe", "BOOM"))],
        );
        p.rules = Some(drop_rules("BOOM"));
        let task = tokio::spawn(p.run(src, dst));

        client.write_all(b"totally safe").await.unwrap();

        assert!(matches!(task.await.unwrap(), Termination::RuleDrop { .. }));
    }

    #[tokio::test]
    async fn write_failure_terminates_the_pump() {
        let (mut client, src) = duplex(64);
        let (dst, server) = duplex(64);
        drop(server);

        let p = pump(Direction::Outbound, Vec::new());
        let task = tokio::spawn(p.run(src, dst));

        client.write_all(b"anything").await.unwrap();

        assert!(matches!(
            task.await.unwrap(),
            Termination::WriteFailed { .. }
        ));
    }
}
