//! One relay session: an accepted local connection paired with a dialed
//! remote connection, piped by two concurrent pumps.
//!
//! Lifecycle: `Created -> Dialing -> Piping -> Closed`. A dial failure
//! skips `Piping` entirely (the local connection is closed, counters stay
//! at zero). While piping, the session waits for the first [`Termination`]
//! from either pump, then tears both pumps down so each connection is
//! closed exactly once -- a second cause arriving from the other pump is
//! discarded.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use event_log::{EventEntry, EventKind, EventSink, EventSource};
use rewrite_engine::Replacer;
use rule_scan::ActiveRules;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::pool::ChunkPool;
use crate::pump::{Direction, Matcher, Pump, Termination};

/// Per-session connection settings (the injected runtime configuration,
/// minus the listen address which belongs to the listener).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub remote_addr: SocketAddr,
    /// Dial the remote over TLS and relay it unencrypted locally.
    pub tls_unwrap: bool,
    /// `host:port` dialed when unwrapping; defaults to `remote_addr`.
    /// The host part is used as the TLS server name.
    pub tls_remote_addr: Option<String>,
    pub disable_nagle: bool,
    pub output_hex: bool,
}

/// Pieces shared by every session of one relay.
pub struct SessionEnv {
    pub config: SessionConfig,
    pub chain: Arc<Vec<Box<dyn Replacer>>>,
    pub matcher: Option<Matcher>,
    pub rules: Option<ActiveRules>,
    pub pool: Arc<ChunkPool>,
    pub events: EventSink,
}

/// A single accepted connection and its remote counterpart.
pub struct Session {
    id: u64,
    local: TcpStream,
    peer_addr: SocketAddr,
    env: Arc<SessionEnv>,
    sent: Arc<AtomicU64>,
    received: Arc<AtomicU64>,
}

impl Session {
    pub fn new(id: u64, local: TcpStream, peer_addr: SocketAddr, env: Arc<SessionEnv>) -> Self {
        Self {
            id,
            local,
            peer_addr,
            env,
            sent: Arc::new(AtomicU64::new(0)),
            received: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Handles to the monotonic byte counters (`sent`, `received`).
    pub fn counters(&self) -> (Arc<AtomicU64>, Arc<AtomicU64>) {
        (Arc::clone(&self.sent), Arc::clone(&self.received))
    }

    /// Dial the remote and pipe until the first termination, then close
    /// both connections.
    pub async fn run(self) {
        let Session {
            id,
            local,
            peer_addr,
            env,
            sent,
            received,
        } = self;

        let source = || EventSource::session("tcp-relay", id, peer_addr.to_string());

        // Dialing.
        let remote = match dial(&env.config).await {
            Ok(remote) => remote,
            Err(err) => {
                warn!(
                    session = id,
                    remote = %env.config.remote_addr,
                    %err,
                    "remote connection failed"
                );
                env.events
                    .log(EventEntry::new(
                        EventKind::DialFailed,
                        source(),
                        serde_json::json!({
                            "remote": env.config.remote_addr.to_string(),
                            "error": err.to_string(),
                        }),
                    ))
                    .await;
                // The local connection drops here; no pump ever starts.
                return;
            }
        };

        if env.config.disable_nagle {
            if let Err(err) = local.set_nodelay(true).and_then(|()| remote.set_nodelay()) {
                debug!(session = id, %err, "failed to set TCP_NODELAY");
            }
        }

        info!(
            session = id,
            "opened {} >>> {}",
            peer_addr,
            env.config.remote_addr
        );
        env.events
            .log(EventEntry::new(
                EventKind::SessionOpened,
                source(),
                serde_json::json!({ "remote": env.config.remote_addr.to_string() }),
            ))
            .await;

        // Piping.
        let (local_read, local_write) = local.into_split();
        let (remote_read, remote_write) = tokio::io::split(remote);

        let outbound = Pump {
            session_id: id,
            direction: Direction::Outbound,
            chain: Arc::clone(&env.chain),
            matcher: env.matcher.clone(),
            rules: env.rules.clone(),
            pool: Arc::clone(&env.pool),
            counter: Arc::clone(&sent),
            output_hex: env.config.output_hex,
        };
        let inbound = Pump {
            session_id: id,
            direction: Direction::Inbound,
            chain: Arc::clone(&env.chain),
            matcher: None,
            rules: None,
            pool: Arc::clone(&env.pool),
            counter: Arc::clone(&received),
            output_hex: env.config.output_hex,
        };

        let (tx, mut rx) = mpsc::channel::<Termination>(2);

        let tx_out = tx.clone();
        let out_task = tokio::spawn(async move {
            let _ = tx_out.send(outbound.run(local_read, remote_write).await).await;
        });
        let in_task = tokio::spawn(async move {
            let _ = tx.send(inbound.run(remote_read, local_write).await).await;
        });

        // The first cause wins; a simultaneous failure on the other leg is
        // left in the channel and discarded with it.
        let Some(cause) = rx.recv().await else {
            return;
        };

        match &cause {
            Termination::Eof { direction } => {
                debug!(session = id, ?direction, "stream closed")
            }
            Termination::ReadFailed { direction, error } => {
                warn!(session = id, ?direction, %error, "read failed")
            }
            Termination::WriteFailed { direction, error } => {
                warn!(session = id, ?direction, %error, "write failed")
            }
            Termination::RuleDrop { rule } => {
                warn!(session = id, rule = %rule, "connection dropped by rule")
            }
        }

        // Tear both pumps down. Each half of each connection is owned by
        // exactly one pump task, so this closes both sockets exactly once.
        out_task.abort();
        in_task.abort();
        let _ = out_task.await;
        let _ = in_task.await;

        if let Termination::RuleDrop { rule } = &cause {
            env.events
                .log(EventEntry::new(
                    EventKind::SessionDropped,
                    source(),
                    serde_json::json!({ "rule": rule }),
                ))
                .await;
        }

        let sent_total = sent.load(Ordering::Relaxed);
        let received_total = received.load(Ordering::Relaxed);
        info!(
            session = id,
            "closed ({sent_total} bytes sent, {received_total} bytes received)"
        );
        env.events
            .log(EventEntry::new(
                EventKind::SessionClosed,
                source(),
                serde_json::json!({
                    "sent": sent_total,
                    "received": received_total,
                }),
            ))
            .await;
    }
}

/// The remote leg: plain TCP, or a TLS client stream when unwrapping.
enum RemoteStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl RemoteStream {
    fn set_nodelay(&self) -> io::Result<()> {
        match self {
            RemoteStream::Plain(s) => s.set_nodelay(true),
            RemoteStream::Tls(s) => s.get_ref().0.set_nodelay(true),
        }
    }
}

impl AsyncRead for RemoteStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RemoteStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            RemoteStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RemoteStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            RemoteStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            RemoteStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RemoteStream::Plain(s) => Pin::new(s).poll_flush(cx),
            RemoteStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RemoteStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            RemoteStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Open the remote connection: plain TCP, or a TLS dial when unwrap is
/// requested.
async fn dial(config: &SessionConfig) -> io::Result<RemoteStream> {
    if config.tls_unwrap {
        let target = config
            .tls_remote_addr
            .clone()
            .unwrap_or_else(|| config.remote_addr.to_string());
        let tcp = TcpStream::connect(target.as_str()).await?;

        let host = host_of(&target);
        let server_name = ServerName::try_from(host.to_string()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid TLS server name: {host}"),
            )
        })?;

        let tls = tls_connector().connect(server_name, tcp).await?;
        Ok(RemoteStream::Tls(Box::new(tls)))
    } else {
        Ok(RemoteStream::Plain(TcpStream::connect(config.remote_addr).await?))
    }
}

/// Strip the port and any IPv6 brackets from a `host:port` target.
fn host_of(target: &str) -> &str {
    let host = target.rsplit_once(':').map_or(target, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}

fn tls_connector() -> TlsConnector {
    static CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();
    let config = CONFIG.get_or_init(|| {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    });
    TlsConnector::from(Arc::clone(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewrite_engine::SubstringReplacer;
    use rule_scan::RuleSet;
    use std::time::{Duration, SystemTime};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn session_env(remote: SocketAddr) -> SessionEnv {
        SessionEnv {
            config: SessionConfig {
                remote_addr: remote,
                tls_unwrap: false,
                tls_remote_addr: None,
                disable_nagle: false,
                output_hex: false,
            },
            chain: Arc::new(Vec::new()),
            matcher: None,
            rules: None,
            pool: Arc::new(ChunkPool::with_defaults()),
            events: EventSink::null(),
        }
    }

    /// Accept one connection on an ephemeral port, returning the accepted
    /// ("local") stream and the connecting client.
    async fn accepted_pair() -> (TcpStream, SocketAddr, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (local, peer) = listener.accept().await.unwrap();
        (local, peer, client)
    }

    /// Echo server on an ephemeral port.
    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    /// An address that refuses connections: bind, record, drop.
    async fn refused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    fn drop_rules(pattern: &str) -> ActiveRules {
        let yaml = format!(
            "version: \"1.0\"\nrules:\n  - name: \"tripwire\"\n    tags: [drop]\n    patterns: [\"{pattern}\"]\n"
        );
        let set = RuleSet::compile(&yaml, SystemTime::UNIX_EPOCH).unwrap();
        ActiveRules::preloaded(Arc::new(set))
    }

    #[tokio::test]
    async fn failed_dial_never_starts_a_pump() {
        let remote = refused_addr().await;
        let (local, peer, mut client) = accepted_pair().await;

        let session = Session::new(1, local, peer, Arc::new(session_env(remote)));
        let (sent, received) = session.counters();

        session.run().await;

        assert_eq!(sent.load(Ordering::Relaxed), 0);
        assert_eq!(received.load(Ordering::Relaxed), 0);

        // The local connection was closed.
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn relays_bidirectionally_through_the_chain() {
        let remote = echo_server().await;
        let (local, peer, mut client) = accepted_pair().await;

        let mut env = session_env(remote);
        let chain: Vec<Box<dyn Replacer>> = vec![Box::new(SubstringReplacer::new("foo", "bar"))];
        env.chain = Arc::new(chain);
        let session = Session::new(2, local, peer, Arc::new(env));
        let (sent, received) = session.counters();
        let task = tokio::spawn(session.run());

        client.write_all(b"one foo").await.unwrap();

        // Outbound rewrote "foo" -> "bar"; the echo comes back unchanged
        // because the inbound chain finds no "foo" in "one bar".
        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one bar");

        // Client closes; the session observes EOF and tears down.
        drop(client);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("session should close after EOF")
            .unwrap();

        assert_eq!(sent.load(Ordering::Relaxed), 7);
        assert_eq!(received.load(Ordering::Relaxed), 7);
    }

    #[tokio::test]
    async fn drop_rule_terminates_the_session_mid_stream() {
        let remote = echo_server().await;
        let (local, peer, mut client) = accepted_pair().await;

        let mut env = session_env(remote);
        env.rules = Some(drop_rules("BOOM"));
        let session = Session::new(3, local, peer, Arc::new(env));
        let task = tokio::spawn(session.run());

        client.write_all(b"hello BOOM").await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("drop rule should close the session")
            .unwrap();

        // Both connections are gone: the client eventually reads EOF.
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .expect("client read should complete");
        assert!(n.is_ok());
    }

    #[tokio::test]
    async fn simultaneous_failures_produce_one_close() {
        // A remote that accepts and immediately hangs up, so the inbound
        // pump sees EOF while the outbound pump may also fail its write --
        // two causes racing into the same session.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("events.jsonl");
        let (events, writer) = EventSink::start(&log_path).await.unwrap();

        let (local, peer, mut client) = accepted_pair().await;
        let mut env = session_env(remote);
        env.events = events.clone();
        let session = Session::new(4, local, peer, Arc::new(env));

        let task = tokio::spawn(session.run());
        let _ = client.write_all(b"into the void").await;

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("session should close")
            .unwrap();

        // All sink clones must drop before the writer flushes and exits.
        drop(events);
        writer.await.unwrap();

        let contents = std::fs::read_to_string(&log_path).unwrap();
        let closes = contents
            .lines()
            .filter(|line| line.contains("\"session_closed\""))
            .count();
        assert_eq!(closes, 1, "termination must be observed exactly once");
    }
}
