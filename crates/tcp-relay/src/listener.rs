//! Accept loop: turns incoming connections into [`Session`]s.

use std::net::SocketAddr;
use std::sync::Arc;

use event_log::EventSink;
use rewrite_engine::Replacer;
use rule_scan::ActiveRules;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::pool::ChunkPool;
use crate::pump::Matcher;
use crate::session::{Session, SessionConfig, SessionEnv};

/// Everything a relay needs: where to listen, how to dial, and the
/// per-chunk processing pieces shared by every session.
pub struct RelayConfig {
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub tls_unwrap: bool,
    pub tls_remote_addr: Option<String>,
    pub disable_nagle: bool,
    pub output_hex: bool,
    /// Ordered replacer chain applied to every chunk in both directions.
    pub chain: Vec<Box<dyn Replacer>>,
    /// Report-only matcher run over raw outbound chunks.
    pub matcher: Option<Matcher>,
    /// Rule engine handle; `None` disables scanning entirely.
    pub rules: Option<ActiveRules>,
    pub events: EventSink,
}

/// The TCP relay server.
///
/// Accepts local connections and runs each one as a [`Session`] in its own
/// task. A failed session never affects other sessions or the accept loop.
pub struct Relay {
    local_addr: SocketAddr,
    env: Arc<SessionEnv>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        let env = SessionEnv {
            config: SessionConfig {
                remote_addr: config.remote_addr,
                tls_unwrap: config.tls_unwrap,
                tls_remote_addr: config.tls_remote_addr,
                disable_nagle: config.disable_nagle,
                output_hex: config.output_hex,
            },
            chain: Arc::new(config.chain),
            matcher: config.matcher,
            rules: config.rules,
            pool: Arc::new(ChunkPool::with_defaults()),
            events: config.events,
        };
        Self {
            local_addr: config.local_addr,
            env: Arc::new(env),
        }
    }

    /// Bind the listen address and serve forever.
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.local_addr).await?;
        info!(
            local = %self.local_addr,
            remote = %self.env.config.remote_addr,
            "relay listening"
        );
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut next_id: u64 = 0;

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(%err, "failed to accept connection");
                    continue;
                }
            };
            next_id += 1;

            let session = Session::new(next_id, stream, peer_addr, Arc::clone(&self.env));
            tokio::spawn(session.run());
        }
    }
}
