mod cli;
mod config;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use event_log::{EventEntry, EventKind, EventSink, EventSource};
use rewrite_engine::{build, build_chain, Replacer, ReplacerSpec, SpecValue};
use rule_scan::{ActiveRules, ReloadEvent, RuleWatcher};
use tcp_relay::{Matcher, Relay, RelayConfig};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args, load config, merge overrides.
    let cli = Cli::parse();
    let mut cfg = config::load(&cli.config)?;

    if let Some(ref local) = cli.local {
        cfg.network.local_addr = local.clone();
    }
    if let Some(ref remote) = cli.remote {
        cfg.network.remote_addr = remote.clone();
    }
    if let Some(ref rules) = cli.rules {
        cfg.rules.file = Some(rules.clone());
    }
    if cli.unwrap_tls {
        cfg.network.tls_unwrap = true;
    }
    if cli.disable_nagle {
        cfg.network.disable_nagle = true;
    }
    if cli.hex {
        cfg.logging.output_hex = true;
    }

    // 2. Init tracing. -v raises the level to debug, -vv to trace.
    let level = match cli.verbose {
        0 => cfg.logging.level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let local_addr: SocketAddr = cfg
        .network
        .local_addr
        .parse()
        .context("invalid local address")?;
    let remote_addr: SocketAddr = cfg
        .network
        .remote_addr
        .parse()
        .context("invalid remote address")?;

    info!(
        config_file = %cli.config.display(),
        local = %local_addr,
        remote = %remote_addr,
        "tapproxy starting"
    );

    // 3. Start the event log.
    let events = match &cfg.logging.event_log_path {
        Some(path) => {
            let (sink, _handle) = EventSink::start(path)
                .await
                .context("failed to start event log")?;
            sink
        }
        None => EventSink::null(),
    };

    events
        .log(EventEntry::new(
            EventKind::ProcessStarted,
            EventSource::new("tapproxy"),
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "local": local_addr.to_string(),
                "remote": remote_addr.to_string(),
            }),
        ))
        .await;

    // 4. Build the replacer chain. Malformed items are dropped with a
    // warning; the valid ones still run.
    let load = build_chain(&cfg.replacers);
    for err in &load.errors {
        warn!(%err, "skipping replacer item");
    }
    let mut chain = load.chain;

    if let Some(ref spec) = cli.replace {
        chain.push(replacer_from_flag(spec)?);
    }
    for replacer in &chain {
        info!(replacer = %replacer.describe(), "replacer loaded");
    }

    // 5. Build the report-only matcher.
    let matcher = match &cli.match_pattern {
        Some(pattern) => Some(build_matcher(pattern)?),
        None => None,
    };

    // 6. Compile the rule file and start its hot-reload watcher.
    let rules = match &cfg.rules.file {
        Some(path) => Some(
            start_rules(
                path.clone(),
                Duration::from_secs(cfg.rules.poll_interval_secs),
                events.clone(),
            )
            .await?,
        ),
        None => None,
    };

    // 7. Run the relay until a shutdown signal arrives.
    let relay = Relay::new(RelayConfig {
        local_addr,
        remote_addr,
        tls_unwrap: cfg.network.tls_unwrap,
        tls_remote_addr: cfg.network.tls_remote_addr.clone(),
        disable_nagle: cfg.network.disable_nagle,
        output_hex: cfg.logging.output_hex,
        chain,
        matcher,
        rules,
        events: events.clone(),
    });

    let result = tokio::select! {
        r = relay.run() => r,
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    info!("tapproxy shutting down");
    events
        .log(EventEntry::new(
            EventKind::ProcessStopped,
            EventSource::new("tapproxy"),
            serde_json::json!({ "result": format!("{result:?}") }),
        ))
        .await;

    result
}

/// Load the rule file (a broken file fails startup), spawn the watcher,
/// and forward its reload events into the event log.
async fn start_rules(
    path: std::path::PathBuf,
    poll_interval: Duration,
    events: EventSink,
) -> Result<ActiveRules> {
    let mut watcher = RuleWatcher::new(&path, poll_interval);
    watcher.load().await.context("failed to load rule file")?;
    let active = watcher.active();

    let (mut reloads, _handle) = watcher.start();
    let path_display = path.display().to_string();
    tokio::spawn(async move {
        while let Some(event) = reloads.recv().await {
            let entry = match event {
                ReloadEvent::Reloaded { rules, .. } => EventEntry::new(
                    EventKind::RulesReloaded,
                    EventSource::new("rule-scan"),
                    serde_json::json!({ "path": path_display, "rules": rules }),
                ),
                ReloadEvent::Failed { error } => EventEntry::new(
                    EventKind::RulesReloadFailed,
                    EventSource::new("rule-scan"),
                    serde_json::json!({ "path": path_display, "error": error }),
                ),
            };
            events.log(entry).await;
        }
    });

    Ok(active)
}

/// Compile the `--match` regex into a report-only callback that logs every
/// match with a process-wide running counter.
fn build_matcher(pattern: &str) -> Result<Matcher> {
    let re = regex::bytes::Regex::new(pattern)
        .with_context(|| format!("invalid match regex: {pattern}"))?;
    info!(pattern = %re, "matching");

    let match_id = Arc::new(AtomicU64::new(0));
    Ok(Arc::new(move |chunk: &[u8]| {
        for m in re.find_iter(chunk) {
            let id = match_id.fetch_add(1, Ordering::Relaxed) + 1;
            info!(
                match_id = id,
                data = %String::from_utf8_lossy(m.as_bytes()),
                "match"
            );
        }
    }))
}

/// Parse the `--replace` flag (`pattern~template`) into a regex replacer.
fn replacer_from_flag(spec: &str) -> Result<Box<dyn Replacer>> {
    let (pattern, template) = spec
        .split_once('~')
        .context("invalid replace option; expected 'pattern~template'")?;

    build(&ReplacerSpec {
        kind: "regex".to_string(),
        find: Some(SpecValue::Text(pattern.to_string())),
        replace: Some(SpecValue::Text(template.to_string())),
    })
    .map_err(|err| anyhow::anyhow!("invalid replace option: {err}"))
}

/// Resolve on ctrl-c or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT (ctrl-c)"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT (ctrl-c)");
    }
}
