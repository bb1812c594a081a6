//! Hot reload of the active rule set.
//!
//! A background task polls the rule file's modification time and, when it
//! changes, runs the source through the [`RuleSetCache`]. A successful
//! compile is swapped into the shared active slot under an exclusive lock,
//! so a concurrent scan observes either the fully-old or the fully-new set.
//! A failed reload is logged and leaves the previous set in force -- it is
//! never fatal to in-progress connections.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::RuleSetCache;
use crate::compile::RuleSet;

/// Cheap, cloneable handle to the shared active rule set.
///
/// Sessions hold one of these and re-read the current reference for every
/// scan; they never keep a private copy across a reload.
#[derive(Clone, Default)]
pub struct ActiveRules {
    inner: Arc<RwLock<Option<Arc<RuleSet>>>>,
}

impl ActiveRules {
    /// A slot with no rule set loaded; scans are skipped until one is
    /// swapped in.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A slot pre-populated with an already compiled set. Used when rules
    /// are loaded once without a watching task.
    pub fn preloaded(set: Arc<RuleSet>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(set))),
        }
    }

    /// The current compiled set, if any.
    pub async fn current(&self) -> Option<Arc<RuleSet>> {
        self.inner.read().await.clone()
    }

    async fn swap(&self, set: Arc<RuleSet>) {
        let mut slot = self.inner.write().await;
        *slot = Some(set);
    }
}

/// Event emitted by the watcher after each reload attempt that did work.
#[derive(Debug, Clone)]
pub enum ReloadEvent {
    /// A new rule set was compiled and swapped in.
    Reloaded { rules: usize, mtime: SystemTime },
    /// The reload failed; the previous set remains active.
    Failed { error: String },
}

/// Watches one rule file and owns its [`RuleSetCache`].
pub struct RuleWatcher {
    path: PathBuf,
    poll_interval: Duration,
    cache: RuleSetCache,
    active: ActiveRules,
}

impl RuleWatcher {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
            cache: RuleSetCache::new(),
            active: ActiveRules::empty(),
        }
    }

    /// Handle to the shared active slot this watcher swaps into.
    pub fn active(&self) -> ActiveRules {
        self.active.clone()
    }

    /// Compile the rule file now and make it the active set.
    ///
    /// Used for the initial load, where a broken rule file should fail
    /// startup rather than be silently skipped.
    pub async fn load(&mut self) -> Result<Arc<RuleSet>> {
        let (source, mtime) = read_source(&self.path)?;
        let set = self
            .cache
            .get_or_compile(&source, mtime)
            .with_context(|| format!("failed to compile rule file: {}", self.path.display()))?;
        self.active.swap(Arc::clone(&set)).await;
        info!(
            path = %self.path.display(),
            rules = set.len(),
            "rule set loaded"
        );
        Ok(set)
    }

    /// Spawn the background poll loop.
    ///
    /// Returns a receiver of [`ReloadEvent`]s; the loop ends when the
    /// receiver is dropped.
    pub fn start(mut self) -> (mpsc::Receiver<ReloadEvent>, JoinHandle<()>) {
        let (event_tx, event_rx) = mpsc::channel(16);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.poll_interval);
            let mut last_seen = self.cache.current().map(|set| set.mtime());

            loop {
                interval.tick().await;

                let mtime = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
                    Ok(mtime) => mtime,
                    Err(err) => {
                        debug!(
                            path = %self.path.display(),
                            %err,
                            "rule file not readable; keeping active set"
                        );
                        continue;
                    }
                };

                if last_seen == Some(mtime) {
                    continue;
                }
                last_seen = Some(mtime);

                let event = match self.reload(mtime).await {
                    Ok(set) => ReloadEvent::Reloaded {
                        rules: set.len(),
                        mtime,
                    },
                    Err(err) => {
                        warn!(
                            path = %self.path.display(),
                            %err,
                            "rule reload failed; previous set remains active"
                        );
                        ReloadEvent::Failed {
                            error: err.to_string(),
                        }
                    }
                };

                if event_tx.send(event).await.is_err() {
                    // Receiver gone; the process is shutting down.
                    return;
                }
            }
        });

        (event_rx, handle)
    }

    async fn reload(&mut self, mtime: SystemTime) -> Result<Arc<RuleSet>> {
        let source = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read rule file: {}", self.path.display()))?;
        let set = self.cache.get_or_compile(&source, mtime)?;
        self.active.swap(Arc::clone(&set)).await;
        info!(
            path = %self.path.display(),
            rules = set.len(),
            "rule set reloaded"
        );
        Ok(set)
    }
}

fn read_source(path: &Path) -> Result<(String, SystemTime)> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read rule file: {}", path.display()))?;
    let mtime = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .with_context(|| format!("failed to stat rule file: {}", path.display()))?;
    Ok((source, mtime))
}
