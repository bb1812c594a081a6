use std::path::Path;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::entry::EventEntry;

/// Channel buffer between producers and the background writer task.
const CHANNEL_BUFFER: usize = 1024;

/// Flush the file when the channel has been idle this long.
const FLUSH_INTERVAL_SECS: u64 = 1;

/// Errors from event-log file I/O.
#[derive(Debug, thiserror::Error)]
pub enum EventWriteError {
    #[error("failed to create parent directories: {0}")]
    CreateDir(std::io::Error),
    #[error("failed to open event log file: {0}")]
    OpenFile(std::io::Error),
    #[error("failed to serialize event entry: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write to event log: {0}")]
    Write(std::io::Error),
    #[error("failed to flush event log: {0}")]
    Flush(std::io::Error),
}

/// A cheap, cloneable handle used to submit [`EventEntry`] values to the
/// background writer. `Clone + Send + Sync`, shared freely across tasks.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<EventEntry>,
}

impl EventSink {
    /// Open (or create) the JSON-lines file at `path` in append mode and
    /// spawn the background writer. Returns the sink and the writer's join
    /// handle; the writer flushes periodically and once more when the last
    /// sink clone is dropped.
    pub async fn start(
        path: impl AsRef<Path>,
    ) -> Result<(Self, JoinHandle<()>), EventWriteError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(EventWriteError::CreateDir)?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(EventWriteError::OpenFile)?;

        let (tx, rx) = mpsc::channel::<EventEntry>(CHANNEL_BUFFER);
        let handle = tokio::spawn(run_writer_loop(file, rx));

        Ok((Self { tx }, handle))
    }

    /// A sink that discards every entry. Used when no event-log path is
    /// configured and in tests.
    pub fn null() -> Self {
        let (tx, mut rx) = mpsc::channel::<EventEntry>(CHANNEL_BUFFER);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        Self { tx }
    }

    /// Submit an entry. Waits when the channel is full; if the writer has
    /// already exited the entry is dropped with a warning.
    pub async fn log(&self, entry: EventEntry) {
        if let Err(err) = self.tx.send(entry).await {
            tracing::warn!(kind = ?err.0.kind, "event sink channel closed; entry dropped");
        }
    }
}

/// Drain entries from the channel into the file, flushing when idle and on
/// channel close. I/O errors are logged and the entry skipped; the writer
/// never panics.
async fn run_writer_loop(mut file: tokio::fs::File, mut rx: mpsc::Receiver<EventEntry>) {
    let flush_interval = tokio::time::Duration::from_secs(FLUSH_INTERVAL_SECS);
    let mut dirty = false;

    loop {
        match tokio::time::timeout(flush_interval, rx.recv()).await {
            Ok(Some(entry)) => match write_line(&mut file, &entry).await {
                Ok(()) => dirty = true,
                Err(err) => tracing::error!(%err, "failed to write event entry"),
            },
            // Channel closed: final flush, then exit.
            Ok(None) => {
                if dirty {
                    if let Err(err) = file.flush().await {
                        tracing::error!(%err, "failed to flush event log on shutdown");
                    }
                }
                tracing::debug!("event writer task shutting down");
                return;
            }
            // Idle: flush outstanding writes.
            Err(_) => {
                if dirty {
                    match file.flush().await {
                        Ok(()) => dirty = false,
                        Err(err) => tracing::error!(%err, "periodic event log flush failed"),
                    }
                }
            }
        }
    }
}

async fn write_line(
    file: &mut tokio::fs::File,
    entry: &EventEntry,
) -> Result<(), EventWriteError> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    file.write_all(&line).await.map_err(EventWriteError::Write)
}
