//! Append-only JSONL event streams for external monitors.
//!
//! Each stream is one log file. Opening a stream rotates any existing file
//! aside (`<stem>.<timestamp>.log`) and starts the fresh file with a
//! `@log_init` record, which tells consumers to reset their in-memory
//! model. Appends funnel through one writer task so record order on disk
//! matches call order.

use chrono::{DateTime, Utc};
use foreman_core::ForemanResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// First record of every fresh log file.
pub const LOG_INIT: &str = "@log_init";

/// One event on a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
}

enum LogCommand {
    Append(EventRecord),
    Flush(oneshot::Sender<()>),
}

/// Handle to one event stream. Cheap to clone; all clones feed the same
/// writer task.
#[derive(Clone)]
pub struct EventLog {
    tx: mpsc::UnboundedSender<LogCommand>,
    path: PathBuf,
}

impl EventLog {
    /// Open the stream `<dir>/<stem>.log`, rotating any previous file.
    pub async fn open(dir: impl AsRef<Path>, stem: &str) -> ForemanResult<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{stem}.log"));

        if path.exists() {
            let rotated = dir.join(format!(
                "{stem}.{}.log",
                Utc::now().format("%Y%m%d_%H%M%S_%3f")
            ));
            tokio::fs::rename(&path, &rotated).await?;
            info!(stream = stem, rotated = %rotated.display(), "rotated event log");
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<LogCommand>();
        let writer_path = path.clone();
        tokio::spawn(async move {
            let mut file = file;
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    LogCommand::Append(record) => match serde_json::to_string(&record) {
                        Ok(line) => {
                            let line = format!("{line}\n");
                            if let Err(e) = file.write_all(line.as_bytes()).await {
                                warn!(path = %writer_path.display(), error = %e, "event log write failed");
                            }
                        }
                        Err(e) => {
                            warn!(kind = %record.kind, error = %e, "event record not serializable");
                        }
                    },
                    LogCommand::Flush(done) => {
                        let _ = file.flush().await;
                        let _ = done.send(());
                    }
                }
            }
        });

        let log = Self { tx, path };
        log.append(LOG_INIT, serde_json::json!({ "stream": stem }));
        Ok(log)
    }

    /// Append one event. Fire-and-forget; ordering across calls is
    /// preserved by the single writer task.
    pub fn append(&self, kind: impl Into<String>, data: serde_json::Value) {
        let record = EventRecord {
            timestamp: Utc::now(),
            kind: kind.into(),
            data,
        };
        let _ = self.tx.send(LogCommand::Append(record));
    }

    /// Wait until everything appended so far has reached the file.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(LogCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read a stream file back into records, for consumers and tests.
pub async fn read_records(path: impl AsRef<Path>) -> ForemanResult<Vec<EventRecord>> {
    let data = tokio::fs::read_to_string(path.as_ref()).await?;
    let mut records = Vec::new();
    for line in data.lines().filter(|l| !l.trim().is_empty()) {
        records.push(serde_json::from_str(line)?);
    }
    Ok(records)
}
