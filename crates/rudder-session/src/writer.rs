// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// Depth of the single-consumer write queue. Appends block (backpressure)
/// once this many operations are in flight.
const WRITE_QUEUE_DEPTH: usize = 256;

pub(crate) enum WriteOp {
    /// One serialized entry, without the trailing newline.
    Append(String),
    /// Atomically rewrite the whole log. Synchronous request/response so the
    /// rewrite observes exactly the appends that preceded it in queue order.
    Replace {
        lines: Vec<String>,
        ack: oneshot::Sender<anyhow::Result<()>>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Handle to the single writer task that owns `messages.jsonl`.
///
/// All mutations of the file flow through one bounded queue, which makes
/// appends from the event loop, the compactor, and tree operations totally
/// ordered without a lock hierarchy.
pub(crate) struct LogWriter {
    tx: mpsc::Sender<WriteOp>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl LogWriter {
    pub(crate) fn spawn(path: PathBuf) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let task = tokio::spawn(run_writer(path, file, rx));
        Ok(Self {
            tx,
            task: Some(task),
        })
    }

    /// Enqueue one line. I/O errors inside the writer are logged, not
    /// returned: the in-memory session state stays authoritative. Returns
    /// `false` when the writer has already shut down.
    pub(crate) async fn append(&self, line: String) -> bool {
        self.tx.send(WriteOp::Append(line)).await.is_ok()
    }

    /// Rewrite the log to exactly `lines`, atomically (temp file + rename).
    pub(crate) async fn replace(&self, lines: Vec<String>) -> anyhow::Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(WriteOp::Replace {
                lines,
                ack: ack_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("session writer is closed"))?;
        ack_rx
            .await
            .map_err(|_| anyhow::anyhow!("session writer dropped replace request"))?
    }

    /// Drain the queue and stop the writer task. Idempotent.
    pub(crate) async fn close(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriteOp::Shutdown { ack: ack_tx }).await.is_ok() {
            let _ = ack_rx.await;
        }
        let _ = task.await;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.task.is_none()
    }
}

async fn run_writer(path: PathBuf, mut file: File, mut rx: mpsc::Receiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Append(line) => {
                let res = writeln!(file, "{line}").and_then(|()| file.flush());
                if let Err(e) = res {
                    warn!(path = %path.display(), error = %e, "session append failed; in-memory state stays authoritative");
                }
            }
            WriteOp::Replace { lines, ack } => {
                let res = atomic_replace(&path, &lines);
                let res = match res {
                    Ok(new_file) => {
                        file = new_file;
                        Ok(())
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "session replace failed");
                        Err(e)
                    }
                };
                let _ = ack.send(res);
            }
            WriteOp::Shutdown { ack } => {
                let _ = file.flush();
                let _ = ack.send(());
                break;
            }
        }
    }
}

/// Write all lines to a temp file in the same directory, fsync, and rename
/// over the log so a crash mid-rewrite never loses the old content.
fn atomic_replace(path: &Path, lines: &[String]) -> anyhow::Result<File> {
    let dir = path
        .parent()
        .context("session log has no parent directory")?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).context("creating temp log")?;
    for line in lines {
        writeln!(tmp, "{line}").context("writing temp log")?;
    }
    tmp.flush().context("flushing temp log")?;
    tmp.as_file().sync_all().context("syncing temp log")?;
    tmp.persist(path)
        .with_context(|| format!("renaming temp log over {}", path.display()))?;
    let file = OpenOptions::new()
        .append(true)
        .open(path)
        .with_context(|| format!("reopening {}", path.display()))?;
    Ok(file)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
