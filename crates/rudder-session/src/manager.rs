// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entry::{EntryPayload, SessionEntry, SessionMeta};
use crate::writer::LogWriter;
use crate::{Session, SessionError};

const LOG_FILE: &str = "messages.jsonl";
const META_FILE: &str = "meta.json";

/// Creates, opens, lists, and forks session directories under one base
/// directory. Each session is a directory holding `messages.jsonl` and
/// `meta.json`.
pub struct SessionManager {
    base_dir: PathBuf,
}

impl SessionManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Create a fresh session seeded with a `SessionInfo` root entry.
    pub async fn create(
        &self,
        name: Option<String>,
        title: Option<String>,
    ) -> anyhow::Result<Session> {
        let id = Uuid::new_v4().to_string();
        let dir = self.base_dir.join(&id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating session directory {}", dir.display()))?;

        let meta = SessionMeta::new(&id, name.clone(), title.clone());
        let writer = LogWriter::spawn(dir.join(LOG_FILE))?;
        let mut session = Session::new(dir, meta, Vec::new(), None, writer);
        session
            .append_info(name, title)
            .await
            .map_err(|e| anyhow::anyhow!("seeding session info: {e}"))?;
        session.save_meta();
        debug!(session = %id, "created session");
        Ok(session)
    }

    /// Open an existing session, reconstructing the entry tree from the
    /// JSONL log. The leaf starts at the last message-bearing entry (the
    /// host may move it afterwards with `branch`). Malformed lines are
    /// skipped with a warning so one corrupt append cannot brick a session.
    pub async fn open(&self, id: &str) -> anyhow::Result<Session> {
        let dir = self.base_dir.join(id);
        let log_path = dir.join(LOG_FILE);
        let text = std::fs::read_to_string(&log_path)
            .with_context(|| format!("reading {}", log_path.display()))?;

        let mut entries = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SessionEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(
                    path = %log_path.display(),
                    line = lineno + 1,
                    error = %e,
                    "skipping malformed session entry"
                ),
            }
        }

        let meta = match std::fs::read_to_string(dir.join(META_FILE))
            .ok()
            .and_then(|t| serde_json::from_str::<SessionMeta>(&t).ok())
        {
            Some(meta) => meta,
            // meta.json is regenerable; a missing or corrupt one is not an
            // error.
            None => {
                let mut meta = SessionMeta::new(id, None, None);
                meta.message_count = entries.iter().filter(|e| e.is_message()).count();
                meta
            }
        };

        let leaf_id = entries
            .iter()
            .rev()
            .find(|e| e.is_message())
            .or(entries.last())
            .map(|e| e.id.clone());

        let writer = LogWriter::spawn(log_path)?;
        Ok(Session::new(dir, meta, entries, leaf_id, writer))
    }

    /// Fork a session: create a new session directory whose initial entries
    /// are independent copies (fresh ids) of the source's branch up to
    /// `leaf_id` (default: the source's current leaf). The new session's
    /// meta records the source path in `parent_session`.
    pub async fn fork_from(
        &self,
        source: &Session,
        leaf_id: Option<&str>,
        name: Option<String>,
        title: Option<String>,
    ) -> anyhow::Result<Session> {
        let leaf = leaf_id
            .or(source.leaf_id())
            .context("source session has no leaf to fork from")?;
        let chain: Vec<EntryPayload> = source
            .get_branch(leaf)
            .map_err(|e: SessionError| anyhow::anyhow!("resolving fork point: {e}"))?
            .into_iter()
            // The fork gets its own SessionInfo root; the source's info
            // entries are not copied.
            .filter(|e| !matches!(e.payload, EntryPayload::SessionInfo { .. }))
            .map(|e| e.payload.clone())
            .collect();

        let mut forked = self.create(name, title).await?;
        for payload in chain {
            forked
                .append_payload(payload)
                .await
                .map_err(|e| anyhow::anyhow!("copying forked entry: {e}"))?;
        }
        forked.set_parent_session(source.dir());
        forked.save_meta();
        debug!(source = %source.id(), fork = %forked.id(), "forked session");
        Ok(forked)
    }

    /// Metadata for every session under the base directory, newest first.
    pub fn list(&self) -> Vec<SessionMeta> {
        let Ok(read) = std::fs::read_dir(&self.base_dir) else {
            return Vec::new();
        };
        let mut metas: Vec<SessionMeta> = read
            .flatten()
            .filter_map(|dirent| {
                let text = std::fs::read_to_string(dirent.path().join(META_FILE)).ok()?;
                serde_json::from_str(&text).ok()
            })
            .collect();
        metas.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        metas
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
