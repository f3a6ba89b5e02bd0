// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use rudder_model::Message;
use tracing::warn;

use crate::entry::{EntryPayload, SessionEntry, SessionMeta};
use crate::writer::LogWriter;
use crate::CompactionPolicy;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("unknown entry id: {0}")]
    UnknownEntry(String),
    #[error("persistence error: {0}")]
    Persistence(String),
}

/// One persistent conversation: an append-only tree of entries with a
/// distinguished leaf marking the active branch tip.
///
/// All mutation goes through append operations that (a) parent the new
/// entry to the current leaf, (b) enqueue the on-disk append, (c) advance
/// the leaf. Branch and fork reparent without rewriting existing entries.
/// Reads are served from memory; disk I/O errors degrade persistence but
/// never the current run.
pub struct Session {
    dir: PathBuf,
    meta: SessionMeta,
    entries: Vec<SessionEntry>,
    index: HashMap<String, usize>,
    leaf_id: Option<String>,
    writer: LogWriter,
    closed: bool,
}

impl Session {
    pub(crate) fn new(
        dir: PathBuf,
        meta: SessionMeta,
        entries: Vec<SessionEntry>,
        leaf_id: Option<String>,
        writer: LogWriter,
    ) -> Self {
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();
        Self {
            dir,
            meta,
            entries,
            index,
            leaf_id,
            writer,
            closed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn meta(&self) -> &SessionMeta {
        &self.meta
    }

    pub fn entries(&self) -> &[SessionEntry] {
        &self.entries
    }

    pub fn leaf_id(&self) -> Option<&str> {
        self.leaf_id.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn set_parent_session(&mut self, path: &Path) {
        self.meta.parent_session = Some(path.to_path_buf());
    }

    /// Append any entry payload on the active branch. Returns the new
    /// entry id.
    pub(crate) async fn append_payload(
        &mut self,
        payload: EntryPayload,
    ) -> Result<String, SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        let entry = SessionEntry::new(self.leaf_id.clone(), payload);
        let id = entry.id.clone();
        let line = serde_json::to_string(&entry)
            .map_err(|e| SessionError::Persistence(e.to_string()))?;

        // In-memory state first: it stays authoritative even when the disk
        // append fails.
        if entry.is_message() {
            self.meta.message_count += 1;
        }
        self.index.insert(id.clone(), self.entries.len());
        self.entries.push(entry);
        self.leaf_id = Some(id.clone());
        self.meta.updated_at = chrono::Utc::now();

        if !self.writer.append(line).await {
            warn!(session = %self.meta.id, "session writer unavailable; entry kept in memory only");
        }
        Ok(id)
    }

    pub async fn append_message(&mut self, message: Message) -> Result<String, SessionError> {
        self.append_payload(EntryPayload::Message { message }).await
    }

    pub async fn append_compaction(
        &mut self,
        summary: impl Into<String>,
        first_kept_entry_id: Option<String>,
        tokens_before: usize,
    ) -> Result<String, SessionError> {
        self.append_payload(EntryPayload::Compaction {
            summary: summary.into(),
            first_kept_entry_id,
            tokens_before,
        })
        .await
    }

    pub async fn append_branch_summary(
        &mut self,
        summary: impl Into<String>,
    ) -> Result<String, SessionError> {
        self.append_payload(EntryPayload::BranchSummary {
            summary: summary.into(),
        })
        .await
    }

    pub async fn append_info(
        &mut self,
        name: Option<String>,
        title: Option<String>,
    ) -> Result<String, SessionError> {
        self.append_payload(EntryPayload::SessionInfo { name, title })
            .await
    }

    /// Move the active branch tip to an existing entry. No rewrite happens;
    /// subsequent appends parent to the new leaf.
    pub fn branch(&mut self, entry_id: &str) -> Result<(), SessionError> {
        if !self.index.contains_key(entry_id) {
            return Err(SessionError::UnknownEntry(entry_id.to_string()));
        }
        self.leaf_id = Some(entry_id.to_string());
        Ok(())
    }

    /// Reset the leaf to the latest `SessionInfo` entry, or the first root
    /// when none exists. Used by "resume at root".
    pub fn reset_leaf(&mut self) {
        let info = self
            .entries
            .iter()
            .rev()
            .find(|e| matches!(e.payload, EntryPayload::SessionInfo { .. }));
        self.leaf_id = match info {
            Some(e) => Some(e.id.clone()),
            None => self.entries.first().map(|e| e.id.clone()),
        };
    }

    /// The chain from root to `leaf_id`, in path order. Iterative walk: the
    /// tree can be arbitrarily deep.
    pub fn get_branch(&self, leaf_id: &str) -> Result<Vec<&SessionEntry>, SessionError> {
        let mut chain = Vec::new();
        let mut cursor = Some(leaf_id);
        while let Some(id) = cursor {
            let idx = self
                .index
                .get(id)
                .ok_or_else(|| SessionError::UnknownEntry(id.to_string()))?;
            let entry = &self.entries[*idx];
            chain.push(entry);
            cursor = entry.parent_id.as_deref();
        }
        chain.reverse();
        Ok(chain)
    }

    fn active_branch(&self) -> Vec<&SessionEntry> {
        match &self.leaf_id {
            Some(leaf) => self.get_branch(leaf).unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Linear message view at the current leaf. Visibility metadata is NOT
    /// applied here; use [`agent_messages`](Self::agent_messages) when
    /// building an LLM request.
    pub fn get_messages(&self) -> Vec<Message> {
        self.active_branch()
            .into_iter()
            .filter_map(|e| e.message().cloned())
            .collect()
    }

    /// Linear message view filtered to agent-visible messages.
    pub fn agent_messages(&self) -> Vec<Message> {
        self.active_branch()
            .into_iter()
            .filter_map(|e| e.message())
            .filter(|m| m.is_agent_visible())
            .cloned()
            .collect()
    }

    /// The most recent compaction summary on the active branch, if any.
    pub fn last_compaction_summary(&self) -> Option<String> {
        self.active_branch().into_iter().rev().find_map(|e| {
            match &e.payload {
                EntryPayload::Compaction { summary, .. } => Some(summary.clone()),
                _ => None,
            }
        })
    }

    /// True iff the retention policy still finds summarisable history in
    /// the current linear view.
    pub fn can_compact(&self, policy: &dyn CompactionPolicy) -> bool {
        policy.eligible(&self.get_messages())
    }

    /// Rewrite the active branch so its message entries are exactly
    /// `new_messages`, and rewrite the log file atomically to match.
    ///
    /// Non-message entries on the branch (session info, compaction records)
    /// are preserved in order; entries on other branches survive and are
    /// reparented to their nearest surviving ancestor. Returns the entry ids
    /// of the new message entries, in order. On write failure the in-memory
    /// state is restored and the error is returned, so a failed rewrite
    /// aborts the caller's compaction result.
    pub async fn replace_messages(
        &mut self,
        new_messages: Vec<Message>,
    ) -> Result<Vec<String>, SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        let snapshot_entries = self.entries.clone();
        let snapshot_leaf = self.leaf_id.clone();

        let branch_ids: HashSet<String> = self
            .active_branch()
            .iter()
            .map(|e| e.id.clone())
            .collect();
        let removed: HashSet<String> = self
            .active_branch()
            .iter()
            .filter(|e| e.is_message())
            .map(|e| e.id.clone())
            .collect();

        // Nearest surviving ancestor in the old tree, for reparenting both
        // the preserved branch spine and any side-branch children.
        let surviving_parent = |start: Option<&str>| -> Option<String> {
            let mut cursor = start.map(str::to_string);
            while let Some(id) = cursor {
                if !removed.contains(&id) {
                    return Some(id);
                }
                cursor = self
                    .index
                    .get(&id)
                    .and_then(|i| snapshot_entries[*i].parent_id.clone());
            }
            None
        };

        let mut rebuilt: Vec<SessionEntry> = Vec::with_capacity(self.entries.len());
        for entry in &snapshot_entries {
            if removed.contains(&entry.id) {
                continue;
            }
            let mut kept = entry.clone();
            if branch_ids.contains(&entry.id) || removed.contains(kept.parent_id.as_deref().unwrap_or_default()) {
                kept.parent_id = surviving_parent(entry.parent_id.as_deref());
            }
            rebuilt.push(kept);
        }

        // Chain the new message entries onto the end of the preserved spine.
        let mut parent = rebuilt
            .iter()
            .filter(|e| branch_ids.contains(&e.id))
            .next_back()
            .map(|e| e.id.clone());
        let mut new_ids = Vec::with_capacity(new_messages.len());
        for message in new_messages {
            let entry = SessionEntry::new(parent.clone(), EntryPayload::Message { message });
            parent = Some(entry.id.clone());
            new_ids.push(entry.id.clone());
            rebuilt.push(entry);
        }

        let lines: Result<Vec<String>, _> =
            rebuilt.iter().map(serde_json::to_string).collect();
        let lines = lines.map_err(|e| SessionError::Persistence(e.to_string()))?;

        // Commit to memory, then to disk; roll back if the rewrite fails.
        self.entries = rebuilt;
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();
        self.leaf_id = parent.or_else(|| self.entries.last().map(|e| e.id.clone()));
        self.meta.message_count = self.entries.iter().filter(|e| e.is_message()).count();
        self.meta.updated_at = chrono::Utc::now();

        if let Err(e) = self.writer.replace(lines).await {
            self.entries = snapshot_entries;
            self.index = self
                .entries
                .iter()
                .enumerate()
                .map(|(i, e)| (e.id.clone(), i))
                .collect();
            self.leaf_id = snapshot_leaf;
            self.meta.message_count =
                self.entries.iter().filter(|e| e.is_message()).count();
            return Err(SessionError::Persistence(e.to_string()));
        }
        self.save_meta();
        Ok(new_ids)
    }

    /// Best-effort rewrite of `meta.json`. Never required for correctness.
    pub(crate) fn save_meta(&self) {
        let path = self.dir.join("meta.json");
        match serde_json::to_vec_pretty(&self.meta) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    warn!(path = %path.display(), error = %e, "failed to update session meta");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialise session meta"),
        }
    }

    /// Flush and stop the writer. Idempotent; appends after close return
    /// [`SessionError::Closed`] without side effects.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.save_meta();
        self.writer.close().await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
