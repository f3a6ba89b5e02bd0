// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use rudder_model::Message;

/// Bumped when the on-disk entry layout changes incompatibly.
pub const SESSION_FORMAT_VERSION: u32 = 1;

/// The unit of persistence: one line of `messages.jsonl`.
///
/// Entries form a tree keyed by `parent_id`; a nil parent marks a root.
/// Line order is append order, and the tree is reconstructed from the
/// parent pointers on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    /// Unique within the session and stable across loads.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EntryPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryPayload {
    Message {
        message: Message,
    },
    /// Records a context compaction: the summary that replaced evicted
    /// history, plus a pointer to the first retained message entry.
    Compaction {
        summary: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        first_kept_entry_id: Option<String>,
        tokens_before: usize,
    },
    BranchSummary {
        summary: String,
    },
    SessionInfo {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
}

impl SessionEntry {
    pub fn new(parent_id: Option<String>, payload: EntryPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn is_message(&self) -> bool {
        matches!(self.payload, EntryPayload::Message { .. })
    }

    pub fn message(&self) -> Option<&Message> {
        match &self.payload {
            EntryPayload::Message { message } => Some(message),
            _ => None,
        }
    }
}

/// Sidecar metadata stored in `meta.json`.
///
/// Updated opportunistically and never required for correctness: every
/// field is regenerable from `messages.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Path of the session this one was forked from, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session: Option<PathBuf>,
    #[serde(default)]
    pub message_count: usize,
}

impl SessionMeta {
    pub fn new(id: impl Into<String>, name: Option<String>, title: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name,
            title,
            version: SESSION_FORMAT_VERSION,
            created_at: now,
            updated_at: now,
            cwd: std::env::current_dir().ok(),
            parent_session: None,
            message_count: 0,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_ids_are_unique() {
        let a = SessionEntry::new(None, EntryPayload::BranchSummary { summary: "s".into() });
        let b = SessionEntry::new(None, EntryPayload::BranchSummary { summary: "s".into() });
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn message_entry_round_trips_as_one_json_line() {
        let entry = SessionEntry::new(
            Some("p1".into()),
            EntryPayload::Message {
                message: Message::user("hello"),
            },
        );
        let line = serde_json::to_string(&entry).unwrap();
        assert!(!line.contains('\n'), "entry must serialise to a single line");
        assert!(line.contains("\"type\":\"message\""), "{line}");
        let back: SessionEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(back.id, entry.id);
        assert_eq!(back.parent_id.as_deref(), Some("p1"));
        assert_eq!(back.message().unwrap().text(), "hello");
    }

    #[test]
    fn compaction_entry_carries_pointer_fields() {
        let entry = SessionEntry::new(
            None,
            EntryPayload::Compaction {
                summary: "what happened".into(),
                first_kept_entry_id: Some("e42".into()),
                tokens_before: 9000,
            },
        );
        let line = serde_json::to_string(&entry).unwrap();
        let back: SessionEntry = serde_json::from_str(&line).unwrap();
        match back.payload {
            EntryPayload::Compaction {
                summary,
                first_kept_entry_id,
                tokens_before,
            } => {
                assert_eq!(summary, "what happened");
                assert_eq!(first_kept_entry_id.as_deref(), Some("e42"));
                assert_eq!(tokens_before, 9000);
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[test]
    fn root_entry_omits_parent_id_field() {
        let entry = SessionEntry::new(
            None,
            EntryPayload::SessionInfo {
                name: Some("s".into()),
                title: None,
            },
        );
        let line = serde_json::to_string(&entry).unwrap();
        assert!(!line.contains("parent_id"), "{line}");
    }

    #[test]
    fn is_message_only_for_message_payloads() {
        let m = SessionEntry::new(
            None,
            EntryPayload::Message {
                message: Message::user("x"),
            },
        );
        let i = SessionEntry::new(None, EntryPayload::SessionInfo { name: None, title: None });
        assert!(m.is_message());
        assert!(!i.is_message());
    }
}
