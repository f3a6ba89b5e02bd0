// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::warn;

use rudder_model::{Message, Role};
use rudder_session::Session;

use crate::events::{AgentEvent, AgentEventKind};

/// Mirrors agent events into the session store and forwards them to an
/// outgoing channel for external observers.
///
/// Persistence rules:
/// - `MessageEnd` with an assistant message → append.
/// - `ToolExecutionEnd` → append the tool-result message.
/// - `CompactionEnd` with a condensed list → rewrite the branch, then
///   append a `compaction` entry pointing at the first retained message.
/// - `AgentEnd` → replace the branch tail with the controller's canonical
///   list when the stored view diverged (steering, mid-run edits).
///
/// User prompts are persisted by the controller at accept time, so they are
/// on disk before any event of the run. All writes go through the session's
/// single writer queue, giving a total order consistent with event order.
pub struct SessionAdapter;

impl SessionAdapter {
    /// Spawn the adapter task over a controller's event receiver. Returns
    /// the task handle and the forwarded event stream.
    pub fn attach(
        mut events: mpsc::Receiver<AgentEvent>,
        session: Arc<TokioMutex<Session>>,
        buffer: usize,
    ) -> (JoinHandle<()>, mpsc::Receiver<AgentEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                Self::persist(&session, &event).await;
                // A departed observer does not stop persistence.
                let _ = tx.send(event).await;
            }
        });
        (handle, rx)
    }

    async fn persist(session: &Arc<TokioMutex<Session>>, event: &AgentEvent) {
        match &event.kind {
            AgentEventKind::MessageEnd { message } if message.role == Role::Assistant => {
                let mut session = session.lock().await;
                if let Err(e) = session.append_message(message.clone()).await {
                    warn!(error = %e, "failed to persist assistant message");
                }
            }
            AgentEventKind::ToolExecutionEnd { result, .. } => {
                let mut session = session.lock().await;
                if let Err(e) = session.append_message(result.clone()).await {
                    warn!(error = %e, "failed to persist tool result");
                }
            }
            AgentEventKind::CompactionEnd {
                info,
                messages_after,
                first_kept_index,
            } if !messages_after.is_empty() => {
                let mut session = session.lock().await;
                match session.replace_messages(messages_after.clone()).await {
                    Ok(ids) => {
                        let first_kept = first_kept_index.and_then(|i| ids.get(i).cloned());
                        let summary = info.summary.clone().unwrap_or_default();
                        if let Err(e) = session
                            .append_compaction(summary, first_kept, info.tokens_before)
                            .await
                        {
                            warn!(error = %e, "failed to persist compaction entry");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to rewrite branch after compaction"),
                }
            }
            AgentEventKind::AgentEnd { messages, .. } => {
                let mut session = session.lock().await;
                if !branch_matches(&session, messages) {
                    if let Err(e) = session.replace_messages(messages.clone()).await {
                        warn!(error = %e, "failed to reconcile branch at end of run");
                    }
                }
            }
            _ => {}
        }
    }
}

/// True when the stored linear view already covers the canonical list —
/// either equal, or the canonical list is a prefix of a view that has since
/// grown (a newer run's prompt may already be appended).
fn branch_matches(session: &Session, canonical: &[Message]) -> bool {
    let view = session.get_messages();
    if view.len() < canonical.len() {
        return false;
    }
    canonical
        .iter()
        .zip(view.iter())
        .all(|(a, b)| serde_json::to_value(a).ok() == serde_json::to_value(b).ok())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
