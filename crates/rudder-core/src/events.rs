// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use rudder_model::{ErrorClass, Message, Role, StopReason};
use serde_json::Value;

/// One record on the agent's event channel.
///
/// `event_at` is a monotonically non-decreasing nanosecond timestamp: the
/// emitter clamps against the previous stamp so consumers can rely on
/// ordering even across clock adjustments.
#[derive(Debug, Clone)]
pub struct AgentEvent {
    pub event_at: i64,
    pub kind: AgentEventKind,
}

/// One streamed delta relayed inside `MessageUpdate`.
#[derive(Debug, Clone)]
pub enum MessageDelta {
    Text(String),
    Thinking(String),
    ToolCall {
        index: u32,
        id: Option<String>,
        name: Option<String>,
        args_chunk: Option<String>,
    },
}

/// Compaction statistics for the UI and the session adapter.
#[derive(Debug, Clone, Default)]
pub struct CompactionInfo {
    pub messages_before: usize,
    pub tokens_before: usize,
    pub messages_after: Option<usize>,
    pub tokens_after: Option<usize>,
    pub summary: Option<String>,
}

/// Events emitted by the agent controller on its single fan-out channel.
///
/// The channel is bounded and sends block: a slow observer applies
/// backpressure to the turn loop instead of growing memory without bound.
/// `AgentEnd` is always the terminal event of a run, including after
/// `Error`, so consumers have a single join point.
#[derive(Debug, Clone)]
pub enum AgentEventKind {
    /// Emitted once per controller lifetime, before the first run.
    ServerStart {
        model: String,
        tools: Vec<String>,
    },
    AgentStart,
    AgentEnd {
        stop_reason: Option<StopReason>,
        /// The controller's canonical message list at end of run. The
        /// session adapter replaces the branch tail with this when the
        /// stored view diverged (e.g. after steering).
        messages: Vec<Message>,
    },
    TurnStart,
    TurnEnd,
    MessageStart {
        role: Role,
    },
    MessageUpdate {
        delta: MessageDelta,
    },
    MessageEnd {
        message: Message,
    },
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        tool_name: String,
        /// The complete tool-result message, exactly as it entered the
        /// controller's context.
        result: Message,
        is_error: bool,
    },
    CompactionStart {
        info: CompactionInfo,
    },
    CompactionEnd {
        info: CompactionInfo,
        /// The condensed message list; empty when the compaction was a
        /// no-op. The adapter rewrites the branch with this.
        messages_after: Vec<Message>,
        /// Index into `messages_after` where the retained tail begins.
        first_kept_index: Option<usize>,
    },
    Error {
        class: ErrorClass,
        message: String,
    },
}

impl AgentEvent {
    /// Convenience predicate used by consumers that only watch run
    /// boundaries.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, AgentEventKind::AgentEnd { .. })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_end_is_terminal() {
        let ev = AgentEvent {
            event_at: 1,
            kind: AgentEventKind::AgentEnd {
                stop_reason: None,
                messages: vec![],
            },
        };
        assert!(ev.is_terminal());
    }

    #[test]
    fn other_events_are_not_terminal() {
        let ev = AgentEvent {
            event_at: 1,
            kind: AgentEventKind::TurnStart,
        };
        assert!(!ev.is_terminal());
    }
}
