// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use rudder_config::{CompactionConfig, ThinkingLevel, ToolSummaryStrategy};
use rudder_model::{
    estimate_total_tokens, ErrorClass, Message, MessageMeta, ModelProvider, ProviderError, Role,
    StreamEvent, StreamRequest,
};
use rudder_session::CompactionPolicy;

/// Prefix of the synthetic user message that carries a compaction summary.
pub const SUMMARY_PREFIX: &str = "[Previous conversation summary] ";

/// `metadata.kind` marker on synthetic compaction messages.
pub const COMPACTION_KIND: &str = "compaction";

const SUMMARIZER_SYSTEM: &str = "You are a context compaction assistant for a software \
     engineering agent. Summarise the conversation history you are given in a concise, \
     information-dense way. Preserve technical details, decisions, file names, error \
     messages, and tool outputs that may matter for future work. The summary will replace \
     the original history to free up context space.";

/// Upper bound on deterministic (heuristic/off) summaries, in bytes.
const HEURISTIC_SUMMARY_MAX: usize = 4000;

#[derive(Debug, thiserror::Error)]
pub enum CompactError {
    /// No messages are eligible under the retention policy. Non-actionable:
    /// callers treat this as a no-op.
    #[error("nothing to compact")]
    NothingToCompact,
    #[error("summarisation failed: {0}")]
    Summarizer(#[from] ProviderError),
}

impl CompactError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CompactError::NothingToCompact => ErrorClass::NonActionable,
            CompactError::Summarizer(e) => e.class(),
        }
    }
}

/// The result of one compaction.
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub summary: String,
    /// Index into `messages_after` where the retained tail begins (the
    /// synthetic summary message sits at index 0).
    pub first_kept_index: usize,
    pub messages_after: Vec<Message>,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

/// The context compaction engine: trigger predicate plus the
/// evict-and-summarise transformation.
///
/// Compaction partitions the conversation into a summarisable head and a
/// retained tail, replaces the head with one synthetic summary message, and
/// leaves the tail verbatim. The engine never mutates its input; callers
/// commit `messages_after` only on success.
#[derive(Debug, Clone)]
pub struct Compactor {
    cfg: CompactionConfig,
}

impl Compactor {
    pub fn new(cfg: CompactionConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.cfg
    }

    pub fn set_tool_call_cutoff(&mut self, cutoff: usize) {
        self.cfg.tool_call_cutoff = cutoff;
    }

    pub fn set_tool_summary_strategy(&mut self, strategy: ToolSummaryStrategy) {
        self.cfg.tool_summary_strategy = strategy;
    }

    /// The token ceiling compaction keeps the conversation under:
    /// `min(context_window − reserve_tokens, max_tokens)`. The reserve
    /// leaves room for one more turn after a compaction.
    pub fn effective_limit(&self, context_window: usize) -> usize {
        let window_budget = context_window.saturating_sub(self.cfg.reserve_tokens);
        if self.cfg.max_tokens == 0 {
            window_budget
        } else {
            window_budget.min(self.cfg.max_tokens)
        }
    }

    /// True when the message count or the estimated token total crosses the
    /// configured ceilings.
    pub fn should_compact(&self, messages: &[Message], context_window: usize) -> bool {
        if messages.len() > self.cfg.max_messages {
            return true;
        }
        estimate_total_tokens(messages) > self.effective_limit(context_window)
    }

    /// Partition point: returns `(eligible_start, tail_start)` indices into
    /// `messages`, or `None` when nothing is eligible for summarisation.
    ///
    /// The tail is the largest suffix that fits `keep_recent_tokens` while
    /// holding at least `keep_recent` messages, then grown backward until
    /// no tool-result in the tail is orphaned from its assistant tool-call.
    /// A leading synthetic summary from a previous compaction is excluded
    /// from the head; its content rides in via `prior_summary` instead.
    fn split_point(&self, messages: &[Message]) -> Option<(usize, usize)> {
        let skip = messages
            .iter()
            .take_while(|m| is_compaction_summary(m))
            .count();
        let eligible = &messages[skip..];
        if eligible.len() <= self.cfg.keep_recent {
            return None;
        }

        // Smallest index whose suffix fits the tail token budget.
        let mut idx = eligible.len();
        let mut tail_tokens = 0usize;
        while idx > 0 {
            let t = eligible[idx - 1].estimate_tokens();
            if tail_tokens + t > self.cfg.keep_recent_tokens {
                break;
            }
            tail_tokens += t;
            idx -= 1;
        }

        // The count floor wins over the token budget: a tail shorter than
        // keep_recent is never produced.
        let max_idx = eligible.len() - self.cfg.keep_recent;
        if idx > max_idx {
            idx = max_idx;
        }

        // Grow the tail backward over tool-result messages so every retained
        // result still has its assistant tool-call in the tail.
        while idx > 0 && idx < eligible.len() && eligible[idx].role == Role::ToolResult {
            idx -= 1;
        }

        if idx == 0 {
            return None;
        }
        Some((skip, skip + idx))
    }

    /// Evict and summarise. Returns the condensed message list:
    /// `[synthetic summary] ++ tail`. The synthetic message is visible to
    /// the agent but not the user and carries `kind = "compaction"`.
    ///
    /// With the `llm` strategy, a `context_length_exceeded` from the
    /// summariser falls back to the heuristic strategy exactly once; it
    /// never recurses into another model call.
    pub async fn compact(
        &self,
        provider: &dyn ModelProvider,
        messages: &[Message],
        prior_summary: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<CompactionOutcome, CompactError> {
        let (skip, tail_start) = self
            .split_point(messages)
            .ok_or(CompactError::NothingToCompact)?;
        let head = &messages[skip..tail_start];
        let tail = &messages[tail_start..];
        let tokens_before = estimate_total_tokens(messages);

        let summary = match self.cfg.tool_summary_strategy {
            ToolSummaryStrategy::Llm => {
                match summarize_llm(provider, head, prior_summary, cancel).await {
                    Ok(s) if !s.trim().is_empty() => s,
                    Ok(_) => {
                        warn!("summariser returned empty text; using heuristic summary");
                        heuristic_summary(head, prior_summary)
                    }
                    Err(ProviderError::ContextLengthExceeded(msg)) => {
                        warn!(
                            error = %msg,
                            "compaction prompt exceeded the context window; using heuristic summary"
                        );
                        heuristic_summary(head, prior_summary)
                    }
                    Err(e) => return Err(CompactError::Summarizer(e)),
                }
            }
            ToolSummaryStrategy::Heuristic => heuristic_summary(head, prior_summary),
            ToolSummaryStrategy::Off => text_only_summary(head, prior_summary),
        };

        let synthetic = Message::user(format!("{SUMMARY_PREFIX}{summary}")).with_meta(MessageMeta {
            agent_visible: true,
            user_visible: false,
            kind: Some(COMPACTION_KIND.to_string()),
        });
        let mut messages_after = Vec::with_capacity(tail.len() + 1);
        messages_after.push(synthetic);
        messages_after.extend_from_slice(tail);
        let tokens_after = estimate_total_tokens(&messages_after);

        Ok(CompactionOutcome {
            summary,
            first_kept_index: 1,
            messages_after,
            tokens_before,
            tokens_after,
        })
    }
}

impl CompactionPolicy for Compactor {
    fn eligible(&self, messages: &[Message]) -> bool {
        self.split_point(messages).is_some()
    }
}

fn is_compaction_summary(m: &Message) -> bool {
    m.meta
        .as_ref()
        .and_then(|meta| meta.kind.as_deref())
        .map_or(false, |k| k == COMPACTION_KIND)
}

/// One tool-free model call over the serialised head transcript.
async fn summarize_llm(
    provider: &dyn ModelProvider,
    head: &[Message],
    prior_summary: Option<&str>,
    cancel: &CancellationToken,
) -> Result<String, ProviderError> {
    let mut prompt = String::new();
    if let Some(prior) = prior_summary {
        prompt.push_str("Summary of the conversation so far:\n");
        prompt.push_str(prior);
        prompt.push_str("\n\n");
    }
    prompt.push_str("Conversation history to fold into the summary:\n\n");
    prompt.push_str(&serialize_transcript(head));

    let req = StreamRequest {
        model: provider.model_name().to_string(),
        system_prompt: SUMMARIZER_SYSTEM.to_string(),
        messages: vec![Message::user(prompt)],
        tools: Vec::new(),
        thinking_level: ThinkingLevel::Off,
    };
    let mut stream = provider.stream(req, cancel.child_token()).await?;

    let mut text = String::new();
    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::TextDelta(delta) => text.push_str(&delta),
            StreamEvent::Done { message, .. } => {
                let full = message.text();
                if !full.is_empty() {
                    text = full;
                }
                break;
            }
            StreamEvent::Error(e) => return Err(e),
            _ => {}
        }
    }
    Ok(text)
}

/// Serialise messages into plain text for the compaction prompt.
fn serialize_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::ToolResult => "Tool",
            };
            let mut body = String::new();
            let text = m.text();
            if !text.is_empty() {
                body.push_str(&text);
            }
            for call in m.tool_calls() {
                if !body.is_empty() {
                    body.push('\n');
                }
                body.push_str(&format!("[tool_call: {}({})]", call.name, call.args));
            }
            if m.role == Role::ToolResult {
                for block in &m.blocks {
                    if let rudder_model::ContentBlock::ToolResult {
                        name,
                        blocks,
                        is_error,
                        ..
                    } = block
                    {
                        let inner = blocks
                            .iter()
                            .filter_map(|b| match b {
                                rudder_model::ContentBlock::Text { text } => {
                                    Some(text.as_str())
                                }
                                _ => None,
                            })
                            .collect::<Vec<_>>()
                            .join("\n");
                        let tag = if *is_error { "tool_error" } else { "tool_result" };
                        body.push_str(&format!("[{tag}: {} → {}]", name, clip(&inner, 400)));
                    }
                }
            }
            format!("{role}: {body}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Deterministic digest: user/assistant text, tool names, argument
/// fingerprints, and truncated results. No model call. Bounded in size by
/// keeping the most recent lines when over budget.
fn heuristic_summary(head: &[Message], prior_summary: Option<&str>) -> String {
    let mut lines: Vec<String> = Vec::new();
    for m in head {
        match m.role {
            Role::User => {
                let text = m.text();
                if !text.is_empty() {
                    lines.push(format!("User: {}", clip(&text, 200)));
                }
            }
            Role::Assistant => {
                let text = m.text();
                if !text.is_empty() {
                    lines.push(format!("Assistant: {}", clip(&text, 200)));
                }
                for call in m.tool_calls() {
                    lines.push(format!(
                        "Assistant called {}({})",
                        call.name,
                        clip(&call.args.to_string(), 120)
                    ));
                }
            }
            Role::ToolResult => {
                for block in &m.blocks {
                    if let rudder_model::ContentBlock::ToolResult {
                        name,
                        blocks,
                        is_error,
                        ..
                    } = block
                    {
                        let inner = blocks
                            .iter()
                            .filter_map(|b| match b {
                                rudder_model::ContentBlock::Text { text } => {
                                    Some(text.as_str())
                                }
                                _ => None,
                            })
                            .collect::<Vec<_>>()
                            .join(" ");
                        let verdict = if *is_error { " (error)" } else { "" };
                        lines.push(format!("{name}{verdict} → {}", clip(&inner, 160)));
                    }
                }
            }
        }
    }
    bounded_digest(lines, prior_summary)
}

/// `off` strategy: tool traffic is dropped entirely.
fn text_only_summary(head: &[Message], prior_summary: Option<&str>) -> String {
    let lines: Vec<String> = head
        .iter()
        .filter_map(|m| {
            let text = m.text();
            if text.is_empty() {
                return None;
            }
            match m.role {
                Role::User => Some(format!("User: {}", clip(&text, 300))),
                Role::Assistant => Some(format!("Assistant: {}", clip(&text, 300))),
                Role::ToolResult => None,
            }
        })
        .collect();
    bounded_digest(lines, prior_summary)
}

/// Assemble digest lines under the size bound, preferring the most recent
/// lines when over budget.
fn bounded_digest(lines: Vec<String>, prior_summary: Option<&str>) -> String {
    let mut out = String::new();
    if let Some(prior) = prior_summary {
        out.push_str("Earlier: ");
        out.push_str(&clip(prior, HEURISTIC_SUMMARY_MAX / 4));
        out.push_str("\n\n");
    }
    let budget = HEURISTIC_SUMMARY_MAX.saturating_sub(out.len());
    let mut kept: Vec<&String> = Vec::new();
    let mut used = 0usize;
    for line in lines.iter().rev() {
        let needed = line.len() + 1;
        if used + needed > budget {
            break;
        }
        used += needed;
        kept.push(line);
    }
    let dropped = lines.len() - kept.len();
    if dropped > 0 {
        out.push_str(&format!("[{dropped} earlier steps omitted]\n"));
    }
    kept.reverse();
    out.push_str(&kept.iter().map(|s| s.as_str()).collect::<Vec<_>>().join("\n"));
    out
}

/// Truncate at a char boundary, appending an ellipsis when cut.
fn clip(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let end = s
        .char_indices()
        .take_while(|&(i, _)| i < max)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    format!("{}…", &s[..end])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
