// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fixed token cost charged for every image block.
///
/// Matches the conservative estimate providers report for a 512×512 tile;
/// exact per-provider accounting is the transport's concern, this constant
/// only feeds the context-budget heuristic.
pub const IMAGE_TOKEN_COST: usize = 765;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolResult,
}

/// A single typed block inside a message.
///
/// - `Text` – user-visible prose
/// - `Thinking` – model-internal reasoning, retained separately from text
///   end to end; consumers choose whether to render it
/// - `ToolCall` – only inside an assistant message
/// - `ToolResult` – only inside a tool-result message; nests its own blocks
/// - `Image` – base64 payload plus MIME type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        args: Value,
    },
    ToolResult {
        call_id: String,
        name: String,
        blocks: Vec<ContentBlock>,
        is_error: bool,
    },
    Image {
        data: String,
        mime: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn thinking(text: impl Into<String>) -> Self {
        Self::Thinking { text: text.into() }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self::ToolCall {
            id: id.into(),
            name: name.into(),
            args,
        }
    }
}

/// Token usage reported by the provider for one assistant message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Tokens served from the provider's prompt cache (read hit).
    #[serde(default)]
    pub cache_read_tokens: u32,
    /// Tokens written into the provider's prompt cache.
    #[serde(default)]
    pub cache_write_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

fn is_true(v: &bool) -> bool {
    *v
}
fn default_true() -> bool {
    true
}

/// Visibility and provenance metadata attached to a message.
///
/// Messages invisible to the agent are filtered out before the LLM call but
/// remain in the session log; messages invisible to the user exist only for
/// the model (e.g. synthetic compaction summaries).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMeta {
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub agent_visible: bool,
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub user_visible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl Default for MessageMeta {
    fn default() -> Self {
        Self {
            agent_visible: true,
            user_visible: true,
            kind: None,
        }
    }
}

/// A borrowed view of one tool call inside an assistant message.
#[derive(Debug, Clone, Copy)]
pub struct ToolCallView<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub args: &'a Value,
}

/// The atomic unit of conversation: a role, a timestamp used as a monotonic
/// tie-break, and an ordered list of content blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub timestamp: DateTime<Utc>,
    pub blocks: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<MessageMeta>,
}

impl Message {
    pub fn new(role: Role, blocks: Vec<ContentBlock>) -> Self {
        Self {
            role,
            timestamp: Utc::now(),
            blocks,
            usage: None,
            meta: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentBlock::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentBlock::text(text)])
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self::new(Role::Assistant, blocks)
    }

    /// A tool-result message wrapping the output of one tool call.
    pub fn tool_result(
        call_id: impl Into<String>,
        name: impl Into<String>,
        blocks: Vec<ContentBlock>,
        is_error: bool,
    ) -> Self {
        Self::new(
            Role::ToolResult,
            vec![ContentBlock::ToolResult {
                call_id: call_id.into(),
                name: name.into(),
                blocks,
                is_error,
            }],
        )
    }

    pub fn with_meta(mut self, meta: MessageMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Concatenated text blocks. Thinking, tool traffic, and images are
    /// excluded.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for b in &self.blocks {
            if let ContentBlock::Text { text } = b {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    /// Concatenated thinking blocks.
    pub fn thinking(&self) -> String {
        let mut out = String::new();
        for b in &self.blocks {
            if let ContentBlock::Thinking { text } = b {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    /// All tool calls carried by this message, in block order.
    pub fn tool_calls(&self) -> Vec<ToolCallView<'_>> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolCall { id, name, args } => {
                    Some(ToolCallView { id, name, args })
                }
                _ => None,
            })
            .collect()
    }

    /// The call id this tool-result message answers, if any.
    pub fn tool_result_call_id(&self) -> Option<&str> {
        self.blocks.iter().find_map(|b| match b {
            ContentBlock::ToolResult { call_id, .. } => Some(call_id.as_str()),
            _ => None,
        })
    }

    pub fn is_agent_visible(&self) -> bool {
        self.meta.as_ref().map_or(true, |m| m.agent_visible)
    }

    pub fn is_user_visible(&self) -> bool {
        self.meta.as_ref().map_or(true, |m| m.user_visible)
    }

    /// Heuristic token estimate: whitespace-split word count × 1.3 for text
    /// content, a fixed cost per image. Never below 1.
    pub fn estimate_tokens(&self) -> usize {
        let (words, images) = count_blocks(&self.blocks);
        let tokens = (words as f32 * 1.3).ceil() as usize + images * IMAGE_TOKEN_COST;
        tokens.max(1)
    }
}

fn count_blocks(blocks: &[ContentBlock]) -> (usize, usize) {
    let mut words = 0usize;
    let mut images = 0usize;
    for b in blocks {
        match b {
            ContentBlock::Text { text } | ContentBlock::Thinking { text } => {
                words += text.split_whitespace().count();
            }
            ContentBlock::ToolCall { name, args, .. } => {
                words += name.split_whitespace().count();
                words += args.to_string().split_whitespace().count();
            }
            ContentBlock::ToolResult { blocks, .. } => {
                let (w, i) = count_blocks(blocks);
                words += w;
                images += i;
            }
            ContentBlock::Image { .. } => images += 1,
        }
    }
    (words, images)
}

/// Estimated token total for a message list.
pub fn estimate_total_tokens(messages: &[Message]) -> usize {
    messages.iter().map(Message::estimate_tokens).sum()
}

/// The agent-visible filter, applied at the boundary to the LLM and nowhere
/// else. Persistence always sees the full list.
pub fn agent_visible(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .filter(|m| m.is_agent_visible())
        .cloned()
        .collect()
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: Value,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
