// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use rudder_config::ThinkingLevel;

use crate::{ContentBlock, Message, ProviderError, ToolSchema, Usage};

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Why the model stopped emitting output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of turn.
    Stop,
    /// The assistant message requests tool execution.
    ToolCalls,
    /// Output token budget exhausted.
    MaxTokens,
    /// The stream was cancelled by an abort.
    Aborted,
    Error,
}

/// One completion request handed to a transport.
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    pub model: String,
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub thinking_level: ThinkingLevel,
}

/// A single streamed event from the transport, in temporal order:
/// optional `Start`, any number of deltas, exactly one terminal `Done` or
/// `Error`.
///
/// Tool-call deltas are index-addressed: chunks for different parallel calls
/// interleave, and argument fragments concatenate into a string that parses
/// as JSON only once the call is complete.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Start,
    TextDelta(String),
    ThinkingDelta(String),
    ToolCallDelta {
        index: u32,
        id: Option<String>,
        name: Option<String>,
        args_chunk: Option<String>,
    },
    Done {
        message: Message,
        usage: Usage,
        stop_reason: StopReason,
    },
    Error(ProviderError),
}

/// A streaming chat-completions transport.
///
/// The concrete HTTP/SSE client lives outside the core; the controller and
/// the compactor consume only this interface. The stream must observe
/// `cancel` at its next suspension point.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Human-readable provider name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Context window of the active model, in tokens.
    fn context_window(&self) -> usize;

    /// Send a completion request and return the event stream.
    async fn stream(
        &self,
        req: StreamRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream, ProviderError>;
}

/// Accumulates index-addressed tool-call deltas into complete tool-call
/// blocks.
///
/// Concrete transports feed every `ToolCallDelta` into this and call
/// [`finish`](Self::finish) at end of stream to build the final assistant
/// message. Calls with an empty name cannot be dispatched and are dropped;
/// an empty id gets a synthetic fallback; empty or unparseable argument
/// buffers resolve to `{}` so the turn can still complete.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    pending: HashMap<u32, PendingCall>,
}

#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    args_buf: String,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        args_chunk: Option<&str>,
    ) {
        let slot = self.pending.entry(index).or_default();
        if let Some(id) = id {
            if !id.is_empty() {
                slot.id = id.to_string();
            }
        }
        if let Some(name) = name {
            if !name.is_empty() {
                slot.name = name.to_string();
            }
        }
        if let Some(chunk) = args_chunk {
            slot.args_buf.push_str(chunk);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Flush all accumulated calls, ordered by index.
    pub fn finish(self) -> Vec<ContentBlock> {
        let mut sorted: Vec<(u32, PendingCall)> = self.pending.into_iter().collect();
        sorted.sort_by_key(|(idx, _)| *idx);

        let mut blocks = Vec::with_capacity(sorted.len());
        for (i, (_, call)) in sorted.into_iter().enumerate() {
            if call.name.is_empty() {
                warn!(
                    tool_call_id = %call.id,
                    "dropping tool call with empty name from model; cannot dispatch"
                );
                continue;
            }
            let id = if call.id.is_empty() {
                let synthetic = format!("call_synthetic_{i}");
                warn!(
                    tool_name = %call.name,
                    tool_call_id = %synthetic,
                    "tool call from model had empty id; generated synthetic id"
                );
                synthetic
            } else {
                call.id
            };
            let args = if call.args_buf.is_empty() {
                serde_json::Value::Object(Default::default())
            } else {
                match serde_json::from_str(&call.args_buf) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(
                            tool_name = %call.name,
                            tool_call_id = %id,
                            error = %e,
                            "model sent tool call with invalid JSON arguments; substituting {{}}"
                        );
                        serde_json::Value::Object(Default::default())
                    }
                }
            };
            blocks.push(ContentBlock::ToolCall {
                id,
                name: call.name,
                args,
            });
        }
        blocks
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
