// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::{
    ContentBlock, EventStream, Message, ModelProvider, ProviderError, StopReason, StreamEvent,
    StreamRequest, Usage,
};

const MOCK_CONTEXT_WINDOW: usize = 128_000;

/// Deterministic mock provider for tests. Echoes the last user message back
/// as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }
    fn context_window(&self) -> usize {
        MOCK_CONTEXT_WINDOW
    }

    async fn stream(
        &self,
        req: StreamRequest,
        _cancel: CancellationToken,
    ) -> Result<EventStream, ProviderError> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == crate::Role::User)
            .map(|m| m.text())
            .unwrap_or_else(|| "[no input]".to_string());
        let text = format!("MOCK: {reply}");

        let events = vec![
            StreamEvent::Start,
            StreamEvent::TextDelta(text.clone()),
            StreamEvent::Done {
                message: Message::assistant(text),
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 10,
                    ..Default::default()
                },
                stop_reason: StopReason::Stop,
            },
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A pre-scripted mock provider. Each call to `stream` pops the next event
/// script from the front of the queue, so tests specify exact event
/// sequences – including tool calls and errors – without network access.
pub struct ScriptedProvider {
    scripts: Arc<Mutex<Vec<Vec<StreamEvent>>>>,
    context_window: usize,
    /// The last `StreamRequest` seen by this provider.
    /// Written on each `stream()` call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<StreamRequest>>>,
}

impl ScriptedProvider {
    /// Build a provider from a list of event scripts. The outer `Vec` is the
    /// ordered list of calls; the inner `Vec` is the event sequence emitted
    /// for that call.
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            context_window: MOCK_CONTEXT_WINDOW,
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = tokens;
        self
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Self::text_script(reply)])
    }

    /// Convenience: provider that returns one tool call, then a text reply
    /// on the following call.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            Self::tool_call_script(&[(tool_id.into(), tool_name.into(), args_json.into())]),
            Self::text_script(final_text),
        ])
    }

    /// Event script for a plain streamed text reply.
    pub fn text_script(text: impl Into<String>) -> Vec<StreamEvent> {
        let text = text.into();
        vec![
            StreamEvent::Start,
            StreamEvent::TextDelta(text.clone()),
            StreamEvent::Done {
                message: Message::assistant(text),
                usage: Usage {
                    input_tokens: 5,
                    output_tokens: 5,
                    ..Default::default()
                },
                stop_reason: StopReason::Stop,
            },
        ]
    }

    /// Event script for a reply that streams thinking before its text.
    pub fn thinking_then_text_script(
        thinking: impl Into<String>,
        text: impl Into<String>,
    ) -> Vec<StreamEvent> {
        let thinking = thinking.into();
        let text = text.into();
        vec![
            StreamEvent::Start,
            StreamEvent::ThinkingDelta(thinking.clone()),
            StreamEvent::TextDelta(text.clone()),
            StreamEvent::Done {
                message: Message::assistant_blocks(vec![
                    ContentBlock::thinking(thinking),
                    ContentBlock::text(text),
                ]),
                usage: Usage::default(),
                stop_reason: StopReason::Stop,
            },
        ]
    }

    /// Event script for one or more parallel tool calls, streamed as
    /// index-addressed deltas with the arguments split across two chunks.
    pub fn tool_call_script(calls: &[(String, String, String)]) -> Vec<StreamEvent> {
        let mut events = vec![StreamEvent::Start];
        let mut blocks = Vec::with_capacity(calls.len());
        for (index, (id, name, args)) in calls.iter().enumerate() {
            let mut split = args.len() / 2;
            while !args.is_char_boundary(split) {
                split -= 1;
            }
            events.push(StreamEvent::ToolCallDelta {
                index: index as u32,
                id: Some(id.clone()),
                name: Some(name.clone()),
                args_chunk: Some(args[..split].to_string()),
            });
            events.push(StreamEvent::ToolCallDelta {
                index: index as u32,
                id: None,
                name: None,
                args_chunk: Some(args[split..].to_string()),
            });
            let parsed = serde_json::from_str(args)
                .unwrap_or_else(|_| serde_json::Value::Object(Default::default()));
            blocks.push(ContentBlock::tool_call(id, name, parsed));
        }
        events.push(StreamEvent::Done {
            message: Message::assistant_blocks(blocks),
            usage: Usage::default(),
            stop_reason: StopReason::ToolCalls,
        });
        events
    }

    /// Event script that terminates with a transport error.
    pub fn error_script(err: ProviderError) -> Vec<StreamEvent> {
        vec![StreamEvent::Start, StreamEvent::Error(err)]
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }
    fn context_window(&self) -> usize {
        self.context_window
    }

    async fn stream(
        &self,
        req: StreamRequest,
        _cancel: CancellationToken,
    ) -> Result<EventStream, ProviderError> {
        *self.last_request.lock().unwrap() = Some(req);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                Self::text_script("[no more scripts]")
            } else {
                scripts.remove(0)
            }
        };
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A provider whose stream emits a partial text delta and then stays pending
/// until the cancellation token fires. Used to exercise abort paths.
pub struct HangingProvider;

#[async_trait]
impl ModelProvider for HangingProvider {
    fn name(&self) -> &str {
        "hanging-mock"
    }
    fn model_name(&self) -> &str {
        "hanging-mock-model"
    }
    fn context_window(&self) -> usize {
        MOCK_CONTEXT_WINDOW
    }

    async fn stream(
        &self,
        _req: StreamRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream, ProviderError> {
        let head = stream::iter(vec![
            StreamEvent::Start,
            StreamEvent::TextDelta("partial".to_string()),
        ]);
        let tail = stream::once(async move {
            cancel.cancelled().await;
            StreamEvent::Error(ProviderError::Cancelled)
        });
        Ok(Box::pin(head.chain(tail)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
