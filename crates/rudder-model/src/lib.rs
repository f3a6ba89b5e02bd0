// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod error;
mod mock;
mod provider;
mod types;

pub use error::{ErrorClass, ProviderError};
pub use mock::{HangingProvider, MockProvider, ScriptedProvider};
pub use provider::{
    EventStream, ModelProvider, StopReason, StreamEvent, StreamRequest, ToolCallAccumulator,
};
pub use types::{
    agent_visible, estimate_total_tokens, ContentBlock, Message, MessageMeta, Role, ToolCallView,
    ToolSchema, Usage, IMAGE_TOKEN_COST,
};
