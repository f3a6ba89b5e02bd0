// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use rudder_model::{ContentBlock, ErrorClass};

/// Trait that every tool must implement.
///
/// Tools are shared and immutable: the registry hands out `Arc<dyn Tool>`
/// and the executor runs calls from the same assistant turn in parallel.
/// `execute` should observe `cancel` at its suspension points so aborts
/// interrupt long-running work.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the parameters object
    fn parameters_schema(&self) -> Value;
    /// Execute the tool. Failures are returned, never panicked.
    async fn execute(
        &self,
        args: Value,
        cancel: CancellationToken,
    ) -> Result<Vec<ContentBlock>, ToolError>;
}

/// Failure surfaced by a tool implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    /// The model supplied unusable input (bad arguments, missing file).
    /// The turn continues; the model sees the message and may retry.
    #[error("invalid tool input: {0}")]
    User(String),
    /// The tool itself failed.
    #[error("tool failed: {0}")]
    Failed(String),
    #[error("tool cancelled")]
    Cancelled,
}

impl ToolError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ToolError::User(_) => ErrorClass::ToolUserError,
            ToolError::Failed(_) => ErrorClass::Other,
            ToolError::Cancelled => ErrorClass::Cancelled,
        }
    }
}

/// The resolved result of one tool call, error or not.
///
/// Errors become result content so the conversation can continue; the
/// `class` field lets the controller and retry policy discriminate without
/// parsing text.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub call_id: String,
    pub name: String,
    pub blocks: Vec<ContentBlock>,
    pub is_error: bool,
    pub class: Option<ErrorClass>,
}

impl ToolOutcome {
    pub fn ok(call_id: impl Into<String>, name: impl Into<String>, blocks: Vec<ContentBlock>) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            blocks,
            is_error: false,
            class: None,
        }
    }

    pub fn err(
        call_id: impl Into<String>,
        name: impl Into<String>,
        class: ErrorClass,
        message: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            blocks: vec![ContentBlock::text(message)],
            is_error: true,
            class: Some(class),
        }
    }

    /// Plain-text rendering of the outcome blocks.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
