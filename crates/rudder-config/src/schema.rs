// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless the user
/// explicitly disables them need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentOptions,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub output: OutputLimits,
}

/// Requested depth of model-internal reasoning.
///
/// Forwarded verbatim to the transport; providers map it onto their own
/// thinking-budget knobs. `Off` disables reasoning entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

/// How mid-turn steering messages are admitted.
///
/// `OneAtATime` rejects a second steer while one is still pending so the
/// model sees interventions in strict sequence; `All` queues every steer
/// and injects them together at the next turn boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SteeringMode {
    All,
    #[default]
    OneAtATime,
}

/// How queued follow-up prompts are admitted. Same semantics as
/// [`SteeringMode`], but for messages processed after the current prompt
/// completes rather than interrupting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FollowUpMode {
    All,
    #[default]
    OneAtATime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOptions {
    #[serde(default)]
    pub steering_mode: SteeringMode,
    #[serde(default)]
    pub follow_up_mode: FollowUpMode,
    #[serde(default)]
    pub thinking_level: ThinkingLevel,
    /// Retry transient transport errors (network, 5xx, rate limit) with
    /// exponential backoff before surfacing them.
    #[serde(default = "default_true")]
    pub auto_retry: bool,
    /// Maximum transport retries per turn when `auto_retry` is enabled.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// System prompt override; leave None to let the host supply one.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            steering_mode: SteeringMode::default(),
            follow_up_mode: FollowUpMode::default(),
            thinking_level: ThinkingLevel::default(),
            auto_retry: true,
            max_retries: default_max_retries(),
            system_prompt: None,
        }
    }
}

/// How tool traffic is summarised during compaction.
///
/// `Llm` (default) asks the model for a dense summary of the evicted
/// history. `Heuristic` builds the summary deterministically from tool
/// names, argument fingerprints, and truncated results — no model call.
/// `Off` drops tool traffic entirely and keeps only user/assistant text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolSummaryStrategy {
    #[default]
    Llm,
    Heuristic,
    Off,
}

impl std::fmt::Display for ToolSummaryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolSummaryStrategy::Llm => write!(f, "llm"),
            ToolSummaryStrategy::Heuristic => write!(f, "heuristic"),
            ToolSummaryStrategy::Off => write!(f, "off"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Message count above which compaction triggers regardless of tokens.
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    /// Estimated-token ceiling for the conversation. The effective limit is
    /// `min(context_window - reserve_tokens, max_tokens)`.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Minimum number of recent messages preserved verbatim in the tail.
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
    /// Token budget for the preserved tail. The tail is the largest suffix
    /// that fits this budget while still holding at least `keep_recent`
    /// messages.
    #[serde(default = "default_keep_recent_tokens")]
    pub keep_recent_tokens: usize,
    /// Headroom subtracted from the context window so one more turn fits
    /// after a compaction.
    #[serde(default = "default_reserve_tokens")]
    pub reserve_tokens: usize,
    /// Soft trigger: when a single assistant message carries at least this
    /// many tool calls, a compaction check is forced at the next turn
    /// boundary. 0 disables the trigger. Calls are never rejected.
    #[serde(default)]
    pub tool_call_cutoff: usize,
    #[serde(default)]
    pub tool_summary_strategy: ToolSummaryStrategy,
    /// Run the compaction check before every model submission.
    #[serde(default = "default_true")]
    pub auto_compact: bool,
}

fn default_max_messages() -> usize {
    500
}
fn default_max_tokens() -> usize {
    150_000
}
fn default_keep_recent() -> usize {
    8
}
fn default_keep_recent_tokens() -> usize {
    20_000
}
fn default_reserve_tokens() -> usize {
    16_384
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            max_tokens: default_max_tokens(),
            keep_recent: default_keep_recent(),
            keep_recent_tokens: default_keep_recent_tokens(),
            reserve_tokens: default_reserve_tokens(),
            tool_call_cutoff: 0,
            tool_summary_strategy: ToolSummaryStrategy::default(),
            auto_compact: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Tool calls from one assistant turn run in parallel up to this count.
    #[serde(default = "default_max_concurrent_tools")]
    pub max_concurrent_tools: usize,
    /// Per-call wall-clock deadline in seconds.
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// Deadline in seconds for waiting on a free concurrency slot.
    #[serde(default = "default_queue_timeout_secs")]
    pub queue_timeout_secs: u64,
}

fn default_max_concurrent_tools() -> usize {
    4
}
fn default_tool_timeout_secs() -> u64 {
    120
}
fn default_queue_timeout_secs() -> u64 {
    60
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tools: default_max_concurrent_tools(),
            tool_timeout_secs: default_tool_timeout_secs(),
            queue_timeout_secs: default_queue_timeout_secs(),
        }
    }
}

/// Which end of an oversized tool output survives truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TruncateMode {
    #[serde(rename = "head")]
    Head,
    #[serde(rename = "tail")]
    Tail,
    #[default]
    #[serde(rename = "head+tail")]
    HeadTail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputLimits {
    /// Maximum lines kept from a single tool output text block.
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
    /// Maximum bytes kept from a single tool output text block.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    /// Maximum characters kept from a single tool output text block.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    /// Outputs at or below this byte count are never truncated.
    #[serde(default = "default_large_output_threshold")]
    pub large_output_threshold: usize,
    #[serde(default)]
    pub truncate_mode: TruncateMode,
}

fn default_max_lines() -> usize {
    1000
}
fn default_max_bytes() -> usize {
    65_536
}
fn default_max_chars() -> usize {
    50_000
}
fn default_large_output_threshold() -> usize {
    16_384
}

impl Default for OutputLimits {
    fn default() -> Self {
        Self {
            max_lines: default_max_lines(),
            max_bytes: default_max_bytes(),
            max_chars: default_max_chars(),
            large_output_threshold: default_large_output_threshold(),
            truncate_mode: TruncateMode::default(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
