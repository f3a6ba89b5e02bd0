// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod adapter;
mod agent;
mod compact;
mod events;
#[cfg(test)]
mod tests;

pub use adapter::SessionAdapter;
pub use agent::{Agent, AgentError, AgentState, StreamingBehavior};
pub use compact::{CompactError, CompactionOutcome, Compactor, COMPACTION_KIND, SUMMARY_PREFIX};
pub use events::{AgentEvent, AgentEventKind, CompactionInfo, MessageDelta};
