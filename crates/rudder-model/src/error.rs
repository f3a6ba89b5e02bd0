// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error classification shared by the transport, the executor pool, and the
/// agent controller. Retryability is a property of the class, not of the
/// caller, so retry policy can be expressed uniformly across components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The request exceeded the model's context window. Triggers forced
    /// compaction.
    ContextLengthExceeded,
    /// Provider throttled the request; may carry a retry-after hint.
    RateLimit,
    /// Credentials rejected. Fatal to the turn.
    Auth,
    /// Transport-level failure (DNS, connect, reset).
    Network,
    /// Provider-side 5xx.
    Server,
    /// A tool exceeded its per-call deadline.
    Timeout,
    /// Admission to the executor pool timed out.
    QueueTimeout,
    /// The tool rejected its input (bad arguments, unknown tool).
    ToolUserError,
    /// The operation was cancelled by an abort.
    Cancelled,
    /// The session writer failed; the session is degraded but the run
    /// continues on in-memory state.
    Persistence,
    /// Nothing to do (e.g. compaction with no eligible messages). Callers
    /// treat this as a no-op.
    NonActionable,
    Other,
}

impl ErrorClass {
    /// Classes that the default retry policy considers transient.
    pub fn is_retryable_default(self) -> bool {
        matches!(
            self,
            ErrorClass::RateLimit | ErrorClass::Network | ErrorClass::Server | ErrorClass::Timeout
        )
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorClass::ContextLengthExceeded => "context_length_exceeded",
            ErrorClass::RateLimit => "rate_limit",
            ErrorClass::Auth => "auth",
            ErrorClass::Network => "network",
            ErrorClass::Server => "server_5xx",
            ErrorClass::Timeout => "tool_timeout",
            ErrorClass::QueueTimeout => "queue_timeout",
            ErrorClass::ToolUserError => "tool_user_error",
            ErrorClass::Cancelled => "cancelled",
            ErrorClass::Persistence => "persistence",
            ErrorClass::NonActionable => "non_actionable",
            ErrorClass::Other => "other",
        };
        write!(f, "{s}")
    }
}

/// Typed failure surfaced by a model transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("context length exceeded: {0}")]
    ContextLengthExceeded(String),
    #[error("rate limited: {message}")]
    RateLimit {
        /// Provider-suggested wait before retrying, when reported.
        retry_after: Option<Duration>,
        message: String,
    },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("stream cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::ContextLengthExceeded(_) => ErrorClass::ContextLengthExceeded,
            ProviderError::RateLimit { .. } => ErrorClass::RateLimit,
            ProviderError::Auth(_) => ErrorClass::Auth,
            ProviderError::Network(_) => ErrorClass::Network,
            ProviderError::Server(_) => ErrorClass::Server,
            ProviderError::Cancelled => ErrorClass::Cancelled,
            ProviderError::Other(_) => ErrorClass::Other,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_default_covers_transient_classes() {
        assert!(ErrorClass::RateLimit.is_retryable_default());
        assert!(ErrorClass::Network.is_retryable_default());
        assert!(ErrorClass::Server.is_retryable_default());
        assert!(ErrorClass::Timeout.is_retryable_default());
        assert!(!ErrorClass::Auth.is_retryable_default());
        assert!(!ErrorClass::Cancelled.is_retryable_default());
        assert!(!ErrorClass::ContextLengthExceeded.is_retryable_default());
    }

    #[test]
    fn provider_errors_map_to_their_class() {
        assert_eq!(
            ProviderError::ContextLengthExceeded("too big".into()).class(),
            ErrorClass::ContextLengthExceeded
        );
        assert_eq!(
            ProviderError::RateLimit {
                retry_after: None,
                message: "slow down".into()
            }
            .class(),
            ErrorClass::RateLimit
        );
        assert_eq!(ProviderError::Cancelled.class(), ErrorClass::Cancelled);
    }

    #[test]
    fn retry_after_only_on_rate_limit() {
        let e = ProviderError::RateLimit {
            retry_after: Some(Duration::from_secs(2)),
            message: String::new(),
        };
        assert_eq!(e.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(ProviderError::Network("x".into()).retry_after(), None);
    }

    #[test]
    fn class_serialises_snake_case() {
        let json = serde_json::to_string(&ErrorClass::ContextLengthExceeded).unwrap();
        assert_eq!(json, "\"context_length_exceeded\"");
    }
}
