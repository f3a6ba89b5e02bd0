// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use rudder_config::ExecutorConfig;
use rudder_model::{ContentBlock, ErrorClass};

use crate::{Tool, ToolOutcome};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Concurrency ceiling across all callers sharing this pool.
    pub max_concurrent: usize,
    /// Wall-clock deadline for a single tool execution attempt.
    pub tool_timeout: Duration,
    /// Deadline for admission to a concurrency slot.
    pub queue_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&ExecutorConfig::default())
    }
}

impl From<&ExecutorConfig> for PoolConfig {
    fn from(cfg: &ExecutorConfig) -> Self {
        Self {
            max_concurrent: cfg.max_concurrent_tools.max(1),
            tool_timeout: Duration::from_secs(cfg.tool_timeout_secs),
            queue_timeout: Duration::from_secs(cfg.queue_timeout_secs),
        }
    }
}

/// Per-tool retry policy. Absent a registered policy, failures are not
/// retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub retryable: Vec<ErrorClass>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            retryable: vec![
                ErrorClass::RateLimit,
                ErrorClass::Network,
                ErrorClass::Server,
                ErrorClass::Timeout,
            ],
        }
    }
}

/// Concurrency-bounded tool executor shared across controllers.
///
/// Admission is first-come-first-served through a counting semaphore; the
/// permit is held for the full call (including retries) so retrying work
/// cannot starve queued calls of their slot accounting.
pub struct ExecutorPool {
    semaphore: Arc<Semaphore>,
    config: PoolConfig,
    retry: Mutex<HashMap<String, RetryPolicy>>,
}

impl ExecutorPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            retry: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Register (or replace) the retry policy for one tool.
    pub fn set_retry_policy(&self, tool_name: impl Into<String>, policy: RetryPolicy) {
        self.retry.lock().unwrap().insert(tool_name.into(), policy);
    }

    /// Run one tool call to an outcome. Never panics and never returns a
    /// bare error: timeouts, queue expiry, cancellation, and tool failures
    /// all surface as an error outcome with a class the caller can match.
    pub async fn execute(
        &self,
        tool: Arc<dyn Tool>,
        call_id: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> ToolOutcome {
        let name = tool.name().to_string();

        // Slot admission. Cancellation during the wait surfaces as
        // cancelled, not queue_timeout.
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return ToolOutcome::err(call_id, &name, ErrorClass::Cancelled, "tool call cancelled");
            }
            acquired = timeout(self.config.queue_timeout, self.semaphore.clone().acquire_owned()) => {
                match acquired {
                    Err(_) => {
                        return ToolOutcome::err(
                            call_id,
                            &name,
                            ErrorClass::QueueTimeout,
                            format!(
                                "timed out after {}s waiting for an execution slot",
                                self.config.queue_timeout.as_secs()
                            ),
                        );
                    }
                    Ok(Err(_)) => {
                        return ToolOutcome::err(
                            call_id,
                            &name,
                            ErrorClass::Cancelled,
                            "executor pool closed",
                        );
                    }
                    Ok(Ok(permit)) => permit,
                }
            }
        };

        let policy = self.retry.lock().unwrap().get(&name).cloned();
        let mut attempt: u32 = 0;
        loop {
            match self.run_once(tool.as_ref(), &args, &cancel).await {
                Ok(blocks) => return ToolOutcome::ok(call_id, &name, blocks),
                Err((class, message)) => {
                    let retryable = policy
                        .as_ref()
                        .map_or(false, |p| attempt < p.max_retries && p.retryable.contains(&class));
                    if !retryable || cancel.is_cancelled() {
                        return ToolOutcome::err(call_id, &name, class, message);
                    }
                    let delay = backoff_delay(policy.as_ref().unwrap(), attempt);
                    warn!(
                        tool = %name,
                        attempt,
                        class = %class,
                        delay_ms = delay.as_millis() as u64,
                        "tool call failed; retrying after backoff"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return ToolOutcome::err(call_id, &name, ErrorClass::Cancelled, "tool call cancelled");
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn run_once(
        &self,
        tool: &dyn Tool,
        args: &Value,
        cancel: &CancellationToken,
    ) -> Result<Vec<ContentBlock>, (ErrorClass, String)> {
        let work = tool.execute(args.clone(), cancel.child_token());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err((ErrorClass::Cancelled, "tool call cancelled".to_string())),
            res = timeout(self.config.tool_timeout, work) => match res {
                Err(_) => Err((
                    ErrorClass::Timeout,
                    format!("tool timed out after {}s", self.config.tool_timeout.as_secs()),
                )),
                Ok(Ok(blocks)) => Ok(blocks),
                Ok(Err(e)) => Err((e.class(), e.to_string())),
            },
        }
    }
}

/// Exponential delay with full jitter in `[d/2, d]`, capped by the policy.
fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.initial_backoff.as_millis().max(1) as u64;
    let exp = base.saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(policy.max_backoff.as_millis().max(1) as u64);
    let jittered = rand::thread_rng().gen_range(capped / 2..=capped.max(1));
    Duration::from_millis(jittered)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
