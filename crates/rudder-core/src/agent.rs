// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rudder_config::{AgentOptions, FollowUpMode, OutputLimits, SteeringMode, ThinkingLevel};
use rudder_model::{
    agent_visible, ErrorClass, Message, ModelProvider, ProviderError, Role, StopReason,
    StreamEvent, StreamRequest, ToolCallAccumulator,
};
use rudder_session::Session;
use rudder_tools::{apply_limits, ExecutorPool, ToolOutcome, ToolRegistry};

use crate::compact::Compactor;
use crate::events::{AgentEvent, AgentEventKind, CompactionInfo, MessageDelta};

/// States of the turn loop. `Idle` accepts a new prompt; every other state
/// rejects one unless a streaming behavior routes it to steer/follow-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Preparing,
    Streaming,
    ExecutingTools,
    Terminating,
}

/// What `prompt` should do when a turn is already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingBehavior {
    /// Inject at the next turn boundary of the current run.
    Steer,
    /// Enqueue to run after the current prompt completes.
    FollowUp,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("a turn is in flight; pass a streaming behavior or use steer/follow_up")]
    Busy,
    #[error("steering requires an active turn")]
    NotStreaming,
    #[error("a steer is already pending in one-at-a-time mode")]
    SteerPending,
    #[error("a follow-up is already pending in one-at-a-time mode")]
    FollowUpPending,
    #[error("agent is shut down")]
    ShutDown,
}

/// The streaming agent controller.
///
/// Alternates between "call the model" and "execute the tools the model
/// asked for", emits a typed event stream, and accepts mid-stream
/// interventions. At most one turn is in flight at any time, enforced by
/// the state enum behind a mutex; a new `prompt` while busy is a protocol
/// error, not a queue operation.
///
/// The controller owns its message list; every other component sees
/// snapshot copies. Reconfiguration (`set_model`, `set_thinking_level`, …)
/// is read at the next turn boundary.
pub struct Agent {
    inner: Arc<Inner>,
}

struct Inner {
    state: StdMutex<AgentState>,
    idle_tx: watch::Sender<bool>,
    events: mpsc::Sender<AgentEvent>,
    last_event_at: AtomicI64,
    provider: StdMutex<Arc<dyn ModelProvider>>,
    tools: StdMutex<Arc<ToolRegistry>>,
    pool: StdMutex<Arc<ExecutorPool>>,
    session: Arc<TokioMutex<Session>>,
    compactor: StdMutex<Compactor>,
    options: StdMutex<AgentOptions>,
    output_limits: StdMutex<OutputLimits>,
    messages: StdMutex<Vec<Message>>,
    prior_summary: StdMutex<Option<String>>,
    steering: StdMutex<VecDeque<Message>>,
    follow_ups: StdMutex<VecDeque<Message>>,
    cancel: StdMutex<CancellationToken>,
    /// At most one compaction per session at a time.
    compaction_gate: TokioMutex<()>,
    /// Set by the tool-call-cutoff soft trigger; consumed at the next turn
    /// boundary.
    force_compact: AtomicBool,
    shutdown: AtomicBool,
}

impl Agent {
    /// Construct a controller over an open session. Returns the receiving
    /// end of the event channel; hand it to a `SessionAdapter` (or drain it
    /// directly). The channel is bounded: a consumer that stops draining
    /// pauses the turn loop.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        provider: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        pool: Arc<ExecutorPool>,
        session: Arc<TokioMutex<Session>>,
        compactor: Compactor,
        options: AgentOptions,
        output_limits: OutputLimits,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<AgentEvent>) {
        let (events, events_rx) = mpsc::channel(event_buffer.max(1));
        let (idle_tx, _) = watch::channel(true);

        let (messages, prior_summary) = {
            let session = session.lock().await;
            (session.get_messages(), session.last_compaction_summary())
        };

        let inner = Arc::new(Inner {
            state: StdMutex::new(AgentState::Idle),
            idle_tx,
            events,
            last_event_at: AtomicI64::new(0),
            provider: StdMutex::new(provider),
            tools: StdMutex::new(tools),
            pool: StdMutex::new(pool),
            session,
            compactor: StdMutex::new(compactor),
            options: StdMutex::new(options),
            output_limits: StdMutex::new(output_limits),
            messages: StdMutex::new(messages),
            prior_summary: StdMutex::new(prior_summary),
            steering: StdMutex::new(VecDeque::new()),
            follow_ups: StdMutex::new(VecDeque::new()),
            cancel: StdMutex::new(CancellationToken::new()),
            compaction_gate: TokioMutex::new(()),
            force_compact: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });

        {
            let provider = inner.provider.lock().unwrap().clone();
            let tools = inner.tools.lock().unwrap().names();
            inner
                .emit(AgentEventKind::ServerStart {
                    model: provider.model_name().to_string(),
                    tools,
                })
                .await;
        }

        (Self { inner }, events_rx)
    }

    // ── Control surface ───────────────────────────────────────────────────────

    /// Submit a user prompt. Rejected with [`AgentError::Busy`] unless the
    /// controller is idle; queuing is explicit via `follow_up`.
    pub async fn prompt(&self, text: impl Into<String>) -> Result<(), AgentError> {
        self.submit(Message::user(text), None).await
    }

    /// Submit a prompt with an explicit policy for the busy case.
    pub async fn prompt_streaming(
        &self,
        text: impl Into<String>,
        behavior: StreamingBehavior,
    ) -> Result<(), AgentError> {
        self.submit(Message::user(text), Some(behavior)).await
    }

    /// Inject a user message into the running turn; consumed at the next
    /// turn boundary.
    pub fn steer(&self, text: impl Into<String>) -> Result<(), AgentError> {
        self.queue_steer(Message::user(text))
    }

    /// Enqueue a prompt to run after the current one completes. While idle
    /// this is equivalent to `prompt`.
    pub async fn follow_up(&self, text: impl Into<String>) -> Result<(), AgentError> {
        self.submit(Message::user(text), Some(StreamingBehavior::FollowUp))
            .await
    }

    /// Cancel the in-flight model stream and all running tool calls. The
    /// run emits `AgentEnd {stop_reason: Aborted}` and returns to idle.
    /// No-op while idle.
    pub fn abort(&self) {
        self.inner.cancel.lock().unwrap().cancel();
    }

    pub fn state(&self) -> AgentState {
        *self.inner.state.lock().unwrap()
    }

    /// Snapshot of the controller's current message list.
    pub fn get_messages(&self) -> Vec<Message> {
        self.inner.messages.lock().unwrap().clone()
    }

    /// Texts of the queued follow-up prompts, in order.
    pub fn pending_follow_ups(&self) -> Vec<String> {
        self.inner
            .follow_ups
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.text())
            .collect()
    }

    /// Swap the model provider. Applied at the next turn boundary.
    pub fn set_model(&self, provider: Arc<dyn ModelProvider>) {
        *self.inner.provider.lock().unwrap() = provider;
    }

    pub fn set_thinking_level(&self, level: ThinkingLevel) {
        self.inner.options.lock().unwrap().thinking_level = level;
    }

    pub fn set_compactor(&self, compactor: Compactor) {
        *self.inner.compactor.lock().unwrap() = compactor;
    }

    pub fn set_executor(&self, pool: Arc<ExecutorPool>) {
        *self.inner.pool.lock().unwrap() = pool;
    }

    pub fn set_tools(&self, tools: Arc<ToolRegistry>) {
        *self.inner.tools.lock().unwrap() = tools;
    }

    pub fn set_tool_call_cutoff(&self, cutoff: usize) {
        self.inner
            .compactor
            .lock()
            .unwrap()
            .set_tool_call_cutoff(cutoff);
    }

    pub fn set_tool_summary_strategy(&self, strategy: rudder_config::ToolSummaryStrategy) {
        self.inner
            .compactor
            .lock()
            .unwrap()
            .set_tool_summary_strategy(strategy);
    }

    pub fn set_auto_retry(&self, enabled: bool) {
        self.inner.options.lock().unwrap().auto_retry = enabled;
    }

    /// Block until the controller is idle.
    pub async fn wait(&self) {
        let mut rx = self.inner.idle_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Abort any in-flight run and refuse further prompts. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.abort();
        self.wait().await;
        let mut session = self.inner.session.lock().await;
        session.close().await;
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn submit(
        &self,
        message: Message,
        behavior: Option<StreamingBehavior>,
    ) -> Result<(), AgentError> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(AgentError::ShutDown);
        }
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state == AgentState::Idle {
                *state = AgentState::Preparing;
            } else {
                drop(state);
                return match behavior {
                    None => Err(AgentError::Busy),
                    Some(StreamingBehavior::Steer) => self.queue_steer(message),
                    Some(StreamingBehavior::FollowUp) => self.queue_follow_up(message),
                };
            }
        }
        // send_replace: the value must update even when nobody is waiting
        // yet, so a later `wait` observes the busy state.
        self.inner.idle_tx.send_replace(false);

        let cancel = CancellationToken::new();
        *self.inner.cancel.lock().unwrap() = cancel.clone();

        self.inner.messages.lock().unwrap().push(message.clone());
        {
            let mut session = self.inner.session.lock().await;
            if let Err(e) = session.append_message(message).await {
                warn!(error = %e, "failed to persist user prompt; continuing on in-memory state");
            }
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { run(inner, cancel).await });
        Ok(())
    }

    fn queue_steer(&self, message: Message) -> Result<(), AgentError> {
        let state = *self.inner.state.lock().unwrap();
        if state == AgentState::Idle || state == AgentState::Terminating {
            return Err(AgentError::NotStreaming);
        }
        let mode = self.inner.options.lock().unwrap().steering_mode;
        let mut queue = self.inner.steering.lock().unwrap();
        if mode == SteeringMode::OneAtATime && !queue.is_empty() {
            return Err(AgentError::SteerPending);
        }
        queue.push_back(message);
        Ok(())
    }

    fn queue_follow_up(&self, message: Message) -> Result<(), AgentError> {
        let mode = self.inner.options.lock().unwrap().follow_up_mode;
        let mut queue = self.inner.follow_ups.lock().unwrap();
        if mode == FollowUpMode::OneAtATime && !queue.is_empty() {
            return Err(AgentError::FollowUpPending);
        }
        queue.push_back(message);
        Ok(())
    }
}

impl Inner {
    /// Emit one event with a monotonically non-decreasing nanosecond stamp.
    /// The send blocks when the channel is full, pausing the turn loop —
    /// backpressure is intended.
    async fn emit(&self, kind: AgentEventKind) {
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let prev = self.last_event_at.load(Ordering::SeqCst);
        let at = now.max(prev);
        self.last_event_at.store(at, Ordering::SeqCst);
        let _ = self.events.send(AgentEvent { event_at: at, kind }).await;
    }

    fn set_state(&self, state: AgentState) {
        *self.state.lock().unwrap() = state;
    }

    fn snapshot_messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    async fn persist_message(&self, message: Message) {
        let mut session = self.session.lock().await;
        if let Err(e) = session.append_message(message).await {
            warn!(error = %e, "failed to persist message; continuing on in-memory state");
        }
    }
}

/// What one model stream produced.
enum TurnOutcome {
    Message {
        message: Message,
        stop_reason: StopReason,
    },
    Aborted {
        partial: Option<Message>,
    },
    Failed(ProviderError),
}

/// An owned copy of one tool call, detached from the assistant message.
#[derive(Clone)]
struct PlannedCall {
    id: String,
    name: String,
    args: Value,
}

/// The run task: drives turns until stop, error, or abort, then emits the
/// terminal `AgentEnd` and returns the controller to idle.
async fn run(inner: Arc<Inner>, cancel: CancellationToken) {
    inner.emit(AgentEventKind::AgentStart).await;

    let mut transport_retries: u32 = 0;
    let mut compacted_for_overflow = false;

    let stop_reason = 'outer: loop {
        inner.set_state(AgentState::Preparing);

        // Turn boundary: consume pending steer messages into the context.
        let pending: Vec<Message> = inner.steering.lock().unwrap().drain(..).collect();
        for message in pending {
            inner.messages.lock().unwrap().push(message.clone());
            inner.persist_message(message).await;
        }

        run_compaction(&inner, &cancel, false).await;

        if cancel.is_cancelled() {
            break 'outer StopReason::Aborted;
        }

        inner.set_state(AgentState::Streaming);
        inner.emit(AgentEventKind::TurnStart).await;

        let outcome = stream_turn(&inner, &cancel).await;
        let (message, stop) = match outcome {
            TurnOutcome::Aborted { partial } => {
                // Text already streamed is kept (and persisted) as a partial
                // assistant message; `AgentEnd` is the next event observers
                // see.
                if let Some(partial) = partial {
                    inner.messages.lock().unwrap().push(partial.clone());
                    inner.persist_message(partial).await;
                }
                break 'outer StopReason::Aborted;
            }
            TurnOutcome::Failed(e) => {
                match handle_stream_error(&inner, &cancel, e, &mut transport_retries, &mut compacted_for_overflow).await
                {
                    ErrorDisposition::Retry => continue 'outer,
                    ErrorDisposition::Aborted => break 'outer StopReason::Aborted,
                    ErrorDisposition::Fatal => break 'outer StopReason::Error,
                }
            }
            TurnOutcome::Message {
                message,
                stop_reason,
            } => (message, stop_reason),
        };
        transport_retries = 0;

        inner.messages.lock().unwrap().push(message.clone());
        inner
            .emit(AgentEventKind::MessageEnd {
                message: message.clone(),
            })
            .await;

        let calls: Vec<PlannedCall> = message
            .tool_calls()
            .iter()
            .map(|c| PlannedCall {
                id: c.id.to_string(),
                name: c.name.to_string(),
                args: c.args.clone(),
            })
            .collect();

        if stop == StopReason::ToolCalls && !calls.is_empty() {
            inner.set_state(AgentState::ExecutingTools);

            // Soft trigger: a burst of tool calls forces a compaction check
            // at the next turn boundary. Calls are never dropped.
            let cutoff = inner.compactor.lock().unwrap().config().tool_call_cutoff;
            if cutoff > 0 && calls.len() >= cutoff {
                inner.force_compact.store(true, Ordering::SeqCst);
            }

            execute_tools(&inner, &cancel, &calls).await;
            inner.emit(AgentEventKind::TurnEnd).await;

            if cancel.is_cancelled() {
                break 'outer StopReason::Aborted;
            }
            continue 'outer;
        }

        inner.emit(AgentEventKind::TurnEnd).await;

        if cancel.is_cancelled() {
            break 'outer StopReason::Aborted;
        }

        // A steer that arrived during the final stretch of the turn still
        // gets its turn: loop back so the boundary drain picks it up.
        if !inner.steering.lock().unwrap().is_empty() {
            continue 'outer;
        }

        // Natural end of turn: dequeue the next follow-up, if any.
        let next = inner.follow_ups.lock().unwrap().pop_front();
        match next {
            Some(message) => {
                inner.messages.lock().unwrap().push(message.clone());
                inner.persist_message(message).await;
                continue 'outer;
            }
            None => break 'outer stop,
        }
    };

    inner.set_state(AgentState::Terminating);
    let leftover = inner.steering.lock().unwrap().len();
    if leftover > 0 {
        warn!(count = leftover, "dropping unconsumed steer messages at end of run");
        inner.steering.lock().unwrap().clear();
    }
    inner
        .emit(AgentEventKind::AgentEnd {
            stop_reason: Some(stop_reason),
            messages: inner.snapshot_messages(),
        })
        .await;
    inner.set_state(AgentState::Idle);
    inner.idle_tx.send_replace(true);
}

enum ErrorDisposition {
    Retry,
    Aborted,
    Fatal,
}

/// Classify a stream failure and decide whether the turn is retried.
/// Fatal paths emit the `Error` event; the caller emits the terminal
/// `AgentEnd`.
async fn handle_stream_error(
    inner: &Arc<Inner>,
    cancel: &CancellationToken,
    error: ProviderError,
    transport_retries: &mut u32,
    compacted_for_overflow: &mut bool,
) -> ErrorDisposition {
    let class = error.class();
    let (auto_retry, max_retries) = {
        let opts = inner.options.lock().unwrap();
        (opts.auto_retry, opts.max_retries)
    };

    match class {
        ErrorClass::Cancelled => ErrorDisposition::Aborted,
        ErrorClass::ContextLengthExceeded if !*compacted_for_overflow => {
            *compacted_for_overflow = true;
            warn!("context length exceeded; forcing compaction and retrying the turn once");
            run_compaction(inner, cancel, true).await;
            ErrorDisposition::Retry
        }
        ErrorClass::RateLimit if auto_retry && *transport_retries < max_retries => {
            *transport_retries += 1;
            let delay = error
                .retry_after()
                .unwrap_or_else(|| backoff(*transport_retries));
            warn!(attempt = *transport_retries, delay_ms = delay.as_millis() as u64, "rate limited; retrying");
            tokio::select! {
                _ = cancel.cancelled() => ErrorDisposition::Aborted,
                _ = tokio::time::sleep(delay) => ErrorDisposition::Retry,
            }
        }
        ErrorClass::Network | ErrorClass::Server
            if auto_retry && *transport_retries < max_retries =>
        {
            *transport_retries += 1;
            let delay = backoff(*transport_retries);
            warn!(
                attempt = *transport_retries,
                class = %class,
                delay_ms = delay.as_millis() as u64,
                "transient transport error; retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => ErrorDisposition::Aborted,
                _ = tokio::time::sleep(delay) => ErrorDisposition::Retry,
            }
        }
        _ => {
            inner
                .emit(AgentEventKind::Error {
                    class,
                    message: error.to_string(),
                })
                .await;
            ErrorDisposition::Fatal
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(250u64.saturating_mul(1 << attempt.min(6)))
}

/// Call the model once and accumulate the assistant message from the event
/// stream, relaying each delta to observers.
async fn stream_turn(inner: &Arc<Inner>, cancel: &CancellationToken) -> TurnOutcome {
    let provider = inner.provider.lock().unwrap().clone();
    let tool_schemas = inner.tools.lock().unwrap().schemas();
    let (system_prompt, thinking_level) = {
        let opts = inner.options.lock().unwrap();
        (
            opts.system_prompt.clone().unwrap_or_default(),
            opts.thinking_level,
        )
    };
    // Only agent-visible messages cross the boundary to the model.
    let outbound = agent_visible(&inner.snapshot_messages());

    let req = StreamRequest {
        model: provider.model_name().to_string(),
        system_prompt,
        messages: outbound,
        tools: tool_schemas,
        thinking_level,
    };

    let mut stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return TurnOutcome::Aborted { partial: None },
        res = provider.stream(req, cancel.child_token()) => match res {
            Ok(stream) => stream,
            Err(e) => return TurnOutcome::Failed(e),
        },
    };

    let mut accumulator = ToolCallAccumulator::new();
    let mut text = String::new();
    let mut thinking = String::new();
    let mut started = false;

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return TurnOutcome::Aborted { partial: partial_message(&thinking, &text) };
            }
            event = stream.next() => event,
        };
        let Some(event) = event else {
            return TurnOutcome::Failed(ProviderError::Other(
                "stream ended without a terminal event".to_string(),
            ));
        };

        match event {
            StreamEvent::Start => {}
            StreamEvent::TextDelta(delta) => {
                ensure_started(inner, &mut started).await;
                text.push_str(&delta);
                inner
                    .emit(AgentEventKind::MessageUpdate {
                        delta: MessageDelta::Text(delta),
                    })
                    .await;
            }
            StreamEvent::ThinkingDelta(delta) => {
                ensure_started(inner, &mut started).await;
                thinking.push_str(&delta);
                inner
                    .emit(AgentEventKind::MessageUpdate {
                        delta: MessageDelta::Thinking(delta),
                    })
                    .await;
            }
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                args_chunk,
            } => {
                ensure_started(inner, &mut started).await;
                accumulator.push(index, id.as_deref(), name.as_deref(), args_chunk.as_deref());
                inner
                    .emit(AgentEventKind::MessageUpdate {
                        delta: MessageDelta::ToolCall {
                            index,
                            id,
                            name,
                            args_chunk,
                        },
                    })
                    .await;
            }
            StreamEvent::Done {
                message,
                usage,
                stop_reason,
            } => {
                ensure_started(inner, &mut started).await;
                // Transports normally assemble the final message; fall back
                // to local accumulation when one does not.
                let mut message = message;
                if message.blocks.is_empty() {
                    let mut blocks = Vec::new();
                    if !thinking.is_empty() {
                        blocks.push(rudder_model::ContentBlock::thinking(std::mem::take(
                            &mut thinking,
                        )));
                    }
                    if !text.is_empty() {
                        blocks.push(rudder_model::ContentBlock::text(std::mem::take(&mut text)));
                    }
                    blocks.extend(accumulator.finish());
                    message = Message::assistant_blocks(blocks);
                }
                message.usage = Some(usage);
                return TurnOutcome::Message {
                    message,
                    stop_reason,
                };
            }
            StreamEvent::Error(e) => return TurnOutcome::Failed(e),
        }
    }
}

async fn ensure_started(inner: &Arc<Inner>, started: &mut bool) {
    if !*started {
        *started = true;
        inner
            .emit(AgentEventKind::MessageStart {
                role: Role::Assistant,
            })
            .await;
    }
}

fn partial_message(thinking: &str, text: &str) -> Option<Message> {
    let mut blocks = Vec::new();
    if !thinking.is_empty() {
        blocks.push(rudder_model::ContentBlock::thinking(thinking));
    }
    if !text.is_empty() {
        blocks.push(rudder_model::ContentBlock::text(text));
    }
    if blocks.is_empty() {
        None
    } else {
        Some(Message::assistant_blocks(blocks))
    }
}

/// Dispatch all tool calls of one assistant message through the pool, in
/// parallel up to the pool's concurrency cap. Results are appended and
/// announced in call order; an abort mid-batch still yields one result per
/// call (marked cancelled), preserving the call/result pairing invariant.
async fn execute_tools(inner: &Arc<Inner>, cancel: &CancellationToken, calls: &[PlannedCall]) {
    for call in calls {
        inner
            .emit(AgentEventKind::ToolExecutionStart {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                args: call.args.clone(),
            })
            .await;
    }

    let pool = inner.pool.lock().unwrap().clone();
    let registry = inner.tools.lock().unwrap().clone();
    let mut tasks = Vec::with_capacity(calls.len());
    for call in calls.iter().cloned() {
        let pool = Arc::clone(&pool);
        let registry = Arc::clone(&registry);
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            match registry.get(&call.name) {
                Some(tool) => pool.execute(tool, &call.id, call.args, cancel).await,
                None => ToolOutcome::err(
                    &call.id,
                    &call.name,
                    ErrorClass::ToolUserError,
                    format!("unknown tool: {}", call.name),
                ),
            }
        }));
    }

    let limits = inner.output_limits.lock().unwrap().clone();
    for (i, task) in tasks.into_iter().enumerate() {
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => ToolOutcome::err(
                &calls[i].id,
                &calls[i].name,
                ErrorClass::Other,
                format!("tool execution panicked: {e}"),
            ),
        };
        let blocks = apply_limits(outcome.blocks, &limits);
        let result = Message::tool_result(&outcome.call_id, &outcome.name, blocks, outcome.is_error);
        inner.messages.lock().unwrap().push(result.clone());
        inner
            .emit(AgentEventKind::ToolExecutionEnd {
                tool_call_id: outcome.call_id,
                tool_name: outcome.name,
                result,
                is_error: outcome.is_error,
            })
            .await;
    }
}

/// Run the compaction check, and the compaction itself when triggered.
/// `forced` (and the cutoff flag) bypass `auto_compact` and the threshold
/// predicate; "nothing to compact" is always a silent no-op.
async fn run_compaction(inner: &Arc<Inner>, cancel: &CancellationToken, forced: bool) {
    let _gate = inner.compaction_gate.lock().await;

    let forced = forced || inner.force_compact.swap(false, Ordering::SeqCst);
    let compactor = inner.compactor.lock().unwrap().clone();
    let provider = inner.provider.lock().unwrap().clone();
    let messages = inner.snapshot_messages();

    let auto = compactor.config().auto_compact;
    let triggered = compactor.should_compact(&messages, provider.context_window());
    if !(forced || (auto && triggered)) {
        return;
    }
    if !rudder_session::CompactionPolicy::eligible(&compactor, &messages) {
        debug!("compaction requested but nothing is eligible; skipping");
        return;
    }

    let info = CompactionInfo {
        messages_before: messages.len(),
        tokens_before: rudder_model::estimate_total_tokens(&messages),
        ..Default::default()
    };
    inner
        .emit(AgentEventKind::CompactionStart { info: info.clone() })
        .await;

    let prior = inner.prior_summary.lock().unwrap().clone();
    match compactor
        .compact(provider.as_ref(), &messages, prior.as_deref(), cancel)
        .await
    {
        Ok(outcome) => {
            *inner.messages.lock().unwrap() = outcome.messages_after.clone();
            *inner.prior_summary.lock().unwrap() = Some(outcome.summary.clone());
            inner
                .emit(AgentEventKind::CompactionEnd {
                    info: CompactionInfo {
                        messages_after: Some(outcome.messages_after.len()),
                        tokens_after: Some(outcome.tokens_after),
                        summary: Some(outcome.summary.clone()),
                        ..info
                    },
                    messages_after: outcome.messages_after,
                    first_kept_index: Some(outcome.first_kept_index),
                })
                .await;
        }
        Err(e) => {
            // Non-actionable or failed: the original messages are untouched.
            // A genuine overflow will resurface as a stream error and be
            // handled there.
            warn!(error = %e, "compaction did not run");
            inner
                .emit(AgentEventKind::CompactionEnd {
                    info,
                    messages_after: Vec::new(),
                    first_kept_index: None,
                })
                .await;
        }
    }
}
