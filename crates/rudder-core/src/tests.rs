// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end tests for the agent controller, the compaction engine, and
/// the session adapter working together.
///
/// Uses scripted providers so every scenario is deterministic and requires
/// no network access.
mod agent_tests {
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::stream;
    use serde_json::{json, Value};
    use tokio::sync::{mpsc, Mutex as TokioMutex, Notify};
    use tokio_util::sync::CancellationToken;

    use rudder_config::{AgentOptions, CompactionConfig, OutputLimits, ToolSummaryStrategy};
    use rudder_model::{
        ContentBlock, ErrorClass, EventStream, HangingProvider, Message, ModelProvider,
        ProviderError, Role, ScriptedProvider, StopReason, StreamEvent, StreamRequest, Usage,
    };
    use rudder_session::{EntryPayload, Session, SessionManager};
    use rudder_tools::{ExecutorPool, PoolConfig, Tool, ToolError, ToolRegistry};

    use crate::{
        Agent, AgentError, AgentEvent, AgentEventKind, Compactor, SessionAdapter,
        StreamingBehavior, SUMMARY_PREFIX,
    };

    // ── Helpers ───────────────────────────────────────────────────────────────

    struct Harness {
        agent: Agent,
        session: Arc<TokioMutex<Session>>,
        events: mpsc::Receiver<AgentEvent>,
        _adapter: tokio::task::JoinHandle<()>,
        _tmp: tempfile::TempDir,
    }

    async fn harness(provider: Arc<dyn ModelProvider>, registry: ToolRegistry) -> Harness {
        harness_with(
            provider,
            registry,
            CompactionConfig::default(),
            PoolConfig::default(),
            Vec::new(),
        )
        .await
    }

    async fn harness_with(
        provider: Arc<dyn ModelProvider>,
        registry: ToolRegistry,
        compaction: CompactionConfig,
        pool: PoolConfig,
        seed_messages: Vec<Message>,
    ) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(tmp.path());
        let mut session = manager.create(None, None).await.unwrap();
        for m in seed_messages {
            session.append_message(m).await.unwrap();
        }
        let session = Arc::new(TokioMutex::new(session));

        let (agent, events_rx) = Agent::new(
            provider,
            Arc::new(registry),
            Arc::new(ExecutorPool::new(pool)),
            Arc::clone(&session),
            Compactor::new(compaction),
            AgentOptions::default(),
            OutputLimits::default(),
            1024,
        )
        .await;
        let (adapter, events) = SessionAdapter::attach(events_rx, Arc::clone(&session), 1024);
        Harness {
            agent,
            session,
            events,
            _adapter: adapter,
            _tmp: tmp,
        }
    }

    /// Drain forwarded events until (and including) `AgentEnd`.
    async fn collect_run(events: &mut mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for events")
                .expect("event channel closed");
            let done = event.is_terminal();
            out.push(event);
            if done {
                break;
            }
        }
        out
    }

    fn kind_name(event: &AgentEvent) -> &'static str {
        match &event.kind {
            AgentEventKind::ServerStart { .. } => "server_start",
            AgentEventKind::AgentStart => "agent_start",
            AgentEventKind::AgentEnd { .. } => "agent_end",
            AgentEventKind::TurnStart => "turn_start",
            AgentEventKind::TurnEnd => "turn_end",
            AgentEventKind::MessageStart { .. } => "message_start",
            AgentEventKind::MessageUpdate { .. } => "message_update",
            AgentEventKind::MessageEnd { .. } => "message_end",
            AgentEventKind::ToolExecutionStart { .. } => "tool_execution_start",
            AgentEventKind::ToolExecutionEnd { .. } => "tool_execution_end",
            AgentEventKind::CompactionStart { .. } => "compaction_start",
            AgentEventKind::CompactionEnd { .. } => "compaction_end",
            AgentEventKind::Error { .. } => "error",
        }
    }

    /// Event names for one run, with the construction-time `server_start`
    /// dropped.
    fn run_names(events: &[AgentEvent]) -> Vec<&'static str> {
        events
            .iter()
            .map(kind_name)
            .filter(|n| *n != "server_start")
            .collect()
    }

    /// A tool that replies with fixed text.
    struct FixedTool {
        name: &'static str,
        reply: &'static str,
    }

    #[async_trait]
    impl Tool for FixedTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "returns a fixed reply"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(
            &self,
            _args: Value,
            _cancel: CancellationToken,
        ) -> Result<Vec<ContentBlock>, ToolError> {
            Ok(vec![ContentBlock::text(self.reply)])
        }
    }

    /// A tool that sleeps past any reasonable per-call timeout.
    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps for five seconds"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(
            &self,
            _args: Value,
            _cancel: CancellationToken,
        ) -> Result<Vec<ContentBlock>, ToolError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec![ContentBlock::text("too late")])
        }
    }

    /// First call streams a text delta, then holds the stream open until
    /// released; later calls answer immediately. Lets tests interleave
    /// steer/follow-up/abort with an in-flight turn.
    struct GatedProvider {
        release: Arc<Notify>,
        calls: StdMutex<u32>,
        requests: Arc<StdMutex<Vec<StreamRequest>>>,
    }

    impl GatedProvider {
        fn new() -> (Arc<Self>, Arc<Notify>) {
            let release = Arc::new(Notify::new());
            let provider = Arc::new(Self {
                release: Arc::clone(&release),
                calls: StdMutex::new(0),
                requests: Arc::new(StdMutex::new(Vec::new())),
            });
            (provider, release)
        }
    }

    #[async_trait]
    impl ModelProvider for GatedProvider {
        fn name(&self) -> &str {
            "gated-mock"
        }
        fn model_name(&self) -> &str {
            "gated-mock-model"
        }
        fn context_window(&self) -> usize {
            128_000
        }

        async fn stream(
            &self,
            req: StreamRequest,
            _cancel: CancellationToken,
        ) -> Result<EventStream, ProviderError> {
            self.requests.lock().unwrap().push(req);
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if call == 1 {
                let release = Arc::clone(&self.release);
                let head = stream::iter(vec![
                    StreamEvent::Start,
                    StreamEvent::TextDelta("first reply".to_string()),
                ]);
                let tail = stream::once(async move {
                    release.notified().await;
                    StreamEvent::Done {
                        message: Message::assistant("first reply"),
                        usage: Usage::default(),
                        stop_reason: StopReason::Stop,
                    }
                });
                Ok(Box::pin(stream::StreamExt::chain(head, tail)))
            } else {
                Ok(Box::pin(stream::iter(ScriptedProvider::text_script(
                    "second reply",
                ))))
            }
        }
    }

    // ── S1: simple Q&A ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn simple_question_and_answer() {
        let provider = Arc::new(ScriptedProvider::always_text("hi"));
        let mut h = harness(provider, ToolRegistry::default()).await;

        h.agent.prompt("hello").await.unwrap();
        h.agent.wait().await;
        let events = collect_run(&mut h.events).await;

        assert_eq!(
            run_names(&events),
            vec![
                "agent_start",
                "turn_start",
                "message_start",
                "message_update",
                "message_end",
                "turn_end",
                "agent_end"
            ]
        );

        let session = h.session.lock().await;
        let msgs = session.get_messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].text(), "hello");
        assert_eq!(msgs[1].text(), "hi");
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn event_timestamps_are_non_decreasing() {
        let provider = Arc::new(ScriptedProvider::always_text("hi"));
        let mut h = harness(provider, ToolRegistry::default()).await;
        h.agent.prompt("hello").await.unwrap();
        h.agent.wait().await;
        let events = collect_run(&mut h.events).await;
        for pair in events.windows(2) {
            assert!(pair[0].event_at <= pair[1].event_at);
        }
    }

    // ── S2: single tool call ──────────────────────────────────────────────────

    #[tokio::test]
    async fn single_tool_call_round_trip() {
        let provider = Arc::new(ScriptedProvider::tool_then_text(
            "c1",
            "bash",
            r#"{"command":"ls"}"#,
            "a.txt, b.txt",
        ));
        let mut registry = ToolRegistry::default();
        registry.register(FixedTool {
            name: "bash",
            reply: "a.txt\nb.txt",
        });
        let mut h = harness(provider, registry).await;

        h.agent.prompt("list files").await.unwrap();
        h.agent.wait().await;
        let events = collect_run(&mut h.events).await;

        let starts: Vec<&AgentEvent> = events
            .iter()
            .filter(|e| matches!(&e.kind, AgentEventKind::ToolExecutionStart { tool_call_id, .. } if tool_call_id == "c1"))
            .collect();
        let ends: Vec<&AgentEvent> = events
            .iter()
            .filter(|e| matches!(&e.kind, AgentEventKind::ToolExecutionEnd { tool_call_id, is_error, .. } if tool_call_id == "c1" && !is_error))
            .collect();
        assert_eq!(starts.len(), 1, "exactly one execution start");
        assert_eq!(ends.len(), 1, "exactly one successful execution end");

        // message_end of the tool-calling assistant message precedes the
        // execution start; both precede the first turn_end after them.
        let idx = |pred: &dyn Fn(&AgentEventKind) -> bool| {
            events.iter().position(|e| pred(&e.kind)).unwrap()
        };
        let call_end = idx(&|k| {
            matches!(k, AgentEventKind::MessageEnd { message } if !message.tool_calls().is_empty())
        });
        let exec_start =
            idx(&|k| matches!(k, AgentEventKind::ToolExecutionStart { .. }));
        let exec_end = idx(&|k| matches!(k, AgentEventKind::ToolExecutionEnd { .. }));
        let turn_end = events
            .iter()
            .position(|e| matches!(e.kind, AgentEventKind::TurnEnd))
            .unwrap();
        assert!(call_end < exec_start);
        assert!(exec_start < exec_end);
        assert!(exec_end < turn_end, "tool execution completes before its turn ends");

        // Final message order: user, assistant(tool_call), tool_result,
        // assistant(text).
        let msgs = h.agent.get_messages();
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[1].tool_calls()[0].id, "c1");
        assert_eq!(msgs[2].tool_result_call_id(), Some("c1"));
        assert_eq!(msgs[3].text(), "a.txt, b.txt");

        // The session mirrors the same four messages.
        let session = h.session.lock().await;
        assert_eq!(session.get_messages().len(), 4);
    }

    #[tokio::test]
    async fn parallel_tool_calls_all_resolve_before_next_turn() {
        let script = vec![
            ScriptedProvider::tool_call_script(&[
                ("a1".into(), "alpha".into(), "{}".into()),
                ("b2".into(), "beta".into(), "{}".into()),
            ]),
            ScriptedProvider::text_script("combined"),
        ];
        let provider = Arc::new(ScriptedProvider::new(script));
        let mut registry = ToolRegistry::default();
        registry.register(FixedTool {
            name: "alpha",
            reply: "A",
        });
        registry.register(FixedTool {
            name: "beta",
            reply: "B",
        });
        let mut h = harness(provider, registry).await;

        h.agent.prompt("fan out").await.unwrap();
        h.agent.wait().await;
        let _ = collect_run(&mut h.events).await;

        let msgs = h.agent.get_messages();
        // user, assistant(2 calls), 2 results, assistant text
        assert_eq!(msgs.len(), 5);
        let result_ids: Vec<&str> = msgs[2..4]
            .iter()
            .map(|m| m.tool_result_call_id().unwrap())
            .collect();
        let mut sorted = result_ids.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec!["a1", "b2"], "result set equals call set");
        assert_eq!(msgs[4].text(), "combined");
    }

    #[tokio::test]
    async fn unknown_tool_becomes_user_error_result() {
        let provider = Arc::new(ScriptedProvider::tool_then_text(
            "c1",
            "missing",
            "{}",
            "recovered",
        ));
        let mut h = harness(provider, ToolRegistry::default()).await;

        h.agent.prompt("go").await.unwrap();
        h.agent.wait().await;
        let events = collect_run(&mut h.events).await;

        assert!(events.iter().any(|e| matches!(
            &e.kind,
            AgentEventKind::ToolExecutionEnd { is_error: true, result, .. }
                if result.text().contains("unknown tool")
        )));
        // The turn continued to a final assistant reply.
        assert_eq!(h.agent.get_messages().last().unwrap().text(), "recovered");
    }

    // ── S3: steer during streaming ────────────────────────────────────────────

    #[tokio::test]
    async fn steer_is_consumed_at_next_turn_boundary() {
        let (provider, release) = GatedProvider::new();
        let requests = Arc::clone(&provider.requests);
        let mut h = harness(provider, ToolRegistry::default()).await;

        h.agent.prompt("write a poem").await.unwrap();
        // Wait until the first delta proves the turn is streaming.
        loop {
            let event = h.events.recv().await.unwrap();
            if matches!(event.kind, AgentEventKind::MessageUpdate { .. }) {
                break;
            }
        }
        h.agent.steer("make it about cats").unwrap();
        release.notify_one();
        h.agent.wait().await;
        let events = collect_run(&mut h.events).await;

        // turn_end of turn 1 strictly precedes turn_start of turn 2.
        let names: Vec<&str> = events.iter().map(kind_name).collect();
        let first_turn_end = names.iter().position(|n| *n == "turn_end").unwrap();
        let second_turn_start = names
            .iter()
            .rposition(|n| *n == "turn_start")
            .unwrap();
        assert!(first_turn_end < second_turn_start);

        // The second request carries prompt, first reply, steer — in order.
        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let outbound = &requests[1].messages;
        assert_eq!(outbound[0].text(), "write a poem");
        assert_eq!(outbound[1].text(), "first reply");
        assert_eq!(outbound[2].text(), "make it about cats");
    }

    #[tokio::test]
    async fn second_steer_rejected_in_one_at_a_time_mode() {
        let (provider, release) = GatedProvider::new();
        let mut h = harness(provider, ToolRegistry::default()).await;

        h.agent.prompt("start").await.unwrap();
        loop {
            let event = h.events.recv().await.unwrap();
            if matches!(event.kind, AgentEventKind::MessageUpdate { .. }) {
                break;
            }
        }
        h.agent.steer("first").unwrap();
        assert!(matches!(
            h.agent.steer("second"),
            Err(AgentError::SteerPending)
        ));
        release.notify_one();
        h.agent.wait().await;
    }

    #[tokio::test]
    async fn steer_while_idle_is_rejected() {
        let provider = Arc::new(ScriptedProvider::always_text("x"));
        let h = harness(provider, ToolRegistry::default()).await;
        assert!(matches!(
            h.agent.steer("nobody is listening"),
            Err(AgentError::NotStreaming)
        ));
    }

    // ── Prompt admission matrix ───────────────────────────────────────────────

    #[tokio::test]
    async fn prompt_while_busy_requires_streaming_behavior() {
        let (provider, release) = GatedProvider::new();
        let mut h = harness(provider, ToolRegistry::default()).await;

        h.agent.prompt("first").await.unwrap();
        loop {
            let event = h.events.recv().await.unwrap();
            if matches!(event.kind, AgentEventKind::MessageUpdate { .. }) {
                break;
            }
        }

        // Bare prompt while busy is a protocol error.
        assert!(matches!(
            h.agent.prompt("second").await,
            Err(AgentError::Busy)
        ));
        // With an explicit behavior it enqueues.
        h.agent
            .prompt_streaming("queued", StreamingBehavior::FollowUp)
            .await
            .unwrap();
        assert_eq!(h.agent.pending_follow_ups(), vec!["queued"]);
        // One-at-a-time: a second follow-up is rejected while one pends.
        assert!(matches!(
            h.agent
                .prompt_streaming("another", StreamingBehavior::FollowUp)
                .await,
            Err(AgentError::FollowUpPending)
        ));

        release.notify_one();
        h.agent.wait().await;
        let _ = collect_run(&mut h.events).await;

        // The follow-up ran as its own prompt after the first completed.
        let texts: Vec<String> = h.agent.get_messages().iter().map(|m| m.text()).collect();
        assert!(texts.contains(&"queued".to_string()));
        assert!(h.agent.pending_follow_ups().is_empty());
    }

    #[tokio::test]
    async fn follow_up_while_idle_runs_as_prompt() {
        let provider = Arc::new(ScriptedProvider::always_text("done"));
        let mut h = harness(provider, ToolRegistry::default()).await;
        h.agent.follow_up("just do it").await.unwrap();
        h.agent.wait().await;
        let _ = collect_run(&mut h.events).await;
        assert_eq!(h.agent.get_messages()[0].text(), "just do it");
    }

    // ── S4: compaction before a turn ──────────────────────────────────────────

    fn tight_compaction() -> CompactionConfig {
        CompactionConfig {
            max_tokens: 50,
            reserve_tokens: 0,
            keep_recent: 2,
            keep_recent_tokens: 30,
            tool_summary_strategy: ToolSummaryStrategy::Heuristic,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn oversized_history_is_compacted_before_the_turn() {
        let provider = Arc::new(ScriptedProvider::always_text("continuing"));
        let seed: Vec<Message> = (0..100)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("request number {i} with some detail"))
                } else {
                    Message::assistant(format!("reply number {i} with some detail"))
                }
            })
            .collect();
        let mut h = harness_with(
            Arc::clone(&provider) as Arc<dyn ModelProvider>,
            ToolRegistry::default(),
            tight_compaction(),
            PoolConfig::default(),
            seed,
        )
        .await;

        h.agent.prompt("continue").await.unwrap();
        h.agent.wait().await;
        let events = collect_run(&mut h.events).await;

        // compaction_start precedes the first turn_start.
        let names: Vec<&str> = run_names(&events);
        let compaction_start = names.iter().position(|n| *n == "compaction_start").unwrap();
        let turn_start = names.iter().position(|n| *n == "turn_start").unwrap();
        assert!(compaction_start < turn_start);

        // The outbound list leads with the synthetic summary.
        let request = provider.last_request.lock().unwrap();
        let outbound = &request.as_ref().unwrap().messages;
        assert!(outbound[0].text().starts_with(SUMMARY_PREFIX));

        // The session carries a compaction entry pointing at the first
        // retained message.
        let session = h.session.lock().await;
        let (first_kept, _) = session
            .entries()
            .iter()
            .find_map(|e| match &e.payload {
                EntryPayload::Compaction {
                    first_kept_entry_id,
                    tokens_before,
                    ..
                } => Some((first_kept_entry_id.clone(), *tokens_before)),
                _ => None,
            })
            .expect("compaction entry present");
        let first_kept = first_kept.expect("first kept pointer set");
        let kept_entry = session
            .entries()
            .iter()
            .find(|e| e.id == first_kept)
            .expect("pointer resolves");
        assert!(kept_entry.is_message());

        // The condensed view starts with the summary and stays hidden from
        // the user.
        let msgs = session.get_messages();
        assert!(msgs[0].text().starts_with(SUMMARY_PREFIX));
        assert!(!msgs[0].is_user_visible());
        assert!(msgs[0].is_agent_visible());
    }

    #[tokio::test]
    async fn context_overflow_compacts_and_retries_once() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::error_script(ProviderError::ContextLengthExceeded(
                "too big".into(),
            )),
            ScriptedProvider::text_script("recovered"),
        ]));
        let seed: Vec<Message> = (0..10)
            .map(|i| Message::user(format!("filler message number {i} here")))
            .collect();
        let mut compaction = tight_compaction();
        // Not triggered proactively: only the overflow forces it.
        compaction.max_tokens = 1_000_000;
        let mut h = harness_with(
            provider,
            ToolRegistry::default(),
            compaction,
            PoolConfig::default(),
            seed,
        )
        .await;

        h.agent.prompt("go").await.unwrap();
        h.agent.wait().await;
        let events = collect_run(&mut h.events).await;

        let names = run_names(&events);
        assert!(names.contains(&"compaction_start"));
        assert!(names.contains(&"compaction_end"));
        assert!(!names.contains(&"error"), "retry must succeed silently");
        assert_eq!(h.agent.get_messages().last().unwrap().text(), "recovered");
    }

    #[tokio::test]
    async fn repeated_context_overflow_surfaces_error_then_agent_end() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::error_script(ProviderError::ContextLengthExceeded("x".into())),
            ScriptedProvider::error_script(ProviderError::ContextLengthExceeded("x".into())),
        ]));
        let seed: Vec<Message> = (0..10)
            .map(|i| Message::user(format!("filler message number {i} here")))
            .collect();
        let mut compaction = tight_compaction();
        compaction.max_tokens = 1_000_000;
        let mut h = harness_with(
            provider,
            ToolRegistry::default(),
            compaction,
            PoolConfig::default(),
            seed,
        )
        .await;

        h.agent.prompt("go").await.unwrap();
        h.agent.wait().await;
        let events = collect_run(&mut h.events).await;
        let names = run_names(&events);
        let error = names.iter().position(|n| *n == "error").unwrap();
        assert_eq!(*names.last().unwrap(), "agent_end");
        assert!(error < names.len() - 1);
    }

    // ── S5: tool timeout ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn tool_timeout_yields_error_result_and_turn_continues() {
        let provider = Arc::new(ScriptedProvider::tool_then_text(
            "c1", "slow", "{}", "wrapped up",
        ));
        let mut registry = ToolRegistry::default();
        registry.register(SlowTool);
        let pool = PoolConfig {
            max_concurrent: 2,
            tool_timeout: Duration::from_millis(100),
            queue_timeout: Duration::from_secs(5),
        };
        let mut h = harness_with(
            provider,
            registry,
            CompactionConfig::default(),
            pool,
            Vec::new(),
        )
        .await;

        let started = std::time::Instant::now();
        h.agent.prompt("run it").await.unwrap();
        h.agent.wait().await;
        let events = collect_run(&mut h.events).await;

        let result = events
            .iter()
            .find_map(|e| match &e.kind {
                AgentEventKind::ToolExecutionEnd {
                    result, is_error, ..
                } => Some((result.clone(), *is_error)),
                _ => None,
            })
            .expect("tool execution end");
        assert!(result.1, "timeout surfaces as error result");
        assert!(result.0.text().contains("timed out"));
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "deadline enforced well before the tool's five-second sleep"
        );
        // The turn continued to a final reply.
        assert_eq!(h.agent.get_messages().last().unwrap().text(), "wrapped up");
    }

    // ── Abort ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn abort_ends_run_with_aborted_stop_reason() {
        let provider = Arc::new(HangingProvider);
        let mut h = harness(provider, ToolRegistry::default()).await;

        h.agent.prompt("never finishes").await.unwrap();
        loop {
            let event = h.events.recv().await.unwrap();
            if matches!(event.kind, AgentEventKind::MessageUpdate { .. }) {
                break;
            }
        }
        h.agent.abort();
        h.agent.wait().await;
        let events = collect_run(&mut h.events).await;

        match &events.last().unwrap().kind {
            AgentEventKind::AgentEnd { stop_reason, .. } => {
                assert_eq!(*stop_reason, Some(StopReason::Aborted));
            }
            other => panic!("expected agent_end, got {other:?}"),
        }
        assert_eq!(h.agent.state(), crate::AgentState::Idle);

        // Streamed text survives as a partial assistant message.
        let msgs = h.agent.get_messages();
        assert_eq!(msgs.last().unwrap().text(), "partial");
        // And a fresh prompt is accepted afterwards: the controller is
        // reusable.
        assert!(matches!(
            h.agent.prompt("again").await,
            Ok(()) | Err(AgentError::Busy)
        ));
    }

    #[tokio::test]
    async fn abort_after_agent_end_is_prompt_ready_within_bound() {
        let provider = Arc::new(HangingProvider);
        let mut h = harness(provider, ToolRegistry::default()).await;
        h.agent.prompt("x").await.unwrap();
        loop {
            let event = h.events.recv().await.unwrap();
            if matches!(event.kind, AgentEventKind::MessageUpdate { .. }) {
                break;
            }
        }
        h.agent.abort();
        tokio::time::timeout(Duration::from_secs(2), h.agent.wait())
            .await
            .expect("abort must settle within the bound");
    }

    // ── Transport error policy ────────────────────────────────────────────────

    #[tokio::test]
    async fn rate_limit_is_retried_with_retry_after() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::error_script(ProviderError::RateLimit {
                retry_after: Some(Duration::from_millis(10)),
                message: "slow down".into(),
            }),
            ScriptedProvider::text_script("eventually"),
        ]));
        let mut h = harness(provider, ToolRegistry::default()).await;
        h.agent.prompt("x").await.unwrap();
        h.agent.wait().await;
        let events = collect_run(&mut h.events).await;
        assert!(!run_names(&events).contains(&"error"));
        assert_eq!(h.agent.get_messages().last().unwrap().text(), "eventually");
    }

    #[tokio::test]
    async fn network_errors_retry_up_to_policy_then_succeed() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::error_script(ProviderError::Network("reset".into())),
            ScriptedProvider::error_script(ProviderError::Server("502".into())),
            ScriptedProvider::text_script("third time lucky"),
        ]));
        let mut h = harness(provider, ToolRegistry::default()).await;
        h.agent.prompt("x").await.unwrap();
        h.agent.wait().await;
        let _ = collect_run(&mut h.events).await;
        assert_eq!(
            h.agent.get_messages().last().unwrap().text(),
            "third time lucky"
        );
    }

    #[tokio::test]
    async fn auth_error_is_fatal_and_agent_end_is_terminal() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::error_script(ProviderError::Auth("bad key".into())),
        ]));
        let mut h = harness(provider, ToolRegistry::default()).await;
        h.agent.prompt("x").await.unwrap();
        h.agent.wait().await;
        let events = collect_run(&mut h.events).await;
        let names = run_names(&events);
        let error = names.iter().position(|n| *n == "error").unwrap();
        assert!(events.iter().any(|e| matches!(
            &e.kind,
            AgentEventKind::Error { class: ErrorClass::Auth, .. }
        )));
        assert_eq!(*names.last().unwrap(), "agent_end");
        assert!(error < names.len() - 1);
        assert_eq!(h.agent.state(), crate::AgentState::Idle);
    }

    #[tokio::test]
    async fn disabled_auto_retry_surfaces_transient_errors() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::error_script(ProviderError::Network("reset".into())),
            ScriptedProvider::text_script("never reached"),
        ]));
        let mut h = harness(provider, ToolRegistry::default()).await;
        h.agent.set_auto_retry(false);
        h.agent.prompt("x").await.unwrap();
        h.agent.wait().await;
        let events = collect_run(&mut h.events).await;
        assert!(events.iter().any(|e| matches!(
            &e.kind,
            AgentEventKind::Error { class: ErrorClass::Network, .. }
        )));
    }

    // ── Thinking ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn thinking_deltas_stay_separate_from_text() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::thinking_then_text_script("pondering deeply", "the answer"),
        ]));
        let mut h = harness(provider, ToolRegistry::default()).await;
        h.agent.prompt("think hard").await.unwrap();
        h.agent.wait().await;
        let events = collect_run(&mut h.events).await;

        assert!(events.iter().any(|e| matches!(
            &e.kind,
            AgentEventKind::MessageUpdate { delta: crate::MessageDelta::Thinking(t) } if t == "pondering deeply"
        )));
        let last = h.agent.get_messages().last().unwrap().clone();
        assert_eq!(last.thinking(), "pondering deeply");
        assert_eq!(last.text(), "the answer");

        // Thinking survives persistence end to end.
        let session = h.session.lock().await;
        let stored = session.get_messages();
        assert_eq!(stored.last().unwrap().thinking(), "pondering deeply");
    }

    // ── Configuration surface ─────────────────────────────────────────────────

    #[tokio::test]
    async fn thinking_level_reaches_the_transport() {
        let provider = Arc::new(ScriptedProvider::always_text("ok"));
        let mut h = harness(
            Arc::clone(&provider) as Arc<dyn ModelProvider>,
            ToolRegistry::default(),
        )
        .await;
        h.agent
            .set_thinking_level(rudder_config::ThinkingLevel::High);
        h.agent.prompt("x").await.unwrap();
        h.agent.wait().await;
        let _ = collect_run(&mut h.events).await;
        let request = provider.last_request.lock().unwrap();
        assert_eq!(
            request.as_ref().unwrap().thinking_level,
            rudder_config::ThinkingLevel::High
        );
    }

    #[tokio::test]
    async fn hidden_messages_do_not_reach_the_transport() {
        use rudder_model::MessageMeta;
        let provider = Arc::new(ScriptedProvider::always_text("ok"));
        let seed = vec![
            Message::user("visible context"),
            Message::user("operator note").with_meta(MessageMeta {
                agent_visible: false,
                user_visible: true,
                kind: None,
            }),
        ];
        let mut h = harness_with(
            Arc::clone(&provider) as Arc<dyn ModelProvider>,
            ToolRegistry::default(),
            CompactionConfig::default(),
            PoolConfig::default(),
            seed,
        )
        .await;
        h.agent.prompt("go").await.unwrap();
        h.agent.wait().await;
        let _ = collect_run(&mut h.events).await;

        let request = provider.last_request.lock().unwrap();
        let outbound = &request.as_ref().unwrap().messages;
        assert!(outbound.iter().all(|m| m.text() != "operator note"));
        // But the hidden message is still in the session.
        let session = h.session.lock().await;
        assert!(session
            .get_messages()
            .iter()
            .any(|m| m.text() == "operator note"));
    }

    #[tokio::test]
    async fn shutdown_refuses_further_prompts() {
        let provider = Arc::new(ScriptedProvider::always_text("ok"));
        let h = harness(provider, ToolRegistry::default()).await;
        h.agent.shutdown().await;
        h.agent.shutdown().await; // idempotent
        assert!(matches!(
            h.agent.prompt("too late").await,
            Err(AgentError::ShutDown)
        ));
    }

    // ── S6: fork preserves ancestry ───────────────────────────────────────────

    #[tokio::test]
    async fn fork_preserves_ancestry_and_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(tmp.path());
        let mut source = manager.create(Some("origin".into()), None).await.unwrap();
        source.append_message(Message::user("e1")).await.unwrap();
        let e2 = source
            .append_message(Message::assistant("e2"))
            .await
            .unwrap();
        source.append_message(Message::user("e3")).await.unwrap();

        let fork = manager
            .fork_from(&source, Some(&e2), Some("fork-1".into()), Some("Fork 1".into()))
            .await
            .unwrap();

        let msgs = fork.get_messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].text(), "e1");
        assert_eq!(msgs[1].text(), "e2");
        assert_eq!(fork.meta().parent_session.as_deref(), Some(source.dir()));
        assert_eq!(fork.meta().title.as_deref(), Some("Fork 1"));
        let leaf = fork.leaf_id().unwrap().to_string();
        assert_eq!(
            fork.entries()
                .iter()
                .find(|e| e.id == leaf)
                .unwrap()
                .message()
                .unwrap()
                .text(),
            "e2"
        );
    }
}
