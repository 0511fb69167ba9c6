// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
/// End-to-end scenarios for the run loop and interaction manager.
///
/// Uses `ScriptedLlmClient` so every scenario is deterministic and requires
/// no network access.
#[cfg(test)]
mod scenario_tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use conductor_model::{
        ChatRole, FinishReason, ScriptedLlmClient, ScriptedResponse, StreamChunk, ToolChoice,
    };
    use conductor_store::{
        MemoryStores, MessageQuery, MessageStore, NewRun, RunConfig, RunStatus, RunStore,
        SortOrder, ThreadStore,
    };
    use conductor_tools::{
        ExecutionStrategy, StaticToolProvider, StaticToolsetOrchestrator, Tool, ToolContext,
        ToolDefinition, ToolParameter, ToolResult,
    };

    use crate::{
        AgentRunner, CancelFlag, EventEnvelope, InteractionManager, InteractionMode,
        ManagerConfig, RunContext, RunEvent, SubAgentNotice, ToolOutputSubmission, codes,
    };

    // ── Test tools ────────────────────────────────────────────────────────────

    struct SquareTool;

    #[async_trait]
    impl Tool for SquareTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("calculateSquare", "squares a number").with_parameter(
                ToolParameter::new("number", "number", true).with_schema(json!({"type": "number"})),
            )
        }
        async fn execute(&self, args: Value, _ctx: &ToolContext) -> ToolResult {
            let n = args["number"].as_f64().unwrap_or_default();
            ToolResult::ok(format!("The square of {n} is {}.", n * n))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("alwaysFails", "always fails")
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> ToolResult {
            ToolResult::fail("deliberate failure")
        }
    }

    struct WeatherTool;

    #[async_trait]
    impl Tool for WeatherTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("getWeather", "current weather for a city")
                .with_parameter(ToolParameter::new("city", "string", true))
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> ToolResult {
            ToolResult::ok("15°C and cloudy")
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn tool_calls_script(id: &str, name: &str, args: &str) -> ScriptedResponse {
        ScriptedResponse::Chunks(vec![
            StreamChunk::tool_call(0, id, name, args),
            StreamChunk::finish(FinishReason::ToolCalls),
        ])
    }

    fn text_script(parts: &[&str]) -> ScriptedResponse {
        let mut chunks: Vec<StreamChunk> =
            parts.iter().map(|p| StreamChunk::text_delta(*p)).collect();
        chunks.push(StreamChunk::finish(FinishReason::Stop));
        ScriptedResponse::Chunks(chunks)
    }

    struct Harness {
        manager: Arc<InteractionManager>,
        stores: MemoryStores,
        llm: Arc<ScriptedLlmClient>,
    }

    fn harness_with(
        scripts: Vec<ScriptedResponse>,
        mode: InteractionMode,
        tune: impl FnOnce(&mut ManagerConfig),
    ) -> Harness {
        let stores = MemoryStores::new();
        let llm = Arc::new(ScriptedLlmClient::new(scripts));
        let mut config = ManagerConfig::new(mode, "scripted-model");
        tune(&mut config);
        let manager = InteractionManager::new(
            config,
            llm.clone(),
            stores.threads.clone(),
            stores.messages.clone(),
            stores.runs.clone(),
        )
        .unwrap();
        Harness { manager, stores, llm }
    }

    fn generic_mode(register: impl FnOnce(&mut StaticToolProvider)) -> InteractionMode {
        let mut provider = StaticToolProvider::new();
        register(&mut provider);
        InteractionMode::GenericOpenApi { provider: Arc::new(provider) }
    }

    async fn collect(mut rx: mpsc::Receiver<EventEnvelope>) -> Vec<EventEnvelope> {
        let mut events = Vec::new();
        while let Some(envelope) = rx.recv().await {
            events.push(envelope);
        }
        events
    }

    fn kinds(events: &[EventEnvelope]) -> Vec<&'static str> {
        events.iter().map(|e| e.event.kind()).collect()
    }

    /// Invariant 1: at most one terminal event, and nothing after it.
    fn assert_terminal_is_last(events: &[EventEnvelope]) {
        let terminals: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.event.is_terminal())
            .map(|(i, _)| i)
            .collect();
        assert!(terminals.len() <= 1, "multiple terminal events: {:?}", kinds(events));
        if let Some(&idx) = terminals.first() {
            assert_eq!(idx, events.len() - 1, "events after terminal: {:?}", kinds(events));
        }
    }

    async fn persisted(stores: &MemoryStores, thread_id: &str) -> Vec<(ChatRole, String)> {
        stores
            .messages
            .list(
                thread_id,
                MessageQuery { order: SortOrder::Ascending, ..Default::default() },
            )
            .await
            .unwrap()
            .into_iter()
            .map(|m| {
                let text = m.to_chat().as_text().unwrap_or_default().to_string();
                (m.role, text)
            })
            .collect()
    }

    // ── S1: plain chat, no tools ──────────────────────────────────────────────

    #[tokio::test]
    async fn s1_plain_chat_event_sequence() {
        let h = harness_with(
            vec![text_script(&["hi", " there"])],
            generic_mode(|_| {}),
            |_| {},
        );
        let (_run_id, rx) = h.manager.process_input(None, "hello").await.unwrap();
        let events = collect(rx).await;

        assert_eq!(
            kinds(&events),
            vec![
                "agent.run.created",
                "agent.run.step.created",
                "thread.message.created",
                "thread.message.created",
                "thread.message.delta",
                "thread.message.delta",
                "thread.message.completed",
                "thread.run.completed",
            ]
        );
        assert_terminal_is_last(&events);

        // Run picked up in progress.
        assert!(matches!(
            events[0].event,
            RunEvent::RunCreated { status: RunStatus::InProgress }
        ));

        // With no tools, tool choice is coerced to `none`.
        let (_, options) = h.llm.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(options.tool_choice, ToolChoice::None);
        assert!(options.tools.is_empty());

        // Final persisted messages: [user "hello", assistant "hi there"].
        let thread_id = events[0].thread_id.clone();
        let messages = persisted(&h.stores, &thread_id).await;
        assert_eq!(
            messages,
            vec![
                (ChatRole::User, "hello".to_string()),
                (ChatRole::Assistant, "hi there".to_string()),
            ]
        );

        // Record mirrors the terminal event.
        let run = h.stores.runs.get(&events[0].run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
    }

    // ── S2: single tool call, success ─────────────────────────────────────────

    #[tokio::test]
    async fn s2_single_tool_call_success() {
        let h = harness_with(
            vec![
                tool_calls_script("tc1", "calculateSquare", r#"{"number":7}"#),
                text_script(&["The square of 7 is 49."]),
            ],
            generic_mode(|p| p.register(SquareTool)),
            |_| {},
        );
        let (_run_id, rx) = h.manager.process_input(None, "square 7").await.unwrap();
        let events = collect(rx).await;
        assert_terminal_is_last(&events);

        let k = kinds(&events);
        assert_eq!(k.iter().filter(|k| **k == "thread.run.requires_action").count(), 1);
        assert_eq!(k.iter().filter(|k| **k == "agent.tool.execution.started").count(), 1);
        assert_eq!(k.iter().filter(|k| **k == "agent.tool.execution.completed").count(), 1);
        assert_eq!(*k.last().unwrap(), "thread.run.completed");

        // Execution pair matched by id, with a successful result.
        let started_id = events.iter().find_map(|e| match &e.event {
            RunEvent::ToolExecutionStarted { tool_call_id, .. } => Some(tool_call_id.clone()),
            _ => None,
        });
        assert_eq!(started_id.as_deref(), Some("tc1"));
        let completed = events
            .iter()
            .find_map(|e| match &e.event {
                RunEvent::ToolExecutionCompleted { tool_call_id, result, .. } => {
                    Some((tool_call_id.clone(), result.clone()))
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(completed.0, "tc1");
        assert!(completed.1.success);

        // Persisted tool message answers tc1 with the tool's text.
        let thread_id = events[0].thread_id.clone();
        let stored = h
            .stores
            .messages
            .list(&thread_id, MessageQuery { order: SortOrder::Ascending, ..Default::default() })
            .await
            .unwrap();
        let tool_msg = stored.iter().find(|m| m.role == ChatRole::Tool).unwrap();
        assert_eq!(tool_msg.to_chat().as_text(), Some("The square of 7 is 49."));
        assert_eq!(tool_msg.metadata.tool_call_id.as_deref(), Some("tc1"));

        // Invariant 3: the tool message answers a prior assistant tool call.
        let assistant_calls: Vec<String> = stored
            .iter()
            .filter_map(|m| m.metadata.tool_calls.clone())
            .flatten()
            .map(|tc| tc.id)
            .collect();
        assert!(assistant_calls.contains(&"tc1".to_string()));
    }

    // ── S3: malformed tool-call arguments ─────────────────────────────────────

    #[tokio::test]
    async fn s3_malformed_arguments_fail_the_run() {
        let h = harness_with(
            vec![tool_calls_script("tc1", "calculateSquare", "{not json")],
            generic_mode(|p| p.register(SquareTool)),
            |_| {},
        );
        let (run_id, rx) = h.manager.process_input(None, "square 7").await.unwrap();
        let events = collect(rx).await;
        assert_terminal_is_last(&events);

        let error = events
            .iter()
            .find_map(|e| match &e.event {
                RunEvent::RunFailed { error } => Some(error.clone()),
                _ => None,
            })
            .expect("run must fail");
        assert_eq!(error.code, codes::LLM_PARSE_ERROR);

        // No tool execution events appear.
        assert!(!kinds(&events).contains(&"agent.tool.execution.started"));
        assert!(!kinds(&events).contains(&"agent.tool.execution.completed"));

        let run = h.stores.runs.get(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.last_error.unwrap().code, codes::LLM_PARSE_ERROR);
    }

    // ── S4: iteration limit pauses the run ────────────────────────────────────

    #[tokio::test]
    async fn s4_continuation_limit_pauses_without_executing() {
        let scripts = (0..3)
            .map(|i| {
                tool_calls_script(&format!("tc{i}"), "calculateSquare", r#"{"number":2}"#)
            })
            .collect();
        let h = harness_with(
            scripts,
            generic_mode(|p| p.register(SquareTool)),
            |c| c.max_tool_call_continuations = 2,
        );
        let (run_id, rx) = h.manager.process_input(None, "loop").await.unwrap();
        let events = collect(rx).await;

        // Turn 1 executes its call; turn 2 pauses with pending calls.
        let k = kinds(&events);
        assert_eq!(k.iter().filter(|k| **k == "agent.tool.execution.started").count(), 1);
        assert_eq!(*k.last().unwrap(), "thread.run.requires_action");
        assert_terminal_is_last(&events); // no terminal at all

        let pending = events
            .iter()
            .rev()
            .find_map(|e| match &e.event {
                RunEvent::RunRequiresAction { pending_tool_calls } => {
                    Some(pending_tool_calls.clone())
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "tc1");

        let run = h.stores.runs.get(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::RequiresAction, "paused, not failed");
    }

    #[tokio::test]
    async fn zero_continuations_pause_on_first_tool_turn() {
        let h = harness_with(
            vec![tool_calls_script("tc1", "calculateSquare", r#"{"number":3}"#)],
            generic_mode(|p| p.register(SquareTool)),
            |c| c.max_tool_call_continuations = 0,
        );
        let (run_id, rx) = h.manager.process_input(None, "go").await.unwrap();
        let events = collect(rx).await;

        let k = kinds(&events);
        assert_eq!(*k.last().unwrap(), "thread.run.requires_action");
        assert!(!k.contains(&"agent.tool.execution.started"));
        let run = h.stores.runs.get(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::RequiresAction);
    }

    #[tokio::test]
    async fn paused_run_resumes_with_submitted_outputs() {
        let h = harness_with(
            vec![
                tool_calls_script("tc1", "calculateSquare", r#"{"number":3}"#),
                text_script(&["resumed and done"]),
            ],
            generic_mode(|p| p.register(SquareTool)),
            |c| c.max_tool_call_continuations = 0,
        );
        let (run_id, rx) = h.manager.process_input(None, "go").await.unwrap();
        let events = collect(rx).await;
        let thread_id = events[0].thread_id.clone();

        let (_, rx2) = h
            .manager
            .continue_run_with_tool_outputs(
                &run_id,
                &thread_id,
                vec![ToolOutputSubmission {
                    tool_call_id: "tc1".into(),
                    tool_name: Some("calculateSquare".into()),
                    output: "9".into(),
                }],
            )
            .await
            .unwrap();
        let resumed = collect(rx2).await;
        assert_terminal_is_last(&resumed);
        assert_eq!(*kinds(&resumed).last().unwrap(), "thread.run.completed");

        // The submitted output was persisted as a tool message for tc1.
        let stored = h
            .stores
            .messages
            .list(&thread_id, MessageQuery { order: SortOrder::Ascending, ..Default::default() })
            .await
            .unwrap();
        let tool_msg = stored.iter().find(|m| m.role == ChatRole::Tool).unwrap();
        assert_eq!(tool_msg.metadata.tool_call_id.as_deref(), Some("tc1"));
        assert_eq!(tool_msg.to_chat().as_text(), Some("9"));

        let run = h.stores.runs.get(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    // ── S5: cancellation mid-stream ───────────────────────────────────────────

    #[tokio::test]
    async fn s5_cancel_mid_stream_persists_partial_message() {
        let stores = MemoryStores::new();
        let llm = Arc::new(ScriptedLlmClient::new(vec![text_script(&["hi", " there"])]));
        let thread = stores.threads.create(Default::default()).await.unwrap();
        let config = RunConfig { model: "scripted".into(), ..Default::default() };
        let run = stores
            .runs
            .create(NewRun::new(thread.id.clone(), config.clone()))
            .await
            .unwrap();

        let cancel = CancelFlag::new();
        let ctx = RunContext {
            run_id: run.id.clone(),
            thread_id: thread.id.clone(),
            config,
            system_prompt: "sys".into(),
            cancel: cancel.clone(),
        };
        let (_notice_tx, notice_rx) = mpsc::channel::<SubAgentNotice>(8);
        let mut runner = AgentRunner::new(
            llm,
            Arc::new(StaticToolProvider::new()),
            stores.messages.clone(),
            stores.threads.clone(),
            stores.runs.clone(),
            notice_rx,
        );

        // Capacity-1 channel: the runner blocks between events, so the flag
        // set after the first delta is observed at the next checkpoint.
        let (tx, mut rx) = mpsc::channel::<EventEnvelope>(1);
        let initial =
            vec![conductor_store::NewMessage::new(&thread.id, ChatRole::User, "hello")];
        let run_fut = runner.run(&ctx, initial, tx);
        let drain_fut = async {
            let mut events = Vec::new();
            let mut cancelled = false;
            while let Some(envelope) = rx.recv().await {
                if !cancelled
                    && matches!(envelope.event, RunEvent::MessageDelta { .. })
                {
                    cancel.cancel();
                    cancelled = true;
                }
                events.push(envelope);
            }
            events
        };
        let (run_result, events) = tokio::join!(run_fut, drain_fut);
        run_result.unwrap();

        // The final two events are the cancellation status changes.
        let k = kinds(&events);
        let n = k.len();
        assert_eq!(&k[n - 2..], &["agent.run.status.changed", "agent.run.status.changed"]);
        assert!(matches!(
            events[n - 2].event,
            RunEvent::StatusChanged { status: RunStatus::Cancelling }
        ));
        assert!(matches!(
            events[n - 1].event,
            RunEvent::StatusChanged { status: RunStatus::Cancelled }
        ));

        // The partially streamed assistant message is persisted as-is.
        let streamed: String = events
            .iter()
            .filter_map(|e| match &e.event {
                RunEvent::MessageDelta { delta: crate::MessageDelta::Text(t), .. } => {
                    Some(t.as_str())
                }
                _ => None,
            })
            .collect();
        let stored = stores
            .messages
            .list(&thread.id, MessageQuery { order: SortOrder::Ascending, ..Default::default() })
            .await
            .unwrap();
        let assistant = stored.iter().find(|m| m.role == ChatRole::Assistant).unwrap();
        assert_eq!(assistant.to_chat().as_text(), Some(streamed.as_str()));

        let record = stores.runs.get(&run.id).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Cancelled);
    }

    // ── S6: hierarchical delegation ───────────────────────────────────────────

    #[tokio::test]
    async fn s6_planner_delegates_to_specialist() {
        let mut weather = StaticToolProvider::new();
        weather.register(WeatherTool);
        let mut orch = StaticToolsetOrchestrator::new();
        orch.add("WeatherTools", "weather lookups", Arc::new(weather));

        let h = harness_with(
            vec![
                // Parent turn 1: delegate.
                tool_calls_script(
                    "tc_parent",
                    "delegateToSpecialistAgent",
                    r#"{"specialistId":"WeatherTools","subTaskDescription":"weather in London"}"#,
                ),
                // Worker turn: tool call, then summary.
                tool_calls_script("tc_w", "getWeather", r#"{"city":"London"}"#),
                text_script(&["15°C and cloudy"]),
                // Parent turn 2: synthesize.
                text_script(&["It is 15°C and cloudy in London."]),
            ],
            InteractionMode::HierarchicalPlanner { orchestrator: Arc::new(orch) },
            |_| {},
        );

        let (_run_id, rx) = h
            .manager
            .process_input(None, "what's the weather in London?")
            .await
            .unwrap();
        let events = collect(rx).await;
        assert_terminal_is_last(&events);
        assert_eq!(*kinds(&events).last().unwrap(), "thread.run.completed");

        // The parent's execution-completed result carries the worker's ids.
        let (exec_result, exec_call_id) = events
            .iter()
            .find_map(|e| match &e.event {
                RunEvent::ToolExecutionCompleted { result, tool_call_id, .. } => {
                    Some((result.clone(), tool_call_id.clone()))
                }
                _ => None,
            })
            .unwrap();
        assert!(exec_result.success, "{:?}", exec_result.error);
        assert_eq!(exec_call_id, "tc_parent");
        let sub_run_id = exec_result.metadata_str("subAgentRunId").unwrap().to_string();
        assert_eq!(exec_result.metadata_str("specialistId"), Some("WeatherTools"));
        assert_eq!(exec_result.metadata_str("subAgentStatus"), Some("completed"));

        // Invocation lifecycle events surround it with matching ids.
        assert!(events.iter().any(|e| matches!(
            &e.event,
            RunEvent::SubAgentInvocationStarted { specialist_id, .. }
                if specialist_id == "WeatherTools"
        )));
        let completed = events
            .iter()
            .find_map(|e| match &e.event {
                RunEvent::SubAgentInvocationCompleted {
                    sub_agent_run_id,
                    tool_call_id,
                    ..
                } => Some((sub_agent_run_id.clone(), tool_call_id.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(completed.0, sub_run_id);
        assert_eq!(completed.1, "tc_parent");

        // The worker's events never surface in the parent stream: the only
        // executed tool here is the delegate itself.
        assert!(!events.iter().any(|e| matches!(
            &e.event,
            RunEvent::ToolExecutionStarted { tool_name, .. } if tool_name == "getWeather"
        )));

        // The parent's final answer uses the worker's text.
        let thread_id = events[0].thread_id.clone();
        let messages = persisted(&h.stores, &thread_id).await;
        let final_answer = messages
            .iter()
            .rev()
            .find(|(role, _)| *role == ChatRole::Assistant)
            .unwrap();
        assert!(final_answer.1.contains("15°C and cloudy"));

        // The worker's tool result fed the parent as a tool message.
        let worker_output = messages.iter().find(|(role, _)| *role == ChatRole::Tool).unwrap();
        assert_eq!(worker_output.1, "15°C and cloudy");
    }

    // ── Parallel strategy keeps slots ─────────────────────────────────────────

    #[tokio::test]
    async fn parallel_mixed_results_keep_slots_and_run_proceeds() {
        let h = harness_with(
            vec![
                ScriptedResponse::Chunks(vec![
                    StreamChunk::tool_call(0, "ok_call", "calculateSquare", r#"{"number":3}"#),
                    StreamChunk::tool_call(1, "bad_call", "alwaysFails", "{}"),
                    StreamChunk::finish(FinishReason::ToolCalls),
                ]),
                text_script(&["carried on"]),
            ],
            generic_mode(|p| {
                p.register(SquareTool);
                p.register(FailingTool);
            }),
            |c| c.execution_strategy = ExecutionStrategy::Parallel,
        );
        let (_run_id, rx) = h.manager.process_input(None, "both").await.unwrap();
        let events = collect(rx).await;
        assert_terminal_is_last(&events);
        assert_eq!(*kinds(&events).last().unwrap(), "thread.run.completed");

        let completed: Vec<(String, bool)> = events
            .iter()
            .filter_map(|e| match &e.event {
                RunEvent::ToolExecutionCompleted { tool_call_id, result, .. } => {
                    Some((tool_call_id.clone(), result.success))
                }
                _ => None,
            })
            .collect();
        assert_eq!(completed, vec![("ok_call".into(), true), ("bad_call".into(), false)]);

        // Both tool messages persisted in slot order; the failure is
        // surfaced to the model as an error string.
        let thread_id = events[0].thread_id.clone();
        let messages = persisted(&h.stores, &thread_id).await;
        let tool_texts: Vec<&str> = messages
            .iter()
            .filter(|(role, _)| *role == ChatRole::Tool)
            .map(|(_, text)| text.as_str())
            .collect();
        assert_eq!(tool_texts.len(), 2);
        assert_eq!(tool_texts[0], "The square of 3 is 9.");
        assert!(tool_texts[1].starts_with("Error: deliberate failure"));
    }

    // ── Unknown tool is not fatal ─────────────────────────────────────────────

    #[tokio::test]
    async fn unknown_tool_feeds_error_back_and_run_continues() {
        let h = harness_with(
            vec![
                tool_calls_script("tc1", "noSuchTool", "{}"),
                text_script(&["recovered"]),
            ],
            generic_mode(|p| p.register(SquareTool)),
            |_| {},
        );
        let (_run_id, rx) = h.manager.process_input(None, "go").await.unwrap();
        let events = collect(rx).await;
        assert_eq!(*kinds(&events).last().unwrap(), "thread.run.completed");

        let thread_id = events[0].thread_id.clone();
        let messages = persisted(&h.stores, &thread_id).await;
        let tool_msg = messages.iter().find(|(role, _)| *role == ChatRole::Tool).unwrap();
        assert!(tool_msg.1.starts_with("Error: tool not found"));
    }

    // ── Long tool loops stay bounded ──────────────────────────────────────────

    #[tokio::test]
    async fn long_tool_loop_ends_cleanly_when_model_stops_calling() {
        // Ten tool turns, then the scripts run out and the mock answers with
        // text; the run must complete without tripping any limit.
        let scripts = (0..10)
            .map(|i| tool_calls_script(&format!("tc{i}"), "calculateSquare", r#"{"number":1}"#))
            .collect();
        let h = harness_with(
            scripts,
            generic_mode(|p| p.register(SquareTool)),
            |c| c.max_tool_call_continuations = 1_000,
        );
        let (run_id, rx) = h.manager.process_input(None, "go").await.unwrap();
        let events = collect(rx).await;
        assert_eq!(*kinds(&events).last().unwrap(), "thread.run.completed");
        let k = kinds(&events);
        assert_eq!(k.iter().filter(|k| **k == "agent.tool.execution.started").count(), 10);
        let run = h.stores.runs.get(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    // ── Inconsistent finish reasons fail the run ──────────────────────────────

    #[tokio::test]
    async fn length_finish_reason_fails_the_run() {
        let h = harness_with(
            vec![ScriptedResponse::Chunks(vec![
                StreamChunk::text_delta("truncat"),
                StreamChunk::finish(FinishReason::Length),
            ])],
            generic_mode(|_| {}),
            |_| {},
        );
        let (_run_id, rx) = h.manager.process_input(None, "go").await.unwrap();
        let events = collect(rx).await;
        let error = events
            .iter()
            .find_map(|e| match &e.event {
                RunEvent::RunFailed { error } => Some(error.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(error.code, codes::LLM_FINISH_REASON_ERROR);
    }

    #[tokio::test]
    async fn missing_finish_reason_completes_the_run() {
        // Stream ends without ever carrying a finish reason.
        let h = harness_with(
            vec![ScriptedResponse::Chunks(vec![StreamChunk::text_delta("done anyway")])],
            generic_mode(|_| {}),
            |_| {},
        );
        let (_run_id, rx) = h.manager.process_input(None, "go").await.unwrap();
        let events = collect(rx).await;
        assert_eq!(*kinds(&events).last().unwrap(), "thread.run.completed");
    }

    // ── Mid-stream transport errors ───────────────────────────────────────────

    #[tokio::test]
    async fn stream_error_fails_the_run_with_llm_error() {
        let h = harness_with(
            vec![ScriptedResponse::StreamError("connection reset".into())],
            generic_mode(|_| {}),
            |_| {},
        );
        let (run_id, rx) = h.manager.process_input(None, "go").await.unwrap();
        let events = collect(rx).await;
        let error = events
            .iter()
            .find_map(|e| match &e.event {
                RunEvent::RunFailed { error } => Some(error.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(error.code, codes::LLM_ERROR);
        assert!(error.message.contains("connection reset"));
        let run = h.stores.runs.get(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
    }

    // ── Multi-turn persistence ────────────────────────────────────────────────

    #[tokio::test]
    async fn second_run_on_same_thread_sees_prior_history() {
        let h = harness_with(
            vec![text_script(&["first reply"]), text_script(&["second reply"])],
            generic_mode(|_| {}),
            |_| {},
        );
        let (_r1, rx1) = h.manager.process_input(None, "turn one").await.unwrap();
        let events1 = collect(rx1).await;
        let thread_id = events1[0].thread_id.clone();

        let (_r2, rx2) = h
            .manager
            .process_input(Some(&thread_id), "turn two")
            .await
            .unwrap();
        let _ = collect(rx2).await;

        // The second call's outgoing context contained the first exchange.
        let (messages, _) = h.llm.last_request.lock().unwrap().clone().unwrap();
        let texts: Vec<String> = messages
            .iter()
            .filter_map(|m| m.as_text().map(str::to_string))
            .collect();
        assert!(texts.iter().any(|t| t == "turn one"));
        assert!(texts.iter().any(|t| t == "first reply"));
        assert!(texts.iter().any(|t| t == "turn two"));
        // And exactly once each (no duplication of the new message).
        assert_eq!(texts.iter().filter(|t| *t == "turn two").count(), 1);
    }
}
