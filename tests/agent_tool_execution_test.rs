//! Integration tests driving the full agent loop (Agent + Transport + Tool)
//! against a scripted fake transport, covering the parallel tool dispatch
//! and stop-condition scenarios from `spec.md` §8.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use open_agent::{
    queued_channel as channel, tool, Agent, AgentEvent, ApiKind, AssistantBlock, AssistantMessage,
    AssistantStreamEvent, InputModality, Message, ModelDescriptor, AgentOptions,
    PartialAssistantMessage, QueuedStream, StopReason, TextBlock, ThinkingBlock, ToolCallBlock,
    ToolResultContent, Transport, TransportParams, Usage,
};
use tokio_util::sync::CancellationToken;

fn test_model() -> ModelDescriptor {
    ModelDescriptor {
        id: "test-model".into(),
        name: "test-model".into(),
        provider: "test".into(),
        api: ApiKind::OpenAiCompletions,
        base_url: "https://example.test".into(),
        reasoning: false,
        input: vec![InputModality::Text],
        cost: Default::default(),
        context_window: 128_000,
        max_tokens: 4096,
    }
}

fn assistant_message(model: &ModelDescriptor, content: Vec<AssistantBlock>, reason: StopReason) -> AssistantMessage {
    AssistantMessage {
        content,
        api: model.api,
        provider: model.provider.clone(),
        model: model.id.clone(),
        usage: Usage::default(),
        stop_reason: reason,
        error_message: None,
    }
}

/// A transport that answers one scripted assistant turn per call, used to
/// drive the agent loop without a network connection.
struct ScriptedTransport {
    turn: AtomicUsize,
}

impl ScriptedTransport {
    fn new() -> Self {
        Self {
            turn: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn run(
        &self,
        model: &ModelDescriptor,
        _context: &[Message],
        _params: &TransportParams,
        _cancellation: CancellationToken,
    ) -> open_agent::Result<QueuedStream<AssistantStreamEvent>> {
        let turn = self.turn.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = channel();

        if turn == 0 {
            // First turn: ask for both multiplications in parallel.
            let call_a = ToolCallBlock::new("call_a", "multiply", serde_json::json!({"a": 3485, "b": 4234}));
            let call_b = ToolCallBlock::new("call_b", "multiply", serde_json::json!({"a": 88823, "b": 3482}));
            tx.push(AssistantStreamEvent::ToolCall { tool_call: call_a.clone() });
            tx.push(AssistantStreamEvent::ToolCall { tool_call: call_b.clone() });
            let message = assistant_message(
                model,
                vec![
                    AssistantBlock::ToolCall(call_a),
                    AssistantBlock::ToolCall(call_b),
                ],
                StopReason::ToolUse,
            );
            tx.end_with(AssistantStreamEvent::Done {
                reason: StopReason::ToolUse,
                message,
            });
        } else {
            let message = assistant_message(
                model,
                vec![AssistantBlock::Text(TextBlock::new("14759939450 + 309291286 = 15069230736"))],
                StopReason::Stop,
            );
            tx.end_with(AssistantStreamEvent::Done {
                reason: StopReason::Stop,
                message,
            });
        }
        Ok(rx)
    }
}

fn multiply_tool() -> open_agent::Tool {
    tool("multiply", "Multiplies two numbers")
        .param("a", "number")
        .param("b", "number")
        .build(|args| async move {
            let a = args["a"].as_f64().unwrap_or(0.0);
            let b = args["b"].as_f64().unwrap_or(0.0);
            Ok(serde_json::json!({ "result": a * b }))
        })
}

#[tokio::test]
async fn test_parallel_tool_calls_append_results_in_source_order() {
    let options = AgentOptions::builder()
        .model("test-model")
        .base_url("https://example.test")
        .tool(multiply_tool())
        .max_tool_iterations(3)
        .build()
        .unwrap();
    let agent = Agent::with_transport(test_model(), options, Arc::new(ScriptedTransport::new()));

    agent
        .prompt("multiply 3485*4234 and 88823*3482 in parallel, then sum")
        .await
        .unwrap();

    let messages = agent.messages().await;
    // user, assistant(toolUse), toolResult(a), toolResult(b), assistant(stop)
    assert_eq!(messages.len(), 5);

    match &messages[2] {
        Message::ToolResult { tool_call_id, .. } => assert_eq!(tool_call_id, "call_a"),
        _ => panic!("expected tool result for call_a first"),
    }
    match &messages[3] {
        Message::ToolResult { tool_call_id, content, .. } => {
            assert_eq!(tool_call_id, "call_b");
            match content {
                ToolResultContent::Text(s) => assert_eq!(s, "{\"result\":309281686.0}"),
                _ => panic!("expected text content"),
            }
        }
        _ => panic!("expected tool result for call_b second"),
    }

    match &messages[4] {
        Message::Assistant { stop_reason, .. } => assert_eq!(*stop_reason, StopReason::Stop),
        _ => panic!("expected final assistant stop message"),
    }
}

#[tokio::test]
async fn test_abort_during_tool_dispatch_seals_turn_as_aborted() {
    #[async_trait]
    impl Transport for OneShotSleepTransport {
        async fn run(
            &self,
            model: &ModelDescriptor,
            _context: &[Message],
            _params: &TransportParams,
            _cancellation: CancellationToken,
        ) -> open_agent::Result<QueuedStream<AssistantStreamEvent>> {
            let (tx, rx) = channel();
            let call = ToolCallBlock::new("call_sleep", "sleep_forever", serde_json::json!({}));
            let message = assistant_message(
                model,
                vec![AssistantBlock::ToolCall(call)],
                StopReason::ToolUse,
            );
            tx.end_with(AssistantStreamEvent::Done {
                reason: StopReason::ToolUse,
                message,
            });
            Ok(rx)
        }
    }

    struct OneShotSleepTransport;

    let sleep_tool = tool("sleep_forever", "never returns")
        .build(|_args| async move {
            std::future::pending::<()>().await;
            Ok(serde_json::json!(null))
        });

    let options = AgentOptions::builder()
        .model("test-model")
        .base_url("https://example.test")
        .tool(sleep_tool)
        .build()
        .unwrap();
    let agent = Arc::new(Agent::with_transport(
        test_model(),
        options,
        Arc::new(OneShotSleepTransport),
    ));

    let a = agent.clone();
    let handle = tokio::spawn(async move { a.prompt("please sleep forever").await });
    tokio::task::yield_now().await;
    agent.abort().await;
    handle.await.unwrap().unwrap();

    let messages = agent.messages().await;
    // No tool result should ever have been appended for an aborted turn.
    assert!(messages.iter().all(|m| !matches!(m, Message::ToolResult { .. })));
    match messages.last().unwrap() {
        Message::Assistant { stop_reason, error_message, .. } => {
            assert_eq!(*stop_reason, StopReason::Aborted);
            assert_eq!(error_message.as_deref(), Some("aborted"));
        }
        other => panic!("expected sealed assistant message, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_tool_reports_error_without_failing_turn() {
    struct OneShotUnknownTool {
        turn: AtomicUsize,
    }

    #[async_trait]
    impl Transport for OneShotUnknownTool {
        async fn run(
            &self,
            model: &ModelDescriptor,
            _context: &[Message],
            _params: &TransportParams,
            _cancellation: CancellationToken,
        ) -> open_agent::Result<QueuedStream<AssistantStreamEvent>> {
            let turn = self.turn.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = channel();
            let message = if turn == 0 {
                let call = ToolCallBlock::new("call_x", "does_not_exist", serde_json::json!({}));
                assistant_message(model, vec![AssistantBlock::ToolCall(call)], StopReason::ToolUse)
            } else {
                assistant_message(
                    model,
                    vec![AssistantBlock::Text(TextBlock::new("sorry about that"))],
                    StopReason::Stop,
                )
            };
            let reason = message.stop_reason;
            tx.end_with(AssistantStreamEvent::Done { reason, message });
            Ok(rx)
        }
    }

    let options = AgentOptions::builder()
        .model("test-model")
        .base_url("https://example.test")
        .max_tool_iterations(2)
        .build()
        .unwrap();
    let agent = Agent::with_transport(
        test_model(),
        options,
        Arc::new(OneShotUnknownTool { turn: AtomicUsize::new(0) }),
    );
    agent.prompt("call a tool that doesn't exist").await.unwrap();

    let messages = agent.messages().await;
    let tool_result = messages
        .iter()
        .find(|m| matches!(m, Message::ToolResult { .. }))
        .expect("expected an unknown-tool error result in history");
    match tool_result {
        Message::ToolResult { is_error, content, .. } => {
            assert!(is_error);
            match content {
                ToolResultContent::Text(s) => assert!(s.contains("unknown tool")),
                _ => panic!("expected text content"),
            }
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_subscribers_observe_source_ordered_events() {
    let options = AgentOptions::builder()
        .model("test-model")
        .base_url("https://example.test")
        .tool(multiply_tool())
        .max_tool_iterations(3)
        .build()
        .unwrap();
    let agent = Agent::with_transport(test_model(), options, Arc::new(ScriptedTransport::new()));
    let mut events = agent.subscribe();

    agent.prompt("multiply both pairs").await.unwrap();

    let mut starts = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let AgentEvent::ToolExecutionStart { tool_call_id, .. } = event {
            starts.push(tool_call_id);
        }
    }
    assert_eq!(starts, vec!["call_a", "call_b"]);
}

#[tokio::test]
async fn test_thinking_block_is_preserved_in_message_history() {
    struct ThinkingTransport;

    #[async_trait]
    impl Transport for ThinkingTransport {
        async fn run(
            &self,
            model: &ModelDescriptor,
            _context: &[Message],
            _params: &TransportParams,
            _cancellation: CancellationToken,
        ) -> open_agent::Result<QueuedStream<AssistantStreamEvent>> {
            let (tx, rx) = channel();
            let message = assistant_message(
                model,
                vec![
                    AssistantBlock::Thinking(ThinkingBlock::new("let me think").with_signature("sig-a")),
                    AssistantBlock::Text(TextBlock::new("42")),
                ],
                StopReason::Stop,
            );
            tx.end_with(AssistantStreamEvent::Done {
                reason: StopReason::Stop,
                message,
            });
            Ok(rx)
        }
    }

    let options = AgentOptions::builder()
        .model("test-model")
        .base_url("https://example.test")
        .build()
        .unwrap();
    let agent = Agent::with_transport(test_model(), options, Arc::new(ThinkingTransport));
    agent.prompt("think about it").await.unwrap();

    let messages = agent.messages().await;
    match messages.last().unwrap() {
        Message::Assistant { content, .. } => {
            assert!(matches!(content[0], AssistantBlock::Thinking(_)));
            assert!(matches!(content[1], AssistantBlock::Text(_)));
        }
        _ => panic!("expected assistant message"),
    }
}
