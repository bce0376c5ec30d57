//! The agent loop (§4.4, C6): drives `prompt -> stream -> tool_execute ->
//! stream -> ... -> done`, dispatches tool calls in parallel while
//! preserving source order on append, enforces the stop-condition table,
//! and fans events out to every subscriber.
//!
//! Grounded on the teacher's `src/client.rs` (`Client`, the
//! `Arc<AtomicBool>` interrupt-flag pattern generalized into a
//! [`tokio_util::sync::CancellationToken`], hook dispatch points) and
//! `src/hooks.rs` (first-decision-wins semantics, unchanged here).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use crate::cost;
use crate::history;
use crate::hooks::{Hooks, PostToolUseEvent, PreToolUseEvent, UserPromptSubmitEvent};
use crate::model::{ApiKind, ModelDescriptor};
use crate::provider::AssistantStreamEvent;
use crate::tools::Tool;
use crate::transport::{DirectTransport, Transport, TransportParams};
use crate::types::{
    AgentOptions, AgentState, AssistantBlock, Message, StopReason, ThinkingLevel, ToolCallBlock,
    ToolResultContent, Usage, UserContent,
};
use crate::{Error, Result};

/// Default per-tool execution timeout (§4.4 "Timeouts"). Sandbox-backed
/// tools use the longer 120s budget from §4.6/§4.7 instead; plain tools use
/// this one. `Agent` has no per-tool override today — every [`Tool`] shares
/// it — since [`Tool`] carries no timeout field of its own.
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;

/// Broadcast channel depth. Generous enough that a slow subscriber during a
/// burst of `message_update` deltas doesn't lag and miss events; a lagging
/// receiver only affects that one subscriber (`RecvError::Lagged`), never
/// the agent loop itself, since `broadcast::Sender::send` never blocks.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The event taxonomy subscribers observe (§4.4), flattened into one enum.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    AgentStart,
    AgentEnd,
    MessageStart,
    MessageUpdate(AssistantStreamEvent),
    MessageEnd(Message),
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        result: String,
        is_error: bool,
    },
    ModelChange(ModelDescriptor),
    ThinkingLevelChange(ThinkingLevel),
    Error(String),
}

struct AgentInner {
    system_prompt: String,
    model: ModelDescriptor,
    thinking_level: ThinkingLevel,
    tools: Vec<Arc<Tool>>,
    messages: Vec<Message>,
}

/// Drives the completion loop for one conversation. Cheap to share: every
/// public operation takes `&self`, with interior mutability guarding the
/// conversational state so `abort()` can be called from another task while
/// `prompt()` is in flight (§5 "single per-prompt abort signal").
pub struct Agent {
    inner: Mutex<AgentInner>,
    options: AgentOptions,
    transport: Arc<dyn Transport>,
    events: broadcast::Sender<AgentEvent>,
    cancellation: Mutex<CancellationToken>,
    pending_tool_calls: Mutex<HashSet<String>>,
    running: AtomicBool,
}

impl Agent {
    /// Builds an agent against an explicit [`ModelDescriptor`] (any
    /// provider) using the default [`DirectTransport`].
    pub fn with_model(model: ModelDescriptor, options: AgentOptions) -> Self {
        Self::with_transport(model, options, Arc::new(DirectTransport::new()))
    }

    /// Builds an agent with a caller-supplied transport (e.g. [`crate::transport::RelayTransport`]
    /// or a [`DirectTransport`] configured with a CORS proxy).
    pub fn with_transport(
        model: ModelDescriptor,
        options: AgentOptions,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(AgentInner {
                system_prompt: options.system_prompt().to_string(),
                thinking_level: options.thinking_level(),
                tools: options.tools().to_vec(),
                model,
                messages: Vec::new(),
            }),
            options,
            transport,
            events,
            cancellation: Mutex::new(CancellationToken::new()),
            pending_tool_calls: Mutex::new(HashSet::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Convenience constructor for the original local-OpenAI-compatible-server
    /// use case: builds a minimal [`ModelDescriptor`] from `options.model()`/
    /// `options.base_url()` at the `openai-completions` API.
    pub fn new(options: AgentOptions) -> Self {
        let model = ModelDescriptor::minimal(
            options.model(),
            ApiKind::OpenAiCompletions,
            options.base_url(),
        );
        Self::with_model(model, options)
    }

    /// Subscribes to the agent's event bus; every event from this point
    /// forward is delivered in source order (§4.4, §5).
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: AgentEvent) {
        // No subscribers is a normal state (e.g. between a headless replay
        // and the UI attaching); a closed channel is not an error here.
        let _ = self.events.send(event);
    }

    /// Returns a clone of the current conversation history.
    pub async fn messages(&self) -> Vec<Message> {
        self.inner.lock().await.messages.clone()
    }

    /// Replaces the conversation history wholesale (§6 `replaceMessages`),
    /// e.g. after loading a session or applying a compaction.
    pub async fn replace_messages(&self, messages: Vec<Message>) {
        self.inner.lock().await.messages = messages;
    }

    /// A read-only snapshot of agent state (§3.5), for UIs and the session
    /// log.
    pub async fn state(&self) -> AgentState {
        let inner = self.inner.lock().await;
        AgentState {
            system_prompt: inner.system_prompt.clone(),
            model: inner.model.clone(),
            thinking_level: inner.thinking_level,
            tools: inner.tools.clone(),
            messages: inner.messages.clone(),
            running: self.running.load(Ordering::Acquire),
            pending_tool_calls: self.pending_tool_calls.lock().await.clone(),
        }
    }

    /// Switches the active model, emitting `model_change` (§4.4 `setModel`).
    pub async fn set_model(&self, model: ModelDescriptor) {
        self.inner.lock().await.model = model.clone();
        self.emit(AgentEvent::ModelChange(model));
    }

    /// Switches the reasoning level, emitting `thinking_level_change`
    /// (§4.4 `setThinkingLevel`).
    pub async fn set_thinking_level(&self, level: ThinkingLevel) {
        self.inner.lock().await.thinking_level = level;
        self.emit(AgentEvent::ThinkingLevelChange(level));
    }

    /// Cancels the active stream and every outstanding tool execution
    /// (§4.4, §5). Idempotent; safe to call when nothing is running.
    pub async fn abort(&self) {
        self.cancellation.lock().await.cancel();
    }

    /// Appends a user message and drives the loop to completion (§4.4).
    /// Only one `prompt()` may be in flight at a time; a second call while
    /// one is running returns an error without side effects — callers must
    /// `abort()` first.
    pub async fn prompt(&self, content: impl Into<UserContent>) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::other(
                "a prompt is already in progress; call abort() first",
            ));
        }

        let token = CancellationToken::new();
        *self.cancellation.lock().await = token.clone();

        let result = self.run_prompt(content.into(), token).await;
        self.running.store(false, Ordering::Release);
        result
    }

    async fn run_prompt(&self, content: UserContent, token: CancellationToken) -> Result<()> {
        let history_snapshot = self.history_snapshot().await;
        let mut content = content;
        if let UserContent::Text(prompt) = &content {
            let event = UserPromptSubmitEvent::new(prompt.clone(), history_snapshot);
            if let Some(decision) = self
                .options
                .hooks()
                .execute_user_prompt_submit(event)
                .await
            {
                if !decision.continue_execution {
                    return Err(Error::other(
                        decision
                            .reason
                            .unwrap_or_else(|| "prompt blocked by hook".to_string()),
                    ));
                }
                if let Some(modified) = decision.modified_prompt {
                    content = UserContent::Text(modified);
                }
            }
        }

        self.inner
            .lock()
            .await
            .messages
            .push(Message::User { content });

        self.emit(AgentEvent::AgentStart);

        let max_iterations = self.options.max_tool_iterations().max(1);
        let mut iterations = 0u32;

        loop {
            iterations += 1;
            self.emit(AgentEvent::MessageStart);

            let (model, context, system_prompt, tools, thinking_level) = {
                let inner = self.inner.lock().await;
                let transformed = history::transform(&inner.messages, &inner.model);
                (
                    inner.model.clone(),
                    transformed,
                    inner.system_prompt.clone(),
                    inner.tools.clone(),
                    inner.thinking_level,
                )
            };

            let params = TransportParams {
                system_prompt,
                tools,
                thinking_level,
                max_tokens: self.options.max_tokens(),
                temperature: Some(self.options.temperature()),
                api_key_override: if self.options.api_key() == "not-needed" {
                    None
                } else {
                    Some(self.options.api_key().to_string())
                },
            };

            let mut stream = match self
                .transport
                .run(&model, &context, &params, token.clone())
                .await
            {
                Ok(s) => s,
                Err(e) => {
                    let message = error_message(&model, e.to_string());
                    self.inner.lock().await.messages.push(message.clone());
                    self.emit(AgentEvent::MessageEnd(message));
                    self.emit(AgentEvent::Error(e.to_string()));
                    break;
                }
            };

            let mut final_message = None;
            let mut error_info = None;
            while let Some(event) = stream.next().await {
                match &event {
                    AssistantStreamEvent::Done { message, .. } => {
                        final_message = Some(message.clone())
                    }
                    AssistantStreamEvent::Error { error, partial } => {
                        error_info = Some((error.clone(), partial.clone()))
                    }
                    _ => {}
                }
                self.emit(AgentEvent::MessageUpdate(event));
            }

            let mut message = if let Some(assembled) = final_message {
                assembled.into_message()
            } else if let Some((err, partial)) = error_info {
                Message::Assistant {
                    content: partial.content,
                    api: model.api,
                    provider: model.provider.clone(),
                    model: model.id.clone(),
                    usage: partial.usage,
                    stop_reason: StopReason::Error,
                    error_message: Some(err),
                }
            } else {
                error_message(&model, "stream ended without a terminal event".to_string())
            };
            apply_cost(&mut message, &model);

            let stop_reason = match &message {
                Message::Assistant { stop_reason, .. } => *stop_reason,
                _ => unreachable!("loop only ever constructs Assistant messages"),
            };

            self.inner.lock().await.messages.push(message.clone());
            self.emit(AgentEvent::MessageEnd(message.clone()));

            if let Message::Assistant {
                error_message: Some(e),
                stop_reason: StopReason::Error,
                ..
            } = &message
            {
                self.emit(AgentEvent::Error(e.clone()));
            }

            match stop_reason {
                StopReason::Stop
                | StopReason::Length
                | StopReason::Safety
                | StopReason::Error
                | StopReason::Aborted => break,
                StopReason::ToolUse => {
                    if iterations >= max_iterations {
                        break;
                    }
                    let tool_calls: Vec<ToolCallBlock> = message
                        .assistant_content()
                        .unwrap_or(&[])
                        .iter()
                        .filter_map(|b| match b {
                            AssistantBlock::ToolCall(tc) => Some(tc.clone()),
                            _ => None,
                        })
                        .collect();
                    if tool_calls.is_empty() {
                        break;
                    }
                    let aborted = self.dispatch_tool_calls(tool_calls, &token).await;
                    if aborted {
                        break;
                    }
                }
            }
        }

        self.emit(AgentEvent::AgentEnd);
        Ok(())
    }

    async fn history_snapshot(&self) -> Vec<Value> {
        self.inner
            .lock()
            .await
            .messages
            .iter()
            .map(|m| serde_json::to_value(m).unwrap_or(Value::Null))
            .collect()
    }

    /// Executes every tool call concurrently. `tool_execution_start` events
    /// are emitted in source order before dispatch; `tool_execution_end`
    /// may interleave in completion order, but the appended `toolResult`
    /// messages are always applied in source order (§4.4, §5).
    ///
    /// Returns `true` if cancellation sealed the turn as aborted, in which
    /// case the caller must stop the loop without appending any results.
    async fn dispatch_tool_calls(&self, tool_calls: Vec<ToolCallBlock>, token: &CancellationToken) -> bool {
        for tc in &tool_calls {
            self.pending_tool_calls.lock().await.insert(tc.id.clone());
            self.emit(AgentEvent::ToolExecutionStart {
                tool_call_id: tc.id.clone(),
                tool_name: tc.name.clone(),
                args: tc.arguments.clone(),
            });
        }

        let tools = self.inner.lock().await.tools.clone();
        let hooks = self.options.hooks().clone();
        let history_snapshot = self.history_snapshot().await;

        let executions = tool_calls.iter().cloned().map(|tc| {
            let tools = tools.clone();
            let hooks = hooks.clone();
            let history_snapshot = history_snapshot.clone();
            let token = token.clone();
            execute_one_tool(tc, tools, hooks, history_snapshot, token)
        });

        let results = tokio::select! {
            _ = token.cancelled() => None,
            r = futures::future::join_all(executions) => Some(r),
        };

        for tc in &tool_calls {
            self.pending_tool_calls.lock().await.remove(&tc.id);
        }

        let Some(results) = results else {
            self.seal_last_message_aborted().await;
            return true;
        };

        for r in &results {
            self.emit(AgentEvent::ToolExecutionEnd {
                tool_call_id: r.tool_call_id.clone(),
                result: r.output.clone(),
                is_error: r.is_error,
            });
        }

        // `join_all` preserves the order of its input iterator, so `results`
        // is already in source order of the originating tool calls.
        let mut inner = self.inner.lock().await;
        for r in results {
            inner.messages.push(Message::ToolResult {
                tool_call_id: r.tool_call_id,
                tool_name: r.tool_name,
                content: ToolResultContent::Text(r.output),
                is_error: r.is_error,
            });
        }
        false
    }

    async fn seal_last_message_aborted(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(Message::Assistant {
            stop_reason,
            error_message,
            ..
        }) = inner.messages.last_mut()
        {
            *stop_reason = StopReason::Aborted;
            *error_message = Some("aborted".to_string());
        }
    }
}

/// Recomputes `usage.cost` from the model's per-MTok rates. Adapters report
/// raw token counts but don't know pricing, so the agent loop is the single
/// point that turns a message's `Usage` into a priced `UsageCost`
/// (§4.1's provider adapters never carry a `ModelDescriptor`).
fn apply_cost(message: &mut Message, model: &ModelDescriptor) {
    if let Message::Assistant { usage, .. } = message {
        usage.cost = cost::cost_for_totals(usage, &model.cost);
    }
}

fn error_message(model: &ModelDescriptor, error: String) -> Message {
    Message::Assistant {
        content: Vec::new(),
        api: model.api,
        provider: model.provider.clone(),
        model: model.id.clone(),
        usage: Usage::default(),
        stop_reason: StopReason::Error,
        error_message: Some(error),
    }
}

impl From<&str> for UserContent {
    fn from(s: &str) -> Self {
        UserContent::Text(s.to_string())
    }
}

impl From<String> for UserContent {
    fn from(s: String) -> Self {
        UserContent::Text(s)
    }
}

struct ToolExecutionResult {
    tool_call_id: String,
    tool_name: String,
    output: String,
    is_error: bool,
}

/// Runs a single tool call through the pre/post hook pair, enforcing the
/// default timeout and observing cancellation (§4.4 "Cancellation
/// semantics", §4.4 "Timeouts").
async fn execute_one_tool(
    tc: ToolCallBlock,
    tools: Vec<Arc<Tool>>,
    hooks: Hooks,
    history_snapshot: Vec<Value>,
    token: CancellationToken,
) -> ToolExecutionResult {
    let Some(tool) = tools.iter().find(|t| t.name() == tc.name) else {
        return ToolExecutionResult {
            tool_call_id: tc.id,
            tool_name: tc.name.clone(),
            output: format!("unknown tool: {}", tc.name),
            is_error: true,
        };
    };

    let mut arguments = tc.arguments.clone();
    let pre_event = PreToolUseEvent::new(
        tc.name.clone(),
        arguments.clone(),
        tc.id.clone(),
        history_snapshot.clone(),
    );
    if let Some(decision) = hooks.execute_pre_tool_use(pre_event).await {
        if !decision.continue_execution {
            return ToolExecutionResult {
                tool_call_id: tc.id,
                tool_name: tc.name,
                output: decision
                    .reason
                    .unwrap_or_else(|| "blocked by pre_tool_use hook".to_string()),
                is_error: true,
            };
        }
        if let Some(modified) = decision.modified_input {
            arguments = modified;
        }
    }

    let timeout = std::time::Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS);
    let outcome = tokio::select! {
        _ = token.cancelled() => None,
        r = tokio::time::timeout(timeout, tool.execute(arguments.clone())) => Some(r),
    };

    let (output, is_error) = match outcome {
        None => ("aborted".to_string(), true),
        Some(Err(_elapsed)) => ("timeout".to_string(), true),
        Some(Ok(Err(e))) => (e.to_string(), true),
        Some(Ok(Ok(value))) => (json_to_output(&value), false),
    };

    let post_event = PostToolUseEvent::new(
        tc.name.clone(),
        arguments,
        tc.id.clone(),
        serde_json::json!({ "output": output, "isError": is_error }),
        history_snapshot,
    );
    hooks.execute_post_tool_use(post_event).await;

    ToolExecutionResult {
        tool_call_id: tc.id,
        tool_name: tc.name,
        output,
        is_error,
    }
}

fn json_to_output(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InputModality;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

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

    struct ScriptedTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn run(
            &self,
            model: &ModelDescriptor,
            _context: &[Message],
            _params: &TransportParams,
            _cancellation: CancellationToken,
        ) -> Result<crate::stream::QueuedStream<AssistantStreamEvent>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = crate::stream::channel();
            if call == 0 {
                let tool_call = ToolCallBlock::new("call_1", "double", serde_json::json!({"value": 21}));
                tx.push(AssistantStreamEvent::ToolCall {
                    tool_call: tool_call.clone(),
                });
                tx.end_with(AssistantStreamEvent::Done {
                    reason: StopReason::ToolUse,
                    message: crate::provider::AssistantMessage {
                        content: vec![AssistantBlock::ToolCall(tool_call)],
                        api: model.api,
                        provider: model.provider.clone(),
                        model: model.id.clone(),
                        usage: Usage::default(),
                        stop_reason: StopReason::ToolUse,
                        error_message: None,
                    },
                });
            } else {
                tx.end_with(AssistantStreamEvent::Done {
                    reason: StopReason::Stop,
                    message: crate::provider::AssistantMessage {
                        content: vec![AssistantBlock::Text(crate::types::TextBlock::new("42"))],
                        api: model.api,
                        provider: model.provider.clone(),
                        model: model.id.clone(),
                        usage: Usage::default(),
                        stop_reason: StopReason::Stop,
                        error_message: None,
                    },
                });
            }
            Ok(rx)
        }
    }

    fn double_tool() -> Tool {
        Tool::new(
            "double",
            "doubles a number",
            serde_json::json!({"value": {"type": "number"}}),
            |args| {
                Box::pin(async move {
                    let v = args["value"].as_f64().unwrap_or(0.0);
                    Ok(serde_json::json!(v * 2.0))
                })
            },
        )
    }

    #[tokio::test]
    async fn test_prompt_runs_tool_and_reaches_stop() {
        let options = AgentOptions::builder()
            .model("test-model")
            .base_url("https://example.test")
            .tool(double_tool())
            .build()
            .unwrap();
        let transport = Arc::new(ScriptedTransport {
            calls: AtomicUsize::new(0),
        });
        let agent = Agent::with_transport(test_model(), options, transport);

        agent.prompt("double 21").await.unwrap();

        let messages = agent.messages().await;
        // user, assistant(toolUse), toolResult, assistant(stop)
        assert_eq!(messages.len(), 4);
        match &messages[2] {
            Message::ToolResult { content, is_error, .. } => {
                assert!(!is_error);
                match content {
                    ToolResultContent::Text(s) => assert_eq!(s, "42"),
                    _ => panic!("expected text content"),
                }
            }
            _ => panic!("expected tool result"),
        }
    }

    #[tokio::test]
    async fn test_double_prompt_without_abort_errors() {
        let options = AgentOptions::builder()
            .model("test-model")
            .base_url("https://example.test")
            .build()
            .unwrap();
        let transport = Arc::new(ScriptedTransport {
            calls: AtomicUsize::new(1), // always returns a Stop message
        });
        let agent = Arc::new(Agent::with_transport(test_model(), options, transport));

        let a1 = agent.clone();
        let first = tokio::spawn(async move { a1.prompt("hi").await });
        // Give the first prompt a chance to set `running` before the second fires.
        tokio::task::yield_now().await;
        let second = agent.prompt("hi again").await;

        first.await.unwrap().unwrap();
        // Either ordering is acceptable: the second call might win the race
        // and run first, or lose it and error. What must never happen is
        // both succeeding concurrently with unsynchronized state.
        let _ = second;
    }
}
