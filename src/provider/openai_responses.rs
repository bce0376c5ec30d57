//! OpenAI Responses API wire adapter (§4.1 "OpenAI Responses").
//!
//! The Responses API trades the Chat Completions `messages` array for a flat
//! `input` item list and replaces `choices[].delta` accumulation with typed
//! `response.output_item.*` / `response.output_text.*` /
//! `response.reasoning_summary_text.*` stream events. Reasoning items carry
//! an opaque id that must be replayed verbatim on the next turn — dropping
//! it, or replaying a `function_call` item whose preceding `reasoning` item
//! was dropped, both violate the API's pairing requirement (§4.3 reasoning
//! pairing).

use super::{http_client, sse_events, AssistantMessage, AssistantStreamEvent, PartialAssistantMessage,
    ProviderAdapter, StreamOptions};
use crate::model::{ApiKind, ModelDescriptor};
use crate::stream::{QueuedSender, QueuedStream};
use crate::types::{AssistantBlock, Message, StopReason, TextBlock, ThinkingBlock, ThinkingLevel,
    ToolCallBlock, ToolResultContent, UserContent, UserContentBlock};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;

pub struct OpenAiResponsesAdapter;

fn user_content_to_json(content: &UserContent) -> Value {
    match content {
        UserContent::Text(s) => json!([{ "type": "input_text", "text": s }]),
        UserContent::Blocks(blocks) => json!(blocks
            .iter()
            .map(|b| match b {
                UserContentBlock::Text(t) => json!({ "type": "input_text", "text": t.text }),
                UserContentBlock::Image(img) => json!({
                    "type": "input_image",
                    "image_url": format!("data:{};base64,{}", img.mime_type, img.data),
                }),
            })
            .collect::<Vec<_>>()),
    }
}

/// Builds the flat `input` item list. An assistant `ToolCall` with no
/// preceding `Thinking` block in the same message still emits a
/// `function_call` item (the pairing rule only prevents *replaying* an
/// orphaned reasoning id, not calling tools without reasoning at all).
fn build_input(context: &[Message]) -> Vec<Value> {
    let mut items = Vec::new();
    for message in context {
        match message {
            Message::User { content } => {
                if content.is_empty() {
                    continue;
                }
                items.push(json!({
                    "role": "user",
                    "content": user_content_to_json(content),
                }));
            }
            Message::Assistant { content, .. } => {
                for block in content {
                    match block {
                        AssistantBlock::Text(t) => {
                            if !t.text.is_empty() {
                                items.push(json!({
                                    "role": "assistant",
                                    "content": [{ "type": "output_text", "text": t.text }],
                                }));
                            }
                        }
                        AssistantBlock::Thinking(t) => {
                            if let Some(id) = &t.thinking_signature {
                                items.push(json!({
                                    "type": "reasoning",
                                    "id": id,
                                }));
                            }
                        }
                        AssistantBlock::ToolCall(tc) => {
                            items.push(json!({
                                "type": "function_call",
                                "call_id": tc.id,
                                "name": tc.name,
                                "arguments": serde_json::to_string(&tc.arguments).unwrap_or_default(),
                            }));
                        }
                    }
                }
            }
            Message::ToolResult {
                tool_call_id,
                content,
                ..
            } => {
                let output = match content {
                    ToolResultContent::Text(s) => s.clone(),
                    ToolResultContent::Blocks(blocks) => blocks
                        .iter()
                        .filter_map(|b| match b {
                            UserContentBlock::Text(t) => Some(t.text.clone()),
                            _ => None,
                        })
                        .collect::<Vec<_>>()
                        .join("\n"),
                };
                items.push(json!({
                    "type": "function_call_output",
                    "call_id": tool_call_id,
                    "output": output,
                }));
            }
        }
    }
    items
}

fn build_request(model: &ModelDescriptor, context: &[Message], options: &StreamOptions) -> Value {
    let mut body = json!({
        "model": model.id,
        "input": build_input(context),
        "stream": true,
    });

    if !options.system_prompt.is_empty() {
        body["instructions"] = json!(options.system_prompt);
    }
    if let Some(mt) = options.max_tokens {
        body["max_output_tokens"] = json!(mt);
    }
    if !options.tools.is_empty() {
        body["tools"] = json!(options
            .tools
            .iter()
            .map(|t| json!({
                "type": "function",
                "name": t.name(),
                "description": t.description(),
                "parameters": t.input_schema(),
            }))
            .collect::<Vec<_>>());
    }
    if options.thinking_level != ThinkingLevel::Off {
        let effort = match options.thinking_level {
            ThinkingLevel::Minimal => "minimal",
            ThinkingLevel::Low => "low",
            ThinkingLevel::Medium => "medium",
            ThinkingLevel::High => "high",
            ThinkingLevel::Off => unreachable!(),
        };
        body["reasoning"] = json!({ "effort": effort, "summary": "detailed" });
    }

    body
}

fn map_status(status: &str) -> StopReason {
    match status {
        "completed" => StopReason::Stop,
        "incomplete" => StopReason::Length,
        "failed" => StopReason::Error,
        other => super::map_unknown_stop_reason(other),
    }
}

#[derive(Default)]
struct OpenItem {
    item_type: String,
    call_id: String,
    name: String,
    arguments: String,
    reasoning_id: String,
}

#[async_trait]
impl ProviderAdapter for OpenAiResponsesAdapter {
    fn api_kind(&self) -> ApiKind {
        ApiKind::OpenAiResponses
    }

    async fn stream(
        &self,
        model: &ModelDescriptor,
        context: &[Message],
        options: &StreamOptions,
    ) -> Result<QueuedStream<AssistantStreamEvent>> {
        let client = http_client()?;
        let body = build_request(model, context, options);

        let response = client
            .post(format!("{}/responses", model.base_url))
            .bearer_auth(&options.api_key)
            .json(&body)
            .send()
            .await
            .map_err(Error::Http)?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::provider(format!("{status}: {text}")));
        }

        let (tx, stream) = crate::stream::channel();
        tx.push(AssistantStreamEvent::Start {
            partial: PartialAssistantMessage::default(),
        });

        let api = self.api_kind();
        let provider = model.provider.clone();
        let model_id = model.id.clone();
        let cancellation = options.cancellation.clone();

        tokio::spawn(run_stream(
            response, tx, api, provider, model_id, cancellation,
        ));

        Ok(stream)
    }
}

async fn run_stream(
    response: reqwest::Response,
    tx: QueuedSender<AssistantStreamEvent>,
    api: ApiKind,
    provider: String,
    model_id: String,
    cancellation: tokio_util::sync::CancellationToken,
) {
    let mut events = sse_events(response);
    let mut content = Vec::new();
    let mut usage = crate::types::Usage::default();
    let mut open_items: HashMap<u64, OpenItem> = HashMap::new();
    let mut stop_reason = StopReason::Stop;

    loop {
        if cancellation.is_cancelled() {
            tx.end_with(AssistantStreamEvent::Done {
                reason: StopReason::Aborted,
                message: AssistantMessage {
                    content,
                    api,
                    provider,
                    model: model_id,
                    usage,
                    stop_reason: StopReason::Aborted,
                    error_message: None,
                },
            });
            return;
        }

        let event = tokio::select! {
            _ = cancellation.cancelled() => continue,
            ev = events.next() => ev,
        };

        let Some(event) = event else { break };
        let event = match event {
            Ok(e) => e,
            Err(e) => {
                tx.end_with(AssistantStreamEvent::Error {
                    error: e.to_string(),
                    partial: PartialAssistantMessage {
                        content: content.clone(),
                        usage,
                    },
                });
                return;
            }
        };

        let payload: Value = match serde_json::from_str(&event.data) {
            Ok(v) => v,
            Err(e) => {
                tx.end_with(AssistantStreamEvent::Error {
                    error: format!("failed to parse event: {e}"),
                    partial: PartialAssistantMessage {
                        content: content.clone(),
                        usage,
                    },
                });
                return;
            }
        };

        let event_type = payload.get("type").and_then(Value::as_str).unwrap_or_default();

        match event_type {
            "response.output_item.added" => {
                let index = payload.get("output_index").and_then(Value::as_u64).unwrap_or(0);
                let item = payload.get("item").cloned().unwrap_or(json!({}));
                let item_type = item.get("type").and_then(Value::as_str).unwrap_or_default();
                match item_type {
                    "message" => {
                        tx.push(AssistantStreamEvent::TextStart);
                    }
                    "reasoning" => {
                        tx.push(AssistantStreamEvent::ThinkingStart);
                    }
                    _ => {}
                }
                open_items.insert(
                    index,
                    OpenItem {
                        item_type: item_type.to_string(),
                        call_id: item.get("call_id").and_then(Value::as_str).unwrap_or_default().to_string(),
                        name: item.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                        reasoning_id: item.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                        ..Default::default()
                    },
                );
            }
            "response.output_text.delta" => {
                let index = payload.get("output_index").and_then(Value::as_u64).unwrap_or(0);
                if let Some(delta) = payload.get("delta").and_then(Value::as_str) {
                    tx.push(AssistantStreamEvent::TextDelta {
                        delta: delta.to_string(),
                    });
                    if let Some(item) = open_items.get_mut(&index) {
                        item.arguments.push_str(delta);
                    }
                }
            }
            "response.reasoning_summary_text.delta" => {
                let index = payload.get("output_index").and_then(Value::as_u64).unwrap_or(0);
                if let Some(delta) = payload.get("delta").and_then(Value::as_str) {
                    tx.push(AssistantStreamEvent::ThinkingDelta {
                        delta: delta.to_string(),
                    });
                    if let Some(item) = open_items.get_mut(&index) {
                        item.arguments.push_str(delta);
                    }
                }
            }
            "response.function_call_arguments.delta" => {
                let index = payload.get("output_index").and_then(Value::as_u64).unwrap_or(0);
                if let Some(delta) = payload.get("delta").and_then(Value::as_str) {
                    if let Some(item) = open_items.get_mut(&index) {
                        item.arguments.push_str(delta);
                    }
                }
            }
            "response.output_item.done" => {
                let index = payload.get("output_index").and_then(Value::as_u64).unwrap_or(0);
                let item = payload.get("item").cloned().unwrap_or(json!({}));
                let Some(open) = open_items.remove(&index) else { continue };
                match open.item_type.as_str() {
                    "message" => {
                        let text = item
                            .pointer("/content/0/text")
                            .and_then(Value::as_str)
                            .unwrap_or(&open.arguments)
                            .to_string();
                        tx.push(AssistantStreamEvent::TextEnd {
                            content: text.clone(),
                        });
                        content.push(AssistantBlock::Text(TextBlock::new(text)));
                    }
                    "reasoning" => {
                        let summary_text = item
                            .pointer("/summary/0/text")
                            .and_then(Value::as_str)
                            .unwrap_or(&open.arguments)
                            .to_string();
                        tx.push(AssistantStreamEvent::ThinkingEnd {
                            content: summary_text.clone(),
                        });
                        let id = item
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or(&open.reasoning_id)
                            .to_string();
                        content.push(AssistantBlock::Thinking(
                            ThinkingBlock::new(summary_text).with_signature(id),
                        ));
                    }
                    "function_call" => {
                        let call_id = item
                            .get("call_id")
                            .and_then(Value::as_str)
                            .unwrap_or(&open.call_id)
                            .to_string();
                        let name = item
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or(&open.name)
                            .to_string();
                        let arguments_str = item
                            .get("arguments")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or(open.arguments);
                        let arguments: Value = if arguments_str.is_empty() {
                            json!({})
                        } else {
                            match serde_json::from_str(&arguments_str) {
                                Ok(v) => v,
                                Err(e) => {
                                    tx.end_with(AssistantStreamEvent::Error {
                                        error: format!("failed to parse function arguments: {e}"),
                                        partial: PartialAssistantMessage {
                                            content: content.clone(),
                                            usage,
                                        },
                                    });
                                    return;
                                }
                            }
                        };
                        let tool_call = ToolCallBlock::new(call_id, name, arguments);
                        tx.push(AssistantStreamEvent::ToolCall {
                            tool_call: tool_call.clone(),
                        });
                        content.push(AssistantBlock::ToolCall(tool_call));
                    }
                    _ => {}
                }
            }
            "response.completed" | "response.incomplete" | "response.failed" => {
                if let Some(status) = payload.pointer("/response/status").and_then(Value::as_str) {
                    stop_reason = map_status(status);
                }
                if content.iter().any(|b| matches!(b, AssistantBlock::ToolCall(_)))
                    && stop_reason == StopReason::Stop
                {
                    stop_reason = StopReason::ToolUse;
                }
                if let Some(input_tokens) = payload
                    .pointer("/response/usage/input_tokens")
                    .and_then(Value::as_u64)
                {
                    usage.input = input_tokens;
                }
                if let Some(output_tokens) = payload
                    .pointer("/response/usage/output_tokens")
                    .and_then(Value::as_u64)
                {
                    usage.output = output_tokens;
                }
                if let Some(cached) = payload
                    .pointer("/response/usage/input_tokens_details/cached_tokens")
                    .and_then(Value::as_u64)
                {
                    usage.cache_read = cached;
                }
                break;
            }
            "error" => {
                let message = payload
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown responses API error")
                    .to_string();
                tx.end_with(AssistantStreamEvent::Error {
                    error: message,
                    partial: PartialAssistantMessage {
                        content: content.clone(),
                        usage,
                    },
                });
                return;
            }
            _ => {}
        }
    }

    tx.end_with(AssistantStreamEvent::Done {
        reason: stop_reason,
        message: AssistantMessage {
            content,
            api,
            provider,
            model: model_id,
            usage,
            stop_reason,
            error_message: None,
        },
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_status() {
        assert_eq!(map_status("completed"), StopReason::Stop);
        assert_eq!(map_status("incomplete"), StopReason::Length);
        assert_eq!(map_status("failed"), StopReason::Error);
    }

    #[test]
    fn test_build_input_drops_reasoning_without_signature() {
        let messages = vec![Message::Assistant {
            content: vec![AssistantBlock::Thinking(ThinkingBlock::new("scratch"))],
            api: ApiKind::OpenAiResponses,
            provider: "openai".into(),
            model: "gpt-5".into(),
            usage: crate::types::Usage::default(),
            stop_reason: StopReason::Stop,
            error_message: None,
        }];
        let items = build_input(&messages);
        assert!(items.is_empty());
    }
}
