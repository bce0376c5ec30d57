//! Anthropic Messages API wire adapter (§4.1 "Anthropic Messages").
//!
//! Grounded on the teacher's `src/client.rs` request-building/SSE-handling
//! pair, generalized from a single non-reasoning text/tool_use response into
//! the full `content_block_start`/`_delta`/`_stop` plus `message_delta`/
//! `message_stop` event sequence, including thinking blocks and their
//! `signature_delta`.

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

/// Identity string the teacher's client prepends as an ephemeral-cached
/// system block when authenticating with an OAuth token rather than a raw
/// API key, matching what Anthropic's own CLI sends (§4.1 OAuth handling).
const OAUTH_IDENTITY_PREAMBLE: &str = "You are Claude Code, Anthropic's official CLI for Claude.";

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter;

use crate::history::sanitize_tool_id;

fn is_oauth_token(api_key: &str) -> bool {
    api_key.starts_with("sk-ant-oat")
}

fn user_content_to_json(content: &UserContent) -> Value {
    match content {
        UserContent::Text(s) => json!(s),
        UserContent::Blocks(blocks) => json!(blocks
            .iter()
            .map(|b| match b {
                UserContentBlock::Text(t) => json!({ "type": "text", "text": t.text }),
                UserContentBlock::Image(img) => json!({
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": img.mime_type,
                        "data": img.data,
                    }
                }),
            })
            .collect::<Vec<_>>()),
    }
}

fn message_to_json(message: &Message) -> Option<Value> {
    match message {
        Message::User { content } => {
            if content.is_empty() {
                return None;
            }
            Some(json!({ "role": "user", "content": user_content_to_json(content) }))
        }
        Message::Assistant { content, .. } => {
            if content.is_empty() {
                return None;
            }
            let blocks: Vec<Value> = content
                .iter()
                .map(|block| match block {
                    AssistantBlock::Text(t) => json!({ "type": "text", "text": t.text }),
                    AssistantBlock::Thinking(t) => json!({
                        "type": "thinking",
                        "thinking": t.thinking,
                        "signature": t.thinking_signature.clone().unwrap_or_default(),
                    }),
                    AssistantBlock::ToolCall(tc) => json!({
                        "type": "tool_use",
                        "id": sanitize_tool_id(&tc.id),
                        "name": tc.name,
                        "input": tc.arguments,
                    }),
                })
                .collect();
            Some(json!({ "role": "assistant", "content": blocks }))
        }
        Message::ToolResult {
            tool_call_id,
            content,
            is_error,
            ..
        } => {
            let content_json = match content {
                ToolResultContent::Text(s) => json!(s),
                ToolResultContent::Blocks(blocks) => json!(blocks
                    .iter()
                    .map(|b| match b {
                        UserContentBlock::Text(t) => json!({ "type": "text", "text": t.text }),
                        UserContentBlock::Image(img) => json!({
                            "type": "image",
                            "source": {
                                "type": "base64",
                                "media_type": img.mime_type,
                                "data": img.data,
                            }
                        }),
                    })
                    .collect::<Vec<_>>()),
            };
            Some(json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": sanitize_tool_id(tool_call_id),
                    "content": content_json,
                    "is_error": is_error,
                }]
            }))
        }
    }
}

fn thinking_budget(level: ThinkingLevel) -> u32 {
    match level {
        ThinkingLevel::Off => 0,
        ThinkingLevel::Minimal => 1024,
        ThinkingLevel::Low => 2048,
        ThinkingLevel::Medium => 8192,
        ThinkingLevel::High => 24576,
    }
}

fn build_request(
    model: &ModelDescriptor,
    context: &[Message],
    options: &StreamOptions,
    oauth: bool,
) -> Value {
    let messages: Vec<Value> = context.iter().filter_map(message_to_json).collect();

    let mut system: Vec<Value> = Vec::new();
    if oauth {
        system.push(json!({
            "type": "text",
            "text": OAUTH_IDENTITY_PREAMBLE,
            "cache_control": { "type": "ephemeral" },
        }));
    }
    if !options.system_prompt.is_empty() {
        system.push(json!({ "type": "text", "text": options.system_prompt }));
    }

    let mut body = json!({
        "model": model.id,
        "messages": messages,
        "max_tokens": options.max_tokens.unwrap_or(model.max_tokens.max(4096)),
        "stream": true,
    });

    if !system.is_empty() {
        body["system"] = json!(system);
    }
    if let Some(t) = options.temperature {
        body["temperature"] = json!(t);
    }
    if !options.tools.is_empty() {
        body["tools"] = json!(options
            .tools
            .iter()
            .map(|t| json!({
                "name": t.name(),
                "description": t.description(),
                "input_schema": t.input_schema(),
            }))
            .collect::<Vec<_>>());
    }
    if options.thinking_level != ThinkingLevel::Off {
        body["thinking"] = json!({
            "type": "enabled",
            "budget_tokens": thinking_budget(options.thinking_level),
        });
    }

    body
}

fn map_stop_reason(raw: &str) -> StopReason {
    match raw {
        "end_turn" => StopReason::Stop,
        "max_tokens" => StopReason::Length,
        "tool_use" => StopReason::ToolUse,
        "refusal" => StopReason::Safety,
        "pause_turn" | "stop_sequence" => StopReason::Stop,
        other => super::map_unknown_stop_reason(other),
    }
}

#[derive(Default)]
struct OpenBlock {
    kind: Option<String>,
    text: String,
    thinking: String,
    signature: String,
    tool_id: String,
    tool_name: String,
    tool_json: String,
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn api_kind(&self) -> ApiKind {
        ApiKind::AnthropicMessages
    }

    async fn stream(
        &self,
        model: &ModelDescriptor,
        context: &[Message],
        options: &StreamOptions,
    ) -> Result<QueuedStream<AssistantStreamEvent>> {
        let oauth = is_oauth_token(&options.api_key);
        let body = build_request(model, context, options, oauth);

        let client = http_client()?;
        let mut request = client
            .post(format!("{}/messages", model.base_url))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);

        request = if oauth {
            // OAuth tokens go in Authorization, and the raw API key header
            // must be absent — Anthropic rejects requests carrying both.
            request.header("Authorization", format!("Bearer {}", options.api_key))
        } else {
            request.header("x-api-key", &options.api_key)
        };

        let response = request.send().await.map_err(Error::Http)?;

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
    let mut open: Option<OpenBlock> = None;
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

        match event.event.as_deref() {
            Some("message_start") => {
                if let Some(input_tokens) = payload
                    .pointer("/message/usage/input_tokens")
                    .and_then(Value::as_u64)
                {
                    usage.input = input_tokens;
                }
                if let Some(cache_read) = payload
                    .pointer("/message/usage/cache_read_input_tokens")
                    .and_then(Value::as_u64)
                {
                    usage.cache_read = cache_read;
                }
                if let Some(cache_write) = payload
                    .pointer("/message/usage/cache_creation_input_tokens")
                    .and_then(Value::as_u64)
                {
                    usage.cache_write = cache_write;
                }
            }
            Some("content_block_start") => {
                let block = payload.get("content_block").cloned().unwrap_or(json!({}));
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        tx.push(AssistantStreamEvent::TextStart);
                        open = Some(OpenBlock {
                            kind: Some("text".into()),
                            ..Default::default()
                        });
                    }
                    Some("thinking") => {
                        tx.push(AssistantStreamEvent::ThinkingStart);
                        open = Some(OpenBlock {
                            kind: Some("thinking".into()),
                            ..Default::default()
                        });
                    }
                    Some("tool_use") => {
                        let id = block.get("id").and_then(Value::as_str).unwrap_or_default();
                        let name = block.get("name").and_then(Value::as_str).unwrap_or_default();
                        open = Some(OpenBlock {
                            kind: Some("tool_use".into()),
                            tool_id: id.to_string(),
                            tool_name: name.to_string(),
                            ..Default::default()
                        });
                    }
                    _ => {}
                }
            }
            Some("content_block_delta") => {
                let Some(block) = open.as_mut() else { continue };
                let delta = payload.get("delta").cloned().unwrap_or(json!({}));
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(Value::as_str) {
                            block.text.push_str(text);
                            tx.push(AssistantStreamEvent::TextDelta {
                                delta: text.to_string(),
                            });
                        }
                    }
                    Some("thinking_delta") => {
                        if let Some(text) = delta.get("thinking").and_then(Value::as_str) {
                            block.thinking.push_str(text);
                            tx.push(AssistantStreamEvent::ThinkingDelta {
                                delta: text.to_string(),
                            });
                        }
                    }
                    Some("signature_delta") => {
                        if let Some(sig) = delta.get("signature").and_then(Value::as_str) {
                            block.signature.push_str(sig);
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(partial) = delta.get("partial_json").and_then(Value::as_str) {
                            block.tool_json.push_str(partial);
                        }
                    }
                    _ => {}
                }
            }
            Some("content_block_stop") => {
                let Some(block) = open.take() else { continue };
                match block.kind.as_deref() {
                    Some("text") => {
                        tx.push(AssistantStreamEvent::TextEnd {
                            content: block.text.clone(),
                        });
                        content.push(AssistantBlock::Text(TextBlock::new(block.text)));
                    }
                    Some("thinking") => {
                        tx.push(AssistantStreamEvent::ThinkingEnd {
                            content: block.thinking.clone(),
                        });
                        let mut thinking_block = ThinkingBlock::new(block.thinking);
                        if !block.signature.is_empty() {
                            thinking_block = thinking_block.with_signature(block.signature);
                        }
                        content.push(AssistantBlock::Thinking(thinking_block));
                    }
                    Some("tool_use") => {
                        let arguments: Value = if block.tool_json.is_empty() {
                            json!({})
                        } else {
                            match serde_json::from_str(&block.tool_json) {
                                Ok(v) => v,
                                Err(e) => {
                                    tx.end_with(AssistantStreamEvent::Error {
                                        error: format!("failed to parse tool input: {e}"),
                                        partial: PartialAssistantMessage {
                                            content: content.clone(),
                                            usage,
                                        },
                                    });
                                    return;
                                }
                            }
                        };
                        let tool_call = ToolCallBlock::new(block.tool_id, block.tool_name, arguments);
                        tx.push(AssistantStreamEvent::ToolCall {
                            tool_call: tool_call.clone(),
                        });
                        content.push(AssistantBlock::ToolCall(tool_call));
                    }
                    _ => {}
                }
            }
            Some("message_delta") => {
                if let Some(reason) = payload
                    .pointer("/delta/stop_reason")
                    .and_then(Value::as_str)
                {
                    stop_reason = map_stop_reason(reason);
                }
                if let Some(output_tokens) = payload
                    .pointer("/usage/output_tokens")
                    .and_then(Value::as_u64)
                {
                    usage.output = output_tokens;
                }
            }
            Some("message_stop") => break,
            Some("error") => {
                let message = payload
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown anthropic error")
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
    fn test_sanitize_tool_id_strips_disallowed_chars() {
        assert_eq!(sanitize_tool_id("call:abc.123"), "callabc123");
        assert_eq!(sanitize_tool_id("call_abc-123"), "call_abc-123");
    }

    #[test]
    fn test_map_stop_reason() {
        assert_eq!(map_stop_reason("end_turn"), StopReason::Stop);
        assert_eq!(map_stop_reason("max_tokens"), StopReason::Length);
        assert_eq!(map_stop_reason("tool_use"), StopReason::ToolUse);
        assert_eq!(map_stop_reason("refusal"), StopReason::Safety);
        assert_eq!(map_stop_reason("pause_turn"), StopReason::Stop);
    }

    #[test]
    fn test_is_oauth_token() {
        assert!(is_oauth_token("sk-ant-oat01-xxxx"));
        assert!(!is_oauth_token("sk-ant-api03-xxxx"));
    }
}
