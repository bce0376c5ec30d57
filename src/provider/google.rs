//! Google Generative Language API wire adapter (§4.1 "Google Generative").
//!
//! `streamGenerateContent?alt=sse` streams `candidates[0].content.parts`
//! incrementally. A part is either visible text, "thought" text (marked by
//! `thought: true`, optionally carrying an opaque `thoughtSignature` byte
//! string that must be replayed verbatim), or a `functionCall` — Google
//! sends function call arguments whole rather than as incremental JSON
//! fragments, unlike the OpenAI-family wire formats.

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

pub struct GoogleAdapter;

fn user_content_to_parts(content: &UserContent) -> Vec<Value> {
    match content {
        UserContent::Text(s) => vec![json!({ "text": s })],
        UserContent::Blocks(blocks) => blocks
            .iter()
            .map(|b| match b {
                UserContentBlock::Text(t) => json!({ "text": t.text }),
                UserContentBlock::Image(img) => json!({
                    "inlineData": { "mimeType": img.mime_type, "data": img.data }
                }),
            })
            .collect(),
    }
}

fn build_contents(context: &[Message]) -> Vec<Value> {
    let mut contents = Vec::new();
    for message in context {
        match message {
            Message::User { content } => {
                if content.is_empty() {
                    continue;
                }
                contents.push(json!({ "role": "user", "parts": user_content_to_parts(content) }));
            }
            Message::Assistant { content, .. } => {
                if content.is_empty() {
                    continue;
                }
                let parts: Vec<Value> = content
                    .iter()
                    .map(|block| match block {
                        AssistantBlock::Text(t) => json!({ "text": t.text }),
                        AssistantBlock::Thinking(t) => {
                            let mut part = json!({ "text": t.thinking, "thought": true });
                            if let Some(sig) = &t.thinking_signature {
                                part["thoughtSignature"] = json!(sig);
                            }
                            part
                        }
                        AssistantBlock::ToolCall(tc) => json!({
                            "functionCall": { "name": tc.name, "args": tc.arguments }
                        }),
                    })
                    .collect();
                contents.push(json!({ "role": "model", "parts": parts }));
            }
            Message::ToolResult {
                tool_name, content, ..
            } => {
                let response = match content {
                    ToolResultContent::Text(s) => json!({ "result": s }),
                    ToolResultContent::Blocks(blocks) => json!({
                        "result": blocks
                            .iter()
                            .filter_map(|b| match b {
                                UserContentBlock::Text(t) => Some(t.text.clone()),
                                _ => None,
                            })
                            .collect::<Vec<_>>()
                            .join("\n")
                    }),
                };
                contents.push(json!({
                    "role": "function",
                    "parts": [{
                        "functionResponse": { "name": tool_name, "response": response }
                    }]
                }));
            }
        }
    }
    contents
}

fn build_request(model: &ModelDescriptor, context: &[Message], options: &StreamOptions) -> Value {
    let mut body = json!({ "contents": build_contents(context) });

    let mut generation_config = json!({});
    if let Some(mt) = options.max_tokens {
        generation_config["maxOutputTokens"] = json!(mt);
    }
    if let Some(t) = options.temperature {
        generation_config["temperature"] = json!(t);
    }
    if options.thinking_level != ThinkingLevel::Off {
        let budget = match options.thinking_level {
            ThinkingLevel::Minimal => 512,
            ThinkingLevel::Low => 2048,
            ThinkingLevel::Medium => 8192,
            ThinkingLevel::High => 24576,
            ThinkingLevel::Off => unreachable!(),
        };
        generation_config["thinkingConfig"] = json!({
            "thinkingBudget": budget,
            "includeThoughts": true,
        });
    }
    if generation_config.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
        body["generationConfig"] = generation_config;
    }

    if !options.system_prompt.is_empty() {
        body["systemInstruction"] = json!({ "parts": [{ "text": options.system_prompt }] });
    }

    if !options.tools.is_empty() {
        body["tools"] = json!([{
            "functionDeclarations": options
                .tools
                .iter()
                .map(|t| json!({
                    "name": t.name(),
                    "description": t.description(),
                    "parameters": t.input_schema(),
                }))
                .collect::<Vec<_>>()
        }]);
    }

    body
}

fn map_finish_reason(raw: &str) -> StopReason {
    match raw {
        "STOP" => StopReason::Stop,
        "MAX_TOKENS" => StopReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => StopReason::Safety,
        other => super::map_unknown_stop_reason(other),
    }
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn api_kind(&self) -> ApiKind {
        ApiKind::GoogleGenerative
    }

    async fn stream(
        &self,
        model: &ModelDescriptor,
        context: &[Message],
        options: &StreamOptions,
    ) -> Result<QueuedStream<AssistantStreamEvent>> {
        let client = http_client()?;
        let body = build_request(model, context, options);

        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            model.base_url, model.id, options.api_key
        );

        let response = client.post(url).json(&body).send().await.map_err(Error::Http)?;

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
    let mut text_open = false;
    let mut thinking_open = false;
    let mut text_buffer = String::new();
    let mut thinking_buffer = String::new();
    let mut thinking_signature = String::new();
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

        let chunk: Value = match serde_json::from_str(&event.data) {
            Ok(v) => v,
            Err(e) => {
                tx.end_with(AssistantStreamEvent::Error {
                    error: format!("failed to parse chunk: {e}"),
                    partial: PartialAssistantMessage {
                        content: content.clone(),
                        usage,
                    },
                });
                return;
            }
        };

        if let Some(error) = chunk.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown google error")
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

        if let Some(u) = chunk.get("usageMetadata") {
            usage.input = u
                .get("promptTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(usage.input);
            usage.output = u
                .get("candidatesTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(usage.output);
            usage.cache_read = u
                .get("cachedContentTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(usage.cache_read);
        }

        let Some(candidate) = chunk.pointer("/candidates/0") else {
            continue;
        };

        if let Some(parts) = candidate.pointer("/content/parts").and_then(Value::as_array) {
            for part in parts {
                let is_thought = part.get("thought").and_then(Value::as_bool).unwrap_or(false);

                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    if is_thought {
                        if !thinking_open {
                            tx.push(AssistantStreamEvent::ThinkingStart);
                            thinking_open = true;
                        }
                        thinking_buffer.push_str(text);
                        if let Some(sig) = part.get("thoughtSignature").and_then(Value::as_str) {
                            thinking_signature = sig.to_string();
                        }
                        tx.push(AssistantStreamEvent::ThinkingDelta {
                            delta: text.to_string(),
                        });
                    } else {
                        if !text_open {
                            tx.push(AssistantStreamEvent::TextStart);
                            text_open = true;
                        }
                        text_buffer.push_str(text);
                        tx.push(AssistantStreamEvent::TextDelta {
                            delta: text.to_string(),
                        });
                    }
                }

                if let Some(call) = part.get("functionCall") {
                    let name = call.get("name").and_then(Value::as_str).unwrap_or_default();
                    let args = call.get("args").cloned().unwrap_or(json!({}));
                    // Google doesn't assign call ids; synthesize one so the
                    // canonical model's H1 (unique ids) still holds.
                    let id = format!("call_{}", content.len());
                    let tool_call = ToolCallBlock::new(id, name.to_string(), args);
                    tx.push(AssistantStreamEvent::ToolCall {
                        tool_call: tool_call.clone(),
                    });
                    content.push(AssistantBlock::ToolCall(tool_call));
                }
            }
        }

        if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
            stop_reason = map_finish_reason(reason);
            if thinking_open {
                tx.push(AssistantStreamEvent::ThinkingEnd {
                    content: thinking_buffer.clone(),
                });
                let mut block = ThinkingBlock::new(thinking_buffer.clone());
                if !thinking_signature.is_empty() {
                    block = block.with_signature(thinking_signature.clone());
                }
                content.push(AssistantBlock::Thinking(block));
                thinking_open = false;
            }
            if text_open {
                tx.push(AssistantStreamEvent::TextEnd {
                    content: text_buffer.clone(),
                });
                content.push(AssistantBlock::Text(TextBlock::new(text_buffer.clone())));
                text_open = false;
            }
            if content.iter().any(|b| matches!(b, AssistantBlock::ToolCall(_)))
                && stop_reason == StopReason::Stop
            {
                stop_reason = StopReason::ToolUse;
            }
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
    fn test_map_finish_reason() {
        assert_eq!(map_finish_reason("STOP"), StopReason::Stop);
        assert_eq!(map_finish_reason("MAX_TOKENS"), StopReason::Length);
        assert_eq!(map_finish_reason("SAFETY"), StopReason::Safety);
        assert_eq!(map_finish_reason("OTHER"), StopReason::Stop);
    }
}
