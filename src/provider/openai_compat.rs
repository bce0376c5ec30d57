//! OpenAI Chat Completions wire adapter, parameterized per provider quirk
//! (§4.1 "OpenAI Chat Completions"). One struct handles OpenAI itself,
//! Gemini's openai-compat endpoint, Groq, OpenRouter, Cerebras, xAI, zAI and
//! Mistral — they all speak the same `choices[0].delta` accumulation
//! protocol and differ only in how reasoning is requested and returned.
//!
//! Grounded on the teacher's `src/utils.rs::ToolCallAggregator`, generalized
//! from "accumulate until `finish_reason`, emit one `ContentBlock`" into the
//! full `start`/`*_start`/`*_delta`/`*_end`/`done` taxonomy.

use super::{
    http_client, map_unknown_stop_reason, sse_events, AssistantMessage, AssistantStreamEvent,
    PartialAssistantMessage, ProviderAdapter, StreamOptions,
};
use crate::model::{ApiKind, ModelDescriptor};
use crate::stream::{QueuedSender, QueuedStream};
use crate::types::{AssistantBlock, Message, StopReason, TextBlock, ThinkingBlock, ToolCallBlock,
    ToolResultContent, UserContent, UserContentBlock};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;

/// Which provider-specific quirks to apply when building the request and
/// interpreting the response (§4.1 "Provider quirks routed by base URL").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAiCompatFlavor {
    OpenAi,
    Gemini,
    Groq,
    OpenRouter,
    Other,
}

pub struct OpenAiCompatAdapter {
    pub flavor: OpenAiCompatFlavor,
}

impl OpenAiCompatAdapter {
    pub fn new(flavor: OpenAiCompatFlavor) -> Self {
        Self { flavor }
    }
}

fn message_to_json(message: &Message) -> Option<Value> {
    match message {
        Message::User { content } => {
            if content.is_empty() {
                return None;
            }
            let content_json = match content {
                UserContent::Text(s) => json!(s),
                UserContent::Blocks(blocks) => json!(blocks
                    .iter()
                    .map(|b| match b {
                        UserContentBlock::Text(t) => json!({"type": "text", "text": t.text}),
                        UserContentBlock::Image(img) => json!({
                            "type": "image_url",
                            "image_url": { "url": format!("data:{};base64,{}", img.mime_type, img.data) }
                        }),
                    })
                    .collect::<Vec<_>>()),
            };
            Some(json!({ "role": "user", "content": content_json }))
        }
        Message::Assistant { content, .. } => {
            if content.is_empty() {
                return None;
            }
            let mut text = String::new();
            let mut tool_calls = Vec::new();
            for block in content {
                match block {
                    AssistantBlock::Text(t) => text.push_str(&t.text),
                    AssistantBlock::ToolCall(tc) => tool_calls.push(json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": serde_json::to_string(&tc.arguments).unwrap_or_default(),
                        }
                    })),
                    AssistantBlock::Thinking(_) => {}
                }
            }
            let mut obj = json!({ "role": "assistant", "content": text });
            if !tool_calls.is_empty() {
                obj["tool_calls"] = json!(tool_calls);
            }
            Some(obj)
        }
        Message::ToolResult {
            tool_call_id,
            content,
            ..
        } => {
            let content_str = match content {
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
            Some(json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "content": content_str,
            }))
        }
    }
}

fn build_request(
    adapter: &OpenAiCompatAdapter,
    model: &ModelDescriptor,
    context: &[Message],
    options: &StreamOptions,
) -> Value {
    let mut messages = Vec::new();
    if !options.system_prompt.is_empty() {
        messages.push(json!({ "role": "system", "content": options.system_prompt }));
    }
    messages.extend(context.iter().filter_map(message_to_json));

    let mut body = json!({
        "model": model.id,
        "messages": messages,
        "stream": true,
        "stream_options": { "include_usage": true },
    });

    if let Some(mt) = options.max_tokens {
        body["max_tokens"] = json!(mt);
    }
    if let Some(t) = options.temperature {
        body["temperature"] = json!(t);
    }

    if !options.tools.is_empty() {
        body["tools"] = json!(options
            .tools
            .iter()
            .map(|t| t.to_openai_format())
            .collect::<Vec<_>>());
    }

    apply_reasoning(adapter, &mut body, options);

    body
}

/// §4.1 reasoning quirks, routed by flavor.
fn apply_reasoning(adapter: &OpenAiCompatAdapter, body: &mut Value, options: &StreamOptions) {
    use crate::types::ThinkingLevel;

    if options.thinking_level == ThinkingLevel::Off {
        return;
    }

    let effort = match options.thinking_level {
        ThinkingLevel::Minimal => "minimal",
        ThinkingLevel::Low => "low",
        ThinkingLevel::Medium => "medium",
        ThinkingLevel::High => "high",
        ThinkingLevel::Off => unreachable!(),
    };

    match adapter.flavor {
        OpenAiCompatFlavor::Gemini => {
            let budget = match options.thinking_level {
                ThinkingLevel::Low => 1024,
                ThinkingLevel::Medium => 8192,
                ThinkingLevel::High => 24576,
                _ => 1024,
            };
            body["extra_body"] = json!({
                "google": {
                    "thinking_config": {
                        "thinking_budget": budget,
                        "include_thoughts": true,
                    }
                }
            });
        }
        OpenAiCompatFlavor::Groq => {
            body["reasoning_format"] = json!("parsed");
            body["reasoning_effort"] = json!(effort);
        }
        OpenAiCompatFlavor::OpenRouter => {
            let mapped = if effort == "minimal" { "low" } else { effort };
            body["reasoning"] = json!({ "effort": mapped });
        }
        OpenAiCompatFlavor::OpenAi | OpenAiCompatFlavor::Other => {
            body["reasoning_effort"] = json!(effort);
        }
    }
}

fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "stop" => StopReason::Stop,
        "length" => StopReason::Length,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "content_filter" => StopReason::Safety,
        other => map_unknown_stop_reason(other),
    }
}

#[derive(Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    fn api_kind(&self) -> ApiKind {
        ApiKind::OpenAiCompletions
    }

    async fn stream(
        &self,
        model: &ModelDescriptor,
        context: &[Message],
        options: &StreamOptions,
    ) -> Result<QueuedStream<AssistantStreamEvent>> {
        let client = http_client()?;
        let body = build_request(self, model, context, options);

        let response = client
            .post(format!("{}/chat/completions", model.base_url))
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

        let flavor = self.flavor;
        let api = self.api_kind();
        let provider = model.provider.clone();
        let model_id = model.id.clone();
        let cancellation = options.cancellation.clone();

        tokio::spawn(run_stream(
            response, tx, flavor, api, provider, model_id, cancellation,
        ));

        Ok(stream)
    }
}

async fn run_stream(
    response: reqwest::Response,
    tx: QueuedSender<AssistantStreamEvent>,
    flavor: OpenAiCompatFlavor,
    api: ApiKind,
    provider: String,
    model_id: String,
    cancellation: tokio_util::sync::CancellationToken,
) {
    let mut events = sse_events(response);
    let mut text_buffer = String::new();
    let mut thinking_buffer = String::new();
    let mut tool_calls: HashMap<u32, PartialToolCall> = HashMap::new();
    let mut content = Vec::new();
    let mut usage = crate::types::Usage::default();
    let mut text_open = false;
    let mut thinking_open = false;
    let mut final_reason = None;

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

        if let Some(u) = chunk.get("usage") {
            usage.input = u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(usage.input);
            usage.output = u
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(usage.output);
        }

        let Some(choices) = chunk.get("choices").and_then(Value::as_array) else {
            continue;
        };

        for choice in choices {
            let delta = choice.get("delta").cloned().unwrap_or(json!({}));

            if flavor == OpenAiCompatFlavor::Groq {
                if let Some(reasoning) = delta.get("reasoning").and_then(Value::as_str) {
                    if !thinking_open {
                        tx.push(AssistantStreamEvent::ThinkingStart);
                        thinking_open = true;
                    }
                    thinking_buffer.push_str(reasoning);
                    tx.push(AssistantStreamEvent::ThinkingDelta {
                        delta: reasoning.to_string(),
                    });
                }
            }

            if let Some(text) = delta.get("content").and_then(Value::as_str) {
                if flavor == OpenAiCompatFlavor::Gemini {
                    // Thought tags share the content field; buffer and split
                    // once the turn closes rather than streaming deltas,
                    // since a tag boundary may straddle two chunks.
                    text_buffer.push_str(text);
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

            if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
                for call in calls {
                    let index = call.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
                    let entry = tool_calls.entry(index).or_default();
                    if let Some(id) = call.get("id").and_then(Value::as_str) {
                        entry.id = Some(id.to_string());
                    }
                    if let Some(function) = call.get("function") {
                        if let Some(name) = function.get("name").and_then(Value::as_str) {
                            entry.name = Some(name.to_string());
                        }
                        if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                            entry.arguments.push_str(args);
                        }
                    }
                }
            }

            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                final_reason = Some(map_finish_reason(reason));

                if flavor == OpenAiCompatFlavor::Gemini {
                    let (thinking, text) = split_gemini_thoughts(&text_buffer);
                    if let Some(thinking) = thinking {
                        tx.push(AssistantStreamEvent::ThinkingStart);
                        tx.push(AssistantStreamEvent::ThinkingDelta {
                            delta: thinking.clone(),
                        });
                        tx.push(AssistantStreamEvent::ThinkingEnd {
                            content: thinking.clone(),
                        });
                        content.push(AssistantBlock::Thinking(ThinkingBlock::new(thinking)));
                    }
                    if !text.is_empty() {
                        tx.push(AssistantStreamEvent::TextStart);
                        tx.push(AssistantStreamEvent::TextDelta {
                            delta: text.clone(),
                        });
                        tx.push(AssistantStreamEvent::TextEnd {
                            content: text.clone(),
                        });
                        content.push(AssistantBlock::Text(TextBlock::new(text)));
                    }
                } else {
                    if thinking_open {
                        tx.push(AssistantStreamEvent::ThinkingEnd {
                            content: thinking_buffer.clone(),
                        });
                        content.push(AssistantBlock::Thinking(ThinkingBlock::new(
                            thinking_buffer.clone(),
                        )));
                    }
                    if text_open {
                        tx.push(AssistantStreamEvent::TextEnd {
                            content: text_buffer.clone(),
                        });
                        content.push(AssistantBlock::Text(TextBlock::new(text_buffer.clone())));
                    }
                }

                for (_, partial) in tool_calls.drain() {
                    let (Some(id), Some(name)) = (partial.id, partial.name) else {
                        continue;
                    };
                    let arguments: Value = if partial.arguments.is_empty() {
                        json!({})
                    } else {
                        match serde_json::from_str(&partial.arguments) {
                            Ok(v) => v,
                            Err(e) => {
                                tx.end_with(AssistantStreamEvent::Error {
                                    error: format!("failed to parse tool arguments: {e}"),
                                    partial: PartialAssistantMessage {
                                        content: content.clone(),
                                        usage,
                                    },
                                });
                                return;
                            }
                        }
                    };
                    let tool_call = ToolCallBlock::new(id, name, arguments);
                    tx.push(AssistantStreamEvent::ToolCall {
                        tool_call: tool_call.clone(),
                    });
                    content.push(AssistantBlock::ToolCall(tool_call));
                }
            }
        }
    }

    let reason = final_reason.unwrap_or(StopReason::Stop);
    tx.end_with(AssistantStreamEvent::Done {
        reason,
        message: AssistantMessage {
            content,
            api,
            provider,
            model: model_id,
            usage,
            stop_reason: reason,
            error_message: None,
        },
    });
}

/// Splits `<thought>...</thought>` tags out of Gemini's openai-compat text,
/// returning the concatenated thinking text (if any) and the remaining
/// visible text with the tags removed.
fn split_gemini_thoughts(text: &str) -> (Option<String>, String) {
    let mut thinking = String::new();
    let mut visible = String::new();
    let mut rest = text;
    let mut found_any = false;

    while let Some(start) = rest.find("<thought>") {
        visible.push_str(&rest[..start]);
        let after_open = &rest[start + "<thought>".len()..];
        if let Some(end) = after_open.find("</thought>") {
            thinking.push_str(&after_open[..end]);
            found_any = true;
            rest = &after_open[end + "</thought>".len()..];
        } else {
            // Unterminated tag: treat the rest as thinking to avoid leaking
            // an unclosed tag into visible text.
            thinking.push_str(after_open);
            found_any = true;
            rest = "";
            break;
        }
    }
    visible.push_str(rest);

    if found_any {
        (Some(thinking), visible)
    } else {
        (None, visible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_finish_reason() {
        assert_eq!(map_finish_reason("stop"), StopReason::Stop);
        assert_eq!(map_finish_reason("length"), StopReason::Length);
        assert_eq!(map_finish_reason("tool_calls"), StopReason::ToolUse);
        assert_eq!(map_finish_reason("content_filter"), StopReason::Safety);
        assert_eq!(map_finish_reason("something_new"), StopReason::Stop);
    }

    #[test]
    fn test_split_gemini_thoughts() {
        let (thinking, text) = split_gemini_thoughts("<thought>reasoning here</thought>The answer is 4.");
        assert_eq!(thinking.as_deref(), Some("reasoning here"));
        assert_eq!(text, "The answer is 4.");
    }

    #[test]
    fn test_split_gemini_thoughts_no_tag() {
        let (thinking, text) = split_gemini_thoughts("just an answer");
        assert_eq!(thinking, None);
        assert_eq!(text, "just an answer");
    }

    #[test]
    fn test_openrouter_minimal_maps_to_low() {
        let adapter = OpenAiCompatAdapter::new(OpenAiCompatFlavor::OpenRouter);
        let mut body = json!({});
        let options = StreamOptions {
            system_prompt: String::new(),
            tools: vec![],
            thinking_level: crate::types::ThinkingLevel::Minimal,
            max_tokens: None,
            temperature: None,
            api_key: "k".into(),
            cancellation: tokio_util::sync::CancellationToken::new(),
        };
        apply_reasoning(&adapter, &mut body, &options);
        assert_eq!(body["reasoning"]["effort"], "low");
    }
}
