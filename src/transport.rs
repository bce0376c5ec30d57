//! Transports (§4.5, C7): the two ways the agent loop can turn a model
//! descriptor plus history into an [`AssistantStreamEvent`] stream.
//!
//! [`DirectTransport`] is the generalized descendant of the original
//! single-provider `reqwest` client: it resolves credentials, optionally
//! rewrites `baseUrl` through a CORS proxy, and dispatches straight to the
//! matching [`ProviderAdapter`]. [`RelayTransport`] instead forwards the
//! request to an HTTP relay and rebuilds the partial assistant message
//! client-side from the relay's bandwidth-trimmed event stream. Both
//! implement [`Transport`] so [`crate::agent::Agent`] never has to know
//! which one it's driving.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::model::{ApiKind, ModelDescriptor};
use crate::provider::{
    AnthropicAdapter, AssistantMessage, AssistantStreamEvent, GoogleAdapter, OpenAiCompatAdapter,
    OpenAiCompatFlavor, OpenAiResponsesAdapter, PartialAssistantMessage, ProviderAdapter,
    StreamOptions,
};
use crate::retry::{self, RetryConfig};
use crate::stream::{self, QueuedStream};
use crate::tools::Tool;
use crate::types::{StopReason, ThinkingLevel, ToolCallBlock, Usage};
use crate::{Error, Result};

/// Per-request knobs threaded from [`crate::types::AgentOptions`] into
/// whichever transport is in use. Deliberately narrower than
/// `AgentOptions`: transports don't need hooks or `max_tool_iterations`.
#[derive(Clone)]
pub struct TransportParams {
    pub system_prompt: String,
    pub tools: Vec<Arc<Tool>>,
    pub thinking_level: ThinkingLevel,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Explicit credential, taking precedence over §6's environment-variable
    /// table. Populated from `AgentOptions.api_key` when the caller set one.
    pub api_key_override: Option<String>,
}

/// Common contract both transports satisfy, so [`crate::agent::Agent`] is
/// transport-agnostic (§4.5).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn run(
        &self,
        model: &ModelDescriptor,
        context: &[crate::types::Message],
        params: &TransportParams,
        cancellation: CancellationToken,
    ) -> Result<QueuedStream<AssistantStreamEvent>>;
}

/// Picks the [`OpenAiCompatFlavor`] for a provider name drawn from
/// [`ModelDescriptor::provider`], so one `openai-completions` adapter can
/// serve every provider that speaks that wire format with its own reasoning
/// quirks (§4.1 "Provider quirks routed by base URL").
fn flavor_for_provider(provider: &str) -> OpenAiCompatFlavor {
    match provider.to_ascii_lowercase().as_str() {
        "openai" => OpenAiCompatFlavor::OpenAi,
        "google" | "google-generative" | "gemini" => OpenAiCompatFlavor::Gemini,
        "groq" => OpenAiCompatFlavor::Groq,
        "openrouter" => OpenAiCompatFlavor::OpenRouter,
        _ => OpenAiCompatFlavor::Other,
    }
}

/// Resolves API keys from the environment, optionally rewrites `baseUrl`
/// through a CORS proxy, and calls the provider directly (§4.5 "Direct
/// provider").
pub struct DirectTransport {
    cors_proxy: Option<String>,
    retry: RetryConfig,
}

impl DirectTransport {
    pub fn new() -> Self {
        Self {
            cors_proxy: None,
            retry: RetryConfig::default(),
        }
    }

    /// Prefixes every outgoing `baseUrl` with `proxy` (e.g.
    /// `https://cors.example.com/`), for browser embeddings that can't reach
    /// a provider's origin directly.
    pub fn with_cors_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.cors_proxy = Some(proxy.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Builds the adapter for `model`'s wire API. Every adapter is either a
    /// zero-sized struct or a single `Copy` flavor tag, so constructing one
    /// per call is free — no need to cache it on `self`.
    fn adapter_for(&self, model: &ModelDescriptor) -> Box<dyn ProviderAdapter> {
        match model.api {
            ApiKind::AnthropicMessages => Box::new(AnthropicAdapter),
            ApiKind::GoogleGenerative => Box::new(GoogleAdapter),
            ApiKind::OpenAiCompletions => {
                Box::new(OpenAiCompatAdapter::new(flavor_for_provider(&model.provider)))
            }
            ApiKind::OpenAiResponses => Box::new(OpenAiResponsesAdapter),
        }
    }

    fn resolve_key(&self, model: &ModelDescriptor, params: &TransportParams) -> Result<String> {
        if let Some(key) = &params.api_key_override {
            return Ok(key.clone());
        }
        config::resolve_api_key(&model.provider).ok_or_else(|| {
            let vars = config::api_key_env_vars(&model.provider);
            Error::config(if vars.is_empty() {
                format!(
                    "no API key configured for provider '{}' and it has no known environment variable",
                    model.provider
                )
            } else {
                format!(
                    "no API key found for provider '{}'; set one of: {}",
                    model.provider,
                    vars.join(", ")
                )
            })
        })
    }

    fn effective_model(&self, model: &ModelDescriptor) -> ModelDescriptor {
        let mut model = model.clone();
        if let Some(proxy) = &self.cors_proxy {
            model.base_url = format!("{proxy}{}", model.base_url);
        }
        model
    }
}

impl Default for DirectTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for DirectTransport {
    async fn run(
        &self,
        model: &ModelDescriptor,
        context: &[crate::types::Message],
        params: &TransportParams,
        cancellation: CancellationToken,
    ) -> Result<QueuedStream<AssistantStreamEvent>> {
        let api_key = self.resolve_key(model, params)?;
        let model = self.effective_model(model);
        let adapter = self.adapter_for(&model);
        let stream_options = StreamOptions {
            system_prompt: params.system_prompt.clone(),
            tools: params.tools.clone(),
            thinking_level: params.thinking_level,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            api_key,
            cancellation,
        };

        retry::retry_with_backoff_conditional(self.retry.clone(), || {
            adapter.stream(&model, context, &stream_options)
        })
        .await
    }
}

/// A `{type, ...}` event off a relay's SSE body. The relay omits `partial`
/// to save bandwidth (§4.5); [`ShadowAccumulator`] rebuilds it client-side.
#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ProxyAssistantMessageEvent {
    Start,
    TextStart,
    TextDelta { delta: String },
    TextEnd { content: String },
    ThinkingStart,
    ThinkingDelta { delta: String },
    ThinkingEnd { content: String },
    ToolCall { tool_call: ToolCallBlock },
    Done {
        reason: StopReason,
        message: ProxyAssistantMessage,
    },
    Error { error: String },
}

#[derive(serde::Deserialize)]
struct ProxyAssistantMessage {
    content: Vec<crate::types::AssistantBlock>,
    api: ApiKind,
    provider: String,
    model: String,
    usage: Usage,
    stop_reason: StopReason,
    error_message: Option<String>,
}

/// Rebuilds the `partial` assistant-message skeleton a relay strips from
/// every event but the terminal one, by replaying each delta into a running
/// [`PartialAssistantMessage`] the way a client-side renderer would.
#[derive(Default)]
struct ShadowAccumulator {
    partial: PartialAssistantMessage,
    text_buffer: String,
    thinking_buffer: String,
}

impl ShadowAccumulator {
    fn apply(&mut self, event: &ProxyAssistantMessageEvent) {
        match event {
            ProxyAssistantMessageEvent::TextStart => self.text_buffer.clear(),
            ProxyAssistantMessageEvent::TextDelta { delta } => self.text_buffer.push_str(delta),
            ProxyAssistantMessageEvent::TextEnd { content } => {
                self.partial
                    .content
                    .push(crate::types::AssistantBlock::Text(
                        crate::types::TextBlock::new(content.clone()),
                    ));
            }
            ProxyAssistantMessageEvent::ThinkingStart => self.thinking_buffer.clear(),
            ProxyAssistantMessageEvent::ThinkingDelta { delta } => {
                self.thinking_buffer.push_str(delta)
            }
            ProxyAssistantMessageEvent::ThinkingEnd { content } => {
                self.partial
                    .content
                    .push(crate::types::AssistantBlock::Thinking(
                        crate::types::ThinkingBlock::new(content.clone()),
                    ));
            }
            ProxyAssistantMessageEvent::ToolCall { tool_call } => {
                self.partial
                    .content
                    .push(crate::types::AssistantBlock::ToolCall(tool_call.clone()));
            }
            ProxyAssistantMessageEvent::Start
            | ProxyAssistantMessageEvent::Done { .. }
            | ProxyAssistantMessageEvent::Error { .. } => {}
        }
    }
}

/// Forwards agent state to an HTTP relay and replays its event stream
/// (§4.5 "Relay").
pub struct RelayTransport {
    endpoint: String,
    http: reqwest::Client,
}

impl RelayTransport {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder().build().map_err(Error::Http)?;
        Ok(Self {
            endpoint: endpoint.into(),
            http,
        })
    }
}

#[async_trait]
impl Transport for RelayTransport {
    async fn run(
        &self,
        model: &ModelDescriptor,
        context: &[crate::types::Message],
        params: &TransportParams,
        cancellation: CancellationToken,
    ) -> Result<QueuedStream<AssistantStreamEvent>> {
        let body = serde_json::json!({
            "model": model,
            "context": context,
            "systemPrompt": params.system_prompt,
            "tools": params.tools.iter().map(|t| t.to_openai_format()).collect::<Vec<_>>(),
            "thinkingLevel": params.thinking_level,
            "maxTokens": params.max_tokens,
            "temperature": params.temperature,
        });

        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(token) = &params.api_key_override {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(Error::Http)?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::api(format!("relay error {status}: {text}")));
        }

        let (sender, receiver) = stream::channel();
        let mut sse = crate::provider::sse_events(response);
        let cancellation_clone = cancellation.clone();

        tokio::spawn(async move {
            let mut shadow = ShadowAccumulator::default();
            loop {
                tokio::select! {
                    _ = cancellation_clone.cancelled() => {
                        sender.end_with(AssistantStreamEvent::Error {
                            error: "aborted".to_string(),
                            partial: shadow.partial.clone(),
                        });
                        return;
                    }
                    next = sse.next() => {
                        let Some(item) = next else { return };
                        let Ok(raw) = item else {
                            sender.end_with(AssistantStreamEvent::Error {
                                error: "relay stream error".to_string(),
                                partial: shadow.partial.clone(),
                            });
                            return;
                        };
                        let event: ProxyAssistantMessageEvent =
                            match serde_json::from_str(&raw.data) {
                                Ok(e) => e,
                                Err(e) => {
                                    sender.end_with(AssistantStreamEvent::Error {
                                        error: format!("malformed relay event: {e}"),
                                        partial: shadow.partial.clone(),
                                    });
                                    return;
                                }
                            };

                        match &event {
                            ProxyAssistantMessageEvent::Start => {
                                sender.push(AssistantStreamEvent::Start {
                                    partial: shadow.partial.clone(),
                                });
                            }
                            ProxyAssistantMessageEvent::TextStart => {
                                shadow.apply(&event);
                                sender.push(AssistantStreamEvent::TextStart);
                            }
                            ProxyAssistantMessageEvent::TextDelta { delta } => {
                                let delta = delta.clone();
                                shadow.apply(&event);
                                sender.push(AssistantStreamEvent::TextDelta { delta });
                            }
                            ProxyAssistantMessageEvent::TextEnd { content } => {
                                let content = content.clone();
                                shadow.apply(&event);
                                sender.push(AssistantStreamEvent::TextEnd { content });
                            }
                            ProxyAssistantMessageEvent::ThinkingStart => {
                                shadow.apply(&event);
                                sender.push(AssistantStreamEvent::ThinkingStart);
                            }
                            ProxyAssistantMessageEvent::ThinkingDelta { delta } => {
                                let delta = delta.clone();
                                shadow.apply(&event);
                                sender.push(AssistantStreamEvent::ThinkingDelta { delta });
                            }
                            ProxyAssistantMessageEvent::ThinkingEnd { content } => {
                                let content = content.clone();
                                shadow.apply(&event);
                                sender.push(AssistantStreamEvent::ThinkingEnd { content });
                            }
                            ProxyAssistantMessageEvent::ToolCall { tool_call } => {
                                let tool_call = tool_call.clone();
                                shadow.apply(&event);
                                sender.push(AssistantStreamEvent::ToolCall { tool_call });
                            }
                            ProxyAssistantMessageEvent::Done { reason, message } => {
                                sender.end_with(AssistantStreamEvent::Done {
                                    reason: *reason,
                                    message: AssistantMessage {
                                        content: message.content.clone(),
                                        api: message.api,
                                        provider: message.provider.clone(),
                                        model: message.model.clone(),
                                        usage: message.usage.clone(),
                                        stop_reason: message.stop_reason,
                                        error_message: message.error_message.clone(),
                                    },
                                });
                                return;
                            }
                            ProxyAssistantMessageEvent::Error { error } => {
                                sender.end_with(AssistantStreamEvent::Error {
                                    error: error.clone(),
                                    partial: shadow.partial.clone(),
                                });
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shadow_accumulator_rebuilds_text_block() {
        let mut shadow = ShadowAccumulator::default();
        shadow.apply(&ProxyAssistantMessageEvent::TextStart);
        shadow.apply(&ProxyAssistantMessageEvent::TextDelta {
            delta: "hi".to_string(),
        });
        shadow.apply(&ProxyAssistantMessageEvent::TextEnd {
            content: "hi".to_string(),
        });
        assert_eq!(shadow.partial.content.len(), 1);
    }

    #[test]
    fn test_direct_transport_missing_key_names_env_vars() {
        let transport = DirectTransport::new();
        let model = ModelDescriptor::minimal(
            "claude-x",
            ApiKind::AnthropicMessages,
            "https://api.anthropic.com/v1",
        );
        let params = TransportParams {
            system_prompt: String::new(),
            tools: Vec::new(),
            thinking_level: ThinkingLevel::Off,
            max_tokens: None,
            temperature: None,
            api_key_override: None,
        };
        let err = transport.resolve_key(&model, &params).unwrap_err();
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
    }
}
