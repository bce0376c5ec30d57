//! Provider adapters (§4.1, C2): one implementation per wire API family,
//! dispatched on [`ApiKind`](crate::model::ApiKind) rather than on
//! duck-typed shape inspection (Design Notes §9).
//!
//! Every adapter exposes the same [`ProviderAdapter::stream`] contract: it
//! consumes the canonical, already-transformed context (see
//! [`crate::history`]) and a [`StreamOptions`], and returns a
//! [`crate::stream::QueuedStream`] of [`AssistantStreamEvent`]s. The event
//! sequence always matches the regex in `spec.md` §8:
//! `start (text_start text_delta* text_end | thinking_start thinking_delta*
//! thinking_end | toolCall)* (done | error)`.

mod anthropic;
mod google;
mod openai_compat;
mod openai_responses;

pub use anthropic::AnthropicAdapter;
pub use google::GoogleAdapter;
pub use openai_compat::{OpenAiCompatAdapter, OpenAiCompatFlavor};
pub use openai_responses::OpenAiResponsesAdapter;

use crate::model::{ApiKind, ModelDescriptor};
use crate::tools::Tool;
use crate::types::{AssistantBlock, StopReason, ThinkingLevel, Usage};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A snapshot of the assistant message being assembled, used both as the
/// `start` event's initial skeleton and as the `partial` payload carried by
/// an `error` event.
#[derive(Debug, Clone, Default)]
pub struct PartialAssistantMessage {
    pub content: Vec<AssistantBlock>,
    pub usage: Usage,
}

/// The fully assembled assistant message delivered with `done`.
#[derive(Debug, Clone)]
pub struct AssistantMessage {
    pub content: Vec<AssistantBlock>,
    pub api: ApiKind,
    pub provider: String,
    pub model: String,
    pub usage: Usage,
    pub stop_reason: StopReason,
    pub error_message: Option<String>,
}

impl AssistantMessage {
    /// Converts this wire-level result into the canonical
    /// [`crate::types::Message::Assistant`] variant.
    pub fn into_message(self) -> crate::types::Message {
        crate::types::Message::Assistant {
            content: self.content,
            api: self.api,
            provider: self.provider,
            model: self.model,
            usage: self.usage,
            stop_reason: self.stop_reason,
            error_message: self.error_message,
        }
    }
}

/// The provider-neutral event taxonomy every adapter emits (§4.1).
#[derive(Debug, Clone)]
pub enum AssistantStreamEvent {
    Start {
        partial: PartialAssistantMessage,
    },
    TextStart,
    TextDelta {
        delta: String,
    },
    TextEnd {
        content: String,
    },
    ThinkingStart,
    ThinkingDelta {
        delta: String,
    },
    ThinkingEnd {
        content: String,
    },
    ToolCall {
        tool_call: crate::types::ToolCallBlock,
    },
    Done {
        reason: StopReason,
        message: AssistantMessage,
    },
    Error {
        error: String,
        partial: PartialAssistantMessage,
    },
}

/// Per-request knobs an adapter needs beyond the canonical message history:
/// system prompt, tool roster, reasoning level, sampling, credentials, and
/// the cooperative cancellation token threaded through from the agent loop
/// (§5 single shared abort signal).
pub struct StreamOptions {
    pub system_prompt: String,
    pub tools: Vec<Arc<Tool>>,
    pub thinking_level: ThinkingLevel,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub api_key: String,
    pub cancellation: CancellationToken,
}

/// Common contract every wire-protocol adapter implements (§4.1 step 1-6).
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// The wire API this adapter speaks; used for dispatch and for
    /// feature-probe caching keys (`supportsReasoning[model,api]`).
    fn api_kind(&self) -> ApiKind;

    /// Opens a streaming completion for `context` (already transformed for
    /// this provider by [`crate::history::transform`]) against `model`.
    async fn stream(
        &self,
        model: &ModelDescriptor,
        context: &[crate::types::Message],
        options: &StreamOptions,
    ) -> Result<crate::stream::QueuedStream<AssistantStreamEvent>>;
}

/// Maps an unrecognized provider stop signal to `Stop`, logging at `warn`
/// per the spec's open-question resolution (`spec.md` §9): "the exact set
/// of stop reasons returned by Google/xAI is not enumerated in the corpus;
/// map unknowns to `stop` and log."
pub fn map_unknown_stop_reason(raw: &str) -> StopReason {
    log::warn!("unmapped provider stop reason {raw:?}, defaulting to stop");
    StopReason::Stop
}

/// Builds the `reqwest::Client` shared by every adapter, honoring the
/// per-request timeout carried in [`StreamOptions`] via the caller (adapters
/// set this at construction, not per-call, since `reqwest::Client` is meant
/// to be built once and reused).
pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .build()
        .map_err(crate::Error::Http)
}

/// One decoded `event:`/`data:` pair from a Server-Sent Events body.
/// `event` is `None` for protocols (OpenAI, Google) that only ever send
/// unlabeled `data:` lines; Anthropic's wire format labels every event.
pub(crate) struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Turns a streaming HTTP response into a stream of decoded SSE events,
/// buffering across chunk boundaries (a single `bytes_stream()` item may
/// contain a partial event, several complete events, or both).
///
/// The `[DONE]` sentinel some providers (OpenAI-compatible) send as the
/// final `data:` payload is filtered out here rather than left for every
/// adapter to special-case.
pub(crate) fn sse_events(
    response: reqwest::Response,
) -> std::pin::Pin<Box<dyn futures::Stream<Item = Result<SseEvent>> + Send>> {
    use futures::StreamExt;

    let byte_stream = response.bytes_stream();
    let state = (byte_stream, String::new());

    let stream = futures::stream::unfold(state, |(mut bytes, mut buf)| async move {
        loop {
            if let Some(pos) = buf.find("\n\n") {
                let raw_event: String = buf.drain(..pos + 2).collect();
                let mut event_name = None;
                let mut data = String::new();
                for line in raw_event.lines() {
                    if let Some(name) = line.strip_prefix("event: ") {
                        event_name = Some(name.trim().to_string());
                    } else if let Some(payload) = line.strip_prefix("data: ") {
                        if !data.is_empty() {
                            data.push('\n');
                        }
                        data.push_str(payload);
                    }
                }
                if data.is_empty() {
                    continue;
                }
                if data == "[DONE]" {
                    continue;
                }
                return Some((
                    Ok(SseEvent {
                        event: event_name,
                        data,
                    }),
                    (bytes, buf),
                ));
            }

            match bytes.next().await {
                Some(Ok(chunk)) => {
                    buf.push_str(&String::from_utf8_lossy(&chunk));
                }
                Some(Err(e)) => return Some((Err(crate::Error::Http(e)), (bytes, buf))),
                None => {
                    if buf.trim().is_empty() {
                        return None;
                    }
                    // Flush a final event with no trailing blank line.
                    let raw_event = std::mem::take(&mut buf);
                    let mut event_name = None;
                    let mut data = String::new();
                    for line in raw_event.lines() {
                        if let Some(name) = line.strip_prefix("event: ") {
                            event_name = Some(name.trim().to_string());
                        } else if let Some(payload) = line.strip_prefix("data: ") {
                            data.push_str(payload);
                        }
                    }
                    if data.is_empty() || data == "[DONE]" {
                        return None;
                    }
                    return Some((
                        Ok(SseEvent {
                            event: event_name,
                            data,
                        }),
                        (bytes, buf),
                    ));
                }
            }
        }
    });

    Box::pin(stream)
}
