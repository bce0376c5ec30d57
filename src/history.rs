//! Pure history transformation (§4.3): takes the canonical, possibly messy
//! conversation state and produces the version safe to replay to a specific
//! target model, without ever touching the agent's live state directly.
//!
//! Five policies apply in order, each only when the target model's shape
//! requires it:
//!
//! 1. image filtering (drop image blocks the target can't accept)
//! 2. empty-message suppression (content left empty by filtering, or
//!    originally empty, drops the whole message)
//! 3. reasoning pairing (Responses-API targets only: a `toolCall` not
//!    immediately preceded by a signed `thinking` block is dropped, and an
//!    isolated aborted thinking-only message is dropped entirely)
//! 4. same-model signature stripping (a `thinking` block's signature is only
//!    valid when replayed to the model that issued it)
//! 5. tool-id sanitization (Anthropic's character class, applied to both the
//!    `toolCall.id` and the paired `toolResult.toolCallId`)
//!
//! Role projection — mapping `toolResult` onto each provider's native wire
//! shape (`user`/`tool_result` for Anthropic, `tool` role for the
//! completions family, `function_call_output` for Responses) — stays
//! canonical-typed here and is done by each adapter's own request builder
//! (`message_to_json` in `src/provider/*.rs`) rather than by this function,
//! since it has no representation as a `Message` variant once projected.
//! `transform` is everything upstream of that: the policies above are
//! provider-agnostic over the *canonical* shape, so one pass covers every
//! adapter.

use crate::model::{ApiKind, ModelDescriptor};
use crate::types::{AssistantBlock, Message, StopReason, UserContent};
use std::collections::HashSet;

/// Strips characters outside `[a-zA-Z0-9_-]`, Anthropic's accepted id
/// character class (§4.3 tool-id sanitization). Exposed so the Anthropic
/// adapter's request builder can apply the same rule to ids sent inline in
/// a single turn's new tool calls, not just ids replayed from history.
pub(crate) fn sanitize_tool_id(id: &str) -> String {
    id.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// Transforms `messages` for replay against `target`. Idempotent:
/// `transform(transform(m, t), t) == transform(m, t)`.
pub fn transform(messages: &[Message], target: &ModelDescriptor) -> Vec<Message> {
    let mut result: Vec<Message> = messages.to_vec();

    filter_images(&mut result, target);
    suppress_empty(&mut result);

    if target.api == ApiKind::OpenAiResponses {
        reasoning_pairing(&mut result);
        drop_orphaned_tool_results(&mut result);
    }

    strip_foreign_signatures(&mut result, target);

    if target.api == ApiKind::AnthropicMessages {
        sanitize_tool_ids(&mut result);
    }

    result
}

fn filter_images(messages: &mut [Message], target: &ModelDescriptor) {
    if target.accepts_images() {
        return;
    }
    for message in messages.iter_mut() {
        if let Message::User { content } = message {
            *content = content.without_images();
        }
    }
}

fn suppress_empty(messages: &mut Vec<Message>) {
    messages.retain(|m| match m {
        Message::User { content } => !content.is_empty(),
        Message::Assistant { content, .. } => !content.is_empty(),
        Message::ToolResult { .. } => true,
    });
}

/// Responses-API reasoning pairing (§4.3): a `toolCall` not immediately
/// preceded, within the same assistant message, by a `thinking` block
/// carrying a signature is dropped; a thinking-only assistant message that
/// was aborted is dropped entirely (a bare "I was thinking..." turn with no
/// visible output and no tool call is not replayable).
fn reasoning_pairing(messages: &mut Vec<Message>) {
    messages.retain_mut(|message| {
        let Message::Assistant {
            content,
            stop_reason,
            ..
        } = message
        else {
            return true;
        };

        if *stop_reason == StopReason::Aborted
            && content
                .iter()
                .all(|b| matches!(b, AssistantBlock::Thinking(_)))
            && !content.is_empty()
        {
            return false;
        }

        let mut kept = Vec::with_capacity(content.len());
        let mut prev_signed_thinking = false;
        for block in content.drain(..) {
            match &block {
                AssistantBlock::Thinking(t) => {
                    prev_signed_thinking = t
                        .thinking_signature
                        .as_ref()
                        .is_some_and(|s| !s.is_empty());
                    kept.push(block);
                }
                AssistantBlock::ToolCall(_) => {
                    if prev_signed_thinking {
                        kept.push(block);
                    }
                    prev_signed_thinking = false;
                }
                AssistantBlock::Text(_) => {
                    prev_signed_thinking = false;
                    kept.push(block);
                }
            }
        }
        *content = kept;
        true
    });
}

/// Drops any `ToolResult` whose `tool_call_id` no longer has a matching
/// `ToolCall` in the transformed history (§3.1 H2). `reasoning_pairing` can
/// orphan a `ToolResult` this way by removing its unsigned `toolCall`; left
/// in place it becomes a dangling `call_id` once `build_input` projects it
/// onto a Responses-API `function_call_output` item with no preceding
/// `function_call` to answer.
fn drop_orphaned_tool_results(messages: &mut Vec<Message>) {
    let surviving: HashSet<String> = messages
        .iter()
        .filter_map(|m| match m {
            Message::Assistant { content, .. } => Some(content.iter().filter_map(|b| match b {
                AssistantBlock::ToolCall(tc) => Some(tc.id.clone()),
                _ => None,
            })),
            _ => None,
        })
        .flatten()
        .collect();

    messages.retain(|m| match m {
        Message::ToolResult { tool_call_id, .. } => surviving.contains(tool_call_id),
        _ => true,
    });
}

/// Strips `thinking_signature` from any reasoning block whose owning
/// message's `model` differs from `target.id` (§4.3 same-model detection).
/// The thinking text itself is kept; only the now-unusable signature goes.
fn strip_foreign_signatures(messages: &mut [Message], target: &ModelDescriptor) {
    for message in messages.iter_mut() {
        if let Message::Assistant { content, model, .. } = message {
            if model == &target.id {
                continue;
            }
            for block in content.iter_mut() {
                if let AssistantBlock::Thinking(t) = block {
                    t.thinking_signature = None;
                }
            }
        }
    }
}

/// Applies Anthropic's tool-id character class to every `ToolCall.id` and
/// its paired `ToolResult.tool_call_id`, symmetrically (§4.3).
fn sanitize_tool_ids(messages: &mut [Message]) {
    let mut seen: HashSet<String> = HashSet::new();
    for message in messages.iter_mut() {
        match message {
            Message::Assistant { content, .. } => {
                for block in content.iter_mut() {
                    if let AssistantBlock::ToolCall(tc) = block {
                        let sanitized = sanitize_tool_id(&tc.id);
                        seen.insert(tc.id.clone());
                        tc.id = sanitized;
                    }
                }
            }
            Message::ToolResult { tool_call_id, .. } => {
                if seen.contains(tool_call_id) {
                    *tool_call_id = sanitize_tool_id(tool_call_id);
                }
            }
            Message::User { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InputModality;
    use crate::types::{ImageBlock, TextBlock, ThinkingBlock, ToolCallBlock, ToolResultContent,
        UserContentBlock, Usage};

    fn text_only_model(api: ApiKind) -> ModelDescriptor {
        ModelDescriptor {
            id: "target-model".into(),
            name: "target-model".into(),
            provider: "test".into(),
            api,
            base_url: "https://example.test".into(),
            reasoning: true,
            input: vec![InputModality::Text],
            cost: Default::default(),
            context_window: 128_000,
            max_tokens: 4096,
        }
    }

    fn assistant(content: Vec<AssistantBlock>, model: &str, stop_reason: StopReason) -> Message {
        Message::Assistant {
            content,
            api: ApiKind::OpenAiResponses,
            provider: "test".into(),
            model: model.into(),
            usage: Usage::default(),
            stop_reason,
            error_message: None,
        }
    }

    #[test]
    fn test_image_filtering_strips_images_when_unsupported() {
        let model = text_only_model(ApiKind::OpenAiCompletions);
        let messages = vec![Message::user_with_blocks(vec![
            UserContentBlock::Text(TextBlock::new("look")),
            UserContentBlock::Image(ImageBlock::from_base64("image/png", "AAAA")),
        ])];
        let result = transform(&messages, &model);
        match &result[0] {
            Message::User {
                content: UserContent::Blocks(blocks),
            } => assert_eq!(blocks.len(), 1),
            _ => panic!("expected blocks"),
        }
    }

    #[test]
    fn test_empty_message_suppression() {
        let model = text_only_model(ApiKind::OpenAiCompletions);
        let messages = vec![
            Message::user(""),
            assistant(vec![], "target-model", StopReason::Stop),
            Message::user("hi"),
        ];
        let result = transform(&messages, &model);
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_reasoning_pairing_drops_unsigned_tool_call() {
        let model = text_only_model(ApiKind::OpenAiResponses);
        let messages = vec![assistant(
            vec![
                AssistantBlock::Thinking(ThinkingBlock::new("scratch")),
                AssistantBlock::ToolCall(ToolCallBlock::new("id1", "search", serde_json::json!({}))),
            ],
            "target-model",
            StopReason::ToolUse,
        )];
        let result = transform(&messages, &model);
        let content = result[0].assistant_content().unwrap();
        assert_eq!(content.len(), 1);
        assert!(matches!(content[0], AssistantBlock::Thinking(_)));
    }

    #[test]
    fn test_reasoning_pairing_keeps_signed_tool_call() {
        let model = text_only_model(ApiKind::OpenAiResponses);
        let messages = vec![assistant(
            vec![
                AssistantBlock::Thinking(ThinkingBlock::new("scratch").with_signature("sig-1")),
                AssistantBlock::ToolCall(ToolCallBlock::new("id1", "search", serde_json::json!({}))),
            ],
            "target-model",
            StopReason::ToolUse,
        )];
        let result = transform(&messages, &model);
        let content = result[0].assistant_content().unwrap();
        assert_eq!(content.len(), 2);
    }

    #[test]
    fn test_reasoning_pairing_drops_aborted_thinking_only_message() {
        let model = text_only_model(ApiKind::OpenAiResponses);
        let messages = vec![assistant(
            vec![AssistantBlock::Thinking(ThinkingBlock::new("half-formed"))],
            "target-model",
            StopReason::Aborted,
        )];
        let result = transform(&messages, &model);
        assert!(result.is_empty());
    }

    #[test]
    fn test_reasoning_pairing_drops_orphaned_tool_result() {
        let model = text_only_model(ApiKind::OpenAiResponses);
        let messages = vec![
            assistant(
                vec![AssistantBlock::ToolCall(ToolCallBlock::new(
                    "id1", "search", serde_json::json!({}),
                ))],
                "target-model",
                StopReason::ToolUse,
            ),
            Message::ToolResult {
                tool_call_id: "id1".into(),
                tool_name: "search".into(),
                content: ToolResultContent::Text("42".into()),
                is_error: false,
            },
        ];
        let result = transform(&messages, &model);
        assert!(
            !result
                .iter()
                .any(|m| matches!(m, Message::ToolResult { .. })),
            "orphaned tool result must not survive transform"
        );
    }

    #[test]
    fn test_same_model_signature_stripping() {
        let model = text_only_model(ApiKind::OpenAiResponses);
        let messages = vec![assistant(
            vec![AssistantBlock::Thinking(
                ThinkingBlock::new("scratch").with_signature("sig-1"),
            )],
            "a-different-model",
            StopReason::Stop,
        )];
        let result = transform(&messages, &model);
        let content = result[0].assistant_content().unwrap();
        match &content[0] {
            AssistantBlock::Thinking(t) => assert!(t.thinking_signature.is_none()),
            _ => panic!("expected thinking block"),
        }
    }

    #[test]
    fn test_tool_id_sanitization_is_symmetric() {
        let model = text_only_model(ApiKind::AnthropicMessages);
        let messages = vec![
            assistant(
                vec![AssistantBlock::ToolCall(ToolCallBlock::new(
                    "call:abc.123",
                    "search",
                    serde_json::json!({}),
                ))],
                "target-model",
                StopReason::ToolUse,
            ),
            Message::ToolResult {
                tool_call_id: "call:abc.123".into(),
                tool_name: "search".into(),
                content: ToolResultContent::Text("ok".into()),
                is_error: false,
            },
        ];
        let result = transform(&messages, &model);
        let call_id = match &result[0] {
            Message::Assistant { content, .. } => match &content[0] {
                AssistantBlock::ToolCall(tc) => tc.id.clone(),
                _ => panic!("expected tool call"),
            },
            _ => panic!("expected assistant"),
        };
        let result_id = match &result[1] {
            Message::ToolResult { tool_call_id, .. } => tool_call_id.clone(),
            _ => panic!("expected tool result"),
        };
        assert_eq!(call_id, "callabc123");
        assert_eq!(result_id, call_id);
    }

    #[test]
    fn test_transform_is_idempotent() {
        let model = text_only_model(ApiKind::AnthropicMessages);
        let messages = vec![assistant(
            vec![AssistantBlock::ToolCall(ToolCallBlock::new(
                "call:abc",
                "search",
                serde_json::json!({}),
            ))],
            "target-model",
            StopReason::ToolUse,
        )];
        let once = transform(&messages, &model);
        let twice = transform(&once, &model);
        assert_eq!(once.len(), twice.len());
    }
}
