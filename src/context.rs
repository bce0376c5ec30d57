//! Context management utilities for manual history management (ambient
//! stack; the spec names no dedicated context-window module, but the
//! teacher's own `estimate_tokens`/`truncate_messages` pair is kept and
//! generalized to the canonical [`Message`] shape since §4.9's session
//! compaction explicitly operates "to fit a future context window" and
//! needs something to measure against).
//!
//! These are opt-in utilities - nothing is automatic. You decide when and
//! how to manage context; the agent loop never calls these on your behalf.
//!
//! - Token estimation (character-based approximation)
//! - Message truncation with the leading system-prompt slot left untouched
//!   (the canonical history has no `system` message variant — the system
//!   prompt lives on [`crate::types::AgentOptions`] — so truncation here
//!   only ever trims user/assistant/tool-result turns)

use crate::types::{AssistantBlock, Message, UserContent, UserContentBlock};

/// Estimate token count for a message list.
///
/// Uses character-based approximation (1 token ≈ 4 characters). This is a
/// conservative estimate that works across model families; for exact counts
/// use a model-specific tokenizer.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    if messages.is_empty() {
        return 0;
    }

    let mut total_chars = 0;

    for message in messages {
        total_chars += 8; // role formatting overhead

        match message {
            Message::User { content } => total_chars += user_content_chars(content),
            Message::Assistant { content, .. } => {
                for block in content {
                    match block {
                        AssistantBlock::Text(t) => total_chars += t.text.len(),
                        AssistantBlock::Thinking(t) => total_chars += t.thinking.len(),
                        AssistantBlock::ToolCall(tc) => {
                            total_chars += tc.name.len();
                            total_chars += tc.id.len();
                            total_chars += tc.arguments.to_string().len();
                        }
                    }
                }
            }
            Message::ToolResult {
                tool_call_id,
                content,
                ..
            } => {
                total_chars += tool_call_id.len();
                total_chars += match content {
                    crate::types::ToolResultContent::Text(s) => s.len(),
                    crate::types::ToolResultContent::Blocks(blocks) => blocks
                        .iter()
                        .map(|b| match b {
                            UserContentBlock::Text(t) => t.text.len(),
                            UserContentBlock::Image(img) => img.data.len(),
                        })
                        .sum(),
                };
            }
        }
    }

    total_chars += 16; // conversation-level overhead
    (total_chars + 3) / 4
}

fn user_content_chars(content: &UserContent) -> usize {
    match content {
        UserContent::Text(s) => s.len(),
        UserContent::Blocks(blocks) => blocks
            .iter()
            .map(|b| match b {
                UserContentBlock::Text(t) => t.text.len(),
                UserContentBlock::Image(img) => img.data.len(),
            })
            .sum(),
    }
}

/// Truncate message history, keeping the most recent `keep` messages.
///
/// This is a SIMPLE truncation — it does not attempt to preserve tool-call
/// chains, so truncating mid-turn can strand an orphan `toolResult` (the
/// history transformer, not this function, is responsible for repairing
/// that before replay). Use at natural turn boundaries.
pub fn truncate_messages(messages: &[Message], keep: usize) -> Vec<Message> {
    if messages.len() <= keep {
        return messages.to_vec();
    }
    if keep == 0 {
        return Vec::new();
    }
    let start = messages.len().saturating_sub(keep);
    messages[start..].to_vec()
}

/// Checks whether `messages` estimated token count exceeds `limit * margin`.
pub fn is_approaching_limit(messages: &[Message], limit: usize, margin: f32) -> bool {
    let estimated = estimate_tokens(messages);
    let threshold = (limit as f32 * margin) as usize;
    estimated > threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_empty() {
        let messages: Vec<Message> = vec![];
        assert_eq!(estimate_tokens(&messages), 0);
    }

    #[test]
    fn test_estimate_tokens_simple() {
        let messages = vec![Message::user("Hello world")];
        let tokens = estimate_tokens(&messages);
        assert!(tokens >= 3 && tokens <= 10);
    }

    #[test]
    fn test_truncate_messages_keep_all() {
        let messages = vec![Message::user("one"), Message::user("two")];
        let truncated = truncate_messages(&messages, 10);
        assert_eq!(truncated.len(), 2);
    }

    #[test]
    fn test_truncate_messages_keeps_most_recent() {
        let messages = vec![
            Message::user("one"),
            Message::user("two"),
            Message::user("three"),
        ];
        let truncated = truncate_messages(&messages, 2);
        assert_eq!(truncated.len(), 2);
        assert!(matches!(&truncated[0], Message::User { content: UserContent::Text(s) } if s == "two"));
    }

    #[test]
    fn test_is_approaching_limit() {
        let messages = vec![Message::user("x".repeat(1000))];
        assert!(!is_approaching_limit(&messages, 1000, 0.9));
        assert!(is_approaching_limit(&messages, 200, 0.9));
    }
}
