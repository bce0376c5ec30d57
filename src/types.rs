//! Canonical data model shared by every provider adapter, the history
//! transformer, the agent loop, and the session log.
//!
//! This module is the crate's single source of truth for what a message, a
//! tool descriptor, a model descriptor and a unit of usage look like once
//! they have been normalized away from any one provider's wire format.
//! Provider-specific wire shapes live under [`crate::provider`]; this module
//! only ever sees the provider-neutral shape described in the data model.
//!
//! # Message shape
//!
//! [`Message`] is a tagged sum with one variant per role: [`Message::User`],
//! [`Message::Assistant`], [`Message::ToolResult`]. Assistant content is an
//! ordered list of [`AssistantBlock`] (text, thinking, tool call); user
//! content is either a plain string or an ordered list of
//! [`UserContentBlock`] (text, image).
//!
//! # Invariants (see `spec.md` §3.1, carried here as doc-level contract)
//!
//! - H1: every assistant `ToolCall.id` appears at most once in a history.
//! - H2: every `ToolResult.tool_call_id` has exactly one preceding assistant
//!   `ToolCall` with a matching id, or it is orphaned and must be dropped by
//!   [`crate::history::transform`].
//! - H3: content block order within an assistant message is meaningful.
//! - H4: `stop_reason` is one of the six [`StopReason`] variants.
//!
//! These invariants are enforced by the history transformer, not by this
//! module's types directly — the types here are intentionally permissive so
//! that malformed histories (which do occur mid-stream, or after a lossy
//! round trip through a different provider) can still be represented and
//! then repaired.

use crate::Error;
use crate::hooks::Hooks;
use crate::tools::Tool;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

// ============================================================================
// NEWTYPE WRAPPERS FOR COMPILE-TIME TYPE SAFETY
// ============================================================================

/// Validated model name.
///
/// # Example
///
/// ```
/// use open_agent::ModelName;
///
/// let model = ModelName::new("claude-sonnet-4-5").unwrap();
/// assert_eq!(model.as_str(), "claude-sonnet-4-5");
/// assert!(ModelName::new("").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelName(String);

impl ModelName {
    /// Creates a new `ModelName` after validation.
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::invalid_input(
                "Model name cannot be empty or whitespace",
            ));
        }
        Ok(ModelName(name))
    }

    /// Returns the model name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the `ModelName` and returns the inner `String`.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for ModelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated base URL. Must start with `http://` or `https://`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BaseUrl(String);

impl BaseUrl {
    /// Creates a new `BaseUrl` after validation.
    pub fn new(url: impl Into<String>) -> crate::Result<Self> {
        let url = url.into();
        let trimmed = url.trim();

        if trimmed.is_empty() {
            return Err(Error::invalid_input("base_url cannot be empty"));
        }
        if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
            return Err(Error::invalid_input(
                "base_url must start with http:// or https://",
            ));
        }
        Ok(BaseUrl(url))
    }

    /// Returns the base URL as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the `BaseUrl` and returns the inner `String`.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for BaseUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated sampling temperature, `0.0..=2.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Temperature(f32);

impl Temperature {
    /// Creates a new `Temperature` after validation.
    pub fn new(temp: f32) -> crate::Result<Self> {
        if !(0.0..=2.0).contains(&temp) {
            return Err(Error::invalid_input(
                "temperature must be between 0.0 and 2.0",
            ));
        }
        Ok(Temperature(temp))
    }

    /// Returns the temperature value.
    pub fn value(&self) -> f32 {
        self.0
    }
}

impl std::fmt::Display for Temperature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// STOP REASONS, THINKING LEVELS
// ============================================================================

/// Closed taxonomy of reasons an assistant turn can end (H4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    /// Normal completion.
    Stop,
    /// Hit the model's max-token limit.
    Length,
    /// The model requested one or more tool calls.
    ToolUse,
    /// The turn was cancelled via `abort()`.
    Aborted,
    /// A transport, decode, or provider error sealed the turn.
    Error,
    /// The provider refused on safety grounds.
    Safety,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::Stop => "stop",
            StopReason::Length => "length",
            StopReason::ToolUse => "toolUse",
            StopReason::Aborted => "aborted",
            StopReason::Error => "error",
            StopReason::Safety => "safety",
        };
        write!(f, "{s}")
    }
}

/// Requested reasoning effort for models that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    /// Reasoning disabled.
    #[default]
    Off,
    Minimal,
    Low,
    Medium,
    High,
}

impl std::fmt::Display for ThinkingLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ThinkingLevel::Off => "off",
            ThinkingLevel::Minimal => "minimal",
            ThinkingLevel::Low => "low",
            ThinkingLevel::Medium => "medium",
            ThinkingLevel::High => "high",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// CONTENT BLOCKS (§3.1)
// ============================================================================

/// A block of assistant-produced content: text, reasoning, or a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantBlock {
    Text(TextBlock),
    Thinking(ThinkingBlock),
    #[serde(rename = "toolCall")]
    ToolCall(ToolCallBlock),
}

/// Plain text content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
}

impl TextBlock {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Opaque provider-signed reasoning content.
///
/// `thinking_signature` is an opaque token issued by the provider. Losing it
/// (e.g. because the block was edited, or the turn was truncated) means the
/// block MUST be dropped when replayed to a provider that requires signed
/// reasoning (§4.3 reasoning pairing).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ThinkingBlock {
    pub thinking: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_signature: Option<String>,
}

impl ThinkingBlock {
    pub fn new(thinking: impl Into<String>) -> Self {
        Self {
            thinking: thinking.into(),
            thinking_signature: None,
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.thinking_signature = Some(signature.into());
        self
    }
}

/// A fully assembled tool call requested by the assistant.
///
/// During streaming, providers accumulate `arguments` as a raw JSON string
/// (`partial_json`) across deltas; the canonical block only exists once that
/// string has parsed successfully, at which point `arguments` holds the
/// decoded value and `partial_json` is discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallBlock {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolCallBlock {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Deprecated alias kept for call sites that predate the `AssistantBlock`
/// split; behaves exactly like [`ToolCallBlock`].
pub type ToolUseBlock = ToolCallBlock;

/// A single block of user-authored content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserContentBlock {
    Text(TextBlock),
    Image(ImageBlock),
}

/// Inline image content, always carried as base64-encoded bytes with an
/// explicit MIME type (the canonical model has no notion of a bare URL —
/// that is an OpenAI-wire-format concern handled in
/// [`crate::provider::openai_compat`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageBlock {
    pub mime_type: String,
    /// Base64-encoded image bytes.
    pub data: String,
}

impl ImageBlock {
    /// Builds an image block from raw bytes, base64-encoding them with the
    /// `base64` crate (the crate's only consumer of that dependency besides
    /// the sandbox attachment providers).
    pub fn from_bytes(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        use base64::Engine;
        Self {
            mime_type: mime_type.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    /// Builds an image block from an already base64-encoded string.
    pub fn from_base64(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }
}

/// User-message content: either a plain string or an ordered list of blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<UserContentBlock>),
}

impl UserContent {
    /// True if this content contains no text and no blocks worth sending.
    pub fn is_empty(&self) -> bool {
        match self {
            UserContent::Text(s) => s.is_empty(),
            UserContent::Blocks(b) => b.is_empty(),
        }
    }

    /// Returns a copy with image blocks removed (history transformer image
    /// filtering, §4.3). No-op for plain-string content.
    pub fn without_images(&self) -> UserContent {
        match self {
            UserContent::Text(s) => UserContent::Text(s.clone()),
            UserContent::Blocks(blocks) => UserContent::Blocks(
                blocks
                    .iter()
                    .filter(|b| !matches!(b, UserContentBlock::Image(_)))
                    .cloned()
                    .collect(),
            ),
        }
    }
}

/// Content returned from a tool execution: plain string or mixed blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<UserContentBlock>),
}

// ============================================================================
// MESSAGE (§3.1)
// ============================================================================

/// The canonical message type shared by every provider adapter, the history
/// transformer, the agent loop, and the session log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "camelCase")]
pub enum Message {
    User {
        content: UserContent,
    },
    Assistant {
        content: Vec<AssistantBlock>,
        api: crate::model::ApiKind,
        provider: String,
        model: String,
        usage: Usage,
        stop_reason: StopReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    #[serde(rename = "toolResult")]
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        content: ToolResultContent,
        is_error: bool,
    },
}

impl Message {
    /// Convenience constructor for a plain-text user message.
    pub fn user(text: impl Into<String>) -> Self {
        Message::User {
            content: UserContent::Text(text.into()),
        }
    }

    /// Convenience constructor for a user message with explicit blocks
    /// (text and/or images).
    pub fn user_with_blocks(blocks: Vec<UserContentBlock>) -> Self {
        Message::User {
            content: UserContent::Blocks(blocks),
        }
    }

    /// Returns `true` if this is a `User` message.
    pub fn is_user(&self) -> bool {
        matches!(self, Message::User { .. })
    }

    /// Returns `true` if this is an `Assistant` message.
    pub fn is_assistant(&self) -> bool {
        matches!(self, Message::Assistant { .. })
    }

    /// Returns the assistant content blocks, if this is an assistant message.
    pub fn assistant_content(&self) -> Option<&[AssistantBlock]> {
        match self {
            Message::Assistant { content, .. } => Some(content),
            _ => None,
        }
    }

    /// Returns every `ToolCallBlock` id present in this message, in order.
    pub fn tool_call_ids(&self) -> Vec<&str> {
        match self {
            Message::Assistant { content, .. } => content
                .iter()
                .filter_map(|b| match b {
                    AssistantBlock::ToolCall(t) => Some(t.id.as_str()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

// ============================================================================
// USAGE (§3.4)
// ============================================================================

/// Monetary cost breakdown, accumulated monotonically across stream deltas
/// of a single assistant message (see `spec.md` §8 cost-accumulation
/// monotonicity property).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct UsageCost {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
    pub total: f64,
}

/// Token usage for a single assistant message, with its derived cost.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub cost: UsageCost,
}

// ============================================================================
// AGENT STATE (§3.5)
// ============================================================================

/// A read-only snapshot of the agent's conversational state, as surfaced to
/// subscribers and used by the session log. Mutated only on the agent's
/// single loop task (see `spec.md` §5 shared-resources rule).
#[derive(Debug, Clone)]
pub struct AgentState {
    pub system_prompt: String,
    pub model: crate::model::ModelDescriptor,
    pub thinking_level: ThinkingLevel,
    pub tools: Vec<Arc<Tool>>,
    pub messages: Vec<Message>,
    pub running: bool,
    pub pending_tool_calls: HashSet<String>,
}

impl AgentState {
    pub fn new(model: crate::model::ModelDescriptor) -> Self {
        Self {
            system_prompt: String::new(),
            model,
            thinking_level: ThinkingLevel::default(),
            tools: Vec::new(),
            messages: Vec::new(),
            running: false,
            pending_tool_calls: HashSet::new(),
        }
    }
}

// ============================================================================
// ARTIFACT (§3.6)
// ============================================================================

/// A named, versioned text file held by the [`crate::artifacts`] store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub filename: String,
    pub title: Option<String>,
    pub content: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

// ============================================================================
// AGENT CONFIGURATION (construction-time options, distinct from AgentState)
// ============================================================================

/// Configuration options for an agent instance: model selection, transport
/// credentials, conversation limits, tool roster and lifecycle hooks.
/// Constructed via [`AgentOptions::builder()`].
#[derive(Clone)]
pub struct AgentOptions {
    system_prompt: String,
    model: String,
    base_url: String,
    api_key: String,
    max_turns: u32,
    max_tokens: Option<u32>,
    temperature: f32,
    timeout: u64,
    tools: Vec<Arc<Tool>>,
    auto_execute_tools: bool,
    max_tool_iterations: u32,
    thinking_level: ThinkingLevel,
    hooks: Hooks,
}

impl std::fmt::Debug for AgentOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentOptions")
            .field("system_prompt", &self.system_prompt)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &"***")
            .field("max_turns", &self.max_turns)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("timeout", &self.timeout)
            .field("tools", &format!("{} tools", self.tools.len()))
            .field("auto_execute_tools", &self.auto_execute_tools)
            .field("max_tool_iterations", &self.max_tool_iterations)
            .field("thinking_level", &self.thinking_level)
            .field("hooks", &self.hooks)
            .finish()
    }
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            model: String::new(),
            base_url: String::new(),
            api_key: "not-needed".to_string(),
            max_turns: 1,
            max_tokens: Some(4096),
            temperature: 0.7,
            timeout: 60,
            tools: Vec::new(),
            auto_execute_tools: false,
            max_tool_iterations: 5,
            thinking_level: ThinkingLevel::Off,
            hooks: Hooks::new(),
        }
    }
}

impl AgentOptions {
    pub fn builder() -> AgentOptionsBuilder {
        AgentOptionsBuilder::default()
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }
    pub fn model(&self) -> &str {
        &self.model
    }
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
    pub fn api_key(&self) -> &str {
        &self.api_key
    }
    pub fn max_turns(&self) -> u32 {
        self.max_turns
    }
    pub fn max_tokens(&self) -> Option<u32> {
        self.max_tokens
    }
    pub fn temperature(&self) -> f32 {
        self.temperature
    }
    pub fn timeout(&self) -> u64 {
        self.timeout
    }
    pub fn tools(&self) -> &[Arc<Tool>] {
        &self.tools
    }
    pub fn auto_execute_tools(&self) -> bool {
        self.auto_execute_tools
    }
    pub fn max_tool_iterations(&self) -> u32 {
        self.max_tool_iterations
    }
    pub fn thinking_level(&self) -> ThinkingLevel {
        self.thinking_level
    }
    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }
}

/// Builder for [`AgentOptions`]. `model` and `base_url` are required; every
/// other field has a sensible default. Validation (via the [`ModelName`],
/// [`BaseUrl`] and [`Temperature`] newtypes) runs in [`build`](Self::build).
#[derive(Default)]
pub struct AgentOptionsBuilder {
    system_prompt: Option<String>,
    model: Option<String>,
    base_url: Option<String>,
    api_key: Option<String>,
    max_turns: Option<u32>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    timeout: Option<u64>,
    tools: Vec<Arc<Tool>>,
    auto_execute_tools: Option<bool>,
    max_tool_iterations: Option<u32>,
    thinking_level: Option<ThinkingLevel>,
    hooks: Hooks,
}

impl std::fmt::Debug for AgentOptionsBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentOptionsBuilder")
            .field("system_prompt", &self.system_prompt)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("tools", &format!("{} tools", self.tools.len()))
            .finish()
    }
}

impl AgentOptionsBuilder {
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn max_turns(mut self, turns: u32) -> Self {
        self.max_turns = Some(turns);
        self
    }

    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    pub fn temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp);
        self
    }

    pub fn timeout(mut self, timeout: u64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn auto_execute_tools(mut self, auto: bool) -> Self {
        self.auto_execute_tools = Some(auto);
        self
    }

    pub fn max_tool_iterations(mut self, iterations: u32) -> Self {
        self.max_tool_iterations = Some(iterations);
        self
    }

    pub fn thinking_level(mut self, level: ThinkingLevel) -> Self {
        self.thinking_level = Some(level);
        self
    }

    pub fn tool(mut self, tool: Tool) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools.extend(tools.into_iter().map(Arc::new));
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Validates required fields and constructs [`AgentOptions`].
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if `model` or `base_url` is missing or
    /// fails newtype validation, or if `temperature`/`max_tokens` is out of
    /// range.
    pub fn build(self) -> crate::Result<AgentOptions> {
        let model = self
            .model
            .ok_or_else(|| Error::invalid_input("model is required"))?;
        let base_url = self
            .base_url
            .ok_or_else(|| Error::invalid_input("base_url is required"))?;

        // Validate through the newtypes without changing the stored
        // representation; AgentOptions keeps plain Strings for ergonomic
        // field access elsewhere in the crate.
        let model = ModelName::new(model)?.into_inner();
        let base_url = BaseUrl::new(base_url)?.into_inner();

        let temperature = self.temperature.unwrap_or(0.7);
        let temperature = Temperature::new(temperature)?.value();

        if let Some(0) = self.max_tokens {
            return Err(Error::invalid_input("max_tokens cannot be zero"));
        }

        Ok(AgentOptions {
            system_prompt: self.system_prompt.unwrap_or_default(),
            model,
            base_url,
            api_key: self.api_key.unwrap_or_else(|| "not-needed".to_string()),
            max_turns: self.max_turns.unwrap_or(1),
            max_tokens: self.max_tokens.or(Some(4096)),
            temperature,
            timeout: self.timeout.unwrap_or(60),
            tools: self.tools,
            auto_execute_tools: self.auto_execute_tools.unwrap_or(false),
            max_tool_iterations: self.max_tool_iterations.unwrap_or(5),
            thinking_level: self.thinking_level.unwrap_or_default(),
            hooks: self.hooks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_name_validation() {
        assert!(ModelName::new("gpt-4").is_ok());
        assert!(ModelName::new("").is_err());
        assert!(ModelName::new("   ").is_err());
    }

    #[test]
    fn test_base_url_validation() {
        assert!(BaseUrl::new("http://localhost:1234/v1").is_ok());
        assert!(BaseUrl::new("https://api.openai.com/v1").is_ok());
        assert!(BaseUrl::new("localhost:1234").is_err());
        assert!(BaseUrl::new("").is_err());
    }

    #[test]
    fn test_temperature_validation() {
        assert!(Temperature::new(0.0).is_ok());
        assert!(Temperature::new(2.0).is_ok());
        assert!(Temperature::new(-0.1).is_err());
        assert!(Temperature::new(2.1).is_err());
    }

    #[test]
    fn test_builder_requires_model_and_base_url() {
        let err = AgentOptions::builder().build().unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = AgentOptions::builder().model("gpt-4").build().unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_builder_success() {
        let options = AgentOptions::builder()
            .model("gpt-4")
            .base_url("https://api.openai.com/v1")
            .system_prompt("be concise")
            .max_turns(5)
            .build()
            .unwrap();

        assert_eq!(options.model(), "gpt-4");
        assert_eq!(options.max_turns(), 5);
        assert_eq!(options.thinking_level(), ThinkingLevel::Off);
    }

    #[test]
    fn test_builder_rejects_zero_max_tokens() {
        let err = AgentOptions::builder()
            .model("gpt-4")
            .base_url("https://api.openai.com/v1")
            .max_tokens(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_message_user_constructors() {
        let msg = Message::user("hello");
        assert!(msg.is_user());
        assert!(!msg.is_assistant());
    }

    #[test]
    fn test_tool_call_ids_only_on_assistant() {
        let user = Message::user("hi");
        assert!(user.tool_call_ids().is_empty());

        let assistant = Message::Assistant {
            content: vec![AssistantBlock::ToolCall(ToolCallBlock::new(
                "call_1",
                "search",
                serde_json::json!({}),
            ))],
            api: crate::model::ApiKind::OpenAiCompletions,
            provider: "openai".into(),
            model: "gpt-4".into(),
            usage: Usage::default(),
            stop_reason: StopReason::ToolUse,
            error_message: None,
        };
        assert_eq!(assistant.tool_call_ids(), vec!["call_1"]);
    }

    #[test]
    fn test_user_content_without_images() {
        let content = UserContent::Blocks(vec![
            UserContentBlock::Text(TextBlock::new("hi")),
            UserContentBlock::Image(ImageBlock::from_base64("image/png", "AAAA")),
        ]);
        let filtered = content.without_images();
        match filtered {
            UserContent::Blocks(blocks) => assert_eq!(blocks.len(), 1),
            _ => panic!("expected blocks"),
        }
    }

    #[test]
    fn test_usage_cost_default_is_zero() {
        let usage = Usage::default();
        assert_eq!(usage.cost.total, 0.0);
    }
}
