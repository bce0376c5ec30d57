//! # Open Agent SDK - Rust Implementation
//!
//! A browser-embeddable, provider-agnostic LLM agent runtime: a canonical
//! message model, a streaming adapter for each of Anthropic/OpenAI
//! (Completions + Responses)/Google, a direct-vs-relay transport seam, an
//! agent loop that runs tool calls concurrently, a sandboxed code-execution
//! substrate, an artifact store, and an append-only session log.
//!
//! ## Key Features
//!
//! - **Provider-agnostic streaming**: one [`AssistantStreamEvent`] shape
//!   regardless of which wire protocol produced it.
//! - **Canonical history**: [`Message`]/[`AssistantBlock`] plus a pure
//!   [`history::transform`] that adapts history to whatever model it's
//!   replayed against.
//! - **Concurrent tool dispatch**: [`Agent`] runs every tool call from one
//!   turn concurrently, preserving source order in the appended results.
//! - **Direct or relay transport**: talk to a provider directly from the
//!   browser, or through a bandwidth-trimmed relay that only replays
//!   `partial` deltas.
//! - **Sandboxed execution**: a router/bridge pair exposing host capability
//!   providers (console, artifacts, attachments, downloadable files) to
//!   sandboxed code over an RPC channel.
//! - **Session persistence**: append-only JSONL session log with compaction
//!   and branch-summary replay.
//!
//! ## Example
//!
//! ```rust,no_run
//! use open_agent::{Agent, AgentEvent, AgentOptions};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = AgentOptions::builder()
//!         .system_prompt("You are a helpful assistant")
//!         .model("claude-sonnet-4-5")
//!         .base_url("https://api.anthropic.com")
//!         .build()?;
//!
//!     let agent = Agent::new(options);
//!     let mut events = agent.subscribe();
//!     agent.prompt("What's the capital of France?").await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             AgentEvent::MessageUpdate(open_agent::AssistantStreamEvent::TextDelta { delta }) => {
//!                 print!("{delta}");
//!             }
//!             AgentEvent::AgentEnd => break,
//!             _ => {}
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **types**: canonical message/content model, [`AgentOptions`], usage/cost.
//! - **model**: model descriptors ([`ModelDescriptor`], [`ApiKind`], [`CostRates`]).
//! - **provider**: per-API streaming adapters behind the [`ProviderAdapter`] trait.
//! - **history**: pure history-transformation policies applied before replay.
//! - **cost**: per-model usage-delta accumulation into [`UsageCost`].
//! - **stream**: the queued, cancel-aware [`QueuedStream`] generate surface.
//! - **transport**: direct vs. relay request/stream dispatch.
//! - **agent**: the stateful [`Agent`] loop tying the above together.
//! - **sandbox**: the postMessage-style router/bridge and runtime providers.
//! - **artifacts**: the in-memory artifact store backing the artifact tools.
//! - **session**: append-only session log and replay.
//! - **tools**: tool definition system with JSON schema generation.
//! - **hooks**: lifecycle event system for intercepting execution.
//! - **config**: provider API-key/base-URL resolution helpers.
//! - **context**: token estimation and message truncation utilities.
//! - **error**: the crate's [`Error`]/[`Result`] types.
//! - **retry**: exponential backoff retry logic with jitter.

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// The stateful agent loop: prompt/abort/model switching, concurrent tool
/// dispatch, and the broadcast event bus a UI subscribes to.
mod agent;

/// In-memory artifact store backing the `create_artifact`/`str_replace`-style
/// tools, plus pure log-based reconstruction.
mod artifacts;

/// Provider configuration helpers: API-key environment-variable resolution
/// and local-server base URLs.
mod config;

/// Context window management utilities for token estimation and history truncation.
mod context;

/// Per-model usage-delta accumulation into a running, monotonic cost total.
mod cost;

/// Error types and conversions for comprehensive error handling throughout the SDK.
mod error;

/// Pure history-transformation policies applied before a conversation is
/// replayed against a (possibly different) target model.
mod history;

/// Lifecycle hooks system for intercepting and controlling execution at key points.
mod hooks;

/// Model descriptors: API family, cost rates, accepted input modalities.
mod model;

/// Per-API streaming adapters (Anthropic, OpenAI Completions, OpenAI
/// Responses, Google) behind one [`provider::ProviderAdapter`] trait.
mod provider;

/// Sandboxed code-execution substrate: postMessage-style router/bridge and
/// the host capability providers reachable from sandboxed code.
mod sandbox;

/// Append-only JSONL session log and replay.
mod session;

/// The queued, cancel-aware generate stream used by [`agent::Agent`].
mod stream;

/// Tool definition and execution system with automatic JSON schema generation.
mod tools;

/// Direct and relay transports: how a generate request actually reaches a
/// provider (or a relay standing in for one).
mod transport;

/// Core type definitions for messages, content blocks, and agent configuration.
mod types;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

/// Retry utilities with exponential backoff and jitter.
pub mod retry;

// --- Agent Loop ---

pub use agent::{Agent, AgentEvent};

// --- Artifact Store ---

pub use artifacts::{ArtifactOp, ArtifactStore, HtmlArtifactExecutor, OpResult, HTML_EXECUTION_WAIT};

// --- Provider Configuration ---

pub use config::{LocalServer, api_key_env_vars, get_base_url, get_model, resolve_api_key};

// --- Context Management ---

pub use context::{estimate_tokens, is_approaching_limit, truncate_messages};

// --- Cost Accounting ---

pub use cost::{accumulate, cost_for_totals, UsageDelta};

// --- Error Handling ---

pub use error::{Error, Result};

// --- History Transformation ---

pub use history::transform as transform_history;

// --- Lifecycle Hooks ---

pub use hooks::{
    HOOK_POST_TOOL_USE, HOOK_PRE_TOOL_USE, HOOK_USER_PROMPT_SUBMIT, HookDecision, Hooks,
    PostToolUseEvent, PreToolUseEvent, UserPromptSubmitEvent,
};

// --- Model Descriptors ---

pub use model::{ApiKind, CostRates, InputModality, ModelDescriptor};

// --- Provider Adapters ---

pub use provider::{
    AnthropicAdapter, AssistantMessage, AssistantStreamEvent, GoogleAdapter, OpenAiCompatAdapter,
    OpenAiCompatFlavor, OpenAiResponsesAdapter, PartialAssistantMessage, ProviderAdapter,
    StreamOptions,
};

// --- Sandbox Router/Bridge/Providers ---

pub use sandbox::{
    execute as execute_sandbox, Attachment, AttachmentContent, ArtifactsProvider,
    AttachmentsProvider, ConsoleProvider, DownloadableFileProvider, HostProvider, SandboxBridge,
    SandboxHandle, SandboxRouter,
};

// --- Session Log ---

pub use session::{
    header as session_header, load_session, read_entries as read_session_entries, LoadedSession,
    SessionEntry, SessionHeader, SessionWriter,
};

// --- Queued Generate Stream ---

pub use stream::{channel as queued_channel, QueuedSender, QueuedStream};

// --- Tool System ---

pub use tools::{Tool, ToolBuilder, tool};

// --- Transports ---

pub use transport::{DirectTransport, RelayTransport, Transport, TransportParams};

// --- Core Types ---

pub use types::{
    AgentOptions, AgentOptionsBuilder, AgentState, Artifact, AssistantBlock, BaseUrl, ImageBlock,
    Message, ModelName, StopReason, Temperature, TextBlock, ThinkingBlock, ThinkingLevel,
    ToolCallBlock, ToolResultContent, ToolUseBlock, Usage, UsageCost, UserContent,
    UserContentBlock,
};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// Convenience module containing the most commonly used types and functions.
/// Import with `use open_agent::prelude::*;` to get everything you need for
/// typical usage: the agent loop, the canonical message model, tools, hooks,
/// and errors.
pub mod prelude {
    pub use crate::{
        Agent, AgentEvent, AgentOptions, AgentOptionsBuilder, AssistantBlock, Error, HookDecision,
        Hooks, Message, PostToolUseEvent, PreToolUseEvent, Result, StopReason, TextBlock,
        ThinkingLevel, Tool, ToolCallBlock, UserPromptSubmitEvent, tool,
    };
}
