//! Sandboxed code-execution substrate (§4.6, §4.7, C8/C9): the postMessage
//! router and bridge that let a sandboxed runtime (`javascript_repl`, HTML
//! artifacts) call back into host-side capability providers.
//!
//! The browser's iframe + `window.message` wiring has no equivalent in a
//! headless crate, so it is modeled as an in-process actor pair connected by
//! `tokio::sync::mpsc` channels carrying the exact wire envelope from §6 —
//! [`SandboxEnvelope`]. [`router`] owns the host side (dispatch, lifecycle
//! fan-out); [`bridge`] owns the sandbox side (RPC calls, `complete()`).
//! [`providers`] implements the four runtime providers from §4.7 on top of
//! that RPC substrate. The actual code-execution engine is out of scope
//! (§1 "specific tool bodies"); [`SandboxRuntime`] is the pluggable seam a
//! host backs with whatever JS engine it has.

mod bridge;
mod providers;
mod router;

pub use bridge::SandboxBridge;
pub use providers::{
    Attachment, AttachmentContent, ArtifactsProvider, AttachmentsProvider, ConsoleProvider,
    DownloadableFileProvider,
};
pub use router::{execute, HostProvider, SandboxHandle, SandboxRouter};

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Wall-clock execution budget (§4.6 "Wall-clock timeout: 120 s").
pub const EXECUTION_TIMEOUT: Duration = Duration::from_secs(120);

/// One `{ sandboxId, type, ...payload }` message (§6 "Sandbox postMessage
/// envelope"). Carried over an mpsc channel in either direction instead of
/// `postMessage`.
#[derive(Debug, Clone)]
pub struct SandboxEnvelope {
    pub sandbox_id: String,
    pub payload: EnvelopePayload,
}

/// The tagged payload types from §6, one variant per wire `type`.
#[derive(Debug, Clone)]
pub enum EnvelopePayload {
    SandboxReady,
    SandboxLoad {
        code: String,
    },
    SandboxError {
        error: String,
        stack: Option<String>,
    },
    RpcRequest {
        id: String,
        provider_name: String,
        method: String,
        args: serde_json::Value,
    },
    RpcResponse {
        id: String,
        result: std::result::Result<serde_json::Value, String>,
    },
    ConsoleLog {
        level: ConsoleLevel,
        text: String,
    },
    FileReturned {
        file_name: String,
        content: Vec<u8>,
        mime_type: String,
    },
    ExecutionComplete {
        return_value: Option<serde_json::Value>,
    },
    ExecutionError {
        error: String,
        stack: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    Log,
    Warn,
    Error,
    Info,
}

/// The result of one sandbox run (§4.6 "Execution contract").
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub success: bool,
    pub console: Vec<String>,
    pub files: Vec<ReturnedFile>,
    pub error: Option<String>,
    pub return_value: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct ReturnedFile {
    pub file_name: String,
    pub content: Vec<u8>,
    pub mime_type: String,
}

/// The pluggable seam a host backs with an actual JS engine (§4.6 "the
/// actual code-execution runtime is explicitly out of scope"). Given the
/// composed document/script and a set of registered provider names, it runs
/// the code and reports back every lifecycle envelope it produces; the
/// router turns those into an [`ExecutionResult`].
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Runs `code` inside sandbox `sandbox_id`, observing `cancellation`.
    /// Implementations post [`SandboxEnvelope`]s to `router` exactly as a
    /// real iframe would via `postMessage` (`rpc-request`, `console-log`,
    /// `execution-complete` | `execution-error`).
    async fn run(
        &self,
        sandbox_id: &str,
        code: &str,
        is_html_artifact: bool,
        router: SandboxHandle,
        cancellation: CancellationToken,
    ) -> Result<()>;
}

/// Escapes `</script` so user code embedded inside a `<script>` tag can't
/// prematurely close it (§4.6 "Script-tag safety").
pub fn escape_script_close(code: &str) -> String {
    code.replace("</script", "<\\/script")
}

/// DOM-parse validation the host performs before instantiating an iframe
/// carrying a composed HTML document (§4.6 "Validation"). This crate has no
/// DOM parser; it applies the one structural check that's meaningful
/// without one — every opened `<script>`/`<style>` tag must be closed — and
/// leaves deeper HTML well-formedness to the browser's own parser, which is
/// the actual validator in the real carrier.
pub fn validate_composed_document(html: &str) -> Result<()> {
    for tag in ["script", "style"] {
        let opens = html.matches(&format!("<{tag}")).count();
        let closes = html.matches(&format!("</{tag}>")).count();
        if opens != closes {
            return Err(crate::Error::sandbox(format!(
                "composed document has {opens} <{tag}> open tag(s) but {closes} close tag(s)"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_script_close() {
        let code = "console.log(1); </script><script>alert(1)</script>";
        let escaped = escape_script_close(code);
        assert!(!escaped.contains("</script>"));
        assert!(escaped.contains("<\\/script>"));
    }

    #[test]
    fn test_validate_composed_document_rejects_unbalanced() {
        let html = "<html><script>console.log(1)</html>";
        assert!(validate_composed_document(html).is_err());
    }

    #[test]
    fn test_validate_composed_document_accepts_balanced() {
        let html = "<html><script>console.log(1)</script></html>";
        assert!(validate_composed_document(html).is_ok());
    }
}
