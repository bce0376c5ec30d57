//! The host-side router half of C8: demultiplexes envelopes by `sandbox_id`,
//! dispatches `rpc-request`s to the matching provider, and fans lifecycle
//! envelopes out to every registered consumer — the channel-actor
//! translation of `window.message` dispatch described in §4.6.
//!
//! Grounded on the [`crate::hooks::Hooks`] registry shape (`Vec<Arc<dyn Fn
//! ...>>` handlers, first-match dispatch) applied to RPC method lookup
//! instead of hook interception.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{
    ConsoleLevel, EnvelopePayload, ExecutionResult, ReturnedFile, SandboxEnvelope, SandboxRuntime,
    EXECUTION_TIMEOUT,
};
use crate::{Error, Result};

/// A capability the router dispatches `rpc-request`s to, keyed by provider
/// name (§4.7: `console`, `artifacts`, `attachments`, `downloads`).
#[async_trait]
pub trait HostProvider: Send + Sync {
    async fn call(&self, method: &str, args: serde_json::Value) -> Result<serde_json::Value>;
}

struct Registration {
    providers: HashMap<String, Arc<dyn HostProvider>>,
    consumers: Vec<mpsc::UnboundedSender<SandboxEnvelope>>,
    to_sandbox: mpsc::UnboundedSender<SandboxEnvelope>,
}

/// Handle a [`SandboxRuntime`] implementation uses to post envelopes to the
/// router, as a real iframe would via `postMessage` (§4.6). Cheap to clone;
/// every clone talks to the same registration.
#[derive(Clone)]
pub struct SandboxHandle {
    sandbox_id: String,
    router: Arc<SandboxRouter>,
}

impl SandboxHandle {
    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    /// Posts one envelope from the sandbox to the router, exactly as a
    /// `window.postMessage` call from inside the iframe would.
    pub async fn post(&self, payload: EnvelopePayload) {
        self.router
            .dispatch(SandboxEnvelope {
                sandbox_id: self.sandbox_id.clone(),
                payload,
            })
            .await;
    }
}

/// Host-side router owning every sandbox's provider roster and consumer
/// fan-out list (§4.6 "The router ... keeps `sandboxId -> { iframe,
/// providers[], consumers[] }`"). RPC dispatch to the same `sandbox_id` is
/// naturally serialized since each registration is guarded by one lock
/// (§5 "Sandbox RPCs to the same provider are serialized per sandboxId").
pub struct SandboxRouter {
    registrations: Mutex<HashMap<String, Registration>>,
}

impl SandboxRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registrations: Mutex::new(HashMap::new()),
        })
    }

    /// Registers a fresh sandbox and returns the handle the runtime uses to
    /// talk to the router, plus the receiver side of the router-to-sandbox
    /// channel (what a real bridge would receive as inbound `postMessage`s:
    /// `sandbox-load`, `rpc-response`).
    pub async fn register_sandbox(
        self: &Arc<Self>,
        sandbox_id: impl Into<String>,
    ) -> (SandboxHandle, mpsc::UnboundedReceiver<SandboxEnvelope>) {
        let sandbox_id = sandbox_id.into();
        let (to_sandbox, from_router) = mpsc::unbounded_channel();
        self.registrations.lock().await.insert(
            sandbox_id.clone(),
            Registration {
                providers: HashMap::new(),
                consumers: Vec::new(),
                to_sandbox,
            },
        );
        (
            SandboxHandle {
                sandbox_id,
                router: self.clone(),
            },
            from_router,
        )
    }

    /// Attaches a capability provider under `name` for `sandbox_id`.
    pub async fn register_provider(
        &self,
        sandbox_id: &str,
        name: impl Into<String>,
        provider: Arc<dyn HostProvider>,
    ) {
        if let Some(reg) = self.registrations.lock().await.get_mut(sandbox_id) {
            reg.providers.insert(name.into(), provider);
        }
    }

    /// Registers a host-side listener for lifecycle envelopes
    /// (`console-log`, `file-returned`, `execution-complete`,
    /// `execution-error`) from `sandbox_id`.
    pub async fn register_consumer(
        &self,
        sandbox_id: &str,
    ) -> Option<mpsc::UnboundedReceiver<SandboxEnvelope>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut regs = self.registrations.lock().await;
        let reg = regs.get_mut(sandbox_id)?;
        reg.consumers.push(tx);
        Some(rx)
    }

    /// Unregisters `sandbox_id`, dropping its provider roster and consumer
    /// channels (§5 "each sandbox has a bounded lifetime and is
    /// unregistered on completion or dispose").
    pub async fn unregister_sandbox(&self, sandbox_id: &str) {
        self.registrations.lock().await.remove(sandbox_id);
    }

    /// Handles one envelope posted by a sandbox: dispatches `rpc-request`s
    /// to the matching provider and posts the `rpc-response` back; forwards
    /// every other envelope to all registered consumers unchanged.
    async fn dispatch(&self, envelope: SandboxEnvelope) {
        match &envelope.payload {
            EnvelopePayload::RpcRequest {
                id,
                provider_name,
                method,
                args,
            } => {
                let provider = {
                    let regs = self.registrations.lock().await;
                    regs.get(&envelope.sandbox_id)
                        .and_then(|r| r.providers.get(provider_name).cloned())
                };
                let result = match provider {
                    Some(p) => p
                        .call(method, args.clone())
                        .await
                        .map_err(|e| e.to_string()),
                    None => Err(format!("no such provider: {provider_name}")),
                };
                let response = SandboxEnvelope {
                    sandbox_id: envelope.sandbox_id.clone(),
                    payload: EnvelopePayload::RpcResponse {
                        id: id.clone(),
                        result,
                    },
                };
                let regs = self.registrations.lock().await;
                if let Some(reg) = regs.get(&envelope.sandbox_id) {
                    let _ = reg.to_sandbox.send(response);
                }
            }
            _ => {
                let regs = self.registrations.lock().await;
                if let Some(reg) = regs.get(&envelope.sandbox_id) {
                    for consumer in &reg.consumers {
                        let _ = consumer.send(envelope.clone());
                    }
                }
            }
        }
    }
}

/// Runs the full execution contract for one sandbox (§4.6 "Execution
/// contract"): drives `runtime` to completion, enforces the 120s wall-clock
/// timeout, tears down on cancellation, and aggregates every `console-log`
/// and `file-returned` envelope the run produced into an [`ExecutionResult`].
pub async fn execute(
    router: &Arc<SandboxRouter>,
    runtime: Arc<dyn SandboxRuntime>,
    sandbox_id: impl Into<String>,
    code: &str,
    is_html_artifact: bool,
    cancellation: CancellationToken,
) -> Result<ExecutionResult> {
    let sandbox_id = sandbox_id.into();
    let (handle, _from_router) = router.register_sandbox(&sandbox_id).await;
    let mut consumer = router
        .register_consumer(&sandbox_id)
        .await
        .ok_or_else(|| Error::sandbox("failed to register consumer for freshly created sandbox"))?;

    if is_html_artifact {
        if let Err(e) = super::validate_composed_document(code) {
            router.unregister_sandbox(&sandbox_id).await;
            return Ok(ExecutionResult {
                success: false,
                error: Some(e.to_string()),
                ..Default::default()
            });
        }
    }

    let code = super::escape_script_close(code);

    let run = runtime.run(&sandbox_id, &code, is_html_artifact, handle, cancellation.clone());

    let outcome = tokio::select! {
        _ = cancellation.cancelled() => None,
        r = tokio::time::timeout(EXECUTION_TIMEOUT, run) => Some(r),
    };

    let mut result = ExecutionResult::default();

    // Drain whatever lifecycle envelopes arrived before the run settled
    // (console output and returned files interleave with the terminal
    // event, never after it, since the runtime posts them in order).
    while let Ok(envelope) = consumer.try_recv() {
        apply_envelope(&mut result, envelope.payload);
    }

    match outcome {
        None => {
            result.success = false;
            result.error = Some("Execution aborted".to_string());
        }
        Some(Err(_elapsed)) => {
            result.success = false;
            result.error = Some("Execution aborted".to_string());
        }
        Some(Ok(Err(e))) => {
            result.success = false;
            result.error = Some(e.to_string());
        }
        Some(Ok(Ok(()))) => {
            while let Ok(envelope) = consumer.try_recv() {
                apply_envelope(&mut result, envelope.payload);
            }
            if result.error.is_none() {
                result.success = true;
            }
        }
    }

    router.unregister_sandbox(&sandbox_id).await;
    Ok(result)
}

fn apply_envelope(result: &mut ExecutionResult, payload: EnvelopePayload) {
    match payload {
        EnvelopePayload::ConsoleLog { level, text } => {
            result.console.push(format_console_line(level, &text));
        }
        EnvelopePayload::FileReturned {
            file_name,
            content,
            mime_type,
        } => result.files.push(ReturnedFile {
            file_name,
            content,
            mime_type,
        }),
        EnvelopePayload::ExecutionComplete { return_value } => {
            result.return_value = return_value;
        }
        EnvelopePayload::ExecutionError { error, .. } => {
            result.success = false;
            result.error = Some(error);
        }
        _ => {}
    }
}

fn format_console_line(level: ConsoleLevel, text: &str) -> String {
    let tag = match level {
        ConsoleLevel::Log => "log",
        ConsoleLevel::Warn => "warn",
        ConsoleLevel::Error => "error",
        ConsoleLevel::Info => "info",
    };
    format!("[{tag}] {text}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::EnvelopePayload;

    struct EchoRuntime;

    #[async_trait]
    impl SandboxRuntime for EchoRuntime {
        async fn run(
            &self,
            _sandbox_id: &str,
            _code: &str,
            _is_html_artifact: bool,
            handle: SandboxHandle,
            _cancellation: CancellationToken,
        ) -> Result<()> {
            handle
                .post(EnvelopePayload::ConsoleLog {
                    level: ConsoleLevel::Log,
                    text: "hello".to_string(),
                })
                .await;
            handle
                .post(EnvelopePayload::ExecutionComplete {
                    return_value: Some(serde_json::json!(42)),
                })
                .await;
            Ok(())
        }
    }

    struct FailingRuntime;

    #[async_trait]
    impl SandboxRuntime for FailingRuntime {
        async fn run(
            &self,
            _sandbox_id: &str,
            _code: &str,
            _is_html_artifact: bool,
            handle: SandboxHandle,
            _cancellation: CancellationToken,
        ) -> Result<()> {
            handle
                .post(EnvelopePayload::ExecutionError {
                    error: "boom".to_string(),
                    stack: None,
                })
                .await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_execute_success_aggregates_console_and_return_value() {
        let router = SandboxRouter::new();
        let result = execute(
            &router,
            Arc::new(EchoRuntime),
            "s1",
            "console.log('hello')",
            false,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(result.success);
        assert_eq!(result.console, vec!["[log] hello"]);
        assert_eq!(result.return_value, Some(serde_json::json!(42)));
    }

    #[tokio::test]
    async fn test_execute_reports_execution_error() {
        let router = SandboxRouter::new();
        let result = execute(
            &router,
            Arc::new(FailingRuntime),
            "s2",
            "throw new Error('boom')",
            false,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_execute_aborts_on_cancellation() {
        struct HangingRuntime;
        #[async_trait]
        impl SandboxRuntime for HangingRuntime {
            async fn run(
                &self,
                _sandbox_id: &str,
                _code: &str,
                _is_html_artifact: bool,
                _handle: SandboxHandle,
                cancellation: CancellationToken,
            ) -> Result<()> {
                cancellation.cancelled().await;
                Ok(())
            }
        }

        let router = SandboxRouter::new();
        let token = CancellationToken::new();
        let token2 = token.clone();
        let run = tokio::spawn(async move {
            execute(&router, Arc::new(HangingRuntime), "s3", "", false, token2).await
        });
        token.cancel();
        let result = run.await.unwrap().unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Execution aborted"));
    }

    #[tokio::test]
    async fn test_execute_rejects_unbalanced_html_before_running() {
        let router = SandboxRouter::new();
        let result = execute(
            &router,
            Arc::new(EchoRuntime),
            "s-html",
            "<html><script>console.log(1)</html>",
            true,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("open tag"));
        // EchoRuntime never ran, so none of its output made it through.
        assert!(result.console.is_empty());
        assert!(result.return_value.is_none());
    }

    #[tokio::test]
    async fn test_rpc_dispatch_routes_to_provider() {
        struct EchoProvider;
        #[async_trait]
        impl HostProvider for EchoProvider {
            async fn call(&self, method: &str, args: serde_json::Value) -> Result<serde_json::Value> {
                Ok(serde_json::json!({ "method": method, "args": args }))
            }
        }

        let router = SandboxRouter::new();
        let (handle, mut from_router) = router.register_sandbox("s4").await;
        router
            .register_provider("s4", "echo", Arc::new(EchoProvider))
            .await;

        handle
            .post(EnvelopePayload::RpcRequest {
                id: "req-1".to_string(),
                provider_name: "echo".to_string(),
                method: "ping".to_string(),
                args: serde_json::json!({"a": 1}),
            })
            .await;

        let response = from_router.recv().await.unwrap();
        match response.payload {
            EnvelopePayload::RpcResponse { id, result } => {
                assert_eq!(id, "req-1");
                assert_eq!(
                    result.unwrap(),
                    serde_json::json!({"method": "ping", "args": {"a": 1}})
                );
            }
            _ => panic!("expected rpc-response"),
        }
    }
}
