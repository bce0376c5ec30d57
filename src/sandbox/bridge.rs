//! The sandbox-side bridge half of C8: the Rust analogue of the script
//! injected into a real iframe, exposing provider RPCs as async calls and a
//! `complete()` that posts the terminal lifecycle event (§4.6 "The bridge
//! ... exposes host-provider functions as async globals").
//!
//! A real carrier never uses this type directly — it injects the bridge as
//! JavaScript source (see [`crate::sandbox`] module docs on the
//! `SandboxRuntime` seam). `SandboxBridge` is what a native
//! [`super::SandboxRuntime`] implementation (one that runs Rust/WASM code
//! instead of JS) or a test double drives to talk back through the router
//! the same way the injected script would.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use super::{EnvelopePayload, SandboxEnvelope, SandboxHandle};
use crate::{Error, Result};

/// Sandbox-side half of one RPC round trip. Assigns a fresh correlation id
/// per call (§4.6 "a fresh correlation id") and waits for the matching
/// `rpc-response` off the router-to-sandbox channel.
pub struct SandboxBridge {
    handle: SandboxHandle,
    from_router: mpsc::UnboundedReceiver<SandboxEnvelope>,
    next_id: AtomicU64,
}

impl SandboxBridge {
    pub fn new(handle: SandboxHandle, from_router: mpsc::UnboundedReceiver<SandboxEnvelope>) -> Self {
        Self {
            handle,
            from_router,
            next_id: AtomicU64::new(0),
        }
    }

    fn fresh_id(&self) -> String {
        format!(
            "{}-{}",
            self.handle.sandbox_id(),
            self.next_id.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Calls `method` on `provider_name` and awaits its `rpc-response`.
    /// RPCs from one bridge are inherently serialized (one call in flight
    /// at a time), matching §5's "serialized per sandboxId" guarantee.
    pub async fn call(
        &mut self,
        provider_name: &str,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let id = self.fresh_id();
        self.handle
            .post(EnvelopePayload::RpcRequest {
                id: id.clone(),
                provider_name: provider_name.to_string(),
                method: method.to_string(),
                args,
            })
            .await;

        loop {
            let envelope = self
                .from_router
                .recv()
                .await
                .ok_or_else(|| Error::sandbox("router channel closed before rpc-response arrived"))?;
            if let EnvelopePayload::RpcResponse {
                id: response_id,
                result,
            } = envelope.payload
            {
                if response_id == id {
                    return result.map_err(Error::sandbox);
                }
                // A response for a stale/unrelated call; since this bridge
                // only ever has one request in flight, this should not
                // happen in practice, but keep draining rather than panic.
                continue;
            }
        }
    }

    /// Posts `console-log` at `level` (§4.7 `ConsoleProvider`'s monkey-patch
    /// target: the sandbox side overrides `console.{log,warn,error,info}`).
    pub async fn console_log(&self, level: super::ConsoleLevel, text: impl Into<String>) {
        self.handle
            .post(EnvelopePayload::ConsoleLog {
                level,
                text: text.into(),
            })
            .await;
    }

    /// Posts the terminal `execution-complete` event (§4.6 "`complete(error?,
    /// returnValue?)` ... posts the terminal event").
    pub async fn complete(&self, return_value: Option<serde_json::Value>) {
        self.handle
            .post(EnvelopePayload::ExecutionComplete { return_value })
            .await;
    }

    /// Posts `execution-error` instead of completing successfully.
    pub async fn fail(&self, error: impl Into<String>, stack: Option<String>) {
        self.handle
            .post(EnvelopePayload::ExecutionError {
                error: error.into(),
                stack,
            })
            .await;
    }

    /// Posts `file-returned` (§4.7 `DownloadableFileProvider::return_file`).
    pub async fn return_file(&self, file_name: impl Into<String>, content: Vec<u8>, mime_type: impl Into<String>) {
        self.handle
            .post(EnvelopePayload::FileReturned {
                file_name: file_name.into(),
                content,
                mime_type: mime_type.into(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::router::{HostProvider, SandboxRouter};
    use crate::sandbox::ConsoleLevel;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct DoublingProvider;

    #[async_trait]
    impl HostProvider for DoublingProvider {
        async fn call(&self, method: &str, args: serde_json::Value) -> Result<serde_json::Value> {
            assert_eq!(method, "double");
            let v = args["value"].as_f64().unwrap_or(0.0);
            Ok(serde_json::json!(v * 2.0))
        }
    }

    #[tokio::test]
    async fn test_bridge_round_trips_rpc_call() {
        let router = SandboxRouter::new();
        let (handle, from_router) = router.register_sandbox("s1").await;
        router
            .register_provider("s1", "math", Arc::new(DoublingProvider))
            .await;

        let mut bridge = SandboxBridge::new(handle, from_router);
        let result = bridge
            .call("math", "double", serde_json::json!({"value": 21}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!(42.0));
    }

    #[tokio::test]
    async fn test_bridge_complete_reaches_consumer() {
        let router = SandboxRouter::new();
        let (handle, _from_router) = router.register_sandbox("s2").await;
        let mut consumer = router.register_consumer("s2").await.unwrap();

        let bridge = SandboxBridge::new(handle, mpsc::unbounded_channel().1);
        bridge.console_log(ConsoleLevel::Warn, "careful").await;
        bridge.complete(Some(serde_json::json!("done"))).await;

        let first = consumer.recv().await.unwrap();
        assert!(matches!(
            first.payload,
            EnvelopePayload::ConsoleLog { level: ConsoleLevel::Warn, .. }
        ));
        let second = consumer.recv().await.unwrap();
        assert!(matches!(second.payload, EnvelopePayload::ExecutionComplete { .. }));
    }
}
