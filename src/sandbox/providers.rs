//! Sandbox runtime providers (§4.7, C9): the four capability objects a
//! sandbox can reach through the C8 RPC substrate. `ConsoleProvider` only
//! ever receives push events (no RPC calls in), so it is not a
//! [`super::router::HostProvider`] — it drains the router's consumer
//! channel directly. The other three answer `rpc-request`s.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use super::router::HostProvider;
use super::{ConsoleLevel, EnvelopePayload, SandboxEnvelope};
use crate::artifacts::ArtifactStore;
use crate::{Error, Result};

// ============================================================================
// ConsoleProvider
// ============================================================================

/// Aggregates `console-log` envelopes for one sandbox, preserving the order
/// they arrived in (§4.7 "host side aggregates `logs[]`, preserving order").
pub struct ConsoleProvider {
    lines: Mutex<Vec<String>>,
}

impl ConsoleProvider {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
        }
    }

    pub async fn logs(&self) -> Vec<String> {
        self.lines.lock().await.clone()
    }

    /// Drains `consumer` until the channel closes, recording every
    /// `console-log` envelope it sees. Run this as a background task
    /// alongside [`super::router::execute`] when console capture is needed
    /// independent of the final [`super::ExecutionResult::console`] list.
    pub async fn drain(self: &Arc<Self>, mut consumer: mpsc::UnboundedReceiver<SandboxEnvelope>) {
        while let Some(envelope) = consumer.recv().await {
            if let EnvelopePayload::ConsoleLog { level, text } = envelope.payload {
                self.lines.lock().await.push(format_line(level, &text));
            }
        }
    }
}

impl Default for ConsoleProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn format_line(level: ConsoleLevel, text: &str) -> String {
    let tag = match level {
        ConsoleLevel::Log => "log",
        ConsoleLevel::Warn => "warn",
        ConsoleLevel::Error => "error",
        ConsoleLevel::Info => "info",
    };
    format!("[{tag}] {text}")
}

// ============================================================================
// ArtifactsProvider
// ============================================================================

/// RPCs into the [`ArtifactStore`] (§4.7 "iframe exposes
/// `listArtifacts/getArtifact/createOrUpdateArtifact/deleteArtifact`").
/// `.json` filenames auto-parse on read and auto-stringify on write.
pub struct ArtifactsProvider {
    store: Arc<Mutex<ArtifactStore>>,
}

impl ArtifactsProvider {
    pub fn new(store: Arc<Mutex<ArtifactStore>>) -> Self {
        Self { store }
    }
}

fn is_json_filename(filename: &str) -> bool {
    filename.ends_with(".json")
}

#[async_trait]
impl HostProvider for ArtifactsProvider {
    async fn call(&self, method: &str, args: Value) -> Result<Value> {
        match method {
            "listArtifacts" => {
                let store = self.store.lock().await;
                Ok(Value::from(
                    store
                        .filenames()
                        .into_iter()
                        .map(str::to_string)
                        .collect::<Vec<_>>(),
                ))
            }
            "getArtifact" => {
                let filename = require_str(&args, "filename")?;
                let store = self.store.lock().await;
                let result = store.get(filename)?;
                if is_json_filename(filename) {
                    serde_json::from_str(&result.output).map_err(Error::Json)
                } else {
                    Ok(Value::String(result.output))
                }
            }
            "createOrUpdateArtifact" => {
                let filename = require_str(&args, "filename")?.to_string();
                let content = args.get("content").cloned().unwrap_or(Value::Null);
                let title = args
                    .get("title")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let content = if is_json_filename(&filename) {
                    serde_json::to_string(&content)?
                } else {
                    content.as_str().unwrap_or_default().to_string()
                };
                let mut store = self.store.lock().await;
                let result = if store.get_artifact(&filename).is_some() {
                    store.rewrite(&filename, content, title, true).await?
                } else {
                    store.create(filename, content, title, true).await?
                };
                Ok(Value::String(result.output))
            }
            "deleteArtifact" => {
                let filename = require_str(&args, "filename")?;
                let mut store = self.store.lock().await;
                let result = store.delete(filename)?;
                Ok(Value::String(result.output))
            }
            other => Err(Error::sandbox(format!("unknown artifacts method: {other}"))),
        }
    }
}

fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::sandbox(format!("missing '{key}' argument")))
}

// ============================================================================
// AttachmentsProvider
// ============================================================================

/// One attachment on the current conversation's active user message.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub content: AttachmentContent,
}

#[derive(Debug, Clone)]
pub enum AttachmentContent {
    Text(String),
    Binary(Vec<u8>),
}

/// Read-only view over the current turn's user-message attachments (§4.7
/// "iframe exposes `listAttachments/readTextAttachment/readBinaryAttachment`
/// ... `readBinary` returns a `Uint8Array`" — the Rust analogue here is
/// `Vec<u8>`, base64-encoded across the RPC boundary like every other
/// binary payload in this substrate).
pub struct AttachmentsProvider {
    attachments: Vec<Attachment>,
}

impl AttachmentsProvider {
    pub fn new(attachments: Vec<Attachment>) -> Self {
        Self { attachments }
    }

    fn find(&self, name: &str) -> Result<&Attachment> {
        self.attachments
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| Error::sandbox(format!("no such attachment: {name}")))
    }
}

#[async_trait]
impl HostProvider for AttachmentsProvider {
    async fn call(&self, method: &str, args: Value) -> Result<Value> {
        match method {
            "listAttachments" => Ok(Value::from(
                self.attachments
                    .iter()
                    .map(|a| serde_json::json!({ "name": a.name, "mimeType": a.mime_type }))
                    .collect::<Vec<_>>(),
            )),
            "readTextAttachment" => {
                let name = require_str(&args, "name")?;
                match &self.find(name)?.content {
                    AttachmentContent::Text(s) => Ok(Value::String(s.clone())),
                    AttachmentContent::Binary(_) => Err(Error::sandbox(format!(
                        "attachment '{name}' is binary; use readBinaryAttachment"
                    ))),
                }
            }
            "readBinaryAttachment" => {
                let name = require_str(&args, "name")?;
                let bytes = match &self.find(name)?.content {
                    AttachmentContent::Binary(b) => b.clone(),
                    AttachmentContent::Text(s) => s.as_bytes().to_vec(),
                };
                Ok(Value::String(
                    base64::engine::general_purpose::STANDARD.encode(bytes),
                ))
            }
            other => Err(Error::sandbox(format!(
                "unknown attachments method: {other}"
            ))),
        }
    }
}

// ============================================================================
// DownloadableFileProvider
// ============================================================================

/// `returnFile` (§4.7): Blob/binary content requires an explicit MIME type
/// (errors rather than guessing); strings default to `text/plain`; JSON
/// objects default to `application/json` and are auto-stringified.
pub struct DownloadableFileProvider {
    files: Mutex<HashMap<String, super::ReturnedFile>>,
}

impl DownloadableFileProvider {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
        }
    }

    pub async fn files(&self) -> Vec<super::ReturnedFile> {
        self.files.lock().await.values().cloned().collect()
    }
}

impl Default for DownloadableFileProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostProvider for DownloadableFileProvider {
    async fn call(&self, method: &str, args: Value) -> Result<Value> {
        if method != "returnFile" {
            return Err(Error::sandbox(format!(
                "unknown downloadable-file method: {method}"
            )));
        }
        let file_name = require_str(&args, "fileName")?.to_string();
        let explicit_mime = args.get("mimeType").and_then(Value::as_str);
        let content = args
            .get("content")
            .ok_or_else(|| Error::sandbox("returnFile: missing 'content' argument"))?;

        let (bytes, mime_type) = match content {
            Value::String(s) => (
                s.as_bytes().to_vec(),
                explicit_mime.unwrap_or("text/plain").to_string(),
            ),
            Value::Object(map) if map.contains_key("__blobBase64") => {
                let Some(mime) = explicit_mime else {
                    return Err(Error::sandbox(
                        "returnFile: MIME type is required for Blob content",
                    ));
                };
                let encoded = map
                    .get("__blobBase64")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| Error::sandbox(format!("returnFile: invalid blob payload: {e}")))?;
                (bytes, mime.to_string())
            }
            other => {
                let json = serde_json::to_vec(other)?;
                (
                    json,
                    explicit_mime.unwrap_or("application/json").to_string(),
                )
            }
        };

        self.files.lock().await.insert(
            file_name.clone(),
            super::ReturnedFile {
                file_name: file_name.clone(),
                content: bytes,
                mime_type,
            },
        );
        Ok(Value::String(format!("returned {file_name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_artifacts_provider_create_then_get() {
        let store = Arc::new(Mutex::new(ArtifactStore::new()));
        let provider = ArtifactsProvider::new(store);
        provider
            .call(
                "createOrUpdateArtifact",
                serde_json::json!({"filename": "a.md", "content": "hello"}),
            )
            .await
            .unwrap();
        let result = provider
            .call("getArtifact", serde_json::json!({"filename": "a.md"}))
            .await
            .unwrap();
        assert_eq!(result, Value::String("hello".to_string()));
    }

    #[tokio::test]
    async fn test_artifacts_provider_json_roundtrip() {
        let store = Arc::new(Mutex::new(ArtifactStore::new()));
        let provider = ArtifactsProvider::new(store);
        provider
            .call(
                "createOrUpdateArtifact",
                serde_json::json!({"filename": "data.json", "content": {"a": 1}}),
            )
            .await
            .unwrap();
        let result = provider
            .call("getArtifact", serde_json::json!({"filename": "data.json"}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_attachments_provider_text_read() {
        let provider = AttachmentsProvider::new(vec![Attachment {
            name: "notes.txt".into(),
            mime_type: "text/plain".into(),
            content: AttachmentContent::Text("hi".into()),
        }]);
        let result = provider
            .call("readTextAttachment", serde_json::json!({"name": "notes.txt"}))
            .await
            .unwrap();
        assert_eq!(result, Value::String("hi".to_string()));
    }

    #[tokio::test]
    async fn test_downloadable_file_blob_requires_mime() {
        let provider = DownloadableFileProvider::new();
        let err = provider
            .call(
                "returnFile",
                serde_json::json!({
                    "fileName": "x.png",
                    "content": {"__blobBase64": base64::engine::general_purpose::STANDARD.encode(b"abc")},
                }),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("MIME type is required for Blob content"));
    }

    #[tokio::test]
    async fn test_downloadable_file_string_defaults_text_plain() {
        let provider = DownloadableFileProvider::new();
        provider
            .call(
                "returnFile",
                serde_json::json!({"fileName": "x.txt", "content": "hello"}),
            )
            .await
            .unwrap();
        let files = provider.files().await;
        assert_eq!(files[0].mime_type, "text/plain");
    }

    #[tokio::test]
    async fn test_downloadable_file_object_defaults_json() {
        let provider = DownloadableFileProvider::new();
        provider
            .call(
                "returnFile",
                serde_json::json!({"fileName": "x.json", "content": {"a": 1}}),
            )
            .await
            .unwrap();
        let files = provider.files().await;
        assert_eq!(files[0].mime_type, "application/json");
    }
}
