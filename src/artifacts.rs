//! Artifact store (§3.6, §4.8, C10): a filename-keyed key-value store for
//! named text content, with exact-substring `update`, wholesale `rewrite`,
//! and deterministic reconstruction from a message history.
//!
//! Grounded on `spec.md` §4.8 directly; the `update` failure message
//! ("String not found in file. Here is the full content:\n\n...") is
//! reproduced verbatim since §8's boundary scenario 4 pins its exact text.
//! HTML-artifact execution scheduling plugs into a caller-supplied
//! [`HtmlArtifactExecutor`] rather than embedding a JS engine — the actual
//! code-execution runtime is explicitly out of scope (§4.6), so this store
//! only owns the scheduling/timeout/log-aggregation contract around it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::types::Artifact;
use crate::{Error, Result};

/// How long `create`/`update`/`rewrite` wait for an HTML artifact's
/// execution to complete before appending whatever console logs have
/// arrived so far (§4.8 "await either `execution-complete` ... or a 1.5-s
/// timeout").
pub const HTML_EXECUTION_WAIT: Duration = Duration::from_millis(1500);

/// The result shape every store operation returns (§4.8 "Operations return
/// `{ output, details? }`").
#[derive(Debug, Clone, PartialEq)]
pub struct OpResult {
    pub output: String,
    pub details: Option<Value>,
}

impl OpResult {
    fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            details: None,
        }
    }
}

/// Runs an HTML artifact's current content and reports captured console
/// output. The sandbox/bridge substrate (C8/C9) is the intended backing
/// implementation; tests can substitute a stub.
#[async_trait]
pub trait HtmlArtifactExecutor: Send + Sync {
    async fn execute(&self, filename: &str, content: &str) -> Vec<String>;
}

fn is_html(filename: &str) -> bool {
    filename.ends_with(".html") || filename.ends_with(".htm")
}

/// In-memory artifact store. One instance per session/conversation.
pub struct ArtifactStore {
    artifacts: HashMap<String, Artifact>,
    logs: HashMap<String, Vec<String>>,
    executor: Option<Arc<dyn HtmlArtifactExecutor>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self {
            artifacts: HashMap::new(),
            logs: HashMap::new(),
            executor: None,
        }
    }

    /// Attaches the executor backing HTML-artifact scheduling. Without one,
    /// `create`/`update`/`rewrite` on an `.html` file skip scheduling
    /// entirely and return just the plain success message.
    pub fn with_executor(mut self, executor: Arc<dyn HtmlArtifactExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn get_artifact(&self, filename: &str) -> Option<&Artifact> {
        self.artifacts.get(filename)
    }

    pub fn filenames(&self) -> Vec<&str> {
        self.artifacts.keys().map(|s| s.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    /// Creates a new artifact; fails if `filename` already exists.
    pub async fn create(
        &mut self,
        filename: impl Into<String>,
        content: impl Into<String>,
        title: Option<String>,
        skip_wait: bool,
    ) -> Result<OpResult> {
        let filename = filename.into();
        let content = content.into();
        if self.artifacts.contains_key(&filename) {
            return Err(Error::artifact(format!(
                "artifact '{filename}' already exists"
            )));
        }
        let now = Utc::now();
        self.artifacts.insert(
            filename.clone(),
            Artifact {
                filename: filename.clone(),
                title,
                content: content.clone(),
                created_at: now,
                updated_at: now,
            },
        );
        let output = self
            .schedule_and_describe(&filename, &content, "Created", skip_wait)
            .await;
        Ok(OpResult::text(output))
    }

    /// Replaces the first occurrence of `old_str` with `new_str`. On
    /// failure, reports the file's current full content (§4.8, §8 scenario
    /// 4) so the caller can recover deterministically without a second
    /// round-trip.
    pub async fn update(
        &mut self,
        filename: &str,
        old_str: &str,
        new_str: &str,
        skip_wait: bool,
    ) -> Result<OpResult> {
        let current = self
            .artifacts
            .get(filename)
            .ok_or_else(|| Error::artifact(format!("artifact '{filename}' not found")))?
            .content
            .clone();

        let Some(pos) = current.find(old_str) else {
            return Err(Error::other(format!(
                "String not found in file. Here is the full content:\n\n{current}"
            )));
        };

        let mut updated = String::with_capacity(current.len() - old_str.len() + new_str.len());
        updated.push_str(&current[..pos]);
        updated.push_str(new_str);
        updated.push_str(&current[pos + old_str.len()..]);

        let artifact = self.artifacts.get_mut(filename).expect("checked above");
        artifact.content = updated.clone();
        artifact.updated_at = Utc::now();

        let output = self
            .schedule_and_describe(filename, &updated, "Updated", skip_wait)
            .await;
        Ok(OpResult::text(output))
    }

    /// Replaces an artifact's content wholesale.
    pub async fn rewrite(
        &mut self,
        filename: &str,
        content: impl Into<String>,
        title: Option<String>,
        skip_wait: bool,
    ) -> Result<OpResult> {
        let content = content.into();
        let artifact = self
            .artifacts
            .get_mut(filename)
            .ok_or_else(|| Error::artifact(format!("artifact '{filename}' not found")))?;
        artifact.content = content.clone();
        artifact.updated_at = Utc::now();
        if let Some(title) = title {
            artifact.title = Some(title);
        }

        let output = self
            .schedule_and_describe(filename, &content, "Rewrote", skip_wait)
            .await;
        Ok(OpResult::text(output))
    }

    pub fn get(&self, filename: &str) -> Result<OpResult> {
        let artifact = self
            .artifacts
            .get(filename)
            .ok_or_else(|| Error::artifact(format!("artifact '{filename}' not found")))?;
        Ok(OpResult::text(artifact.content.clone()))
    }

    pub fn delete(&mut self, filename: &str) -> Result<OpResult> {
        self.artifacts
            .remove(filename)
            .ok_or_else(|| Error::artifact(format!("artifact '{filename}' not found")))?;
        self.logs.remove(filename);
        Ok(OpResult::text(format!("Deleted {filename}")))
    }

    /// Returns the captured console logs of an HTML artifact's most recent
    /// run. Errors for non-HTML filenames (§4.8 "HTML-only").
    pub fn logs(&self, filename: &str) -> Result<OpResult> {
        if !is_html(filename) {
            return Err(Error::artifact(format!(
                "'{filename}' is not an HTML artifact; logs are only captured for .html files"
            )));
        }
        if !self.artifacts.contains_key(filename) {
            return Err(Error::artifact(format!("artifact '{filename}' not found")));
        }
        let lines = self.logs.get(filename).cloned().unwrap_or_default();
        Ok(OpResult::text(lines.join("\n")))
    }

    /// Records the console output of an out-of-band execution run (e.g. one
    /// driven directly through the sandbox substrate rather than through
    /// `create`/`update`/`rewrite`), overwriting any prior run's logs.
    pub fn record_logs(&mut self, filename: &str, lines: Vec<String>) {
        self.logs.insert(filename.to_string(), lines);
    }

    async fn schedule_and_describe(
        &mut self,
        filename: &str,
        content: &str,
        verb: &str,
        skip_wait: bool,
    ) -> String {
        if !is_html(filename) {
            return format!("{verb} {filename}");
        }
        let Some(executor) = self.executor.clone() else {
            return format!("{verb} {filename}");
        };
        if skip_wait {
            return format!("{verb} {filename}");
        }

        let lines = match tokio::time::timeout(
            HTML_EXECUTION_WAIT,
            executor.execute(filename, content),
        )
        .await
        {
            Ok(lines) => lines,
            Err(_elapsed) => Vec::new(),
        };
        self.logs.insert(filename.to_string(), lines.clone());

        if lines.is_empty() {
            format!("{verb} {filename}")
        } else {
            format!("{verb} {filename}\n\nConsole output:\n{}", lines.join("\n"))
        }
    }

    /// Rebuilds a store from a message history: walks successful `artifacts`
    /// tool-results in order, applying each recorded operation to an
    /// initially empty store. `get`/`logs` results are skipped since they
    /// have no store-mutating effect (§4.8 "Reconstruction").
    pub async fn reconstruct(ops: &[ArtifactOp]) -> Self {
        let mut store = Self::new();
        for op in ops {
            let _ = match op {
                ArtifactOp::Create {
                    filename,
                    content,
                    title,
                } => {
                    store
                        .create(filename.clone(), content.clone(), title.clone(), true)
                        .await
                }
                ArtifactOp::Update {
                    filename,
                    old_str,
                    new_str,
                } => store.update(filename, old_str, new_str, true).await,
                ArtifactOp::Rewrite {
                    filename,
                    content,
                    title,
                } => {
                    store
                        .rewrite(filename, content.clone(), title.clone(), true)
                        .await
                }
                ArtifactOp::Delete { filename } => store.delete(filename),
            };
        }
        store
    }
}

impl Default for ArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

/// One recorded mutating operation, as replayed from a tool-result during
/// reconstruction. `get`/`logs` have no `ArtifactOp` variant since they
/// never mutate the store.
#[derive(Debug, Clone)]
pub enum ArtifactOp {
    Create {
        filename: String,
        content: String,
        title: Option<String>,
    },
    Update {
        filename: String,
        old_str: String,
        new_str: String,
    },
    Rewrite {
        filename: String,
        content: String,
        title: Option<String>,
    },
    Delete {
        filename: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_then_get() {
        let mut store = ArtifactStore::new();
        store
            .create("notes.md", "hello", None, true)
            .await
            .unwrap();
        let result = store.get("notes.md").unwrap();
        assert_eq!(result.output, "hello");
    }

    #[tokio::test]
    async fn test_create_duplicate_fails() {
        let mut store = ArtifactStore::new();
        store.create("notes.md", "a", None, true).await.unwrap();
        let err = store
            .create("notes.md", "b", None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Artifact(_)));
    }

    #[tokio::test]
    async fn test_update_success() {
        let mut store = ArtifactStore::new();
        store.create("notes.md", "abc", None, true).await.unwrap();
        store.update("notes.md", "b", "X", true).await.unwrap();
        assert_eq!(store.get("notes.md").unwrap().output, "aXc");
    }

    #[tokio::test]
    async fn test_update_failure_reports_full_content() {
        let mut store = ArtifactStore::new();
        store.create("a.md", "abc", None, true).await.unwrap();
        let err = store.update("a.md", "X", "Y", true).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error: String not found in file. Here is the full content:\n\nabc"
        );
    }

    #[tokio::test]
    async fn test_rewrite_replaces_content() {
        let mut store = ArtifactStore::new();
        store.create("a.md", "old", None, true).await.unwrap();
        store.rewrite("a.md", "new", None, true).await.unwrap();
        assert_eq!(store.get("a.md").unwrap().output, "new");
    }

    #[tokio::test]
    async fn test_delete_removes_artifact() {
        let mut store = ArtifactStore::new();
        store.create("a.md", "x", None, true).await.unwrap();
        store.delete("a.md").unwrap();
        assert!(store.get("a.md").is_err());
    }

    #[tokio::test]
    async fn test_logs_rejects_non_html() {
        let mut store = ArtifactStore::new();
        store.create("a.md", "x", None, true).await.unwrap();
        assert!(store.logs("a.md").is_err());
    }

    #[tokio::test]
    async fn test_logs_empty_for_html_without_executor() {
        let mut store = ArtifactStore::new();
        store
            .create("a.html", "<html></html>", None, true)
            .await
            .unwrap();
        let result = store.logs("a.html").unwrap();
        assert_eq!(result.output, "");
    }

    #[tokio::test]
    async fn test_reconstruct_matches_online_execution() {
        let ops = vec![
            ArtifactOp::Create {
                filename: "a.md".to_string(),
                content: "abc".to_string(),
                title: None,
            },
            ArtifactOp::Update {
                filename: "a.md".to_string(),
                old_str: "b".to_string(),
                new_str: "X".to_string(),
            },
            ArtifactOp::Create {
                filename: "b.md".to_string(),
                content: "one".to_string(),
                title: Some("B".to_string()),
            },
            ArtifactOp::Delete {
                filename: "b.md".to_string(),
            },
        ];
        let store = ArtifactStore::reconstruct(&ops).await;
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a.md").unwrap().output, "aXc");
        assert!(store.get("b.md").is_err());
    }
}
