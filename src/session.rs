//! Session log (§4.9, C11): append-only JSONL, one entry per line, header
//! first. [`load_session`] replays entries back into the model/thinking
//! level/message history an [`crate::agent::Agent`] resumes from, applying
//! compactions while keeping the original entries on disk so older
//! branches stay reconstructible via an explicit [`SessionEntry::BranchSummary`].
//!
//! Grounded on `spec.md` §4.9/§6 directly; the single-writer-per-file,
//! re-read-on-demand reader model is the `tokio::fs` append/`BufReader`
//! idiom used elsewhere in the pack for line-delimited logs (e.g.
//! `querymt-querymt`'s worker session logging).

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::model::ModelDescriptor;
use crate::types::{Message, ThinkingLevel};
use crate::{Error, Result};

/// The session file's mandatory first line (§6 "Header `{type:"session",
/// id, timestamp, cwd, provider, modelId, thinkingLevel}` must be first").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHeader {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub cwd: String,
    pub provider: String,
    pub model_id: String,
    pub thinking_level: ThinkingLevel,
}

/// One ordered log entry (§3.7). `Session` only ever appears first, which
/// [`load_session`] enforces rather than this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEntry {
    Session {
        #[serde(flatten)]
        header: SessionHeader,
    },
    Message {
        timestamp: DateTime<Utc>,
        message: Message,
    },
    ModelChange {
        timestamp: DateTime<Utc>,
        model_id: String,
    },
    ThinkingLevelChange {
        timestamp: DateTime<Utc>,
        level: ThinkingLevel,
    },
    /// Replaces the first `prefix_len` messages seen so far with `summary`,
    /// without erasing the entries that produced them (§4.9 "the log keeps
    /// the original entries so older branches can still be reconstructed").
    Compaction {
        timestamp: DateTime<Utc>,
        prefix_len: usize,
        summary: Message,
    },
    /// Reconstructs an older branch explicitly, bypassing the most recent
    /// compaction (§4.9).
    BranchSummary {
        timestamp: DateTime<Utc>,
        summary: Message,
    },
    Label {
        timestamp: DateTime<Utc>,
        text: String,
    },
    Custom {
        timestamp: DateTime<Utc>,
        data: serde_json::Value,
    },
}

impl SessionEntry {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            SessionEntry::Session { header } => header.timestamp,
            SessionEntry::Message { timestamp, .. }
            | SessionEntry::ModelChange { timestamp, .. }
            | SessionEntry::ThinkingLevelChange { timestamp, .. }
            | SessionEntry::Compaction { timestamp, .. }
            | SessionEntry::BranchSummary { timestamp, .. }
            | SessionEntry::Label { timestamp, .. }
            | SessionEntry::Custom { timestamp, .. } => *timestamp,
        }
    }
}

/// The state a session replays into: enough to resume an [`crate::agent::Agent`]
/// (§4.9 "`loadSession(entries) -> { model, thinkingLevel, messages }`").
#[derive(Debug, Clone)]
pub struct LoadedSession {
    pub model_id: Option<String>,
    pub thinking_level: ThinkingLevel,
    pub messages: Vec<Message>,
}

/// Replays `entries` into a [`LoadedSession`]. The first entry must be a
/// [`SessionEntry::Session`] header; every `Compaction` collapses the
/// messages accumulated so far into its summary, and a trailing
/// `BranchSummary` overrides whatever compaction preceded it (callers use
/// it to reconstruct an older branch explicitly).
pub fn load_session(entries: &[SessionEntry]) -> Result<LoadedSession> {
    let mut iter = entries.iter();
    let header = match iter.next() {
        Some(SessionEntry::Session { header }) => header.clone(),
        Some(_) => return Err(Error::session("first entry must be a session header")),
        None => return Err(Error::session("empty session log")),
    };

    let mut model_id = Some(header.model_id);
    let mut thinking_level = header.thinking_level;
    let mut messages: Vec<Message> = Vec::new();

    for entry in iter {
        match entry {
            SessionEntry::Session { .. } => {
                return Err(Error::session("duplicate session header"));
            }
            SessionEntry::Message { message, .. } => messages.push(message.clone()),
            SessionEntry::ModelChange {
                model_id: new_model,
                ..
            } => model_id = Some(new_model.clone()),
            SessionEntry::ThinkingLevelChange { level, .. } => thinking_level = *level,
            SessionEntry::Compaction {
                prefix_len,
                summary,
                ..
            } => {
                let prefix_len = (*prefix_len).min(messages.len());
                messages.splice(..prefix_len, std::iter::once(summary.clone()));
            }
            SessionEntry::BranchSummary { summary, .. } => {
                messages = vec![summary.clone()];
            }
            SessionEntry::Label { .. } | SessionEntry::Custom { .. } => {}
        }
    }

    Ok(LoadedSession {
        model_id,
        thinking_level,
        messages,
    })
}

/// Single-writer append-only handle for one session file (§5 "a single
/// writer per session file").
pub struct SessionWriter {
    file: tokio::fs::File,
}

impl SessionWriter {
    /// Opens `path` for append, writing `header` first if the file is new
    /// (empty). Reopening an existing file for continued writing does not
    /// rewrite the header.
    pub async fn open(path: impl AsRef<Path>, header: SessionHeader) -> Result<Self> {
        let path = path.as_ref();
        let is_new = !tokio::fs::try_exists(path).await.unwrap_or(false);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| Error::session(format!("failed to open session file: {e}")))?;
        let mut writer = Self { file };
        if is_new {
            writer.append(&SessionEntry::Session { header }).await?;
        }
        Ok(writer)
    }

    /// Appends one JSON-encoded entry followed by a newline.
    pub async fn append(&mut self, entry: &SessionEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::session(format!("failed to append session entry: {e}")))?;
        Ok(())
    }
}

/// Reads every entry from a session file (§5 "readers may re-read on
/// demand"). Independent of any open [`SessionWriter`] on the same path.
pub async fn read_entries(path: impl AsRef<Path>) -> Result<Vec<SessionEntry>> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::session(format!("failed to open session file: {e}")))?;
    let mut lines = BufReader::new(file).lines();
    let mut entries = Vec::new();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| Error::session(format!("failed to read session file: {e}")))?
    {
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(&line)?);
    }
    Ok(entries)
}

/// Builds the header entry for a fresh session against `model`, stamped at
/// `timestamp` (callers supply this since `Utc::now()` isn't available to
/// pure helpers in this crate's replay-safety model — see
/// [`crate::agent::Agent`]'s caller for how a live session stamps its own).
pub fn header(
    id: impl Into<String>,
    timestamp: DateTime<Utc>,
    cwd: impl Into<String>,
    model: &ModelDescriptor,
    thinking_level: ThinkingLevel,
) -> SessionHeader {
    SessionHeader {
        id: id.into(),
        timestamp,
        cwd: cwd.into(),
        provider: model.provider.clone(),
        model_id: model.id.clone(),
        thinking_level,
    }
}
