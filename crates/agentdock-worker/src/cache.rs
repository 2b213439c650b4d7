//! Append-only transcript cache: one JSONL file per conversation.

use std::path::{Path, PathBuf};

use agentdock_common::SdkMessage;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedConversation {
    pub conversation_id: String,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct TranscriptCache {
    dir: PathBuf,
}

fn valid_conversation_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl TranscriptCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, conversation_id: &str) -> Option<PathBuf> {
        valid_conversation_id(conversation_id)
            .then(|| self.dir.join(format!("{}.jsonl", conversation_id)))
    }

    /// Append one message. Partial `stream_event` messages are not cached.
    pub async fn append(&self, conversation_id: &str, message: &SdkMessage) -> Result<()> {
        if matches!(message, SdkMessage::StreamEvent(_)) {
            return Ok(());
        }
        let path = self
            .path_for(conversation_id)
            .with_context(|| format!("Invalid conversation id '{}'", conversation_id))?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Every cached conversation, most recently modified first.
    pub async fn list(&self) -> Result<Vec<CachedConversation>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to read message cache"),
        };

        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let meta = entry.metadata().await?;
            out.push(CachedConversation {
                conversation_id: stem.to_string(),
                size: meta.len(),
                modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        out.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
        Ok(out)
    }

    /// Cached messages for one conversation, skipping unparseable lines.
    pub async fn read(&self, conversation_id: &str) -> Result<Vec<SdkMessage>> {
        let path = self
            .path_for(conversation_id)
            .with_context(|| format!("Invalid conversation id '{}'", conversation_id))?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
