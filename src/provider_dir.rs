//! Directory-backed mail provider.
//!
//! Reads exported Graph message JSON from a local directory tree. Each file
//! holds either one message object or an array of them. Files are visited in
//! path order, so the cursor is simply a decimal offset into that ordering.
//!
//! Layout:
//!
//! ```text
//! root/
//!   ana@example.com/      # optional per-user subdirectory
//!     inbox/              # optional per-folder subdirectory
//!       2024-03-01.json
//! ```
//!
//! When the per-user or per-folder directory is absent the level above is
//! used instead.

use anyhow::{bail, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use crate::config::DirectoryProviderConfig;
use crate::provider::{MailProvider, MessagePage, ProviderError, RawBody, RawMessage};

pub struct DirectoryProvider {
    root: PathBuf,
    include_set: GlobSet,
}

impl DirectoryProvider {
    pub fn new(root: &Path, include_globs: &[String]) -> Result<Self> {
        if !root.exists() {
            bail!("Directory provider root does not exist: {}", root.display());
        }
        Ok(Self {
            root: root.to_path_buf(),
            include_set: build_globset(include_globs)?,
        })
    }

    /// Provider rooted at the user's own subdirectory when one exists.
    pub fn for_user(config: &DirectoryProviderConfig, email: &str) -> Result<Self> {
        let user_root = config.root.join(email);
        let root = if user_root.is_dir() {
            user_root
        } else {
            config.root.clone()
        };
        Self::new(&root, &config.include_globs)
    }

    fn folder_root(&self, folder: &str) -> PathBuf {
        let candidate = self.root.join(folder);
        if !folder.is_empty() && candidate.is_dir() {
            candidate
        } else {
            self.root.clone()
        }
    }

    async fn load(&self, folder: &str) -> Result<Vec<RawMessage>, ProviderError> {
        let root = self.folder_root(folder);
        let include_set = self.include_set.clone();
        tokio::task::spawn_blocking(move || scan_messages(&root, &include_set))
            .await
            .map_err(|e| ProviderError::Transient(format!("directory scan aborted: {}", e)))?
    }
}

#[async_trait]
impl MailProvider for DirectoryProvider {
    fn name(&self) -> &str {
        "directory"
    }

    async fn list_messages(
        &self,
        cursor: Option<&str>,
        folder: &str,
        limit: usize,
    ) -> Result<MessagePage, ProviderError> {
        let all = self.load(folder).await?;

        let offset = match cursor {
            None => 0,
            Some(c) => c.parse::<usize>().unwrap_or_else(|_| {
                warn!(cursor = c, "Unrecognised directory cursor, starting over");
                0
            }),
        };
        let start = offset.min(all.len());
        let end = start.saturating_add(limit).min(all.len());

        Ok(MessagePage {
            messages: all[start..end].to_vec(),
            // Always hand back a position so files added later are picked up
            next_cursor: Some(end.to_string()),
        })
    }

    async fn get_message_body(&self, provider_id: &str) -> Result<RawBody, ProviderError> {
        let all = self.load("").await?;
        all.into_iter()
            .find(|m| m.id.as_deref() == Some(provider_id))
            .map(|m| m.body.unwrap_or_default())
            .ok_or_else(|| ProviderError::NotFound(provider_id.to_string()))
    }
}

fn scan_messages(root: &Path, include_set: &GlobSet) -> Result<Vec<RawMessage>, ProviderError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| ProviderError::Transient(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        if include_set.is_match(relative.to_string_lossy().as_ref()) {
            files.push(path.to_path_buf());
        }
    }

    // Sort for deterministic ordering
    files.sort();

    let mut messages = Vec::new();
    for path in files {
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ProviderError::Transient(format!("{}: {}", path.display(), e)))?;
        let value: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unparseable export file");
                continue;
            }
        };
        let items = match value {
            serde_json::Value::Array(items) => items,
            // Graph list responses wrap messages in "value"
            serde_json::Value::Object(mut obj) if obj.get("value").is_some_and(|v| v.is_array()) => {
                match obj.remove("value") {
                    Some(serde_json::Value::Array(items)) => items,
                    _ => Vec::new(),
                }
            }
            other => vec![other],
        };
        // A structurally wrong entry becomes an empty message and fails normalization downstream
        messages.extend(
            items
                .into_iter()
                .map(|item| serde_json::from_value::<RawMessage>(item).unwrap_or_default()),
        );
    }

    Ok(messages)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
