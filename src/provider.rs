//! Upstream mail provider abstraction.
//!
//! A [`MailProvider`] lists messages page by page behind an opaque cursor
//! and fetches full bodies on demand. Payloads follow the Microsoft Graph
//! message shape; [`normalize`] turns one into a [`NewMessage`] ready for
//! the store.
//!
//! Two implementations ship with the crate:
//!
//! - [`crate::provider_graph::GraphProvider`] talks to Microsoft Graph.
//! - [`crate::provider_dir::DirectoryProvider`] reads exported Graph JSON
//!   files from disk (offline runs, demos, tests).

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::Config;
use crate::extract::{body_to_text, preview};
use crate::models::{Address, Importance, NewMessage, User};
use crate::provider_dir::DirectoryProvider;
use crate::provider_graph::GraphProvider;

/// Characters kept in a message's stored preview.
pub const BODY_PREVIEW_CHARS: usize = 500;

/// Folder names whose messages were sent by the mailbox owner.
const SENT_FOLDERS: &[&str] = &["sent", "sentitems", "sent items"];

/// Provider-level failures. Each variant asks the caller for a different reaction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("provider credentials expired: {0}")]
    AuthExpired(String),
    #[error("not found upstream: {0}")]
    NotFound(String),
    #[error("transient provider failure: {0}")]
    Transient(String),
}

impl ProviderError {
    /// Whether retrying the same call without caller intervention may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_) | ProviderError::RateLimited { .. }
        )
    }
}

/// One page of a folder listing.
#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub messages: Vec<RawMessage>,
    /// Token for the following page; `None` once the listing is exhausted.
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &str;

    /// List up to `limit` messages of `folder`, starting at `cursor`
    /// (`None` means the beginning of the folder).
    async fn list_messages(
        &self,
        cursor: Option<&str>,
        folder: &str,
        limit: usize,
    ) -> Result<MessagePage, ProviderError>;

    /// Fetch the full body of one message.
    async fn get_message_body(&self, provider_id: &str) -> Result<RawBody, ProviderError>;
}

// ============ Graph payload shape ============

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub id: Option<String>,
    pub conversation_id: Option<String>,
    pub subject: Option<String>,
    pub sender: Option<RawRecipient>,
    pub from: Option<RawRecipient>,
    pub to_recipients: Option<Vec<RawRecipient>>,
    pub cc_recipients: Option<Vec<RawRecipient>>,
    pub bcc_recipients: Option<Vec<RawRecipient>>,
    pub body: Option<RawBody>,
    pub body_preview: Option<String>,
    pub received_date_time: Option<String>,
    pub sent_date_time: Option<String>,
    pub importance: Option<String>,
    pub is_read: Option<bool>,
    pub is_draft: Option<bool>,
    pub has_attachments: Option<bool>,
    pub categories: Option<Vec<String>>,
    pub parent_folder_id: Option<String>,
}

impl RawMessage {
    /// Listings may omit bodies; those must be fetched separately.
    pub fn needs_body(&self) -> bool {
        self.body
            .as_ref()
            .and_then(|b| b.content.as_ref())
            .is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecipient {
    pub email_address: Option<RawEmailAddress>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawEmailAddress {
    pub address: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBody {
    pub content_type: Option<String>,
    pub content: Option<String>,
}

impl From<&RawRecipient> for Address {
    fn from(r: &RawRecipient) -> Self {
        let email = r.email_address.clone().unwrap_or_default();
        Address {
            address: email.address.unwrap_or_default().trim().to_string(),
            name: email.name.unwrap_or_default().trim().to_string(),
        }
    }
}

fn addresses(list: &Option<Vec<RawRecipient>>) -> Vec<Address> {
    list.as_deref()
        .unwrap_or_default()
        .iter()
        .map(Address::from)
        .filter(|a| !a.address.is_empty() || !a.name.is_empty())
        .collect()
}

fn parse_timestamp(field: &str, value: &str) -> Result<i64, String> {
    chrono::DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.timestamp())
        .map_err(|e| format!("invalid {} '{}': {}", field, value, e))
}

/// Whether messages of `folder` were sent by the mailbox owner.
pub fn is_sent_folder(folder: &str) -> bool {
    SENT_FOLDERS.contains(&folder.trim().to_lowercase().as_str())
}

/// Turn a provider payload into a storable message.
///
/// `body` replaces the payload's own body when it was fetched separately.
/// Errors describe why this one message is unusable; they never abort a batch.
pub fn normalize(
    raw: &RawMessage,
    folder: &str,
    body: Option<RawBody>,
) -> Result<NewMessage, String> {
    let provider_id = raw
        .id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| "missing required field 'id'".to_string())?
        .to_string();

    let received_at = match (&raw.received_date_time, &raw.sent_date_time) {
        (Some(received), _) => parse_timestamp("receivedDateTime", received)?,
        (None, Some(sent)) => parse_timestamp("sentDateTime", sent)?,
        (None, None) => return Err("missing required field 'receivedDateTime'".to_string()),
    };
    let sent_at = match &raw.sent_date_time {
        Some(sent) => Some(parse_timestamp("sentDateTime", sent)?),
        None => None,
    };

    let body = body.or_else(|| raw.body.clone()).unwrap_or_default();
    let content_type = body
        .content_type
        .unwrap_or_else(|| "text".to_string())
        .to_lowercase();
    let content = body.content.unwrap_or_default();
    let body_text = body_to_text(&content, &content_type);
    let body_html = if content_type == "html" && !content.is_empty() {
        Some(content)
    } else {
        None
    };
    let body_preview = if body_text.is_empty() {
        preview(raw.body_preview.as_deref().unwrap_or_default().trim(), BODY_PREVIEW_CHARS)
    } else {
        preview(&body_text, BODY_PREVIEW_CHARS)
    };

    let sender = raw
        .sender
        .as_ref()
        .or(raw.from.as_ref())
        .map(Address::from)
        .unwrap_or_default();

    Ok(NewMessage {
        provider_id,
        conversation_key: raw
            .conversation_id
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string),
        subject: raw.subject.clone().unwrap_or_default().trim().to_string(),
        sender,
        to: addresses(&raw.to_recipients),
        cc: addresses(&raw.cc_recipients),
        bcc: addresses(&raw.bcc_recipients),
        body_content_type: content_type,
        body_html,
        body_text,
        body_preview,
        importance: Importance::parse(raw.importance.as_deref().unwrap_or("normal")),
        is_read: raw.is_read.unwrap_or(false),
        is_draft: raw.is_draft.unwrap_or(false),
        has_attachments: raw.has_attachments.unwrap_or(false),
        is_sent_item: is_sent_folder(folder),
        folder: folder.to_string(),
        categories: raw.categories.clone().unwrap_or_default(),
        received_at,
        sent_at,
    })
}

/// Build the configured provider for one mailbox owner.
pub fn create_provider(config: &Config, user: &User) -> Result<Arc<dyn MailProvider>> {
    match config.provider.kind.as_str() {
        "graph" => {
            let graph = config.provider.graph.clone().unwrap_or_default();
            Ok(Arc::new(GraphProvider::from_env(&graph, config.sync.timeout_secs)?))
        }
        "directory" => {
            let dir = config
                .provider
                .directory
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("Directory provider not configured"))?;
            Ok(Arc::new(DirectoryProvider::for_user(dir, &user.email)?))
        }
        other => anyhow::bail!("Unknown mail provider: {}", other),
    }
}
