//! Microsoft Graph mail provider.
//!
//! Lists a mail folder with `GET /me/mailFolders/{folder}/messages` and
//! follows `@odata.nextLink` as the cursor. Bodies are fetched with
//! `GET /me/messages/{id}`.
//!
//! HTTP status mapping:
//! - 401 → [`ProviderError::AuthExpired`]
//! - 404 → [`ProviderError::NotFound`]
//! - 429 → [`ProviderError::RateLimited`] using the `Retry-After` header
//! - 5xx, network errors, timeouts → [`ProviderError::Transient`]
//!
//! Any other 4xx is reported as `Transient` with the response text so it
//! reaches the sync result, and the retry budget bounds it.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::GraphProviderConfig;
use crate::provider::{MailProvider, MessagePage, ProviderError, RawBody, RawMessage};

/// Fields requested for listings.
const SELECT_FIELDS: &str = "id,conversationId,subject,sender,from,toRecipients,ccRecipients,bccRecipients,body,bodyPreview,receivedDateTime,sentDateTime,importance,isRead,isDraft,hasAttachments,categories,parentFolderId";

/// Delay assumed when a 429 arrives without `Retry-After`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

pub struct GraphProvider {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    value: Vec<RawMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BodyResponse {
    body: Option<RawBody>,
}

impl GraphProvider {
    pub fn new(base_url: &str, token: String, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Read the access token from the configured environment variable.
    pub fn from_env(config: &GraphProviderConfig, timeout_secs: u64) -> Result<Self> {
        let token = match std::env::var(&config.token_env) {
            Ok(t) if !t.trim().is_empty() => t,
            _ => bail!("{} environment variable not set", config.token_env),
        };
        Self::new(&config.base_url, token, timeout_secs)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, ProviderError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .header("Prefer", "outlook.body-content-type=\"html\"")
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("request to Graph failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| ProviderError::Transient(format!("invalid Graph response: {}", e)));
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body_text = response.text().await.unwrap_or_default();
        Err(classify_status(status.as_u16(), retry_after, &body_text))
    }
}

/// Map a non-success Graph status to the provider error taxonomy.
pub(crate) fn classify_status(status: u16, retry_after: Option<u64>, body: &str) -> ProviderError {
    match status {
        401 => ProviderError::AuthExpired(format!("Graph returned 401: {}", body)),
        404 => ProviderError::NotFound(format!("Graph returned 404: {}", body)),
        429 => ProviderError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS),
        },
        _ => ProviderError::Transient(format!("Graph returned {}: {}", status, body)),
    }
}

#[async_trait]
impl MailProvider for GraphProvider {
    fn name(&self) -> &str {
        "graph"
    }

    async fn list_messages(
        &self,
        cursor: Option<&str>,
        folder: &str,
        limit: usize,
    ) -> Result<MessagePage, ProviderError> {
        // nextLink already carries every query parameter
        let url = match cursor {
            Some(next) if next.starts_with("http") => next.to_string(),
            _ => format!(
                "{}/me/mailFolders/{}/messages?$top={}&$orderby=receivedDateTime%20desc&$select={}",
                self.base_url, folder, limit, SELECT_FIELDS
            ),
        };

        let page: ListResponse = self.get_json(&url).await?;
        Ok(MessagePage {
            messages: page.value,
            next_cursor: page.next_link,
        })
    }

    async fn get_message_body(&self, provider_id: &str) -> Result<RawBody, ProviderError> {
        let url = format!("{}/me/messages/{}?$select=body", self.base_url, provider_id);
        let response: BodyResponse = self.get_json(&url).await?;
        Ok(response.body.unwrap_or_default())
    }
}
