//! Sync Engine: pulls pages from the upstream provider into the store.
//!
//! # Flow
//!
//! ```text
//! acquire per-user lease
//!   └─ loop over pages until max_batch (a page is never split)
//!        ├─ list_messages(cursor)          timeout + retry policy
//!        ├─ per message: fetch body if absent, normalize
//!        │     (per-message failures land in `errors`)
//!        └─ one transaction: upsert page + advance cursor
//! release lease
//! ```
//!
//! A page and the cursor that follows it are committed together, so an
//! interrupted run resumes at the last committed page. Re-fetching a page is
//! harmless: messages are keyed by `(user_id, provider_id)` and only their
//! mutable flags are refreshed.

use anyhow::Context;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cancel::Cancellation;
use crate::config::SyncConfig;
use crate::models::NewMessage;
use crate::provider::{normalize, MailProvider, MessagePage, ProviderError, RawBody};
use crate::store::{self, MessageStore, UpsertOutcome};

/// One message that could not be stored.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SyncItemError {
    pub provider_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncResult {
    pub new_count: usize,
    /// Existing messages whose mutable flags changed.
    pub updated_count: usize,
    pub unchanged_count: usize,
    pub errors: Vec<SyncItemError>,
    /// Ids of inserted rows, in fetch order. These are the enrichment candidates.
    pub new_message_ids: Vec<i64>,
    pub pages: usize,
    pub cancelled: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("a sync is already running for user {0}")]
    Busy(i64),
    #[error("user {0} does not exist or is inactive")]
    UnknownUser(i64),
    /// The provider failed as a whole. `partial` holds what was committed before.
    #[error("provider failure: {error}")]
    Provider {
        #[source]
        error: ProviderError,
        partial: SyncResult,
    },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub struct SyncEngine {
    store: MessageStore,
    provider: Arc<dyn MailProvider>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(store: MessageStore, provider: Arc<dyn MailProvider>, config: SyncConfig) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    /// Sync about `max_batch` messages of `folder` for one user.
    ///
    /// Pages are requested so that they end at `max_batch`, but a page is
    /// always stored whole, so a provider that ignores the requested size can
    /// push the run past `max_batch` by at most one page.
    ///
    /// Runs are serialized per user through a lease row; a concurrent call
    /// for the same user returns [`SyncError::Busy`] immediately.
    pub async fn sync(
        &self,
        user_id: i64,
        folder: &str,
        max_batch: usize,
        cancel: &Cancellation,
    ) -> Result<SyncResult, SyncError> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .filter(|u| u.is_active)
            .ok_or(SyncError::UnknownUser(user_id))?;

        let holder = uuid::Uuid::new_v4().to_string();
        if !self.acquire_lease(user_id, &holder).await? {
            return Err(SyncError::Busy(user_id));
        }

        let outcome = self
            .run(user_id, user.last_sync_cursor, folder, max_batch, cancel)
            .await;

        if let Err(e) = self.release_lease(user_id, &holder).await {
            warn!(user_id, error = %e, "Failed to release sync lease; it will expire");
        }

        match &outcome {
            Ok(result) => info!(
                user_id,
                folder,
                new = result.new_count,
                updated = result.updated_count,
                errors = result.errors.len(),
                pages = result.pages,
                cancelled = result.cancelled,
                "Sync finished"
            ),
            Err(e) => warn!(user_id, folder, error = %e, "Sync stopped"),
        }
        outcome
    }

    async fn run(
        &self,
        user_id: i64,
        start_cursor: Option<String>,
        folder: &str,
        max_batch: usize,
        cancel: &Cancellation,
    ) -> Result<SyncResult, SyncError> {
        let mut result = SyncResult::default();
        let mut cursor = start_cursor;
        let mut fetched = 0usize;

        while fetched < max_batch {
            if cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }

            let limit = self.config.page_size.min(max_batch - fetched);
            let page = match self.list_page(cursor.as_deref(), folder, limit).await {
                Ok(page) => page,
                Err(error) => {
                    return Err(SyncError::Provider {
                        error,
                        partial: result,
                    })
                }
            };
            debug!(user_id, page = result.pages, count = page.messages.len(), "Fetched page");

            if page.messages.is_empty() {
                self.commit_page(user_id, &[], Some(page.next_cursor.as_deref()), &mut result)
                    .await?;
                break;
            }

            // The whole page is processed even when the provider sent more than
            // `limit`: the cursor that follows it skips everything on it.
            // Normalize outside the write transaction; bodies may need network calls
            let mut prepared = Vec::with_capacity(page.messages.len());
            let mut complete = true;
            for raw in &page.messages {
                if cancel.is_cancelled() {
                    result.cancelled = true;
                    complete = false;
                    break;
                }

                let body = if raw.needs_body() {
                    match raw.id.as_deref() {
                        Some(id) => match self.fetch_body(id).await {
                            Ok(body) => Some(body),
                            Err(ProviderError::NotFound(_)) => {
                                result.errors.push(SyncItemError {
                                    provider_id: Some(id.to_string()),
                                    reason: "message body not found upstream".to_string(),
                                });
                                continue;
                            }
                            Err(error) => {
                                // Nothing from this page is committed; the cursor stays put
                                return Err(SyncError::Provider {
                                    error,
                                    partial: result,
                                });
                            }
                        },
                        None => None,
                    }
                } else {
                    None
                };

                match normalize(raw, folder, body) {
                    Ok(msg) => prepared.push(msg),
                    Err(reason) => {
                        warn!(user_id, provider_id = ?raw.id, %reason, "Skipping malformed message");
                        result.errors.push(SyncItemError {
                            provider_id: raw.id.clone(),
                            reason,
                        });
                    }
                }
            }

            let next_cursor = page.next_cursor.clone();
            // A partially processed page is stored, but the cursor stays so the rest is re-fetched
            let cursor_update = complete.then_some(next_cursor.as_deref());
            self.commit_page(user_id, &prepared, cursor_update, &mut result)
                .await?;

            fetched += page.messages.len();
            result.pages += 1;

            if !complete || next_cursor.is_none() || next_cursor == cursor {
                break;
            }
            cursor = next_cursor;
        }

        Ok(result)
    }

    /// Write one page and, when given, the cursor that follows it, atomically.
    async fn commit_page(
        &self,
        user_id: i64,
        messages: &[NewMessage],
        cursor: Option<Option<&str>>,
        result: &mut SyncResult,
    ) -> anyhow::Result<()> {
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .context("starting sync transaction")?;

        let mut outcomes = Vec::with_capacity(messages.len());
        for msg in messages {
            let outcome = store::upsert_message(&mut tx, user_id, msg)
                .await
                .with_context(|| format!("storing message {}", msg.provider_id))?;
            outcomes.push(outcome);
        }

        if let Some(cursor) = cursor {
            store::advance_cursor(&mut tx, user_id, cursor, chrono::Utc::now().timestamp())
                .await?;
        }

        tx.commit().await.context("committing sync page")?;

        for outcome in outcomes {
            match outcome {
                UpsertOutcome::Inserted(id) => {
                    result.new_count += 1;
                    result.new_message_ids.push(id);
                }
                UpsertOutcome::Updated(_) => result.updated_count += 1,
                UpsertOutcome::Unchanged(_) => result.unchanged_count += 1,
            }
        }
        Ok(())
    }

    async fn list_page(
        &self,
        cursor: Option<&str>,
        folder: &str,
        limit: usize,
    ) -> Result<MessagePage, ProviderError> {
        let provider: &dyn MailProvider = self.provider.as_ref();
        self.with_retry("list_messages", move || {
            provider.list_messages(cursor, folder, limit)
        })
        .await
    }

    async fn fetch_body(&self, provider_id: &str) -> Result<RawBody, ProviderError> {
        let provider: &dyn MailProvider = self.provider.as_ref();
        self.with_retry("get_message_body", move || {
            provider.get_message_body(provider_id)
        })
        .await
    }

    /// Apply the timeout and retry policy to one provider call.
    ///
    /// - `Transient` (including timeouts): exponential backoff from `retry_base_ms`.
    /// - `RateLimited`: wait the provider's delay when it is within `max_rate_limit_wait_secs`.
    /// - `AuthExpired` and `NotFound`: returned immediately.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let mut attempt = 0u32;

        loop {
            let outcome = match tokio::time::timeout(timeout, call()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ProviderError::Transient(format!(
                    "{} timed out after {}s",
                    what, self.config.timeout_secs
                ))),
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if attempt >= self.config.max_retries {
                return Err(err);
            }

            let delay = match &err {
                ProviderError::Transient(reason) => {
                    let delay = Duration::from_millis(
                        self.config.retry_base_ms.saturating_mul(1 << attempt.min(5)),
                    );
                    warn!(call = what, attempt, %reason, ?delay, "Transient provider error, retrying");
                    Some(delay)
                }
                ProviderError::RateLimited { retry_after_secs }
                    if *retry_after_secs <= self.config.max_rate_limit_wait_secs =>
                {
                    warn!(call = what, attempt, retry_after_secs, "Rate limited, waiting");
                    Some(Duration::from_secs(*retry_after_secs))
                }
                _ => None,
            };

            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => return Err(err),
            }
            attempt += 1;
        }
    }

    async fn acquire_lease(&self, user_id: i64, holder: &str) -> anyhow::Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let expires_at = now + self.config.lease_secs as i64;
        let result = sqlx::query(
            r#"
            INSERT INTO sync_leases (user_id, holder, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                holder = excluded.holder,
                expires_at = excluded.expires_at
            WHERE sync_leases.expires_at < ?
            "#,
        )
        .bind(user_id)
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .execute(self.store.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, user_id: i64, holder: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM sync_leases WHERE user_id = ? AND holder = ?")
            .bind(user_id)
            .bind(holder)
            .execute(self.store.pool())
            .await?;
        Ok(())
    }
}
