//! Caller-facing pipeline API.
//!
//! [`Pipeline`] owns the collaborators (store, provider factory, LLM,
//! vector index) and exposes the operations a request layer or the CLI
//! calls: `trigger_sync`, `ask`, `get_thread`, and the direct user actions.
//!
//! ```text
//! trigger_sync:  Sync ──▶ Threads ──▶ Enrich (+ Index) ──▶ Threads
//! ask:           Classify ──▶ Gather ──▶ Generate ──▶ Persist
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::assistant::{AnswerResult, Assistant, ContextRef, Retrieved};
use crate::cancel::Cancellation;
use crate::config::Config;
use crate::db;
use crate::enrich::{EnrichBatchResult, Enricher, EnrichmentEngine};
use crate::index::{SearchHit, VectorIndex};
use crate::intent::Intent;
use crate::llm::{self, LlmClient};
use crate::migrate;
use crate::models::{ChatExchange, Enrichment, ThreadView, User};
use crate::provider::{self, MailProvider};
use crate::store::MessageStore;
use crate::sync::{SyncEngine, SyncError, SyncResult};
use crate::threads::{self, RebuildStats};

/// Builds the upstream provider for a user.
pub type ProviderFactory =
    Arc<dyn Fn(&Config, &User) -> Result<Arc<dyn MailProvider>> + Send + Sync>;

/// Everything one `trigger_sync` call did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub sync: SyncResult,
    pub threads: RebuildStats,
    pub enrichment: EnrichBatchResult,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexReport {
    pub indexed: usize,
    pub failed: usize,
}

pub struct Pipeline {
    config: Config,
    store: MessageStore,
    providers: ProviderFactory,
    index: Option<Arc<VectorIndex>>,
    enrichment: EnrichmentEngine,
    assistant: Assistant,
}

impl Pipeline {
    pub fn new(
        config: Config,
        store: MessageStore,
        providers: ProviderFactory,
        llm: Arc<dyn LlmClient>,
        index: Option<Arc<VectorIndex>>,
    ) -> Self {
        let llm_timeout = Duration::from_secs(config.llm.timeout_secs);
        let enricher = Arc::new(Enricher::new(
            llm.clone(),
            llm_timeout,
            config.enrichment.prompt_preview_chars,
        ));
        let enrichment = EnrichmentEngine::new(
            store.clone(),
            enricher,
            index.clone(),
            config.enrichment.concurrency,
        );
        let assistant = Assistant::new(
            store.clone(),
            llm,
            index.clone(),
            config.retrieval.clone(),
            llm_timeout,
        );
        Self {
            config,
            store,
            providers,
            index,
            enrichment,
            assistant,
        }
    }

    /// Connect, migrate, and build every collaborator from configuration.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool).await?;
        let llm = llm::create_llm(&config.llm)?;
        let index = VectorIndex::from_config(&config.embedding, pool.clone())?.map(Arc::new);
        Ok(Self::new(
            config.clone(),
            MessageStore::new(pool),
            Arc::new(|config: &Config, user: &User| provider::create_provider(config, user)),
            llm,
            index,
        ))
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn index(&self) -> Option<&Arc<VectorIndex>> {
        self.index.as_ref()
    }

    /// Sync one folder, thread what arrived, then enrich and index the new messages.
    ///
    /// Whatever the sync committed is threaded, enriched and indexed even when
    /// the run was cancelled or a provider failure cut it short; the failure
    /// is then returned with the partial result.
    pub async fn trigger_sync(
        &self,
        user_id: i64,
        folder: Option<&str>,
        max_batch: Option<usize>,
        cancel: &Cancellation,
    ) -> Result<SyncReport, SyncError> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .filter(|u| u.is_active)
            .ok_or(SyncError::UnknownUser(user_id))?;
        let provider = (self.providers)(&self.config, &user)?;

        let folder = folder.unwrap_or(&self.config.sync.default_folder);
        let max_batch = max_batch.unwrap_or(self.config.sync.max_batch);

        let engine = SyncEngine::new(self.store.clone(), provider, self.config.sync.clone());
        let sync = match engine.sync(user_id, folder, max_batch, cancel).await {
            Ok(result) => result,
            Err(SyncError::Provider { error, partial }) => {
                if let Err(e) = self.process_committed(user_id, &partial.new_message_ids).await {
                    warn!(user_id, error = %e, "Processing messages from a failed sync did not complete");
                }
                return Err(SyncError::Provider { error, partial });
            }
            Err(e) => return Err(e),
        };

        let (threads, enrichment) = self.process_committed(user_id, &sync.new_message_ids).await?;
        let report = SyncReport {
            sync,
            threads,
            enrichment,
        };
        info!(
            user_id,
            new = report.sync.new_count,
            threads = report.threads.recomputed,
            enriched = report.enrichment.enriched,
            indexed = report.enrichment.indexed,
            "Pipeline sync complete"
        );
        Ok(report)
    }

    /// Thread, enrich and index messages a sync has already committed.
    ///
    /// Runs under its own cancellation: a cancelled sync stops fetching, but
    /// the pages it stored are still brought up to date.
    async fn process_committed(
        &self,
        user_id: i64,
        new_ids: &[i64],
    ) -> Result<(RebuildStats, EnrichBatchResult)> {
        let mut threads = threads::rebuild_threads(&self.store, user_id).await?;
        if new_ids.is_empty() {
            return Ok((threads, EnrichBatchResult::default()));
        }
        let enrichment = self
            .enrichment
            .enrich_batch(user_id, new_ids, &Cancellation::new())
            .await?;
        threads.recomputed += threads::rebuild_threads(&self.store, user_id).await?.recomputed;
        Ok((threads, enrichment))
    }

    /// One assistant turn. Errors only when the user does not exist.
    pub async fn ask(
        &self,
        user_id: i64,
        query: &str,
        context_ref: Option<&ContextRef>,
    ) -> Result<AnswerResult> {
        let user = self.active_user(user_id).await?;
        Ok(self.assistant.answer(&user, query, context_ref).await)
    }

    /// Context selection only, as `ask` would do it.
    pub async fn search(&self, user_id: i64, query: &str) -> Result<Retrieved> {
        let user = self.active_user(user_id).await?;
        Ok(self
            .assistant
            .retrieve(user.id, query, Intent::classify(query), None)
            .await)
    }

    pub async fn get_thread(&self, user_id: i64, conversation_key: &str) -> Result<Option<ThreadView>> {
        threads::get_thread(&self.store, user_id, conversation_key).await
    }

    /// Set a message's read flag and refresh its thread. `false` when the
    /// user has no such message.
    pub async fn mark_read(&self, user_id: i64, message_id: i64, is_read: bool) -> Result<bool> {
        if !self.store.set_read(user_id, message_id, is_read).await? {
            return Ok(false);
        }
        self.refresh_thread_of(user_id, message_id).await?;
        Ok(true)
    }

    /// Force re-enrichment (and re-indexing) of one message.
    pub async fn reenrich(&self, user_id: i64, message_id: i64) -> Result<Option<Enrichment>> {
        let enrichment = self.enrichment.reenrich(user_id, message_id).await?;
        if enrichment.is_some() {
            self.refresh_thread_of(user_id, message_id).await?;
        }
        Ok(enrichment)
    }

    /// Delete a message: its vectors go first, then the row, then the
    /// thread is recomputed (or removed when it became empty).
    pub async fn delete_message(&self, user_id: i64, message_id: i64) -> Result<bool> {
        let Some(msg) = self.store.get_message(user_id, message_id).await? else {
            return Ok(false);
        };

        if let Some(index) = &self.index {
            index
                .delete(message_id)
                .await
                .with_context(|| format!("removing vectors of message {}", message_id))?;
        }

        let deleted = self.store.delete_message(user_id, message_id).await?;
        if let Some(thread_id) = msg.thread_id {
            threads::refresh_thread(&self.store, thread_id).await?;
        }
        Ok(deleted)
    }

    /// Soft-deactivate a user. Their data stays; syncs and turns are refused.
    pub async fn deactivate_user(&self, user_id: i64) -> Result<bool> {
        self.store.deactivate_user(user_id).await
    }

    /// Enrich messages that were never enriched (e.g. after an interrupted batch).
    pub async fn enrich_pending(
        &self,
        user_id: i64,
        limit: usize,
        cancel: &Cancellation,
    ) -> Result<EnrichBatchResult> {
        let ids = self.store.unenriched_message_ids(user_id, limit).await?;
        if ids.is_empty() {
            return Ok(EnrichBatchResult::default());
        }
        let result = self.enrichment.enrich_batch(user_id, &ids, cancel).await?;
        threads::rebuild_threads(&self.store, user_id).await?;
        Ok(result)
    }

    /// Index enriched messages whose vector is missing or older than their enrichment.
    pub async fn index_pending(&self, user_id: i64, limit: usize) -> Result<IndexReport> {
        let Some(index) = &self.index else {
            bail!("Embeddings are disabled; set [embedding] provider to index messages");
        };
        let ids = self.store.unindexed_message_ids(user_id, limit).await?;
        let messages = self.store.messages_by_ids(user_id, &ids).await?;

        let mut report = IndexReport::default();
        for msg in &messages {
            match index.upsert(msg).await {
                Ok(()) => {
                    self.store
                        .mark_indexed(msg.id, chrono::Utc::now().timestamp())
                        .await?;
                    report.indexed += 1;
                }
                Err(e) => {
                    warn!(user_id, message_id = msg.id, error = %e, "Indexing failed");
                    report.failed += 1;
                }
            }
        }
        info!(user_id, indexed = report.indexed, failed = report.failed, "Index backfill complete");
        Ok(report)
    }

    pub async fn similar(&self, user_id: i64, message_id: i64, k: usize) -> Result<Vec<SearchHit>> {
        let Some(index) = &self.index else {
            return Ok(Vec::new());
        };
        Ok(index.similar(user_id, message_id, k).await?)
    }

    pub async fn recent_exchanges(&self, user_id: i64, limit: usize) -> Result<Vec<ChatExchange>> {
        self.store.recent_exchanges(user_id, limit).await
    }

    async fn active_user(&self, user_id: i64) -> Result<User> {
        match self.store.get_user(user_id).await? {
            Some(user) if user.is_active => Ok(user),
            Some(_) => bail!("User {} is deactivated", user_id),
            None => bail!("Unknown user {}", user_id),
        }
    }

    async fn refresh_thread_of(&self, user_id: i64, message_id: i64) -> Result<()> {
        if let Some(thread_id) = self
            .store
            .get_message(user_id, message_id)
            .await?
            .and_then(|m| m.thread_id)
        {
            threads::refresh_thread(&self.store, thread_id).await?;
        }
        Ok(())
    }
}
