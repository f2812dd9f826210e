//! Vector index over enriched messages.
//!
//! Each message becomes one embedded document in a fixed field order:
//!
//! ```text
//! Subject: ...
//! From: Name <addr>
//! To: Name <addr>, ...
//! Content: <body, truncated>
//! Summary: <enrichment summary>
//! ```
//!
//! The order is part of the format: re-indexing the same message with the
//! same enrichment reproduces the same document and the same record id.
//! Records for one message are replaced, never accumulated: upserts for the
//! same `message_id` are serialized and delete the prior record before
//! inserting the new one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::debug;

use crate::config::EmbeddingConfig;
use crate::embedding::{self, EmbeddingProvider};
use crate::extract::truncate_chars;
use crate::models::Message;
use crate::vector_store::sqlite::SqliteVectorStore;
use crate::vector_store::{VectorFilter, VectorMetadata, VectorRecord, VectorStore};

#[derive(Debug, Error)]
pub enum IndexError {
    /// Embedding service or vector store unreachable, timed out, or disabled.
    #[error("vector index unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// One search result. `score` is `1 - cosine distance`.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub message_id: i64,
    pub score: f32,
    pub metadata: VectorMetadata,
}

pub struct VectorIndex {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    body_chars: usize,
    timeout: Duration,
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl VectorIndex {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        body_chars: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            embedder,
            body_chars,
            timeout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// SQLite-backed index for the configured embedder, or `None` when
    /// embeddings are disabled.
    pub fn from_config(config: &EmbeddingConfig, pool: SqlitePool) -> anyhow::Result<Option<Self>> {
        if !config.is_enabled() {
            return Ok(None);
        }
        let embedder = embedding::create_provider(config)?;
        Ok(Some(Self::new(
            Arc::new(SqliteVectorStore::new(pool)),
            embedder,
            config.body_chars,
            Duration::from_secs(config.timeout_secs),
        )))
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    /// Embed `msg` and replace whatever the index held for it.
    pub async fn upsert(&self, msg: &Message) -> Result<(), IndexError> {
        let lock = self.message_lock(msg.id);
        let result = {
            let _guard = lock.lock().await;
            self.replace(msg).await
        };
        drop(lock);
        self.release_lock(msg.id);
        result
    }

    async fn replace(&self, msg: &Message) -> Result<(), IndexError> {
        let document = build_document(msg, self.body_chars);
        let enriched_at = msg.enrichment.as_ref().map(|e| e.enriched_at).unwrap_or(0);
        let id = record_id(msg.user_id, msg.id, &document, enriched_at);

        let vector = self.embed(&document).await?;

        let filter = VectorFilter {
            user_id: Some(msg.user_id),
            message_id: Some(msg.id),
        };
        let removed = self.bounded(self.store.delete(&filter)).await?;

        let record = VectorRecord {
            id: id.clone(),
            vector,
            model: self.embedder.model_name().to_string(),
            metadata: VectorMetadata {
                user_id: msg.user_id,
                message_id: msg.id,
                subject: msg.subject.clone(),
                sender: msg.sender.address.clone(),
                received_at: msg.received_at,
            },
        };
        self.bounded(self.store.upsert(std::slice::from_ref(&record)))
            .await?;

        debug!(message_id = msg.id, record = %id, replaced = removed, "Indexed message");
        Ok(())
    }

    /// Semantic search within one user's records, best first.
    pub async fn search(
        &self,
        user_id: i64,
        query: &str,
        k: usize,
    ) -> Result<Vec<SearchHit>, IndexError> {
        if k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let vector = self.embed(query).await?;
        let hits = self
            .bounded(self.store.query(&vector, user_id, k, None))
            .await?;
        Ok(hits.into_iter().map(to_search_hit).collect())
    }

    /// Nearest neighbours of an indexed message, excluding the message itself.
    /// Empty when the message has no vector.
    pub async fn similar(
        &self,
        user_id: i64,
        message_id: i64,
        k: usize,
    ) -> Result<Vec<SearchHit>, IndexError> {
        let Some(vector) = self
            .bounded(self.store.get_vector(user_id, message_id))
            .await?
        else {
            return Ok(Vec::new());
        };
        let hits = self
            .bounded(self.store.query(&vector, user_id, k, Some(message_id)))
            .await?;
        Ok(hits.into_iter().map(to_search_hit).collect())
    }

    /// Remove every record of a message. Deleting nothing is not an error.
    pub async fn delete(&self, message_id: i64) -> Result<usize, IndexError> {
        self.bounded(self.store.delete(&VectorFilter::message(message_id)))
            .await
    }

    pub async fn delete_user(&self, user_id: i64) -> Result<usize, IndexError> {
        self.bounded(self.store.delete(&VectorFilter::user(user_id)))
            .await
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, IndexError> {
        if self.embedder.dims() == 0 {
            return Err(IndexError::Unavailable("embeddings disabled".into()));
        }
        match tokio::time::timeout(
            self.timeout,
            embedding::embed_query(self.embedder.as_ref(), text),
        )
        .await
        {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(IndexError::Unavailable(format!("embedding failed: {:#}", e))),
            Err(_) => Err(IndexError::Unavailable("embedding timed out".into())),
        }
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = anyhow::Result<T>>,
    ) -> Result<T, IndexError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(IndexError::Store),
            Err(_) => Err(IndexError::Unavailable("vector store timed out".into())),
        }
    }

    fn message_lock(&self, message_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(message_id).or_default().clone()
    }

    fn release_lock(&self, message_id: i64) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(&message_id)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(&message_id);
        }
    }
}

fn to_search_hit(hit: crate::vector_store::VectorHit) -> SearchHit {
    SearchHit {
        message_id: hit.metadata.message_id,
        score: 1.0 - hit.distance,
        metadata: hit.metadata,
    }
}

/// Document text embedded for a message.
pub fn build_document(msg: &Message, body_chars: usize) -> String {
    let to = msg
        .to
        .iter()
        .map(|a| a.display())
        .collect::<Vec<_>>()
        .join(", ");
    let body = if msg.body_text.trim().is_empty() {
        msg.body_preview.as_str()
    } else {
        msg.body_text.as_str()
    };
    let summary = msg
        .enrichment
        .as_ref()
        .map(|e| e.fields.summary.as_str())
        .unwrap_or("");

    format!(
        "Subject: {}\nFrom: {}\nTo: {}\nContent: {}\nSummary: {}",
        msg.subject,
        msg.sender.display(),
        to,
        truncate_chars(body, body_chars),
        summary
    )
}

/// `email_{user}_{message}_{v}` with `v` derived from the document and
/// enrichment time.
pub fn record_id(user_id: i64, message_id: i64, document: &str, enriched_at: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document.as_bytes());
    hasher.update(enriched_at.to_le_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("email_{}_{}_{}", user_id, message_id, &digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashProvider;
    use crate::models::{
        Address, EnrichmentFields, Importance, Provenance, Sentiment, StoredEnrichment,
    };
    use crate::vector_store::memory::InMemoryVectorStore;
    use crate::vector_store::VectorHit;
    use async_trait::async_trait;

    fn message(id: i64, user_id: i64, subject: &str, body: &str) -> Message {
        Message {
            id,
            user_id,
            provider_id: format!("p{}", id),
            conversation_key: None,
            thread_id: None,
            subject: subject.into(),
            sender: Address {
                address: "ana@example.com".into(),
                name: "Ana".into(),
            },
            to: vec![Address {
                address: "me@example.com".into(),
                name: String::new(),
            }],
            cc: Vec::new(),
            bcc: Vec::new(),
            body_html: None,
            body_text: body.into(),
            body_preview: body.into(),
            importance: Importance::Normal,
            is_read: false,
            is_draft: false,
            has_attachments: false,
            is_sent_item: false,
            folder: "inbox".into(),
            categories: Vec::new(),
            received_at: id * 100,
            sent_at: None,
            enrichment: None,
            indexed_at: None,
        }
    }

    fn enriched(mut msg: Message, summary: &str, at: i64) -> Message {
        msg.enrichment = Some(StoredEnrichment {
            fields: EnrichmentFields {
                summary: summary.into(),
                tags: Vec::new(),
                sentiment: Sentiment::Neutral,
                priority: 5,
                category: "general".into(),
                action_items: Vec::new(),
            },
            provenance: Provenance::Heuristic,
            enriched_at: at,
        });
        msg
    }

    fn index(store: Arc<InMemoryVectorStore>) -> VectorIndex {
        VectorIndex::new(
            store,
            Arc::new(HashProvider::new(256)),
            2000,
            Duration::from_secs(5),
        )
    }

    #[test]
    fn document_field_order_and_truncation() {
        let msg = enriched(message(1, 1, "Budget", "abcdefghij"), "Q3 numbers", 7);
        let doc = build_document(&msg, 4);
        assert_eq!(
            doc,
            "Subject: Budget\nFrom: Ana <ana@example.com>\nTo: me@example.com\nContent: abcd\nSummary: Q3 numbers"
        );

        let id = record_id(1, 1, &doc, 7);
        assert!(id.starts_with("email_1_1_"));
        assert_eq!(id.len(), "email_1_1_".len() + 8);
        assert_eq!(id, record_id(1, 1, &doc, 7));
        assert_ne!(id, record_id(1, 1, &doc, 8));
    }

    #[tokio::test]
    async fn reindex_leaves_one_record() {
        let store = Arc::new(InMemoryVectorStore::new());
        let index = index(store.clone());

        let msg = message(1, 1, "Budget review", "numbers attached");
        index.upsert(&msg).await.unwrap();
        index.upsert(&msg).await.unwrap();
        index
            .upsert(&enriched(msg.clone(), "Budget numbers", 50))
            .await
            .unwrap();
        assert_eq!(store.len(), 1);

        let hits = index.search(1, "budget", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message_id, 1);
    }

    #[tokio::test]
    async fn concurrent_upserts_of_one_message_do_not_duplicate() {
        let store = Arc::new(InMemoryVectorStore::new());
        let index = Arc::new(index(store.clone()));

        let mut tasks = tokio::task::JoinSet::new();
        for n in 0..8 {
            let index = index.clone();
            let msg = enriched(message(3, 1, "Roadmap", "plan"), "Roadmap", n);
            tasks.spawn(async move { index.upsert(&msg).await });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap().unwrap();
        }
        assert_eq!(store.len(), 1);
        assert!(index.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_never_crosses_users() {
        let store = Arc::new(InMemoryVectorStore::new());
        let index = index(store);

        index
            .upsert(&message(1, 1, "Quarterly budget", "budget figures"))
            .await
            .unwrap();
        index
            .upsert(&message(2, 2, "Quarterly budget", "budget figures"))
            .await
            .unwrap();
        index
            .upsert(&message(3, 1, "Team lunch", "tacos on friday"))
            .await
            .unwrap();

        let hits = index.search(1, "quarterly budget", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.metadata.user_id == 1));
        assert_eq!(hits[0].message_id, 1);
        assert!(hits[0].score >= hits[1].score);

        assert!(index.search(1, "   ", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn similar_excludes_self_and_delete_is_idempotent() {
        let store = Arc::new(InMemoryVectorStore::new());
        let index = index(store.clone());
        index.upsert(&message(1, 1, "Budget", "numbers")).await.unwrap();
        index.upsert(&message(2, 1, "Budget", "numbers")).await.unwrap();

        let similar = index.similar(1, 1, 5).await.unwrap();
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].message_id, 2);
        assert!(index.similar(1, 42, 5).await.unwrap().is_empty());

        assert_eq!(index.delete(1).await.unwrap(), 1);
        assert_eq!(index.delete(1).await.unwrap(), 0);
        assert_eq!(index.delete_user(1).await.unwrap(), 1);
        assert!(store.is_empty());
    }

    struct DownStore;

    #[async_trait]
    impl VectorStore for DownStore {
        async fn upsert(&self, _records: &[VectorRecord]) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }
        async fn query(
            &self,
            _vector: &[f32],
            _user_id: i64,
            _k: usize,
            _exclude_message: Option<i64>,
        ) -> anyhow::Result<Vec<VectorHit>> {
            anyhow::bail!("connection refused")
        }
        async fn get_vector(&self, _u: i64, _m: i64) -> anyhow::Result<Option<Vec<f32>>> {
            anyhow::bail!("connection refused")
        }
        async fn delete(&self, _filter: &VectorFilter) -> anyhow::Result<usize> {
            anyhow::bail!("connection refused")
        }
    }

    #[tokio::test]
    async fn store_failures_surface_as_errors() {
        let index = VectorIndex::new(
            Arc::new(DownStore),
            Arc::new(HashProvider::new(16)),
            2000,
            Duration::from_secs(5),
        );
        assert!(matches!(
            index.search(1, "budget", 5).await,
            Err(IndexError::Store(_))
        ));
        assert!(index.upsert(&message(1, 1, "x", "y")).await.is_err());

        let disabled = VectorIndex::new(
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(crate::embedding::DisabledProvider),
            2000,
            Duration::from_secs(5),
        );
        assert!(matches!(
            disabled.search(1, "budget", 5).await,
            Err(IndexError::Unavailable(_))
        ));
    }
}
