//! In-memory [`VectorStore`] for tests and ephemeral runs.
//!
//! Records live in a `Vec` behind `std::sync::RwLock`. Queries are
//! brute-force cosine over the requesting user's records only.

use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::{rank_hits, VectorFilter, VectorHit, VectorRecord, VectorStore};
use crate::embedding::cosine_similarity;

#[derive(Default)]
pub struct InMemoryVectorStore {
    records: RwLock<Vec<VectorRecord>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow::anyhow!("in-memory vector store lock poisoned")
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        let mut stored = self.records.write().map_err(poisoned)?;
        for record in records {
            stored.retain(|r| r.id != record.id);
            stored.push(record.clone());
        }
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        user_id: i64,
        k: usize,
        exclude_message: Option<i64>,
    ) -> Result<Vec<VectorHit>> {
        let stored = self.records.read().map_err(poisoned)?;
        let mut hits: Vec<VectorHit> = stored
            .iter()
            .filter(|r| r.metadata.user_id == user_id)
            .filter(|r| exclude_message != Some(r.metadata.message_id))
            .map(|r| VectorHit {
                id: r.id.clone(),
                distance: 1.0 - cosine_similarity(vector, &r.vector),
                metadata: r.metadata.clone(),
            })
            .collect();
        rank_hits(&mut hits, k);
        Ok(hits)
    }

    async fn get_vector(&self, user_id: i64, message_id: i64) -> Result<Option<Vec<f32>>> {
        let stored = self.records.read().map_err(poisoned)?;
        Ok(stored
            .iter()
            .find(|r| r.metadata.user_id == user_id && r.metadata.message_id == message_id)
            .map(|r| r.vector.clone()))
    }

    async fn delete(&self, filter: &VectorFilter) -> Result<usize> {
        if filter.is_empty() {
            bail!("refusing to delete with an empty vector filter");
        }
        let mut stored = self.records.write().map_err(poisoned)?;
        let before = stored.len();
        stored.retain(|r| !filter.matches(&r.metadata));
        Ok(before - stored.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_store::VectorMetadata;

    fn record(id: &str, user_id: i64, message_id: i64, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.into(),
            vector,
            model: "test".into(),
            metadata: VectorMetadata {
                user_id,
                message_id,
                subject: String::new(),
                sender: String::new(),
                received_at: message_id,
            },
        }
    }

    #[tokio::test]
    async fn query_is_scoped_to_one_user() {
        let store = InMemoryVectorStore::new();
        store
            .upsert(&[
                record("a", 1, 1, vec![1.0, 0.0]),
                record("b", 2, 2, vec![1.0, 0.0]),
                record("c", 1, 3, vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let hits = store.query(&[1.0, 0.0], 1, 10, None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.metadata.user_id == 1));
        assert_eq!(hits[0].id, "a");
        assert!(hits[0].distance.abs() < 1e-6);

        let excluded = store.query(&[1.0, 0.0], 1, 10, Some(1)).await.unwrap();
        assert_eq!(excluded.len(), 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_refuses_empty_filter() {
        let store = InMemoryVectorStore::new();
        store.upsert(&[record("a", 1, 1, vec![1.0])]).await.unwrap();
        assert_eq!(store.delete(&VectorFilter::message(1)).await.unwrap(), 1);
        assert_eq!(store.delete(&VectorFilter::message(1)).await.unwrap(), 0);
        assert!(store.delete(&VectorFilter::default()).await.is_err());
        assert!(store.is_empty());
    }
}
