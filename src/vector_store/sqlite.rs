//! SQLite-backed [`VectorStore`] over the `message_vectors` table.
//!
//! Vectors are little-endian `f32` BLOBs. The `user_id` filter is part of
//! the SQL `WHERE` clause, so other users' rows are never loaded, let alone
//! ranked. Similarity is brute-force cosine over the remaining rows.

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use super::{rank_hits, VectorFilter, VectorHit, VectorMetadata, VectorRecord, VectorStore};
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};

#[derive(Clone)]
pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO message_vectors
                    (id, user_id, message_id, subject, sender, received_at, model, dims, embedding, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    embedding = excluded.embedding,
                    model = excluded.model,
                    dims = excluded.dims,
                    subject = excluded.subject,
                    sender = excluded.sender,
                    received_at = excluded.received_at,
                    created_at = excluded.created_at
                "#,
            )
            .bind(&record.id)
            .bind(record.metadata.user_id)
            .bind(record.metadata.message_id)
            .bind(&record.metadata.subject)
            .bind(&record.metadata.sender)
            .bind(record.metadata.received_at)
            .bind(&record.model)
            .bind(record.vector.len() as i64)
            .bind(vec_to_blob(&record.vector))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        user_id: i64,
        k: usize,
        exclude_message: Option<i64>,
    ) -> Result<Vec<VectorHit>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, message_id, subject, sender, received_at, embedding
            FROM message_vectors
            WHERE user_id = ? AND (? IS NULL OR message_id != ?)
            "#,
        )
        .bind(user_id)
        .bind(exclude_message)
        .bind(exclude_message)
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<VectorHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(vector, &blob_to_vec(&blob));
                VectorHit {
                    id: row.get("id"),
                    distance: 1.0 - similarity,
                    metadata: VectorMetadata {
                        user_id: row.get("user_id"),
                        message_id: row.get("message_id"),
                        subject: row.get("subject"),
                        sender: row.get("sender"),
                        received_at: row.get("received_at"),
                    },
                }
            })
            .collect();

        rank_hits(&mut hits, k);
        Ok(hits)
    }

    async fn get_vector(&self, user_id: i64, message_id: i64) -> Result<Option<Vec<f32>>> {
        let blob: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT embedding FROM message_vectors WHERE user_id = ? AND message_id = ? LIMIT 1",
        )
        .bind(user_id)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(blob.map(|b| blob_to_vec(&b)))
    }

    async fn delete(&self, filter: &VectorFilter) -> Result<usize> {
        if filter.is_empty() {
            bail!("refusing to delete with an empty vector filter");
        }
        let result = sqlx::query(
            r#"
            DELETE FROM message_vectors
            WHERE (? IS NULL OR user_id = ?) AND (? IS NULL OR message_id = ?)
            "#,
        )
        .bind(filter.user_id)
        .bind(filter.user_id)
        .bind(filter.message_id)
        .bind(filter.message_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::temp_store;

    fn record(id: &str, user_id: i64, message_id: i64, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.into(),
            vector,
            model: "test".into(),
            metadata: VectorMetadata {
                user_id,
                message_id,
                subject: format!("s{}", message_id),
                sender: "ana@example.com".into(),
                received_at: message_id * 10,
            },
        }
    }

    #[tokio::test]
    async fn upsert_query_delete() {
        let (_tmp, store) = temp_store().await;
        let vectors = SqliteVectorStore::new(store.pool().clone());

        vectors
            .upsert(&[
                record("a", 1, 1, vec![1.0, 0.0]),
                record("b", 1, 2, vec![0.6, 0.8]),
                record("z", 2, 3, vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = vectors.query(&[1.0, 0.0], 1, 5, None).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!((hits[1].distance - 0.4).abs() < 1e-5);
        assert_eq!(hits[1].metadata.subject, "s2");

        assert_eq!(
            vectors.get_vector(1, 2).await.unwrap(),
            Some(vec![0.6, 0.8])
        );
        assert!(vectors.get_vector(2, 2).await.unwrap().is_none());

        assert_eq!(vectors.delete(&VectorFilter::user(1)).await.unwrap(), 2);
        assert_eq!(vectors.delete(&VectorFilter::user(1)).await.unwrap(), 0);
        assert_eq!(vectors.query(&[1.0, 0.0], 2, 5, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_id_is_replaced() {
        let (_tmp, store) = temp_store().await;
        let vectors = SqliteVectorStore::new(store.pool().clone());
        vectors.upsert(&[record("a", 1, 1, vec![1.0, 0.0])]).await.unwrap();
        vectors.upsert(&[record("a", 1, 1, vec![0.0, 1.0])]).await.unwrap();

        let hits = vectors.query(&[0.0, 1.0], 1, 5, Some(99)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].distance.abs() < 1e-6);
    }
}
