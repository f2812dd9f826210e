//! Vector store collaborator.
//!
//! The [`VectorStore`] trait is the boundary to whatever holds embeddings.
//! One collection serves every user; records are partitioned by the
//! `user_id` in their metadata, and every query names exactly one user so
//! the filter is applied before ranking.
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`sqlite::SqliteVectorStore`] | Default; `message_vectors` table next to the relational data |
//! | [`memory::InMemoryVectorStore`] | Tests and ephemeral runs |

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::cmp::Ordering;

/// Metadata stored alongside each vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorMetadata {
    pub user_id: i64,
    pub message_id: i64,
    pub subject: String,
    pub sender: String,
    pub received_at: i64,
}

#[derive(Debug, Clone)]
pub struct VectorRecord {
    /// Synthetic id, unique per (user, message, enrichment version).
    pub id: String,
    pub vector: Vec<f32>,
    pub model: String,
    pub metadata: VectorMetadata,
}

/// One query result. `distance` is cosine distance (`1 - cosine similarity`).
#[derive(Debug, Clone, Serialize)]
pub struct VectorHit {
    pub id: String,
    pub distance: f32,
    pub metadata: VectorMetadata,
}

/// Equality filter for deletes. At least one field must be set.
#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub user_id: Option<i64>,
    pub message_id: Option<i64>,
}

impl VectorFilter {
    pub fn message(message_id: i64) -> Self {
        Self {
            user_id: None,
            message_id: Some(message_id),
        }
    }

    pub fn user(user_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            message_id: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.message_id.is_none()
    }

    fn matches(&self, meta: &VectorMetadata) -> bool {
        self.user_id.map_or(true, |u| u == meta.user_id)
            && self.message_id.map_or(true, |m| m == meta.message_id)
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert records; an existing id is replaced.
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()>;

    /// Nearest `k` records of one user, closest first.
    async fn query(
        &self,
        vector: &[f32],
        user_id: i64,
        k: usize,
        exclude_message: Option<i64>,
    ) -> Result<Vec<VectorHit>>;

    /// Stored vector of one message, if indexed.
    async fn get_vector(&self, user_id: i64, message_id: i64) -> Result<Option<Vec<f32>>>;

    /// Delete every record matching the filter. Returns how many were removed.
    async fn delete(&self, filter: &VectorFilter) -> Result<usize>;
}

/// Closest first; equal distances go to the more recent message.
pub(crate) fn rank_hits(hits: &mut Vec<VectorHit>, k: usize) {
    hits.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.metadata.received_at.cmp(&a.metadata.received_at))
    });
    hits.truncate(k);
}
