// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Vector store backend
//!
//! The black-box vector database behind an object-safe async trait.
//! `InMemoryBackend` is the development/testing implementation: brute
//! force scoring over per-collection hash maps. Production deployments
//! plug a real client behind the same trait.

use crate::record::MemoryRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use memtier_core::{DistanceMetric, MemoryError, MemoryId, Tier};
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

/// Errors from the vector store boundary
#[derive(Debug, Error)]
pub enum StoreError {
    /// Named collection does not exist
    #[error("Collection missing: {0}")]
    CollectionMissing(String),

    /// Vector dimension differs from the collection's
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Retryable I/O failure
    #[error("Transient I/O failure: {0}")]
    TransientIo(String),
}

impl From<StoreError> for MemoryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TransientIo(msg) => MemoryError::Transient(msg),
            StoreError::DimensionMismatch { expected, actual } => MemoryError::InvalidInput(
                format!("embedding dimension mismatch: expected {expected}, got {actual}"),
            ),
            StoreError::CollectionMissing(name) => {
                MemoryError::StorageFailed(format!("collection missing: {name}"))
            }
        }
    }
}

/// Filter predicate for `query_by_filter`: equality on id, range on
/// timestamp, equality on tier. Nothing else is expressible.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub id: Option<MemoryId>,
    pub tier: Option<Tier>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl RecordFilter {
    pub fn by_id(id: MemoryId) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &MemoryRecord) -> bool {
        if let Some(id) = self.id {
            if record.id != id {
                return false;
            }
        }
        if let Some(tier) = self.tier {
            if record.tier != tier {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if record.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if record.created_at > before {
                return false;
            }
        }
        true
    }
}

/// A nearest-neighbour hit; `score` is a similarity in [0, 1], higher is
/// closer, regardless of metric.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub record: MemoryRecord,
    pub score: f32,
}

/// The external vector store, as the engine sees it
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Append a record; re-insert on an existing id replaces the row.
    async fn insert(&self, collection: &str, record: MemoryRecord) -> Result<(), StoreError>;

    /// Remove by id; reports whether a row existed.
    async fn delete_by_id(&self, collection: &str, id: MemoryId) -> Result<bool, StoreError>;

    /// Fetch rows matching the (restricted) filter predicate.
    async fn query_by_filter(
        &self,
        collection: &str,
        filter: RecordFilter,
    ) -> Result<Vec<MemoryRecord>, StoreError>;

    /// Up to `k` nearest neighbours. `quality` is the per-tier search
    /// effort knob; `owner` restricts results to one owner's rows.
    async fn search_by_vector(
        &self,
        collection: &str,
        query: &[f32],
        k: usize,
        quality: usize,
        owner: Option<&str>,
    ) -> Result<Vec<ScoredRecord>, StoreError>;

    /// Row count for one collection.
    async fn count(&self, collection: &str) -> Result<usize, StoreError>;

    /// Best-effort storage optimization.
    async fn compact(&self, collection: &str) -> Result<(), StoreError>;

    /// Integrity hook invoked after a lifecycle pass fails its retries.
    async fn verify_integrity(&self) -> Result<(), StoreError>;
}

/// Similarity between two vectors under the given metric, mapped to
/// [0, 1] with higher = closer.
pub fn similarity(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::Cosine => {
            let mut dot = 0.0f32;
            let mut na = 0.0f32;
            let mut nb = 0.0f32;
            for (x, y) in a.iter().zip(b.iter()) {
                dot += x * y;
                na += x * x;
                nb += y * y;
            }
            if na == 0.0 || nb == 0.0 {
                return 0.0;
            }
            // Cosine in [-1, 1] rescaled to [0, 1]
            let cos = dot / (na.sqrt() * nb.sqrt());
            (cos + 1.0) / 2.0
        }
        DistanceMetric::L2 => {
            let dist: f32 = a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt();
            1.0 / (1.0 + dist)
        }
    }
}

/// Raw cosine similarity in [-1, 1]; the consolidator clusters on this.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Brute-force in-memory backend for development and tests
pub struct InMemoryBackend {
    metric: DistanceMetric,
    collections: RwLock<HashMap<String, HashMap<MemoryId, MemoryRecord>>>,
}

impl InMemoryBackend {
    /// Backend with one collection per tier, cosine metric.
    pub fn new() -> Self {
        Self::with_metric(DistanceMetric::Cosine)
    }

    pub fn with_metric(metric: DistanceMetric) -> Self {
        let collections = Tier::ALL
            .iter()
            .map(|tier| (tier.collection(), HashMap::new()))
            .collect();
        Self {
            metric,
            collections: RwLock::new(collections),
        }
    }

    fn with_collection<T>(
        &self,
        collection: &str,
        f: impl FnOnce(&HashMap<MemoryId, MemoryRecord>) -> T,
    ) -> Result<T, StoreError> {
        let collections = self.collections.read();
        let rows = collections
            .get(collection)
            .ok_or_else(|| StoreError::CollectionMissing(collection.to_string()))?;
        Ok(f(rows))
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorBackend for InMemoryBackend {
    async fn insert(&self, collection: &str, record: MemoryRecord) -> Result<(), StoreError> {
        let mut collections = self.collections.write();
        let rows = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::CollectionMissing(collection.to_string()))?;
        if let Some(existing) = rows.values().next() {
            if existing.embedding.len() != record.embedding.len() {
                return Err(StoreError::DimensionMismatch {
                    expected: existing.embedding.len(),
                    actual: record.embedding.len(),
                });
            }
        }
        rows.insert(record.id, record);
        Ok(())
    }

    async fn delete_by_id(&self, collection: &str, id: MemoryId) -> Result<bool, StoreError> {
        let mut collections = self.collections.write();
        let rows = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::CollectionMissing(collection.to_string()))?;
        Ok(rows.remove(&id).is_some())
    }

    async fn query_by_filter(
        &self,
        collection: &str,
        filter: RecordFilter,
    ) -> Result<Vec<MemoryRecord>, StoreError> {
        self.with_collection(collection, |rows| {
            let mut out: Vec<MemoryRecord> =
                rows.values().filter(|r| filter.matches(r)).cloned().collect();
            out.sort_by_key(|r| r.id);
            out
        })
    }

    async fn search_by_vector(
        &self,
        collection: &str,
        query: &[f32],
        k: usize,
        _quality: usize,
        owner: Option<&str>,
    ) -> Result<Vec<ScoredRecord>, StoreError> {
        self.with_collection(collection, |rows| {
            let mut scored: Vec<ScoredRecord> = rows
                .values()
                .filter(|r| owner.map_or(true, |o| r.owner_id == o))
                .filter(|r| r.embedding.len() == query.len())
                .map(|r| ScoredRecord {
                    score: similarity(self.metric, query, &r.embedding),
                    record: r.clone(),
                })
                .collect();
            scored.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.record.id.cmp(&b.record.id))
            });
            scored.truncate(k);
            scored
        })
    }

    async fn count(&self, collection: &str) -> Result<usize, StoreError> {
        self.with_collection(collection, |rows| rows.len())
    }

    async fn compact(&self, _collection: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn verify_integrity(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
