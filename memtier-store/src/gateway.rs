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

//! Vector gateway
//!
//! The strongly-typed facade the engine talks to. One logical collection
//! per tier; every call is bounded by the configured gateway timeout and
//! the caller's cancellation token. Backend errors map onto the engine
//! taxonomy here (`TransientIo` stays retryable, everything else does
//! not). The gateway holds no state beyond the backend handle.

use crate::backend::{RecordFilter, ScoredRecord, StoreError, VectorBackend};
use crate::record::MemoryRecord;
use memtier_core::{ConfigHandle, MemoryError, MemoryId, MemoryResult, Tier};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Typed, per-tier facade over the external vector store
#[derive(Clone)]
pub struct VectorGateway {
    backend: Arc<dyn VectorBackend>,
    config: ConfigHandle,
}

impl VectorGateway {
    pub fn new(backend: Arc<dyn VectorBackend>, config: ConfigHandle) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// Bound a backend call by the gateway timeout and the caller's
    /// token. Timeouts and cancellations surface as `Transient`.
    async fn guarded<T, F>(&self, what: &str, token: &CancellationToken, fut: F) -> MemoryResult<T>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let timeout = self.config.snapshot().general.gateway_timeout();
        tokio::select! {
            _ = token.cancelled() => Err(MemoryError::cancelled()),
            outcome = tokio::time::timeout(timeout, fut) => match outcome {
                Ok(result) => result.map_err(MemoryError::from),
                Err(_) => Err(MemoryError::timeout(what)),
            },
        }
    }

    /// Insert a record into its tier's collection; replaces on id.
    pub async fn insert(
        &self,
        tier: Tier,
        record: MemoryRecord,
        token: &CancellationToken,
    ) -> MemoryResult<()> {
        let expected = self.config.snapshot().general.dimension;
        if record.embedding.len() != expected {
            return Err(MemoryError::InvalidInput(format!(
                "embedding dimension mismatch: expected {expected}, got {}",
                record.embedding.len()
            )));
        }
        debug!(memory_id = %record.id, tier = %tier, "gateway insert");
        self.guarded("insert", token, self.backend.insert(&tier.collection(), record))
            .await
    }

    /// Delete by id; reports whether a row existed.
    pub async fn delete(
        &self,
        tier: Tier,
        id: MemoryId,
        token: &CancellationToken,
    ) -> MemoryResult<bool> {
        debug!(memory_id = %id, tier = %tier, "gateway delete");
        self.guarded("delete", token, self.backend.delete_by_id(&tier.collection(), id))
            .await
    }

    /// Fetch one record by id from one tier.
    pub async fn fetch(
        &self,
        tier: Tier,
        id: MemoryId,
        token: &CancellationToken,
    ) -> MemoryResult<Option<MemoryRecord>> {
        let rows = self
            .guarded(
                "fetch",
                token,
                self.backend
                    .query_by_filter(&tier.collection(), RecordFilter::by_id(id)),
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    /// Locate a record by id across all tiers, most valuable tier first.
    pub async fn locate(
        &self,
        id: MemoryId,
        token: &CancellationToken,
    ) -> MemoryResult<Option<MemoryRecord>> {
        for tier in Tier::ALL {
            if let Some(record) = self.fetch(tier, id, token).await? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Fetch rows matching the restricted filter predicate.
    pub async fn query(
        &self,
        tier: Tier,
        filter: RecordFilter,
        token: &CancellationToken,
    ) -> MemoryResult<Vec<MemoryRecord>> {
        self.guarded(
            "query",
            token,
            self.backend.query_by_filter(&tier.collection(), filter),
        )
        .await
    }

    /// Nearest-neighbour search within one tier, with the tier's search
    /// quality and the configured similarity floor.
    pub async fn search(
        &self,
        tier: Tier,
        query: &[f32],
        k: usize,
        owner: Option<&str>,
        token: &CancellationToken,
    ) -> MemoryResult<Vec<ScoredRecord>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let config = self.config.snapshot();
        let quality = config.tiers.get(tier).search_quality;
        let floor = config.consolidation.min_similarity as f32;

        let hits = self
            .guarded(
                "search",
                token,
                self.backend
                    .search_by_vector(&tier.collection(), query, k, quality, owner),
            )
            .await?;
        Ok(hits.into_iter().filter(|h| h.score >= floor).collect())
    }

    /// Row count for one tier.
    pub async fn count(&self, tier: Tier, token: &CancellationToken) -> MemoryResult<usize> {
        self.guarded("count", token, self.backend.count(&tier.collection()))
            .await
    }

    /// Row counts for every tier.
    pub async fn counts(&self, token: &CancellationToken) -> MemoryResult<HashMap<Tier, usize>> {
        let mut out = HashMap::new();
        for tier in Tier::ALL {
            out.insert(tier, self.count(tier, token).await?);
        }
        Ok(out)
    }

    /// Best-effort compaction of one tier's collection.
    pub async fn compact(&self, tier: Tier, token: &CancellationToken) -> MemoryResult<()> {
        self.guarded("compact", token, self.backend.compact(&tier.collection()))
            .await
    }

    /// Integrity hook for the lifecycle failure path.
    pub async fn verify_integrity(&self, token: &CancellationToken) -> MemoryResult<()> {
        self.guarded("verify_integrity", token, self.backend.verify_integrity())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::record::Payload;
    use async_trait::async_trait;
    use chrono::Utc;
    use memtier_core::EngineConfig;

    fn gateway_with_dimension(dimension: usize) -> VectorGateway {
        let mut config = EngineConfig::default();
        config.general.dimension = dimension;
        VectorGateway::new(
            Arc::new(InMemoryBackend::new()),
            ConfigHandle::new(config).unwrap(),
        )
    }

    fn record(owner: &str, tier: Tier, embedding: Vec<f32>) -> MemoryRecord {
        let now = Utc::now();
        MemoryRecord {
            id: MemoryId::new(),
            owner_id: owner.into(),
            tier,
            embedding,
            importance: 0.5,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            payload: Payload::uncompressed(b"{}".to_vec()),
        }
    }

    #[tokio::test]
    async fn test_insert_checks_dimension() {
        let gateway = gateway_with_dimension(4);
        let token = CancellationToken::new();

        let err = gateway
            .insert(Tier::Active, record("u", Tier::Active, vec![1.0; 3]), &token)
            .await
            .expect_err("wrong dimension");
        assert!(matches!(err, MemoryError::InvalidInput(_)));

        gateway
            .insert(Tier::Active, record("u", Tier::Active, vec![1.0; 4]), &token)
            .await
            .unwrap();
        assert_eq!(gateway.count(Tier::Active, &token).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fetch_and_locate() {
        let gateway = gateway_with_dimension(2);
        let token = CancellationToken::new();
        let r = record("u", Tier::Background, vec![0.5, 0.5]);
        gateway
            .insert(Tier::Background, r.clone(), &token)
            .await
            .unwrap();

        assert!(gateway
            .fetch(Tier::Core, r.id, &token)
            .await
            .unwrap()
            .is_none());
        let found = gateway.locate(r.id, &token).await.unwrap().unwrap();
        assert_eq!(found.id, r.id);
        assert_eq!(found.tier, Tier::Background);
    }

    #[tokio::test]
    async fn test_search_applies_similarity_floor() {
        let gateway = gateway_with_dimension(2);
        let token = CancellationToken::new();
        // Opposite vector: cosine -1 maps to score 0, below any floor
        gateway
            .insert(Tier::Active, record("u", Tier::Active, vec![-1.0, 0.0]), &token)
            .await
            .unwrap();
        gateway
            .insert(Tier::Active, record("u", Tier::Active, vec![1.0, 0.0]), &token)
            .await
            .unwrap();

        let hits = gateway
            .search(Tier::Active, &[1.0, 0.0], 10, Some("u"), &token)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].score > 0.99);
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let gateway = gateway_with_dimension(2);
        let token = CancellationToken::new();
        token.cancel();

        let err = gateway
            .count(Tier::Core, &token)
            .await
            .expect_err("cancelled");
        assert!(err.is_retryable());
    }

    struct StalledBackend;

    #[async_trait]
    impl VectorBackend for StalledBackend {
        async fn insert(&self, _: &str, _: MemoryRecord) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn delete_by_id(&self, _: &str, _: MemoryId) -> Result<bool, StoreError> {
            std::future::pending().await
        }
        async fn query_by_filter(
            &self,
            _: &str,
            _: RecordFilter,
        ) -> Result<Vec<MemoryRecord>, StoreError> {
            std::future::pending().await
        }
        async fn search_by_vector(
            &self,
            _: &str,
            _: &[f32],
            _: usize,
            _: usize,
            _: Option<&str>,
        ) -> Result<Vec<ScoredRecord>, StoreError> {
            std::future::pending().await
        }
        async fn count(&self, _: &str) -> Result<usize, StoreError> {
            std::future::pending().await
        }
        async fn compact(&self, _: &str) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn verify_integrity(&self) -> Result<(), StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_backend_times_out_as_transient() {
        let gateway = VectorGateway::new(
            Arc::new(StalledBackend),
            ConfigHandle::new(EngineConfig::default()).unwrap(),
        );
        let token = CancellationToken::new();
        let err = gateway
            .count(Tier::Active, &token)
            .await
            .expect_err("timeout");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("timed out"));
    }
}
