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

//! Memory service
//!
//! The authoritative entry point: ingestion, tier-cascading retrieval,
//! access metrics, updates, deletes and tier transitions. Writes to a
//! single memory id are serialized through a sharded async lock map;
//! multi-id operations acquire locks in id order so they can never
//! deadlock. Every operation takes a cancellation token and snapshots the
//! configuration once at entry.

use crate::cache::{CacheTierStats, TierCache};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use memtier_core::{
    ConfigHandle, ImportanceScorer, Memory, MemoryDraft, MemoryError, MemoryId, MemoryResult,
    Tier, TierPolicy, MAX_CONTENT_BYTES,
};
use memtier_core::memory::EvolutionHistory;
use memtier_store::{
    CodecStats, CompressionCodec, EmbeddingProvider, MemoryRecord, VectorBackend, VectorGateway,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the core-tier query fast path memo
const QUERY_FAST_PATH_CAPACITY: u64 = 256;

/// Retrieval input: raw text (embedded via the provider) or a caller
/// supplied vector.
#[derive(Debug, Clone)]
pub enum RetrieveQuery {
    Text(String),
    Embedding(Vec<f32>),
}

impl From<&str> for RetrieveQuery {
    fn from(text: &str) -> Self {
        RetrieveQuery::Text(text.to_string())
    }
}

impl From<Vec<f32>> for RetrieveQuery {
    fn from(embedding: Vec<f32>) -> Self {
        RetrieveQuery::Embedding(embedding)
    }
}

/// The narrow interface the lifecycle manager works against
#[async_trait]
pub trait MemoryAccess: Send + Sync {
    async fn get(&self, id: MemoryId, token: &CancellationToken) -> MemoryResult<Option<Memory>>;

    /// Persist a fully-formed memory (consolidation write-back).
    async fn insert_memory(&self, memory: Memory, token: &CancellationToken) -> MemoryResult<()>;

    async fn update(&self, memory: Memory, token: &CancellationToken) -> MemoryResult<()>;

    async fn delete(&self, id: MemoryId, token: &CancellationToken) -> MemoryResult<()>;

    /// Atomic consolidation swap: insert the merged memory and remove the
    /// members under their id locks, so no retrieval sees a member after
    /// the survivor exists.
    async fn replace_with_merged(
        &self,
        merged: Memory,
        member_ids: Vec<MemoryId>,
        token: &CancellationToken,
    ) -> MemoryResult<()>;

    async fn get_by_tier(
        &self,
        tier: Tier,
        token: &CancellationToken,
    ) -> MemoryResult<Vec<Memory>>;

    /// Memories idle past their tier's retention.
    async fn get_stale(
        &self,
        now: DateTime<Utc>,
        token: &CancellationToken,
    ) -> MemoryResult<Vec<Memory>>;

    async fn transition_tier(
        &self,
        memory: &Memory,
        new_tier: Tier,
        token: &CancellationToken,
    ) -> MemoryResult<()>;

    async fn counts(&self, token: &CancellationToken) -> MemoryResult<HashMap<Tier, usize>>;

    async fn average_importance(&self, token: &CancellationToken) -> MemoryResult<f64>;

    async fn verify_integrity(&self, token: &CancellationToken) -> MemoryResult<()>;

    /// Best-effort store compaction after cleanup.
    async fn compact(&self, token: &CancellationToken) -> MemoryResult<()>;

    /// Cache housekeeping tick (self-tuning resize).
    fn housekeep_caches(&self);
}

/// The authoritative memory service
pub struct MemoryService {
    gateway: VectorGateway,
    cache: TierCache,
    codec: CompressionCodec,
    embedder: Arc<dyn EmbeddingProvider>,
    config: ConfigHandle,
    locks: DashMap<MemoryId, Arc<Mutex<()>>>,
    query_fast_path: moka::sync::Cache<String, MemoryId>,
}

impl MemoryService {
    pub fn new(
        backend: Arc<dyn VectorBackend>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            gateway: VectorGateway::new(backend, config.clone()),
            cache: TierCache::new(&config),
            codec: CompressionCodec::new(config.clone()),
            embedder,
            config: config.clone(),
            locks: DashMap::new(),
            query_fast_path: moka::sync::Cache::new(QUERY_FAST_PATH_CAPACITY),
        }
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn cache_stats(&self, tier: Tier) -> CacheTierStats {
        self.cache.stats(tier)
    }

    pub fn codec_stats(&self) -> CodecStats {
        self.codec.stats()
    }

    fn scorer(&self) -> ImportanceScorer {
        let config = self.config.snapshot();
        ImportanceScorer::new(
            config.consolidation.recency_decay_secs as f64,
            config.consolidation.max_access_count,
        )
    }

    fn policy(&self) -> TierPolicy {
        TierPolicy::new(self.config.snapshot().tiers.clone())
    }

    /// Per-id write lock. Entries are created on demand and dropped on
    /// delete; a stale Arc held by a concurrent task is harmless.
    async fn lock(&self, id: MemoryId) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Acquire several id locks in lexicographic order.
    async fn lock_many(&self, ids: &[MemoryId]) -> Vec<OwnedMutexGuard<()>> {
        let mut sorted: Vec<MemoryId> = ids.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for id in sorted {
            guards.push(self.lock(id).await);
        }
        guards
    }

    fn validate_draft(&self, draft: &MemoryDraft) -> MemoryResult<()> {
        if draft.owner_id.trim().is_empty() {
            return Err(MemoryError::InvalidInput("owner_id is empty".into()));
        }
        if draft.content.trim().is_empty() {
            return Err(MemoryError::InvalidInput("content is empty".into()));
        }
        if draft.content.len() > MAX_CONTENT_BYTES {
            return Err(MemoryError::InvalidInput(format!(
                "content exceeds {MAX_CONTENT_BYTES} bytes"
            )));
        }
        let expected = self.config.snapshot().general.dimension;
        if draft.embedding.len() != expected {
            return Err(MemoryError::InvalidInput(format!(
                "embedding dimension mismatch: expected {expected}, got {}",
                draft.embedding.len()
            )));
        }
        Ok(())
    }

    async fn embed_query(&self, text: &str, token: &CancellationToken) -> MemoryResult<Vec<f32>> {
        let config = self.config.snapshot();
        let vector = tokio::select! {
            _ = token.cancelled() => return Err(MemoryError::cancelled()),
            outcome = tokio::time::timeout(config.general.embed_timeout(), self.embedder.embed(text)) => {
                match outcome {
                    Ok(result) => result.map_err(MemoryError::from)?,
                    Err(_) => return Err(MemoryError::timeout("embedding")),
                }
            }
        };
        if vector.len() != config.general.dimension {
            return Err(MemoryError::InvalidInput(format!(
                "embedding provider returned dimension {}, expected {}",
                vector.len(),
                config.general.dimension
            )));
        }
        Ok(vector)
    }

    /// Ingest a new memory. At-most-once on id: the id is generated here,
    /// after validation, and returned only on durable insertion.
    pub async fn store(
        &self,
        draft: MemoryDraft,
        token: &CancellationToken,
    ) -> MemoryResult<MemoryId> {
        self.validate_draft(&draft)?;
        let config = self.config.snapshot();
        let now = Utc::now();
        let scorer = self.scorer();
        let policy = self.policy();

        let importance = scorer.ingestion_score(
            now,
            draft.metadata.emotional_value,
            draft.metadata.context_relevance,
            0,
            now,
        );
        let tier = policy.candidate_tier(importance);
        let mut memory = Memory::from_draft(draft, tier, importance, now);
        memory.metadata.evolution_history =
            EvolutionHistory::new(config.evolution.history_capacity);

        let _guard = self.lock(memory.id).await;
        let record = self.codec.encode(&memory);
        self.gateway.insert(tier, record, token).await?;
        if tier == Tier::Core {
            self.cache.put(memory.clone());
        }
        info!(
            memory_id = %memory.id,
            owner_id = %memory.owner_id,
            tier = %tier,
            importance,
            "memory stored"
        );
        Ok(memory.id)
    }

    /// Tier-cascading retrieval: core first, then active, then background
    /// until `k` results are filled. Results always belong to `owner_id`
    /// and have their access metrics bumped before returning.
    pub async fn retrieve(
        &self,
        owner_id: &str,
        query: impl Into<RetrieveQuery>,
        k: usize,
        token: &CancellationToken,
    ) -> MemoryResult<Vec<Memory>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let (query_text, query_vector) = match query.into() {
            RetrieveQuery::Text(text) => {
                let vector = self.embed_query(&text, token).await?;
                (Some(text), vector)
            }
            RetrieveQuery::Embedding(vector) => {
                let expected = self.config.snapshot().general.dimension;
                if vector.len() != expected {
                    return Err(MemoryError::InvalidInput(format!(
                        "query dimension mismatch: expected {expected}, got {}",
                        vector.len()
                    )));
                }
                (None, vector)
            }
        };

        let mut results: Vec<Memory> = Vec::new();
        let mut seen: HashSet<MemoryId> = HashSet::new();

        // Optional core-tier fast path on the raw query string.
        if let Some(text) = &query_text {
            if let Some(id) = self.query_fast_path.get(text) {
                if let Some(memory) = self.cache.get(&id, Tier::Core) {
                    if memory.owner_id == owner_id {
                        debug!(memory_id = %id, "core query fast path hit");
                        seen.insert(id);
                        results.push(memory);
                    }
                }
            }
        }

        for tier in Tier::ALL {
            if results.len() >= k {
                break;
            }
            let need = k - results.len() + seen.len();
            let hits = self
                .gateway
                .search(tier, &query_vector, need, Some(owner_id), token)
                .await?;
            for hit in hits {
                if results.len() >= k {
                    break;
                }
                if !seen.insert(hit.record.id) {
                    continue;
                }
                let memory = self.codec.decode(hit.record)?;
                if memory.owner_id != owner_id {
                    continue;
                }
                results.push(memory);
            }
        }

        if let (Some(text), Some(top)) = (&query_text, results.first()) {
            if top.tier == Tier::Core {
                self.query_fast_path.insert(text.clone(), top.id);
            }
        }

        self.update_access(&mut results, token).await?;
        debug!(owner_id, k, returned = results.len(), "retrieve finished");
        Ok(results)
    }

    /// Access-metrics path: bump `access_count` and refresh
    /// `last_accessed_at` against the authoritative store. The tier cache
    /// is consulted first (writers keep it current under the id lock);
    /// the gateway write still always happens. Memories that vanished
    /// since search are skipped, not errors.
    pub async fn update_access(
        &self,
        memories: &mut [Memory],
        token: &CancellationToken,
    ) -> MemoryResult<()> {
        if memories.is_empty() {
            return Ok(());
        }
        let ids: Vec<MemoryId> = memories.iter().map(|m| m.id).collect();
        let _guards = self.lock_many(&ids).await;
        let now = Utc::now();

        for memory in memories.iter_mut() {
            let current = match self.cache.get(&memory.id, memory.tier) {
                Some(cached) => Some(cached),
                None => {
                    let record = match self.gateway.fetch(memory.tier, memory.id, token).await? {
                        Some(record) => Some(record),
                        // The tier may have moved between search and fetch
                        None => self.gateway.locate(memory.id, token).await?,
                    };
                    match record {
                        Some(record) => Some(self.codec.decode(record)?),
                        None => None,
                    }
                }
            };
            let Some(mut current) = current else {
                debug!(memory_id = %memory.id, "memory vanished before access update");
                continue;
            };

            current.record_access(now);
            let record = self.codec.encode(&current);
            self.gateway.insert(current.tier, record, token).await?;
            self.cache.put(current.clone());
            *memory = current;
        }
        Ok(())
    }

    /// Replace a stored memory wholesale. Performs a logical move when
    /// the tier field changed.
    pub async fn update_memory(
        &self,
        memory: Memory,
        token: &CancellationToken,
    ) -> MemoryResult<()> {
        if memory.content.trim().is_empty() {
            return Err(MemoryError::InvalidInput("content is empty".into()));
        }
        if !(0.0..=1.0).contains(&memory.importance) {
            return Err(MemoryError::InvalidInput(format!(
                "importance out of range: {}",
                memory.importance
            )));
        }
        let _guard = self.lock(memory.id).await;
        let existing = self
            .gateway
            .locate(memory.id, token)
            .await?
            .ok_or_else(|| MemoryError::NotFound(memory.id.to_string()))?;
        if existing.owner_id != memory.owner_id {
            return Err(MemoryError::InvalidInput(
                "owner_id is immutable".into(),
            ));
        }

        let record = self.codec.encode(&memory);
        if existing.tier == memory.tier {
            self.gateway.insert(memory.tier, record, token).await?;
        } else {
            self.gateway.delete(existing.tier, memory.id, token).await?;
            self.gateway.insert(memory.tier, record, token).await?;
        }

        self.cache.invalidate(&memory.id, None);
        self.cache.put(memory.clone());
        Ok(())
    }

    /// Remove a memory everywhere. Missing ids are not an error.
    pub async fn delete_memory(
        &self,
        id: MemoryId,
        token: &CancellationToken,
    ) -> MemoryResult<()> {
        let guard = self.lock(id).await;
        let mut removed = false;
        for tier in Tier::ALL {
            removed |= self.gateway.delete(tier, id, token).await?;
        }
        self.cache.invalidate(&id, None);
        drop(guard);
        self.locks.remove(&id);
        if removed {
            debug!(memory_id = %id, "memory deleted");
        }
        Ok(())
    }

    /// Logical tier move: validated one-step transition, delete from the
    /// source collection, re-insert into the destination.
    pub async fn transition(
        &self,
        memory: &Memory,
        new_tier: Tier,
        token: &CancellationToken,
    ) -> MemoryResult<()> {
        if new_tier == memory.tier {
            return Ok(());
        }
        if !memory.tier.is_adjacent(new_tier) {
            return Err(MemoryError::InvalidTransition {
                from: memory.tier,
                to: new_tier,
                reason: "tiers move one step at a time".into(),
            });
        }
        let policy = self.policy();
        if !policy.admits(new_tier, memory.importance) {
            return Err(MemoryError::InvalidTransition {
                from: memory.tier,
                to: new_tier,
                reason: format!(
                    "importance {} below the {} floor",
                    memory.importance, new_tier
                ),
            });
        }

        let _guard = self.lock(memory.id).await;
        let record = self
            .gateway
            .fetch(memory.tier, memory.id, token)
            .await?
            .ok_or_else(|| MemoryError::NotFound(memory.id.to_string()))?;

        let mut moved = record;
        moved.tier = new_tier;
        self.gateway.delete(memory.tier, memory.id, token).await?;
        self.gateway.insert(new_tier, moved.clone(), token).await?;

        self.cache.invalidate(&memory.id, Some(memory.tier));
        self.cache.put(self.codec.decode(moved)?);
        info!(memory_id = %memory.id, from = %memory.tier, to = %new_tier, "tier transition");
        Ok(())
    }

    fn record_to_memory(&self, record: MemoryRecord) -> MemoryResult<Memory> {
        self.codec.decode(record)
    }
}

#[async_trait]
impl MemoryAccess for MemoryService {
    async fn get(&self, id: MemoryId, token: &CancellationToken) -> MemoryResult<Option<Memory>> {
        if let Some(memory) = self.cache.get_any(&id) {
            return Ok(Some(memory));
        }
        match self.gateway.locate(id, token).await? {
            Some(record) => {
                let memory = self.record_to_memory(record)?;
                // Read-through fill for the memory's own tier
                self.cache.put(memory.clone());
                Ok(Some(memory))
            }
            None => Ok(None),
        }
    }

    async fn insert_memory(&self, memory: Memory, token: &CancellationToken) -> MemoryResult<()> {
        let _guard = self.lock(memory.id).await;
        let record = self.codec.encode(&memory);
        self.gateway.insert(memory.tier, record, token).await?;
        self.cache.put(memory);
        Ok(())
    }

    async fn update(&self, memory: Memory, token: &CancellationToken) -> MemoryResult<()> {
        self.update_memory(memory, token).await
    }

    async fn delete(&self, id: MemoryId, token: &CancellationToken) -> MemoryResult<()> {
        self.delete_memory(id, token).await
    }

    async fn replace_with_merged(
        &self,
        merged: Memory,
        member_ids: Vec<MemoryId>,
        token: &CancellationToken,
    ) -> MemoryResult<()> {
        let mut all_ids = member_ids.clone();
        all_ids.push(merged.id);
        let _guards = self.lock_many(&all_ids).await;

        let tier = merged.tier;
        let record = self.codec.encode(&merged);
        self.gateway.insert(tier, record, token).await?;
        for id in &member_ids {
            for source in Tier::ALL {
                self.gateway.delete(source, *id, token).await?;
            }
            self.cache.invalidate(id, None);
        }
        self.cache.put(merged.clone());
        info!(
            merged_id = %merged.id,
            members = member_ids.len(),
            tier = %tier,
            "consolidated cluster persisted"
        );
        Ok(())
    }

    async fn get_by_tier(
        &self,
        tier: Tier,
        token: &CancellationToken,
    ) -> MemoryResult<Vec<Memory>> {
        let records = self
            .gateway
            .query(tier, Default::default(), token)
            .await?;
        records
            .into_iter()
            .map(|record| self.record_to_memory(record))
            .collect()
    }

    async fn get_stale(
        &self,
        now: DateTime<Utc>,
        token: &CancellationToken,
    ) -> MemoryResult<Vec<Memory>> {
        let config = self.config.snapshot();
        let mut stale = Vec::new();
        for tier in Tier::ALL {
            let Some(retention) = config.tiers.get(tier).retention_secs else {
                continue;
            };
            let retention = chrono::Duration::seconds(retention as i64);
            for record in self.gateway.query(tier, Default::default(), token).await? {
                if now - record.last_accessed_at > retention {
                    stale.push(self.record_to_memory(record)?);
                }
            }
        }
        Ok(stale)
    }

    async fn transition_tier(
        &self,
        memory: &Memory,
        new_tier: Tier,
        token: &CancellationToken,
    ) -> MemoryResult<()> {
        self.transition(memory, new_tier, token).await
    }

    async fn counts(&self, token: &CancellationToken) -> MemoryResult<HashMap<Tier, usize>> {
        self.gateway.counts(token).await
    }

    async fn average_importance(&self, token: &CancellationToken) -> MemoryResult<f64> {
        let mut sum = 0.0;
        let mut n = 0usize;
        for tier in Tier::ALL {
            for record in self.gateway.query(tier, Default::default(), token).await? {
                sum += record.importance;
                n += 1;
            }
        }
        Ok(if n == 0 { 0.0 } else { sum / n as f64 })
    }

    async fn verify_integrity(&self, token: &CancellationToken) -> MemoryResult<()> {
        warn!("running gateway integrity verification");
        self.gateway.verify_integrity(token).await
    }

    async fn compact(&self, token: &CancellationToken) -> MemoryResult<()> {
        for tier in Tier::ALL {
            self.gateway.compact(tier, token).await?;
        }
        Ok(())
    }

    fn housekeep_caches(&self) {
        self.cache.housekeep();
    }
}
