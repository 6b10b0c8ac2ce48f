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

//! Lifecycle manager
//!
//! The periodic orchestrator: refresh stats, trigger consolidation,
//! evolve every memory, re-evaluate tier membership, then clean up.
//! Exactly one pass runs at a time; the whole pass sits behind the retry
//! boundary, and a pass that exhausts its retries triggers the gateway
//! integrity hook and is reflected in the cycle stats.

use crate::consolidator::{ConsolidationReport, Consolidator};
use crate::evolver::Evolver;
use crate::service::MemoryAccess;
use crate::stats::{MemoryStatsSnapshot, PassReport};
use chrono::{DateTime, Utc};
use memtier_core::{
    ConfigHandle, ImportanceScorer, Memory, MemoryError, MemoryId, MemoryResult, RetryPolicy,
    Tier, TierPolicy,
};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
struct LifecycleState {
    last_consolidation: DateTime<Utc>,
    consolidation_count: u64,
    cycles_run: u64,
    cycles_failed: u64,
}

/// Periodic orchestrator over the memory service
pub struct LifecycleManager {
    service: Arc<dyn MemoryAccess>,
    consolidator: Consolidator,
    evolver: Evolver,
    config: ConfigHandle,
    /// Single-flight guard; passes never overlap
    pass_guard: Mutex<()>,
    state: SyncMutex<LifecycleState>,
}

impl LifecycleManager {
    pub fn new(service: Arc<dyn MemoryAccess>, config: ConfigHandle) -> Self {
        Self {
            service,
            consolidator: Consolidator::new(config.clone()),
            evolver: Evolver::new(config.clone()),
            config: config.clone(),
            pass_guard: Mutex::new(()),
            state: SyncMutex::new(LifecycleState {
                last_consolidation: Utc::now(),
                consolidation_count: 0,
                cycles_run: 0,
                cycles_failed: 0,
            }),
        }
    }

    /// Drive passes on the configured schedule until cancelled. A second
    /// ticker runs the cheaper cache housekeeping between passes.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let config = self.config.snapshot();
        let interval_secs = config.consolidation.schedule_interval_secs;
        let mut pass_ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        pass_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut cleanup_ticker =
            tokio::time::interval(Duration::from_secs(config.general.cleanup_interval_secs));
        cleanup_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs, "lifecycle loop started");

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("lifecycle loop stopped");
                    return;
                }
                _ = pass_ticker.tick() => {
                    if let Err(err) = self.run_pass(&token).await {
                        error!(error = %err, "lifecycle pass failed; continuing on next tick");
                    }
                }
                _ = cleanup_ticker.tick() => {
                    self.service.housekeep_caches();
                }
            }
        }
    }

    /// Run one full pass. A pass already in flight turns this call into a
    /// no-op (`PassReport::skipped`).
    pub async fn run_pass(&self, token: &CancellationToken) -> MemoryResult<PassReport> {
        let Ok(_guard) = self.pass_guard.try_lock() else {
            debug!("lifecycle pass already in flight, skipping");
            return Ok(PassReport::skipped());
        };

        let retry = RetryPolicy::new(&self.config.snapshot().general.retry);
        let result = retry.run("lifecycle pass", || self.execute_pass(token)).await;

        let mut state = self.state.lock();
        state.cycles_run += 1;
        match result {
            Ok(report) => Ok(report),
            Err(err) => {
                state.cycles_failed += 1;
                drop(state);
                error!(error = %err, "lifecycle pass exhausted retries");
                if let Err(verify_err) = self.service.verify_integrity(token).await {
                    warn!(error = %verify_err, "gateway integrity verification failed");
                }
                Err(err)
            }
        }
    }

    /// On-demand consolidation; runs only the consolidation step.
    pub async fn force_consolidation(
        &self,
        token: &CancellationToken,
    ) -> MemoryResult<ConsolidationReport> {
        let _guard = self.pass_guard.lock().await;
        self.consolidate_all(Utc::now(), token).await
    }

    /// Store-wide statistics plus lifecycle counters.
    pub async fn stats(&self, token: &CancellationToken) -> MemoryResult<MemoryStatsSnapshot> {
        let per_tier = self.service.counts(token).await?;
        let total = per_tier.values().sum();
        let average_importance = self.service.average_importance(token).await?;
        let state = self.state.lock().clone();
        let success_rate = if state.cycles_run == 0 {
            1.0
        } else {
            (state.cycles_run - state.cycles_failed) as f64 / state.cycles_run as f64
        };
        Ok(MemoryStatsSnapshot {
            total_memories: total,
            per_tier,
            average_importance,
            consolidation_count: state.consolidation_count,
            last_consolidation: Some(state.last_consolidation),
            cycles_run: state.cycles_run,
            cycles_failed: state.cycles_failed,
            success_rate,
        })
    }

    async fn execute_pass(&self, token: &CancellationToken) -> MemoryResult<PassReport> {
        let started = Instant::now();
        let config = self.config.snapshot();
        let now = Utc::now();
        let mut report = PassReport::default();

        // 1. Refresh stats
        let counts = self.service.counts(token).await?;
        let total: usize = counts.values().sum();
        let average_importance = self.service.average_importance(token).await?;
        debug!(total, average_importance, "lifecycle stats refreshed");

        // 2. Consolidation trigger
        let since_last = now - self.state.lock().last_consolidation;
        let time_threshold =
            chrono::Duration::seconds(config.consolidation.time_threshold_secs as i64);
        if total > config.consolidation.memory_threshold || since_last > time_threshold {
            report.consolidation = Some(self.consolidate_all(now, token).await?);
        }

        // 3. Evolution pass
        let mut moved: HashSet<MemoryId> = HashSet::new();
        for tier in Tier::ALL {
            for memory in self.service.get_by_tier(tier, token).await? {
                let outcome = self.evolver.evolve(&memory, now);
                if outcome.reinforced {
                    report.reinforced += 1;
                }
                if outcome.evolved {
                    if outcome.memory.tier != memory.tier {
                        moved.insert(memory.id);
                        report.transitions += 1;
                    }
                    self.service.update(outcome.memory, token).await?;
                    report.evolved += 1;
                }
            }
        }

        // 4. Tier management, most valuable tier first; a memory moves at
        // most once per pass.
        let scorer = ImportanceScorer::new(
            config.consolidation.recency_decay_secs as f64,
            config.consolidation.max_access_count,
        );
        let policy = TierPolicy::new(config.tiers.clone());
        for tier in Tier::ALL {
            for memory in self.service.get_by_tier(tier, token).await? {
                if moved.contains(&memory.id) {
                    continue;
                }
                let score = scorer.current_score(&memory, now);
                let Some(target) = policy.evaluate(&memory, score, &scorer, now) else {
                    continue;
                };
                match self.service.transition_tier(&memory, target, token).await {
                    Ok(()) => {
                        moved.insert(memory.id);
                        report.transitions += 1;
                    }
                    Err(MemoryError::InvalidTransition { reason, .. }) => {
                        debug!(memory_id = %memory.id, reason, "transition rejected");
                    }
                    Err(MemoryError::NotFound(_)) => {
                        // Vanished mid-pass (consolidated or deleted)
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        // 5. Cleanup
        report.deleted += self.cleanup(&config, now, token).await?;

        // Housekeeping: cache self-tuning, then best-effort compaction
        self.service.housekeep_caches();
        if let Err(err) = self.service.compact(token).await {
            warn!(error = %err, "store compaction failed");
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            evolved = report.evolved,
            transitions = report.transitions,
            deleted = report.deleted,
            duration_ms = report.duration_ms,
            "lifecycle pass finished"
        );
        Ok(report)
    }

    async fn consolidate_all(
        &self,
        now: DateTime<Utc>,
        token: &CancellationToken,
    ) -> MemoryResult<ConsolidationReport> {
        let mut memories: Vec<Memory> = Vec::new();
        for tier in Tier::ALL {
            memories.extend(self.service.get_by_tier(tier, token).await?);
        }

        let outcome = self.consolidator.consolidate(memories, now);
        for merge in &outcome.merges {
            let member_ids: Vec<MemoryId> = merge.members.iter().map(|m| m.id).collect();
            self.service
                .replace_with_merged(merge.merged.clone(), member_ids, token)
                .await?;
        }

        let mut state = self.state.lock();
        state.last_consolidation = now;
        state.consolidation_count += 1;
        Ok(outcome.report)
    }

    async fn cleanup(
        &self,
        config: &memtier_core::EngineConfig,
        now: DateTime<Utc>,
        token: &CancellationToken,
    ) -> MemoryResult<usize> {
        let mut deleted = 0usize;
        let batch_size = config.general.batch_size;

        // Expired background memories with nothing left to offer
        let max_age = chrono::Duration::seconds(config.evolution.max_age_secs as i64);
        for memory in self.service.get_by_tier(Tier::Background, token).await? {
            if memory.age(now) > max_age && memory.importance < config.evolution.demotion_threshold
            {
                self.service.delete(memory.id, token).await?;
                deleted += 1;
            }
        }

        // Stale sweep: demote memories idle past their tier's retention,
        // one step at a time, in bounded batches until none are left.
        // Bottom-tier staleness is the expiry rule above; importance
        // still shields those rows here. Every processed memory descends
        // the tier ladder or leaves the store, so at most two rounds of
        // work exist per memory; the round cap derived from the first
        // fetch only guards against a backend feeding rows back.
        let mut rounds_left: Option<usize> = None;
        loop {
            let stale: Vec<Memory> = self
                .service
                .get_stale(now, token)
                .await?
                .into_iter()
                .filter(|m| m.tier.demoted().is_some())
                .collect();
            if stale.is_empty() {
                break;
            }
            let rounds = rounds_left.get_or_insert(2 * (stale.len() / batch_size + 2));
            if *rounds == 0 {
                warn!(remaining = stale.len(), "stale sweep did not drain, giving up");
                break;
            }
            *rounds -= 1;

            for memory in stale.into_iter().take(batch_size) {
                let Some(lower) = memory.tier.demoted() else {
                    continue;
                };
                match self.service.transition_tier(&memory, lower, token).await {
                    Ok(()) | Err(MemoryError::NotFound(_)) => {}
                    Err(MemoryError::InvalidTransition { .. }) => {
                        self.service.delete(memory.id, token).await?;
                        deleted += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        // Per-tier capacity bound: push the least important members down,
        // or out of the bottom tier.
        for tier in Tier::ALL {
            let mut members = self.service.get_by_tier(tier, token).await?;
            let capacity = config.tiers.get(tier).capacity;
            if members.len() <= capacity {
                continue;
            }
            members.sort_by(|a, b| {
                a.importance
                    .partial_cmp(&b.importance)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let excess = members.len() - capacity;
            for memory in members.into_iter().take(excess) {
                match tier.demoted() {
                    Some(lower) => {
                        if self
                            .service
                            .transition_tier(&memory, lower, token)
                            .await
                            .is_err()
                        {
                            self.service.delete(memory.id, token).await?;
                            deleted += 1;
                        }
                    }
                    None => {
                        self.service.delete(memory.id, token).await?;
                        deleted += 1;
                    }
                }
            }
        }

        // Global bound: evict the least important memories, batch by
        // batch, until the store fits.
        loop {
            let counts = self.service.counts(token).await?;
            let total: usize = counts.values().sum();
            if total <= config.general.max_total_memories {
                break;
            }
            let mut all: Vec<Memory> = Vec::new();
            for tier in Tier::ALL {
                all.extend(self.service.get_by_tier(tier, token).await?);
            }
            all.sort_by(|a, b| {
                a.importance
                    .partial_cmp(&b.importance)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let excess = total - config.general.max_total_memories;
            for memory in all.into_iter().take(excess.min(batch_size)) {
                self.service.delete(memory.id, token).await?;
                deleted += 1;
            }
        }

        if deleted > 0 {
            info!(deleted, "cleanup removed memories");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::MemoryService;
    use memtier_core::{EngineConfig, MemoryDraft, MemoryMetadata};
    use memtier_store::{EmbeddingProvider, InMemoryBackend, MockEmbeddingProvider};

    const DIM: usize = 32;

    fn setup(mut config: EngineConfig) -> (Arc<MemoryService>, LifecycleManager) {
        config.general.dimension = DIM;
        let handle = ConfigHandle::new(config).unwrap();
        let service = Arc::new(MemoryService::new(
            Arc::new(InMemoryBackend::new()),
            Arc::new(MockEmbeddingProvider::new(DIM)),
            handle.clone(),
        ));
        let manager = LifecycleManager::new(service.clone(), handle);
        (service, manager)
    }

    #[tokio::test]
    async fn test_pass_on_empty_store_succeeds() {
        let (_, manager) = setup(EngineConfig::default());
        let token = CancellationToken::new();
        let report = manager.run_pass(&token).await.unwrap();
        assert!(!report.skipped);
        assert_eq!(report.evolved, 0);
        assert_eq!(report.deleted, 0);

        let stats = manager.stats(&token).await.unwrap();
        assert_eq!(stats.total_memories, 0);
        assert_eq!(stats.cycles_run, 1);
        assert_eq!(stats.success_rate, 1.0);
    }

    #[tokio::test]
    async fn test_single_flight_skips_overlapping_pass() {
        let (_, manager) = setup(EngineConfig::default());
        let token = CancellationToken::new();

        let _held = manager.pass_guard.lock().await;
        let report = manager.run_pass(&token).await.unwrap();
        assert!(report.skipped);
    }

    #[tokio::test]
    async fn test_force_consolidation_merges_duplicates() {
        let (service, manager) = setup(EngineConfig::default());
        let token = CancellationToken::new();

        // Same text, same mock embedding: guaranteed cluster mates
        let embedding = MockEmbeddingProvider::new(DIM)
            .embed("duplicated fact")
            .await
            .unwrap();
        for _ in 0..3 {
            let draft = MemoryDraft::new("u", "duplicated fact", embedding.clone()).metadata(
                MemoryMetadata::default()
                    .with_emotional_value(0.9)
                    .with_context_relevance(0.9),
            );
            service.store(draft, &token).await.unwrap();
        }

        let report = manager.force_consolidation(&token).await.unwrap();
        assert_eq!(report.merges_produced, 1);
        assert_eq!(report.members_merged, 3);

        let stats = manager.stats(&token).await.unwrap();
        assert_eq!(stats.total_memories, 1);
        assert_eq!(stats.consolidation_count, 1);
    }

    #[tokio::test]
    async fn test_global_capacity_enforced() {
        let mut config = EngineConfig::default();
        config.general.max_total_memories = 2;
        // Freeze evolution so importances stay put
        config.consolidation.importance_change_rate = 0.0;
        let (service, manager) = setup(config);
        let token = CancellationToken::new();

        let embedder = MockEmbeddingProvider::new(DIM);
        for (text, importance) in [("one", 0.2), ("two", 0.5), ("three", 0.8)] {
            let embedding = embedder.embed(text).await.unwrap();
            let id = service
                .store(MemoryDraft::new("u", text, embedding), &token)
                .await
                .unwrap();
            let mut memory = service.get(id, &token).await.unwrap().unwrap();
            memory.importance = importance;
            service.update(memory, &token).await.unwrap();
        }

        manager.run_pass(&token).await.unwrap();

        let stats = manager.stats(&token).await.unwrap();
        assert_eq!(stats.total_memories, 2);
        // The least important memory is the one that went away
        let mut survivors = Vec::new();
        for tier in Tier::ALL {
            survivors.extend(service.get_by_tier(tier, &token).await.unwrap());
        }
        assert!(survivors.iter().all(|m| m.importance > 0.2));
    }
}
