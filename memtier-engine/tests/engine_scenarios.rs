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

//! End-to-end scenarios for the tiered memory engine: ingestion,
//! promotion, archival, consolidation, capacity enforcement, cache
//! coherence and cascading retrieval, all against the in-memory vector
//! backend and the deterministic mock embedder.

use chrono::{Duration, Utc};
use memtier_core::{ConfigHandle, EngineConfig, MemoryDraft, MemoryMetadata, Tier};
use memtier_engine::{LifecycleManager, MemoryAccess, MemoryService};
use memtier_store::{EmbeddingProvider, InMemoryBackend, MockEmbeddingProvider};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const DIM: usize = 32;

struct Harness {
    service: Arc<MemoryService>,
    lifecycle: LifecycleManager,
    embedder: MockEmbeddingProvider,
    token: CancellationToken,
}

fn harness(mutate: impl FnOnce(&mut EngineConfig)) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let mut config = EngineConfig::default();
    config.general.dimension = DIM;
    mutate(&mut config);
    let handle = ConfigHandle::new(config).unwrap();
    let service = Arc::new(MemoryService::new(
        Arc::new(InMemoryBackend::new()),
        Arc::new(MockEmbeddingProvider::new(DIM)),
        handle.clone(),
    ));
    let lifecycle = LifecycleManager::new(service.clone(), handle);
    Harness {
        service,
        lifecycle,
        embedder: MockEmbeddingProvider::new(DIM),
        token: CancellationToken::new(),
    }
}

fn draft(owner: &str, content: &str, embedding: Vec<f32>, emotional: f64, context: f64) -> MemoryDraft {
    MemoryDraft::new(owner, content, embedding).metadata(
        MemoryMetadata::default()
            .with_emotional_value(emotional)
            .with_context_relevance(context),
    )
}

/// A unit vector along one axis, with a small lean toward another axis.
fn axis_vector(axis: usize, lean: f32) -> Vec<f32> {
    let mut v = vec![0.0f32; DIM];
    v[axis] = 1.0;
    v[(axis + 1) % DIM] = lean;
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    v.iter().map(|x| x / norm).collect()
}

/// Scenario: a memory stored with strong affect signals starts in the
/// active tier and reaches core after sustained use plus one lifecycle
/// pass.
#[tokio::test]
async fn test_ingest_then_promote() {
    let h = harness(|_| {});
    let embedding = h.embedder.embed("the user is afraid of flying").await.unwrap();
    let id = h
        .service
        .store(
            draft("alice", "the user is afraid of flying", embedding, 0.95, 0.9),
            &h.token,
        )
        .await
        .unwrap();

    let stored = h.service.get(id, &h.token).await.unwrap().unwrap();
    assert_eq!(stored.tier, Tier::Active);
    assert!((stored.importance - 0.765).abs() < 1e-6);

    // Sixty accesses through the metrics path
    let mut view = vec![stored];
    for _ in 0..60 {
        h.service.update_access(&mut view, &h.token).await.unwrap();
    }
    assert_eq!(view[0].access_count, 60);

    let report = h.lifecycle.run_pass(&h.token).await.unwrap();
    assert!(!report.skipped);

    let after = h.service.get(id, &h.token).await.unwrap().unwrap();
    assert_eq!(after.tier, Tier::Core);
}

/// Scenario: a long-untouched, low-importance memory is archived into the
/// background tier by a single pass (and not deleted, since importance
/// still clears the cleanup floor).
#[tokio::test]
async fn test_age_out_and_archive() {
    let h = harness(|_| {});
    let embedding = h.embedder.embed("old trivia").await.unwrap();
    let id = h
        .service
        .store(draft("alice", "old trivia", embedding, 0.9, 0.9), &h.token)
        .await
        .unwrap();

    // Rewind the memory 200 days
    let mut memory = h.service.get(id, &h.token).await.unwrap().unwrap();
    memory.created_at = Utc::now() - Duration::days(200);
    memory.last_accessed_at = memory.created_at;
    memory.importance = 0.35;
    memory.access_count = 0;
    h.service.update(memory, &h.token).await.unwrap();

    h.lifecycle.run_pass(&h.token).await.unwrap();

    let after = h.service.get(id, &h.token).await.unwrap();
    let after = after.expect("archived, not deleted");
    assert_eq!(after.tier, Tier::Background);
}

/// Scenario: three near-duplicate memories collapse into one, whose
/// content carries all three texts and whose access count is the sum.
#[tokio::test]
async fn test_consolidate_three_near_duplicates() {
    let h = harness(|_| {});
    let texts = ["likes espresso", "enjoys espresso daily", "espresso drinker"];
    let mut ids = Vec::new();
    for (i, text) in texts.iter().enumerate() {
        // Pairwise cosine of these vectors stays above 0.85
        let embedding = axis_vector(0, 0.1 + i as f32 * 0.05);
        let id = h
            .service
            .store(draft("alice", text, embedding, 0.9, 0.9), &h.token)
            .await
            .unwrap();
        ids.push(id);
    }

    // Two retrievals so the members carry access counts
    let query = axis_vector(0, 0.12);
    for _ in 0..2 {
        let hits = h.service.retrieve("alice", query.clone(), 3, &h.token).await.unwrap();
        assert_eq!(hits.len(), 3);
    }

    let report = h.lifecycle.force_consolidation(&h.token).await.unwrap();
    assert_eq!(report.merges_produced, 1);
    assert_eq!(report.members_merged, 3);

    for id in &ids {
        assert!(h.service.get(*id, &h.token).await.unwrap().is_none());
    }

    let stats = h.lifecycle.stats(&h.token).await.unwrap();
    assert_eq!(stats.total_memories, 1);

    let mut survivors = Vec::new();
    for tier in Tier::ALL {
        survivors.extend(h.service.get_by_tier(tier, &h.token).await.unwrap());
    }
    assert_eq!(survivors.len(), 1);
    let merged = &survivors[0];
    for text in texts {
        assert!(merged.content.contains(text));
    }
    assert_eq!(merged.access_count, 6);
    assert_eq!(merged.metadata.connected_memories.len(), 3);
}

/// Scenario: with a global cap of four, storing six memories and running
/// one pass deletes exactly the two least important ones.
#[tokio::test]
async fn test_capacity_enforcement() {
    let h = harness(|config| {
        config.general.max_total_memories = 4;
        // Freeze importance drift so the ranking is exact
        config.consolidation.importance_change_rate = 0.0;
    });

    let importances = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6];
    let mut ids = Vec::new();
    for (i, importance) in importances.iter().enumerate() {
        let text = format!("memory number {i}");
        let embedding = h.embedder.embed(&text).await.unwrap();
        let id = h
            .service
            .store(draft("alice", &text, embedding, 0.5, 0.5), &h.token)
            .await
            .unwrap();
        let mut memory = h.service.get(id, &h.token).await.unwrap().unwrap();
        memory.importance = *importance;
        h.service.update(memory, &h.token).await.unwrap();
        ids.push(id);
    }

    h.lifecycle.run_pass(&h.token).await.unwrap();

    let stats = h.lifecycle.stats(&h.token).await.unwrap();
    assert_eq!(stats.total_memories, 4);
    // The two cheapest memories are gone, the rest survive
    assert!(h.service.get(ids[0], &h.token).await.unwrap().is_none());
    assert!(h.service.get(ids[1], &h.token).await.unwrap().is_none());
    for id in &ids[2..] {
        assert!(h.service.get(*id, &h.token).await.unwrap().is_some());
    }
}

/// Scenario: after a core memory is demoted, no read path ever reports it
/// as core again.
#[tokio::test]
async fn test_cache_coherence_under_transition() {
    let h = harness(|_| {});
    let embedding = h.embedder.embed("the user's name is Ana").await.unwrap();
    // Maximum affect signals: ingestion importance 0.8 lands in core
    let id = h
        .service
        .store(
            draft("alice", "the user's name is Ana", embedding.clone(), 1.0, 1.0),
            &h.token,
        )
        .await
        .unwrap();

    let first = h
        .service
        .retrieve("alice", embedding.clone(), 1, &h.token)
        .await
        .unwrap();
    assert_eq!(first[0].tier, Tier::Core);
    assert!(h.service.cache_stats(Tier::Core).entry_count >= 1);

    // Forced demotion
    let memory = h.service.get(id, &h.token).await.unwrap().unwrap();
    h.service
        .transition(&memory, Tier::Active, &h.token)
        .await
        .unwrap();

    let second = h.service.retrieve("alice", embedding, 1, &h.token).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id, id);
    assert_ne!(second[0].tier, Tier::Core);
}

/// Scenario: cascading retrieval fills from core, then active, and never
/// reaches background once k is satisfied.
#[tokio::test]
async fn test_retrieve_k_cascade() {
    let h = harness(|_| {});
    let shared = axis_vector(3, 0.0);

    let populate = |tier: Tier, importance: f64, count: usize| {
        let service = h.service.clone();
        let token = h.token.clone();
        let shared = shared.clone();
        async move {
            for i in 0..count {
                let text = format!("{tier} fact {i}");
                let id = service
                    .store(draft("alice", &text, shared.clone(), 0.5, 0.5), &token)
                    .await
                    .unwrap();
                let mut memory = service.get(id, &token).await.unwrap().unwrap();
                memory.tier = tier;
                memory.importance = importance;
                service.update(memory, &token).await.unwrap();
            }
        }
    };
    populate(Tier::Core, 0.9, 3).await;
    populate(Tier::Active, 0.5, 5).await;
    populate(Tier::Background, 0.2, 10).await;

    let results = h
        .service
        .retrieve("alice", shared.clone(), 7, &h.token)
        .await
        .unwrap();
    assert_eq!(results.len(), 7);
    assert!(results[..3].iter().all(|m| m.tier == Tier::Core));
    assert!(results[3..].iter().all(|m| m.tier == Tier::Active));
    assert!(results.iter().all(|m| m.tier != Tier::Background));
    assert!(results.iter().all(|m| m.owner_id == "alice"));
}

/// Retrieval never hands back more than k results, and never another
/// owner's memories, whatever the store holds.
#[tokio::test]
async fn test_retrieve_respects_k_and_owner() {
    let h = harness(|_| {});
    let shared = axis_vector(5, 0.0);
    for owner in ["alice", "bob"] {
        for i in 0..6 {
            let text = format!("{owner} note {i}");
            h.service
                .store(draft(owner, &text, shared.clone(), 0.5, 0.5), &h.token)
                .await
                .unwrap();
        }
    }

    for k in [0, 1, 4, 20] {
        let results = h
            .service
            .retrieve("bob", shared.clone(), k, &h.token)
            .await
            .unwrap();
        assert!(results.len() <= k);
        assert!(results.iter().all(|m| m.owner_id == "bob"));
    }
}

/// The core-tier fast path answers a repeated text query from the cache
/// and stays coherent with the store.
#[tokio::test]
async fn test_text_query_fast_path() {
    let h = harness(|_| {});
    let text = "the user works night shifts";
    let embedding = h.embedder.embed(text).await.unwrap();
    let id = h
        .service
        .store(draft("alice", text, embedding, 1.0, 1.0), &h.token)
        .await
        .unwrap();

    let first = h.service.retrieve("alice", text, 1, &h.token).await.unwrap();
    assert_eq!(first[0].id, id);
    let hits_before = h.service.cache_stats(Tier::Core).hits;

    let second = h.service.retrieve("alice", text, 1, &h.token).await.unwrap();
    assert_eq!(second[0].id, id);
    assert_eq!(second[0].tier, Tier::Core);
    assert!(h.service.cache_stats(Tier::Core).hits > hits_before);
}

/// A cancelled token aborts retrieval with a retryable error.
#[tokio::test]
async fn test_cancellation_aborts_retrieve() {
    let h = harness(|_| {});
    let embedding = h.embedder.embed("anything").await.unwrap();
    h.service
        .store(draft("alice", "anything", embedding.clone(), 0.5, 0.5), &h.token)
        .await
        .unwrap();

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let err = h
        .service
        .retrieve("alice", embedding, 5, &cancelled)
        .await
        .expect_err("cancelled retrieval");
    assert!(err.is_retryable());
}

/// Lifecycle statistics reflect stored memories and completed cycles.
#[tokio::test]
async fn test_stats_snapshot() {
    let h = harness(|_| {});
    for i in 0..4 {
        let text = format!("fact {i}");
        let embedding = h.embedder.embed(&text).await.unwrap();
        h.service
            .store(draft("alice", &text, embedding, 0.5, 0.5), &h.token)
            .await
            .unwrap();
    }
    h.lifecycle.run_pass(&h.token).await.unwrap();

    let stats = h.lifecycle.stats(&h.token).await.unwrap();
    assert_eq!(stats.total_memories, 4);
    assert_eq!(stats.cycles_run, 1);
    assert_eq!(stats.cycles_failed, 0);
    assert_eq!(stats.success_rate, 1.0);
    assert!(stats.average_importance > 0.0);
    assert_eq!(
        stats.per_tier.values().sum::<usize>(),
        stats.total_memories
    );
}
