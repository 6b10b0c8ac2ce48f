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

//! Consolidator
//!
//! Groups near-duplicate memories with leader clustering over cosine
//! similarity and merges each multi-member cluster into a single
//! representative. Pure compute: no I/O, nothing suspends. The lifecycle
//! manager persists the outcome.

use chrono::{DateTime, Utc};
use memtier_core::{ConfigHandle, ImportanceScorer, Memory, MemoryId, MemoryMetadata, TierPolicy};
use memtier_store::backend::cosine_similarity;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// One cluster's merge: the surviving memory and the members it replaces
#[derive(Debug, Clone)]
pub struct MergeResult {
    pub merged: Memory,
    pub members: Vec<Memory>,
}

/// Aggregate statistics for one consolidation run
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConsolidationReport {
    pub clusters_built: usize,
    pub members_merged: usize,
    pub merges_produced: usize,
    pub merges_rejected: usize,
    pub average_importance: f64,
    pub processing_ms: u64,
    /// merges_produced / multi-member clusters; 1.0 when nothing to do
    pub success_rate: f64,
}

/// Result of one consolidation run
#[derive(Debug, Clone)]
pub struct ConsolidationOutcome {
    /// Multi-member clusters that merged
    pub merges: Vec<MergeResult>,
    /// Memories that pass through unchanged
    pub untouched: Vec<Memory>,
    pub report: ConsolidationReport,
}

struct Cluster {
    /// Importance-weighted sum of member embeddings; cosine is
    /// scale-invariant so no re-normalization happens
    centroid: Vec<f32>,
    members: Vec<Memory>,
}

impl Cluster {
    fn seed(memory: Memory) -> Self {
        Self {
            centroid: memory.embedding.clone(),
            members: vec![memory],
        }
    }

    fn attach(&mut self, memory: Memory) {
        self.members.push(memory);
        let mut centroid = vec![0.0f32; self.centroid.len()];
        for member in &self.members {
            let weight = weight_of(member);
            for (c, x) in centroid.iter_mut().zip(member.embedding.iter()) {
                *c += weight * x;
            }
        }
        self.centroid = centroid;
    }
}

/// Importance weight with a floor so brand-new zero-importance memories
/// still pull the centroid.
fn weight_of(memory: &Memory) -> f32 {
    (memory.importance as f32).max(1e-6)
}

/// Clustering + merging of similar memories
pub struct Consolidator {
    config: ConfigHandle,
}

impl Consolidator {
    pub fn new(config: ConfigHandle) -> Self {
        Self { config }
    }

    /// Run one consolidation over `memories`.
    pub fn consolidate(&self, memories: Vec<Memory>, now: DateTime<Utc>) -> ConsolidationOutcome {
        let started = Instant::now();
        let config = self.config.snapshot();
        let threshold = config.consolidation.threshold as f32;
        let max_cluster = config.consolidation.max_cluster_size;
        let scorer = ImportanceScorer::new(
            config.consolidation.recency_decay_secs as f64,
            config.consolidation.max_access_count,
        );
        let policy = TierPolicy::new(config.tiers.clone());

        let total = memories.len();
        let clusters = self.cluster(memories, threshold, max_cluster);
        let clusters_built = clusters.len();

        let mut merges = Vec::new();
        let mut untouched = Vec::new();
        let mut rejected = 0usize;
        let mut candidates = 0usize;

        for cluster in clusters {
            if cluster.members.len() < 2 {
                untouched.extend(cluster.members);
                continue;
            }
            candidates += 1;
            // Reject merges of clusters whose members are not worth a
            // representative: the plain mean importance must clear the
            // consolidation threshold.
            let mean_importance: f64 = cluster.members.iter().map(|m| m.importance).sum::<f64>()
                / cluster.members.len() as f64;
            if mean_importance < config.consolidation.threshold {
                rejected += 1;
                untouched.extend(cluster.members);
                continue;
            }
            merges.push(self.merge(cluster.members, &scorer, &policy, now));
        }

        let merged_members: usize = merges.iter().map(|m| m.members.len()).sum();
        let average_importance = if merges.is_empty() {
            0.0
        } else {
            merges.iter().map(|m| m.merged.importance).sum::<f64>() / merges.len() as f64
        };
        let report = ConsolidationReport {
            clusters_built,
            members_merged: merged_members,
            merges_produced: merges.len(),
            merges_rejected: rejected,
            average_importance,
            processing_ms: started.elapsed().as_millis() as u64,
            success_rate: if candidates == 0 {
                1.0
            } else {
                merges.len() as f64 / candidates as f64
            },
        };
        info!(
            input = total,
            clusters = clusters_built,
            merges = report.merges_produced,
            rejected = report.merges_rejected,
            "consolidation finished"
        );

        ConsolidationOutcome {
            merges,
            untouched,
            report,
        }
    }

    /// Leader clustering: each memory joins the first existing cluster
    /// whose centroid is similar enough, else seeds a new one.
    fn cluster(&self, memories: Vec<Memory>, threshold: f32, max_cluster: usize) -> Vec<Cluster> {
        let mut clusters: Vec<Cluster> = Vec::new();
        for memory in memories {
            // Clusters never span owners
            let target = clusters.iter().position(|cluster| {
                cluster.members.len() < max_cluster
                    && cluster.members[0].owner_id == memory.owner_id
                    && cosine_similarity(&memory.embedding, &cluster.centroid) >= threshold
            });
            match target {
                Some(i) => clusters[i].attach(memory),
                None => clusters.push(Cluster::seed(memory)),
            }
        }
        clusters
    }

    /// Merge cluster members into one representative.
    fn merge(
        &self,
        mut members: Vec<Memory>,
        scorer: &ImportanceScorer,
        policy: &TierPolicy,
        now: DateTime<Utc>,
    ) -> MergeResult {
        // Content: most valuable member first
        members.sort_by(|a, b| {
            let ka = a.importance * scorer.recency(now, a.created_at);
            let kb = b.importance * scorer.recency(now, b.created_at);
            kb.partial_cmp(&ka).unwrap_or(std::cmp::Ordering::Equal)
        });
        let content = members
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        // Embedding: importance-weighted average
        let dim = members[0].embedding.len();
        let mut embedding = vec![0.0f32; dim];
        let mut weight_total = 0.0f32;
        for member in &members {
            let w = weight_of(member);
            weight_total += w;
            for (e, x) in embedding.iter_mut().zip(member.embedding.iter()) {
                *e += w * x;
            }
        }
        if weight_total > 0.0 {
            for e in &mut embedding {
                *e /= weight_total;
            }
        }

        // Importance: mean of importance * recency * access weight
        let importance = (members
            .iter()
            .map(|m| {
                m.importance
                    * scorer.recency(now, m.created_at)
                    * scorer.access_frequency(m.access_count)
            })
            .sum::<f64>()
            / members.len() as f64)
            .clamp(0.0, 1.0);

        let access_count = members.iter().map(|m| m.access_count).sum();
        let metadata = merge_metadata(&members);
        let tier = policy.candidate_tier(importance);

        let merged = Memory {
            id: MemoryId(Uuid::new_v4()),
            owner_id: members[0].owner_id.clone(),
            content,
            embedding,
            tier,
            importance,
            created_at: now,
            last_accessed_at: now,
            access_count,
            metadata,
        };
        debug!(
            merged_id = %merged.id,
            members = members.len(),
            importance = merged.importance,
            tier = %merged.tier,
            "merged cluster"
        );

        MergeResult { merged, members }
    }
}

/// Key-wise metadata merge: numeric extras average, everything else takes
/// the last member's value. The survivor records the merged members' ids.
fn merge_metadata(members: &[Memory]) -> MemoryMetadata {
    let n = members.len() as f64;
    let mut metadata = MemoryMetadata::default()
        .with_emotional_value(members.iter().map(|m| m.metadata.emotional_value).sum::<f64>() / n)
        .with_context_relevance(
            members.iter().map(|m| m.metadata.context_relevance).sum::<f64>() / n,
        );

    let mut tags: Vec<String> = Vec::new();
    for member in members {
        for tag in &member.metadata.tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        if member.metadata.source.is_some() {
            metadata.source = member.metadata.source.clone();
        }
    }
    metadata.tags = tags;
    metadata.connected_memories = members.iter().map(|m| m.id).collect();

    // Numeric extras average; other values are overwritten by the last
    // member carrying the key.
    let mut numeric: BTreeMap<String, (f64, u32)> = BTreeMap::new();
    for member in members {
        for (key, value) in &member.metadata.extra {
            if let Some(x) = value.as_f64() {
                let entry = numeric.entry(key.clone()).or_insert((0.0, 0));
                entry.0 += x;
                entry.1 += 1;
            } else {
                metadata.extra.insert(key.clone(), value.clone());
            }
        }
    }
    for (key, (sum, count)) in numeric {
        if let Some(avg) = serde_json::Number::from_f64(sum / count as f64) {
            metadata.extra.insert(key, Value::Number(avg));
        }
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use memtier_core::{EngineConfig, MemoryDraft, Tier};

    fn consolidator() -> Consolidator {
        Consolidator::new(ConfigHandle::new(EngineConfig::default()).unwrap())
    }

    fn memory(content: &str, embedding: Vec<f32>, importance: f64, access_count: u64) -> Memory {
        let mut m = Memory::from_draft(
            MemoryDraft::new("user-1", content, embedding),
            Tier::Active,
            importance,
            Utc::now(),
        );
        m.access_count = access_count;
        m
    }

    #[test]
    fn test_near_duplicates_merge_into_one() {
        let c = consolidator();
        let now = Utc::now();
        let members = vec![
            memory("likes jazz", vec![1.0, 0.02, 0.0], 0.8, 40),
            memory("enjoys jazz music", vec![0.98, 0.05, 0.01], 0.75, 30),
            memory("jazz fan", vec![0.99, 0.0, 0.03], 0.7, 20),
        ];
        let outcome = c.consolidate(members, now);

        assert_eq!(outcome.merges.len(), 1);
        assert!(outcome.untouched.is_empty());
        let merge = &outcome.merges[0];
        assert_eq!(merge.members.len(), 3);
        assert_eq!(merge.merged.access_count, 90);
        for text in ["likes jazz", "enjoys jazz music", "jazz fan"] {
            assert!(merge.merged.content.contains(text));
        }
        assert_eq!(merge.merged.created_at, now);
        assert_eq!(merge.merged.metadata.connected_memories.len(), 3);
        assert_eq!(outcome.report.members_merged, 3);
        assert_eq!(outcome.report.success_rate, 1.0);
    }

    #[test]
    fn test_dissimilar_memories_pass_through() {
        let c = consolidator();
        let memories = vec![
            memory("a", vec![1.0, 0.0, 0.0], 0.9, 10),
            memory("b", vec![0.0, 1.0, 0.0], 0.9, 10),
            memory("c", vec![0.0, 0.0, 1.0], 0.9, 10),
        ];
        let outcome = c.consolidate(memories, Utc::now());
        assert!(outcome.merges.is_empty());
        assert_eq!(outcome.untouched.len(), 3);
        assert_eq!(outcome.report.clusters_built, 3);
    }

    #[test]
    fn test_low_importance_cluster_rejected() {
        let c = consolidator();
        let memories = vec![
            memory("noise", vec![1.0, 0.0], 0.1, 0),
            memory("more noise", vec![0.99, 0.01], 0.2, 0),
        ];
        let outcome = c.consolidate(memories, Utc::now());
        assert!(outcome.merges.is_empty());
        assert_eq!(outcome.untouched.len(), 2);
        assert_eq!(outcome.report.merges_rejected, 1);
        assert_eq!(outcome.report.success_rate, 0.0);
    }

    #[test]
    fn test_consolidation_is_idempotent() {
        let c = consolidator();
        let now = Utc::now();
        let memories = vec![
            memory("first", vec![1.0, 0.01], 0.8, 50),
            memory("second", vec![0.99, 0.0], 0.85, 50),
        ];
        let first = c.consolidate(memories, now);
        assert_eq!(first.merges.len(), 1);

        // Feed the output back in: a single survivor forms a singleton
        // cluster and nothing merges again.
        let mut output: Vec<Memory> = first.merges.into_iter().map(|m| m.merged).collect();
        output.extend(first.untouched);
        let second = c.consolidate(output, now);
        assert!(second.merges.is_empty());
        assert_eq!(second.untouched.len(), 1);
    }

    #[test]
    fn test_merged_importance_formula() {
        let c = consolidator();
        let now = Utc::now();
        let memories = vec![
            memory("x", vec![1.0, 0.0], 0.8, 100),
            memory("y", vec![1.0, 0.0], 0.8, 100),
        ];
        let outcome = c.consolidate(memories, now);
        // Fresh memories at full access saturation: recency ~ 1 and
        // access weight 1, so the mean stays at 0.8.
        let merged = &outcome.merges[0].merged;
        assert!((merged.importance - 0.8).abs() < 1e-6);
        assert_eq!(merged.tier, Tier::Core);
    }

    #[test]
    fn test_content_ordered_by_value() {
        let c = consolidator();
        let now = Utc::now();
        let weak = memory("weak memory", vec![1.0, 0.0], 0.7, 10);
        let strong = memory("strong memory", vec![0.99, 0.01], 0.95, 10);
        let outcome = c.consolidate(vec![weak, strong], now);
        let content = &outcome.merges[0].merged.content;
        let strong_pos = content.find("strong memory").unwrap();
        let weak_pos = content.find("weak memory").unwrap();
        assert!(strong_pos < weak_pos);
        assert!(content.contains("\n\n"));
    }

    #[test]
    fn test_numeric_extras_average_on_merge() {
        let c = consolidator();
        let now = Utc::now();
        let mut a = memory("a", vec![1.0, 0.0], 0.8, 10);
        a.metadata = a.metadata.with_extra("confidence", serde_json::json!(0.4));
        let mut b = memory("b", vec![0.99, 0.01], 0.8, 10);
        b.metadata = b.metadata.with_extra("confidence", serde_json::json!(0.8));
        b.metadata = b.metadata.with_extra("label", serde_json::json!("travel"));

        let outcome = c.consolidate(vec![a, b], now);
        let extra = &outcome.merges[0].merged.metadata.extra;
        assert!((extra["confidence"].as_f64().unwrap() - 0.6).abs() < 1e-9);
        assert_eq!(extra["label"], serde_json::json!("travel"));
    }

    #[test]
    fn test_cluster_size_cap_respected() {
        let mut config = EngineConfig::default();
        config.consolidation.max_cluster_size = 2;
        let c = Consolidator::new(ConfigHandle::new(config).unwrap());
        let memories: Vec<Memory> = (0..4)
            .map(|i| memory(&format!("m{i}"), vec![1.0, 0.0], 0.8, 10))
            .collect();
        let outcome = c.consolidate(memories, Utc::now());
        assert_eq!(outcome.merges.len(), 2);
        for merge in &outcome.merges {
            assert_eq!(merge.members.len(), 2);
        }
    }
}
