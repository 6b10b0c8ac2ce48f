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

//! Evolver
//!
//! Per-memory, per-cycle aging and reinforcement. Important and frequently
//! accessed memories age slower; stale, unimportant, untouched memories
//! drift toward archival. Pure given `now`; the lifecycle manager persists
//! whatever actually changed.

use chrono::{DateTime, Utc};
use memtier_core::{ConfigHandle, EvolutionEvent, Memory, Tier, TierPolicy, ImportanceScorer};
use tracing::debug;

/// Importance changes smaller than this do not count as evolution
const IMPORTANCE_EPSILON: f64 = 1e-9;

/// Outcome of one evolution cycle for one memory
#[derive(Debug, Clone)]
pub struct EvolutionOutcome {
    /// The evolved memory when something changed, otherwise the original
    pub memory: Memory,
    /// Importance or tier moved
    pub evolved: bool,
    /// Archival probability exceeded the threshold; tier forced to
    /// background
    pub archived: bool,
    /// Reinforcement score exceeded the threshold this cycle
    pub reinforced: bool,
}

/// Periodic per-memory aging/reinforcement
pub struct Evolver {
    config: ConfigHandle,
}

impl Evolver {
    pub fn new(config: ConfigHandle) -> Self {
        Self { config }
    }

    /// Run one cycle over a single memory.
    pub fn evolve(&self, memory: &Memory, now: DateTime<Utc>) -> EvolutionOutcome {
        let config = self.config.snapshot();
        let evolution = &config.evolution;
        let scorer = ImportanceScorer::new(
            config.consolidation.recency_decay_secs as f64,
            config.consolidation.max_access_count,
        );
        let policy = TierPolicy::new(config.tiers.clone());

        let age_secs = memory.age(now).num_milliseconds().max(0) as f64 / 1000.0;
        let access_modifier = scorer.access_frequency(memory.access_count);

        // Aging factor: importance and usage slow the decay down
        let aging_factor = (-age_secs / evolution.aging_decay_secs as f64).exp()
            * (1.0 + 0.5 * memory.importance + access_modifier);

        // Reinforcement: recent use plus the standing affect signals
        let reinforcement = 0.4 * scorer.recency(now, memory.last_accessed_at)
            + 0.3 * memory.metadata.emotional_value.clamp(0.0, 1.0)
            + 0.3 * memory.metadata.context_relevance.clamp(0.0, 1.0);
        let reinforced = reinforcement > evolution.reinforcement_threshold;

        // Archival pressure: old, unimportant and untouched
        let age_ratio = (age_secs / evolution.max_age_secs as f64).min(1.0);
        let archival_probability = 0.4 * age_ratio
            + 0.3 * (1.0 - memory.importance)
            + 0.3 * (1.0 - access_modifier);
        let archived = archival_probability > evolution.archival_threshold;

        let delta = (reinforcement - (1.0 - aging_factor))
            * config.consolidation.importance_change_rate;
        let new_importance = (memory.importance + delta).clamp(0.0, 1.0);

        let new_tier = if archived {
            Tier::Background
        } else {
            // Candidate bucket for the new score, approached one step at
            // a time from the current tier.
            step_toward(memory.tier, policy.candidate_tier(new_importance))
        };

        let importance_changed = (new_importance - memory.importance).abs() > IMPORTANCE_EPSILON;
        let tier_changed = new_tier != memory.tier;
        if !importance_changed && !tier_changed {
            return EvolutionOutcome {
                memory: memory.clone(),
                evolved: false,
                archived,
                reinforced,
            };
        }

        let mut evolved = memory.clone();
        evolved.importance = new_importance;
        evolved.tier = new_tier;
        evolved.metadata.evolution_history.push(EvolutionEvent {
            at: now,
            aging_factor,
            reinforcement,
            importance_delta: new_importance - memory.importance,
        });
        debug!(
            memory_id = %memory.id,
            aging_factor,
            reinforcement,
            delta,
            old_tier = %memory.tier,
            new_tier = %new_tier,
            archived,
            "memory evolved"
        );

        EvolutionOutcome {
            memory: evolved,
            evolved: true,
            archived,
            reinforced,
        }
    }
}

/// One tier step from `from` toward `target`.
fn step_toward(from: Tier, target: Tier) -> Tier {
    use std::cmp::Ordering;
    // Tier derives Ord with Core < Active < Background
    match target.cmp(&from) {
        Ordering::Less => from.promoted().unwrap_or(from),
        Ordering::Greater => from.demoted().unwrap_or(from),
        Ordering::Equal => from,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memtier_core::{EngineConfig, MemoryDraft, MemoryMetadata};

    fn evolver() -> Evolver {
        Evolver::new(ConfigHandle::new(EngineConfig::default()).unwrap())
    }

    fn memory(
        tier: Tier,
        importance: f64,
        age_days: i64,
        access_count: u64,
        now: DateTime<Utc>,
    ) -> Memory {
        let created = now - chrono::Duration::days(age_days);
        let mut m = Memory::from_draft(
            MemoryDraft::new("u", "text", vec![0.0; 4]).metadata(
                MemoryMetadata::default()
                    .with_emotional_value(0.5)
                    .with_context_relevance(0.5),
            ),
            tier,
            importance,
            created,
        );
        m.access_count = access_count;
        m
    }

    #[test]
    fn test_step_toward_is_single_step() {
        assert_eq!(step_toward(Tier::Background, Tier::Core), Tier::Active);
        assert_eq!(step_toward(Tier::Core, Tier::Background), Tier::Active);
        assert_eq!(step_toward(Tier::Active, Tier::Core), Tier::Core);
        assert_eq!(step_toward(Tier::Active, Tier::Active), Tier::Active);
    }

    #[test]
    fn test_fresh_used_memory_gains_importance() {
        let e = evolver();
        let now = Utc::now();
        let m = memory(Tier::Active, 0.6, 0, 50, now);
        let outcome = e.evolve(&m, now);

        assert!(outcome.evolved);
        assert!(!outcome.archived);
        assert!(outcome.memory.importance > 0.6);
        assert_eq!(outcome.memory.metadata.evolution_history.len(), 1);
        let event = *outcome.memory.metadata.evolution_history.latest().unwrap();
        assert!(event.importance_delta > 0.0);
    }

    #[test]
    fn test_old_untouched_memory_archives() {
        let e = evolver();
        let now = Utc::now();
        let mut m = memory(Tier::Active, 0.35, 200, 0, now);
        m.last_accessed_at = m.created_at;
        let outcome = e.evolve(&m, now);

        // p = 0.4*1 + 0.3*0.65 + 0.3*1 = 0.895 > 0.8
        assert!(outcome.archived);
        assert_eq!(outcome.memory.tier, Tier::Background);
        assert!(outcome.evolved);
    }

    #[test]
    fn test_unchanged_memory_reports_no_evolution() {
        let mut config = EngineConfig::default();
        config.consolidation.importance_change_rate = 0.0;
        let e = Evolver::new(ConfigHandle::new(config).unwrap());
        let now = Utc::now();
        // Importance matching its tier bucket, so no tier drift either
        let m = memory(Tier::Active, 0.6, 0, 50, now);
        let outcome = e.evolve(&m, now);

        assert!(!outcome.evolved);
        assert_eq!(outcome.memory, m);
        assert!(outcome.memory.metadata.evolution_history.is_empty());
    }

    #[test]
    fn test_importance_stays_in_unit_interval() {
        let e = evolver();
        let now = Utc::now();
        for (tier, importance, age, count) in [
            (Tier::Core, 1.0, 0, 1_000),
            (Tier::Background, 0.0, 400, 0),
            (Tier::Active, 0.5, 45, 10),
        ] {
            let m = memory(tier, importance, age, count, now);
            let outcome = e.evolve(&m, now);
            assert!((0.0..=1.0).contains(&outcome.memory.importance));
        }
    }

    #[test]
    fn test_promotion_candidate_moves_one_step_only() {
        let e = evolver();
        let now = Utc::now();
        // Background memory whose new score lands in core territory
        let m = memory(Tier::Background, 0.85, 0, 100, now);
        let outcome = e.evolve(&m, now);
        assert!(!outcome.archived);
        assert_eq!(outcome.memory.tier, Tier::Active);
    }

    #[test]
    fn test_reinforcement_flag() {
        let e = evolver();
        let now = Utc::now();
        // Just accessed with strong affect signals
        let mut m = memory(Tier::Active, 0.6, 10, 20, now);
        m.metadata.emotional_value = 0.9;
        m.metadata.context_relevance = 0.9;
        m.last_accessed_at = now;
        let outcome = e.evolve(&m, now);
        // r = 0.4*1 + 0.3*0.9 + 0.3*0.9 = 0.94 > 0.6
        assert!(outcome.reinforced);
    }
}
