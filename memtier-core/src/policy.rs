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

//! Tier policy
//!
//! Decides where a memory belongs. Promotion requires importance, usage
//! volume and usage frequency together; demotion fires on inactivity or
//! decayed importance. Tiers move one step per evaluation; a background
//! memory can never jump straight to core.

use crate::config::TierTable;
use crate::memory::{Memory, Tier};
use crate::scoring::ImportanceScorer;
use chrono::{DateTime, Utc};

/// Tier placement decisions, parameterized by the tier table
#[derive(Debug, Clone)]
pub struct TierPolicy {
    tiers: TierTable,
}

impl TierPolicy {
    pub fn new(tiers: TierTable) -> Self {
        Self { tiers }
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    /// Straightforward bucket for a score: `>=0.8` core, `>=0.4` active,
    /// else background. Used at ingestion and as the post-merge tie-break.
    pub fn candidate_tier(&self, importance: f64) -> Tier {
        if importance >= self.tiers.core.min_importance {
            Tier::Core
        } else if importance >= self.tiers.active.min_importance {
            Tier::Active
        } else {
            Tier::Background
        }
    }

    /// Promotion predicate from the memory's current tier
    pub fn should_promote(&self, memory: &Memory, importance: f64, scorer: &ImportanceScorer) -> bool {
        let settings = self.tiers.get(memory.tier);
        memory.tier.promoted().is_some()
            && importance >= settings.promotion_threshold
            && memory.access_count >= settings.min_access_count
            && scorer.access_frequency(memory.access_count) >= settings.min_access_frequency
    }

    /// Demotion predicate from the memory's current tier
    pub fn should_demote(&self, memory: &Memory, importance: f64, now: DateTime<Utc>) -> bool {
        let settings = self.tiers.get(memory.tier);
        if memory.tier.demoted().is_none() {
            return false;
        }
        let inactive = memory.idle(now) > settings.max_inactivity();
        let decayed = importance * (1.0 - settings.decay_rate) < settings.demotion_threshold;
        inactive || decayed
    }

    /// One-step tier recommendation for a re-scored memory; `None` means
    /// the memory stays put.
    pub fn evaluate(
        &self,
        memory: &Memory,
        importance: f64,
        scorer: &ImportanceScorer,
        now: DateTime<Utc>,
    ) -> Option<Tier> {
        if self.should_promote(memory, importance, scorer) {
            return memory.tier.promoted();
        }
        if self.should_demote(memory, importance, now) {
            return memory.tier.demoted();
        }
        None
    }

    /// Whether a memory may reside in `tier` at all
    pub fn admits(&self, tier: Tier, importance: f64) -> bool {
        importance >= self.tiers.get(tier).min_importance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryDraft, Tier};

    fn policy() -> TierPolicy {
        TierPolicy::new(TierTable::default())
    }

    fn scorer() -> ImportanceScorer {
        ImportanceScorer::new(30.0 * 86_400.0, 100)
    }

    fn memory_at(tier: Tier, importance: f64, access_count: u64, now: DateTime<Utc>) -> Memory {
        let mut m = Memory::from_draft(
            MemoryDraft::new("u", "text", vec![0.0; 4]),
            tier,
            importance,
            now,
        );
        m.access_count = access_count;
        m
    }

    #[test]
    fn test_candidate_buckets() {
        let p = policy();
        assert_eq!(p.candidate_tier(0.95), Tier::Core);
        assert_eq!(p.candidate_tier(0.8), Tier::Core);
        assert_eq!(p.candidate_tier(0.79), Tier::Active);
        assert_eq!(p.candidate_tier(0.4), Tier::Active);
        assert_eq!(p.candidate_tier(0.39), Tier::Background);
        assert_eq!(p.candidate_tier(0.0), Tier::Background);
    }

    #[test]
    fn test_promotion_requires_all_three_signals() {
        let p = policy();
        let s = scorer();
        let now = Utc::now();

        // Importance alone is not enough
        let quiet = memory_at(Tier::Active, 0.9, 2, now);
        assert!(!p.should_promote(&quiet, 0.9, &s));

        // Usage alone is not enough
        let busy = memory_at(Tier::Active, 0.5, 80, now);
        assert!(!p.should_promote(&busy, 0.5, &s));

        // All three together promote
        let both = memory_at(Tier::Active, 0.85, 60, now);
        assert!(p.should_promote(&both, 0.85, &s));
    }

    #[test]
    fn test_core_never_promotes_past_itself() {
        let p = policy();
        let s = scorer();
        let now = Utc::now();
        let top = memory_at(Tier::Core, 1.0, 1_000, now);
        assert!(!p.should_promote(&top, 1.0, &s));
        assert_eq!(p.evaluate(&top, 1.0, &s, now), None);
    }

    #[test]
    fn test_demotion_on_inactivity() {
        let p = policy();
        let now = Utc::now();
        let mut stale = memory_at(Tier::Active, 0.6, 5, now - chrono::Duration::days(60));
        stale.last_accessed_at = now - chrono::Duration::days(60);
        assert!(p.should_demote(&stale, 0.6, now));
        assert_eq!(
            p.evaluate(&stale, 0.6, &scorer(), now),
            Some(Tier::Background)
        );
    }

    #[test]
    fn test_demotion_on_decayed_importance() {
        let p = policy();
        let now = Utc::now();
        let weak = memory_at(Tier::Active, 0.31, 5, now);
        // 0.31 * (1 - 0.1) = 0.279 < 0.3
        assert!(p.should_demote(&weak, 0.31, now));

        let holding = memory_at(Tier::Active, 0.4, 5, now);
        assert!(!p.should_demote(&holding, 0.4, now));
    }

    #[test]
    fn test_background_never_demotes() {
        let p = policy();
        let now = Utc::now();
        let mut floor = memory_at(Tier::Background, 0.0, 0, now);
        floor.last_accessed_at = now - chrono::Duration::days(365);
        assert!(!p.should_demote(&floor, 0.0, now));
    }

    #[test]
    fn test_single_step_only() {
        let p = policy();
        let s = scorer();
        let now = Utc::now();
        // A background memory with core-grade importance still lands in
        // active first.
        let riser = memory_at(Tier::Background, 0.95, 50, now);
        assert_eq!(p.evaluate(&riser, 0.95, &s, now), Some(Tier::Active));
    }

    #[test]
    fn test_admits_uses_tier_floor() {
        let p = policy();
        assert!(p.admits(Tier::Core, 0.85));
        assert!(!p.admits(Tier::Core, 0.5));
        assert!(p.admits(Tier::Background, 0.0));
    }
}
