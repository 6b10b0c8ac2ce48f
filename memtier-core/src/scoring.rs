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

//! Importance scoring
//!
//! Two deliberately distinct formulas. Ingestion scoring weighs the affect
//! signals that are only available once, from upstream; ongoing scoring
//! weighs the persistent base importance and accumulated usage. Both clamp
//! to [0, 1] and are pure given `now`.

use crate::memory::Memory;
use chrono::{DateTime, Utc};

/// Importance scorer, parameterized by the shared recency decay constant
/// and the access-count saturation point.
#[derive(Debug, Clone, Copy)]
pub struct ImportanceScorer {
    /// Recency decay time constant in seconds (tau_r)
    recency_decay_secs: f64,
    /// Access count at which frequency saturates to 1
    max_access_count: u64,
}

impl ImportanceScorer {
    pub fn new(recency_decay_secs: f64, max_access_count: u64) -> Self {
        Self {
            recency_decay_secs: recency_decay_secs.max(1.0),
            max_access_count: max_access_count.max(1),
        }
    }

    /// `exp(-(now - t) / tau_r)`; 1.0 for timestamps at or after `now`.
    pub fn recency(&self, now: DateTime<Utc>, t: DateTime<Utc>) -> f64 {
        let elapsed = (now - t).num_milliseconds().max(0) as f64 / 1000.0;
        (-elapsed / self.recency_decay_secs).exp()
    }

    /// `min(n / max_access_count, 1)`
    pub fn access_frequency(&self, access_count: u64) -> f64 {
        (access_count as f64 / self.max_access_count as f64).min(1.0)
    }

    /// Score at ingestion, before any accesses exist:
    /// `0.3*recency + 0.3*emotional + 0.2*context + 0.2*frequency`
    pub fn ingestion_score(
        &self,
        created_at: DateTime<Utc>,
        emotional_value: f64,
        context_relevance: f64,
        access_count: u64,
        now: DateTime<Utc>,
    ) -> f64 {
        let score = 0.3 * self.recency(now, created_at)
            + 0.3 * emotional_value.clamp(0.0, 1.0)
            + 0.2 * context_relevance.clamp(0.0, 1.0)
            + 0.2 * self.access_frequency(access_count);
        score.clamp(0.0, 1.0)
    }

    /// Ongoing score used by the evolver and tier re-evaluation:
    /// `0.4*base + 0.3*recency + 0.2*frequency + 0.1*context`
    pub fn current_score(&self, memory: &Memory, now: DateTime<Utc>) -> f64 {
        let score = 0.4 * memory.importance
            + 0.3 * self.recency(now, memory.created_at)
            + 0.2 * self.access_frequency(memory.access_count)
            + 0.1 * memory.metadata.context_relevance.clamp(0.0, 1.0);
        score.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryDraft, MemoryMetadata, Tier};

    const DAY_SECS: f64 = 86_400.0;

    fn scorer() -> ImportanceScorer {
        ImportanceScorer::new(30.0 * DAY_SECS, 100)
    }

    #[test]
    fn test_recency_bounds() {
        let s = scorer();
        let now = Utc::now();
        assert_eq!(s.recency(now, now), 1.0);
        // Future timestamps never score above 1
        assert_eq!(s.recency(now, now + chrono::Duration::hours(1)), 1.0);

        let month_old = now - chrono::Duration::days(30);
        let r = s.recency(now, month_old);
        assert!((r - (-1.0f64).exp()).abs() < 1e-3);
    }

    #[test]
    fn test_access_frequency_saturates() {
        let s = scorer();
        assert_eq!(s.access_frequency(0), 0.0);
        assert_eq!(s.access_frequency(50), 0.5);
        assert_eq!(s.access_frequency(100), 1.0);
        assert_eq!(s.access_frequency(10_000), 1.0);
    }

    #[test]
    fn test_ingestion_score_matches_formula() {
        let s = scorer();
        let now = Utc::now();
        // Fresh memory: recency = 1, no accesses
        let score = s.ingestion_score(now, 0.95, 0.9, 0, now);
        let expected = 0.3 * 1.0 + 0.3 * 0.95 + 0.2 * 0.9 + 0.2 * 0.0;
        assert!((score - expected).abs() < 1e-9);
        assert!((score - 0.765).abs() < 1e-9);
    }

    #[test]
    fn test_ingestion_score_clamps_signals() {
        let s = scorer();
        let now = Utc::now();
        let score = s.ingestion_score(now, 5.0, 5.0, 1_000_000, now);
        assert_eq!(score, 1.0);
    }

    #[test]
    fn test_current_score_matches_formula() {
        let s = scorer();
        let now = Utc::now();
        let draft = MemoryDraft::new("u", "text", vec![0.0; 4]).metadata(
            MemoryMetadata::default()
                .with_emotional_value(0.95)
                .with_context_relevance(0.9),
        );
        let mut memory = Memory::from_draft(draft, Tier::Active, 0.765, now);
        memory.access_count = 60;

        let score = s.current_score(&memory, now);
        let expected = 0.4 * 0.765 + 0.3 * 1.0 + 0.2 * 0.6 + 0.1 * 0.9;
        assert!((score - expected).abs() < 1e-9);
        // Promotion territory for a recent, well-used memory
        assert!(score >= 0.8);
    }

    #[test]
    fn test_scores_stay_in_unit_interval() {
        let s = scorer();
        let now = Utc::now();
        let old = now - chrono::Duration::days(365 * 4);
        for emotional in [0.0, 0.5, 1.0] {
            for count in [0u64, 10, 1_000] {
                let score = s.ingestion_score(old, emotional, 1.0, count, now);
                assert!((0.0..=1.0).contains(&score));
            }
        }
    }
}
