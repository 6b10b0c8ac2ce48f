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

//! Memory model
//!
//! Memories are the atomic unit of the engine: a short textual payload, a
//! fixed-dimension embedding, an importance score and a tier. A memory
//! belongs to exactly one tier at any moment; all lifecycle transitions go
//! through the service so the per-id write order holds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Maximum decompressed content size per memory
pub const MAX_CONTENT_BYTES: usize = 64 * 1024;

/// Default capacity of the evolution history ring buffer
pub const EVOLUTION_HISTORY_CAPACITY_DEFAULT: usize = 16;

/// Unique identifier for a memory
///
/// Ordering is the uuid byte order, which matches the lexicographic order
/// of the hyphenated lowercase form. Multi-id operations rely on this for
/// deadlock-free lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemoryId(pub Uuid);

impl MemoryId {
    /// Generate a new unique ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from the hyphenated string form
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for MemoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MemoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage tier of a memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Small, high-value working set; unbounded retention
    Core,
    /// Recently useful memories; 30 day retention by default
    Active,
    /// Rarely touched long tail; first in line for eviction
    Background,
}

impl Tier {
    /// All tiers in promotion order (most valuable first)
    pub const ALL: [Tier; 3] = [Tier::Core, Tier::Active, Tier::Background];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Core => "core",
            Tier::Active => "active",
            Tier::Background => "background",
        }
    }

    /// Logical collection name in the vector store
    pub fn collection(&self) -> String {
        format!("memory_{}", self.as_str())
    }

    /// The tier one step up, if any
    pub fn promoted(&self) -> Option<Tier> {
        match self {
            Tier::Core => None,
            Tier::Active => Some(Tier::Core),
            Tier::Background => Some(Tier::Active),
        }
    }

    /// The tier one step down, if any
    pub fn demoted(&self) -> Option<Tier> {
        match self {
            Tier::Core => Some(Tier::Active),
            Tier::Active => Some(Tier::Background),
            Tier::Background => None,
        }
    }

    /// Whether `to` is reachable from `self` in a single evaluation
    pub fn is_adjacent(&self, to: Tier) -> bool {
        self.promoted() == Some(to) || self.demoted() == Some(to)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One evolution cycle's effect on a memory
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvolutionEvent {
    /// When the cycle ran
    pub at: DateTime<Utc>,
    /// Aging factor computed for the cycle
    pub aging_factor: f64,
    /// Reinforcement score computed for the cycle
    pub reinforcement: f64,
    /// Importance delta applied (already clamped)
    pub importance_delta: f64,
}

/// Bounded ring buffer of evolution events; the oldest entry is
/// overwritten once capacity is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionHistory {
    events: Vec<EvolutionEvent>,
    capacity: usize,
    /// Index of the slot the next push overwrites once full
    head: usize,
}

impl EvolutionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Vec::new(),
            capacity: capacity.max(1),
            head: 0,
        }
    }

    pub fn push(&mut self, event: EvolutionEvent) {
        if self.events.len() < self.capacity {
            self.events.push(event);
        } else {
            self.events[self.head] = event;
            self.head = (self.head + 1) % self.capacity;
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events oldest-first
    pub fn iter(&self) -> impl Iterator<Item = &EvolutionEvent> {
        let (wrapped, recent) = self.events.split_at(self.head.min(self.events.len()));
        recent.iter().chain(wrapped.iter())
    }

    pub fn latest(&self) -> Option<&EvolutionEvent> {
        if self.events.is_empty() {
            return None;
        }
        let idx = if self.events.len() < self.capacity {
            self.events.len() - 1
        } else {
            (self.head + self.capacity - 1) % self.capacity
        };
        self.events.get(idx)
    }
}

impl Default for EvolutionHistory {
    fn default() -> Self {
        Self::new(EVOLUTION_HISTORY_CAPACITY_DEFAULT)
    }
}

/// Metadata carried by every memory
///
/// Known signals are typed fields; anything else callers attach rides in
/// `extra` as raw JSON values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetadata {
    /// Affect signal supplied at ingestion, in [0, 1]
    #[serde(default)]
    pub emotional_value: f64,
    /// Relevance-to-context signal supplied at ingestion, in [0, 1]
    #[serde(default)]
    pub context_relevance: f64,
    /// Free-form tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Where the memory came from (e.g. "user", "agent", "derived")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Ids of memories merged into this one, newest merge last
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connected_memories: Vec<MemoryId>,
    /// Bounded record of evolution cycles
    #[serde(default)]
    pub evolution_history: EvolutionHistory,
    /// Open extension bag
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for MemoryMetadata {
    fn default() -> Self {
        Self {
            emotional_value: 0.0,
            context_relevance: 0.0,
            tags: Vec::new(),
            source: None,
            connected_memories: Vec::new(),
            evolution_history: EvolutionHistory::default(),
            extra: BTreeMap::new(),
        }
    }
}

impl MemoryMetadata {
    pub fn with_emotional_value(mut self, v: f64) -> Self {
        self.emotional_value = v.clamp(0.0, 1.0);
        self
    }

    pub fn with_context_relevance(mut self, v: f64) -> Self {
        self.context_relevance = v.clamp(0.0, 1.0);
        self
    }

    pub fn with_tags(mut self, tags: Vec<impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(|t| t.into()).collect();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Input to `store`: everything the caller supplies, nothing the engine
/// derives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryDraft {
    pub owner_id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: MemoryMetadata,
}

impl MemoryDraft {
    pub fn new(owner_id: impl Into<String>, content: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            owner_id: owner_id.into(),
            content: content.into(),
            embedding,
            metadata: MemoryMetadata::default(),
        }
    }

    pub fn metadata(mut self, metadata: MemoryMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A memory held by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: MemoryId,
    /// Owner; immutable for the life of the memory
    pub owner_id: String,
    pub content: String,
    /// Dense embedding; immutable for the life of the memory
    pub embedding: Vec<f32>,
    pub tier: Tier,
    /// Importance in [0, 1]
    pub importance: f64,
    pub created_at: DateTime<Utc>,
    /// Monotonically non-decreasing; updated only via the access path
    pub last_accessed_at: DateTime<Utc>,
    /// Monotonically non-decreasing
    pub access_count: u64,
    pub metadata: MemoryMetadata,
}

impl Memory {
    /// Materialize a draft into a stored memory. The engine supplies the
    /// id, tier and importance; timestamps start at `now`.
    pub fn from_draft(
        draft: MemoryDraft,
        tier: Tier,
        importance: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MemoryId::new(),
            owner_id: draft.owner_id,
            content: draft.content,
            embedding: draft.embedding,
            tier,
            importance: importance.clamp(0.0, 1.0),
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            metadata: draft.metadata,
        }
    }

    /// Age since creation; zero if `now` precedes `created_at`
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.created_at).max(chrono::Duration::zero())
    }

    /// Time since last access; zero if `now` precedes it
    pub fn idle(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.last_accessed_at).max(chrono::Duration::zero())
    }

    /// Record a read through the access-metrics path. `last_accessed_at`
    /// never moves backwards.
    pub fn record_access(&mut self, now: DateTime<Utc>) {
        if now > self.last_accessed_at {
            self.last_accessed_at = now;
        }
        self.access_count = self.access_count.saturating_add(1);
    }

    /// Field-equality check used to skip writes after evolution
    pub fn same_importance_and_tier(&self, other: &Memory) -> bool {
        self.tier == other.tier && (self.importance - other.importance).abs() < f64::EPSILON
    }
}
