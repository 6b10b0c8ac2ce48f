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

//! Engine configuration
//!
//! One validated document. Components never read configuration globals;
//! they snapshot an immutable `Arc<EngineConfig>` from a [`ConfigHandle`]
//! at the top of each operation. Updates validate first and publish
//! atomically, so a reader either sees the old document or the new one.

use crate::error::{MemoryError, MemoryResult};
use crate::memory::Tier;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const DAY_SECS: u64 = 86_400;

/// Distance metric used by the vector store; constant per deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    Cosine,
    L2,
}

/// Compression method for stored payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMethod {
    Lossless,
    /// Accepted for forward compatibility; text payloads always take the
    /// lossless path.
    Lossy,
}

/// Per-tier settings: store capacity, cache shape, policy thresholds and
/// the compression target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierSettings {
    /// Steady-state store capacity for the tier
    pub capacity: usize,
    /// In-process cache entries for the tier
    pub cache_capacity: u64,
    /// Cache TTL; `None` keeps entries until evicted
    pub cache_ttl_secs: Option<u64>,
    /// Floor for residency in this tier
    pub min_importance: f64,
    /// Importance required to leave this tier upwards
    pub promotion_threshold: f64,
    /// Importance floor below which the memory leaves downwards
    pub demotion_threshold: f64,
    /// Accesses required before promotion is considered
    pub min_access_count: u64,
    /// Access frequency required before promotion is considered
    pub min_access_frequency: f64,
    /// Inactivity period that triggers demotion
    pub max_inactivity_secs: u64,
    /// Importance decay applied when testing the demotion predicate
    pub decay_rate: f64,
    /// Retention; `None` = unbounded
    pub retention_secs: Option<u64>,
    /// Target compressed/original ratio for payloads stored in this tier
    pub compression_ratio: f64,
    /// Search quality knob passed to the vector store (ef-style)
    pub search_quality: usize,
    /// How often the tier is snapshotted by external backup tooling
    pub backup_frequency_secs: u64,
}

impl Default for TierSettings {
    fn default() -> Self {
        // Active-tier defaults; the tier table overrides per tier.
        Self {
            capacity: 5_000,
            cache_capacity: 500,
            cache_ttl_secs: Some(DAY_SECS),
            min_importance: 0.4,
            promotion_threshold: 0.8,
            demotion_threshold: 0.3,
            min_access_count: 10,
            min_access_frequency: 0.3,
            max_inactivity_secs: 14 * DAY_SECS,
            decay_rate: 0.1,
            retention_secs: Some(30 * DAY_SECS),
            compression_ratio: 0.6,
            search_quality: 64,
            backup_frequency_secs: DAY_SECS,
        }
    }
}

impl TierSettings {
    fn core_defaults() -> Self {
        Self {
            capacity: 1_000,
            cache_capacity: 1_000,
            cache_ttl_secs: None,
            min_importance: 0.8,
            promotion_threshold: 0.9,
            demotion_threshold: 0.7,
            min_access_count: 25,
            min_access_frequency: 0.5,
            max_inactivity_secs: 30 * DAY_SECS,
            decay_rate: 0.05,
            retention_secs: None,
            compression_ratio: 0.8,
            search_quality: 128,
            backup_frequency_secs: DAY_SECS,
        }
    }

    fn background_defaults() -> Self {
        Self {
            capacity: 10_000,
            cache_capacity: 100,
            cache_ttl_secs: Some(6 * 3_600),
            min_importance: 0.0,
            promotion_threshold: 0.4,
            demotion_threshold: 0.0,
            min_access_count: 3,
            min_access_frequency: 0.05,
            max_inactivity_secs: 30 * DAY_SECS,
            decay_rate: 0.2,
            retention_secs: Some(90 * DAY_SECS),
            compression_ratio: 0.4,
            search_quality: 32,
            backup_frequency_secs: 7 * DAY_SECS,
        }
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_secs.map(Duration::from_secs)
    }

    pub fn max_inactivity(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_inactivity_secs as i64)
    }

    fn validate(&self, tier: Tier) -> MemoryResult<()> {
        if self.capacity == 0 || self.cache_capacity == 0 {
            return Err(MemoryError::InvalidInput(format!(
                "tier {tier}: capacities must be positive"
            )));
        }
        for (name, ratio) in [
            ("min_importance", self.min_importance),
            ("promotion_threshold", self.promotion_threshold),
            ("demotion_threshold", self.demotion_threshold),
            ("min_access_frequency", self.min_access_frequency),
            ("decay_rate", self.decay_rate),
            ("compression_ratio", self.compression_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(MemoryError::InvalidInput(format!(
                    "tier {tier}: {name} must be in [0, 1], got {ratio}"
                )));
            }
        }
        if self.max_inactivity_secs == 0 || self.backup_frequency_secs == 0 {
            return Err(MemoryError::InvalidInput(format!(
                "tier {tier}: intervals must be positive"
            )));
        }
        if self.retention_secs == Some(0) || self.cache_ttl_secs == Some(0) {
            return Err(MemoryError::InvalidInput(format!(
                "tier {tier}: retention and ttl must be positive when bounded"
            )));
        }
        Ok(())
    }
}

/// The three tiers' settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierTable {
    pub core: TierSettings,
    pub active: TierSettings,
    pub background: TierSettings,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            core: TierSettings::core_defaults(),
            active: TierSettings::default(),
            background: TierSettings::background_defaults(),
        }
    }
}

impl TierTable {
    pub fn get(&self, tier: Tier) -> &TierSettings {
        match tier {
            Tier::Core => &self.core,
            Tier::Active => &self.active,
            Tier::Background => &self.background,
        }
    }

    /// Sum of per-tier store capacities
    pub fn total_capacity(&self) -> usize {
        self.core.capacity + self.active.capacity + self.background.capacity
    }
}

/// Consolidation (clustering + merging) settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Cosine similarity required to join a cluster; also the floor a
    /// merged memory's importance must clear
    pub threshold: f64,
    /// Hard cap on cluster membership
    pub max_cluster_size: usize,
    /// Similarity floor applied to vector search results
    pub min_similarity: f64,
    /// Shared recency decay constant (tau_r) in seconds
    pub recency_decay_secs: u64,
    /// Scale applied to evolution importance deltas
    pub importance_change_rate: f64,
    /// Access count at which frequency saturates
    pub max_access_count: u64,
    /// How often the lifecycle pass runs
    pub schedule_interval_secs: u64,
    /// Total-memory count that triggers consolidation
    pub memory_threshold: usize,
    /// Elapsed time since last consolidation that triggers it
    pub time_threshold_secs: u64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            max_cluster_size: 32,
            min_similarity: 0.5,
            recency_decay_secs: 30 * DAY_SECS,
            importance_change_rate: 0.1,
            max_access_count: 100,
            schedule_interval_secs: 3_600,
            memory_threshold: 1_000,
            time_threshold_secs: 6 * 3_600,
        }
    }
}

/// Payload compression settings; per-tier target ratios live in the tier
/// table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub method: CompressionMethod,
    /// Upper bound on deflate effort (1..=9)
    pub quality: u32,
    /// Payloads below this many serialized bytes stay uncompressed
    pub min_size: usize,
    /// Smoothing factor of the moving compression ratio
    pub ema_alpha: f64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            method: CompressionMethod::Lossless,
            quality: 9,
            min_size: 1_024,
            ema_alpha: 0.1,
        }
    }
}

/// Evolution (aging + reinforcement + archival) settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    /// Aging time constant (tau_age) in seconds
    pub aging_decay_secs: u64,
    /// Reinforcement score above which the cycle counts as reinforcing
    pub reinforcement_threshold: f64,
    /// Archival probability above which the memory is forced to background
    pub archival_threshold: f64,
    /// Age at which the archival age term saturates; also the cleanup age
    pub max_age_secs: u64,
    /// Baseline decay applied by per-tier policy checks
    pub importance_decay_rate: f64,
    /// Importance floor for the background cleanup rule
    pub demotion_threshold: f64,
    /// Ring-buffer capacity of per-memory evolution history
    pub history_capacity: usize,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            aging_decay_secs: 30 * DAY_SECS,
            reinforcement_threshold: 0.6,
            archival_threshold: 0.8,
            max_age_secs: 90 * DAY_SECS,
            importance_decay_rate: 0.1,
            demotion_threshold: 0.3,
            history_capacity: 16,
        }
    }
}

/// Retry settings for the lifecycle boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Embedding dimension D; every stored vector must match
    pub dimension: usize,
    pub metric: DistanceMetric,
    /// Global cap across all tiers; over-capacity cleanup enforces it
    pub max_total_memories: usize,
    pub cleanup_interval_secs: u64,
    /// Tier assigned when no candidate bucket applies
    pub default_tier: Tier,
    /// Batch size for sweeps and evictions
    pub batch_size: usize,
    pub gateway_timeout_secs: u64,
    pub embed_timeout_secs: u64,
    pub retry: RetryConfig,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            dimension: 1_024,
            metric: DistanceMetric::Cosine,
            max_total_memories: 16_000,
            cleanup_interval_secs: 3_600,
            default_tier: Tier::Active,
            batch_size: 100,
            gateway_timeout_secs: 5,
            embed_timeout_secs: 10,
            retry: RetryConfig::default(),
        }
    }
}

impl GeneralConfig {
    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.embed_timeout_secs)
    }
}

/// The single configuration document for the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tiers: TierTable,
    pub consolidation: ConsolidationConfig,
    pub compression: CompressionConfig,
    pub evolution: EvolutionConfig,
    pub general: GeneralConfig,
}

impl EngineConfig {
    /// Validate the whole document; invalid documents are rejected before
    /// publication, never partially applied.
    pub fn validate(&self) -> MemoryResult<()> {
        for tier in Tier::ALL {
            self.tiers.get(tier).validate(tier)?;
        }

        let c = &self.consolidation;
        if !(0.0..=1.0).contains(&c.threshold) || !(0.0..=1.0).contains(&c.min_similarity) {
            return Err(MemoryError::InvalidInput(
                "consolidation thresholds must be in [0, 1]".into(),
            ));
        }
        if c.max_cluster_size < 2 {
            return Err(MemoryError::InvalidInput(
                "max_cluster_size must allow at least two members".into(),
            ));
        }
        if c.recency_decay_secs == 0
            || c.schedule_interval_secs == 0
            || c.time_threshold_secs == 0
            || c.max_access_count == 0
        {
            return Err(MemoryError::InvalidInput(
                "consolidation intervals and saturation must be positive".into(),
            ));
        }

        let z = &self.compression;
        if z.quality == 0 || z.quality > 9 {
            return Err(MemoryError::InvalidInput(
                "compression quality must be in 1..=9".into(),
            ));
        }
        if !(0.0..=1.0).contains(&z.ema_alpha) || z.ema_alpha == 0.0 {
            return Err(MemoryError::InvalidInput(
                "compression ema_alpha must be in (0, 1]".into(),
            ));
        }

        let e = &self.evolution;
        for (name, ratio) in [
            ("reinforcement_threshold", e.reinforcement_threshold),
            ("archival_threshold", e.archival_threshold),
            ("importance_decay_rate", e.importance_decay_rate),
            ("demotion_threshold", e.demotion_threshold),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(MemoryError::InvalidInput(format!(
                    "evolution {name} must be in [0, 1]"
                )));
            }
        }
        if e.aging_decay_secs == 0 || e.max_age_secs == 0 || e.history_capacity == 0 {
            return Err(MemoryError::InvalidInput(
                "evolution constants must be positive".into(),
            ));
        }

        let g = &self.general;
        if g.dimension == 0 {
            return Err(MemoryError::InvalidInput("dimension must be positive".into()));
        }
        if g.max_total_memories == 0 || g.batch_size == 0 {
            return Err(MemoryError::InvalidInput(
                "general capacities must be positive".into(),
            ));
        }
        if g.cleanup_interval_secs == 0 || g.gateway_timeout_secs == 0 || g.embed_timeout_secs == 0
        {
            return Err(MemoryError::InvalidInput(
                "general intervals must be positive".into(),
            ));
        }
        if g.retry.max_attempts == 0 || g.retry.multiplier < 1.0 {
            return Err(MemoryError::InvalidInput(
                "retry policy must attempt at least once and never shrink delays".into(),
            ));
        }
        Ok(())
    }
}

/// Shared handle to the current configuration snapshot
///
/// Cheap to clone; readers take an `Arc` snapshot per operation so a
/// concurrent update never changes constants mid-operation.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<EngineConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: EngineConfig) -> MemoryResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        })
    }

    /// Current immutable snapshot
    pub fn snapshot(&self) -> Arc<EngineConfig> {
        self.inner.read().clone()
    }

    /// Validate and publish a new document atomically. On error the
    /// previous snapshot stays in place.
    pub fn update(&self, config: EngineConfig) -> MemoryResult<()> {
        config.validate()?;
        *self.inner.write() = Arc::new(config);
        Ok(())
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        // Defaults always validate
        Self::new(EngineConfig::default()).expect("default config is valid")
    }
}

impl std::fmt::Debug for ConfigHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigHandle").finish_non_exhaustive()
    }
}
