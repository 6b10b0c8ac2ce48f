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

//! Tier cache
//!
//! Three bounded in-process caches, one per tier, in front of the vector
//! gateway. Reads refresh recency, entries expire per tier TTL, and a
//! housekeeping tick resizes each tier from its observed hit rate. The
//! cache is advisory: every read path falls through to the gateway on
//! miss and every write path keeps the gateway authoritative.

use memtier_core::{ConfigHandle, Memory, MemoryId, Tier};
use moka::sync::Cache;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Hit rate below which a tier shrinks (while above the capacity floor)
const SHRINK_HIT_RATE: f64 = 0.5;
/// Hit rate above which a tier may grow
const GROW_HIT_RATE: f64 = 0.8;
/// Fill ratio that must accompany a grow
const GROW_FILL_RATIO: f64 = 0.9;
/// Capacity floor below which shrinking stops
const CAPACITY_FLOOR: u64 = 100;

/// Cached entry: the memory plus a read stamp for MRU-preserving resize
#[derive(Clone)]
struct CacheEntry {
    memory: Memory,
    last_read: Arc<AtomicU64>,
}

/// Per-tier counters and current capacity
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheTierStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entry_count: u64,
    pub capacity: u64,
}

impl CacheTierStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn fill_ratio(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.entry_count as f64 / self.capacity as f64
        }
    }
}

struct TierSlot {
    cache: Cache<MemoryId, CacheEntry>,
    capacity: u64,
    ttl: Option<Duration>,
    evictions: Arc<AtomicU64>,
    hits: AtomicU64,
    misses: AtomicU64,
    // Window counters feeding the self-tuning decision; reset per tick
    window_hits: AtomicU64,
    window_misses: AtomicU64,
    clock: Arc<AtomicU64>,
}

impl TierSlot {
    fn new(capacity: u64, ttl: Option<Duration>, clock: Arc<AtomicU64>) -> Self {
        let evictions = Arc::new(AtomicU64::new(0));
        Self {
            cache: Self::build_cache(capacity, ttl, evictions.clone()),
            capacity,
            ttl,
            evictions,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            window_hits: AtomicU64::new(0),
            window_misses: AtomicU64::new(0),
            clock,
        }
    }

    fn build_cache(
        capacity: u64,
        ttl: Option<Duration>,
        evictions: Arc<AtomicU64>,
    ) -> Cache<MemoryId, CacheEntry> {
        let mut builder = Cache::builder().max_capacity(capacity).eviction_listener(
            move |_key, _value, cause| {
                if matches!(
                    cause,
                    moka::notification::RemovalCause::Size
                        | moka::notification::RemovalCause::Expired
                ) {
                    evictions.fetch_add(1, Ordering::Relaxed);
                }
            },
        );
        if let Some(ttl) = ttl {
            // Idle-based expiry: reading an entry refreshes its age
            builder = builder.time_to_idle(ttl);
        }
        builder.build()
    }

    fn get(&self, id: &MemoryId) -> Option<Memory> {
        match self.cache.get(id) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.window_hits.fetch_add(1, Ordering::Relaxed);
                entry
                    .last_read
                    .store(self.clock.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
                Some(entry.memory)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.window_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn put(&self, memory: Memory) {
        let entry = CacheEntry {
            last_read: Arc::new(AtomicU64::new(
                self.clock.fetch_add(1, Ordering::Relaxed),
            )),
            memory,
        };
        self.cache.insert(entry.memory.id, entry);
    }

    fn stats(&self) -> CacheTierStats {
        self.cache.run_pending_tasks();
        CacheTierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entry_count: self.cache.entry_count(),
            capacity: self.capacity,
        }
    }

    fn window_rates(&self) -> (u64, f64) {
        let hits = self.window_hits.swap(0, Ordering::Relaxed);
        let misses = self.window_misses.swap(0, Ordering::Relaxed);
        let total = hits + misses;
        let rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };
        (total, rate)
    }

    /// Rebuild at `new_capacity`, replaying the most-recently-read
    /// entries so the MRU set survives the swap.
    fn resized(&self, new_capacity: u64) -> Self {
        self.cache.run_pending_tasks();
        let mut entries: Vec<CacheEntry> =
            self.cache.iter().map(|(_, entry)| entry).collect();
        entries.sort_by_key(|e| std::cmp::Reverse(e.last_read.load(Ordering::Relaxed)));
        entries.truncate(new_capacity as usize);

        let slot = TierSlot::new(new_capacity, self.ttl, self.clock.clone());
        // Oldest first so the replacement policy sees recent reads last
        for entry in entries.into_iter().rev() {
            slot.cache.insert(entry.memory.id, entry);
        }
        slot.hits
            .store(self.hits.load(Ordering::Relaxed), Ordering::Relaxed);
        slot.misses
            .store(self.misses.load(Ordering::Relaxed), Ordering::Relaxed);
        slot.evictions
            .store(self.evictions.load(Ordering::Relaxed), Ordering::Relaxed);
        slot
    }
}

/// The three per-tier caches
pub struct TierCache {
    core: RwLock<TierSlot>,
    active: RwLock<TierSlot>,
    background: RwLock<TierSlot>,
}

impl TierCache {
    pub fn new(config: &ConfigHandle) -> Self {
        let snapshot = config.snapshot();
        let clock = Arc::new(AtomicU64::new(1));
        let slot = |tier: Tier| {
            let settings = snapshot.tiers.get(tier);
            RwLock::new(TierSlot::new(
                settings.cache_capacity,
                settings.cache_ttl(),
                clock.clone(),
            ))
        };
        Self {
            core: slot(Tier::Core),
            active: slot(Tier::Active),
            background: slot(Tier::Background),
        }
    }

    fn slot(&self, tier: Tier) -> &RwLock<TierSlot> {
        match tier {
            Tier::Core => &self.core,
            Tier::Active => &self.active,
            Tier::Background => &self.background,
        }
    }

    /// Look up a memory in one tier's cache.
    pub fn get(&self, id: &MemoryId, tier: Tier) -> Option<Memory> {
        self.slot(tier).read().get(id)
    }

    /// Look up a memory in any tier's cache, most valuable tier first.
    pub fn get_any(&self, id: &MemoryId) -> Option<Memory> {
        Tier::ALL.iter().find_map(|tier| self.get(id, *tier))
    }

    /// Insert a memory into the cache of its own tier field. Tier moves
    /// must invalidate the old slot first; the gateway stays the
    /// authority on tier membership.
    pub fn put(&self, memory: Memory) {
        let tier = memory.tier;
        self.slot(tier).read().put(memory);
    }

    /// Drop a memory from one tier's cache, or from all of them.
    pub fn invalidate(&self, id: &MemoryId, tier: Option<Tier>) {
        match tier {
            Some(tier) => self.slot(tier).read().cache.invalidate(id),
            None => {
                for tier in Tier::ALL {
                    self.slot(tier).read().cache.invalidate(id);
                }
            }
        }
    }

    /// Flush expired entries in every tier.
    pub fn purge_stale(&self) {
        for tier in Tier::ALL {
            self.slot(tier).read().cache.run_pending_tasks();
        }
    }

    /// Drop everything in one tier, or everywhere.
    pub fn clear(&self, tier: Option<Tier>) {
        match tier {
            Some(tier) => self.slot(tier).read().cache.invalidate_all(),
            None => {
                for tier in Tier::ALL {
                    self.slot(tier).read().cache.invalidate_all();
                }
            }
        }
    }

    pub fn stats(&self, tier: Tier) -> CacheTierStats {
        self.slot(tier).read().stats()
    }

    /// Self-tuning tick: shrink cold tiers, grow hot full ones. Runs
    /// after each lifecycle housekeeping step.
    pub fn housekeep(&self) {
        self.purge_stale();
        for tier in Tier::ALL {
            let decision = {
                let slot = self.slot(tier).read();
                let (samples, hit_rate) = slot.window_rates();
                if samples == 0 {
                    None
                } else {
                    let stats = slot.stats();
                    if hit_rate < SHRINK_HIT_RATE && slot.capacity > CAPACITY_FLOOR {
                        Some((slot.capacity as f64 * 0.8) as u64)
                    } else if hit_rate > GROW_HIT_RATE && stats.fill_ratio() > GROW_FILL_RATIO {
                        Some((slot.capacity as f64 * 1.2) as u64)
                    } else {
                        None
                    }
                }
            };

            if let Some(new_capacity) = decision {
                let mut slot = self.slot(tier).write();
                if new_capacity != slot.capacity {
                    info!(
                        tier = %tier,
                        old_capacity = slot.capacity,
                        new_capacity,
                        "resizing tier cache"
                    );
                    *slot = slot.resized(new_capacity);
                }
            } else {
                debug!(tier = %tier, "tier cache capacity unchanged");
            }
        }
    }
}
