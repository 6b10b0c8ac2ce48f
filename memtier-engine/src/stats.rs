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

//! Engine statistics

use crate::consolidator::ConsolidationReport;
use chrono::{DateTime, Utc};
use memtier_core::Tier;
use serde::Serialize;
use std::collections::HashMap;

/// Point-in-time view of the whole store plus lifecycle counters
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStatsSnapshot {
    pub total_memories: usize,
    pub per_tier: HashMap<Tier, usize>,
    pub average_importance: f64,
    /// Completed consolidation runs
    pub consolidation_count: u64,
    pub last_consolidation: Option<DateTime<Utc>>,
    pub cycles_run: u64,
    pub cycles_failed: u64,
    /// Successful cycles / total cycles; 1.0 before the first cycle
    pub success_rate: f64,
}

/// What one lifecycle pass did
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    /// Another pass was already in flight; nothing ran
    pub skipped: bool,
    pub consolidation: Option<ConsolidationReport>,
    pub evolved: usize,
    pub reinforced: usize,
    pub transitions: usize,
    pub deleted: usize,
    pub duration_ms: u64,
}

impl PassReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}
