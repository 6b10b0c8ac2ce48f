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

//! Memtier Core
//!
//! Core types for the tiered memory engine:
//!
//! - **Memory model**: the `Memory` entity, tier enum, typed metadata with
//!   an open `extra` bag, and the bounded evolution history
//! - **Importance scoring**: the ingestion and ongoing scoring formulas
//! - **Tier policy**: tier table, candidate buckets, promotion/demotion
//!   predicates
//! - **Configuration**: the single validated configuration document and
//!   its snapshot handle
//! - **Errors**: the engine-wide error taxonomy
//! - **Retry**: exponential backoff applied at the lifecycle boundary
//!
//! Everything here is I/O-free. The storage and engine crates build on
//! these types; nothing in this crate suspends.

pub mod config;
pub mod error;
pub mod memory;
pub mod policy;
pub mod retry;
pub mod scoring;

// Re-exports
pub use config::{
    CompressionConfig, CompressionMethod, ConfigHandle, ConsolidationConfig, DistanceMetric,
    EngineConfig, EvolutionConfig, GeneralConfig, RetryConfig, TierSettings, TierTable,
};
pub use error::{MemoryError, MemoryResult};
pub use memory::{
    EvolutionEvent, EvolutionHistory, Memory, MemoryDraft, MemoryId, MemoryMetadata, Tier,
    MAX_CONTENT_BYTES,
};
pub use policy::TierPolicy;
pub use retry::RetryPolicy;
pub use scoring::ImportanceScorer;
