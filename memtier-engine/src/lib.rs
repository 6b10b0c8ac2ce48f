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

//! Memtier Engine
//!
//! A tiered, self-curating memory store for conversational agents. Short
//! textual memories arrive with an embedding, get an importance score and
//! a tier (core / active / background), and are thereafter aged,
//! reinforced, promoted, demoted, consolidated and eventually evicted by
//! a periodic lifecycle loop.
//!
//! ```text
//! store/retrieve ──► MemoryService ──► TierCache (advisory)
//!                         │    │
//!                         │    └─────► CompressionCodec ──► VectorGateway
//!                         │
//! LifecycleManager ───────┘  (stats → consolidate → evolve → tiers → cleanup)
//!        │
//!        ├── Consolidator  (leader clustering + merge)
//!        └── Evolver       (aging + reinforcement + archival)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use memtier_core::{ConfigHandle, EngineConfig, MemoryDraft};
//! use memtier_engine::{LifecycleManager, MemoryService};
//! use memtier_store::{InMemoryBackend, MockEmbeddingProvider};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> memtier_core::MemoryResult<()> {
//!     let config = ConfigHandle::new(EngineConfig::default())?;
//!     let service = Arc::new(MemoryService::new(
//!         Arc::new(InMemoryBackend::new()),
//!         Arc::new(MockEmbeddingProvider::new(1024)),
//!         config.clone(),
//!     ));
//!     let lifecycle = Arc::new(LifecycleManager::new(service.clone(), config));
//!
//!     let token = CancellationToken::new();
//!     let id = service
//!         .store(MemoryDraft::new("user-1", "prefers window seats", vec![0.0; 1024]), &token)
//!         .await?;
//!     let hits = service.retrieve("user-1", "seating preferences", 5, &token).await?;
//!
//!     tokio::spawn(lifecycle.clone().run(token.clone()));
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod consolidator;
pub mod evolver;
pub mod lifecycle;
pub mod service;
pub mod stats;

// Re-exports
pub use cache::{CacheTierStats, TierCache};
pub use consolidator::{ConsolidationOutcome, ConsolidationReport, Consolidator, MergeResult};
pub use evolver::{EvolutionOutcome, Evolver};
pub use lifecycle::LifecycleManager;
pub use service::{MemoryAccess, MemoryService, RetrieveQuery};
pub use stats::{MemoryStatsSnapshot, PassReport};
