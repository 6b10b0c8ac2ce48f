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

//! Memtier Store
//!
//! The storage boundary of the memory engine:
//!
//! - **Vector backend**: the black-box vector store behind an async trait,
//!   plus an in-memory brute-force implementation for development and
//!   tests
//! - **Vector gateway**: the strongly-typed, per-tier facade the engine
//!   talks to; owns timeouts, cancellation, dimension checks and error
//!   mapping
//! - **Compression codec**: payload serialization + deflate at a
//!   tier-specific target ratio; degrades to uncompressed on any error
//! - **Embedding seam**: the external `embed(text) -> vector` provider
//!   trait with a deterministic mock for tests
//!
//! The gateway is stateless apart from the backend handle; the engine
//! crate layers caching and lifecycle management on top.

pub mod backend;
pub mod codec;
pub mod embed;
pub mod gateway;
pub mod record;

// Re-exports
pub use backend::{InMemoryBackend, RecordFilter, ScoredRecord, StoreError, VectorBackend};
pub use codec::{CodecStats, CompressionCodec};
pub use embed::{EmbeddingError, EmbeddingProvider, MockEmbeddingProvider};
pub use gateway::VectorGateway;
pub use record::{MemoryRecord, Payload};
