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

//! Embedding provider seam
//!
//! The engine treats embedding as a black-box `embed(text) -> vector`
//! call. `MockEmbeddingProvider` produces deterministic unit vectors from
//! a content hash so tests get stable, repeatable similarity structure.

use async_trait::async_trait;
use memtier_core::MemoryError;
use thiserror::Error;

/// Errors from the embedding boundary
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Retryable provider failure
    #[error("Transient embedding failure: {0}")]
    Transient(String),

    /// The text cannot be embedded (empty, oversized, ...)
    #[error("Invalid embedding input: {0}")]
    InvalidInput(String),
}

impl From<EmbeddingError> for MemoryError {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::Transient(msg) => MemoryError::Transient(msg),
            EmbeddingError::InvalidInput(msg) => MemoryError::InvalidInput(msg),
        }
    }
}

/// External embedding model
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Dimension of every vector this provider returns
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Deterministic provider for tests and offline development
///
/// Expands a blake3 hash of the input into a unit vector. Identical texts
/// map to identical vectors; unrelated texts land near-orthogonal in high
/// dimensions.
pub struct MockEmbeddingProvider {
    dimension: usize,
}

impl MockEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(text.as_bytes());
        let mut reader = hasher.finalize_xof();

        let mut bytes = vec![0u8; self.dimension * 4];
        reader.fill(&mut bytes);

        let mut v: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| {
                let n = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                // Uniform in [-1, 1)
                (n as f64 / u32::MAX as f64 * 2.0 - 1.0) as f32
            })
            .collect();

        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("empty text".into()));
        }
        Ok(self.vector_for(text))
    }
}
