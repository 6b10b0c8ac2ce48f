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

//! Engine-wide error taxonomy
//!
//! Kinds, not transport types: callers branch on what went wrong, never on
//! which collaborator produced it. `Transient` is the only retryable kind.

use crate::memory::Tier;
use thiserror::Error;

/// Result type for memory operations
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Errors surfaced by the memory engine
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Caller supplied bad input (empty content, wrong dimension, ...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Memory not found
    #[error("Memory not found: {0}")]
    NotFound(String),

    /// Tier transition rejected by policy
    #[error("Invalid transition {from} -> {to}: {reason}")]
    InvalidTransition {
        from: Tier,
        to: Tier,
        reason: String,
    },

    /// Retryable failure (timeout, transient I/O, transient embedding)
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Non-retryable gateway failure
    #[error("Storage failed: {0}")]
    StorageFailed(String),

    /// Invariant violation; logged with context, details not for callers
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MemoryError {
    /// Whether the lifecycle retry boundary may retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MemoryError::Transient(_))
    }

    /// Operation cancelled via its cancellation token.
    pub fn cancelled() -> Self {
        MemoryError::Transient("operation cancelled".to_string())
    }

    /// Operation exceeded its per-call timeout.
    pub fn timeout(what: &str) -> Self {
        MemoryError::Transient(format!("{what} timed out"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(MemoryError::Transient("io".into()).is_retryable());
        assert!(MemoryError::timeout("gateway search").is_retryable());
        assert!(!MemoryError::InvalidInput("empty".into()).is_retryable());
        assert!(!MemoryError::StorageFailed("full".into()).is_retryable());
        assert!(!MemoryError::NotFound("x".into()).is_retryable());
    }

    #[test]
    fn test_transition_display() {
        let err = MemoryError::InvalidTransition {
            from: Tier::Background,
            to: Tier::Core,
            reason: "one step at a time".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("background"));
        assert!(msg.contains("core"));
    }
}
