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

//! Compression codec
//!
//! Serializes the textual payload (content + metadata) and deflates it at
//! a tier-specific effort. Small payloads skip compression; a compression
//! failure degrades to the uncompressed form and never fails the write.
//! Decompression is idempotent on uncompressed inputs: the payload
//! annotations, not byte sniffing, decide the read path.

use crate::record::{MemoryRecord, Payload};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use memtier_core::{ConfigHandle, Memory, MemoryError, MemoryMetadata, MemoryResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::{debug, warn};

/// The serialized body a payload blob carries
#[derive(Debug, Serialize, Deserialize)]
struct PayloadBody {
    content: String,
    metadata: MemoryMetadata,
}

/// Aggregate codec statistics
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CodecStats {
    /// Payloads that actually got deflated
    pub memories_compressed: u64,
    /// Cumulative serialized bytes before compression
    pub total_original_bytes: u64,
    /// Cumulative stored bytes after compression decisions
    pub total_compressed_bytes: u64,
    /// Exponential moving compressed/original ratio
    pub moving_ratio: f64,
}

/// Tier-aware payload codec
pub struct CompressionCodec {
    config: ConfigHandle,
    stats: Mutex<CodecStats>,
}

impl CompressionCodec {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            config,
            stats: Mutex::new(CodecStats::default()),
        }
    }

    /// Deflate effort for a target compressed/original ratio:
    /// `floor((1 - target) * 9)`, capped by the configured quality.
    /// Zero effort means "store uncompressed".
    pub fn effort_for_ratio(target_ratio: f64, quality: u32) -> u32 {
        let effort = ((1.0 - target_ratio.clamp(0.0, 1.0)) * 9.0).floor() as u32;
        effort.min(quality)
    }

    /// Encode a memory into its stored record. Never fails: any
    /// serialization or compression problem stores the payload
    /// uncompressed (an empty body in the worst case is impossible since
    /// `Memory` always serializes).
    pub fn encode(&self, memory: &Memory) -> MemoryRecord {
        let config = self.config.snapshot();
        let body = PayloadBody {
            content: memory.content.clone(),
            metadata: memory.metadata.clone(),
        };
        let raw = match serde_json::to_vec(&body) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(memory_id = %memory.id, error = %err, "payload serialization failed");
                Vec::new()
            }
        };

        let target_ratio = config.tiers.get(memory.tier).compression_ratio;
        let effort = Self::effort_for_ratio(target_ratio, config.compression.quality);
        let payload = if !config.compression.enabled
            || raw.len() < config.compression.min_size
            || effort == 0
        {
            self.record_sample(raw.len(), raw.len(), false);
            Payload::uncompressed(raw)
        } else {
            match Self::deflate(&raw, effort) {
                Ok(compressed) if compressed.len() < raw.len() => {
                    let original_size = raw.len();
                    let compressed_size = compressed.len();
                    let ratio = compressed_size as f64 / original_size as f64;
                    debug!(
                        memory_id = %memory.id,
                        tier = %memory.tier,
                        original_size,
                        compressed_size,
                        "payload compressed"
                    );
                    self.record_sample(original_size, compressed_size, true);
                    Payload {
                        data: compressed,
                        compressed: true,
                        original_size,
                        compressed_size,
                        ratio,
                    }
                }
                Ok(_) => {
                    // Incompressible payload; keep the original bytes
                    self.record_sample(raw.len(), raw.len(), false);
                    Payload::uncompressed(raw)
                }
                Err(err) => {
                    warn!(memory_id = %memory.id, error = %err, "compression failed, storing raw");
                    self.record_sample(raw.len(), raw.len(), false);
                    Payload::uncompressed(raw)
                }
            }
        };

        MemoryRecord {
            id: memory.id,
            owner_id: memory.owner_id.clone(),
            tier: memory.tier,
            embedding: memory.embedding.clone(),
            importance: memory.importance,
            created_at: memory.created_at,
            last_accessed_at: memory.last_accessed_at,
            access_count: memory.access_count,
            payload,
        }
    }

    /// Decode a stored record back into a memory.
    pub fn decode(&self, record: MemoryRecord) -> MemoryResult<Memory> {
        let raw = if record.payload.compressed {
            match Self::inflate(&record.payload.data) {
                Ok(raw) => raw,
                Err(err) => {
                    // A mislabeled uncompressed blob still decodes below.
                    warn!(memory_id = %record.id, error = %err, "inflate failed, trying raw payload");
                    record.payload.data.clone()
                }
            }
        } else {
            record.payload.data.clone()
        };

        let body: PayloadBody = serde_json::from_slice(&raw).map_err(|err| {
            MemoryError::Internal(format!("payload for {} does not parse: {err}", record.id))
        })?;

        Ok(Memory {
            id: record.id,
            owner_id: record.owner_id,
            content: body.content,
            embedding: record.embedding,
            tier: record.tier,
            importance: record.importance,
            created_at: record.created_at,
            last_accessed_at: record.last_accessed_at,
            access_count: record.access_count,
            metadata: body.metadata,
        })
    }

    pub fn stats(&self) -> CodecStats {
        *self.stats.lock()
    }

    fn record_sample(&self, original: usize, stored: usize, compressed: bool) {
        let config = self.config.snapshot();
        let mut stats = self.stats.lock();
        stats.total_original_bytes += original as u64;
        stats.total_compressed_bytes += stored as u64;
        if compressed {
            stats.memories_compressed += 1;
        }
        let sample = if original == 0 {
            1.0
        } else {
            stored as f64 / original as f64
        };
        let alpha = config.compression.ema_alpha;
        stats.moving_ratio = if stats.moving_ratio == 0.0 {
            sample
        } else {
            alpha * sample + (1.0 - alpha) * stats.moving_ratio
        };
    }

    fn deflate(raw: &[u8], effort: u32) -> std::io::Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(effort));
        encoder.write_all(raw)?;
        encoder.finish()
    }

    fn inflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut decoder = ZlibDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }
}
