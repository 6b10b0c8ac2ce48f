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

//! Stored record schema
//!
//! The row shape the vector store holds: the searchable fields stay flat,
//! the textual payload rides as an annotated (possibly compressed) blob.

use chrono::{DateTime, Utc};
use memtier_core::{MemoryId, Tier};
use serde::{Deserialize, Serialize};

/// Annotated payload blob
///
/// `data` is the serialized content+metadata body, deflated when
/// `compressed` is set. The annotations let the read path decide whether
/// to inflate without sniffing bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(with = "payload_base64")]
    pub data: Vec<u8>,
    pub compressed: bool,
    pub original_size: usize,
    pub compressed_size: usize,
    /// compressed/original; 1.0 when stored uncompressed
    pub ratio: f64,
}

impl Payload {
    pub fn uncompressed(data: Vec<u8>) -> Self {
        let size = data.len();
        Self {
            data,
            compressed: false,
            original_size: size,
            compressed_size: size,
            ratio: 1.0,
        }
    }
}

/// One row in a tier collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: MemoryId,
    pub owner_id: String,
    pub tier: Tier,
    pub embedding: Vec<f32>,
    pub importance: f64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub payload: Payload,
}

/// Base64 transport for the payload blob so records stay compact JSON.
mod payload_base64 {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memtier_core::Tier;

    fn record(payload: Payload) -> MemoryRecord {
        let now = Utc::now();
        MemoryRecord {
            id: MemoryId::new(),
            owner_id: "user-1".into(),
            tier: Tier::Active,
            embedding: vec![0.1, 0.2, 0.3],
            importance: 0.5,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            payload,
        }
    }

    #[test]
    fn test_uncompressed_payload_annotations() {
        let payload = Payload::uncompressed(b"hello".to_vec());
        assert!(!payload.compressed);
        assert_eq!(payload.original_size, 5);
        assert_eq!(payload.compressed_size, 5);
        assert_eq!(payload.ratio, 1.0);
    }

    #[test]
    fn test_record_serde_round_trip() {
        let original = record(Payload::uncompressed(vec![0, 1, 2, 250, 251, 252, 253]));
        let json = serde_json::to_string(&original).unwrap();
        let back: MemoryRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn test_payload_blob_round_trips_all_lengths() {
        for len in 0..=9usize {
            let data: Vec<u8> = (0..len as u8).collect();
            let original = record(Payload::uncompressed(data.clone()));
            let json = serde_json::to_string(&original).unwrap();
            let back: MemoryRecord = serde_json::from_str(&json).unwrap();
            assert_eq!(back.payload.data, data);
        }
    }
}
