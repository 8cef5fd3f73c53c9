// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Binary encoding of outbox event payloads.
//!
//! Layout: one format-version byte followed by the bincode body. Payloads
//! larger than the configured threshold are zstd-compressed as a whole and
//! recognised on read by the zstd magic bytes, so compressed and plain rows
//! can coexist in one table.
//!
//! Unknown format versions fail to decode; the processor treats that like
//! any other failure and the event ends up FAILED once its retries run out.

use crate::model::Dirtiness;
use crate::plan::IndexingOperation;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Zstd magic bytes (little-endian): 0xFD2FB528
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

const COMPRESSION_LEVEL: i32 = 3;

pub const PAYLOAD_FORMAT_VERSION: u8 = 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Empty outbox payload")]
    Empty,
    #[error("Unsupported outbox payload format version {0}")]
    UnsupportedVersion(u8),
    #[error("Failed to encode outbox payload: {0}")]
    Encode(String),
    #[error("Failed to decode outbox payload: {0}")]
    Decode(String),
    #[error("Outbox payload decompression failed: {0}")]
    Decompress(String),
}

/// What an agent needs to replay one plan entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    pub operation: IndexingOperation,
    pub dirtiness: Dirtiness,
    /// Reindex even if nothing the document reads is dirty.
    pub reindex: bool,
    /// Routing keys the document may currently live under, known at commit
    /// time (the agent can no longer see the previous state).
    pub previous_routes: Vec<Option<String>>,
}

#[inline]
#[must_use]
pub fn is_compressed(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ZSTD_MAGIC
}

/// Encode, compressing when the plain form exceeds `compression_threshold`
/// bytes. A threshold of 0 disables compression.
pub fn encode(payload: &EventPayload, compression_threshold: usize) -> Result<Vec<u8>, PayloadError> {
    let body = bincode::serialize(payload).map_err(|e| PayloadError::Encode(e.to_string()))?;
    let mut bytes = Vec::with_capacity(body.len() + 1);
    bytes.push(PAYLOAD_FORMAT_VERSION);
    bytes.extend_from_slice(&body);

    if compression_threshold > 0 && bytes.len() > compression_threshold {
        return zstd::encode_all(bytes.as_slice(), COMPRESSION_LEVEL)
            .map_err(|e| PayloadError::Encode(e.to_string()));
    }
    Ok(bytes)
}

pub fn decode(data: &[u8]) -> Result<EventPayload, PayloadError> {
    let plain;
    let bytes = if is_compressed(data) {
        plain = zstd::decode_all(data).map_err(|e| PayloadError::Decompress(e.to_string()))?;
        plain.as_slice()
    } else {
        data
    };

    let (&version, body) = bytes.split_first().ok_or(PayloadError::Empty)?;
    if version != PAYLOAD_FORMAT_VERSION {
        return Err(PayloadError::UnsupportedVersion(version));
    }
    bincode::deserialize(body).map_err(|e| PayloadError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(dirty: usize) -> EventPayload {
        EventPayload {
            operation: IndexingOperation::Update,
            dirtiness: Dirtiness::properties((0..dirty).map(|i| format!("property_{i}"))),
            reindex: false,
            previous_routes: vec![Some("eu".into()), None],
        }
    }

    #[test]
    fn test_small_payload_stays_plain() {
        let p = payload(2);
        let bytes = encode(&p, 1024).unwrap();
        assert!(!is_compressed(&bytes));
        assert_eq!(bytes[0], PAYLOAD_FORMAT_VERSION);
        assert_eq!(decode(&bytes).unwrap(), p);
    }

    #[test]
    fn test_large_payload_is_compressed() {
        let p = payload(500);
        let bytes = encode(&p, 256).unwrap();
        assert!(is_compressed(&bytes));
        assert_eq!(decode(&bytes).unwrap(), p);
    }

    #[test]
    fn test_zero_threshold_disables_compression() {
        let bytes = encode(&payload(500), 0).unwrap();
        assert!(!is_compressed(&bytes));
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let mut bytes = encode(&payload(1), 0).unwrap();
        bytes[0] = 9;
        assert_eq!(decode(&bytes), Err(PayloadError::UnsupportedVersion(9)));
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert_eq!(decode(&[]), Err(PayloadError::Empty));
        assert!(matches!(decode(&[PAYLOAD_FORMAT_VERSION, 0xff]), Err(PayloadError::Decode(_))));
        assert!(matches!(decode(&[0x28, 0xB5, 0x2F, 0xFD, 0]), Err(PayloadError::Decompress(_))));
    }
}
