// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbox event rows and the hash space they are sharded over.

use crate::model::EntityReference;
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Events hash into `[0, HASH_SPACE)`.
pub const HASH_SPACE: i64 = 1 << 31;

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventStatus {
    Pending,
    Processing,
    /// Retry ceiling reached. Left for operators.
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable hash of an entity's identity into the shard hash space.
///
/// Every event for the same entity lands in the same shard, which is what
/// keeps per-entity ordering across agents.
pub fn entity_id_hash(entity: &EntityReference) -> i64 {
    let mut hasher = Sha256::new();
    if let Some(tenant) = &entity.tenant {
        hasher.update(tenant.as_bytes());
    }
    hasher.update([0u8]);
    hasher.update(entity.id.as_bytes());
    let digest = hasher.finalize();
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    i64::from(prefix & 0x7fff_ffff)
}

/// Half-open range of the hash space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRange {
    pub start: i64,
    pub end: i64,
}

impl ShardRange {
    pub fn all() -> Self {
        Self { start: 0, end: HASH_SPACE }
    }

    pub fn contains(&self, hash: i64) -> bool {
        hash >= self.start && hash < self.end
    }
}

/// A persisted indexing intent for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEvent {
    /// UUID v7; sorts by creation time.
    pub id: String,
    pub entity_name: String,
    pub entity_id: String,
    pub tenant: Option<String>,
    pub entity_id_hash: i64,
    pub payload: Vec<u8>,
    pub status: EventStatus,
    pub retries: i64,
    /// Epoch millis before which the event must not be picked up.
    pub process_after: i64,
    pub processor_id: Option<String>,
    pub version: i64,
    pub created_at: i64,
}

impl OutboxEvent {
    pub fn new(entity: &EntityReference, payload: Vec<u8>, now_ms: i64) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            entity_name: entity.type_name.clone(),
            entity_id: entity.id.clone(),
            tenant: entity.tenant.clone(),
            entity_id_hash: entity_id_hash(entity),
            payload,
            status: EventStatus::Pending,
            retries: 0,
            process_after: now_ms,
            processor_id: None,
            version: 0,
            created_at: now_ms,
        }
    }

    pub fn entity(&self) -> EntityReference {
        EntityReference {
            type_name: self.entity_name.clone(),
            id: self.entity_id.clone(),
            tenant: self.tenant.clone(),
        }
    }

    /// Whether an agent owning `range` may pick this event up at `now_ms`.
    pub fn is_eligible(&self, range: &ShardRange, now_ms: i64) -> bool {
        self.status == EventStatus::Pending && self.process_after <= now_ms && range.contains(self.entity_id_hash)
    }

    pub fn is_claimed_by(&self, processor_id: &str) -> bool {
        self.status == EventStatus::Processing && self.processor_id.as_deref() == Some(processor_id)
    }
}
