// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Agent rows and shard negotiation.
//!
//! Every node registers an agent row and refreshes its expiration on each
//! pulse. Event-processing agents split the hash space into contiguous
//! ranges: the agent at position `i` of the membership view (sorted by
//! registration time) owns shard `i` of `n`. An agent only runs once every
//! agent in its view already holds the assignment the view implies. Until
//! then it is suspended, so two agents never process the same range.

use super::event::{ShardRange, HASH_SPACE};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentType {
    EventProcessing,
    /// Heartbeat only: a node that writes events but processes none.
    Pulsar,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EventProcessing => "EVENT_PROCESSING",
            Self::Pulsar => "PULSAR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EVENT_PROCESSING" => Some(Self::EventProcessing),
            "PULSAR" => Some(Self::Pulsar),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentState {
    Running,
    Suspended,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Suspended => "SUSPENDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(Self::Running),
            "SUSPENDED" => Some(Self::Suspended),
            _ => None,
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shard `index` of `total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardAssignment {
    pub index: u32,
    pub total: u32,
}

impl ShardAssignment {
    pub fn new(index: u32, total: u32) -> Option<Self> {
        (total > 0 && index < total).then_some(Self { index, total })
    }

    pub fn single() -> Self {
        Self { index: 0, total: 1 }
    }

    pub fn range(&self) -> ShardRange {
        let total = i64::from(self.total);
        let index = i64::from(self.index);
        ShardRange {
            start: HASH_SPACE * index / total,
            end: HASH_SPACE * (index + 1) / total,
        }
    }
}

impl fmt::Display for ShardAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.total)
    }
}

/// One row of the membership table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub agent_type: AgentType,
    pub state: AgentState,
    pub total_shard_count: Option<i64>,
    pub assigned_shard_index: Option<i64>,
    pub registered_at: i64,
    /// Epoch millis after which other agents consider this one dead.
    pub expiration: i64,
    pub version: i64,
}

impl AgentRecord {
    pub fn new(name: impl Into<String>, agent_type: AgentType, now_ms: i64, expiration_ms: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            agent_type,
            state: AgentState::Suspended,
            total_shard_count: None,
            assigned_shard_index: None,
            registered_at: now_ms,
            expiration: now_ms + expiration_ms,
            version: 0,
        }
    }

    pub fn assignment(&self) -> Option<ShardAssignment> {
        let total = u32::try_from(self.total_shard_count?).ok()?;
        let index = u32::try_from(self.assigned_shard_index?).ok()?;
        ShardAssignment::new(index, total)
    }

    pub fn set_assignment(&mut self, assignment: Option<ShardAssignment>) {
        self.total_shard_count = assignment.map(|a| i64::from(a.total));
        self.assigned_shard_index = assignment.map(|a| i64::from(a.index));
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiration < now_ms
    }
}

/// What one agent concludes from the membership table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterView {
    /// Rows of other agents whose pulse expired.
    pub expired: Vec<String>,
    /// Every agent still alive, any type.
    pub live: Vec<String>,
    /// Assignment this agent should hold. `None` if its own row is missing.
    pub target: Option<ShardAssignment>,
    /// Every other processing agent already holds its expected assignment.
    pub consistent: bool,
}

/// Compute the expected shard layout from the membership table.
pub fn negotiate(self_id: &str, agents: &[AgentRecord], now_ms: i64) -> ClusterView {
    let (expired, live): (Vec<&AgentRecord>, Vec<&AgentRecord>) = agents
        .iter()
        .partition(|a| a.id != self_id && a.is_expired(now_ms));

    let mut processors: Vec<&AgentRecord> = live
        .iter()
        .copied()
        .filter(|a| a.agent_type == AgentType::EventProcessing)
        .collect();
    processors.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then_with(|| a.id.cmp(&b.id)));

    let total = processors.len() as u32;
    let target = processors
        .iter()
        .position(|a| a.id == self_id)
        .and_then(|i| ShardAssignment::new(i as u32, total));

    let consistent = processors
        .iter()
        .enumerate()
        .all(|(i, a)| a.id == self_id || a.assignment() == ShardAssignment::new(i as u32, total));

    ClusterView {
        expired: expired.into_iter().map(|a| a.id.clone()).collect(),
        live: live.into_iter().map(|a| a.id.clone()).collect(),
        target,
        consistent,
    }
}
