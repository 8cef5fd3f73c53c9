// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the indexing engine.
//!
//! # Example
//!
//! ```
//! use index_sync::{CoordinationKind, IndexSyncConfig, SynchronizationStrategy};
//!
//! // Minimal config (uses defaults)
//! let config = IndexSyncConfig::default();
//! assert_eq!(config.coordination, CoordinationKind::Synchronous);
//! assert_eq!(config.synchronization, SynchronizationStrategy::Sync);
//!
//! // Outbox polling with static sharding
//! let config = IndexSyncConfig {
//!     coordination: CoordinationKind::OutboxPolling,
//!     static_shard_total: Some(4),
//!     static_shard_indices: vec![0, 2],
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use crate::orchestration::DocumentCommitStrategy;
use crate::resilience::retry::RetryConfig;
use crate::strategy::SynchronizationStrategy;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// How index changes reach the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoordinationKind {
    /// Apply at transaction commit, in the committing process.
    #[default]
    Synchronous,
    /// Write outbox events in the transaction; background agents apply them.
    OutboxPolling,
}

/// Configuration for the indexing engine.
///
/// All fields have sensible defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexSyncConfig {
    #[serde(default)]
    pub coordination: CoordinationKind,

    /// What `after_commit` waits for (synchronous coordination only)
    #[serde(default)]
    pub synchronization: SynchronizationStrategy,

    /// Upper bound on that wait. `None` waits as long as it takes.
    #[serde(default)]
    pub synchronization_timeout_ms: Option<u64>,

    /// Work sets queued per orchestrator queue before submitters block (or are rejected)
    #[serde(default = "default_orchestrator_queue_capacity")]
    pub orchestrator_queue_capacity: usize,

    /// Work sets a worker drains per backend round-trip
    #[serde(default = "default_orchestrator_batch_size")]
    pub orchestrator_batch_size: usize,

    /// Queues per index for the parallel orchestrator
    #[serde(default = "default_parallel_shards")]
    pub parallel_shards: usize,

    /// Attempts per backend call on transient errors (first attempt included)
    #[serde(default = "default_backend_max_retries")]
    pub backend_max_retries: usize,
    #[serde(default = "default_backend_retry_initial_ms")]
    pub backend_retry_initial_ms: u64,
    #[serde(default = "default_backend_retry_max_ms")]
    pub backend_retry_max_ms: u64,

    /// Outbox poll interval when idle
    #[serde(default = "default_outbox_polling_interval_ms")]
    pub outbox_polling_interval_ms: u64,
    #[serde(default = "default_outbox_batch_size")]
    pub outbox_batch_size: usize,
    /// Commit strategy agents use when applying events
    #[serde(default)]
    pub outbox_commit_strategy: DocumentCommitStrategy,

    /// Failed attempts before an event is marked FAILED
    #[serde(default = "default_outbox_max_retries")]
    pub outbox_max_retries: u32,
    #[serde(default = "default_outbox_retry_delay_ms")]
    pub outbox_retry_delay_ms: u64,
    #[serde(default = "default_outbox_retry_backoff_factor")]
    pub outbox_retry_backoff_factor: f64,
    #[serde(default = "default_outbox_retry_max_delay_ms")]
    pub outbox_retry_max_delay_ms: u64,

    /// Agent heartbeat interval
    #[serde(default = "default_agent_pulse_interval_ms")]
    pub agent_pulse_interval_ms: u64,
    /// Time without pulse after which other agents consider an agent gone
    #[serde(default = "default_agent_pulse_expiration_ms")]
    pub agent_pulse_expiration_ms: u64,

    /// Static sharding: total shard count (disables negotiation)
    #[serde(default)]
    pub static_shard_total: Option<u32>,
    /// Static sharding: shards this node processes
    #[serde(default)]
    pub static_shard_indices: Vec<u32>,

    /// When false the node only writes events and registers a pulsar agent
    #[serde(default = "default_event_processing_enabled")]
    pub event_processing_enabled: bool,

    /// Payloads larger than this are zstd-compressed (0 = never)
    #[serde(default = "default_payload_compression_threshold")]
    pub payload_compression_threshold: usize,

    /// Identifiers loaded per mass-indexing page
    #[serde(default = "default_mass_indexing_batch_size")]
    pub mass_indexing_batch_size: usize,
}

fn default_orchestrator_queue_capacity() -> usize { 1000 }
fn default_orchestrator_batch_size() -> usize { 10 }
fn default_parallel_shards() -> usize { 4 }
fn default_backend_max_retries() -> usize { 4 }
fn default_backend_retry_initial_ms() -> u64 { 100 }
fn default_backend_retry_max_ms() -> u64 { 5_000 }
fn default_outbox_polling_interval_ms() -> u64 { 100 }
fn default_outbox_batch_size() -> usize { 50 }
fn default_outbox_max_retries() -> u32 { 3 }
fn default_outbox_retry_delay_ms() -> u64 { 1_000 }
fn default_outbox_retry_backoff_factor() -> f64 { 2.0 }
fn default_outbox_retry_max_delay_ms() -> u64 { 60_000 }
fn default_agent_pulse_interval_ms() -> u64 { 2_000 }
fn default_agent_pulse_expiration_ms() -> u64 { 30_000 }
fn default_event_processing_enabled() -> bool { true }
fn default_payload_compression_threshold() -> usize { 1024 }
fn default_mass_indexing_batch_size() -> usize { 100 }

impl Default for IndexSyncConfig {
    fn default() -> Self {
        Self {
            coordination: CoordinationKind::default(),
            synchronization: SynchronizationStrategy::default(),
            synchronization_timeout_ms: None,
            orchestrator_queue_capacity: default_orchestrator_queue_capacity(),
            orchestrator_batch_size: default_orchestrator_batch_size(),
            parallel_shards: default_parallel_shards(),
            backend_max_retries: default_backend_max_retries(),
            backend_retry_initial_ms: default_backend_retry_initial_ms(),
            backend_retry_max_ms: default_backend_retry_max_ms(),
            outbox_polling_interval_ms: default_outbox_polling_interval_ms(),
            outbox_batch_size: default_outbox_batch_size(),
            outbox_commit_strategy: DocumentCommitStrategy::default(),
            outbox_max_retries: default_outbox_max_retries(),
            outbox_retry_delay_ms: default_outbox_retry_delay_ms(),
            outbox_retry_backoff_factor: default_outbox_retry_backoff_factor(),
            outbox_retry_max_delay_ms: default_outbox_retry_max_delay_ms(),
            agent_pulse_interval_ms: default_agent_pulse_interval_ms(),
            agent_pulse_expiration_ms: default_agent_pulse_expiration_ms(),
            static_shard_total: None,
            static_shard_indices: Vec::new(),
            event_processing_enabled: default_event_processing_enabled(),
            payload_compression_threshold: default_payload_compression_threshold(),
            mass_indexing_batch_size: default_mass_indexing_batch_size(),
        }
    }
}

impl IndexSyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.orchestrator_queue_capacity == 0 {
            return Err(invalid("orchestrator_queue_capacity", "must be positive"));
        }
        if self.orchestrator_batch_size == 0 {
            return Err(invalid("orchestrator_batch_size", "must be positive"));
        }
        if self.parallel_shards == 0 {
            return Err(invalid("parallel_shards", "must be positive"));
        }
        if self.backend_max_retries == 0 {
            return Err(invalid("backend_max_retries", "must allow at least one attempt"));
        }
        if self.outbox_batch_size == 0 {
            return Err(invalid("outbox_batch_size", "must be positive"));
        }
        if self.mass_indexing_batch_size == 0 {
            return Err(invalid("mass_indexing_batch_size", "must be positive"));
        }
        if self.outbox_retry_backoff_factor.is_nan() || self.outbox_retry_backoff_factor < 1.0 {
            return Err(invalid("outbox_retry_backoff_factor", "must be at least 1.0"));
        }
        if self.agent_pulse_interval_ms == 0 {
            return Err(invalid("agent_pulse_interval_ms", "must be positive"));
        }
        if self.agent_pulse_expiration_ms <= self.agent_pulse_interval_ms {
            return Err(invalid(
                "agent_pulse_expiration_ms",
                format!(
                    "{} must exceed the pulse interval ({})",
                    self.agent_pulse_expiration_ms, self.agent_pulse_interval_ms
                ),
            ));
        }
        match self.static_shard_total {
            Some(0) => return Err(invalid("static_shard_total", "must be positive")),
            Some(total) => {
                if self.static_shard_indices.is_empty() {
                    return Err(invalid("static_shard_indices", "required with static_shard_total"));
                }
                if let Some(bad) = self.static_shard_indices.iter().find(|&&i| i >= total) {
                    return Err(invalid(
                        "static_shard_indices",
                        format!("shard {bad} is out of range for {total} shards"),
                    ));
                }
            }
            None if !self.static_shard_indices.is_empty() => {
                return Err(invalid("static_shard_total", "required with static_shard_indices"));
            }
            None => {}
        }
        Ok(())
    }

    pub fn backend_retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: Some(self.backend_max_retries),
            initial_delay: Duration::from_millis(self.backend_retry_initial_ms),
            max_delay: Duration::from_millis(self.backend_retry_max_ms),
            factor: 2.0,
        }
    }

    pub fn synchronization_timeout(&self) -> Option<Duration> {
        self.synchronization_timeout_ms.map(Duration::from_millis)
    }

    /// Delay before the next attempt of an event that failed `retries` times.
    pub fn outbox_retry_delay(&self, retries: u32) -> Duration {
        let base = self.outbox_retry_delay_ms as f64;
        let factor = self.outbox_retry_backoff_factor.powi(retries.saturating_sub(1) as i32);
        let delay = (base * factor).min(self.outbox_retry_max_delay_ms as f64);
        Duration::from_millis(delay as u64)
    }
}
