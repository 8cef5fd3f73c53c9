// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbox-polling coordination.
//!
//! Plans are written as events into the domain transaction; background
//! agents on every node claim and apply them. Events of one entity always
//! hash to the same shard, so one agent applies them in creation order.

pub mod agent;
pub mod event;
pub mod payload;
pub mod processor;

pub use agent::{negotiate, AgentRecord, AgentState, AgentType, ClusterView, ShardAssignment};
pub use event::{entity_id_hash, EventStatus, OutboxEvent, ShardRange, HASH_SPACE};
pub use payload::{EventPayload, PayloadError};
pub use processor::{OutboxEventProcessor, ShardingMode};

use crate::config::{ConfigError, IndexSyncConfig};
use crate::context::MappingContext;
use crate::error::IndexingError;
use crate::metrics;
use crate::orchestration::WorkOrchestrator;
use crate::plan::{ExecutionReport, IndexingPlan};
use crate::strategy::{CoordinationStrategy, SynchronizationStrategy};
use crate::storage::traits::{AgentRepository, OutboxSink, OutboxStore, StorageError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct OutboxPollingStrategy {
    node_name: String,
    context: Arc<MappingContext>,
    config: IndexSyncConfig,
    store: Arc<dyn OutboxStore>,
    agents: Arc<dyn AgentRepository>,
    orchestrator: WorkOrchestrator,
    wake: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OutboxPollingStrategy {
    pub fn new(
        node_name: impl Into<String>,
        context: Arc<MappingContext>,
        config: IndexSyncConfig,
        store: Arc<dyn OutboxStore>,
        agents: Arc<dyn AgentRepository>,
        orchestrator: WorkOrchestrator,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            context,
            config,
            store,
            agents,
            orchestrator,
            wake: Arc::new(Notify::new()),
            shutdown: watch::channel(false).0,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Sharding modes of the agents this node runs.
    fn modes(&self) -> Result<Vec<ShardingMode>, ConfigError> {
        if !self.config.event_processing_enabled {
            return Ok(vec![ShardingMode::Pulsar]);
        }
        match self.config.static_shard_total {
            None => Ok(vec![ShardingMode::Dynamic]),
            Some(total) => self
                .config
                .static_shard_indices
                .iter()
                .map(|&index| {
                    ShardAssignment::new(index, total)
                        .map(ShardingMode::Static)
                        .ok_or_else(|| ConfigError::Invalid {
                            field: "static_shard_indices",
                            reason: format!("shard {index} is out of range for {total} shards"),
                        })
                })
                .collect(),
        }
    }

    /// Events that reached the retry ceiling.
    pub async fn failed_events(&self, limit: usize) -> Result<Vec<OutboxEvent>, StorageError> {
        self.store.find_failed(limit).await
    }

    /// Put failed events back in the queue with their retries reset.
    pub async fn retry_failed(&self, ids: &[String]) -> Result<u64, StorageError> {
        let requeued = self.store.retry_failed(ids).await?;
        if requeued > 0 {
            info!(requeued, "Requeued failed outbox events");
            self.wake.notify_waiters();
        }
        Ok(requeued)
    }

    pub async fn pending_count(&self) -> Result<u64, StorageError> {
        self.store.count(Some(EventStatus::Pending)).await
    }

    pub async fn failed_count(&self) -> Result<u64, StorageError> {
        self.store.count(Some(EventStatus::Failed)).await
    }
}

#[async_trait]
impl CoordinationStrategy for OutboxPollingStrategy {
    fn name(&self) -> &'static str {
        "outbox-polling"
    }

    async fn start(&self) -> Result<(), IndexingError> {
        if !self.tasks.lock().is_empty() {
            return Err(IndexingError::InvalidState("outbox agents already started".to_string()));
        }
        let modes = self.modes()?;
        let mut handles = Vec::with_capacity(modes.len());
        for (i, mode) in modes.into_iter().enumerate() {
            let processor = OutboxEventProcessor::new(
                format!("{}-{i}", self.node_name),
                Arc::clone(&self.context),
                Arc::clone(&self.store),
                Arc::clone(&self.agents),
                self.orchestrator.clone(),
                self.config.clone(),
                mode,
            );
            debug!(agent = processor.name(), mode = ?mode, "Starting outbox agent");
            handles.push(tokio::spawn(processor.run(self.shutdown.subscribe(), Arc::clone(&self.wake))));
        }
        info!(node = %self.node_name, agents = handles.len(), "Outbox polling started");
        self.tasks.lock().extend(handles);
        Ok(())
    }

    /// Write one event per plan entry into the open transaction.
    async fn before_commit(&self, plan: &mut IndexingPlan, sink: &mut dyn OutboxSink) -> Result<(), IndexingError> {
        plan.process().await;
        let events = plan.to_events(self.config.payload_compression_threshold)?;
        if events.is_empty() {
            return Ok(());
        }
        sink.persist(&events).await?;
        debug!(events = events.len(), "Outbox events written");
        metrics::record_outbox_events("created", events.len());
        Ok(())
    }

    /// Events are applied by the agents; only wake the local ones.
    async fn after_commit(
        &self,
        _plan: IndexingPlan,
        _synchronization: SynchronizationStrategy,
    ) -> Result<ExecutionReport, IndexingError> {
        self.wake.notify_waiters();
        Ok(ExecutionReport::default())
    }

    async fn stop(&self) {
        self.shutdown.send_replace(true);
        self.wake.notify_waiters();
        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Outbox agent ended abnormally");
            }
        }
        self.orchestrator.stop().await;
        info!(node = %self.node_name, "Outbox polling stopped");
    }
}
