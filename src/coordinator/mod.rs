// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Indexing engine.
//!
//! The [`IndexingEngine`] ties the components together for one mapping:
//! - the bootstrapped [`MappingContext`] (descriptors, reindexing graph)
//! - a serial orchestrator for sessions and outbox agents
//! - a parallel orchestrator for mass indexing
//! - the configured coordination strategy
//!
//! # Lifecycle
//!
//! ```text
//! Created → Starting → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use index_sync::{IndexingEngine, IndexSyncConfig, EngineState};
//! use index_sync::mapping::{IndexSettings, MappingModel, PropertyModel, TypeModel};
//! use index_sync::model::{EntityChangeEvent, EntityReference, EntityState};
//! use index_sync::storage::{InMemoryEntityStore, InMemoryIndexBackend, NoTransaction};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let model = MappingModel::new().with_type(
//!     TypeModel::entity("Book")
//!         .property(PropertyModel::value("title"))
//!         .field("title", "title")
//!         .indexed(IndexSettings::new("books")),
//! );
//! let engine = IndexingEngine::builder(model)
//!     .config(IndexSyncConfig::default())
//!     .entity_provider(Arc::new(InMemoryEntityStore::new()))
//!     .backend(Arc::new(InMemoryIndexBackend::new()))
//!     .build()
//!     .expect("mapping is valid");
//!
//! engine.start().await.expect("start");
//! assert_eq!(engine.state(), EngineState::Running);
//!
//! let mut session = engine.session().expect("running");
//! let book = EntityState::new(EntityReference::new("Book", "1")).with("title", "Dune");
//! session.apply(EntityChangeEvent::insert(book)).expect("recording");
//! session.before_commit(&mut NoTransaction).await.expect("prepared");
//! // ... domain transaction commits here ...
//! session.after_commit().await.expect("indexed");
//!
//! engine.shutdown().await;
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::{EngineState, HealthCheck};

use crate::backpressure::BackpressureLevel;
use crate::config::{ConfigError, CoordinationKind, IndexSyncConfig};
use crate::context::MappingContext;
use crate::error::IndexingError;
use crate::failure::{FailureHandler, LoggingFailureHandler};
use crate::mapping::MappingModel;
use crate::orchestration::{OrchestratorConfig, WorkOrchestrator};
use crate::outbox::OutboxPollingStrategy;
use crate::storage::traits::{AgentRepository, EntityProvider, IndexBackend, OutboxStore};
use crate::strategy::{CoordinationStrategy, SynchronousStrategy};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Main indexing engine.
///
/// # Thread Safety
///
/// The engine is `Send + Sync`; sessions can be opened from any task.
pub struct IndexingEngine {
    pub(super) config: IndexSyncConfig,

    pub(super) context: Arc<MappingContext>,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,

    /// Sessions and outbox agents
    pub(super) serial: WorkOrchestrator,

    /// Mass indexing
    pub(super) parallel: WorkOrchestrator,

    pub(super) strategy: Arc<dyn CoordinationStrategy>,

    /// Same object as `strategy` under outbox coordination, kept typed for
    /// the operator API
    pub(super) outbox: Option<Arc<OutboxPollingStrategy>>,
}

impl IndexingEngine {
    pub fn builder(model: MappingModel) -> IndexingEngineBuilder {
        IndexingEngineBuilder::new(model)
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    pub fn config(&self) -> &IndexSyncConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<MappingContext> {
        &self.context
    }

    pub(super) fn set_state(&self, state: EngineState) {
        self.state.send_replace(state);
        crate::metrics::set_engine_state(&state.to_string());
    }

    pub(super) fn require_running(&self, what: &str) -> Result<(), IndexingError> {
        match self.state() {
            EngineState::Running => Ok(()),
            other => Err(IndexingError::InvalidState(format!(
                "cannot {what}: engine is {other}"
            ))),
        }
    }

    /// Worst backpressure level of the two orchestrators.
    #[must_use]
    pub fn pressure(&self) -> BackpressureLevel {
        self.serial.backpressure().max(self.parallel.backpressure())
    }

    /// Collect engine state into a [`HealthCheck`].
    ///
    /// Under outbox coordination this reads the outbox table (two counts).
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let backpressure_level = self.pressure();

        let (pending_events, failed_events, outbox_reachable) = match &self.outbox {
            Some(outbox) => {
                let pending = outbox.pending_count().await.ok();
                let failed = outbox.failed_count().await.ok();
                let reachable = pending.is_some() && failed.is_some();
                (pending, failed, reachable)
            }
            None => (None, None, true),
        };

        let healthy = state == EngineState::Running && backpressure_level.should_accept_writes() && outbox_reachable;

        HealthCheck {
            state,
            strategy: self.strategy.name(),
            serial_queue_depth: self.serial.queue_depth(),
            parallel_queue_depth: self.parallel.queue_depth(),
            backpressure_level,
            pending_events,
            failed_events,
            healthy,
        }
    }
}

impl std::fmt::Debug for IndexingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexingEngine")
            .field("state", &self.state())
            .field("strategy", &self.strategy.name())
            .field("context", &self.context)
            .finish()
    }
}

/// Assembles an [`IndexingEngine`]. The mapping is bootstrapped by
/// [`build`](Self::build); every mapping problem is reported at once.
pub struct IndexingEngineBuilder {
    model: MappingModel,
    config: IndexSyncConfig,
    provider: Option<Arc<dyn EntityProvider>>,
    backend: Option<Arc<dyn IndexBackend>>,
    failure_handler: Arc<dyn FailureHandler>,
    outbox_store: Option<Arc<dyn OutboxStore>>,
    agents: Option<Arc<dyn AgentRepository>>,
    node_name: String,
}

impl IndexingEngineBuilder {
    fn new(model: MappingModel) -> Self {
        Self {
            model,
            config: IndexSyncConfig::default(),
            provider: None,
            backend: None,
            failure_handler: Arc::new(LoggingFailureHandler),
            outbox_store: None,
            agents: None,
            node_name: format!("node-{}", uuid::Uuid::new_v4().simple()),
        }
    }

    pub fn config(mut self, config: IndexSyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn entity_provider(mut self, provider: Arc<dyn EntityProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn IndexBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn failure_handler(mut self, handler: Arc<dyn FailureHandler>) -> Self {
        self.failure_handler = handler;
        self
    }

    /// Outbox table and agent table, usually the same store.
    pub fn outbox<S>(mut self, store: Arc<S>) -> Self
    where
        S: OutboxStore + AgentRepository + 'static,
    {
        self.outbox_store = Some(store.clone());
        self.agents = Some(store);
        self
    }

    /// Prefix of this node's agent names. Random by default.
    pub fn node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = name.into();
        self
    }

    pub fn build(self) -> Result<IndexingEngine, IndexingError> {
        self.config.validate()?;
        let provider = self.provider.ok_or(ConfigError::Invalid {
            field: "entity_provider",
            reason: "an entity provider is required".to_string(),
        })?;
        let backend = self.backend.ok_or(ConfigError::Invalid {
            field: "backend",
            reason: "an index backend is required".to_string(),
        })?;

        let context = Arc::new(MappingContext::bootstrap(self.model, provider, self.failure_handler)?);

        let orchestrator_config = OrchestratorConfig::from_config(&self.config);
        let serial = WorkOrchestrator::serial("serial", Arc::clone(&backend), orchestrator_config.clone());
        let parallel = WorkOrchestrator::parallel(
            "mass-indexing",
            backend,
            orchestrator_config,
            self.config.parallel_shards,
        );

        let (strategy, outbox): (Arc<dyn CoordinationStrategy>, _) = match self.config.coordination {
            CoordinationKind::Synchronous => (
                Arc::new(SynchronousStrategy::new(
                    Arc::clone(&context),
                    serial.clone(),
                    self.config.synchronization_timeout(),
                )) as Arc<dyn CoordinationStrategy>,
                None,
            ),
            CoordinationKind::OutboxPolling => {
                let (Some(store), Some(agents)) = (self.outbox_store, self.agents) else {
                    return Err(ConfigError::Invalid {
                        field: "coordination",
                        reason: "outbox-polling coordination needs an outbox store".to_string(),
                    }
                    .into());
                };
                let outbox = Arc::new(OutboxPollingStrategy::new(
                    self.node_name,
                    Arc::clone(&context),
                    self.config.clone(),
                    store,
                    agents,
                    serial.clone(),
                ));
                (outbox.clone() as Arc<dyn CoordinationStrategy>, Some(outbox))
            }
        };

        info!(strategy = strategy.name(), "Indexing engine created");

        Ok(IndexingEngine {
            config: self.config,
            context,
            state: watch::channel(EngineState::Created).0,
            serial,
            parallel,
            strategy,
            outbox,
        })
    }
}
