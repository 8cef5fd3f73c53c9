// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Index Sync
//!
//! Keeps full-text search indexes in sync with the entities of a store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Mapping                              │
//! │  • Programmatic model of entities, embeddables, bridges     │
//! │  • Bootstrapped once into descriptors + reindexing graph    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                  (entity change events)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Indexing Plan                           │
//! │  • One merged operation per document key                    │
//! │  • Resolves dependents through the reindexing graph         │
//! │  • Derives documents from the latest state at submission    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               (coordination strategy at commit)
//!                              ▼
//! ┌──────────────────────────────┐  ┌──────────────────────────────┐
//! │        Synchronous           │  │       Outbox polling         │
//! │  • Executes after commit     │  │  • Events written in the     │
//! │  • NONE/ASYNC/SYNC/          │  │    domain transaction        │
//! │    SEARCHABLE waits          │  │  • Agents negotiate shards,  │
//! │                              │  │    claim and apply events    │
//! └──────────────────────────────┘  └──────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Work Orchestrators                         │
//! │  • Serial (sessions, agents) / parallel (mass indexing)     │
//! │  • Bounded queues, commit/refresh strategies, retries       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                        IndexBackend
//! ```
//!
//! ## Quick Start
//!
//! See [`coordinator`] for a complete example with [`IndexingEngine`].
//!
//! ## Modules
//!
//! - [`mapping`]: Types, properties, bridges and their bootstrapped descriptors
//! - [`dependency`]: Reindexing graph and resolver
//! - [`plan`]: Indexing plans and execution reports
//! - [`orchestration`]: Index works and orchestrators
//! - [`strategy`]: Sessions and the synchronous strategy
//! - [`outbox`]: Outbox events, agents and shard negotiation
//! - [`storage`]: Collaborator traits, SQL outbox store, in-memory doubles
//! - [`coordinator`]: The [`IndexingEngine`]
//! - [`mass_indexing`]: Rebuilding whole indexes

pub mod backpressure;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod dependency;
pub mod document;
pub mod error;
pub mod failure;
pub mod mapping;
pub mod mass_indexing;
pub mod metrics;
pub mod model;
pub mod orchestration;
pub mod outbox;
pub mod plan;
pub mod resilience;
pub mod storage;
pub mod strategy;

pub use backpressure::BackpressureLevel;
pub use config::{ConfigError, CoordinationKind, IndexSyncConfig};
pub use context::MappingContext;
pub use coordinator::{EngineState, HealthCheck, IndexingEngine, IndexingEngineBuilder};
pub use error::{BootstrapError, BootstrapFailure, BootstrapFailureKind, IndexingError};
pub use failure::{FailureHandler, LoggingFailureHandler};
pub use mass_indexing::{MassIndexer, MassIndexingReport};
pub use metrics::LatencyTimer;
pub use model::{Dirtiness, EntityChangeEvent, EntityReference, EntityState, PropertyValue};
pub use plan::{EntityFailure, ExecutionReport, FailureStage, IndexingOperation, IndexingPlan};
pub use resilience::retry::RetryConfig;
pub use storage::traits::{BackendError, EntityProvider, IndexBackend, OutboxSink, StorageError};
pub use strategy::{IndexingSession, SessionState, SynchronizationStrategy};
