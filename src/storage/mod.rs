// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage seams and their implementations.

pub mod memory;
pub mod sql;
pub mod traits;

pub use memory::{InMemoryEntityStore, InMemoryIndexBackend, InMemoryOutboxStore, MemoryOutboxTransaction, PauseGuard};
pub use sql::SqlOutboxStore;
pub use traits::{
    AgentRepository, BackendError, EntityProvider, IndexBackend, NoTransaction, OutboxSink, OutboxStore, StorageError,
    WorkResult,
};
