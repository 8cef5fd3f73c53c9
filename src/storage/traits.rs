use crate::model::{EntityReference, EntityState};
use crate::orchestration::IndexWork;
use crate::outbox::{AgentRecord, EventStatus, OutboxEvent, ShardRange};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Concurrent modification: {0}")]
    Conflict(String),
}

/// Read access to the entity store, used to walk associations and to load
/// entities whose state was not provided with the change.
#[async_trait]
pub trait EntityProvider: Send + Sync {
    async fn load(&self, entity: &EntityReference) -> Result<Option<EntityState>, StorageError>;

    /// Default implementation falls back to sequential loads.
    async fn load_many(&self, entities: &[EntityReference]) -> Result<Vec<Option<EntityState>>, StorageError> {
        let mut states = Vec::with_capacity(entities.len());
        for entity in entities {
            states.push(self.load(entity).await?);
        }
        Ok(states)
    }

    /// Identifiers of a type, paginated, in a stable order.
    /// Returns an empty vec when offset exceeds the total count.
    async fn scan_identifiers(
        &self,
        type_name: &str,
        tenant: Option<&str>,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<String>, StorageError>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Timeouts, rejected execution, unavailable nodes. Worth retrying.
    #[error("Transient backend failure: {0}")]
    Transient(String),
    #[error("Backend failure: {0}")]
    Fatal(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Outcome of one work. `Err` is a document-level rejection (malformed
/// document, mapping conflict) that must not fail its siblings.
pub type WorkResult = Result<(), String>;

/// The search backend, as seen by orchestrators.
#[async_trait]
pub trait IndexBackend: Send + Sync {
    /// Apply works in order. Returns one result per work.
    async fn execute(&self, index: &str, works: &[IndexWork]) -> Result<Vec<WorkResult>, BackendError>;

    /// Make applied works durable.
    async fn commit(&self, index: &str) -> Result<(), BackendError>;

    /// Make applied works visible to searches.
    async fn refresh(&self, index: &str) -> Result<(), BackendError>;
}

/// Where a unit of work writes its outbox events: normally the open
/// transaction of the domain write, so both commit or roll back together.
#[async_trait]
pub trait OutboxSink: Send {
    async fn persist(&mut self, events: &[OutboxEvent]) -> Result<(), StorageError>;
}

/// Sink for callers without a transaction. Accepts nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTransaction;

#[async_trait]
impl OutboxSink for NoTransaction {
    async fn persist(&mut self, events: &[OutboxEvent]) -> Result<(), StorageError> {
        if events.is_empty() {
            Ok(())
        } else {
            Err(StorageError::Backend(
                "outbox events must be written inside a transaction".to_string(),
            ))
        }
    }
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert outside of any domain transaction (replays, tooling).
    async fn insert(&self, events: &[OutboxEvent]) -> Result<(), StorageError>;

    /// PENDING events of `range` due at `now_ms`, oldest first.
    async fn find_pending(&self, range: ShardRange, now_ms: i64, limit: usize) -> Result<Vec<OutboxEvent>, StorageError>;

    /// Optimistic claim: PENDING → PROCESSING if nobody touched the row since
    /// it was read. `false` means another agent won.
    async fn claim(&self, event: &OutboxEvent, processor_id: &str) -> Result<bool, StorageError>;

    /// Delete the events of `ids` that are still claimed by `processor_id`.
    async fn delete(&self, processor_id: &str, ids: &[String]) -> Result<u64, StorageError>;

    /// Back to PENDING with a new retry count and due time. `false` when the
    /// event is no longer claimed by `processor_id`.
    async fn reschedule(
        &self,
        processor_id: &str,
        id: &str,
        retries: i64,
        process_after: i64,
    ) -> Result<bool, StorageError>;

    /// PROCESSING → FAILED, under the same ownership condition as
    /// [`reschedule`](Self::reschedule).
    async fn mark_failed(&self, processor_id: &str, id: &str, retries: i64) -> Result<bool, StorageError>;

    /// Release PROCESSING events whose processor has no row in the agent
    /// table. Membership is read at release time, so an agent registering
    /// concurrently keeps its claims.
    async fn release_claims(&self) -> Result<u64, StorageError>;

    async fn count(&self, status: Option<EventStatus>) -> Result<u64, StorageError>;

    async fn find_failed(&self, limit: usize) -> Result<Vec<OutboxEvent>, StorageError>;

    /// FAILED → PENDING with retries reset.
    async fn retry_failed(&self, ids: &[String]) -> Result<u64, StorageError>;
}

/// Cluster membership table.
#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn list_agents(&self) -> Result<Vec<AgentRecord>, StorageError>;

    async fn insert_agent(&self, agent: &AgentRecord) -> Result<(), StorageError>;

    /// Version-checked update. Succeeds only if the stored version equals
    /// `agent.version`; the stored version then becomes `agent.version + 1`.
    async fn update_agent(&self, agent: &AgentRecord) -> Result<bool, StorageError>;

    async fn delete_agents(&self, ids: &[String]) -> Result<u64, StorageError>;
}
