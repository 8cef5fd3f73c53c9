//! In-memory implementations of every storage seam.
//!
//! Used by the test suites and usable by embedders' tests. The index backend
//! records every call and can inject per-document rejections, transient
//! failures, and pauses.

use super::traits::{
    AgentRepository, BackendError, EntityProvider, IndexBackend, OutboxSink, OutboxStore, StorageError, WorkResult,
};
use crate::document::IndexDocument;
use crate::model::{EntityReference, EntityState};
use crate::orchestration::{IndexWork, WorkKind};
use crate::outbox::{AgentRecord, EventStatus, OutboxEvent, ShardRange};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryEntityStore {
    entities: DashMap<EntityReference, EntityState>,
    failing: DashSet<EntityReference>,
    loads: AtomicUsize,
}

impl InMemoryEntityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, state: EntityState) {
        self.entities.insert(state.reference.clone(), state);
    }

    pub fn remove(&self, entity: &EntityReference) -> Option<EntityState> {
        self.entities.remove(entity).map(|(_, state)| state)
    }

    pub fn get(&self, entity: &EntityReference) -> Option<EntityState> {
        self.entities.get(entity).map(|r| r.value().clone())
    }

    /// Make loads of `entity` fail with a backend error.
    pub fn fail_loads_of(&self, entity: EntityReference) {
        self.failing.insert(entity);
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[async_trait]
impl EntityProvider for InMemoryEntityStore {
    async fn load(&self, entity: &EntityReference) -> Result<Option<EntityState>, StorageError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(entity) {
            return Err(StorageError::Backend(format!("cannot load {entity}")));
        }
        Ok(self.get(entity))
    }

    async fn scan_identifiers(
        &self,
        type_name: &str,
        tenant: Option<&str>,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<String>, StorageError> {
        let mut ids: Vec<String> = self
            .entities
            .iter()
            .filter(|e| e.key().type_name == type_name && e.key().tenant.as_deref() == tenant)
            .map(|e| e.key().id.clone())
            .collect();
        ids.sort();
        Ok(ids
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(limit)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Index backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DocumentKey {
    index: String,
    routing_key: Option<String>,
    tenant: Option<String>,
    id: String,
}

impl DocumentKey {
    fn of(work: &IndexWork) -> Self {
        Self {
            index: work.index.clone(),
            routing_key: work.routing_key.clone(),
            tenant: work.tenant.clone(),
            id: work.document_id.clone(),
        }
    }
}

/// Releases a paused [`InMemoryIndexBackend`] when dropped.
pub struct PauseGuard {
    paused: Arc<watch::Sender<bool>>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.paused.send_replace(false);
    }
}

/// Documents are keyed by (index, routing key, tenant, id): a delete with the
/// wrong routing key misses, like on a sharded search cluster.
pub struct InMemoryIndexBackend {
    documents: DashMap<DocumentKey, IndexDocument>,
    applied: Mutex<Vec<IndexWork>>,
    execute_calls: AtomicUsize,
    commits: DashMap<String, usize>,
    refreshes: DashMap<String, usize>,
    failing_documents: DashSet<String>,
    transient_failures: AtomicUsize,
    paused: Arc<watch::Sender<bool>>,
    started: watch::Sender<usize>,
}

impl Default for InMemoryIndexBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryIndexBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            documents: DashMap::new(),
            applied: Mutex::new(Vec::new()),
            execute_calls: AtomicUsize::new(0),
            commits: DashMap::new(),
            refreshes: DashMap::new(),
            failing_documents: DashSet::new(),
            transient_failures: AtomicUsize::new(0),
            paused: Arc::new(watch::channel(false).0),
            started: watch::channel(0).0,
        }
    }

    /// Reject every work on this document id.
    pub fn fail_document(&self, id: impl Into<String>) {
        self.failing_documents.insert(id.into());
    }

    pub fn clear_failures(&self) {
        self.failing_documents.clear();
        self.transient_failures.store(0, Ordering::SeqCst);
    }

    /// Fail the next `count` execute calls with a transient error.
    pub fn fail_transiently(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Block execute calls until the guard is dropped.
    #[must_use]
    pub fn pause(&self) -> PauseGuard {
        self.paused.send_replace(true);
        PauseGuard {
            paused: Arc::clone(&self.paused),
        }
    }

    /// Wait until at least `count` execute calls have started.
    pub async fn wait_for_execute_calls(&self, count: usize) {
        let mut rx = self.started.subscribe();
        let _ = rx.wait_for(|started| *started >= count).await;
    }

    /// Every work applied (accepted or rejected), in order.
    pub fn applied(&self) -> Vec<IndexWork> {
        self.applied.lock().clone()
    }

    pub fn execute_calls(&self) -> usize {
        self.execute_calls.load(Ordering::SeqCst)
    }

    pub fn commits(&self, index: &str) -> usize {
        self.commits.get(index).map_or(0, |c| *c)
    }

    pub fn refreshes(&self, index: &str) -> usize {
        self.refreshes.get(index).map_or(0, |c| *c)
    }

    /// Any copy of the document, whatever its routing key.
    pub fn document(&self, index: &str, id: &str) -> Option<IndexDocument> {
        self.documents_with_id(index, id).into_iter().next()
    }

    /// Every copy of the document, one per routing key it was written with.
    pub fn documents_with_id(&self, index: &str, id: &str) -> Vec<IndexDocument> {
        self.documents
            .iter()
            .filter(|d| d.key().index == index && d.key().id == id)
            .map(|d| d.value().clone())
            .collect()
    }

    pub fn document_count(&self, index: &str) -> usize {
        self.documents.iter().filter(|d| d.key().index == index).count()
    }

    fn apply(&self, work: &IndexWork) -> WorkResult {
        if self.failing_documents.contains(&work.document_id) {
            return Err(format!("document '{}' rejected", work.document_id));
        }
        let key = DocumentKey::of(work);
        match &work.kind {
            WorkKind::Add(doc) | WorkKind::Update(doc) => {
                self.documents.insert(key, doc.clone());
            }
            WorkKind::Delete => {
                self.documents.remove(&key);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl IndexBackend for InMemoryIndexBackend {
    async fn execute(&self, _index: &str, works: &[IndexWork]) -> Result<Vec<WorkResult>, BackendError> {
        self.started.send_modify(|started| *started += 1);
        let mut paused = self.paused.subscribe();
        let _ = paused.wait_for(|p| !*p).await;

        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BackendError::Transient("injected transient failure".to_string()));
        }

        let results = works.iter().map(|w| self.apply(w)).collect();
        self.applied.lock().extend(works.iter().cloned());
        Ok(results)
    }

    async fn commit(&self, index: &str) -> Result<(), BackendError> {
        *self.commits.entry(index.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn refresh(&self, index: &str) -> Result<(), BackendError> {
        *self.refreshes.entry(index.to_string()).or_insert(0) += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Outbox and agents
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryOutboxStore {
    events: Mutex<BTreeMap<String, OutboxEvent>>,
    agents: Mutex<BTreeMap<String, AgentRecord>>,
    agents_unavailable: AtomicBool,
}

impl InMemoryOutboxStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a transaction; events persisted through it appear on commit.
    pub fn begin(&self) -> MemoryOutboxTransaction<'_> {
        MemoryOutboxTransaction {
            store: self,
            staged: Vec::new(),
        }
    }

    /// Simulate an unreachable membership table.
    pub fn set_agents_unavailable(&self, unavailable: bool) {
        self.agents_unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<OutboxEvent> {
        self.events.lock().values().cloned().collect()
    }

    fn check_agents(&self) -> Result<(), StorageError> {
        if self.agents_unavailable.load(Ordering::SeqCst) {
            Err(StorageError::Backend("agent table unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Staged outbox writes. Dropping without [`commit`](Self::commit) rolls back.
pub struct MemoryOutboxTransaction<'a> {
    store: &'a InMemoryOutboxStore,
    staged: Vec<OutboxEvent>,
}

impl MemoryOutboxTransaction<'_> {
    pub fn commit(self) {
        let mut events = self.store.events.lock();
        for event in self.staged {
            events.insert(event.id.clone(), event);
        }
    }

    pub fn rollback(self) {}
}

#[async_trait]
impl OutboxSink for MemoryOutboxTransaction<'_> {
    async fn persist(&mut self, events: &[OutboxEvent]) -> Result<(), StorageError> {
        self.staged.extend(events.iter().cloned());
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(&self, events: &[OutboxEvent]) -> Result<(), StorageError> {
        let mut stored = self.events.lock();
        for event in events {
            stored.insert(event.id.clone(), event.clone());
        }
        Ok(())
    }

    async fn find_pending(&self, range: ShardRange, now_ms: i64, limit: usize) -> Result<Vec<OutboxEvent>, StorageError> {
        let mut pending: Vec<OutboxEvent> = self
            .events
            .lock()
            .values()
            .filter(|e| e.is_eligible(&range, now_ms))
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn claim(&self, event: &OutboxEvent, processor_id: &str) -> Result<bool, StorageError> {
        let mut events = self.events.lock();
        match events.get_mut(&event.id) {
            Some(stored) if stored.version == event.version && stored.status == EventStatus::Pending => {
                stored.status = EventStatus::Processing;
                stored.processor_id = Some(processor_id.to_string());
                stored.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, processor_id: &str, ids: &[String]) -> Result<u64, StorageError> {
        let mut events = self.events.lock();
        let mut deleted = 0;
        for id in ids {
            if events.get(id).is_some_and(|e| e.is_claimed_by(processor_id)) {
                events.remove(id);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn reschedule(
        &self,
        processor_id: &str,
        id: &str,
        retries: i64,
        process_after: i64,
    ) -> Result<bool, StorageError> {
        let mut events = self.events.lock();
        let Some(event) = events.get_mut(id).filter(|e| e.is_claimed_by(processor_id)) else {
            return Ok(false);
        };
        event.status = EventStatus::Pending;
        event.retries = retries;
        event.process_after = process_after;
        event.processor_id = None;
        event.version += 1;
        Ok(true)
    }

    async fn mark_failed(&self, processor_id: &str, id: &str, retries: i64) -> Result<bool, StorageError> {
        let mut events = self.events.lock();
        let Some(event) = events.get_mut(id).filter(|e| e.is_claimed_by(processor_id)) else {
            return Ok(false);
        };
        event.status = EventStatus::Failed;
        event.retries = retries;
        event.processor_id = None;
        event.version += 1;
        Ok(true)
    }

    async fn release_claims(&self) -> Result<u64, StorageError> {
        // Lock order: agents, then events.
        let agents = self.agents.lock();
        let mut released = 0;
        for event in self.events.lock().values_mut() {
            let orphaned = event.status == EventStatus::Processing
                && event.processor_id.as_ref().map_or(true, |p| !agents.contains_key(p));
            if orphaned {
                event.status = EventStatus::Pending;
                event.processor_id = None;
                event.version += 1;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn count(&self, status: Option<EventStatus>) -> Result<u64, StorageError> {
        Ok(self
            .events
            .lock()
            .values()
            .filter(|e| status.map_or(true, |s| e.status == s))
            .count() as u64)
    }

    async fn find_failed(&self, limit: usize) -> Result<Vec<OutboxEvent>, StorageError> {
        Ok(self
            .events
            .lock()
            .values()
            .filter(|e| e.status == EventStatus::Failed)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn retry_failed(&self, ids: &[String]) -> Result<u64, StorageError> {
        let mut events = self.events.lock();
        let mut requeued = 0;
        for id in ids {
            if let Some(event) = events.get_mut(id).filter(|e| e.status == EventStatus::Failed) {
                event.status = EventStatus::Pending;
                event.retries = 0;
                event.process_after = 0;
                event.version += 1;
                requeued += 1;
            }
        }
        Ok(requeued)
    }
}

#[async_trait]
impl AgentRepository for InMemoryOutboxStore {
    async fn list_agents(&self) -> Result<Vec<AgentRecord>, StorageError> {
        self.check_agents()?;
        Ok(self.agents.lock().values().cloned().collect())
    }

    async fn insert_agent(&self, agent: &AgentRecord) -> Result<(), StorageError> {
        self.check_agents()?;
        let mut agents = self.agents.lock();
        if agents.contains_key(&agent.id) {
            return Err(StorageError::Conflict(format!("agent {} already registered", agent.id)));
        }
        agents.insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn update_agent(&self, agent: &AgentRecord) -> Result<bool, StorageError> {
        self.check_agents()?;
        let mut agents = self.agents.lock();
        match agents.get_mut(&agent.id) {
            Some(stored) if stored.version == agent.version => {
                *stored = AgentRecord {
                    version: agent.version + 1,
                    ..agent.clone()
                };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_agents(&self, ids: &[String]) -> Result<u64, StorageError> {
        self.check_agents()?;
        let mut agents = self.agents.lock();
        Ok(ids.iter().filter(|id| agents.remove(*id).is_some()).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::event::now_millis;

    fn event(id: &str) -> OutboxEvent {
        OutboxEvent::new(&EntityReference::new("Book", id), vec![1, 2, 3], now_millis())
    }

    #[tokio::test]
    async fn test_scan_identifiers_pages_in_order() {
        let store = InMemoryEntityStore::new();
        for id in ["c", "a", "b"] {
            store.put(EntityState::new(EntityReference::new("Book", id)));
        }
        store.put(EntityState::new(EntityReference::new("Book", "z").with_tenant("t1")));

        assert_eq!(store.scan_identifiers("Book", None, 0, 2).await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.scan_identifiers("Book", None, 2, 2).await.unwrap(), vec!["c"]);
        assert!(store.scan_identifiers("Book", None, 10, 2).await.unwrap().is_empty());
        assert_eq!(store.scan_identifiers("Book", Some("t1"), 0, 10).await.unwrap(), vec!["z"]);
    }

    #[tokio::test]
    async fn test_transaction_rollback_drops_events() {
        let store = InMemoryOutboxStore::new();

        let mut tx = store.begin();
        tx.persist(&[event("1")]).await.unwrap();
        tx.rollback();
        assert_eq!(store.count(None).await.unwrap(), 0);

        let mut tx = store.begin();
        tx.persist(&[event("1"), event("2")]).await.unwrap();
        tx.commit();
        assert_eq!(store.count(Some(EventStatus::Pending)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = InMemoryOutboxStore::new();
        let e = event("1");
        store.insert(&[e.clone()]).await.unwrap();

        assert!(store.claim(&e, "a").await.unwrap());
        assert!(!store.claim(&e, "b").await.unwrap());
        assert_eq!(store.count(Some(EventStatus::Processing)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_release_claims_of_dead_processors() {
        let store = InMemoryOutboxStore::new();
        let alive = AgentRecord::new("alive", crate::outbox::AgentType::EventProcessing, 0, 1000);
        store.insert_agent(&alive).await.unwrap();
        let (first, second) = (event("1"), event("2"));
        store.insert(&[first.clone(), second.clone()]).await.unwrap();
        store.claim(&first, "dead").await.unwrap();
        store.claim(&second, &alive.id).await.unwrap();

        assert_eq!(store.release_claims().await.unwrap(), 1);
        let pending = store.find_pending(ShardRange::all(), now_millis(), 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, first.id);
        assert_eq!(pending[0].processor_id, None);
        assert_eq!(store.count(Some(EventStatus::Processing)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_settling_needs_the_claim() {
        let store = InMemoryOutboxStore::new();
        let e = event("1");
        store.insert(&[e.clone()]).await.unwrap();
        assert!(store.claim(&e, "a").await.unwrap());

        // "a" lost the event to "b" in between.
        store.release_claims().await.unwrap();
        let reread = store.find_pending(ShardRange::all(), now_millis(), 1).await.unwrap();
        assert!(store.claim(&reread[0], "b").await.unwrap());

        assert_eq!(store.delete("a", &[e.id.clone()]).await.unwrap(), 0);
        assert!(!store.reschedule("a", &e.id, 1, 0).await.unwrap());
        assert!(!store.mark_failed("a", &e.id, 1).await.unwrap());
        assert_eq!(store.events()[0].processor_id.as_deref(), Some("b"));

        assert_eq!(store.delete("b", &[e.id.clone()]).await.unwrap(), 1);
        assert_eq!(store.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_agent_update_is_version_checked() {
        let store = InMemoryOutboxStore::new();
        let agent = AgentRecord::new("node", crate::outbox::AgentType::EventProcessing, 0, 1000);
        store.insert_agent(&agent).await.unwrap();

        assert!(store.update_agent(&agent).await.unwrap());
        // Stale version now.
        assert!(!store.update_agent(&agent).await.unwrap());
        assert_eq!(store.list_agents().await.unwrap()[0].version, 1);
    }

    #[tokio::test]
    async fn test_delete_with_other_routing_key_misses() {
        let backend = InMemoryIndexBackend::new();
        let entity = EntityReference::new("Book", "1");
        let doc = IndexDocument {
            id: "1".into(),
            tenant: None,
            routing_key: Some("eu".into()),
            fields: serde_json::Map::new(),
        };
        backend
            .execute("books", &[IndexWork::add("books", entity.clone(), doc)])
            .await
            .unwrap();
        backend
            .execute("books", &[IndexWork::delete("books", entity.clone(), None)])
            .await
            .unwrap();
        assert_eq!(backend.document_count("books"), 1);

        backend
            .execute("books", &[IndexWork::delete("books", entity, Some("eu".into()))])
            .await
            .unwrap();
        assert_eq!(backend.document_count("books"), 0);
    }
}
