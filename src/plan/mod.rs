// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Session-scoped accumulation of indexing operations.
//!
//! An [`IndexingPlan`] holds at most one entry per document key, in insertion
//! order. Recorded operations are merged with the table in [`operation`];
//! [`IndexingPlan::process`] then resolves the entities that must be
//! reindexed because of the recorded changes, until nothing new is dirty.
//! Documents are derived only at submission, from the latest state.

mod operation;
mod report;

pub use operation::IndexingOperation;
pub use report::{EntityFailure, ExecutionReport, FailureStage};

use crate::context::MappingContext;
use crate::document::{DerivationError, DocumentDeriver};
use crate::error::IndexingError;
use crate::mapping::{IndexedTypeDescriptor, Route};
use crate::metrics;
use crate::model::{ChangeKind, Dirtiness, EntityChangeEvent, EntityReference, EntityState};
use crate::orchestration::{IndexWork, OrchestratorError, WorkFuture, WorkOptions, WorkOrchestrator};
use crate::outbox::payload::{self, EventPayload, PayloadError};
use crate::outbox::OutboxEvent;
use crate::outbox::event::now_millis;
use crate::storage::traits::WorkResult;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

#[derive(Debug, Clone, Default)]
struct PlanEntry {
    /// `None`: only a dependency asked for this document to be rebuilt.
    operation: Option<IndexingOperation>,
    state: Option<EntityState>,
    /// Earliest known state before this unit of work.
    previous: Option<EntityState>,
    dirtiness: Dirtiness,
    resolved: Dirtiness,
    reindex: bool,
    previous_routes: Vec<Option<String>>,
}

impl PlanEntry {
    fn effective_operation(&self) -> IndexingOperation {
        self.operation.unwrap_or(IndexingOperation::Update)
    }

    /// Routing keys the document may currently be stored under.
    fn known_routes(&self, descriptor: &IndexedTypeDescriptor) -> Vec<Option<String>> {
        let mut routes = self.previous_routes.clone();
        if let Some(previous) = &self.previous {
            if let Ok(Route::Indexed { routing_key }) = descriptor.route(previous) {
                if !routes.contains(&routing_key) {
                    routes.push(routing_key);
                }
            }
        }
        routes
    }
}

pub struct IndexingPlan {
    context: Arc<MappingContext>,
    entries: HashMap<EntityReference, PlanEntry>,
    order: Vec<EntityReference>,
    failures: Vec<EntityFailure>,
}

impl IndexingPlan {
    pub fn new(context: Arc<MappingContext>) -> Self {
        Self {
            context,
            entries: HashMap::new(),
            order: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn context(&self) -> &Arc<MappingContext> {
        &self.context
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Entities with an entry, in insertion order.
    pub fn entities(&self) -> impl Iterator<Item = &EntityReference> {
        self.order.iter()
    }

    /// Pending operation for `entity`. Reindex-only entries report `Update`.
    pub fn operation(&self, entity: &EntityReference) -> Option<IndexingOperation> {
        self.entries.get(entity).map(PlanEntry::effective_operation)
    }

    /// Whether a dependency asked for `entity` to be reindexed.
    pub fn is_reindex(&self, entity: &EntityReference) -> bool {
        self.entries.get(entity).map_or(false, |e| e.reindex)
    }

    /// Failures collected so far (resolution).
    pub fn failures(&self) -> &[EntityFailure] {
        &self.failures
    }

    fn entry(&mut self, entity: EntityReference) -> &mut PlanEntry {
        if !self.entries.contains_key(&entity) {
            self.order.push(entity.clone());
        }
        self.entries.entry(entity).or_default()
    }

    fn record(
        &mut self,
        entity: EntityReference,
        operation: IndexingOperation,
        state: Option<EntityState>,
        previous: Option<EntityState>,
        dirtiness: Dirtiness,
    ) {
        if !self.context.is_relevant(&entity.type_name) {
            trace!(entity = %entity, "Ignoring change to type unknown to the mapping");
            return;
        }
        let entry = self.entry(entity);
        entry.operation = Some(IndexingOperation::merge(entry.operation, operation));
        if operation == IndexingOperation::Delete {
            entry.state = None;
        } else if state.is_some() {
            entry.state = state;
        }
        if entry.previous.is_none() {
            entry.previous = previous;
        }
        entry.dirtiness.merge(&dirtiness);
        metrics::record_plan_operation(operation.as_str());
    }

    pub fn add(&mut self, state: EntityState) {
        let entity = state.reference.clone();
        self.record(entity, IndexingOperation::Add, Some(state), None, Dirtiness::All);
    }

    pub fn add_or_update(&mut self, state: EntityState) {
        let entity = state.reference.clone();
        self.record(entity, IndexingOperation::AddOrUpdate, Some(state), None, Dirtiness::All);
    }

    pub fn update(&mut self, state: EntityState, dirtiness: Dirtiness) {
        let entity = state.reference.clone();
        self.record(entity, IndexingOperation::Update, Some(state), None, dirtiness);
    }

    pub fn update_with_previous(&mut self, previous: EntityState, current: EntityState, dirtiness: Dirtiness) {
        let entity = current.reference.clone();
        self.record(entity, IndexingOperation::Update, Some(current), Some(previous), dirtiness);
    }

    pub fn delete(&mut self, entity: EntityReference, previous: Option<EntityState>) {
        self.record(entity, IndexingOperation::Delete, None, previous, Dirtiness::All);
    }

    /// Record a change reported by the persistence layer.
    pub fn apply(&mut self, event: EntityChangeEvent) {
        let operation = match event.kind {
            ChangeKind::Insert => IndexingOperation::Add,
            ChangeKind::Update => IndexingOperation::Update,
            ChangeKind::Delete => IndexingOperation::Delete,
            ChangeKind::Upsert => IndexingOperation::AddOrUpdate,
        };
        self.record(event.entity, operation, event.current, event.previous, event.dirtiness);
    }

    /// Replay an outbox event. The agent cannot know whether an ADD was
    /// already applied, so it is replayed as ADD_OR_UPDATE.
    pub fn apply_event(&mut self, entity: EntityReference, payload: EventPayload) {
        if !self.context.is_relevant(&entity.type_name) {
            return;
        }
        let operation = match payload.operation {
            IndexingOperation::Add => IndexingOperation::AddOrUpdate,
            other => other,
        };
        let entry = self.entry(entity);
        if operation != IndexingOperation::Noop {
            entry.operation = Some(IndexingOperation::merge(entry.operation, operation));
        }
        if operation == IndexingOperation::Delete {
            entry.state = None;
        }
        entry.reindex |= payload.reindex;
        entry.dirtiness.merge(&payload.dirtiness);
        for route in payload.previous_routes {
            if !entry.previous_routes.contains(&route) {
                entry.previous_routes.push(route);
            }
        }
    }

    /// Ask for the document of `entity` to be rebuilt. Never changes an
    /// existing entry's operation.
    pub fn reindex(&mut self, entity: EntityReference) {
        if !self.context.graph().is_indexed(&entity.type_name) {
            return;
        }
        self.entry(entity).reindex = true;
    }

    fn fail(&mut self, entity: EntityReference, stage: FailureStage, message: String) {
        debug!(entity = %entity, stage = %stage, error = %message, "Plan entry failed");
        self.failures.push(EntityFailure::new(entity, stage, message));
    }

    /// Resolve dependents of every unresolved change, to a fixed point.
    ///
    /// Resolution failures are attached to the changed entity; its own
    /// document is still derived.
    pub async fn process(&mut self) {
        let context = Arc::clone(&self.context);
        let mut resolver = context.resolver();
        let mut resolved_total = 0;

        loop {
            let pending: Vec<(EntityReference, Dirtiness)> = self
                .order
                .iter()
                .filter_map(|entity| {
                    let entry = &self.entries[entity];
                    if entry.operation == Some(IndexingOperation::Noop) {
                        return None;
                    }
                    let unresolved = entry.dirtiness.difference(&entry.resolved);
                    (!unresolved.is_clean()).then(|| (entity.clone(), unresolved))
                })
                .collect();
            if pending.is_empty() {
                break;
            }

            for (entity, unresolved) in pending {
                let (current, previous) = {
                    let entry = self.entry(entity.clone());
                    entry.resolved.merge(&unresolved);
                    match entry.operation {
                        // The last known state of a deleted entity is what
                        // still points at its dependents.
                        Some(IndexingOperation::Delete) => (entry.previous.clone(), None),
                        _ => (entry.state.clone(), entry.previous.clone()),
                    }
                };
                match resolver
                    .resolve_entities_to_reindex(&entity, current.as_ref(), previous.as_ref(), &unresolved)
                    .await
                {
                    Ok(found) => {
                        for dependent in found {
                            if dependent != entity {
                                resolved_total += 1;
                                self.reindex(dependent);
                            }
                        }
                    }
                    Err(e) => self.fail(entity, FailureStage::Resolution, e.to_string()),
                }
            }
        }

        if resolved_total > 0 {
            metrics::record_resolved_dependents(resolved_total);
            debug!(dependents = resolved_total, entries = self.order.len(), "Plan resolved");
        }
    }

    /// Turn every entry into backend works.
    async fn derive(&mut self) -> Derived {
        let context = Arc::clone(&self.context);
        let mut deriver = DocumentDeriver::new(context.provider());
        let mut derived = Derived::default();

        for entity in std::mem::take(&mut self.order) {
            let Some(entry) = self.entries.remove(&entity) else {
                continue;
            };
            let Some(descriptor) = context.descriptor(&entity.type_name) else {
                continue;
            };
            let operation = entry.effective_operation();

            if operation == IndexingOperation::Noop {
                derived.skipped += 1;
                continue;
            }
            if operation == IndexingOperation::Update
                && !entry.reindex
                && !context.graph().affects_self(&entity.type_name, &entry.dirtiness)
            {
                trace!(entity = %entity, "Skipping update: no indexed property is dirty");
                derived.skipped += 1;
                continue;
            }

            match derive_entry(&mut deriver, descriptor, &entity, &entry, operation).await {
                Ok(works) => {
                    for work in works {
                        derived.owners.push(entity.clone());
                        derived.works.push(work);
                    }
                }
                Err(e) => {
                    self.fail(entity, FailureStage::Derivation, e.to_string());
                }
            }
        }

        self.entries.clear();
        derived.failures = std::mem::take(&mut self.failures);
        if derived.skipped > 0 {
            metrics::record_skipped(derived.skipped);
        }
        derived
    }

    /// Resolve, derive and queue the plan's works. Returns once every work is
    /// accepted by the orchestrator.
    pub async fn submit(mut self, orchestrator: &WorkOrchestrator, options: WorkOptions) -> Result<PlanExecution, IndexingError> {
        self.process().await;
        self.submit_entries(orchestrator, options).await
    }

    /// Derive and queue the recorded entries only, without looking for
    /// dependents. Used when every affected entity is already in the plan.
    pub async fn submit_entries(
        mut self,
        orchestrator: &WorkOrchestrator,
        options: WorkOptions,
    ) -> Result<PlanExecution, IndexingError> {
        let derived = self.derive().await;
        debug!(
            works = derived.works.len(),
            skipped = derived.skipped,
            failures = derived.failures.len(),
            "Submitting plan"
        );
        let future = orchestrator.submit(derived.works, options).await?;
        Ok(PlanExecution {
            future,
            owners: derived.owners,
            failures: derived.failures,
            skipped: derived.skipped,
        })
    }

    pub async fn execute_and_report(
        self,
        orchestrator: &WorkOrchestrator,
        options: WorkOptions,
    ) -> Result<ExecutionReport, IndexingError> {
        Ok(self.submit(orchestrator, options).await?.report().await)
    }

    /// One outbox event per entry, reindex-only entries included. Call after
    /// [`process`](Self::process).
    pub fn to_events(&self, compression_threshold: usize) -> Result<Vec<OutboxEvent>, PayloadError> {
        let now = now_millis();
        let mut events = Vec::with_capacity(self.order.len());
        for entity in &self.order {
            let entry = &self.entries[entity];
            let operation = entry.effective_operation();
            if operation == IndexingOperation::Noop {
                continue;
            }
            let previous_routes = match self.context.descriptor(&entity.type_name) {
                Some(descriptor) => entry.known_routes(descriptor),
                None => entry.previous_routes.clone(),
            };
            let payload = EventPayload {
                operation,
                dirtiness: entry.dirtiness.clone(),
                reindex: entry.reindex || entry.operation.is_none(),
                previous_routes,
            };
            events.push(OutboxEvent::new(entity, payload::encode(&payload, compression_threshold)?, now));
        }
        Ok(events)
    }

    /// Drop everything recorded (transaction rollback).
    pub fn discard(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.failures.clear();
    }
}

impl std::fmt::Debug for IndexingPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexingPlan")
            .field("entries", &self.order.len())
            .field("failures", &self.failures.len())
            .finish()
    }
}

#[derive(Default)]
struct Derived {
    works: Vec<IndexWork>,
    /// Entity of each work, same positions.
    owners: Vec<EntityReference>,
    failures: Vec<EntityFailure>,
    skipped: usize,
}

async fn derive_entry(
    deriver: &mut DocumentDeriver<'_>,
    descriptor: &IndexedTypeDescriptor,
    entity: &EntityReference,
    entry: &PlanEntry,
    operation: IndexingOperation,
) -> Result<Vec<IndexWork>, DerivationError> {
    let index = descriptor.index_name.as_str();
    let known_routes = entry.known_routes(descriptor);
    let delete_everywhere = |routes: Vec<Option<String>>| -> Vec<IndexWork> {
        let routes = if routes.is_empty() { vec![None] } else { routes };
        routes
            .into_iter()
            .map(|route| IndexWork::delete(index, entity.clone(), route))
            .collect()
    };

    if !operation.keeps_document() {
        return Ok(delete_everywhere(known_routes));
    }

    let state = match &entry.state {
        Some(state) => {
            deriver.prime(state);
            Some(state.clone())
        }
        None => deriver.load(entity).await?.map(|properties| EntityState {
            reference: entity.clone(),
            properties: (*properties).clone(),
        }),
    };
    let Some(state) = state else {
        trace!(entity = %entity, "Entity is gone, deleting its document");
        return Ok(delete_everywhere(known_routes));
    };

    let route = descriptor.route(&state).map_err(|source| DerivationError::Bridge {
        bridge: "routing".to_string(),
        source,
    })?;
    let routing_key = match route {
        Route::NotIndexed => return Ok(delete_everywhere(known_routes)),
        Route::Indexed { routing_key } => routing_key,
    };

    let mut works: Vec<IndexWork> = known_routes
        .into_iter()
        .filter(|old| *old != routing_key)
        .map(|old| IndexWork::delete(index, entity.clone(), old))
        .collect();

    let document = deriver.derive(descriptor, &state, routing_key).await?;
    works.push(match operation {
        IndexingOperation::Add => IndexWork::add(index, entity.clone(), document),
        _ => IndexWork::update(index, entity.clone(), document),
    });
    Ok(works)
}

/// A submitted plan. Waiting is optional: dropping it leaves the works
/// running.
#[must_use = "dropping a PlanExecution discards the report"]
pub struct PlanExecution {
    future: WorkFuture,
    owners: Vec<EntityReference>,
    failures: Vec<EntityFailure>,
    skipped: usize,
}

impl PlanExecution {
    pub async fn report(self) -> ExecutionReport {
        let Self {
            future,
            owners,
            failures,
            skipped,
        } = self;
        let outcome = future.wait().await;
        build_report(owners, failures, skipped, outcome)
    }

    /// Stop waiting after `timeout`. Works keep running; unfinished entities
    /// are reported with the `Timeout` stage.
    pub async fn report_timeout(self, timeout: Duration) -> ExecutionReport {
        let Self {
            future,
            owners,
            failures,
            skipped,
        } = self;
        let outcome = future.wait_timeout(timeout).await;
        build_report(owners, failures, skipped, outcome)
    }
}

fn build_report(
    owners: Vec<EntityReference>,
    mut failures: Vec<EntityFailure>,
    skipped: usize,
    outcome: Result<Vec<WorkResult>, OrchestratorError>,
) -> ExecutionReport {
    let mut failed: HashSet<EntityReference> = failures.iter().map(|f| f.entity.clone()).collect();
    let mut batch_failure = None;

    match outcome {
        Ok(results) => {
            for (entity, result) in owners.iter().zip(results) {
                if let Err(message) = result {
                    if failed.insert(entity.clone()) {
                        failures.push(EntityFailure::new(entity.clone(), FailureStage::Backend, message));
                    }
                }
            }
        }
        Err(e) => {
            let stage = match e {
                OrchestratorError::Timeout(_) => FailureStage::Timeout,
                _ => FailureStage::Backend,
            };
            let message = e.to_string();
            for entity in &owners {
                if failed.insert(entity.clone()) {
                    failures.push(EntityFailure::new(entity.clone(), stage, message.clone()));
                }
            }
            batch_failure = Some(message);
        }
    }

    let succeeded = owners
        .iter()
        .collect::<HashSet<_>>()
        .into_iter()
        .filter(|entity| !failed.contains(*entity))
        .count();

    ExecutionReport {
        succeeded,
        skipped,
        failures,
        batch_failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::LoggingFailureHandler;
    use crate::mapping::{
        BridgeError, IndexSettings, MappingModel, PropertyModel, RoutingBridge, TypeModel, ValueBridge,
    };
    use crate::model::PropertyValue;
    use crate::orchestration::{DocumentCommitStrategy, DocumentRefreshStrategy, OrchestratorConfig, WorkKind};
    use crate::resilience::retry::RetryConfig;
    use crate::storage::memory::{InMemoryEntityStore, InMemoryIndexBackend};
    use serde_json::{json, Value};

    /// Routes books by their `region` property; books without one are not indexed.
    struct RegionRouting;

    impl RoutingBridge for RegionRouting {
        fn name(&self) -> &str {
            "region"
        }
        fn route(&self, entity: &EntityState) -> Result<Route, BridgeError> {
            match entity.get("region") {
                Some(PropertyValue::Text(region)) => Ok(Route::Indexed {
                    routing_key: Some(region.clone()),
                }),
                _ => Ok(Route::NotIndexed),
            }
        }
    }

    struct Strict;

    impl ValueBridge for Strict {
        fn name(&self) -> &str {
            "strict"
        }
        fn to_index(&self, value: &PropertyValue) -> Result<Option<Value>, BridgeError> {
            match value {
                PropertyValue::Text(s) if s != "bad" => Ok(Some(Value::from(s.clone()))),
                _ => Err(BridgeError::Failed("rejected value".into())),
            }
        }
    }

    fn model() -> MappingModel {
        MappingModel::new()
            .with_type(
                TypeModel::entity("Author")
                    .property(PropertyModel::value("name"))
                    .property(PropertyModel::value("email"))
                    .property(PropertyModel::to_many("books", "Book").mapped_by("author")),
            )
            .with_type(
                TypeModel::entity("Book")
                    .property(PropertyModel::value("title"))
                    .property(PropertyModel::value("notes"))
                    .property(PropertyModel::to_one("author", "Author"))
                    .field_with("title", "title", Arc::new(Strict))
                    .field("authorName", "author.name")
                    .indexed(IndexSettings::new("books")),
            )
            .with_type(
                TypeModel::entity("Shop")
                    .property(PropertyModel::value("name"))
                    .property(PropertyModel::value("region"))
                    .field("name", "name")
                    .indexed(IndexSettings::new("shops").routing(Arc::new(RegionRouting))),
            )
    }

    struct Fixture {
        store: Arc<InMemoryEntityStore>,
        backend: Arc<InMemoryIndexBackend>,
        context: Arc<MappingContext>,
        orchestrator: WorkOrchestrator,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(InMemoryEntityStore::new());
            let backend = Arc::new(InMemoryIndexBackend::new());
            let context = Arc::new(
                MappingContext::bootstrap(model(), store.clone(), Arc::new(LoggingFailureHandler)).unwrap(),
            );
            let config = OrchestratorConfig {
                retry: RetryConfig::test(),
                ..Default::default()
            };
            let orchestrator = WorkOrchestrator::serial("test", backend.clone(), config);
            Self {
                store,
                backend,
                context,
                orchestrator,
            }
        }

        fn plan(&self) -> IndexingPlan {
            IndexingPlan::new(Arc::clone(&self.context))
        }

        async fn run(&self, plan: IndexingPlan) -> ExecutionReport {
            plan.execute_and_report(&self.orchestrator, WorkOptions::default())
                .await
                .unwrap()
        }
    }

    fn r(t: &str, id: &str) -> EntityReference {
        EntityReference::new(t, id)
    }

    fn author(name: &str, books: &[&str]) -> EntityState {
        EntityState::new(r("Author", "a"))
            .with("name", name)
            .with("books", PropertyValue::references(books.iter().map(|id| r("Book", id))))
    }

    fn book(id: &str, title: &str) -> EntityState {
        EntityState::new(r("Book", id))
            .with("title", title)
            .with("author", r("Author", "a"))
    }

    fn shop(id: &str, region: Option<&str>) -> EntityState {
        let state = EntityState::new(r("Shop", id)).with("name", "corner");
        match region {
            Some(region) => state.with("region", region),
            None => state,
        }
    }

    #[tokio::test]
    async fn test_add_then_delete_emits_nothing() {
        let f = Fixture::new();
        let mut plan = f.plan();
        plan.add(book("1", "Dune"));
        plan.delete(r("Book", "1"), None);
        assert_eq!(plan.operation(&r("Book", "1")), Some(IndexingOperation::Noop));

        let report = f.run(plan).await;
        assert_eq!(report.skipped, 1);
        assert!(f.backend.applied().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_types_are_ignored() {
        let f = Fixture::new();
        let mut plan = f.plan();
        plan.add(EntityState::new(r("AuditLog", "1")));
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn test_author_rename_reindexes_books() {
        let f = Fixture::new();
        f.store.put(author("Frank", &["1", "2"]));
        f.store.put(book("1", "Dune"));
        f.store.put(book("2", "Children of Dune"));

        let mut plan = f.plan();
        plan.update(author("F. Herbert", &["1", "2"]), Dirtiness::properties(["name"]));
        f.store.put(author("F. Herbert", &["1", "2"]));
        plan.process().await;

        assert!(plan.is_reindex(&r("Book", "1")));
        assert!(plan.is_reindex(&r("Book", "2")));

        let report = f.run(plan).await;
        assert!(report.is_success());
        assert_eq!(report.succeeded, 2);
        let doc = f.backend.document("books", "1").unwrap();
        assert_eq!(doc.field("authorName"), Some(&json!("F. Herbert")));
    }

    #[tokio::test]
    async fn test_unread_property_change_is_skipped() {
        let f = Fixture::new();
        f.store.put(author("Frank", &["1"]));

        let mut plan = f.plan();
        plan.update(book("1", "Dune").with("notes", "draft"), Dirtiness::properties(["notes"]));
        plan.update(author("Frank", &["1"]).with("email", "f@x"), Dirtiness::properties(["email"]));

        let report = f.run(plan).await;
        assert_eq!(report.skipped, 1);
        assert!(f.backend.applied().is_empty());
    }

    #[tokio::test]
    async fn test_reindex_keeps_existing_operation() {
        let f = Fixture::new();
        let mut plan = f.plan();
        plan.delete(r("Book", "1"), Some(book("1", "Dune")));
        plan.reindex(r("Book", "1"));
        assert_eq!(plan.operation(&r("Book", "1")), Some(IndexingOperation::Delete));
    }

    #[tokio::test]
    async fn test_routing_change_deletes_old_route_first() {
        let f = Fixture::new();
        let mut plan = f.plan();
        plan.add(shop("s", Some("eu")));
        f.run(plan).await;

        let mut plan = f.plan();
        plan.update_with_previous(shop("s", Some("eu")), shop("s", Some("us")), Dirtiness::properties(["region"]));
        let report = f.run(plan).await;
        assert!(report.is_success());

        let applied = f.backend.applied();
        let last_two: Vec<(&str, Option<&str>)> = applied[applied.len() - 2..]
            .iter()
            .map(|w| (w.kind_name(), w.routing_key.as_deref()))
            .collect();
        assert_eq!(last_two, vec![("delete", Some("eu")), ("update", Some("us"))]);
        let copies = f.backend.documents_with_id("shops", "s");
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].routing_key.as_deref(), Some("us"));
    }

    #[tokio::test]
    async fn test_not_indexed_route_turns_into_delete() {
        let f = Fixture::new();
        let mut plan = f.plan();
        plan.update_with_previous(shop("s", Some("eu")), shop("s", None), Dirtiness::properties(["region"]));
        f.run(plan).await;

        let applied = f.backend.applied();
        assert_eq!(applied.len(), 1);
        assert!(matches!(applied[0].kind, WorkKind::Delete));
        assert_eq!(applied[0].routing_key.as_deref(), Some("eu"));
    }

    #[tokio::test]
    async fn test_missing_state_turns_into_delete() {
        let f = Fixture::new();
        let mut plan = f.plan();
        plan.reindex(r("Book", "gone"));

        f.run(plan).await;
        let applied = f.backend.applied();
        assert_eq!(applied.len(), 1);
        assert!(matches!(applied[0].kind, WorkKind::Delete));
    }

    #[tokio::test]
    async fn test_derivation_failure_is_isolated() {
        let f = Fixture::new();
        f.store.put(author("Frank", &["1", "2"]));
        let mut plan = f.plan();
        plan.add(book("1", "bad"));
        plan.add(book("2", "Dune"));

        let report = f.run(plan).await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].entity, r("Book", "1"));
        assert_eq!(report.failures[0].stage, FailureStage::Derivation);
        assert!(f.backend.document("books", "2").is_some());
    }

    #[tokio::test]
    async fn test_backend_rejection_is_reported_per_entity() {
        let f = Fixture::new();
        f.backend.fail_document("1");
        let mut plan = f.plan();
        plan.add(book("1", "Dune"));
        plan.add(book("2", "Emma"));

        let report = f.run(plan).await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failure_for(&r("Book", "1")).map(|f| f.stage), Some(FailureStage::Backend));
        assert!(report.batch_failure.is_none());
    }

    #[tokio::test]
    async fn test_timeout_reports_but_does_not_abort() {
        let f = Fixture::new();
        let guard = f.backend.pause();
        let mut plan = f.plan();
        plan.add(book("1", "Dune"));

        let execution = plan
            .submit(
                &f.orchestrator,
                WorkOptions::new(DocumentCommitStrategy::Force, DocumentRefreshStrategy::None),
            )
            .await
            .unwrap();
        let report = execution.report_timeout(Duration::from_millis(20)).await;
        assert_eq!(report.failures[0].stage, FailureStage::Timeout);
        assert!(report.batch_failure.is_some());

        drop(guard);
        f.orchestrator.flush("books").await.unwrap();
        assert!(f.backend.document("books", "1").is_some());
    }

    #[tokio::test]
    async fn test_events_replay_into_equivalent_plan() {
        let f = Fixture::new();
        let mut plan = f.plan();
        plan.add(shop("s", Some("eu")));
        plan.update_with_previous(book("2", "Old"), book("2", "New"), Dirtiness::properties(["title"]));
        plan.process().await;

        let events = plan.to_events(0).unwrap();
        assert_eq!(events.len(), 2);

        let mut replay = f.plan();
        for event in &events {
            replay.apply_event(event.entity(), payload::decode(&event.payload).unwrap());
        }
        assert_eq!(replay.operation(&r("Shop", "s")), Some(IndexingOperation::AddOrUpdate));
        assert_eq!(replay.operation(&r("Book", "2")), Some(IndexingOperation::Update));
    }

    #[tokio::test]
    async fn test_discard_forgets_everything() {
        let f = Fixture::new();
        let mut plan = f.plan();
        plan.add(book("1", "Dune"));
        plan.discard();
        assert!(plan.is_empty());
        assert!(f.run(plan).await.is_success());
        assert!(f.backend.applied().is_empty());
    }
}
