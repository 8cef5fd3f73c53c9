//! Shared fixtures for integration tests.
//!
//! The model is a small library catalogue:
//!
//! ```text
//! Publisher 1──* Author 1──* Book (indexed: "books")
//! ```
//!
//! Book documents read `author.name` and `author.publisher.name`, so a
//! publisher rename cascades two levels down.

#![allow(dead_code)]

use index_sync::mapping::{IndexSettings, MappingModel, PropertyModel, TypeModel};
use index_sync::storage::{InMemoryEntityStore, InMemoryIndexBackend, InMemoryOutboxStore};
use index_sync::{
    CoordinationKind, EntityFailure, EntityReference, EntityState, FailureHandler, IndexSyncConfig, IndexingEngine,
    MappingContext, PropertyValue,
};
use index_sync::outbox::OutboxEvent;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "index_sync=warn".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn model() -> MappingModel {
    MappingModel::new()
        .with_type(
            TypeModel::entity("Publisher")
                .property(PropertyModel::value("name"))
                .property(PropertyModel::to_many("authors", "Author").mapped_by("publisher")),
        )
        .with_type(
            TypeModel::entity("Author")
                .property(PropertyModel::value("name"))
                .property(PropertyModel::value("email"))
                .property(PropertyModel::to_one("publisher", "Publisher"))
                .property(PropertyModel::to_many("books", "Book").mapped_by("author")),
        )
        .with_type(
            TypeModel::entity("Book")
                .property(PropertyModel::value("title"))
                .property(PropertyModel::value("notes"))
                .property(PropertyModel::to_one("author", "Author"))
                .field("title", "title")
                .field("author", "author.name")
                .field("publisher", "author.publisher.name")
                .indexed(IndexSettings::new("books")),
        )
}

pub fn r(type_name: &str, id: &str) -> EntityReference {
    EntityReference::new(type_name, id)
}

pub fn publisher(id: &str, name: &str, authors: &[&str]) -> EntityState {
    EntityState::new(r("Publisher", id))
        .with("name", name)
        .with("authors", PropertyValue::references(authors.iter().map(|a| r("Author", a))))
}

pub fn author(id: &str, name: &str, publisher: &str, books: &[&str]) -> EntityState {
    EntityState::new(r("Author", id))
        .with("name", name)
        .with("email", format!("{id}@example.org"))
        .with("publisher", r("Publisher", publisher))
        .with("books", PropertyValue::references(books.iter().map(|b| r("Book", b))))
}

pub fn book(id: &str, title: &str, author: &str) -> EntityState {
    EntityState::new(r("Book", id))
        .with("title", title)
        .with("author", r("Author", author))
}

/// Fast timings for tests: no backoff, short pulses.
pub fn test_config() -> IndexSyncConfig {
    IndexSyncConfig {
        backend_max_retries: 3,
        backend_retry_initial_ms: 1,
        backend_retry_max_ms: 5,
        outbox_polling_interval_ms: 10,
        outbox_retry_delay_ms: 0,
        agent_pulse_interval_ms: 20,
        agent_pulse_expiration_ms: 200,
        ..Default::default()
    }
}

pub fn outbox_config() -> IndexSyncConfig {
    IndexSyncConfig {
        coordination: CoordinationKind::OutboxPolling,
        ..test_config()
    }
}

/// Failure handler that keeps everything it is told.
#[derive(Default)]
pub struct RecordingFailureHandler {
    pub entities: Mutex<Vec<EntityFailure>>,
    pub events: Mutex<Vec<(OutboxEvent, String)>>,
    pub generic: Mutex<Vec<String>>,
}

impl RecordingFailureHandler {
    pub fn entity_failures(&self) -> Vec<EntityFailure> {
        self.entities.lock().clone()
    }

    pub fn event_failures(&self) -> Vec<(OutboxEvent, String)> {
        self.events.lock().clone()
    }
}

impl FailureHandler for RecordingFailureHandler {
    fn handle_entity_failure(&self, failure: &EntityFailure) {
        self.entities.lock().push(failure.clone());
    }

    fn handle_event_failure(&self, event: &OutboxEvent, error: &str) {
        self.events.lock().push((event.clone(), error.to_string()));
    }

    fn handle_generic(&self, context: &str, error: &str) {
        self.generic.lock().push(format!("{context}: {error}"));
    }
}

/// Entity store, backend and failure handler shared by an engine and the
/// assertions of a test.
pub struct Harness {
    pub store: Arc<InMemoryEntityStore>,
    pub backend: Arc<InMemoryIndexBackend>,
    pub failures: Arc<RecordingFailureHandler>,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        Self {
            store: Arc::new(InMemoryEntityStore::new()),
            backend: Arc::new(InMemoryIndexBackend::new()),
            failures: Arc::new(RecordingFailureHandler::default()),
        }
    }

    /// One publisher, one author, two books.
    pub fn seed_catalogue(&self) {
        self.store.put(publisher("p", "Ace", &["a"]));
        self.store.put(author("a", "Le Guin", "p", &["1", "2"]));
        self.store.put(book("1", "The Dispossessed", "a"));
        self.store.put(book("2", "The Lathe of Heaven", "a"));
    }

    pub fn context(&self) -> Arc<MappingContext> {
        Arc::new(
            MappingContext::bootstrap(model(), self.store.clone(), self.failures.clone())
                .expect("test model is valid"),
        )
    }

    pub fn engine(&self, config: IndexSyncConfig) -> IndexingEngine {
        IndexingEngine::builder(model())
            .config(config)
            .entity_provider(self.store.clone())
            .backend(self.backend.clone())
            .failure_handler(self.failures.clone())
            .node_name("test")
            .build()
            .expect("engine builds")
    }

    pub fn outbox_engine(&self, outbox: Arc<InMemoryOutboxStore>) -> IndexingEngine {
        IndexingEngine::builder(model())
            .config(outbox_config())
            .entity_provider(self.store.clone())
            .backend(self.backend.clone())
            .failure_handler(self.failures.clone())
            .outbox(outbox)
            .node_name("test")
            .build()
            .expect("engine builds")
    }

    pub fn field(&self, id: &str, field: &str) -> Option<String> {
        self.backend
            .document("books", id)
            .and_then(|doc| doc.field(field).and_then(|v| v.as_str().map(str::to_string)))
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
