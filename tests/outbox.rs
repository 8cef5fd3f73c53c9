//! Outbox coordination: durability, claiming, retries and agent sharding.
//!
//! Engine-level tests run the real agent tasks. Processor-level tests drive
//! [`OutboxEventProcessor`] by hand (`pulse`, `poll_once`) so that timing is
//! deterministic.
//!
//! Run with: `cargo test --test outbox`

mod common;

use common::{book, eventually, model, outbox_config, publisher, r, Harness};
use index_sync::orchestration::{OrchestratorConfig, WorkOrchestrator};
use index_sync::outbox::{
    entity_id_hash, AgentState, AgentType, EventStatus, OutboxEvent, OutboxEventProcessor, ShardAssignment,
    ShardingMode,
};
use index_sync::storage::{AgentRepository, InMemoryIndexBackend, InMemoryOutboxStore, OutboxStore, SqlOutboxStore};
use index_sync::{EntityChangeEvent, EntityState, IndexSyncConfig, IndexingEngine, IndexingPlan};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(3);

fn processor(
    name: &str,
    h: &Harness,
    outbox: &Arc<InMemoryOutboxStore>,
    config: IndexSyncConfig,
    mode: ShardingMode,
) -> OutboxEventProcessor {
    processor_on(name, h, h.backend.clone(), outbox, config, mode)
}

/// Like [`processor`], writing to its own backend.
fn processor_on(
    name: &str,
    h: &Harness,
    backend: Arc<InMemoryIndexBackend>,
    outbox: &Arc<InMemoryOutboxStore>,
    config: IndexSyncConfig,
    mode: ShardingMode,
) -> OutboxEventProcessor {
    let orchestrator = WorkOrchestrator::serial(name, backend, OrchestratorConfig::from_config(&config));
    OutboxEventProcessor::new(
        name,
        h.context(),
        outbox.clone(),
        outbox.clone(),
        orchestrator,
        config,
        mode,
    )
}

/// Record `states` as additions and store their events, as a committed
/// transaction would.
async fn write_events(h: &Harness, outbox: &dyn OutboxStore, states: &[EntityState]) -> Vec<OutboxEvent> {
    let mut plan = IndexingPlan::new(h.context());
    for state in states {
        plan.add(state.clone());
    }
    plan.process().await;
    let events = plan.to_events(1024).unwrap();
    outbox.insert(&events).await.unwrap();
    events
}

fn shelf(h: &Harness, count: usize) -> Vec<EntityState> {
    (0..count)
        .map(|i| {
            let state = book(&format!("s{i:03}"), "Shelved", "a");
            h.store.put(state.clone());
            state
        })
        .collect()
}

async fn sqlite_store(dir: &TempDir) -> Arc<SqlOutboxStore> {
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("outbox.db").display());
    Arc::new(SqlOutboxStore::new(&url).await.unwrap())
}

// =============================================================================
// Durability through the engine
// =============================================================================

#[tokio::test]
async fn durability_committed_events_reach_the_index() {
    let h = Harness::new();
    h.seed_catalogue();
    let outbox = Arc::new(InMemoryOutboxStore::new());
    let engine = h.outbox_engine(outbox.clone());
    engine.start().await.unwrap();

    let mut session = engine.session().unwrap();
    session.apply(EntityChangeEvent::insert(book("1", "The Dispossessed", "a"))).unwrap();
    let mut tx = outbox.begin();
    session.before_commit(&mut tx).await.unwrap();
    tx.commit();
    let report = session.after_commit().await.unwrap();
    assert!(report.is_success());

    assert!(eventually(WAIT, || async { h.backend.document("books", "1").is_some() }).await);
    assert!(eventually(WAIT, || async { outbox.events().is_empty() }).await);
    assert_eq!(h.field("1", "author").as_deref(), Some("Le Guin"));

    engine.shutdown().await;
}

#[tokio::test]
async fn durability_cascade_is_resolved_before_commit() {
    let h = Harness::new();
    h.seed_catalogue();
    let outbox = Arc::new(InMemoryOutboxStore::new());
    let engine = h.outbox_engine(outbox.clone());
    engine.start().await.unwrap();

    let renamed = publisher("p", "Gollancz", &["a"]);
    h.store.put(renamed.clone());
    let mut session = engine.session().unwrap();
    session.apply(EntityChangeEvent::update(renamed, ["name"])).unwrap();
    let mut tx = outbox.begin();
    session.before_commit(&mut tx).await.unwrap();
    tx.commit();
    session.after_commit().await.unwrap();

    assert!(
        eventually(WAIT, || async {
            h.field("1", "publisher").as_deref() == Some("Gollancz")
                && h.field("2", "publisher").as_deref() == Some("Gollancz")
        })
        .await
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn durability_rolled_back_transaction_leaves_nothing() {
    let h = Harness::new();
    h.seed_catalogue();
    let outbox = Arc::new(InMemoryOutboxStore::new());
    let engine = h.outbox_engine(outbox.clone());
    engine.start().await.unwrap();

    let mut session = engine.session().unwrap();
    session.apply(EntityChangeEvent::insert(book("1", "The Dispossessed", "a"))).unwrap();
    let mut tx = outbox.begin();
    session.before_commit(&mut tx).await.unwrap();
    tx.rollback();
    session.rollback();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(outbox.events().is_empty());
    assert!(h.backend.document("books", "1").is_none());
    engine.shutdown().await;
}

#[tokio::test]
async fn durability_sqlite_transaction() {
    let h = Harness::new();
    h.seed_catalogue();
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir).await;
    let engine = IndexingEngine::builder(model())
        .config(outbox_config())
        .entity_provider(h.store.clone())
        .backend(h.backend.clone())
        .failure_handler(h.failures.clone())
        .outbox(store.clone())
        .build()
        .unwrap();
    engine.start().await.unwrap();

    // Rolled back: no row survives.
    let mut session = engine.session().unwrap();
    session.apply(EntityChangeEvent::insert(book("2", "The Lathe of Heaven", "a"))).unwrap();
    let mut tx = store.begin().await.unwrap();
    session.before_commit(&mut tx).await.unwrap();
    tx.rollback().await.unwrap();
    session.rollback();
    assert_eq!(store.count(None).await.unwrap(), 0);

    // Committed: the agent picks it up.
    session.apply(EntityChangeEvent::insert(book("1", "The Dispossessed", "a"))).unwrap();
    let mut tx = store.begin().await.unwrap();
    session.before_commit(&mut tx).await.unwrap();
    tx.commit().await.unwrap();
    session.after_commit().await.unwrap();

    assert!(eventually(WAIT, || async { h.backend.document("books", "1").is_some() }).await);
    assert!(eventually(WAIT, || async { store.count(None).await.unwrap() == 0 }).await);
    assert!(h.backend.document("books", "2").is_none());

    let health = engine.health_check().await;
    assert_eq!(health.strategy, "outbox-polling");
    assert_eq!(health.pending_events, Some(0));
    engine.shutdown().await;
}

#[tokio::test]
async fn durability_pulsar_node_writes_but_never_processes() {
    let h = Harness::new();
    h.seed_catalogue();
    let outbox = Arc::new(InMemoryOutboxStore::new());
    let engine = IndexingEngine::builder(model())
        .config(IndexSyncConfig {
            event_processing_enabled: false,
            ..outbox_config()
        })
        .entity_provider(h.store.clone())
        .backend(h.backend.clone())
        .outbox(outbox.clone())
        .build()
        .unwrap();
    engine.start().await.unwrap();

    let mut session = engine.session().unwrap();
    session.apply(EntityChangeEvent::insert(book("1", "The Dispossessed", "a"))).unwrap();
    let mut tx = outbox.begin();
    session.before_commit(&mut tx).await.unwrap();
    tx.commit();
    session.after_commit().await.unwrap();

    assert!(eventually(WAIT, || async { !outbox.list_agents().await.unwrap().is_empty() }).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let agents = outbox.list_agents().await.unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].agent_type, AgentType::Pulsar);
    assert!(agents[0].assignment().is_none());
    assert_eq!(outbox.count(Some(EventStatus::Pending)).await.unwrap(), 1);
    assert!(h.backend.document("books", "1").is_none());

    engine.shutdown().await;
}

// =============================================================================
// Claiming
// =============================================================================

async fn race_for_one_event(store: Arc<dyn OutboxStore>) {
    let event = OutboxEvent::new(&r("Book", "1"), vec![1, 2, 3], 0);
    store.insert(std::slice::from_ref(&event)).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = Arc::clone(&store);
        let event = event.clone();
        handles.push(tokio::spawn(async move {
            store.claim(&event, &format!("agent-{i}")).await.unwrap()
        }));
    }
    let mut wins = 0;
    for handle in handles {
        if handle.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);
    assert!(store
        .find_pending(ShardAssignment::single().range(), i64::MAX, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn claim_race_memory_has_one_winner() {
    race_for_one_event(Arc::new(InMemoryOutboxStore::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn claim_race_sqlite_has_one_winner() {
    let dir = TempDir::new().unwrap();
    race_for_one_event(sqlite_store(&dir).await).await;
}

// =============================================================================
// Leases
// =============================================================================

fn short_lease() -> IndexSyncConfig {
    IndexSyncConfig {
        agent_pulse_interval_ms: 10,
        agent_pulse_expiration_ms: 50,
        ..outbox_config()
    }
}

#[tokio::test]
async fn lease_is_renewed_while_a_batch_is_stuck() {
    let h = Harness::new();
    h.seed_catalogue();
    let outbox = Arc::new(InMemoryOutboxStore::new());
    let slow = Arc::new(InMemoryIndexBackend::new());
    let mut a = processor_on("a", &h, slow.clone(), &outbox, short_lease(), ShardingMode::Dynamic);
    let mut b = processor("b", &h, &outbox, short_lease(), ShardingMode::Dynamic);
    assert_eq!(a.pulse().await, AgentState::Running);
    write_events(&h, outbox.as_ref(), &[book("1", "The Dispossessed", "a")]).await;

    let pause = slow.pause();
    let stuck = tokio::spawn(async move {
        let claimed = a.poll_once().await.unwrap();
        (a, claimed)
    });
    slow.wait_for_execute_calls(1).await;

    // Well past the expiration A had when it claimed.
    tokio::time::sleep(Duration::from_millis(120)).await;
    b.pulse().await;
    assert_eq!(outbox.list_agents().await.unwrap().len(), 2);
    assert_eq!(b.poll_once().await.unwrap(), 0);

    drop(pause);
    let (a, claimed) = stuck.await.unwrap();
    assert_eq!(claimed, 1);
    assert!(a.is_running());
    assert_eq!(slow.applied().len(), 1);
    assert!(h.backend.applied().is_empty());
    assert!(outbox.events().is_empty());
}

#[tokio::test]
async fn lease_lost_mid_batch_leaves_the_event_to_its_new_owner() {
    let h = Harness::new();
    h.seed_catalogue();
    let outbox = Arc::new(InMemoryOutboxStore::new());
    let slow = Arc::new(InMemoryIndexBackend::new());
    let mut a = processor_on("a", &h, slow.clone(), &outbox, short_lease(), ShardingMode::Dynamic);
    let mut b = processor("b", &h, &outbox, short_lease(), ShardingMode::Dynamic);
    assert_eq!(a.pulse().await, AgentState::Running);
    let a_id = a.agent_id().unwrap().to_string();
    write_events(&h, outbox.as_ref(), &[book("1", "The Dispossessed", "a")]).await;

    let pause = slow.pause();
    let stuck = tokio::spawn(async move {
        let claimed = a.poll_once().await.unwrap();
        (a, claimed)
    });
    slow.wait_for_execute_calls(1).await;

    // A is declared dead and B picks the event up.
    outbox.delete_agents(&[a_id]).await.unwrap();
    assert_eq!(outbox.release_claims().await.unwrap(), 1);
    assert_eq!(b.pulse().await, AgentState::Running);
    let pending = outbox
        .find_pending(ShardAssignment::single().range(), i64::MAX, 10)
        .await
        .unwrap();
    assert!(outbox.claim(&pending[0], b.agent_id().unwrap()).await.unwrap());

    // Give A a renewal attempt before its batch finishes.
    tokio::time::sleep(Duration::from_millis(30)).await;
    drop(pause);
    let (a, _) = stuck.await.unwrap();
    assert!(!a.is_running());
    assert_eq!(a.lease_expires_at(), None);

    let events = outbox.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, EventStatus::Processing);
    assert_eq!(events[0].processor_id.as_deref(), b.agent_id());
}

#[tokio::test]
async fn lease_about_to_lapse_skips_polling_until_the_next_pulse() {
    let h = Harness::new();
    h.seed_catalogue();
    let outbox = Arc::new(InMemoryOutboxStore::new());
    let mut a = processor("a", &h, &outbox, short_lease(), ShardingMode::Dynamic);
    assert_eq!(a.pulse().await, AgentState::Running);
    write_events(&h, outbox.as_ref(), &[book("1", "The Dispossessed", "a")]).await;

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(a.poll_once().await.unwrap(), 0);
    assert_eq!(outbox.count(Some(EventStatus::Pending)).await.unwrap(), 1);

    a.pulse().await;
    assert_eq!(a.poll_once().await.unwrap(), 1);
    assert!(h.backend.document("books", "1").is_some());
}

// =============================================================================
// Retries
// =============================================================================

#[tokio::test]
async fn retry_ceiling_marks_event_failed_then_operator_requeues() {
    let h = Harness::new();
    h.seed_catalogue();
    let outbox = Arc::new(InMemoryOutboxStore::new());
    let config = IndexSyncConfig {
        outbox_max_retries: 2,
        ..outbox_config()
    };
    let mut agent = processor("solo", &h, &outbox, config, ShardingMode::Dynamic);
    assert_eq!(agent.pulse().await, AgentState::Running);

    let events = write_events(&h, outbox.as_ref(), &[book("1", "The Dispossessed", "a")]).await;
    h.backend.fail_document("1");

    for _ in 0..3 {
        assert_eq!(agent.poll_once().await.unwrap(), 1);
    }
    assert_eq!(agent.poll_once().await.unwrap(), 0);
    assert_eq!(outbox.count(Some(EventStatus::Failed)).await.unwrap(), 1);
    let failed = outbox.find_failed(10).await.unwrap();
    assert_eq!(failed[0].retries, 3);

    let reported = h.failures.event_failures();
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].0.id, events[0].id);

    h.backend.clear_failures();
    assert_eq!(outbox.retry_failed(&[events[0].id.clone()]).await.unwrap(), 1);
    assert_eq!(agent.poll_once().await.unwrap(), 1);
    assert!(h.backend.document("books", "1").is_some());
    assert!(outbox.events().is_empty());
}

#[tokio::test]
async fn retry_undecodable_payload_fails_without_touching_siblings() {
    let h = Harness::new();
    h.seed_catalogue();
    let outbox = Arc::new(InMemoryOutboxStore::new());
    let config = IndexSyncConfig {
        outbox_max_retries: 0,
        ..outbox_config()
    };
    let mut agent = processor("solo", &h, &outbox, config, ShardingMode::Dynamic);
    agent.pulse().await;

    let garbage = OutboxEvent::new(&r("Book", "9"), vec![0xff, 0x00, 0x13], 0);
    outbox.insert(&[garbage]).await.unwrap();
    write_events(&h, outbox.as_ref(), &[book("2", "The Lathe of Heaven", "a")]).await;

    assert_eq!(agent.poll_once().await.unwrap(), 2);
    assert!(h.backend.document("books", "2").is_some());
    assert_eq!(outbox.count(Some(EventStatus::Failed)).await.unwrap(), 1);
    assert_eq!(h.failures.event_failures()[0].0.entity_id, "9");
}

#[tokio::test]
async fn retry_failed_events_through_the_engine() {
    let h = Harness::new();
    h.seed_catalogue();
    let outbox = Arc::new(InMemoryOutboxStore::new());
    let engine = IndexingEngine::builder(model())
        .config(IndexSyncConfig {
            outbox_max_retries: 1,
            ..outbox_config()
        })
        .entity_provider(h.store.clone())
        .backend(h.backend.clone())
        .failure_handler(h.failures.clone())
        .outbox(outbox.clone())
        .build()
        .unwrap();
    engine.start().await.unwrap();
    h.backend.fail_document("1");

    let mut session = engine.session().unwrap();
    session.apply(EntityChangeEvent::insert(book("1", "The Dispossessed", "a"))).unwrap();
    let mut tx = outbox.begin();
    session.before_commit(&mut tx).await.unwrap();
    tx.commit();
    session.after_commit().await.unwrap();

    assert!(eventually(WAIT, || async { engine.failed_events(10).await.unwrap().len() == 1 }).await);
    assert_eq!(engine.health_check().await.failed_events, Some(1));

    h.backend.clear_failures();
    let ids: Vec<String> = engine.failed_events(10).await.unwrap().into_iter().map(|e| e.id).collect();
    assert_eq!(engine.retry_failed_events(&ids).await.unwrap(), 1);
    assert!(eventually(WAIT, || async { h.backend.document("books", "1").is_some() }).await);

    engine.shutdown().await;
}

#[tokio::test]
async fn retry_operator_api_needs_outbox_coordination() {
    let h = Harness::new();
    let engine = h.engine(common::test_config());
    engine.start().await.unwrap();
    assert!(engine.failed_events(10).await.is_err());
}

// =============================================================================
// Sharding
// =============================================================================

#[tokio::test]
async fn sharding_two_agents_converge_and_split_the_work() {
    let h = Harness::new();
    h.seed_catalogue();
    let outbox = Arc::new(InMemoryOutboxStore::new());
    let mut a = processor("a", &h, &outbox, outbox_config(), ShardingMode::Dynamic);
    let mut b = processor("b", &h, &outbox, outbox_config(), ShardingMode::Dynamic);

    assert_eq!(a.pulse().await, AgentState::Running);
    // B joins: two agents now, A still holds 0/1.
    assert_eq!(b.pulse().await, AgentState::Suspended);
    assert_eq!(a.pulse().await, AgentState::Running);
    assert_eq!(b.pulse().await, AgentState::Running);

    let (sa, sb) = (a.assignment().unwrap(), b.assignment().unwrap());
    assert_eq!((sa.total, sb.total), (2, 2));
    let mut indices = vec![sa.index, sb.index];
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1]);

    let books = shelf(&h, 20);
    write_events(&h, outbox.as_ref(), &books).await;
    let processed = a.poll_once().await.unwrap() + b.poll_once().await.unwrap();
    assert_eq!(processed, 20);
    assert_eq!(h.backend.document_count("books"), 20);
    assert!(outbox.events().is_empty());
}

#[tokio::test]
async fn sharding_crashed_agent_expires_and_its_claims_are_released() {
    let h = Harness::new();
    h.seed_catalogue();
    let outbox = Arc::new(InMemoryOutboxStore::new());
    let config = IndexSyncConfig {
        agent_pulse_interval_ms: 20,
        agent_pulse_expiration_ms: 80,
        ..outbox_config()
    };
    let mut a = processor("a", &h, &outbox, config.clone(), ShardingMode::Dynamic);
    let mut b = processor("b", &h, &outbox, config, ShardingMode::Dynamic);
    a.pulse().await;
    b.pulse().await;
    a.pulse().await;
    assert_eq!(b.pulse().await, AgentState::Running);

    // B claims an event and dies before finishing it.
    let events = write_events(&h, outbox.as_ref(), &[book("1", "The Dispossessed", "a")]).await;
    assert!(outbox.claim(&events[0], b.agent_id().unwrap()).await.unwrap());
    drop(b);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(a.pulse().await, AgentState::Running);
    assert_eq!(a.assignment(), ShardAssignment::new(0, 1));
    assert_eq!(outbox.list_agents().await.unwrap().len(), 1);

    assert_eq!(a.poll_once().await.unwrap(), 1);
    assert!(h.backend.document("books", "1").is_some());
}

#[tokio::test]
async fn sharding_static_assignments_partition_the_hash_space() {
    let h = Harness::new();
    h.seed_catalogue();
    let outbox = Arc::new(InMemoryOutboxStore::new());
    let first = ShardAssignment::new(0, 2).unwrap();
    let second = ShardAssignment::new(1, 2).unwrap();
    let mut a = processor("a", &h, &outbox, outbox_config(), ShardingMode::Static(first));
    let mut b = processor("b", &h, &outbox, outbox_config(), ShardingMode::Static(second));

    // No negotiation: both run right away.
    assert_eq!(a.pulse().await, AgentState::Running);
    assert_eq!(b.pulse().await, AgentState::Running);

    let books = shelf(&h, 30);
    let expected_a = books
        .iter()
        .filter(|s| first.range().contains(entity_id_hash(&s.reference)))
        .count();
    write_events(&h, outbox.as_ref(), &books).await;

    assert_eq!(a.poll_once().await.unwrap(), expected_a);
    assert_eq!(b.poll_once().await.unwrap(), 30 - expected_a);
    assert_eq!(h.backend.document_count("books"), 30);
}

#[tokio::test]
async fn sharding_unreachable_agent_table_suspends_processing() {
    let h = Harness::new();
    h.seed_catalogue();
    let outbox = Arc::new(InMemoryOutboxStore::new());
    let mut agent = processor("solo", &h, &outbox, outbox_config(), ShardingMode::Dynamic);
    assert_eq!(agent.pulse().await, AgentState::Running);

    write_events(&h, outbox.as_ref(), &[book("1", "The Dispossessed", "a")]).await;
    outbox.set_agents_unavailable(true);
    assert_eq!(agent.pulse().await, AgentState::Suspended);
    assert_eq!(agent.poll_once().await.unwrap(), 0);

    outbox.set_agents_unavailable(false);
    assert_eq!(agent.pulse().await, AgentState::Running);
    assert_eq!(agent.poll_once().await.unwrap(), 1);
    assert!(h.backend.document("books", "1").is_some());
}
