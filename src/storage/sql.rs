// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL outbox and agent tables.
//!
//! ```sql
//! CREATE TABLE index_outbox_events (
//!   id VARCHAR(36) PRIMARY KEY,      -- UUID v7, time-ordered
//!   entity_name VARCHAR(255) NOT NULL,
//!   entity_id VARCHAR(255) NOT NULL,
//!   tenant VARCHAR(255),
//!   entity_id_hash BIGINT NOT NULL,  -- [0, 2^31)
//!   payload MEDIUMBLOB NOT NULL,
//!   status VARCHAR(16) NOT NULL,     -- PENDING / PROCESSING / FAILED
//!   retries INT NOT NULL,
//!   process_after BIGINT NOT NULL,   -- epoch millis
//!   processor_id VARCHAR(36),
//!   version BIGINT NOT NULL,         -- optimistic lock
//!   created_at BIGINT NOT NULL
//! )
//!
//! CREATE TABLE index_agents (
//!   id VARCHAR(36) PRIMARY KEY,
//!   name VARCHAR(255) NOT NULL,
//!   agent_type VARCHAR(32) NOT NULL, -- EVENT_PROCESSING / PULSAR
//!   state VARCHAR(16) NOT NULL,      -- RUNNING / SUSPENDED
//!   total_shard_count INT,
//!   assigned_shard_index INT,
//!   registered_at BIGINT NOT NULL,
//!   expiration BIGINT NOT NULL,
//!   version BIGINT NOT NULL
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! MySQL VARCHAR/TEXT columns may come back as bytes through the `Any`
//! driver, so text columns are read as `String` first and `Vec<u8>` second.

use super::traits::{AgentRepository, OutboxSink, OutboxStore, StorageError};
use crate::outbox::{AgentRecord, AgentState, AgentType, EventStatus, OutboxEvent, ShardRange};
use crate::resilience::retry::{retry, RetryConfig};
use async_trait::async_trait;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Row};
use std::sync::Once;
use std::time::Duration;
use tracing::info;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const EVENT_COLUMNS: &str = "id, entity_name, entity_id, tenant, entity_id_hash, payload, status, retries, \
                             process_after, processor_id, version, created_at";

const AGENT_COLUMNS: &str =
    "id, name, agent_type, state, total_shard_count, assigned_shard_index, registered_at, expiration, version";

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn insert_event_query(event: &OutboxEvent) -> Query<'static, Any, AnyArguments<'static>> {
    static SQL: std::sync::OnceLock<String> = std::sync::OnceLock::new();
    let sql = SQL.get_or_init(|| {
        format!(
            "INSERT INTO index_outbox_events ({EVENT_COLUMNS}) VALUES ({})",
            placeholders(12)
        )
    });
    sqlx::query(sql.as_str())
        .bind(event.id.clone())
        .bind(event.entity_name.clone())
        .bind(event.entity_id.clone())
        .bind(event.tenant.clone())
        .bind(event.entity_id_hash)
        .bind(event.payload.clone())
        .bind(event.status.as_str())
        .bind(event.retries)
        .bind(event.process_after)
        .bind(event.processor_id.clone())
        .bind(event.version)
        .bind(event.created_at)
}

/// Read a text column, tolerating drivers that return it as bytes.
fn text(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(column)
        .ok()
        .flatten()
        .or_else(|| {
            row.try_get::<Option<Vec<u8>>, _>(column)
                .ok()
                .flatten()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
}

fn required_text(row: &AnyRow, column: &str) -> Result<String, StorageError> {
    text(row, column).ok_or_else(|| StorageError::Serialization(format!("column '{column}' is missing")))
}

fn integer(row: &AnyRow, column: &str) -> Result<i64, StorageError> {
    row.try_get::<i64, _>(column)
        .map_err(|e| StorageError::Serialization(format!("column '{column}': {e}")))
}

fn event_from_row(row: &AnyRow) -> Result<OutboxEvent, StorageError> {
    let status = required_text(row, "status")?;
    Ok(OutboxEvent {
        id: required_text(row, "id")?,
        entity_name: required_text(row, "entity_name")?,
        entity_id: required_text(row, "entity_id")?,
        tenant: text(row, "tenant"),
        entity_id_hash: integer(row, "entity_id_hash")?,
        payload: row
            .try_get::<Vec<u8>, _>("payload")
            .map_err(|e| StorageError::Serialization(format!("column 'payload': {e}")))?,
        status: EventStatus::parse(&status)
            .ok_or_else(|| StorageError::Serialization(format!("unknown event status '{status}'")))?,
        retries: integer(row, "retries")?,
        process_after: integer(row, "process_after")?,
        processor_id: text(row, "processor_id"),
        version: integer(row, "version")?,
        created_at: integer(row, "created_at")?,
    })
}

fn agent_from_row(row: &AnyRow) -> Result<AgentRecord, StorageError> {
    let agent_type = required_text(row, "agent_type")?;
    let state = required_text(row, "state")?;
    Ok(AgentRecord {
        id: required_text(row, "id")?,
        name: required_text(row, "name")?,
        agent_type: AgentType::parse(&agent_type)
            .ok_or_else(|| StorageError::Serialization(format!("unknown agent type '{agent_type}'")))?,
        state: AgentState::parse(&state)
            .ok_or_else(|| StorageError::Serialization(format!("unknown agent state '{state}'")))?,
        total_shard_count: row.try_get::<Option<i64>, _>("total_shard_count").ok().flatten(),
        assigned_shard_index: row.try_get::<Option<i64>, _>("assigned_shard_index").ok().flatten(),
        registered_at: integer(row, "registered_at")?,
        expiration: integer(row, "expiration")?,
        version: integer(row, "version")?,
    })
}

/// Outbox events and agent membership in SQLite or MySQL.
pub struct SqlOutboxStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlOutboxStore {
    /// Connect with startup-mode retry (fails fast if config is wrong) and
    /// create the tables if needed.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 5 } else { 20 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(backend)
        })
        .await?;

        let store = Self { pool, is_sqlite };
        if is_sqlite {
            store.enable_wal_mode().await?;
        }
        store.init_schema().await?;
        info!(sqlite = is_sqlite, "Outbox store ready");
        Ok(store)
    }

    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    /// Open a transaction. Domain writes and outbox events written through
    /// it commit or roll back together.
    pub async fn begin(&self) -> Result<sqlx::Transaction<'static, Any>, StorageError> {
        self.pool.begin().await.map_err(backend)
    }

    /// WAL lets agents read while sessions write.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS index_outbox_events (
                    id TEXT PRIMARY KEY,
                    entity_name TEXT NOT NULL,
                    entity_id TEXT NOT NULL,
                    tenant TEXT,
                    entity_id_hash INTEGER NOT NULL,
                    payload BLOB NOT NULL,
                    status TEXT NOT NULL,
                    retries INTEGER NOT NULL DEFAULT 0,
                    process_after INTEGER NOT NULL,
                    processor_id TEXT,
                    version INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_outbox_pending \
                 ON index_outbox_events (status, process_after, entity_id_hash)",
                r#"
                CREATE TABLE IF NOT EXISTS index_agents (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    agent_type TEXT NOT NULL,
                    state TEXT NOT NULL,
                    total_shard_count INTEGER,
                    assigned_shard_index INTEGER,
                    registered_at INTEGER NOT NULL,
                    expiration INTEGER NOT NULL,
                    version INTEGER NOT NULL DEFAULT 0
                )
                "#,
            ]
        } else {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS index_outbox_events (
                    id VARCHAR(36) PRIMARY KEY,
                    entity_name VARCHAR(255) NOT NULL,
                    entity_id VARCHAR(255) NOT NULL,
                    tenant VARCHAR(255),
                    entity_id_hash BIGINT NOT NULL,
                    payload MEDIUMBLOB NOT NULL,
                    status VARCHAR(16) NOT NULL,
                    retries INT NOT NULL DEFAULT 0,
                    process_after BIGINT NOT NULL,
                    processor_id VARCHAR(36),
                    version BIGINT NOT NULL DEFAULT 0,
                    created_at BIGINT NOT NULL,
                    INDEX idx_outbox_pending (status, process_after, entity_id_hash),
                    INDEX idx_outbox_created (created_at)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS index_agents (
                    id VARCHAR(36) PRIMARY KEY,
                    name VARCHAR(255) NOT NULL,
                    agent_type VARCHAR(32) NOT NULL,
                    state VARCHAR(16) NOT NULL,
                    total_shard_count INT,
                    assigned_shard_index INT,
                    registered_at BIGINT NOT NULL,
                    expiration BIGINT NOT NULL,
                    version BIGINT NOT NULL DEFAULT 0
                )
                "#,
            ]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(backend)
            })
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxSink for sqlx::Transaction<'_, Any> {
    async fn persist(&mut self, events: &[OutboxEvent]) -> Result<(), StorageError> {
        for event in events {
            insert_event_query(event).execute(&mut **self).await.map_err(backend)?;
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for SqlOutboxStore {
    async fn insert(&self, events: &[OutboxEvent]) -> Result<(), StorageError> {
        let mut tx = self.begin().await?;
        tx.persist(events).await?;
        tx.commit().await.map_err(backend)
    }

    async fn find_pending(&self, range: ShardRange, now_ms: i64, limit: usize) -> Result<Vec<OutboxEvent>, StorageError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM index_outbox_events \
             WHERE status = 'PENDING' AND process_after <= ? AND entity_id_hash >= ? AND entity_id_hash < ? \
             ORDER BY created_at, id LIMIT ?"
        );
        retry("sql_find_pending", &RetryConfig::query(), || async {
            let rows = sqlx::query(&sql)
                .bind(now_ms)
                .bind(range.start)
                .bind(range.end)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;
            rows.iter().map(event_from_row).collect()
        })
        .await
    }

    async fn claim(&self, event: &OutboxEvent, processor_id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE index_outbox_events SET status = 'PROCESSING', processor_id = ?, version = version + 1 \
             WHERE id = ? AND version = ? AND status = 'PENDING'",
        )
        .bind(processor_id)
        .bind(event.id.as_str())
        .bind(event.version)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, processor_id: &str, ids: &[String]) -> Result<u64, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM index_outbox_events WHERE status = 'PROCESSING' AND processor_id = ? AND id IN ({})",
            placeholders(ids.len())
        );

        retry("sql_delete_events", &RetryConfig::query(), || {
            let sql = sql.clone();
            let ids = ids.to_vec();
            async move {
                let mut query = sqlx::query(&sql).bind(processor_id);
                for id in &ids {
                    query = query.bind(id.as_str());
                }
                let result = query.execute(&self.pool).await.map_err(backend)?;
                Ok(result.rows_affected())
            }
        })
        .await
    }

    async fn reschedule(
        &self,
        processor_id: &str,
        id: &str,
        retries: i64,
        process_after: i64,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE index_outbox_events SET status = 'PENDING', retries = ?, process_after = ?, \
             processor_id = NULL, version = version + 1 \
             WHERE id = ? AND status = 'PROCESSING' AND processor_id = ?",
        )
        .bind(retries)
        .bind(process_after)
        .bind(id)
        .bind(processor_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(&self, processor_id: &str, id: &str, retries: i64) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE index_outbox_events SET status = 'FAILED', retries = ?, processor_id = NULL, \
             version = version + 1 WHERE id = ? AND status = 'PROCESSING' AND processor_id = ?",
        )
        .bind(retries)
        .bind(id)
        .bind(processor_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_claims(&self) -> Result<u64, StorageError> {
        let result = sqlx::query(
            "UPDATE index_outbox_events SET status = 'PENDING', processor_id = NULL, version = version + 1 \
             WHERE status = 'PROCESSING' \
             AND (processor_id IS NULL OR processor_id NOT IN (SELECT id FROM index_agents))",
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn count(&self, status: Option<EventStatus>) -> Result<u64, StorageError> {
        let row = match status {
            Some(status) => {
                sqlx::query("SELECT COUNT(*) AS n FROM index_outbox_events WHERE status = ?")
                    .bind(status.as_str())
                    .fetch_one(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT COUNT(*) AS n FROM index_outbox_events")
                    .fetch_one(&self.pool)
                    .await
            }
        }
        .map_err(backend)?;
        Ok(integer(&row, "n")?.max(0) as u64)
    }

    async fn find_failed(&self, limit: usize) -> Result<Vec<OutboxEvent>, StorageError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM index_outbox_events WHERE status = 'FAILED' ORDER BY created_at, id LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn retry_failed(&self, ids: &[String]) -> Result<u64, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE index_outbox_events SET status = 'PENDING', retries = 0, process_after = 0, \
             processor_id = NULL, version = version + 1 WHERE status = 'FAILED' AND id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id.as_str());
        }
        let result = query.execute(&self.pool).await.map_err(backend)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AgentRepository for SqlOutboxStore {
    async fn list_agents(&self) -> Result<Vec<AgentRecord>, StorageError> {
        let sql = format!("SELECT {AGENT_COLUMNS} FROM index_agents ORDER BY registered_at, id");
        retry("sql_list_agents", &RetryConfig::query(), || async {
            let rows = sqlx::query(&sql).fetch_all(&self.pool).await.map_err(backend)?;
            rows.iter().map(agent_from_row).collect()
        })
        .await
    }

    async fn insert_agent(&self, agent: &AgentRecord) -> Result<(), StorageError> {
        let sql = format!("INSERT INTO index_agents ({AGENT_COLUMNS}) VALUES ({})", placeholders(9));
        sqlx::query(&sql)
            .bind(agent.id.as_str())
            .bind(agent.name.as_str())
            .bind(agent.agent_type.as_str())
            .bind(agent.state.as_str())
            .bind(agent.total_shard_count)
            .bind(agent.assigned_shard_index)
            .bind(agent.registered_at)
            .bind(agent.expiration)
            .bind(agent.version)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation()) {
                    StorageError::Conflict(format!("agent {} already registered", agent.id))
                } else {
                    backend(e)
                }
            })?;
        Ok(())
    }

    async fn update_agent(&self, agent: &AgentRecord) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE index_agents SET name = ?, agent_type = ?, state = ?, total_shard_count = ?, \
             assigned_shard_index = ?, expiration = ?, version = version + 1 WHERE id = ? AND version = ?",
        )
        .bind(agent.name.as_str())
        .bind(agent.agent_type.as_str())
        .bind(agent.state.as_str())
        .bind(agent.total_shard_count)
        .bind(agent.assigned_shard_index)
        .bind(agent.expiration)
        .bind(agent.id.as_str())
        .bind(agent.version)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_agents(&self, ids: &[String]) -> Result<u64, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!("DELETE FROM index_agents WHERE id IN ({})", placeholders(ids.len()));
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id.as_str());
        }
        let result = query.execute(&self.pool).await.map_err(backend)?;
        Ok(result.rows_affected())
    }
}
