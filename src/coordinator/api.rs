// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sessions, mass indexing and outbox operations.

use super::IndexingEngine;
use crate::error::IndexingError;
use crate::mass_indexing::MassIndexer;
use crate::outbox::{OutboxEvent, OutboxPollingStrategy};
use crate::strategy::IndexingSession;
use std::sync::Arc;

impl IndexingEngine {
    /// Open a session using the configured synchronization strategy.
    pub fn session(&self) -> Result<IndexingSession, IndexingError> {
        self.require_running("open a session")?;
        Ok(IndexingSession::new(
            Arc::clone(&self.context),
            Arc::clone(&self.strategy),
            self.config.synchronization,
        ))
    }

    /// A mass indexer over the parallel orchestrator. Selects all indexed
    /// types unless restricted.
    pub fn mass_indexer(&self) -> Result<MassIndexer, IndexingError> {
        self.require_running("mass index")?;
        Ok(MassIndexer::new(
            Arc::clone(&self.context),
            self.parallel.clone(),
            self.config.mass_indexing_batch_size,
        ))
    }

    /// Commit and refresh `index` once everything queued before is applied.
    pub async fn flush(&self, index: &str) -> Result<(), IndexingError> {
        self.serial.flush(index).await?;
        Ok(())
    }

    /// Outbox events that reached the retry ceiling.
    pub async fn failed_events(&self, limit: usize) -> Result<Vec<OutboxEvent>, IndexingError> {
        let outbox = self.require_outbox()?;
        Ok(outbox.failed_events(limit).await?)
    }

    /// Requeue failed outbox events with their retry count reset.
    pub async fn retry_failed_events(&self, ids: &[String]) -> Result<u64, IndexingError> {
        let outbox = self.require_outbox()?;
        Ok(outbox.retry_failed(ids).await?)
    }

    fn require_outbox(&self) -> Result<&OutboxPollingStrategy, IndexingError> {
        self.outbox.as_deref().ok_or_else(|| {
            IndexingError::InvalidState("outbox operations need outbox-polling coordination".to_string())
        })
    }
}
