// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle management.

use super::{EngineState, IndexingEngine};
use crate::error::IndexingError;
use tracing::{error, info, warn};

impl IndexingEngine {
    /// Start the coordination strategy. Outbox agents are spawned here.
    ///
    /// A failed start leaves the engine `Created`; it can be retried.
    #[tracing::instrument(skip_all, fields(strategy = self.strategy.name()))]
    pub async fn start(&self) -> Result<(), IndexingError> {
        let started = std::time::Instant::now();
        if self.state() != EngineState::Created {
            return Err(IndexingError::InvalidState(format!(
                "cannot start an engine that is {}",
                self.state()
            )));
        }
        self.set_state(EngineState::Starting);

        if let Err(e) = self.strategy.start().await {
            error!(error = %e, "Indexing engine failed to start");
            self.set_state(EngineState::Created);
            return Err(e);
        }

        self.set_state(EngineState::Running);
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            indexed_types = self.context.descriptors().count(),
            "Indexing engine running"
        );
        Ok(())
    }

    /// Stop agents, drain queued works, reject new ones. Idempotent.
    pub async fn shutdown(&self) {
        match self.state() {
            EngineState::ShuttingDown | EngineState::Stopped => return,
            EngineState::Created => {
                warn!("Shutting down an engine that never started");
            }
            EngineState::Starting | EngineState::Running => {}
        }
        let started = std::time::Instant::now();
        info!("Initiating indexing engine shutdown...");
        self.set_state(EngineState::ShuttingDown);

        self.strategy.stop().await;
        self.serial.stop().await;
        self.parallel.stop().await;

        self.set_state(EngineState::Stopped);
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Indexing engine shutdown complete"
        );
    }
}
