//! Public types for the indexing engine.

use crate::backpressure::BackpressureLevel;

/// Engine lifecycle state.
///
/// Use [`super::IndexingEngine::state()`] to check the current state or
/// [`super::IndexingEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built, mapping bootstrapped, nothing running
    Created,
    /// Starting the coordination strategy (outbox agents)
    Starting,
    /// Accepting sessions and mass indexing
    Running,
    /// Stopping agents and draining orchestrator queues
    ShuttingDown,
    /// Terminal
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Snapshot of engine health, suitable for `/ready` and `/health` endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Coordination strategy name
    pub strategy: &'static str,
    /// Work sets queued in the serial orchestrator
    pub serial_queue_depth: usize,
    /// Work sets queued in the mass indexing orchestrator
    pub parallel_queue_depth: usize,
    /// Worst level of the two orchestrators
    pub backpressure_level: BackpressureLevel,
    /// PENDING outbox events (`None` without outbox coordination or when the
    /// table could not be read)
    pub pending_events: Option<u64>,
    /// FAILED outbox events waiting for an operator
    pub failed_events: Option<u64>,
    /// Running, below critical backpressure, outbox table reachable
    pub healthy: bool,
}
