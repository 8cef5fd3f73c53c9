// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Coordination strategies and indexing sessions.
//!
//! A strategy decides what happens to a plan around the domain transaction:
//! the synchronous strategy applies it right after commit, the outbox-polling
//! strategy (see [`crate::outbox`]) writes it into the transaction as events.

pub mod synchronous;

pub use synchronous::SynchronousStrategy;

use crate::context::MappingContext;
use crate::error::IndexingError;
use crate::model::EntityChangeEvent;
use crate::orchestration::{DocumentCommitStrategy, DocumentRefreshStrategy, WorkOptions};
use crate::plan::{ExecutionReport, IndexingPlan};
use crate::storage::traits::OutboxSink;
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// What `after_commit` waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynchronizationStrategy {
    /// Fire and forget.
    None,
    /// Wait until the works are queued.
    Async,
    /// Wait until the works are committed.
    #[default]
    Sync,
    /// Wait until the works are committed and visible to searches.
    Searchable,
}

impl SynchronizationStrategy {
    pub fn work_options(&self) -> WorkOptions {
        match self {
            Self::None | Self::Async => WorkOptions::default(),
            Self::Sync => WorkOptions::new(DocumentCommitStrategy::Force, DocumentRefreshStrategy::None),
            Self::Searchable => WorkOptions::new(DocumentCommitStrategy::Force, DocumentRefreshStrategy::Force),
        }
    }

    /// Whether failures are returned to the caller rather than handed to the
    /// failure handler.
    pub fn reports_failures(&self) -> bool {
        matches!(self, Self::Sync | Self::Searchable)
    }
}

#[async_trait]
pub trait CoordinationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(&self) -> Result<(), IndexingError>;

    /// Called while the domain transaction is still open.
    async fn before_commit(&self, plan: &mut IndexingPlan, sink: &mut dyn OutboxSink) -> Result<(), IndexingError>;

    /// Called once the domain transaction committed.
    async fn after_commit(
        &self,
        plan: IndexingPlan,
        synchronization: SynchronizationStrategy,
    ) -> Result<ExecutionReport, IndexingError>;

    async fn stop(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    PlanAccumulating,
    Prepared,
    Executing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One unit of work: records changes, then drives the strategy around the
/// domain transaction.
///
/// ```text
/// IDLE -> PLAN_ACCUMULATING -> PREPARED -> EXECUTING -> IDLE
///              \___________________\______ rollback() -> IDLE
/// ```
pub struct IndexingSession {
    context: Arc<MappingContext>,
    strategy: Arc<dyn CoordinationStrategy>,
    synchronization: SynchronizationStrategy,
    plan: Option<IndexingPlan>,
    state: SessionState,
}

impl IndexingSession {
    pub fn new(
        context: Arc<MappingContext>,
        strategy: Arc<dyn CoordinationStrategy>,
        synchronization: SynchronizationStrategy,
    ) -> Self {
        Self {
            context,
            strategy,
            synchronization,
            plan: None,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn synchronization(&self) -> SynchronizationStrategy {
        self.synchronization
    }

    /// Override the engine default for this session.
    pub fn set_synchronization(&mut self, synchronization: SynchronizationStrategy) {
        self.synchronization = synchronization;
    }

    /// The plan to record into. Starts one if the session is idle.
    pub fn plan_mut(&mut self) -> Result<&mut IndexingPlan, IndexingError> {
        match self.state {
            SessionState::Idle | SessionState::PlanAccumulating => {
                self.state = SessionState::PlanAccumulating;
                let context = &self.context;
                Ok(self.plan.get_or_insert_with(|| IndexingPlan::new(Arc::clone(context))))
            }
            other => Err(IndexingError::InvalidState(format!(
                "cannot record changes in a {other} session"
            ))),
        }
    }

    pub fn apply(&mut self, event: EntityChangeEvent) -> Result<(), IndexingError> {
        self.plan_mut()?.apply(event);
        Ok(())
    }

    /// Run the strategy's pre-commit step. `sink` is the open transaction.
    pub async fn before_commit(&mut self, sink: &mut dyn OutboxSink) -> Result<(), IndexingError> {
        match self.state {
            SessionState::Idle => {
                self.state = SessionState::Prepared;
                Ok(())
            }
            SessionState::PlanAccumulating => {
                if let Some(plan) = self.plan.as_mut() {
                    self.strategy.before_commit(plan, sink).await?;
                }
                self.state = SessionState::Prepared;
                Ok(())
            }
            other => Err(IndexingError::InvalidState(format!(
                "before_commit called on a {other} session"
            ))),
        }
    }

    /// Run the strategy's post-commit step. The session is idle afterwards,
    /// whatever the outcome.
    pub async fn after_commit(&mut self) -> Result<ExecutionReport, IndexingError> {
        if self.state != SessionState::Prepared {
            return Err(IndexingError::InvalidState(format!(
                "after_commit called on a {} session",
                self.state
            )));
        }
        let Some(plan) = self.plan.take() else {
            self.state = SessionState::Idle;
            return Ok(ExecutionReport::default());
        };

        self.state = SessionState::Executing;
        debug!(strategy = self.strategy.name(), entries = plan.len(), "Executing session plan");
        let result = self.strategy.after_commit(plan, self.synchronization).await;
        self.state = SessionState::Idle;
        result
    }

    /// Forget everything recorded since the last commit.
    pub fn rollback(&mut self) {
        if let Some(mut plan) = self.plan.take() {
            plan.discard();
        }
        self.state = SessionState::Idle;
    }
}

impl fmt::Debug for IndexingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexingSession")
            .field("strategy", &self.strategy.name())
            .field("state", &self.state)
            .field("synchronization", &self.synchronization)
            .finish()
    }
}
