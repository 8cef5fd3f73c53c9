// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use super::{CoordinationStrategy, SynchronizationStrategy};
use crate::context::MappingContext;
use crate::error::IndexingError;
use crate::failure::FailureHandler;
use crate::orchestration::WorkOrchestrator;
use crate::plan::{ExecutionReport, IndexingPlan, PlanExecution};
use crate::storage::traits::OutboxSink;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Applies plans in the committing process, right after the transaction
/// commits, through the serial orchestrator.
pub struct SynchronousStrategy {
    context: Arc<MappingContext>,
    orchestrator: WorkOrchestrator,
    timeout: Option<Duration>,
}

impl SynchronousStrategy {
    pub fn new(context: Arc<MappingContext>, orchestrator: WorkOrchestrator, timeout: Option<Duration>) -> Self {
        Self {
            context,
            orchestrator,
            timeout,
        }
    }
}

fn forward_failures(handler: &dyn FailureHandler, report: &ExecutionReport) {
    for failure in &report.failures {
        handler.handle_entity_failure(failure);
    }
}

async fn wait(execution: PlanExecution, timeout: Option<Duration>) -> ExecutionReport {
    match timeout {
        Some(timeout) => execution.report_timeout(timeout).await,
        None => execution.report().await,
    }
}

#[async_trait]
impl CoordinationStrategy for SynchronousStrategy {
    fn name(&self) -> &'static str {
        "synchronous"
    }

    async fn start(&self) -> Result<(), IndexingError> {
        info!(orchestrator = self.orchestrator.name(), "Synchronous coordination started");
        Ok(())
    }

    /// Resolve while the transaction can still read consistent state.
    async fn before_commit(&self, plan: &mut IndexingPlan, _sink: &mut dyn OutboxSink) -> Result<(), IndexingError> {
        plan.process().await;
        Ok(())
    }

    async fn after_commit(
        &self,
        plan: IndexingPlan,
        synchronization: SynchronizationStrategy,
    ) -> Result<ExecutionReport, IndexingError> {
        let options = synchronization.work_options();
        let handler = Arc::clone(self.context.failure_handler());

        match synchronization {
            SynchronizationStrategy::None => {
                let orchestrator = self.orchestrator.clone();
                tokio::spawn(async move {
                    match plan.execute_and_report(&orchestrator, options).await {
                        Ok(report) => forward_failures(handler.as_ref(), &report),
                        Err(e) => handler.handle_generic("background indexing", &e.to_string()),
                    }
                });
                Ok(ExecutionReport::default())
            }
            SynchronizationStrategy::Async => {
                let execution = plan.submit(&self.orchestrator, options).await?;
                tokio::spawn(async move {
                    let report = execution.report().await;
                    forward_failures(handler.as_ref(), &report);
                });
                Ok(ExecutionReport::default())
            }
            SynchronizationStrategy::Sync | SynchronizationStrategy::Searchable => {
                let execution = plan.submit(&self.orchestrator, options).await?;
                let report = wait(execution, self.timeout).await;
                if report.is_success() {
                    Ok(report)
                } else {
                    warn!(
                        failures = report.failures.len(),
                        first = %report.first_failure_message(),
                        "Synchronous indexing failed"
                    );
                    Err(IndexingError::Failed(Box::new(report)))
                }
            }
        }
    }

    async fn stop(&self) {
        self.orchestrator.stop().await;
        info!("Synchronous coordination stopped");
    }
}
