// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Rebuilding whole indexes from the entity store.
//!
//! Identifiers are scanned page by page, each page is loaded and submitted
//! as one plan to the parallel orchestrator. Pages are pipelined: the scan
//! does not wait for the backend, only the final flush does.

use crate::context::MappingContext;
use crate::error::IndexingError;
use crate::metrics;
use crate::model::EntityReference;
use crate::orchestration::{WorkOptions, WorkOrchestrator};
use crate::plan::{ExecutionReport, IndexingPlan, PlanExecution};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of a mass indexing run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MassIndexingReport {
    /// Documents written, per entity type.
    pub indexed: BTreeMap<String, usize>,
    pub execution: ExecutionReport,
}

impl MassIndexingReport {
    pub fn total(&self) -> usize {
        self.indexed.values().sum()
    }

    pub fn is_success(&self) -> bool {
        self.execution.is_success()
    }
}

pub struct MassIndexer {
    context: Arc<MappingContext>,
    orchestrator: WorkOrchestrator,
    batch_size: usize,
    types: Vec<String>,
    tenant: Option<String>,
}

impl MassIndexer {
    pub fn new(context: Arc<MappingContext>, orchestrator: WorkOrchestrator, batch_size: usize) -> Self {
        Self {
            context,
            orchestrator,
            batch_size: batch_size.max(1),
            types: Vec::new(),
            tenant: None,
        }
    }

    /// Restrict the run to some types. All indexed types by default.
    pub fn types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn selected_types(&self) -> Result<Vec<String>, IndexingError> {
        if self.types.is_empty() {
            let mut all: Vec<String> = self.context.descriptors().map(|d| d.type_name.clone()).collect();
            all.sort();
            return Ok(all);
        }
        for type_name in &self.types {
            if self.context.descriptor(type_name).is_none() {
                return Err(IndexingError::InvalidState(format!(
                    "type '{type_name}' is not indexed"
                )));
            }
        }
        Ok(self.types.clone())
    }

    /// Index every entity of the selected types, then commit and refresh
    /// the touched indexes.
    #[tracing::instrument(skip_all, fields(tenant = ?self.tenant))]
    pub async fn start(&self) -> Result<MassIndexingReport, IndexingError> {
        let types = self.selected_types()?;
        let started = Instant::now();
        let mut report = MassIndexingReport::default();
        let mut indexes = BTreeSet::new();

        for type_name in &types {
            let (indexed, execution) = self.index_type(type_name).await?;
            if let Some(descriptor) = self.context.descriptor(type_name) {
                indexes.insert(descriptor.index_name.clone());
            }
            metrics::record_mass_indexed(type_name, indexed);
            report.indexed.insert(type_name.clone(), indexed);
            report.execution.merge(execution);
        }

        for index in &indexes {
            self.orchestrator.flush(index).await?;
        }

        if report.is_success() {
            info!(
                types = types.len(),
                documents = report.total(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Mass indexing complete"
            );
        } else {
            warn!(
                documents = report.total(),
                failures = report.execution.failures.len(),
                first = %report.execution.first_failure_message(),
                "Mass indexing finished with failures"
            );
        }
        Ok(report)
    }

    async fn index_type(&self, type_name: &str) -> Result<(usize, ExecutionReport), IndexingError> {
        let provider = self.context.provider();
        let options = WorkOptions::default();
        let mut executions: Vec<PlanExecution> = Vec::new();
        let mut offset = 0u64;

        loop {
            let ids = provider
                .scan_identifiers(type_name, self.tenant.as_deref(), offset, self.batch_size)
                .await?;
            if ids.is_empty() {
                break;
            }
            offset += ids.len() as u64;

            let references: Vec<EntityReference> = ids
                .into_iter()
                .map(|id| {
                    let reference = EntityReference::new(type_name, id);
                    match &self.tenant {
                        Some(tenant) => reference.with_tenant(tenant.as_str()),
                        None => reference,
                    }
                })
                .collect();
            let states = provider.load_many(&references).await?;

            let mut plan = IndexingPlan::new(Arc::clone(&self.context));
            // Entities deleted since the scan are skipped.
            for state in states.into_iter().flatten() {
                plan.add_or_update(state);
            }
            debug!(type_name, offset, entries = plan.len(), "Submitting mass indexing page");
            executions.push(plan.submit_entries(&self.orchestrator, options).await?);
        }

        let mut report = ExecutionReport::default();
        for page in join_all(executions.into_iter().map(PlanExecution::report)).await {
            report.merge(page);
        }
        Ok((report.succeeded, report))
    }
}
