// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bootstrapped mapping: everything plans need, immutable and shared.

use crate::dependency::{DependencyGraphBuilder, ReindexingGraph, ReindexingResolver};
use crate::error::BootstrapError;
use crate::failure::FailureHandler;
use crate::mapping::descriptor::build_descriptors;
use crate::mapping::{IndexedTypeDescriptor, MappingModel};
use crate::storage::traits::EntityProvider;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

pub struct MappingContext {
    model: MappingModel,
    descriptors: HashMap<String, IndexedTypeDescriptor>,
    graph: ReindexingGraph,
    provider: Arc<dyn EntityProvider>,
    failure_handler: Arc<dyn FailureHandler>,
}

impl MappingContext {
    /// Flatten bindings and build the reindexing graph. Every mapping problem
    /// is reported at once; no partial context is ever returned.
    pub fn bootstrap(
        model: MappingModel,
        provider: Arc<dyn EntityProvider>,
        failure_handler: Arc<dyn FailureHandler>,
    ) -> Result<Self, BootstrapError> {
        let mut failures = Vec::new();
        let descriptors = build_descriptors(&model, &mut failures);
        let graph = DependencyGraphBuilder::build_collecting(&model, &descriptors, &mut failures);
        BootstrapError::check(failures)?;

        info!(
            indexed_types = descriptors.len(),
            edges = graph.edge_count(),
            "Mapping bootstrapped"
        );

        Ok(Self {
            model,
            descriptors,
            graph,
            provider,
            failure_handler,
        })
    }

    pub fn model(&self) -> &MappingModel {
        &self.model
    }

    pub fn descriptor(&self, type_name: &str) -> Option<&IndexedTypeDescriptor> {
        self.descriptors.get(type_name)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &IndexedTypeDescriptor> {
        self.descriptors.values()
    }

    pub fn graph(&self) -> &ReindexingGraph {
        &self.graph
    }

    pub fn provider(&self) -> &dyn EntityProvider {
        self.provider.as_ref()
    }

    pub fn failure_handler(&self) -> &Arc<dyn FailureHandler> {
        &self.failure_handler
    }

    pub fn resolver(&self) -> ReindexingResolver<'_> {
        ReindexingResolver::new(&self.graph, self.provider.as_ref())
    }

    /// Changes to irrelevant types never reach a plan.
    pub fn is_relevant(&self, type_name: &str) -> bool {
        self.graph.is_relevant(type_name)
    }
}

impl std::fmt::Debug for MappingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingContext")
            .field("descriptors", &self.descriptors.keys().collect::<Vec<_>>())
            .field("edges", &self.graph.edge_count())
            .finish()
    }
}
