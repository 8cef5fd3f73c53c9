// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use super::graph::ReindexingGraph;
use crate::model::{Dirtiness, EntityReference, EntityState, Properties, PropertyValue};
use crate::storage::traits::{EntityProvider, StorageError};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::trace;

/// Walks inverse paths from a changed instance to the indexed entities whose
/// documents read the change.
pub struct ReindexingResolver<'a> {
    graph: &'a ReindexingGraph,
    provider: &'a dyn EntityProvider,
    loaded: HashMap<EntityReference, Option<Properties>>,
}

impl<'a> ReindexingResolver<'a> {
    pub fn new(graph: &'a ReindexingGraph, provider: &'a dyn EntityProvider) -> Self {
        Self {
            graph,
            provider,
            loaded: HashMap::new(),
        }
    }

    async fn load(&mut self, entity: &EntityReference) -> Result<Option<&Properties>, StorageError> {
        if !self.loaded.contains_key(entity) {
            let state = self.provider.load(entity).await?;
            self.loaded.insert(entity.clone(), state.map(|s| s.properties));
        }
        Ok(self.loaded.get(entity).and_then(Option::as_ref))
    }

    /// Entities to reindex because `dirtiness` changed on `entity`.
    ///
    /// The first hop of every edge reads both `current` and `previous`, so
    /// entities that referenced the old value are found as well. When
    /// `current` is `None` it is loaded through the provider.
    pub async fn resolve_entities_to_reindex(
        &mut self,
        entity: &EntityReference,
        current: Option<&EntityState>,
        previous: Option<&EntityState>,
        dirtiness: &Dirtiness,
    ) -> Result<BTreeSet<EntityReference>, StorageError> {
        let triggered = self.graph.triggered(&entity.type_name, dirtiness);
        let mut found = BTreeSet::new();
        if triggered.is_empty() {
            return Ok(found);
        }

        let mut origins: Vec<Properties> = Vec::with_capacity(2);
        match current {
            Some(state) => origins.push(state.properties.clone()),
            None => {
                if let Some(properties) = self.load(entity).await? {
                    origins.push(properties.clone());
                }
            }
        }
        if let Some(state) = previous {
            origins.push(state.properties.clone());
        }

        let mut visited: HashSet<(usize, usize, EntityReference)> = HashSet::new();
        for id in triggered {
            let graph = self.graph;
            let edge = graph.edge(id);
            let Some((first, rest)) = edge.inverse_path.segments().split_first() else {
                continue;
            };

            let mut frontier: Vec<EntityReference> = origins
                .iter()
                .flat_map(|p| first.read(p))
                .filter_map(into_reference)
                .collect();

            for (depth, hop) in rest.iter().enumerate() {
                let mut next = Vec::new();
                for reference in frontier {
                    if !visited.insert((id, depth, reference.clone())) {
                        continue;
                    }
                    if let Some(properties) = self.load(&reference).await? {
                        next.extend(hop.read(properties).into_iter().filter_map(into_reference));
                    }
                }
                frontier = next;
            }

            found.extend(
                frontier
                    .into_iter()
                    .filter(|r| r.type_name == edge.dependent_type),
            );
        }

        trace!(entity = %entity, dependents = found.len(), "Resolved dependents");
        Ok(found)
    }
}

fn into_reference(value: PropertyValue) -> Option<EntityReference> {
    match value {
        PropertyValue::Reference(r) => Some(r),
        _ => None,
    }
}
