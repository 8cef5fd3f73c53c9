// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use crate::mapping::{DependencyPath, ReindexOnUpdate};
use crate::model::Dirtiness;
use std::collections::{BTreeSet, HashMap, HashSet};

/// "When `(type, property)` changes, walk `inverse_path` from the changed
/// instance and reindex the `dependent_type` entities it reaches."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReindexingEdge {
    pub dependent_type: String,
    /// Hops on the changed side first, each one reading references to the
    /// previous entity of the original path.
    pub inverse_path: DependencyPath,
    /// Policy of the association crossed into the changed entity.
    pub policy: ReindexOnUpdate,
}

/// Reverse dependency graph, built once at bootstrap.
#[derive(Debug, Clone, Default)]
pub struct ReindexingGraph {
    edges: Vec<ReindexingEdge>,
    by_property: HashMap<(String, String), Vec<usize>>,
    by_type: HashMap<String, Vec<usize>>,
    self_dependencies: HashMap<String, BTreeSet<String>>,
    indexed: HashSet<String>,
}

impl ReindexingGraph {
    pub(crate) fn mark_indexed(&mut self, type_name: &str) {
        self.indexed.insert(type_name.to_string());
        self.self_dependencies.entry(type_name.to_string()).or_default();
    }

    pub(crate) fn add_self_dependency(&mut self, type_name: &str, property: &str) {
        self.self_dependencies
            .entry(type_name.to_string())
            .or_default()
            .insert(property.to_string());
    }

    /// Returns `false` if an identical edge already exists.
    pub(crate) fn add_edge(&mut self, type_name: &str, property: &str, edge: ReindexingEdge) -> bool {
        let key = (type_name.to_string(), property.to_string());
        let ids = self.by_property.entry(key).or_default();
        if ids.iter().any(|&id| self.edges[id] == edge) {
            return false;
        }
        let id = self.edges.len();
        ids.push(id);
        self.by_type.entry(type_name.to_string()).or_default().push(id);
        self.edges.push(edge);
        true
    }

    pub fn edge(&self, id: usize) -> &ReindexingEdge {
        &self.edges[id]
    }

    pub fn edges_for(&self, type_name: &str, property: &str) -> impl Iterator<Item = &ReindexingEdge> {
        self.by_property
            .get(&(type_name.to_string(), property.to_string()))
            .into_iter()
            .flatten()
            .map(|&id| &self.edges[id])
    }

    /// Ids of the edges triggered by `dirtiness` on an instance of `type_name`.
    pub fn triggered(&self, type_name: &str, dirtiness: &Dirtiness) -> BTreeSet<usize> {
        match dirtiness {
            Dirtiness::All => self.by_type.get(type_name).into_iter().flatten().copied().collect(),
            Dirtiness::Properties(names) => names
                .iter()
                .filter_map(|p| self.by_property.get(&(type_name.to_string(), p.clone())))
                .flatten()
                .copied()
                .collect(),
        }
    }

    /// Root properties read by documents of `type_name`.
    pub fn self_dependencies(&self, type_name: &str) -> Option<&BTreeSet<String>> {
        self.self_dependencies.get(type_name)
    }

    /// Whether the change requires the entity's own document to be rebuilt.
    pub fn affects_self(&self, type_name: &str, dirtiness: &Dirtiness) -> bool {
        if !self.indexed.contains(type_name) {
            return false;
        }
        dirtiness.is_all()
            || self
                .self_dependencies
                .get(type_name)
                .map_or(false, |deps| dirtiness.intersects(deps))
    }

    pub fn is_indexed(&self, type_name: &str) -> bool {
        self.indexed.contains(type_name)
    }

    /// Indexed, or read by the documents of some indexed type.
    pub fn is_relevant(&self, type_name: &str) -> bool {
        self.indexed.contains(type_name) || self.by_type.contains_key(type_name)
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}
