// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bootstrap-time flattening of field bindings into indexed type descriptors.
//!
//! Embedded bindings are expanded recursively (with their prefix and depth
//! limit), every declared path is resolved against the mapping model, and the
//! result is a flat, immutable list of bound fields per indexed type plus the
//! list of every path the type's documents read. Problems are collected, not
//! returned early, so a single bootstrap reports all of them.

use super::bridge::{BridgeDependencies, BridgeError, Route, RoutingBridge, TypeBridge, ValueBridge};
use super::path::{DependencyPath, PathSegment, PropertyPath, SegmentKind};
use super::{FieldBinding, MappingModel, PropertyKind, PropertyModel};
use crate::error::{BootstrapFailure, BootstrapFailureKind};
use crate::model::EntityState;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A field contribution with all dispatch resolved.
#[derive(Clone)]
pub(crate) enum BoundField {
    Value {
        name: String,
        path: DependencyPath,
        bridge: Arc<dyn ValueBridge>,
    },
    Type {
        prefix: String,
        /// From the indexed root to the bridged objects.
        base: DependencyPath,
        /// Declared path (as written) and its resolution relative to `base`.
        inputs: Vec<(String, DependencyPath)>,
        bridge: Arc<dyn TypeBridge>,
    },
}

/// Everything needed to derive the documents of one indexed type.
#[derive(Clone)]
pub struct IndexedTypeDescriptor {
    pub type_name: String,
    pub index_name: String,
    pub(crate) fields: Vec<BoundField>,
    pub(crate) routing: Option<Arc<dyn RoutingBridge>>,
    pub(crate) dependency_paths: Vec<DependencyPath>,
}

impl IndexedTypeDescriptor {
    /// Every path (from the root) that documents of this type read.
    pub fn dependency_paths(&self) -> &[DependencyPath] {
        &self.dependency_paths
    }

    /// Names of the statically known fields (type bridges excluded).
    pub fn value_field_names(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter_map(|f| match f {
                BoundField::Value { name, .. } => Some(name.as_str()),
                BoundField::Type { .. } => None,
            })
            .collect()
    }

    pub fn route(&self, state: &EntityState) -> Result<Route, BridgeError> {
        match &self.routing {
            Some(bridge) => bridge.route(state),
            None => Ok(Route::Indexed { routing_key: None }),
        }
    }

    pub fn has_routing(&self) -> bool {
        self.routing.is_some()
    }
}

impl std::fmt::Debug for IndexedTypeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexedTypeDescriptor")
            .field("type_name", &self.type_name)
            .field("index_name", &self.index_name)
            .field("fields", &self.fields.len())
            .field("dependency_paths", &self.dependency_paths.len())
            .finish()
    }
}

pub(crate) fn segment_for(owner: &str, property: &PropertyModel) -> PathSegment {
    let kind = match &property.kind {
        PropertyKind::Value => SegmentKind::Value,
        PropertyKind::Embedded { target } => SegmentKind::Embedded { target: target.clone() },
        PropertyKind::Association { target, .. } => SegmentKind::Association { target: target.clone() },
    };
    PathSegment {
        owner: owner.to_string(),
        property: property.name.clone(),
        kind,
        extractors: property.extractors.clone(),
        policy: property.reindex_on_update,
    }
}

/// Resolve a declared path relative to `owner`.
pub(crate) fn resolve_path(
    model: &MappingModel,
    owner: &str,
    path: &PropertyPath,
) -> Result<DependencyPath, BootstrapFailureKind> {
    let mut current = owner.to_string();
    let mut segments: Vec<PathSegment> = Vec::with_capacity(path.names().len());

    for name in path.names() {
        if let Some(previous) = segments.last() {
            if previous.kind == SegmentKind::Value {
                return Err(BootstrapFailureKind::NotTraversable(previous.property.clone()));
            }
        }
        let ty = model
            .get(&current)
            .ok_or_else(|| BootstrapFailureKind::UnknownType(current.clone()))?;
        let property = ty.get_property(name).ok_or_else(|| BootstrapFailureKind::UnknownProperty {
            owner: current.clone(),
            property: name.clone(),
        })?;
        let segment = segment_for(&current, property);
        match &segment.kind {
            SegmentKind::Value => {}
            SegmentKind::Embedded { target } | SegmentKind::Association { target } => {
                if model.get(target).is_none() {
                    return Err(BootstrapFailureKind::UnknownType(target.clone()));
                }
                current = target.clone();
            }
        }
        segments.push(segment);
    }
    Ok(DependencyPath::new(segments))
}

fn display_path(base: &DependencyPath, path: &PropertyPath) -> String {
    if base.is_empty() {
        path.to_string()
    } else if path.is_root() {
        base.to_string()
    } else {
        format!("{base}.{path}")
    }
}

struct Expansion<'a> {
    model: &'a MappingModel,
    root: &'a str,
    failures: &'a mut Vec<BootstrapFailure>,
    fields: Vec<BoundField>,
    field_names: HashSet<String>,
    dependency_paths: Vec<DependencyPath>,
}

impl Expansion<'_> {
    fn fail(&mut self, path: Option<String>, kind: BootstrapFailureKind) {
        self.failures.push(BootstrapFailure::new(self.root, path, kind));
    }

    /// Resolve a bridge's declared dependencies relative to `owner`.
    fn bridge_inputs(
        &mut self,
        owner: &str,
        base: &DependencyPath,
        dependencies: BridgeDependencies,
    ) -> Vec<(String, DependencyPath)> {
        let model = self.model;
        match dependencies {
            BridgeDependencies::RootOnly => model
                .get(owner)
                .map(|ty| {
                    ty.properties
                        .values()
                        .map(|p| (p.name.clone(), DependencyPath::new(vec![segment_for(owner, p)])))
                        .collect()
                })
                .unwrap_or_default(),
            BridgeDependencies::Paths(paths) => {
                let mut inputs = Vec::with_capacity(paths.len());
                for path in paths {
                    match resolve_path(model, owner, &path) {
                        Ok(resolved) => inputs.push((path.to_string(), resolved)),
                        Err(kind) => self.fail(Some(display_path(base, &path)), kind),
                    }
                }
                inputs
            }
        }
    }

    fn expand(
        &mut self,
        owner: &str,
        base: &DependencyPath,
        prefix: &str,
        remaining_depth: Option<usize>,
        stack: &mut Vec<String>,
    ) {
        let model = self.model;
        let Some(ty) = model.get(owner) else {
            self.fail(None, BootstrapFailureKind::UnknownType(owner.to_string()));
            return;
        };

        for binding in &ty.fields {
            match binding {
                FieldBinding::Value { field, path, bridge } => {
                    let relative = match resolve_path(model, owner, path) {
                        Ok(p) => p,
                        Err(kind) => {
                            self.fail(Some(display_path(base, path)), kind);
                            continue;
                        }
                    };
                    if !matches!(relative.last().map(|s| &s.kind), Some(SegmentKind::Value)) {
                        self.fail(
                            Some(display_path(base, path)),
                            BootstrapFailureKind::ValueFieldOnNonValue { field: field.clone() },
                        );
                        continue;
                    }
                    let name = format!("{prefix}{field}");
                    if !self.field_names.insert(name.clone()) {
                        self.fail(Some(display_path(base, path)), BootstrapFailureKind::DuplicateField(name));
                        continue;
                    }
                    let full = base.join(&relative);
                    self.dependency_paths.push(full.clone());
                    self.fields.push(BoundField::Value {
                        name,
                        path: full,
                        bridge: Arc::clone(bridge),
                    });
                }
                FieldBinding::Type { bridge } => {
                    let inputs = self.bridge_inputs(owner, base, bridge.dependencies());
                    for (_, relative) in &inputs {
                        self.dependency_paths.push(base.join(relative));
                    }
                    self.fields.push(BoundField::Type {
                        prefix: prefix.to_string(),
                        base: base.clone(),
                        inputs,
                        bridge: Arc::clone(bridge),
                    });
                }
                FieldBinding::Embedded {
                    prefix: embedded_prefix,
                    path,
                    max_depth,
                } => {
                    let relative = match resolve_path(model, owner, path) {
                        Ok(p) => p,
                        Err(kind) => {
                            self.fail(Some(display_path(base, path)), kind);
                            continue;
                        }
                    };
                    let target = match relative.last().map(|s| &s.kind) {
                        Some(SegmentKind::Embedded { target } | SegmentKind::Association { target }) => {
                            target.clone()
                        }
                        _ => {
                            self.fail(
                                Some(display_path(base, path)),
                                BootstrapFailureKind::EmbeddedOnValue { prefix: embedded_prefix.clone() },
                            );
                            continue;
                        }
                    };

                    let full = base.join(&relative);
                    // Membership changes (adding/removing an associated entity)
                    // affect the document even if no embedded field changes.
                    self.dependency_paths.push(full.clone());

                    let depth = match (remaining_depth, *max_depth) {
                        (Some(r), Some(d)) => Some(r.min(d)),
                        (Some(r), None) => Some(r),
                        (None, d) => d,
                    };
                    if depth == Some(0) {
                        continue;
                    }
                    if depth.is_none() && stack.contains(&target) {
                        let cycle = format!("{} -> {}", stack.join(" -> "), target);
                        self.fail(Some(full.to_string()), BootstrapFailureKind::CyclicEmbedding { cycle });
                        continue;
                    }

                    stack.push(target.clone());
                    let nested_prefix = format!("{prefix}{embedded_prefix}.");
                    self.expand(&target, &full, &nested_prefix, depth.map(|d| d - 1), stack);
                    stack.pop();
                }
            }
        }
    }
}

/// Build one descriptor per indexed type. Failures are appended to `failures`.
pub(crate) fn build_descriptors(
    model: &MappingModel,
    failures: &mut Vec<BootstrapFailure>,
) -> HashMap<String, IndexedTypeDescriptor> {
    let mut descriptors = HashMap::new();

    for ty in model.indexed_types() {
        let Some(settings) = &ty.index else { continue };
        let mut expansion = Expansion {
            model,
            root: &ty.name,
            failures: &mut *failures,
            fields: Vec::new(),
            field_names: HashSet::new(),
            dependency_paths: Vec::new(),
        };

        let mut stack = vec![ty.name.clone()];
        expansion.expand(&ty.name, &DependencyPath::default(), "", None, &mut stack);

        if let Some(routing) = &settings.routing {
            let inputs = expansion.bridge_inputs(&ty.name, &DependencyPath::default(), routing.dependencies());
            expansion.dependency_paths.extend(inputs.into_iter().map(|(_, p)| p));
        }

        let Expansion { fields, mut dependency_paths, .. } = expansion;
        dependency_paths.dedup();

        descriptors.insert(
            ty.name.clone(),
            IndexedTypeDescriptor {
                type_name: ty.name.clone(),
                index_name: settings.index_name.clone(),
                fields,
                routing: settings.routing.clone(),
                dependency_paths,
            },
        );
    }

    descriptors
}
