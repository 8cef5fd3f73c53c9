// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Builds the [`ReindexingGraph`] from the read paths of every indexed type.
//!
//! Each path is walked segment by segment, tracking the entity it currently
//! sits on. The first property read on an entity is the one whose change
//! invalidates the root document: on the root it is a self dependency, on a
//! remote entity it becomes an edge leading back to the root through the
//! inverse of every association crossed so far.

use super::graph::{ReindexingEdge, ReindexingGraph};
use crate::error::{BootstrapError, BootstrapFailure, BootstrapFailureKind};
use crate::mapping::descriptor::segment_for;
use crate::mapping::{
    DependencyPath, IndexedTypeDescriptor, MappingModel, PathSegment, PropertyKind, PropertyModel, ReindexOnUpdate,
};
use std::collections::HashMap;
use tracing::debug;

pub struct DependencyGraphBuilder<'a> {
    model: &'a MappingModel,
    graph: ReindexingGraph,
    failures: Vec<BootstrapFailure>,
}

impl<'a> DependencyGraphBuilder<'a> {
    pub fn build(
        model: &'a MappingModel,
        descriptors: &HashMap<String, IndexedTypeDescriptor>,
    ) -> Result<ReindexingGraph, BootstrapError> {
        let mut failures = Vec::new();
        let graph = Self::build_collecting(model, descriptors, &mut failures);
        BootstrapError::check(failures)?;
        Ok(graph)
    }

    pub(crate) fn build_collecting(
        model: &'a MappingModel,
        descriptors: &HashMap<String, IndexedTypeDescriptor>,
        failures: &mut Vec<BootstrapFailure>,
    ) -> ReindexingGraph {
        let mut builder = Self {
            model,
            graph: ReindexingGraph::default(),
            failures: Vec::new(),
        };

        let mut roots: Vec<&IndexedTypeDescriptor> = descriptors.values().collect();
        roots.sort_by(|a, b| a.type_name.cmp(&b.type_name));
        for descriptor in roots {
            builder.graph.mark_indexed(&descriptor.type_name);
            for path in descriptor.dependency_paths() {
                builder.walk(&descriptor.type_name, path);
            }
        }

        debug!(edges = builder.graph.edge_count(), "Reindexing graph built");
        failures.extend(builder.failures);
        builder.graph
    }

    fn fail(&mut self, root: &str, path: &DependencyPath, kind: BootstrapFailureKind) {
        let failure = BootstrapFailure::new(root, Some(path.to_string()), kind);
        if !self.failures.contains(&failure) {
            self.failures.push(failure);
        }
    }

    fn walk(&mut self, root: &str, path: &DependencyPath) {
        let segments = path.segments();
        let mut entity = root.to_string();
        let mut anchored = false;
        let mut within: Vec<&str> = Vec::new();
        let mut hops: Vec<PathSegment> = Vec::new();
        let mut entered_by = ReindexOnUpdate::Default;
        let mut blocked = false;

        for (i, segment) in segments.iter().enumerate() {
            if !anchored {
                anchored = true;
                if !blocked && segment.policy != ReindexOnUpdate::No {
                    self.record(root, &entity, segment, &hops, entered_by);
                }
            }
            within.push(&segment.property);

            let Some(target) = segment.association_target() else { continue };
            let inverse = match self.inverse_of(&entity, &within, segment) {
                Ok(inverse) => inverse,
                Err(kind) => {
                    self.fail(root, path, kind);
                    blocked = true;
                    None
                }
            };

            if i + 1 == segments.len() {
                break;
            }
            if segment.policy != ReindexOnUpdate::Default {
                blocked = true;
            }
            if !blocked {
                match inverse {
                    Some(inverse) => hops.push(inverse),
                    None => {
                        self.fail(
                            root,
                            path,
                            BootstrapFailureKind::MissingInverseSide {
                                association: format!("{}.{}", segment.owner, segment.property),
                            },
                        );
                        blocked = true;
                    }
                }
            }

            entity = target.to_string();
            anchored = false;
            within.clear();
            entered_by = segment.policy;
        }
    }

    fn record(&mut self, root: &str, entity: &str, segment: &PathSegment, hops: &[PathSegment], policy: ReindexOnUpdate) {
        if hops.is_empty() {
            self.graph.add_self_dependency(root, &segment.property);
            return;
        }
        let inverse_path = DependencyPath::new(hops.iter().rev().cloned().collect());
        self.graph.add_edge(
            entity,
            &segment.property,
            ReindexingEdge {
                dependent_type: root.to_string(),
                inverse_path,
                policy,
            },
        );
    }

    /// Property on the association target that reads back to `holder`.
    fn inverse_of(
        &self,
        holder: &str,
        within: &[&str],
        segment: &PathSegment,
    ) -> Result<Option<PathSegment>, BootstrapFailureKind> {
        let Some(target_name) = segment.association_target() else {
            return Ok(None);
        };
        let Some(target) = self.model.get(target_name) else {
            return Ok(None);
        };
        let declared = self
            .model
            .get(&segment.owner)
            .and_then(|t| t.get_property(&segment.property));
        let mapped_by = match declared.map(|p| &p.kind) {
            Some(PropertyKind::Association { mapped_by, .. }) => mapped_by.clone(),
            _ => None,
        };

        let points_back = |p: &PropertyModel| matches!(&p.kind, PropertyKind::Association { target, .. } if target == holder);

        if let Some(inverse) = mapped_by {
            return match target.get_property(&inverse) {
                Some(p) if points_back(p) => Ok(Some(segment_for(target_name, p))),
                _ => Err(BootstrapFailureKind::InvalidInverseSide {
                    association: format!("{}.{}", segment.owner, segment.property),
                    inverse,
                    expected: holder.to_string(),
                }),
            };
        }

        let dotted = within.join(".");
        let candidates: Vec<&PropertyModel> = target
            .properties
            .values()
            .filter(|p| points_back(p))
            .filter(|p| {
                matches!(&p.kind, PropertyKind::Association { mapped_by: Some(m), .. }
                    if *m == segment.property || *m == dotted)
            })
            .collect();
        match candidates.as_slice() {
            [only] => Ok(Some(segment_for(target_name, only))),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::descriptor::build_descriptors;
    use crate::mapping::{IndexSettings, TypeModel};
    use crate::model::Dirtiness;

    fn build(model: &MappingModel) -> Result<ReindexingGraph, BootstrapError> {
        let mut failures = Vec::new();
        let descriptors = build_descriptors(model, &mut failures);
        BootstrapError::check(failures)?;
        DependencyGraphBuilder::build(model, &descriptors)
    }

    fn library(author_policy: ReindexOnUpdate) -> MappingModel {
        MappingModel::new()
            .with_type(
                TypeModel::entity("Author")
                    .property(PropertyModel::value("name"))
                    .property(PropertyModel::embedded("address", "Address"))
                    .property(PropertyModel::to_many("books", "Book").mapped_by("author"))
                    .field("name", "name")
                    .field("city", "address.city"),
            )
            .with_type(TypeModel::embeddable("Address").property(PropertyModel::value("city")))
            .with_type(
                TypeModel::entity("Book")
                    .property(PropertyModel::value("title"))
                    .property(PropertyModel::value("isbn"))
                    .property(PropertyModel::to_one("author", "Author").reindex_on_update(author_policy))
                    .field("title", "title")
                    .embed("author", "author", Some(1))
                    .indexed(IndexSettings::new("books")),
            )
    }

    #[test]
    fn test_self_dependencies_and_remote_edges() {
        let graph = build(&library(ReindexOnUpdate::Default)).unwrap();

        let own = graph.self_dependencies("Book").unwrap();
        assert!(own.contains("title"));
        assert!(own.contains("author"));
        assert!(!own.contains("isbn"));

        let name_edges: Vec<_> = graph.edges_for("Author", "name").collect();
        assert_eq!(name_edges.len(), 1);
        assert_eq!(name_edges[0].dependent_type, "Book");
        assert_eq!(name_edges[0].inverse_path.to_string(), "books");

        // Embedded properties are keyed by the first property read on the entity.
        assert_eq!(graph.edges_for("Author", "address").count(), 1);
        assert_eq!(graph.edges_for("Address", "city").count(), 0);
    }

    #[test]
    fn test_dirty_check_uses_self_dependencies() {
        let graph = build(&library(ReindexOnUpdate::Default)).unwrap();
        assert!(graph.affects_self("Book", &Dirtiness::properties(["title"])));
        assert!(!graph.affects_self("Book", &Dirtiness::properties(["isbn"])));
        assert!(graph.affects_self("Book", &Dirtiness::All));
        assert!(!graph.affects_self("Author", &Dirtiness::All));
        assert!(graph.is_relevant("Author"));
        assert!(!graph.is_relevant("Address"));
    }

    #[test]
    fn test_shallow_keeps_direct_edge_only() {
        let graph = build(&library(ReindexOnUpdate::Shallow)).unwrap();
        assert!(graph.self_dependencies("Book").unwrap().contains("author"));
        assert_eq!(graph.edges_for("Author", "name").count(), 0);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_no_suppresses_its_own_edge() {
        let graph = build(&library(ReindexOnUpdate::No)).unwrap();
        assert!(!graph.self_dependencies("Book").unwrap().contains("author"));
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_missing_inverse_side_fails_bootstrap() {
        let model = MappingModel::new()
            .with_type(
                TypeModel::entity("Author")
                    .property(PropertyModel::value("name"))
                    .field("name", "name"),
            )
            .with_type(
                TypeModel::entity("Book")
                    .property(PropertyModel::to_one("author", "Author"))
                    .embed("author", "author", Some(1))
                    .indexed(IndexSettings::new("books")),
            );
        let err = build(&model).unwrap_err();
        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].type_name, "Book");
        assert_eq!(err.failures[0].path.as_deref(), Some("author.name"));
        assert!(matches!(
            err.failures[0].kind,
            BootstrapFailureKind::MissingInverseSide { ref association } if association == "Book.author"
        ));
    }

    #[test]
    fn test_missing_inverse_is_fine_when_shallow() {
        let model = MappingModel::new()
            .with_type(
                TypeModel::entity("Author")
                    .property(PropertyModel::value("name"))
                    .field("name", "name"),
            )
            .with_type(
                TypeModel::entity("Book")
                    .property(
                        PropertyModel::to_one("author", "Author").reindex_on_update(ReindexOnUpdate::Shallow),
                    )
                    .embed("author", "author", Some(1))
                    .indexed(IndexSettings::new("books")),
            );
        assert!(build(&model).is_ok());
    }

    #[test]
    fn test_mapped_by_must_point_back() {
        let model = MappingModel::new()
            .with_type(
                TypeModel::entity("Author")
                    .property(PropertyModel::value("name"))
                    .field("name", "name"),
            )
            .with_type(
                TypeModel::entity("Book")
                    .property(PropertyModel::to_one("author", "Author").mapped_by("name"))
                    .embed("author", "author", Some(1))
                    .indexed(IndexSettings::new("books")),
            );
        let err = build(&model).unwrap_err();
        assert!(err
            .failures
            .iter()
            .any(|f| matches!(f.kind, BootstrapFailureKind::InvalidInverseSide { .. })));
    }

    #[test]
    fn test_self_referencing_type_builds_edge_back_to_itself() {
        let model = MappingModel::new().with_type(
            TypeModel::entity("Category")
                .property(PropertyModel::value("name"))
                .property(PropertyModel::to_one("parent", "Category"))
                .property(PropertyModel::to_many("children", "Category").mapped_by("parent"))
                .field("name", "name")
                .embed("parent", "parent", Some(3))
                .indexed(IndexSettings::new("categories")),
        );
        let graph = build(&model).unwrap();
        let depths: Vec<usize> = graph
            .edges_for("Category", "name")
            .map(|e| e.inverse_path.len())
            .collect();
        assert_eq!(depths, vec![1, 2, 3]);
    }
}
