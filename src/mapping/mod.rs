// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Programmatic mapping model.
//!
//! A [`MappingModel`] is the closed set of entity and embeddable types the
//! engine knows about. Each [`TypeModel`] declares its properties (values,
//! embedded objects, associations), the container extractors to apply to them,
//! their reindexing policy, and the field bindings that contribute to index
//! documents. Types with [`IndexSettings`] are *indexed types*.
//!
//! # Example
//!
//! ```
//! use index_sync::mapping::{MappingModel, PropertyModel, TypeModel, IndexSettings};
//!
//! let model = MappingModel::new()
//!     .with_type(
//!         TypeModel::entity("Author")
//!             .property(PropertyModel::value("name"))
//!             .property(PropertyModel::to_many("books", "Book").mapped_by("author")),
//!     )
//!     .with_type(
//!         TypeModel::entity("Book")
//!             .property(PropertyModel::value("title"))
//!             .property(PropertyModel::to_one("author", "Author"))
//!             .field("title", "title")
//!             .field("authorName", "author.name")
//!             .indexed(IndexSettings::new("books")),
//!     );
//! assert!(model.get("Book").map_or(false, |t| t.is_indexed()));
//! ```

pub mod bridge;
pub mod descriptor;
pub mod path;

pub use bridge::{
    BridgeDependencies, BridgeError, BridgeInput, DefaultValueBridge, RoutingBridge, Route,
    TypeBridge, ValueBridge,
};
pub use descriptor::IndexedTypeDescriptor;
pub use path::{DependencyPath, PathSegment, PropertyPath, SegmentKind};

use crate::model::PropertyValue;
use std::collections::BTreeMap;
use std::sync::Arc;

/// How changes to an association propagate to the documents that read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReindexOnUpdate {
    /// Propagate through the association to every level.
    #[default]
    Default,
    /// Reindex the direct holder when the association itself changes, but
    /// ignore changes in the associated entities.
    Shallow,
    /// Never reindex anything because of this property.
    No,
}

/// Element-wise access into container values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerExtractor {
    Collection,
    MapValues,
    MapKeys,
    Optional,
}

impl ContainerExtractor {
    fn apply(self, value: PropertyValue, out: &mut Vec<PropertyValue>) {
        match (self, value) {
            (_, PropertyValue::Null) => {}
            (Self::Collection, PropertyValue::List(items)) => out.extend(items),
            (Self::MapValues, PropertyValue::Map(m) | PropertyValue::Object(m)) => {
                out.extend(m.into_values());
            }
            (Self::MapKeys, PropertyValue::Map(m) | PropertyValue::Object(m)) => {
                out.extend(m.into_keys().map(PropertyValue::Text));
            }
            (_, other) => out.push(other),
        }
    }
}

/// Apply an extractor chain to a raw property value. Nulls are dropped.
pub fn extract_values(extractors: &[ContainerExtractor], value: &PropertyValue) -> Vec<PropertyValue> {
    let mut current = vec![value.clone()];
    for extractor in extractors {
        let mut next = Vec::with_capacity(current.len());
        for v in current {
            extractor.apply(v, &mut next);
        }
        current = next;
    }
    current.retain(|v| !v.is_null());
    current
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    Value,
    Embedded {
        target: String,
    },
    Association {
        target: String,
        /// Name of the property on `target` pointing back to the holder.
        mapped_by: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct PropertyModel {
    pub name: String,
    pub kind: PropertyKind,
    pub extractors: Vec<ContainerExtractor>,
    pub reindex_on_update: ReindexOnUpdate,
}

impl PropertyModel {
    pub fn value(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::Value,
            extractors: Vec::new(),
            reindex_on_update: ReindexOnUpdate::Default,
        }
    }

    pub fn embedded(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: PropertyKind::Embedded { target: target.into() },
            ..Self::value(name)
        }
    }

    pub fn to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: PropertyKind::Association {
                target: target.into(),
                mapped_by: None,
            },
            ..Self::value(name)
        }
    }

    /// Association through a collection.
    pub fn to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::to_one(name, target).extractors([ContainerExtractor::Collection])
    }

    /// Declare the inverse side (the property on the target pointing back).
    #[must_use]
    pub fn mapped_by(mut self, inverse: impl Into<String>) -> Self {
        if let PropertyKind::Association { mapped_by, .. } = &mut self.kind {
            *mapped_by = Some(inverse.into());
        }
        self
    }

    #[must_use]
    pub fn extractors<I: IntoIterator<Item = ContainerExtractor>>(mut self, chain: I) -> Self {
        self.extractors = chain.into_iter().collect();
        self
    }

    #[must_use]
    pub fn reindex_on_update(mut self, policy: ReindexOnUpdate) -> Self {
        self.reindex_on_update = policy;
        self
    }

    pub fn is_association(&self) -> bool {
        matches!(self.kind, PropertyKind::Association { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Entity,
    Embeddable,
}

/// Where an indexed type's documents go.
#[derive(Clone)]
pub struct IndexSettings {
    pub index_name: String,
    pub routing: Option<Arc<dyn RoutingBridge>>,
}

impl IndexSettings {
    pub fn new(index_name: impl Into<String>) -> Self {
        Self {
            index_name: index_name.into(),
            routing: None,
        }
    }

    #[must_use]
    pub fn routing(mut self, bridge: Arc<dyn RoutingBridge>) -> Self {
        self.routing = Some(bridge);
        self
    }
}

impl std::fmt::Debug for IndexSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexSettings")
            .field("index_name", &self.index_name)
            .field("routing", &self.routing.as_ref().map(|r| r.name().to_string()))
            .finish()
    }
}

/// A contribution of the bridged type to index documents.
#[derive(Clone)]
pub enum FieldBinding {
    /// One document field from a value path.
    Value {
        field: String,
        path: PropertyPath,
        bridge: Arc<dyn ValueBridge>,
    },
    /// Arbitrary fields written by a type bridge.
    Type { bridge: Arc<dyn TypeBridge> },
    /// Include the target's own field bindings under `prefix`.
    Embedded {
        prefix: String,
        path: PropertyPath,
        max_depth: Option<usize>,
    },
}

impl std::fmt::Debug for FieldBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value { field, path, bridge } => f
                .debug_struct("Value")
                .field("field", field)
                .field("path", &path.to_string())
                .field("bridge", &bridge.name())
                .finish(),
            Self::Type { bridge } => f.debug_struct("Type").field("bridge", &bridge.name()).finish(),
            Self::Embedded { prefix, path, max_depth } => f
                .debug_struct("Embedded")
                .field("prefix", prefix)
                .field("path", &path.to_string())
                .field("max_depth", max_depth)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TypeModel {
    pub name: String,
    pub kind: TypeKind,
    pub properties: BTreeMap<String, PropertyModel>,
    pub fields: Vec<FieldBinding>,
    pub index: Option<IndexSettings>,
}

impl TypeModel {
    pub fn entity(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Entity,
            properties: BTreeMap::new(),
            fields: Vec::new(),
            index: None,
        }
    }

    pub fn embeddable(name: impl Into<String>) -> Self {
        Self {
            kind: TypeKind::Embeddable,
            ..Self::entity(name)
        }
    }

    #[must_use]
    pub fn property(mut self, property: PropertyModel) -> Self {
        self.properties.insert(property.name.clone(), property);
        self
    }

    /// Value field using [`DefaultValueBridge`].
    #[must_use]
    pub fn field(self, field: impl Into<String>, path: &str) -> Self {
        self.field_with(field, path, Arc::new(DefaultValueBridge))
    }

    #[must_use]
    pub fn field_with(
        mut self,
        field: impl Into<String>,
        path: &str,
        bridge: Arc<dyn ValueBridge>,
    ) -> Self {
        self.fields.push(FieldBinding::Value {
            field: field.into(),
            path: PropertyPath::parse(path),
            bridge,
        });
        self
    }

    #[must_use]
    pub fn type_bridge(mut self, bridge: Arc<dyn TypeBridge>) -> Self {
        self.fields.push(FieldBinding::Type { bridge });
        self
    }

    #[must_use]
    pub fn embed(mut self, prefix: impl Into<String>, path: &str, max_depth: Option<usize>) -> Self {
        self.fields.push(FieldBinding::Embedded {
            prefix: prefix.into(),
            path: PropertyPath::parse(path),
            max_depth,
        });
        self
    }

    #[must_use]
    pub fn indexed(mut self, settings: IndexSettings) -> Self {
        self.index = Some(settings);
        self
    }

    pub fn is_indexed(&self) -> bool {
        self.index.is_some()
    }

    pub fn get_property(&self, name: &str) -> Option<&PropertyModel> {
        self.properties.get(name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MappingModel {
    types: BTreeMap<String, TypeModel>,
}

impl MappingModel {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_type(mut self, model: TypeModel) -> Self {
        self.types.insert(model.name.clone(), model);
        self
    }

    pub fn add_type(&mut self, model: TypeModel) {
        self.types.insert(model.name.clone(), model);
    }

    pub fn get(&self, name: &str) -> Option<&TypeModel> {
        self.types.get(name)
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeModel> {
        self.types.values()
    }

    pub fn indexed_types(&self) -> impl Iterator<Item = &TypeModel> {
        self.types.values().filter(|t| t.is_indexed())
    }
}
