// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity identity, state snapshots and dirtiness.
//!
//! The persistence layer describes entities to this crate with three types:
//!
//! - [`EntityReference`]: type + identifier + tenant. This is also the document
//!   key inside an indexing plan.
//! - [`EntityState`]: a snapshot of an entity's properties.
//! - [`Dirtiness`]: which properties changed.

mod change;

pub use change::{ChangeKind, EntityChangeEvent};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Property map of an entity or embedded object.
pub type Properties = BTreeMap<String, PropertyValue>;

/// Identity of an entity instance (and of its index document).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityReference {
    pub type_name: String,
    pub id: String,
    pub tenant: Option<String>,
}

impl EntityReference {
    pub fn new(type_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            id: id.into(),
            tenant: None,
        }
    }

    #[must_use]
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }
}

impl fmt::Display for EntityReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tenant {
            Some(tenant) => write!(f, "{}#{}@{}", self.type_name, self.id, tenant),
            None => write!(f, "{}#{}", self.type_name, self.id),
        }
    }
}

/// A property value as seen by bridges and the reindexing resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    /// To-one association.
    Reference(EntityReference),
    /// Embeddable value object.
    Object(Properties),
    List(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
}

impl PropertyValue {
    pub fn as_reference(&self) -> Option<&EntityReference> {
        match self {
            Self::Reference(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// List of references, the usual shape of a to-many association.
    pub fn references<I>(refs: I) -> Self
    where
        I: IntoIterator<Item = EntityReference>,
    {
        Self::List(refs.into_iter().map(Self::Reference).collect())
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<EntityReference> for PropertyValue {
    fn from(v: EntityReference) -> Self {
        Self::Reference(v)
    }
}

impl<T: Into<PropertyValue>> From<Option<T>> for PropertyValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl<T: Into<PropertyValue>> From<Vec<T>> for PropertyValue {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

/// Snapshot of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub reference: EntityReference,
    pub properties: Properties,
}

impl EntityState {
    pub fn new(reference: EntityReference) -> Self {
        Self {
            reference,
            properties: Properties::new(),
        }
    }

    /// Builder-style property setter.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }
}

/// Which properties of an entity changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dirtiness {
    /// Everything must be considered dirty (inserts, deletes, unknown changes).
    All,
    Properties(BTreeSet<String>),
}

impl Default for Dirtiness {
    fn default() -> Self {
        Self::Properties(BTreeSet::new())
    }
}

impl Dirtiness {
    pub fn clean() -> Self {
        Self::default()
    }

    pub fn properties<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Properties(names.into_iter().map(Into::into).collect())
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Properties(p) if p.is_empty())
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    pub fn is_dirty(&self, property: &str) -> bool {
        match self {
            Self::All => true,
            Self::Properties(p) => p.contains(property),
        }
    }

    /// Union in place.
    pub fn merge(&mut self, other: &Dirtiness) {
        match (&mut *self, other) {
            (Self::All, _) => {}
            (_, Self::All) => *self = Self::All,
            (Self::Properties(mine), Self::Properties(theirs)) => {
                mine.extend(theirs.iter().cloned());
            }
        }
    }

    /// What is dirty in `self` but not yet covered by `resolved`.
    ///
    /// `All` minus a property set stays `All`: we cannot enumerate the rest.
    pub fn difference(&self, resolved: &Dirtiness) -> Dirtiness {
        match (self, resolved) {
            (_, Self::All) => Self::clean(),
            (Self::All, Self::Properties(_)) => Self::All,
            (Self::Properties(mine), Self::Properties(done)) => {
                Self::Properties(mine.difference(done).cloned().collect())
            }
        }
    }

    /// Whether any property in `candidates` is dirty.
    pub fn intersects(&self, candidates: &BTreeSet<String>) -> bool {
        match self {
            Self::All => !candidates.is_empty(),
            Self::Properties(p) => p.iter().any(|name| candidates.contains(name)),
        }
    }
}
