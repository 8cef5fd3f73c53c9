// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bridges: the capabilities that turn entity data into index fields.
//!
//! Three kinds, each a trait object bound once at bootstrap:
//!
//! - [`ValueBridge`]: one property value → one field value.
//! - [`TypeBridge`]: a whole bridged object → any number of fields. Declares
//!   the paths it reads through [`BridgeDependencies`].
//! - [`RoutingBridge`]: decides the routing key of a document, or that the
//!   entity should not be indexed at all.

use super::path::PropertyPath;
use crate::document::FieldWriter;
use crate::model::{EntityState, Properties, PropertyValue};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Bridge '{bridge}' cannot handle value: {message}")]
    Unsupported { bridge: String, message: String },
    #[error("{0}")]
    Failed(String),
}

pub trait ValueBridge: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` means "no field value" (e.g. null).
    fn to_index(&self, value: &PropertyValue) -> Result<Option<Value>, BridgeError>;
}

/// Scalars map to their JSON equivalent; references index their identifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultValueBridge;

impl ValueBridge for DefaultValueBridge {
    fn name(&self) -> &str {
        "default"
    }

    fn to_index(&self, value: &PropertyValue) -> Result<Option<Value>, BridgeError> {
        match value {
            PropertyValue::Null => Ok(None),
            PropertyValue::Bool(b) => Ok(Some(Value::Bool(*b))),
            PropertyValue::Integer(i) => Ok(Some(Value::from(*i))),
            PropertyValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(|n| Some(Value::Number(n)))
                .ok_or_else(|| BridgeError::Unsupported {
                    bridge: self.name().to_string(),
                    message: format!("non-finite float {f}"),
                }),
            PropertyValue::Text(s) => Ok(Some(Value::String(s.clone()))),
            PropertyValue::Reference(r) => Ok(Some(Value::String(r.id.clone()))),
            PropertyValue::Object(_) | PropertyValue::List(_) | PropertyValue::Map(_) => {
                Err(BridgeError::Unsupported {
                    bridge: self.name().to_string(),
                    message: "container values need an extractor".to_string(),
                })
            }
        }
    }
}

/// What a type or routing bridge reads from the bridged object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeDependencies {
    /// Any property of the bridged object may be read.
    RootOnly,
    Paths(Vec<PropertyPath>),
}

impl BridgeDependencies {
    pub fn paths<'a, I: IntoIterator<Item = &'a str>>(paths: I) -> Self {
        Self::Paths(paths.into_iter().map(PropertyPath::parse).collect())
    }
}

/// What a type bridge gets to see: the bridged object and the values of the
/// paths it declared.
pub struct BridgeInput<'a> {
    element: &'a Properties,
    values: &'a HashMap<String, Vec<PropertyValue>>,
}

impl<'a> BridgeInput<'a> {
    pub(crate) fn new(element: &'a Properties, values: &'a HashMap<String, Vec<PropertyValue>>) -> Self {
        Self { element, values }
    }

    /// Direct property of the bridged object.
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.element.get(name)
    }

    /// Values reached through a declared dependency path.
    pub fn values(&self, path: &str) -> &[PropertyValue] {
        self.values.get(path).map(Vec::as_slice).unwrap_or(&[])
    }
}

pub trait TypeBridge: Send + Sync {
    fn name(&self) -> &str;

    fn dependencies(&self) -> BridgeDependencies;

    fn write(&self, input: &BridgeInput<'_>, writer: &mut FieldWriter<'_>) -> Result<(), BridgeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Indexed { routing_key: Option<String> },
    /// The entity exists but must not have a document (conditional indexing).
    NotIndexed,
}

impl Route {
    pub fn routing_key(&self) -> Option<&str> {
        match self {
            Self::Indexed { routing_key } => routing_key.as_deref(),
            Self::NotIndexed => None,
        }
    }
}

pub trait RoutingBridge: Send + Sync {
    fn name(&self) -> &str;

    fn dependencies(&self) -> BridgeDependencies {
        BridgeDependencies::RootOnly
    }

    fn route(&self, entity: &EntityState) -> Result<Route, BridgeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityReference;

    #[test]
    fn test_default_bridge_scalars() {
        let b = DefaultValueBridge;
        assert_eq!(b.to_index(&PropertyValue::Null).unwrap(), None);
        assert_eq!(b.to_index(&PropertyValue::from("x")).unwrap(), Some(Value::from("x")));
        assert_eq!(b.to_index(&PropertyValue::Integer(3)).unwrap(), Some(Value::from(3)));
        assert_eq!(b.to_index(&PropertyValue::Bool(true)).unwrap(), Some(Value::Bool(true)));
        assert_eq!(
            b.to_index(&PropertyValue::Reference(EntityReference::new("Author", "9"))).unwrap(),
            Some(Value::from("9"))
        );
    }

    #[test]
    fn test_default_bridge_rejects_containers_and_nan() {
        let b = DefaultValueBridge;
        assert!(b.to_index(&PropertyValue::List(vec![])).is_err());
        assert!(b.to_index(&PropertyValue::Float(f64::NAN)).is_err());
    }

    #[test]
    fn test_bridge_input_lookup() {
        let mut props = Properties::new();
        props.insert("title".into(), PropertyValue::from("T"));
        let mut values = HashMap::new();
        values.insert("author.name".to_string(), vec![PropertyValue::from("A")]);

        let input = BridgeInput::new(&props, &values);
        assert_eq!(input.property("title"), Some(&PropertyValue::from("T")));
        assert_eq!(input.values("author.name"), &[PropertyValue::from("A")]);
        assert!(input.values("unknown").is_empty());
    }
}
