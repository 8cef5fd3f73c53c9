// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Index documents and their derivation from entity state.
//!
//! Derivation runs the bridges bound in an [`IndexedTypeDescriptor`] against
//! an entity, walking resolved paths element-wise and loading associated
//! entities through the [`EntityProvider`]. Loaded entities are cached for the
//! lifetime of one [`DocumentDeriver`], so a plan loads each entity once.

use crate::mapping::descriptor::BoundField;
use crate::mapping::{BridgeError, BridgeInput, IndexedTypeDescriptor, PathSegment};
use crate::model::{EntityReference, EntityState, Properties, PropertyValue};
use crate::storage::traits::{EntityProvider, StorageError};
use serde::Serialize;
use serde_json::map::Entry;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexDocument {
    pub id: String,
    pub tenant: Option<String>,
    pub routing_key: Option<String>,
    pub fields: Map<String, Value>,
}

impl IndexDocument {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Field sink handed to type bridges. Applies the embedding prefix and turns
/// repeated writes to one field into an array.
pub struct FieldWriter<'a> {
    prefix: &'a str,
    fields: &'a mut Map<String, Value>,
}

impl<'a> FieldWriter<'a> {
    pub(crate) fn new(prefix: &'a str, fields: &'a mut Map<String, Value>) -> Self {
        Self { prefix, fields }
    }

    pub fn add(&mut self, name: &str, value: Value) {
        let key = format!("{}{}", self.prefix, name);
        match self.fields.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
            Entry::Occupied(mut slot) => match slot.get_mut() {
                Value::Array(items) => items.push(value),
                existing => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
            },
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum DerivationError {
    #[error("Failed to load '{entity}': {source}")]
    Load {
        entity: EntityReference,
        source: StorageError,
    },
    #[error("Bridge '{bridge}' failed: {source}")]
    Bridge { bridge: String, source: BridgeError },
}

pub(crate) struct DocumentDeriver<'a> {
    provider: &'a dyn EntityProvider,
    cache: HashMap<EntityReference, Option<Arc<Properties>>>,
}

impl<'a> DocumentDeriver<'a> {
    pub(crate) fn new(provider: &'a dyn EntityProvider) -> Self {
        Self {
            provider,
            cache: HashMap::new(),
        }
    }

    /// Seed the cache with states the caller already holds.
    pub(crate) fn prime(&mut self, state: &EntityState) {
        self.cache
            .insert(state.reference.clone(), Some(Arc::new(state.properties.clone())));
    }

    pub(crate) async fn load(&mut self, entity: &EntityReference) -> Result<Option<Arc<Properties>>, DerivationError> {
        if let Some(cached) = self.cache.get(entity) {
            return Ok(cached.clone());
        }
        let loaded = self
            .provider
            .load(entity)
            .await
            .map_err(|source| DerivationError::Load {
                entity: entity.clone(),
                source,
            })?
            .map(|state| Arc::new(state.properties));
        self.cache.insert(entity.clone(), loaded.clone());
        Ok(loaded)
    }

    /// Dereference association and embedded values into property maps.
    async fn to_elements(&mut self, values: Vec<PropertyValue>) -> Result<Vec<Arc<Properties>>, DerivationError> {
        let mut elements = Vec::with_capacity(values.len());
        for value in values {
            match value {
                PropertyValue::Reference(r) => {
                    if let Some(properties) = self.load(&r).await? {
                        elements.push(properties);
                    }
                }
                PropertyValue::Object(properties) => elements.push(Arc::new(properties)),
                _ => {}
            }
        }
        Ok(elements)
    }

    /// Values at the end of `segments`, starting from `start`.
    async fn walk(&mut self, start: Vec<Arc<Properties>>, segments: &[PathSegment]) -> Result<Vec<PropertyValue>, DerivationError> {
        let Some((last, init)) = segments.split_last() else {
            return Ok(Vec::new());
        };
        let mut elements = start;
        for segment in init {
            let values: Vec<PropertyValue> = elements.iter().flat_map(|e| segment.read(e)).collect();
            elements = self.to_elements(values).await?;
        }
        Ok(elements.iter().flat_map(|e| last.read(e)).collect())
    }

    pub(crate) async fn derive(
        &mut self,
        descriptor: &IndexedTypeDescriptor,
        state: &EntityState,
        routing_key: Option<String>,
    ) -> Result<IndexDocument, DerivationError> {
        let root = Arc::new(state.properties.clone());
        let mut fields = Map::new();

        for field in &descriptor.fields {
            match field {
                BoundField::Value { name, path, bridge } => {
                    let values = self.walk(vec![Arc::clone(&root)], path.segments()).await?;
                    let mut writer = FieldWriter::new("", &mut fields);
                    for value in &values {
                        let indexed = bridge.to_index(value).map_err(|source| DerivationError::Bridge {
                            bridge: bridge.name().to_string(),
                            source,
                        })?;
                        if let Some(indexed) = indexed {
                            writer.add(name, indexed);
                        }
                    }
                }
                BoundField::Type {
                    prefix,
                    base,
                    inputs,
                    bridge,
                } => {
                    let elements = if base.is_empty() {
                        vec![Arc::clone(&root)]
                    } else {
                        let values = self.walk(vec![Arc::clone(&root)], base.segments()).await?;
                        self.to_elements(values).await?
                    };
                    for element in elements {
                        let mut values = HashMap::with_capacity(inputs.len());
                        for (declared, relative) in inputs {
                            let resolved = self.walk(vec![Arc::clone(&element)], relative.segments()).await?;
                            values.insert(declared.clone(), resolved);
                        }
                        let input = BridgeInput::new(&element, &values);
                        let mut writer = FieldWriter::new(prefix, &mut fields);
                        bridge
                            .write(&input, &mut writer)
                            .map_err(|source| DerivationError::Bridge {
                                bridge: bridge.name().to_string(),
                                source,
                            })?;
                    }
                }
            }
        }

        Ok(IndexDocument {
            id: state.reference.id.clone(),
            tenant: state.reference.tenant.clone(),
            routing_key,
            fields,
        })
    }
}
