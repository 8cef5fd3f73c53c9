//! Entity change events emitted by the persistence layer.

use super::{Dirtiness, EntityReference, EntityState};

/// What happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    /// The listener cannot tell whether the entity existed before.
    Upsert,
}

/// One observed change, as reported by a persistence-layer listener.
#[derive(Debug, Clone)]
pub struct EntityChangeEvent {
    pub kind: ChangeKind,
    pub entity: EntityReference,
    pub dirtiness: Dirtiness,
    pub current: Option<EntityState>,
    pub previous: Option<EntityState>,
}

impl EntityChangeEvent {
    pub fn insert(state: EntityState) -> Self {
        Self {
            kind: ChangeKind::Insert,
            entity: state.reference.clone(),
            dirtiness: Dirtiness::All,
            current: Some(state),
            previous: None,
        }
    }

    /// Update with the dirty property names.
    pub fn update<I, S>(current: EntityState, dirty: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: ChangeKind::Update,
            entity: current.reference.clone(),
            dirtiness: Dirtiness::properties(dirty),
            current: Some(current),
            previous: None,
        }
    }

    /// Update carrying the state loaded before the change.
    ///
    /// The previous state lets the resolver reach entities that referenced an
    /// association target that is no longer referenced.
    pub fn update_with_previous<I, S>(previous: EntityState, current: EntityState, dirty: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut event = Self::update(current, dirty);
        event.previous = Some(previous);
        event
    }

    pub fn delete(previous: EntityState) -> Self {
        Self {
            kind: ChangeKind::Delete,
            entity: previous.reference.clone(),
            dirtiness: Dirtiness::All,
            current: None,
            previous: Some(previous),
        }
    }

    /// Delete when only the identity is known.
    pub fn delete_reference(entity: EntityReference) -> Self {
        Self {
            kind: ChangeKind::Delete,
            entity,
            dirtiness: Dirtiness::All,
            current: None,
            previous: None,
        }
    }

    pub fn upsert(state: EntityState) -> Self {
        Self {
            kind: ChangeKind::Upsert,
            entity: state.reference.clone(),
            dirtiness: Dirtiness::All,
            current: Some(state),
            previous: None,
        }
    }
}
