// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use crate::document::IndexDocument;
use crate::model::EntityReference;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq)]
pub enum WorkKind {
    Add(IndexDocument),
    /// Replaces the document, creating it if absent.
    Update(IndexDocument),
    Delete,
}

/// One document write against one index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexWork {
    pub index: String,
    pub entity: EntityReference,
    pub document_id: String,
    pub tenant: Option<String>,
    pub routing_key: Option<String>,
    pub kind: WorkKind,
}

impl IndexWork {
    pub fn add(index: impl Into<String>, entity: EntityReference, document: IndexDocument) -> Self {
        Self::new(index, entity, document.routing_key.clone(), WorkKind::Add(document))
    }

    pub fn update(index: impl Into<String>, entity: EntityReference, document: IndexDocument) -> Self {
        Self::new(index, entity, document.routing_key.clone(), WorkKind::Update(document))
    }

    pub fn delete(index: impl Into<String>, entity: EntityReference, routing_key: Option<String>) -> Self {
        Self::new(index, entity, routing_key, WorkKind::Delete)
    }

    fn new(index: impl Into<String>, entity: EntityReference, routing_key: Option<String>, kind: WorkKind) -> Self {
        Self {
            index: index.into(),
            document_id: entity.id.clone(),
            tenant: entity.tenant.clone(),
            entity,
            routing_key,
            kind,
        }
    }

    pub fn document(&self) -> Option<&IndexDocument> {
        match &self.kind {
            WorkKind::Add(doc) | WorkKind::Update(doc) => Some(doc),
            WorkKind::Delete => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            WorkKind::Add(_) => "add",
            WorkKind::Update(_) => "update",
            WorkKind::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentCommitStrategy {
    #[default]
    None,
    /// Make the works durable before reporting completion.
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DocumentRefreshStrategy {
    #[default]
    None,
    /// Make the works visible to searches before reporting completion.
    Force,
}

/// What to do when a queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationSubmitter {
    #[default]
    Blocking,
    Rejecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkOptions {
    pub commit: DocumentCommitStrategy,
    pub refresh: DocumentRefreshStrategy,
    pub submitter: OperationSubmitter,
}

impl WorkOptions {
    pub fn new(commit: DocumentCommitStrategy, refresh: DocumentRefreshStrategy) -> Self {
        Self {
            commit,
            refresh,
            submitter: OperationSubmitter::Blocking,
        }
    }

    #[must_use]
    pub fn with_submitter(mut self, submitter: OperationSubmitter) -> Self {
        self.submitter = submitter;
        self
    }
}
