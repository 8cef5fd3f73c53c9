// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Crate-level error types.
//!
//! Component errors live next to their component ([`StorageError`],
//! [`OrchestratorError`], [`PayloadError`], ...). This module holds the
//! bootstrap error, which aggregates every mapping problem found at startup,
//! and [`IndexingError`], the error returned by sessions and the engine.

use crate::config::ConfigError;
use crate::orchestration::OrchestratorError;
use crate::outbox::PayloadError;
use crate::plan::ExecutionReport;
use crate::storage::traits::StorageError;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BootstrapFailureKind {
    #[error("Unknown type '{0}'")]
    UnknownType(String),
    #[error("Unknown property '{property}' on type '{owner}'")]
    UnknownProperty { owner: String, property: String },
    #[error("Property '{0}' is a value and cannot be traversed")]
    NotTraversable(String),
    #[error(
        "Cannot find the inverse side of association '{association}'. \
         Declare mapped_by on either side, or set its reindexing policy to Shallow or No"
    )]
    MissingInverseSide { association: String },
    #[error("mapped_by '{inverse}' of association '{association}' is not an association back to '{expected}'")]
    InvalidInverseSide {
        association: String,
        inverse: String,
        expected: String,
    },
    #[error("Value field '{field}' must end on a value property")]
    ValueFieldOnNonValue { field: String },
    #[error("Embedded binding '{prefix}' must end on an association or an embedded property")]
    EmbeddedOnValue { prefix: String },
    #[error("Embedding cycle without max depth: {cycle}")]
    CyclicEmbedding { cycle: String },
    #[error("Duplicate document field '{0}'")]
    DuplicateField(String),
}

/// One mapping problem, located by type and path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapFailure {
    pub type_name: String,
    pub path: Option<String>,
    pub kind: BootstrapFailureKind,
}

impl BootstrapFailure {
    pub fn new(type_name: impl Into<String>, path: Option<String>, kind: BootstrapFailureKind) -> Self {
        Self {
            type_name: type_name.into(),
            path,
            kind,
        }
    }
}

impl fmt::Display for BootstrapFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "type '{}', path '{}': {}", self.type_name, path, self.kind),
            None => write!(f, "type '{}': {}", self.type_name, self.kind),
        }
    }
}

fn render_failures(failures: &[BootstrapFailure]) -> String {
    failures.iter().map(|f| format!("\n  - {f}")).collect()
}

/// Every problem found while bootstrapping a mapping. Nothing starts if this
/// is returned.
#[derive(Error, Debug, Clone)]
#[error("Mapping bootstrap failed with {} error(s):{}", .failures.len(), render_failures(.failures))]
pub struct BootstrapError {
    pub failures: Vec<BootstrapFailure>,
}

impl BootstrapError {
    /// Ok when nothing was collected.
    pub fn check(failures: Vec<BootstrapFailure>) -> Result<(), BootstrapError> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(BootstrapError { failures })
        }
    }
}

#[derive(Error, Debug)]
pub enum IndexingError {
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("Indexing failed for {} entities (first: {})", .0.failures.len(), .0.first_failure_message())]
    Failed(Box<ExecutionReport>),
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl IndexingError {
    /// The report attached to an [`IndexingError::Failed`].
    pub fn report(&self) -> Option<&ExecutionReport> {
        match self {
            Self::Failed(report) => Some(report),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_error_lists_every_failure() {
        let err = BootstrapError {
            failures: vec![
                BootstrapFailure::new(
                    "Book",
                    Some("author.name".into()),
                    BootstrapFailureKind::MissingInverseSide { association: "author".into() },
                ),
                BootstrapFailure::new("Tag", None, BootstrapFailureKind::DuplicateField("name".into())),
            ],
        };
        let text = err.to_string();
        assert!(text.starts_with("Mapping bootstrap failed with 2 error(s):"));
        assert!(text.contains("type 'Book', path 'author.name'"));
        assert!(text.contains("Duplicate document field 'name'"));
    }

    #[test]
    fn test_check_empty_is_ok() {
        assert!(BootstrapError::check(vec![]).is_ok());
    }
}
