// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use crate::model::EntityReference;
use std::collections::BTreeSet;
use std::fmt;

/// Where in the pipeline an entity failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureStage {
    Resolution,
    Derivation,
    Backend,
    Timeout,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Resolution => "resolution",
            Self::Derivation => "derivation",
            Self::Backend => "backend",
            Self::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityFailure {
    pub entity: EntityReference,
    pub stage: FailureStage,
    pub message: String,
}

impl EntityFailure {
    pub fn new(entity: EntityReference, stage: FailureStage, message: impl Into<String>) -> Self {
        Self {
            entity,
            stage,
            message: message.into(),
        }
    }
}

/// Outcome of executing one plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Entities whose works were all applied.
    pub succeeded: usize,
    /// Entities that needed no work (dirty checking, cancelled operations).
    pub skipped: usize,
    pub failures: Vec<EntityFailure>,
    /// Set when the whole batch failed (retries exhausted, timeout).
    pub batch_failure: Option<String>,
}

impl ExecutionReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.batch_failure.is_none()
    }

    pub fn failed_entities(&self) -> BTreeSet<EntityReference> {
        self.failures.iter().map(|f| f.entity.clone()).collect()
    }

    pub fn failure_for(&self, entity: &EntityReference) -> Option<&EntityFailure> {
        self.failures.iter().find(|f| &f.entity == entity)
    }

    pub fn merge(&mut self, other: ExecutionReport) {
        self.succeeded += other.succeeded;
        self.skipped += other.skipped;
        self.failures.extend(other.failures);
        if self.batch_failure.is_none() {
            self.batch_failure = other.batch_failure;
        }
    }

    pub fn first_failure_message(&self) -> String {
        match (self.failures.first(), &self.batch_failure) {
            (Some(failure), _) => format!("{} at {}: {}", failure.entity, failure.stage, failure.message),
            (None, Some(batch)) => batch.clone(),
            (None, None) => "none".to_string(),
        }
    }
}
