// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Index works and the orchestrators that apply them.

pub mod orchestrator;
pub mod work;

pub use orchestrator::{Discipline, OrchestratorConfig, OrchestratorError, WorkFuture, WorkOrchestrator};
pub use work::{
    DocumentCommitStrategy, DocumentRefreshStrategy, IndexWork, OperationSubmitter, WorkKind, WorkOptions,
};
