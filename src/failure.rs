// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failures nobody is waiting for.
//!
//! Fire-and-forget executions, background agents and poison events have no
//! caller to return an error to. They report to a [`FailureHandler`].

use crate::outbox::OutboxEvent;
use crate::plan::EntityFailure;
use tracing::error;

pub trait FailureHandler: Send + Sync {
    fn handle_entity_failure(&self, failure: &EntityFailure);

    /// An outbox event reached its retry ceiling and is now FAILED.
    fn handle_event_failure(&self, event: &OutboxEvent, error: &str);

    fn handle_generic(&self, context: &str, error: &str);
}

/// Default handler: logs at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFailureHandler;

impl FailureHandler for LoggingFailureHandler {
    fn handle_entity_failure(&self, failure: &EntityFailure) {
        error!(
            entity = %failure.entity,
            stage = %failure.stage,
            error = %failure.message,
            "Indexing failed for entity"
        );
    }

    fn handle_event_failure(&self, event: &OutboxEvent, error: &str) {
        error!(
            event_id = %event.id,
            entity = %event.entity(),
            retries = event.retries,
            error = %error,
            "Outbox event abandoned after max retries"
        );
    }

    fn handle_generic(&self, context: &str, error: &str) {
        error!(context = %context, error = %error, "Background indexing failure");
    }
}
