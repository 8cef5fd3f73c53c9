// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background agent applying outbox events.
//!
//! Each loop iteration pulses (membership, shard negotiation) when due, then
//! polls the owned hash range while RUNNING. Claimed events are replayed into
//! a fresh plan and executed through the serial orchestrator; the report
//! decides which events are deleted and which are retried.
//!
//! Claims are only as good as the agent row behind them: once the row
//! expires, another agent releases and retakes the events. A batch is
//! therefore only started with enough lease left, the lease is renewed while
//! the batch runs, and settling only touches events still claimed by this
//! agent.

use super::agent::{negotiate, AgentRecord, AgentState, AgentType, ShardAssignment};
use super::event::{now_millis, OutboxEvent};
use super::payload;
use crate::config::IndexSyncConfig;
use crate::context::MappingContext;
use crate::error::IndexingError;
use crate::metrics;
use crate::model::EntityReference;
use crate::orchestration::{DocumentRefreshStrategy, WorkOptions, WorkOrchestrator};
use crate::plan::IndexingPlan;
use crate::storage::traits::{AgentRepository, OutboxStore, StorageError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// How the processor obtains its shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardingMode {
    /// Negotiated with the other agents on every pulse.
    Dynamic,
    /// Fixed by configuration; negotiation is skipped.
    Static(ShardAssignment),
    /// Membership heartbeat only; never processes events.
    Pulsar,
}

pub struct OutboxEventProcessor {
    name: String,
    context: Arc<MappingContext>,
    store: Arc<dyn OutboxStore>,
    agents: Arc<dyn AgentRepository>,
    orchestrator: WorkOrchestrator,
    config: IndexSyncConfig,
    mode: ShardingMode,
    agent_id: Option<String>,
    state: AgentState,
    assignment: Option<ShardAssignment>,
    /// Own agent row as last written; its expiration is the lease.
    lease: Option<AgentRecord>,
}

impl OutboxEventProcessor {
    pub fn new(
        name: impl Into<String>,
        context: Arc<MappingContext>,
        store: Arc<dyn OutboxStore>,
        agents: Arc<dyn AgentRepository>,
        orchestrator: WorkOrchestrator,
        config: IndexSyncConfig,
        mode: ShardingMode,
    ) -> Self {
        Self {
            name: name.into(),
            context,
            store,
            agents,
            orchestrator,
            config,
            mode,
            agent_id: None,
            state: AgentState::Suspended,
            assignment: None,
            lease: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the agent row, once registered.
    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn assignment(&self) -> Option<ShardAssignment> {
        self.assignment
    }

    pub fn is_running(&self) -> bool {
        self.state == AgentState::Running
    }

    /// When other agents will consider this one gone, unless renewed.
    pub fn lease_expires_at(&self) -> Option<i64> {
        self.lease.as_ref().map(|own| own.expiration)
    }

    /// Lease a healthy agent always keeps in hand. Renewals happen every
    /// pulse interval, so half of the remaining slack is left as headroom.
    fn lease_margin_ms(&self) -> i64 {
        (self.config.agent_pulse_expiration_ms.saturating_sub(self.config.agent_pulse_interval_ms) / 2) as i64
    }

    fn lease_lapsing(&self, lease: &AgentRecord, now_ms: i64) -> bool {
        now_ms >= lease.expiration - self.lease_margin_ms()
    }

    /// Push the own row's expiration forward. `Ok(false)` means the row is
    /// gone or was rewritten elsewhere: the lease is lost.
    async fn renew_lease(
        agents: &dyn AgentRepository,
        lease: &mut AgentRecord,
        expiration_ms: i64,
    ) -> Result<bool, StorageError> {
        let mut renewed = lease.clone();
        renewed.expiration = now_millis() + expiration_ms;
        if !agents.update_agent(&renewed).await? {
            return Ok(false);
        }
        renewed.version += 1;
        *lease = renewed;
        Ok(true)
    }

    fn agent_type(&self) -> AgentType {
        match self.mode {
            ShardingMode::Pulsar => AgentType::Pulsar,
            _ => AgentType::EventProcessing,
        }
    }

    fn suspend(&mut self) {
        if self.state == AgentState::Running {
            warn!(agent = %self.name, "Suspending outbox agent");
        }
        self.state = AgentState::Suspended;
        metrics::set_agent_running(&self.name, false);
    }

    /// Insert this node's agent row.
    pub async fn register(&mut self) -> Result<(), StorageError> {
        let mut record = AgentRecord::new(
            self.name.clone(),
            self.agent_type(),
            now_millis(),
            self.config.agent_pulse_expiration_ms as i64,
        );
        if let ShardingMode::Static(assignment) = self.mode {
            record.set_assignment(Some(assignment));
        }
        self.agents.insert_agent(&record).await?;
        info!(agent = %self.name, agent_id = %record.id, agent_type = record.agent_type.as_str(), "Outbox agent registered");
        self.agent_id = Some(record.id);
        Ok(())
    }

    /// Refresh membership and renegotiate the shard. Any failure suspends
    /// the agent until a later pulse succeeds.
    pub async fn pulse(&mut self) -> AgentState {
        match self.try_pulse().await {
            Ok(state) => state,
            Err(e) => {
                warn!(agent = %self.name, error = %e, "Pulse failed");
                self.suspend();
                self.state
            }
        }
    }

    async fn try_pulse(&mut self) -> Result<AgentState, StorageError> {
        if self.agent_id.is_none() {
            self.register().await?;
        }
        self.pulse_registered().await
    }

    async fn pulse_registered(&mut self) -> Result<AgentState, StorageError> {
        let own_id = self.agent_id.clone().ok_or(StorageError::NotFound)?;
        let now = now_millis();
        let agents = self.agents.list_agents().await?;

        let Some(mut own) = agents.iter().find(|a| a.id == own_id).cloned() else {
            // Others considered us dead and removed the row.
            warn!(agent = %self.name, "Own agent row is gone, registering again");
            self.suspend();
            self.agent_id = None;
            self.lease = None;
            self.register().await?;
            return Ok(self.state);
        };

        let view = negotiate(&own_id, &agents, now);
        if !view.expired.is_empty() {
            let removed = self.agents.delete_agents(&view.expired).await?;
            info!(agent = %self.name, removed, "Removed expired agents");
        }
        let released = self.store.release_claims().await?;
        if released > 0 {
            info!(agent = %self.name, released, "Released events claimed by departed agents");
        }

        let (target, state) = match self.mode {
            ShardingMode::Pulsar => (None, AgentState::Running),
            ShardingMode::Static(assignment) => (Some(assignment), AgentState::Running),
            ShardingMode::Dynamic => {
                let state = if view.consistent && view.target.is_some() {
                    AgentState::Running
                } else {
                    AgentState::Suspended
                };
                (view.target, state)
            }
        };

        own.expiration = now + self.config.agent_pulse_expiration_ms as i64;
        own.state = state;
        own.set_assignment(target);
        if !self.agents.update_agent(&own).await? {
            return Err(StorageError::Conflict(format!("agent row {own_id} changed concurrently")));
        }
        own.version += 1;
        self.lease = Some(own);

        if target != self.assignment {
            if let Some(assignment) = target {
                info!(agent = %self.name, shard = %assignment, "Shard assignment changed");
                metrics::record_shard_assignment(assignment.total);
            }
            self.assignment = target;
        }
        match state {
            AgentState::Running => {
                if self.state != AgentState::Running {
                    info!(agent = %self.name, "Outbox agent running");
                }
                self.state = AgentState::Running;
                metrics::set_agent_running(&self.name, true);
            }
            AgentState::Suspended => {
                debug!(agent = %self.name, "Waiting for other agents to adopt the new shard layout");
                self.suspend();
            }
        }
        Ok(self.state)
    }

    /// Claim and apply one batch of due events. Returns how many were claimed.
    pub async fn poll_once(&mut self) -> Result<usize, IndexingError> {
        if self.state != AgentState::Running || self.mode == ShardingMode::Pulsar {
            return Ok(0);
        }
        let (Some(assignment), Some(processor_id), Some(mut lease)) =
            (self.assignment, self.agent_id.clone(), self.lease.clone())
        else {
            return Ok(0);
        };
        if self.lease_lapsing(&lease, now_millis()) {
            debug!(agent = %self.name, "Lease about to lapse, waiting for the next pulse");
            return Ok(0);
        }

        let candidates = self
            .store
            .find_pending(assignment.range(), now_millis(), self.config.outbox_batch_size)
            .await?;
        let mut claimed = Vec::with_capacity(candidates.len());
        for event in candidates {
            if self.store.claim(&event, &processor_id).await? {
                claimed.push(event);
            } else {
                trace!(event_id = %event.id, "Event claimed by another agent");
            }
        }
        if claimed.is_empty() {
            return Ok(0);
        }
        if self.lease_lapsing(&lease, now_millis()) {
            warn!(agent = %self.name, events = claimed.len(), "Lease lapsed while claiming, handing events back");
            self.hand_back(&processor_id, &claimed).await?;
            return Ok(0);
        }
        let count = claimed.len();
        debug!(agent = %self.name, events = count, "Processing outbox events");

        let mut plan = IndexingPlan::new(Arc::clone(&self.context));
        let mut undecodable: HashMap<String, String> = HashMap::new();
        for event in &claimed {
            match payload::decode(&event.payload) {
                Ok(decoded) => plan.apply_event(event.entity(), decoded),
                Err(e) => {
                    undecodable.insert(event.id.clone(), e.to_string());
                }
            }
        }

        let options = WorkOptions::new(self.config.outbox_commit_strategy, DocumentRefreshStrategy::None);
        let expiration_ms = self.config.agent_pulse_expiration_ms as i64;
        let renew_every = Duration::from_millis(self.config.agent_pulse_interval_ms);
        let mut lease_lost = false;
        let outcome = {
            let execution = plan.execute_and_report(&self.orchestrator, options);
            tokio::pin!(execution);
            let mut renew = tokio::time::interval_at(Instant::now() + renew_every, renew_every);
            loop {
                tokio::select! {
                    outcome = &mut execution => break outcome,
                    _ = renew.tick(), if !lease_lost => {
                        match Self::renew_lease(self.agents.as_ref(), &mut lease, expiration_ms).await {
                            Ok(true) => trace!(agent = %self.name, expires_at = lease.expiration, "Lease renewed"),
                            Ok(false) => lease_lost = true,
                            Err(e) => {
                                warn!(agent = %self.name, error = %e, "Lease renewal failed");
                                lease_lost = self.lease_lapsing(&lease, now_millis());
                            }
                        }
                    }
                }
            }
        };
        self.lease = Some(lease);

        let report = match outcome {
            Ok(report) => report,
            Err(e) => {
                // Hand the events back untouched: nothing was attempted.
                self.hand_back(&processor_id, &claimed).await?;
                return Err(e);
            }
        };

        let failed: HashMap<EntityReference, String> = report
            .failures
            .iter()
            .map(|f| (f.entity.clone(), format!("{}: {}", f.stage, f.message)))
            .collect();

        // Settling is conditional on the claim, so events another agent
        // took over in the meantime are left to it.
        let mut done = Vec::with_capacity(count);
        for event in claimed {
            let error = undecodable
                .get(&event.id)
                .or_else(|| failed.get(&event.entity()))
                .cloned();
            match error {
                Some(error) => self.retry_or_fail(&processor_id, event, &error).await?,
                None => done.push(event.id),
            }
        }
        if !done.is_empty() {
            let deleted = self.store.delete(&processor_id, &done).await?;
            metrics::record_outbox_events("processed", deleted as usize);
            if (deleted as usize) < done.len() {
                warn!(
                    agent = %self.name,
                    reclaimed = done.len() - deleted as usize,
                    "Events were reclaimed by another agent before settling"
                );
            }
        }
        if lease_lost {
            warn!(agent = %self.name, "Lease lost during batch");
            self.lease = None;
            self.suspend();
        }
        Ok(count)
    }

    /// Release claimed events with their retry state unchanged.
    async fn hand_back(&self, processor_id: &str, claimed: &[OutboxEvent]) -> Result<(), StorageError> {
        for event in claimed {
            self.store
                .reschedule(processor_id, &event.id, event.retries, event.process_after)
                .await?;
        }
        Ok(())
    }

    /// Reschedule with backoff, or give up once the retry ceiling is passed.
    async fn retry_or_fail(&self, processor_id: &str, mut event: OutboxEvent, error: &str) -> Result<(), StorageError> {
        let retries = event.retries + 1;
        if retries > i64::from(self.config.outbox_max_retries) {
            if !self.store.mark_failed(processor_id, &event.id, retries).await? {
                debug!(event_id = %event.id, "Event reclaimed before it could be marked failed");
                return Ok(());
            }
            event.retries = retries;
            error!(event_id = %event.id, entity = %event.entity(), retries, error = %error, "Outbox event failed permanently");
            metrics::record_outbox_events("failed", 1);
            self.context.failure_handler().handle_event_failure(&event, error);
        } else {
            let delay = self.config.outbox_retry_delay(u32::try_from(retries).unwrap_or(u32::MAX));
            let process_after = now_millis() + delay.as_millis() as i64;
            warn!(
                event_id = %event.id,
                entity = %event.entity(),
                retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Outbox event failed, retrying later"
            );
            if !self.store.reschedule(processor_id, &event.id, retries, process_after).await? {
                debug!(event_id = %event.id, "Event reclaimed before it could be rescheduled");
                return Ok(());
            }
            metrics::record_outbox_events("retried", 1);
        }
        Ok(())
    }

    /// Remove this agent's row.
    pub async fn unregister(&mut self) {
        self.state = AgentState::Suspended;
        metrics::set_agent_running(&self.name, false);
        self.lease = None;
        if let Some(id) = self.agent_id.take() {
            if let Err(e) = self.agents.delete_agents(&[id]).await {
                warn!(agent = %self.name, error = %e, "Failed to remove agent row");
            }
        }
        info!(agent = %self.name, "Outbox agent stopped");
    }

    /// Pulse and poll until `shutdown` turns true or its sender is dropped.
    /// `wake` short-circuits the polling interval.
    #[tracing::instrument(skip_all, fields(agent = %self.name))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>, wake: Arc<Notify>) {
        let pulse_every = Duration::from_millis(self.config.agent_pulse_interval_ms);
        let poll_every = Duration::from_millis(self.config.outbox_polling_interval_ms);
        let mut next_pulse = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }
            if Instant::now() >= next_pulse {
                self.pulse().await;
                next_pulse = Instant::now() + pulse_every;
            }

            let claimed = match self.poll_once().await {
                Ok(claimed) => claimed,
                Err(e) => {
                    self.context
                        .failure_handler()
                        .handle_generic("outbox event processing", &e.to_string());
                    0
                }
            };
            if claimed > 0 {
                continue;
            }

            let idle = poll_every.min(next_pulse.saturating_duration_since(Instant::now()));
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = wake.notified() => {}
                _ = tokio::time::sleep(idle) => {}
            }
        }

        self.unregister().await;
    }
}

impl std::fmt::Debug for OutboxEventProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxEventProcessor")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("assignment", &self.assignment)
            .finish()
    }
}
