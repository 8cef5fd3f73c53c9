// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Queue-backed executors in front of the index backend.
//!
//! Every write funnels through a bounded queue drained by one worker task. A
//! worker takes up to `batch_size` queued work sets at once, applies them in
//! order (contiguous works on the same index share one backend call), then
//! commits and refreshes whatever indexes the batch asked for, and replies to
//! each work set. One batch is in flight per worker.
//!
//! - **Serial**: a single queue. Global submission order is preserved.
//! - **Parallel**: one queue per (index, shard), with works spread by a hash
//!   of the document id. Order is preserved per document.

use super::work::{DocumentCommitStrategy, DocumentRefreshStrategy, IndexWork, OperationSubmitter, WorkOptions};
use crate::backpressure::BackpressureLevel;
use crate::config::IndexSyncConfig;
use crate::metrics::{self, LatencyTimer};
use crate::resilience::retry::{retry_if, RetryConfig};
use crate::storage::traits::{BackendError, IndexBackend, WorkResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("Queue '{index}' is full (capacity {capacity})")]
    Rejected { index: String, capacity: usize },
    #[error("Timed out after {0:?} waiting for indexing works")]
    Timeout(Duration),
    #[error("Orchestrator is stopped")]
    Stopped,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Work sets per queue.
    pub queue_capacity: usize,
    /// Work sets drained per worker round.
    pub batch_size: usize,
    pub retry: RetryConfig,
}

impl OrchestratorConfig {
    pub fn from_config(config: &IndexSyncConfig) -> Self {
        Self {
            queue_capacity: config.orchestrator_queue_capacity,
            batch_size: config.orchestrator_batch_size,
            retry: config.backend_retry(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_config(&IndexSyncConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    Serial,
    Parallel { shards: usize },
}

type Reply = Result<Vec<WorkResult>, OrchestratorError>;

struct WorkSet {
    works: Vec<IndexWork>,
    /// Indexes to commit/refresh even if no work touches them.
    flush: Vec<String>,
    options: WorkOptions,
    reply: oneshot::Sender<Reply>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct QueueKey {
    index: Option<String>,
    shard: usize,
}

impl QueueKey {
    fn label(&self) -> String {
        match &self.index {
            Some(index) => format!("{index}#{}", self.shard),
            None => "serial".to_string(),
        }
    }
}

/// Handle on a set of submitted works. Dropping it abandons the wait only.
#[must_use = "dropping a WorkFuture stops waiting but does not cancel the works"]
pub struct WorkFuture {
    total: usize,
    pending: Vec<(Vec<usize>, oneshot::Receiver<Reply>)>,
}

impl WorkFuture {
    fn ready() -> Self {
        Self {
            total: 0,
            pending: Vec::new(),
        }
    }

    /// One result per submitted work, in submission order.
    pub async fn wait(self) -> Result<Vec<WorkResult>, OrchestratorError> {
        let mut results: Vec<Option<WorkResult>> = vec![None; self.total];
        for (positions, rx) in self.pending {
            let reply = rx.await.map_err(|_| OrchestratorError::Stopped)??;
            for (position, result) in positions.into_iter().zip(reply) {
                results[position] = Some(result);
            }
        }
        Ok(results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err("no result reported for work".to_string())))
            .collect())
    }

    pub async fn wait_timeout(self, timeout: Duration) -> Result<Vec<WorkResult>, OrchestratorError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| OrchestratorError::Timeout(timeout))?
    }
}

#[derive(Clone)]
pub struct WorkOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    backend: Arc<dyn IndexBackend>,
    config: OrchestratorConfig,
    discipline: Discipline,
    queues: DashMap<QueueKey, mpsc::Sender<WorkSet>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    depth: Arc<AtomicUsize>,
    stopped: AtomicBool,
}

impl WorkOrchestrator {
    pub fn serial(name: impl Into<String>, backend: Arc<dyn IndexBackend>, config: OrchestratorConfig) -> Self {
        Self::new(name.into(), backend, config, Discipline::Serial)
    }

    pub fn parallel(
        name: impl Into<String>,
        backend: Arc<dyn IndexBackend>,
        config: OrchestratorConfig,
        shards: usize,
    ) -> Self {
        Self::new(
            name.into(),
            backend,
            config,
            Discipline::Parallel { shards: shards.max(1) },
        )
    }

    fn new(name: String, backend: Arc<dyn IndexBackend>, config: OrchestratorConfig, discipline: Discipline) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                backend,
                config,
                discipline,
                queues: DashMap::new(),
                workers: Mutex::new(Vec::new()),
                depth: Arc::new(AtomicUsize::new(0)),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn discipline(&self) -> Discipline {
        self.inner.discipline
    }

    /// Work sets queued and not yet picked up by a worker.
    pub fn queue_depth(&self) -> usize {
        self.inner.depth.load(Ordering::Acquire)
    }

    pub fn backpressure(&self) -> BackpressureLevel {
        let queues = self.inner.queues.len().max(1);
        BackpressureLevel::from_queue(self.queue_depth(), self.inner.config.queue_capacity * queues)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    fn queue_key(&self, work: &IndexWork) -> QueueKey {
        match self.inner.discipline {
            Discipline::Serial => QueueKey { index: None, shard: 0 },
            Discipline::Parallel { shards } => {
                let mut hasher = DefaultHasher::new();
                work.document_id.hash(&mut hasher);
                QueueKey {
                    index: Some(work.index.clone()),
                    shard: (hasher.finish() % shards as u64) as usize,
                }
            }
        }
    }

    fn sender(&self, key: &QueueKey) -> Result<mpsc::Sender<WorkSet>, OrchestratorError> {
        if self.is_stopped() {
            return Err(OrchestratorError::Stopped);
        }
        match self.inner.queues.entry(key.clone()) {
            Entry::Occupied(queue) => Ok(queue.get().clone()),
            Entry::Vacant(slot) => {
                // `stop` clears the queues after raising the flag, and has to
                // wait for this shard lock to do so: a worker spawned here is
                // registered before `stop` collects the handles.
                if self.is_stopped() {
                    return Err(OrchestratorError::Stopped);
                }
                Ok(slot.insert(self.spawn_worker(key)).clone())
            }
        }
    }

    fn spawn_worker(&self, key: &QueueKey) -> mpsc::Sender<WorkSet> {
        let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity.max(1));
        let worker = Worker {
            orchestrator: self.inner.name.clone(),
            queue: key.label(),
            backend: Arc::clone(&self.inner.backend),
            retry: self.inner.config.retry.clone(),
            batch_size: self.inner.config.batch_size.max(1),
            depth: Arc::clone(&self.inner.depth),
        };
        debug!(orchestrator = %self.inner.name, queue = %worker.queue, "Spawning orchestrator worker");
        let handle = tokio::spawn(worker.run(rx));
        self.inner.workers.lock().push(handle);
        tx
    }

    /// Room for one work set on `sender`, waiting or failing fast as the
    /// submitter asks.
    async fn reserve<'a>(
        &self,
        key: &QueueKey,
        sender: &'a mpsc::Sender<WorkSet>,
        submitter: OperationSubmitter,
    ) -> Result<mpsc::Permit<'a, WorkSet>, OrchestratorError> {
        match submitter {
            OperationSubmitter::Blocking => sender.reserve().await.map_err(|_| OrchestratorError::Stopped),
            OperationSubmitter::Rejecting => sender.try_reserve().map_err(|e| match e {
                TrySendError::Full(()) => {
                    metrics::record_rejected(&self.inner.name);
                    OrchestratorError::Rejected {
                        index: key.label(),
                        capacity: self.inner.config.queue_capacity,
                    }
                }
                TrySendError::Closed(()) => OrchestratorError::Stopped,
            }),
        }
    }

    fn send(&self, permit: mpsc::Permit<'_, WorkSet>, set: WorkSet) {
        // Counted before the worker can see it.
        self.inner.depth.fetch_add(1, Ordering::AcqRel);
        permit.send(set);
    }

    fn record_depth(&self) {
        metrics::set_queue_depth(&self.inner.name, self.queue_depth());
        metrics::set_backpressure_level(&self.inner.name, self.backpressure() as u8);
    }

    async fn enqueue(&self, key: &QueueKey, set: WorkSet) -> Result<(), OrchestratorError> {
        let sender = self.sender(key)?;
        let permit = self.reserve(key, &sender, set.options.submitter).await?;
        self.send(permit, set);
        self.record_depth();
        Ok(())
    }

    /// Queue `works`. Returns once every work is accepted by its queue.
    ///
    /// Room is reserved on every queue involved before anything is sent, so
    /// a rejected submission leaves nothing behind.
    pub async fn submit(&self, works: Vec<IndexWork>, options: WorkOptions) -> Result<WorkFuture, OrchestratorError> {
        if self.is_stopped() {
            return Err(OrchestratorError::Stopped);
        }
        if works.is_empty() {
            return Ok(WorkFuture::ready());
        }

        let total = works.len();
        let mut groups: Vec<(QueueKey, Vec<usize>, Vec<IndexWork>)> = Vec::new();
        for (position, work) in works.into_iter().enumerate() {
            let key = self.queue_key(&work);
            match groups.iter_mut().find(|(k, _, _)| *k == key) {
                Some((_, positions, group)) => {
                    positions.push(position);
                    group.push(work);
                }
                None => groups.push((key, vec![position], vec![work])),
            }
        }

        let senders = groups
            .iter()
            .map(|(key, _, _)| self.sender(key))
            .collect::<Result<Vec<_>, _>>()?;
        let mut permits = Vec::with_capacity(senders.len());
        for ((key, _, _), sender) in groups.iter().zip(&senders) {
            permits.push(self.reserve(key, sender, options.submitter).await?);
        }

        let mut pending = Vec::with_capacity(groups.len());
        for ((_, positions, group), permit) in groups.into_iter().zip(permits) {
            let (tx, rx) = oneshot::channel();
            let set = WorkSet {
                works: group,
                flush: Vec::new(),
                options,
                reply: tx,
            };
            self.send(permit, set);
            pending.push((positions, rx));
        }
        self.record_depth();

        metrics::record_works_submitted(&self.inner.name, total);
        Ok(WorkFuture { total, pending })
    }

    /// Commit and refresh `index` once everything queued before is applied.
    pub async fn flush(&self, index: &str) -> Result<(), OrchestratorError> {
        let keys: Vec<QueueKey> = match self.inner.discipline {
            Discipline::Serial => vec![QueueKey { index: None, shard: 0 }],
            Discipline::Parallel { .. } => {
                let mut keys: Vec<QueueKey> = self
                    .inner
                    .queues
                    .iter()
                    .filter(|q| q.key().index.as_deref() == Some(index))
                    .map(|q| q.key().clone())
                    .collect();
                if keys.is_empty() {
                    keys.push(QueueKey {
                        index: Some(index.to_string()),
                        shard: 0,
                    });
                }
                keys
            }
        };

        let mut receivers = Vec::with_capacity(keys.len());
        for key in keys {
            let (tx, rx) = oneshot::channel();
            let set = WorkSet {
                works: Vec::new(),
                flush: vec![index.to_string()],
                options: WorkOptions::new(DocumentCommitStrategy::Force, DocumentRefreshStrategy::Force),
                reply: tx,
            };
            self.enqueue(&key, set).await?;
            receivers.push(rx);
        }
        for reply in futures::future::join_all(receivers).await {
            reply.map_err(|_| OrchestratorError::Stopped)??;
        }
        Ok(())
    }

    /// Close the queues and wait for workers to drain them. Later
    /// submissions fail with [`OrchestratorError::Stopped`].
    #[tracing::instrument(skip(self), fields(orchestrator = %self.inner.name))]
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.queues.clear();
        let handles = std::mem::take(&mut *self.inner.workers.lock());
        let workers = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Orchestrator worker ended abnormally");
            }
        }
        info!(workers, "Orchestrator stopped");
    }
}

struct Worker {
    orchestrator: String,
    queue: String,
    backend: Arc<dyn IndexBackend>,
    retry: RetryConfig,
    batch_size: usize,
    depth: Arc<AtomicUsize>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<WorkSet>) {
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            while batch.len() < self.batch_size {
                match rx.try_recv() {
                    Ok(set) => batch.push(set),
                    Err(_) => break,
                }
            }
            let remaining = self
                .depth
                .fetch_sub(batch.len(), Ordering::AcqRel)
                .saturating_sub(batch.len());
            metrics::set_queue_depth(&self.orchestrator, remaining);
            metrics::record_batch_size(&self.orchestrator, batch.len());
            self.process(batch).await;
        }
        debug!(orchestrator = %self.orchestrator, queue = %self.queue, "Orchestrator worker drained");
    }

    async fn process(&self, batch: Vec<WorkSet>) {
        let mut works: Vec<IndexWork> = Vec::new();
        let mut owners: Vec<usize> = Vec::new();
        let mut replies = Vec::with_capacity(batch.len());
        let mut touched: Vec<BTreeSet<String>> = Vec::with_capacity(batch.len());
        let mut options = Vec::with_capacity(batch.len());

        for (i, set) in batch.into_iter().enumerate() {
            let mut indexes: BTreeSet<String> = set.works.iter().map(|w| w.index.clone()).collect();
            indexes.extend(set.flush);
            touched.push(indexes);
            options.push(set.options);
            owners.extend(std::iter::repeat(i).take(set.works.len()));
            works.extend(set.works);
            replies.push(set.reply);
        }

        let mut results: Vec<Vec<WorkResult>> = vec![Vec::new(); replies.len()];
        if let Err(e) = self.execute(&works, &owners, &mut results).await {
            error!(
                orchestrator = %self.orchestrator,
                works = works.len(),
                error = %e,
                "Indexing batch failed"
            );
            for reply in replies {
                let _ = reply.send(Err(OrchestratorError::Backend(e.clone())));
            }
            return;
        }

        let mut errors: Vec<Option<OrchestratorError>> = vec![None; replies.len()];

        let to_commit = requested(&touched, &options, |o| o.commit == DocumentCommitStrategy::Force);
        for index in &to_commit {
            let _timer = LatencyTimer::new(&self.orchestrator, "commit");
            let outcome = retry_if(
                &format!("commit {index}"),
                &self.retry,
                || self.backend.commit(index),
                BackendError::is_transient,
            )
            .await;
            if let Err(e) = outcome {
                error!(orchestrator = %self.orchestrator, index = %index, error = %e, "Commit failed");
                fail_requesters(&mut errors, &touched, &options, index, &e, |o| {
                    o.commit == DocumentCommitStrategy::Force
                });
            }
        }

        let to_refresh = requested(&touched, &options, |o| o.refresh == DocumentRefreshStrategy::Force);
        for index in &to_refresh {
            let _timer = LatencyTimer::new(&self.orchestrator, "refresh");
            let outcome = retry_if(
                &format!("refresh {index}"),
                &self.retry,
                || self.backend.refresh(index),
                BackendError::is_transient,
            )
            .await;
            if let Err(e) = outcome {
                error!(orchestrator = %self.orchestrator, index = %index, error = %e, "Refresh failed");
                fail_requesters(&mut errors, &touched, &options, index, &e, |o| {
                    o.refresh == DocumentRefreshStrategy::Force
                });
            }
        }

        for ((reply, result), error) in replies.into_iter().zip(results).zip(errors) {
            let _ = reply.send(match error {
                Some(e) => Err(e),
                None => Ok(result),
            });
        }
    }

    /// Apply `works` in order, one backend call per run of the same index.
    async fn execute(
        &self,
        works: &[IndexWork],
        owners: &[usize],
        results: &mut [Vec<WorkResult>],
    ) -> Result<(), BackendError> {
        let mut start = 0;
        while start < works.len() {
            let index = works[start].index.as_str();
            let end = works[start..]
                .iter()
                .position(|w| w.index != index)
                .map_or(works.len(), |n| start + n);
            let run = &works[start..end];

            let outcome = {
                let _timer = LatencyTimer::new(&self.orchestrator, "execute");
                retry_if(
                    &format!("execute {index}"),
                    &self.retry,
                    || self.backend.execute(index, run),
                    BackendError::is_transient,
                )
                .await?
            };
            if outcome.len() != run.len() {
                return Err(BackendError::Fatal(format!(
                    "backend returned {} results for {} works",
                    outcome.len(),
                    run.len()
                )));
            }

            let mut failed = 0;
            for (owner, result) in owners[start..end].iter().zip(outcome) {
                if let Err(reason) = &result {
                    failed += 1;
                    debug!(index = %index, error = %reason, "Document rejected by backend");
                }
                results[*owner].push(result);
            }
            if failed > 0 {
                metrics::record_works_failed(&self.orchestrator, index, failed);
            }
            debug!(index = %index, works = run.len(), failed, "Applied works");
            start = end;
        }
        Ok(())
    }
}

fn requested<F>(touched: &[BTreeSet<String>], options: &[WorkOptions], wants: F) -> BTreeSet<String>
where
    F: Fn(&WorkOptions) -> bool,
{
    touched
        .iter()
        .zip(options)
        .filter(|(_, o)| wants(o))
        .flat_map(|(indexes, _)| indexes.iter().cloned())
        .collect()
}

fn fail_requesters<F>(
    errors: &mut [Option<OrchestratorError>],
    touched: &[BTreeSet<String>],
    options: &[WorkOptions],
    index: &str,
    error: &BackendError,
    wants: F,
) where
    F: Fn(&WorkOptions) -> bool,
{
    for (i, (indexes, o)) in touched.iter().zip(options).enumerate() {
        if wants(o) && indexes.contains(index) && errors[i].is_none() {
            errors[i] = Some(OrchestratorError::Backend(error.clone()));
        }
    }
}
