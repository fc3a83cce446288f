//! Job manager: submission, worker pool, cancellation and retention
//!
//! Jobs live in the active table from submission until they reach a terminal
//! status, then move to the `ResultStore`. A fixed pool of workers pulls job
//! ids from a FIFO queue; each job is driven by exactly one worker, which is
//! the only writer of its status. Admission is bounded by the number of jobs
//! still waiting in `Queued`, so ids of jobs cancelled while queued do not
//! hold capacity.
//!
//! Cancellation is cooperative. Every job owns a `CancellationToken` that is
//! a child of the manager's shutdown token; user cancels, deadlines and
//! shutdown all fire it, and the worker observes it between stages, during
//! retry backoff, and through the executor itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use docmaker_common::{Config, Error, Pagination, Result};
use docmaker_stages::{Artifact, JobRequest, ProgressSink, StageContext, StageExecutors};

use crate::domain::entities::{CancelReason, Job, JobError, JobSnapshot};
use crate::domain::retry::{RetryDecision, RetryPolicy};
use crate::domain::state::JobStatus;
use crate::runner::{StageOutcome, StageRunner};
use crate::store::ResultStore;

/// Job manager tuning
#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
    pub stage_timeout: Option<Duration>,
    pub job_timeout: Option<Duration>,
    pub result_ttl: Duration,
    pub result_capacity: usize,
    pub purge_interval: Duration,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 256,
            retry: RetryPolicy::default(),
            stage_timeout: None,
            job_timeout: None,
            result_ttl: Duration::from_secs(3600),
            result_capacity: 1000,
            purge_interval: Duration::from_secs(60),
        }
    }
}

impl From<&Config> for JobManagerConfig {
    fn from(config: &Config) -> Self {
        Self {
            worker_count: config.worker_count,
            queue_capacity: config.queue_capacity,
            retry: RetryPolicy::from_config(config),
            stage_timeout: config.stage_timeout_secs.map(Duration::from_secs),
            job_timeout: config.job_timeout_secs.map(Duration::from_secs),
            result_ttl: Duration::from_secs(config.result_ttl_secs),
            result_capacity: config.result_capacity,
            purge_interval: Duration::from_secs(config.result_purge_interval_secs),
        }
    }
}

/// Answer to a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CancelAck {
    /// False when the job had already finished
    pub acknowledged: bool,
}

/// Active job plus its signals
struct JobSlot {
    job: Mutex<Job>,
    cancel: CancellationToken,
    updates: watch::Sender<JobSnapshot>,
    /// Still counted against the queue capacity
    queued: AtomicBool,
}

impl JobSlot {
    fn lock(&self) -> MutexGuard<'_, Job> {
        self.job.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate the job and publish the resulting snapshot
    fn update<R>(&self, f: impl FnOnce(&mut Job) -> R) -> R {
        let mut job = self.lock();
        let result = f(&mut job);
        self.updates.send_replace(job.snapshot());
        result
    }

    fn read<R>(&self, f: impl FnOnce(&Job) -> R) -> R {
        f(&self.lock())
    }

    /// Latest published snapshot, without touching the job lock
    fn snapshot(&self) -> JobSnapshot {
        self.updates.borrow().clone()
    }

    /// Record why the job should stop, then fire its token
    fn request_cancel(&self, reason: CancelReason) -> bool {
        let requested = self.update(|job| job.request_cancel(reason));
        self.cancel.cancel();
        requested
    }
}

/// How a worker's drive over the stage plan ended
enum Completion {
    Succeeded(Artifact),
    Failed(JobError),
    Cancelled,
    Aborted(Error),
}

struct Inner {
    config: JobManagerConfig,
    runner: StageRunner,
    active: RwLock<HashMap<Uuid, Arc<JobSlot>>>,
    results: ResultStore,
    queue: Mutex<Option<mpsc::UnboundedSender<Uuid>>>,
    /// Jobs admitted and not yet picked up or finished
    pending: AtomicUsize,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Owner of every job from submission to retention
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("config", &self.inner.config)
            .field("active", &self.inner.read_active().len())
            .field("retained", &self.inner.results.len())
            .finish()
    }
}

impl JobManager {
    /// Spawn the worker pool and the result reaper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: JobManagerConfig, executors: StageExecutors) -> Self {
        let worker_count = config.worker_count.max(1);
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let inner = Arc::new(Inner {
            runner: StageRunner::new(executors, config.stage_timeout),
            results: ResultStore::new(config.result_ttl, config.result_capacity),
            active: RwLock::new(HashMap::new()),
            queue: Mutex::new(Some(sender)),
            pending: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            config,
        });

        let mut tasks: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|worker| tokio::spawn(worker_loop(inner.clone(), worker, receiver.clone())))
            .collect();
        tasks.push(tokio::spawn(reaper_loop(inner.clone())));
        *lock(&inner.tasks) = tasks;

        tracing::info!(
            worker_count,
            queue_capacity = inner.config.queue_capacity,
            "Job manager started"
        );
        Self { inner }
    }

    /// Validate, plan and enqueue a job; returns without waiting for any work
    pub fn submit(&self, request: JobRequest) -> Result<Uuid> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::ServiceUnavailable(
                "Job manager is shutting down".to_string(),
            ));
        }

        let job = Job::new(request)?;
        let job_id = job.id();

        let capacity = self.inner.config.queue_capacity.max(1);
        let reserved = self
            .inner
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pending| {
                (pending < capacity).then_some(pending + 1)
            });
        if reserved.is_err() {
            tracing::warn!(job_id = %job_id, capacity, "Job rejected, queue is full");
            return Err(Error::RateLimit(format!(
                "Job queue is full ({} pending)",
                capacity
            )));
        }

        let (updates, _) = watch::channel(job.snapshot());
        let slot = Arc::new(JobSlot {
            job: Mutex::new(job),
            cancel: self.inner.shutdown.child_token(),
            updates,
            queued: AtomicBool::new(true),
        });

        // Visible before a worker can pick it up
        self.inner.write_active().insert(job_id, slot.clone());

        let sent = match lock(&self.inner.queue).as_ref() {
            Some(sender) => sender.send(job_id).map_err(|_| {
                Error::ServiceUnavailable("Job manager is shutting down".to_string())
            }),
            None => Err(Error::ServiceUnavailable(
                "Job manager is shutting down".to_string(),
            )),
        };

        if let Err(e) = sent {
            self.inner.write_active().remove(&job_id);
            self.inner.leave_queue(&slot);
            tracing::warn!(job_id = %job_id, error = %e, "Job rejected at enqueue");
            return Err(e);
        }

        tracing::info!(job_id = %job_id, "Job submitted");
        Ok(job_id)
    }

    /// Current snapshot of an active or retained job
    pub fn status(&self, job_id: Uuid) -> Result<JobSnapshot> {
        if let Some(slot) = self.inner.active_slot(job_id) {
            return Ok(slot.snapshot());
        }
        self.inner.results.get(job_id).ok_or_else(|| not_found(job_id))
    }

    /// Request cancellation.
    ///
    /// A queued job is cancelled immediately; a running one stops at its
    /// next cancellation check.
    pub fn cancel(&self, job_id: Uuid) -> Result<CancelAck> {
        let Some(slot) = self.inner.active_slot(job_id) else {
            return match self.inner.results.get(job_id) {
                Some(_) => Ok(CancelAck {
                    acknowledged: false,
                }),
                None => Err(not_found(job_id)),
            };
        };

        let acknowledged = slot.update(|job| match job.status() {
            JobStatus::Queued => job.cancel(CancelReason::User).map(|_| true),
            JobStatus::Running => {
                job.request_cancel(CancelReason::User);
                Ok(true)
            }
            _ => Ok(false),
        });

        match acknowledged {
            Ok(acknowledged) => {
                if acknowledged {
                    slot.cancel.cancel();
                    tracing::info!(job_id = %job_id, "Job cancel requested");
                }
                self.inner.retire_if_terminal(&slot);
                Ok(CancelAck { acknowledged })
            }
            Err(e) => {
                self.inner.abort(&slot, &e);
                Err(e)
            }
        }
    }

    /// Active and retained jobs, newest first
    pub fn list(&self, status: Option<JobStatus>, pagination: &Pagination) -> Vec<JobSnapshot> {
        let mut by_id: HashMap<Uuid, JobSnapshot> = self
            .inner
            .read_active()
            .values()
            .map(|slot| {
                let snapshot = slot.snapshot();
                (snapshot.job_id, snapshot)
            })
            .collect();
        // A job being retired may be in both; the stored copy is final
        for snapshot in self.inner.results.snapshots() {
            by_id.insert(snapshot.job_id, snapshot);
        }

        let mut snapshots: Vec<JobSnapshot> = by_id
            .into_values()
            .filter(|s| status.is_none_or(|wanted| s.status == wanted))
            .collect();
        snapshots.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        snapshots
            .into_iter()
            .skip(pagination.offset())
            .take(pagination.limit())
            .collect()
    }

    /// Receiver of every snapshot the job publishes from now on
    pub fn subscribe(&self, job_id: Uuid) -> Result<watch::Receiver<JobSnapshot>> {
        if let Some(slot) = self.inner.active_slot(job_id) {
            return Ok(slot.updates.subscribe());
        }
        let snapshot = self
            .inner
            .results
            .get(job_id)
            .ok_or_else(|| not_found(job_id))?;
        let (_, receiver) = watch::channel(snapshot);
        Ok(receiver)
    }

    /// Resolve once the job reaches a terminal status
    pub async fn wait(&self, job_id: Uuid) -> Result<JobSnapshot> {
        let mut updates = self.subscribe(job_id)?;
        loop {
            let snapshot = updates.borrow_and_update().clone();
            if snapshot.is_terminal() {
                return Ok(snapshot);
            }
            if updates.changed().await.is_err() {
                let last = updates.borrow().clone();
                return if last.is_terminal() {
                    Ok(last)
                } else {
                    Err(Error::Internal(format!(
                        "Job {} stopped publishing before finishing",
                        job_id
                    )))
                };
            }
        }
    }

    /// Jobs not yet terminal
    pub fn active_count(&self) -> usize {
        self.inner.read_active().len()
    }

    /// Jobs waiting for a worker
    pub fn pending_count(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    pub fn results(&self) -> &ResultStore {
        &self.inner.results
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop intake, cancel queued and running jobs, and join the pool
    pub async fn shutdown(&self) {
        if lock(&self.inner.queue).take().is_none() {
            return;
        }
        tracing::info!(active = self.active_count(), "Job manager shutting down");

        let slots: Vec<Arc<JobSlot>> = self.inner.read_active().values().cloned().collect();
        for slot in &slots {
            let cancelled = slot.update(|job| match job.status() {
                JobStatus::Queued => job.cancel(CancelReason::Shutdown).map(|_| true),
                JobStatus::Running => {
                    job.request_cancel(CancelReason::Shutdown);
                    Ok(false)
                }
                _ => Ok(false),
            });
            match cancelled {
                Ok(true) => self.inner.retire_if_terminal(slot),
                Ok(false) => {}
                Err(e) => self.inner.abort(slot, &e),
            }
        }
        self.inner.shutdown.cancel();

        let tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Job manager task panicked");
            }
        }
        tracing::info!("Job manager stopped");
    }
}

fn not_found(job_id: Uuid) -> Error {
    Error::NotFound(format!("Job {} not found", job_id))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn read_active(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, Arc<JobSlot>>> {
        self.active.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_active(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Arc<JobSlot>>> {
        self.active.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn active_slot(&self, job_id: Uuid) -> Option<Arc<JobSlot>> {
        self.read_active().get(&job_id).cloned()
    }

    /// Release the job's queue capacity; only the first call counts
    fn leave_queue(&self, slot: &JobSlot) {
        if slot.queued.swap(false, Ordering::SeqCst) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Move a terminal job from the active table into the result store
    fn retire_if_terminal(&self, slot: &JobSlot) {
        let snapshot = slot.snapshot();
        if !snapshot.is_terminal() {
            return;
        }
        self.leave_queue(slot);
        let job_id = snapshot.job_id;
        let status = snapshot.status;
        // Store first so the job never disappears between the two tables
        self.results.insert(snapshot);
        self.write_active().remove(&job_id);
        tracing::debug!(job_id = %job_id, status = %status, "Job retired");
    }

    /// Fail a job after an orchestrator invariant violation
    fn abort(&self, slot: &JobSlot, error: &Error) {
        let (job_id, status) = slot.read(|job| (job.id(), job.status()));
        tracing::error!(
            job_id = %job_id,
            status = %status,
            error = %error,
            "Job invariant violated, aborting"
        );
        if status.is_terminal() {
            return;
        }
        if let Err(e) = slot.update(|job| job.abort(error.to_string())) {
            tracing::error!(job_id = %job_id, error = %e, "Failed to abort job");
        }
        self.retire_if_terminal(slot);
    }

    /// Drive a dequeued job to a terminal status
    async fn process(&self, slot: Arc<JobSlot>) {
        let picked_up = slot.update(|job| match job.status() {
            JobStatus::Queued => job.start().map(|_| true),
            _ => Ok(false),
        });
        self.leave_queue(&slot);
        match picked_up {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                self.abort(&slot, &e);
                return;
            }
        }

        let job_id = slot.read(|job| job.id());
        tracing::info!(job_id = %job_id, "Job started");

        let watchdog = self.config.job_timeout.map(|limit| {
            let slot = slot.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = slot.cancel.cancelled() => {}
                    _ = tokio::time::sleep(limit) => {
                        tracing::warn!(
                            job_id = %job_id,
                            timeout_ms = limit.as_millis() as u64,
                            "Job deadline elapsed, cancelling"
                        );
                        slot.request_cancel(CancelReason::Timeout);
                    }
                }
            })
        });

        let completion = self.drive(&slot).await;
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        let finished = match completion {
            Completion::Succeeded(artifact) => slot.update(|job| job.succeed(artifact)),
            Completion::Failed(error) => slot.update(|job| job.fail(error)),
            Completion::Cancelled => slot.update(|job| {
                // Nothing recorded means the parent shutdown token fired
                let reason = job.cancel_requested().unwrap_or(CancelReason::Shutdown);
                job.cancel(reason)
            }),
            Completion::Aborted(e) => Err(e),
        };
        if let Err(e) = finished {
            self.abort(&slot, &e);
        }

        let snapshot = slot.snapshot();
        match &snapshot.error {
            Some(error) => tracing::warn!(
                job_id = %job_id,
                status = %snapshot.status,
                stage = %error.stage,
                attempts = error.attempts,
                error = %error.message,
                "Job finished"
            ),
            None => tracing::info!(
                job_id = %job_id,
                status = %snapshot.status,
                cancel_reason = ?snapshot.cancel_reason,
                "Job finished"
            ),
        }
        self.retire_if_terminal(&slot);
    }

    /// Run every planned stage in order, applying the retry policy
    async fn drive(&self, slot: &Arc<JobSlot>) -> Completion {
        let (job_id, request, plan) =
            slot.read(|job| (job.id(), job.request().clone(), job.plan().clone()));
        let mut ctx = StageContext::new(job_id, request);

        for (index, stage) in plan.stages().iter().enumerate() {
            if slot.cancel.is_cancelled() {
                return Completion::Cancelled;
            }

            loop {
                let attempt = match slot.update(|job| job.begin_stage(index)) {
                    Ok(attempt) => attempt,
                    Err(e) => return Completion::Aborted(e),
                };

                let progress_slot = slot.clone();
                let sink: ProgressSink = Arc::new(move |fraction| {
                    progress_slot.update(|job| job.record_progress(index, fraction));
                });

                match self.runner.run(stage.kind, &ctx, sink, &slot.cancel).await {
                    StageOutcome::Completed(artifact) => {
                        let overall = slot.update(|job| job.complete_stage(index));
                        tracing::info!(
                            job_id = %job_id,
                            stage = %stage.kind,
                            attempt,
                            overall_progress = overall,
                            "Stage completed"
                        );
                        ctx.record_output(artifact);
                        break;
                    }
                    StageOutcome::Cancelled => return Completion::Cancelled,
                    StageOutcome::TimedOut => {
                        slot.request_cancel(CancelReason::Timeout);
                        return Completion::Cancelled;
                    }
                    StageOutcome::Failed(error) => {
                        match self.config.retry.decide(&error, attempt) {
                            RetryDecision::Retry { after } => {
                                tracing::warn!(
                                    job_id = %job_id,
                                    stage = %stage.kind,
                                    attempt,
                                    delay_ms = after.as_millis() as u64,
                                    error = %error,
                                    "Stage failed, retrying"
                                );
                                tokio::select! {
                                    _ = slot.cancel.cancelled() => return Completion::Cancelled,
                                    _ = tokio::time::sleep(after) => {}
                                }
                            }
                            RetryDecision::GiveUp => {
                                return Completion::Failed(JobError {
                                    stage: stage.kind.to_string(),
                                    message: error.to_string(),
                                    retryable: error.is_retryable(),
                                    attempts: attempt,
                                });
                            }
                        }
                    }
                }
            }
        }

        if slot.cancel.is_cancelled() {
            return Completion::Cancelled;
        }
        match plan.stages().last().and_then(|last| ctx.output(last.kind)) {
            Some(artifact) => Completion::Succeeded(artifact.clone()),
            None => Completion::Aborted(Error::Internal(format!(
                "Job {} finished its plan without a final artifact",
                job_id
            ))),
        }
    }
}

async fn worker_loop(
    inner: Arc<Inner>,
    worker: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Uuid>>>,
) {
    tracing::debug!(worker, "Worker started");
    loop {
        let next = {
            let mut receiver = queue.lock().await;
            tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => None,
                job_id = receiver.recv() => job_id,
            }
        };
        let Some(job_id) = next else {
            break;
        };
        // Cancelled while queued: already retired
        let Some(slot) = inner.active_slot(job_id) else {
            continue;
        };
        inner.process(slot).await;
    }
    tracing::debug!(worker, "Worker stopped");
}

async fn reaper_loop(inner: Arc<Inner>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(inner.config.purge_interval) => {
                let purged = inner.results.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "Expired job results purged");
                }
            }
        }
    }
}
