//! Evaluation worker: claims jobs, calls the provider, records the outcome.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bandscore_ai::{EvaluationProvider, EvaluationRequest, ProviderError};
use bandscore_core::{EvaluationResult, SubmissionId, SubmissionStatus, UserId, WorkerId};
use bandscore_events::{EventBus, StatusChanged};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::jobs::types::after;
use crate::jobs::{
    ClaimPolicy, ClaimToken, ClaimedJob, FailureKind, GiveUpReason, JobError, JobStore, JobStoreError, JobUpdate,
    RetryDecision, RetryPolicy,
};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Hard limit on one provider call.
    pub execution_timeout: Duration,
    pub claim: ClaimPolicy,
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::new(format!("worker-{}", std::process::id())),
            poll_interval: Duration::from_secs(1),
            execution_timeout: Duration::from_secs(90),
            claim: ClaimPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = WorkerId::new(id);
        self
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// What one [`EvaluationWorker::tick`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Nothing was eligible.
    Idle,
    Scored(SubmissionId),
    RetryScheduled(SubmissionId, DateTime<Utc>),
    Failed(SubmissionId, FailureKind),
    /// The claim was taken over while the provider ran; the result was dropped.
    Superseded(SubmissionId),
    /// The provider task panicked. The job stays claimed until its lease expires.
    Abandoned(SubmissionId),
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub jobs_claimed: u64,
    pub jobs_scored: u64,
    pub retries_scheduled: u64,
    pub jobs_failed: u64,
    pub superseded_writes: u64,
    pub stale_claims_expired: u64,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn merge(&mut self, other: &WorkerStats) {
        self.jobs_claimed += other.jobs_claimed;
        self.jobs_scored += other.jobs_scored;
        self.retries_scheduled += other.retries_scheduled;
        self.jobs_failed += other.jobs_failed;
        self.superseded_writes += other.superseded_writes;
        self.stale_claims_expired += other.stale_claims_expired;
        self.uptime_secs = self.uptime_secs.max(other.uptime_secs);
    }
}

/// One worker. Cheap to clone; clones share statistics.
#[derive(Clone)]
pub struct EvaluationWorker {
    store: Arc<dyn JobStore>,
    provider: Arc<dyn EvaluationProvider>,
    bus: Arc<dyn EventBus<StatusChanged>>,
    config: WorkerConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl std::fmt::Debug for EvaluationWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluationWorker")
            .field("worker_id", &self.config.worker_id)
            .field("provider", &self.provider.name())
            .finish_non_exhaustive()
    }
}

impl EvaluationWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        provider: Arc<dyn EvaluationProvider>,
        bus: Arc<dyn EventBus<StatusChanged>>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            provider,
            bus,
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.config.worker_id
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn bump(&self, f: impl FnOnce(&mut WorkerStats)) {
        if let Ok(mut s) = self.stats.lock() {
            f(&mut s);
        }
    }

    /// Expire dead claims, then claim and process at most one job.
    ///
    /// `now` is the claim time; completion timestamps add the wall-clock time
    /// spent in the provider.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickOutcome, WorkerError> {
        self.expire_stale(now).await?;

        let claimed = match self.store.claim_next(&self.config.worker_id, now, &self.config.claim).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return Ok(TickOutcome::Idle),
            Err(JobStoreError::ClaimConflict(reason)) => {
                debug!(worker = %self.config.worker_id, %reason, "claim lost to a concurrent writer");
                return Ok(TickOutcome::Idle);
            }
            Err(e) => return Err(e.into()),
        };
        self.bump(|s| s.jobs_claimed += 1);

        let ClaimedJob {
            job,
            submission,
            token,
            reclaimed,
        } = claimed;
        info!(
            worker = %self.config.worker_id,
            job_id = %job.id,
            submission_id = %submission.id,
            attempt = token.attempt,
            reclaimed,
            "claimed evaluation job"
        );
        if !reclaimed {
            self.publish(
                submission.id,
                submission.user_id,
                SubmissionStatus::Pending,
                SubmissionStatus::Processing,
                token.attempt,
                now,
            );
        }

        let request = EvaluationRequest {
            essay_text: submission.essay_text.clone(),
            task_prompt: submission.task.prompt.clone(),
            task_type: submission.task.task_type,
        };

        let started = Instant::now();
        let outcome = self.call_provider(request).await;
        let finished = after(now, started.elapsed());

        let outcome = match outcome {
            Some(outcome) => outcome,
            None => return Ok(TickOutcome::Abandoned(submission.id)),
        };

        let written = match outcome {
            Ok(result) => self.record_success(&token, result, finished).await,
            Err(err) => self.record_failure(&token, err, finished).await,
        };

        match written {
            Ok(outcome) => Ok(outcome),
            Err(JobStoreError::StaleClaimReclaimed { job_id, worker_id }) => {
                warn!(worker = %worker_id, %job_id, "claim superseded before completion; result discarded");
                self.bump(|s| s.superseded_writes += 1);
                Ok(TickOutcome::Superseded(submission.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Provider call on its own task under the execution timeout.
    ///
    /// `None` means the task panicked.
    async fn call_provider(&self, request: EvaluationRequest) -> Option<Result<EvaluationResult, ProviderError>> {
        let provider = self.provider.clone();
        let limit = self.config.execution_timeout;
        let task = tokio::spawn(async move {
            match tokio::time::timeout(limit, provider.evaluate(&request)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(limit)),
            }
        });

        match task.await {
            Ok(result) => Some(result),
            Err(join_err) => {
                error!(worker = %self.config.worker_id, error = %join_err, "provider task panicked; leaving job claimed");
                None
            }
        }
    }

    async fn record_success(
        &self,
        token: &ClaimToken,
        result: EvaluationResult,
        at: DateTime<Utc>,
    ) -> Result<TickOutcome, JobStoreError> {
        let band = result.overall_band();
        let update = self.store.complete(token, result, at).await?;
        info!(
            worker = %self.config.worker_id,
            submission_id = %update.submission.id,
            overall_band = band.value(),
            attempt = token.attempt,
            "essay scored"
        );
        self.bump(|s| s.jobs_scored += 1);
        self.publish_update(&update, token.attempt, at);
        Ok(TickOutcome::Scored(update.submission.id))
    }

    async fn record_failure(
        &self,
        token: &ClaimToken,
        err: ProviderError,
        at: DateTime<Utc>,
    ) -> Result<TickOutcome, JobStoreError> {
        let kind = FailureKind::from(err.kind());
        match self.config.retry.decide(token.attempt, kind, at) {
            RetryDecision::RetryAt(backoff_until) => {
                let retry_at = match err.retry_after() {
                    Some(hint) => backoff_until.max(after(at, hint)),
                    None => backoff_until,
                };
                let update = self
                    .store
                    .schedule_retry(token, JobError::new(kind, err.to_string()), retry_at, at)
                    .await?;
                warn!(
                    worker = %self.config.worker_id,
                    submission_id = %update.submission.id,
                    attempt = token.attempt,
                    kind = ?kind,
                    %retry_at,
                    "evaluation failed; retry scheduled"
                );
                self.bump(|s| s.retries_scheduled += 1);
                self.publish_update(&update, token.attempt, at);
                Ok(TickOutcome::RetryScheduled(update.submission.id, retry_at))
            }
            RetryDecision::GiveUp(reason) => {
                let error = match reason {
                    GiveUpReason::NotRetriable => JobError::new(kind, err.to_string()),
                    GiveUpReason::AttemptsExhausted => JobError::new(
                        FailureKind::AttemptsExhausted,
                        format!("{} attempts failed; last error: {err}", token.attempt),
                    ),
                };
                let final_kind = error.kind;
                let update = self.store.fail(token, error, at).await?;
                error!(
                    worker = %self.config.worker_id,
                    submission_id = %update.submission.id,
                    attempt = token.attempt,
                    kind = ?final_kind,
                    error = %err,
                    "evaluation failed permanently"
                );
                self.bump(|s| s.jobs_failed += 1);
                self.publish_update(&update, token.attempt, at);
                Ok(TickOutcome::Failed(update.submission.id, final_kind))
            }
        }
    }

    async fn expire_stale(&self, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        let expired = self.store.expire_stale_claims(now, &self.config.claim).await?;
        for update in &expired {
            warn!(
                worker = %self.config.worker_id,
                job_id = %update.job.id,
                submission_id = %update.submission.id,
                attempts = update.job.attempt_count,
                "stale claim expired with no attempts left"
            );
            self.publish_update(update, update.job.attempt_count, now);
        }
        if !expired.is_empty() {
            self.bump(|s| s.stale_claims_expired += expired.len() as u64);
        }
        Ok(())
    }

    fn publish_update(&self, update: &JobUpdate, attempt: u32, at: DateTime<Utc>) {
        self.publish(
            update.submission.id,
            update.submission.user_id,
            update.previous_status,
            update.submission.status,
            attempt,
            at,
        );
    }

    fn publish(
        &self,
        submission_id: SubmissionId,
        user_id: UserId,
        from: SubmissionStatus,
        to: SubmissionStatus,
        attempt: u32,
        at: DateTime<Utc>,
    ) {
        let msg = StatusChanged {
            submission_id,
            user_id,
            from,
            to,
            attempt,
            at,
        };
        if let Err(e) = self.bus.publish(msg) {
            warn!(worker = %self.config.worker_id, error = %e, "failed to publish status change");
        }
    }

    /// Poll until `shutdown` flips to `true`. An in-flight job is always
    /// finished before the loop exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.config.worker_id, provider = self.provider.name(), "evaluation worker started");
        let start_time = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.bump(|s| s.uptime_secs = start_time.elapsed().as_secs());

            let idle = match self.tick(Utc::now()).await {
                Ok(TickOutcome::Idle) => true,
                Ok(_) => false,
                Err(e) => {
                    error!(worker = %self.config.worker_id, error = %e, "worker tick failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!(worker = %self.config.worker_id, "evaluation worker stopped");
    }
}

/// Handle to a set of running workers.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    workers: Vec<EvaluationWorker>,
}

impl WorkerPoolHandle {
    /// Spawn `count` workers sharing one store, provider and bus.
    ///
    /// Worker ids are `<base>-<index>`.
    pub fn spawn(
        count: usize,
        store: Arc<dyn JobStore>,
        provider: Arc<dyn EvaluationProvider>,
        bus: Arc<dyn EventBus<StatusChanged>>,
        config: WorkerConfig,
    ) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let base = config.worker_id.clone();

        let workers: Vec<EvaluationWorker> = (0..count.max(1))
            .map(|i| {
                let config = config.clone().with_worker_id(format!("{base}-{i}"));
                EvaluationWorker::new(store.clone(), provider.clone(), bus.clone(), config)
            })
            .collect();
        let joins = workers
            .iter()
            .map(|w| tokio::spawn(w.clone().run(rx.clone())))
            .collect();

        info!(workers = workers.len(), "worker pool started");
        Self {
            shutdown,
            joins,
            workers,
        }
    }

    /// Aggregated statistics across all workers.
    pub fn stats(&self) -> WorkerStats {
        let mut total = WorkerStats::default();
        for w in &self.workers {
            total.merge(&w.stats());
        }
        total
    }

    /// Signal shutdown and wait for every worker to finish its current job.
    ///
    /// Returns the final aggregated statistics.
    pub async fn shutdown(self) -> WorkerStats {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        let mut total = WorkerStats::default();
        for w in &self.workers {
            total.merge(&w.stats());
        }
        info!(scored = total.jobs_scored, failed = total.jobs_failed, "worker pool stopped");
        total
    }
}
