//! Job store: the single source of truth for submissions and evaluation jobs.
//!
//! Every method is one atomic unit. Implementations validate lifecycle moves
//! through the domain state machines, and post-claim writes are compare-and-swap
//! on the presented [`ClaimToken`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bandscore_core::{
    DomainError, EvaluationResult, JobId, LifecycleEvent, Submission, SubmissionId, SubmissionStatus,
    TaskId, UserId, WorkerId,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::{ClaimPolicy, ClaimToken, EvaluationJob, FailureKind, JobError, JobStatus};

/// Submissions per history page.
pub const PAGE_SIZE: u32 = 20;

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("submission not found: {0}")]
    SubmissionNotFound(SubmissionId),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// Another claimer changed the row between selection and update.
    #[error("claim conflict: {0}")]
    ClaimConflict(String),

    /// The job was reclaimed (or finished) after this worker's claim.
    #[error("claim on job {job_id} held by {worker_id} was superseded")]
    StaleClaimReclaimed { job_id: JobId, worker_id: WorkerId },

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// What `enqueue` did.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// DRAFT → PENDING with a fresh job.
    Queued { submission: Submission, job: EvaluationJob },
    /// Already PENDING/PROCESSING; the active job is returned unchanged.
    AlreadyQueued { submission: Submission, job: Option<EvaluationJob> },
    /// Another draft of the same user and task went in flight inside the
    /// duplicate window; the draft is left untouched.
    Duplicate { existing: Submission },
}

/// A job handed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub job: EvaluationJob,
    pub submission: Submission,
    pub token: ClaimToken,
    /// Taken over from a stale claim; the submission was already PROCESSING.
    pub reclaimed: bool,
}

/// Result of a terminal or retry write.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub job: EvaluationJob,
    pub submission: Submission,
    pub previous_status: SubmissionStatus,
}

/// One page of a user's submission history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionPage {
    pub items: Vec<Submission>,
    pub page: u32,
    pub has_next: bool,
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub claimed: usize,
    pub retry_scheduled: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Queued => self.queued += count,
            JobStatus::Claimed => self.claimed += count,
            JobStatus::RetryScheduled => self.retry_scheduled += count,
            JobStatus::Succeeded => self.succeeded += count,
            JobStatus::Failed => self.failed += count,
        }
    }
}

/// Durable store for submissions and their evaluation jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_submission(&self, submission: &Submission) -> Result<(), JobStoreError>;

    /// Persist a revised draft. Rejected unless the stored row is still DRAFT.
    async fn update_draft(&self, submission: &Submission) -> Result<(), JobStoreError>;

    async fn get_submission(&self, id: SubmissionId) -> Result<Option<Submission>, JobStoreError>;

    /// Non-draft submissions of `user`, newest first.
    async fn list_submissions(&self, user: UserId, page: u32) -> Result<SubmissionPage, JobStoreError>;

    /// DRAFT → PENDING and create the job, atomically. Idempotent for
    /// submissions already in flight.
    ///
    /// With `duplicate_since` set, a DRAFT is not queued when another
    /// submission of the same user and task went in flight at or after that
    /// instant. The check and the write are one unit: two drafts racing for
    /// the same task never both get queued.
    async fn enqueue_deduplicated(
        &self,
        id: SubmissionId,
        now: DateTime<Utc>,
        duplicate_since: Option<DateTime<Utc>>,
    ) -> Result<EnqueueOutcome, JobStoreError>;

    async fn enqueue(&self, id: SubmissionId, now: DateTime<Utc>) -> Result<EnqueueOutcome, JobStoreError> {
        self.enqueue_deduplicated(id, now, None).await
    }

    /// FAILED → PENDING with a brand-new job at attempt 0.
    async fn requeue_failed(&self, id: SubmissionId, now: DateTime<Utc>) -> Result<(Submission, EvaluationJob), JobStoreError>;

    /// Atomically take the next eligible job, ordered by `(visible_after, created_at)`.
    ///
    /// Returns `Ok(None)` when nothing is eligible.
    async fn claim_next(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
        policy: &ClaimPolicy,
    ) -> Result<Option<ClaimedJob>, JobStoreError>;

    /// Fail stale claims that have no attempts left.
    async fn expire_stale_claims(&self, now: DateTime<Utc>, policy: &ClaimPolicy) -> Result<Vec<JobUpdate>, JobStoreError>;

    /// CLAIMED → SUCCEEDED; submission PROCESSING → SCORED.
    async fn complete(&self, token: &ClaimToken, result: EvaluationResult, now: DateTime<Utc>) -> Result<JobUpdate, JobStoreError>;

    /// CLAIMED → RETRY_SCHEDULED; submission PROCESSING → PENDING.
    async fn schedule_retry(
        &self,
        token: &ClaimToken,
        error: JobError,
        visible_after: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<JobUpdate, JobStoreError>;

    /// CLAIMED → FAILED; submission PROCESSING → FAILED.
    async fn fail(&self, token: &ClaimToken, error: JobError, now: DateTime<Utc>) -> Result<JobUpdate, JobStoreError>;

    async fn get_job(&self, id: JobId) -> Result<Option<EvaluationJob>, JobStoreError>;

    /// Most recently created job of a submission.
    async fn latest_job(&self, submission: SubmissionId) -> Result<Option<EvaluationJob>, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn insert_submission(&self, submission: &Submission) -> Result<(), JobStoreError> {
        (**self).insert_submission(submission).await
    }

    async fn update_draft(&self, submission: &Submission) -> Result<(), JobStoreError> {
        (**self).update_draft(submission).await
    }

    async fn get_submission(&self, id: SubmissionId) -> Result<Option<Submission>, JobStoreError> {
        (**self).get_submission(id).await
    }

    async fn list_submissions(&self, user: UserId, page: u32) -> Result<SubmissionPage, JobStoreError> {
        (**self).list_submissions(user, page).await
    }

    async fn enqueue_deduplicated(
        &self,
        id: SubmissionId,
        now: DateTime<Utc>,
        duplicate_since: Option<DateTime<Utc>>,
    ) -> Result<EnqueueOutcome, JobStoreError> {
        (**self).enqueue_deduplicated(id, now, duplicate_since).await
    }

    async fn requeue_failed(&self, id: SubmissionId, now: DateTime<Utc>) -> Result<(Submission, EvaluationJob), JobStoreError> {
        (**self).requeue_failed(id, now).await
    }

    async fn claim_next(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
        policy: &ClaimPolicy,
    ) -> Result<Option<ClaimedJob>, JobStoreError> {
        (**self).claim_next(worker, now, policy).await
    }

    async fn expire_stale_claims(&self, now: DateTime<Utc>, policy: &ClaimPolicy) -> Result<Vec<JobUpdate>, JobStoreError> {
        (**self).expire_stale_claims(now, policy).await
    }

    async fn complete(&self, token: &ClaimToken, result: EvaluationResult, now: DateTime<Utc>) -> Result<JobUpdate, JobStoreError> {
        (**self).complete(token, result, now).await
    }

    async fn schedule_retry(
        &self,
        token: &ClaimToken,
        error: JobError,
        visible_after: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<JobUpdate, JobStoreError> {
        (**self).schedule_retry(token, error, visible_after, now).await
    }

    async fn fail(&self, token: &ClaimToken, error: JobError, now: DateTime<Utc>) -> Result<JobUpdate, JobStoreError> {
        (**self).fail(token, error, now).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<EvaluationJob>, JobStoreError> {
        (**self).get_job(id).await
    }

    async fn latest_job(&self, submission: SubmissionId) -> Result<Option<EvaluationJob>, JobStoreError> {
        (**self).latest_job(submission).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }
}

#[derive(Debug, Default)]
struct State {
    submissions: HashMap<SubmissionId, Submission>,
    jobs: HashMap<JobId, EvaluationJob>,
}

impl State {
    fn submission_mut(&mut self, id: SubmissionId) -> Result<&mut Submission, JobStoreError> {
        self.submissions
            .get_mut(&id)
            .ok_or(JobStoreError::SubmissionNotFound(id))
    }

    fn latest_job(&self, submission: SubmissionId) -> Option<&EvaluationJob> {
        self.jobs
            .values()
            .filter(|j| j.submission_id == submission)
            .max_by_key(|j| (j.created_at, j.id))
    }

    /// Newest in-flight submission of `user` for `task` submitted at or after `since`.
    fn recent_in_flight(&self, user: UserId, task: TaskId, since: DateTime<Utc>) -> Option<&Submission> {
        self.submissions
            .values()
            .filter(|s| {
                s.user_id == user
                    && s.task.id == task
                    && s.status.is_in_flight()
                    && s.submitted_at.is_some_and(|at| at >= since)
            })
            .max_by_key(|s| s.submitted_at)
    }

    /// Shared tail of complete / schedule_retry / fail: verify the token, then
    /// mutate job and submission together.
    fn finish<F, G>(
        &mut self,
        token: &ClaimToken,
        now: DateTime<Utc>,
        job_step: F,
        submission_step: G,
    ) -> Result<JobUpdate, JobStoreError>
    where
        F: FnOnce(&mut EvaluationJob) -> Result<(), DomainError>,
        G: FnOnce(&mut Submission, &EvaluationJob) -> Result<(), DomainError>,
    {
        let mut job = self
            .jobs
            .get(&token.job_id)
            .cloned()
            .ok_or(JobStoreError::JobNotFound(token.job_id))?;
        job.check_token(token)?;
        job_step(&mut job)?;

        let mut submission = self
            .submissions
            .get(&job.submission_id)
            .cloned()
            .ok_or(JobStoreError::SubmissionNotFound(job.submission_id))?;
        let previous_status = submission.status;
        submission_step(&mut submission, &job)?;
        submission.updated_at = now;

        // both validated; commit
        self.jobs.insert(job.id, job.clone());
        self.submissions.insert(submission.id, submission.clone());
        Ok(JobUpdate {
            job,
            submission,
            previous_status,
        })
    }
}

/// In-memory job store for tests, benchmarks and single-process runs.
///
/// One mutex guards all state, so every operation is trivially atomic.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, JobStoreError> {
        self.state
            .lock()
            .map_err(|_| JobStoreError::Storage("in-memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_submission(&self, submission: &Submission) -> Result<(), JobStoreError> {
        let mut state = self.lock()?;
        if state.submissions.contains_key(&submission.id) {
            return Err(JobStoreError::Conflict(format!(
                "submission already exists: {}",
                submission.id
            )));
        }
        state.submissions.insert(submission.id, submission.clone());
        Ok(())
    }

    async fn update_draft(&self, submission: &Submission) -> Result<(), JobStoreError> {
        let mut state = self.lock()?;
        let stored = state.submission_mut(submission.id)?;
        if stored.status != SubmissionStatus::Draft || submission.status != SubmissionStatus::Draft {
            return Err(DomainError::invalid_transition(format!(
                "essay text is immutable once {}",
                stored.status
            ))
            .into());
        }
        *stored = submission.clone();
        Ok(())
    }

    async fn get_submission(&self, id: SubmissionId) -> Result<Option<Submission>, JobStoreError> {
        Ok(self.lock()?.submissions.get(&id).cloned())
    }

    async fn list_submissions(&self, user: UserId, page: u32) -> Result<SubmissionPage, JobStoreError> {
        let page = page.max(1);
        let state = self.lock()?;
        let mut items: Vec<_> = state
            .submissions
            .values()
            .filter(|s| s.user_id == user && s.status != SubmissionStatus::Draft)
            .cloned()
            .collect();
        items.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));

        // Pages past the addressable range are simply empty.
        let Some(skip) = usize::try_from(page - 1)
            .ok()
            .and_then(|p| p.checked_mul(PAGE_SIZE as usize))
        else {
            return Ok(SubmissionPage {
                items: Vec::new(),
                page,
                has_next: false,
            });
        };
        let mut items: Vec<_> = items.into_iter().skip(skip).take(PAGE_SIZE as usize + 1).collect();
        let has_next = items.len() > PAGE_SIZE as usize;
        items.truncate(PAGE_SIZE as usize);

        Ok(SubmissionPage { items, page, has_next })
    }

    async fn enqueue_deduplicated(
        &self,
        id: SubmissionId,
        now: DateTime<Utc>,
        duplicate_since: Option<DateTime<Utc>>,
    ) -> Result<EnqueueOutcome, JobStoreError> {
        let mut state = self.lock()?;
        let current = state
            .submissions
            .get(&id)
            .cloned()
            .ok_or(JobStoreError::SubmissionNotFound(id))?;

        if current.status.is_in_flight() {
            let job = state.latest_job(id).cloned();
            return Ok(EnqueueOutcome::AlreadyQueued { submission: current, job });
        }

        if let Some(since) = duplicate_since.filter(|_| current.status == SubmissionStatus::Draft) {
            if let Some(existing) = state.recent_in_flight(current.user_id, current.task.id, since) {
                return Ok(EnqueueOutcome::Duplicate { existing: existing.clone() });
            }
        }

        let mut submission = current;
        submission.submit(now)?;
        let job = EvaluationJob::new(id, now);

        state.jobs.insert(job.id, job.clone());
        state.submissions.insert(id, submission.clone());
        Ok(EnqueueOutcome::Queued { submission, job })
    }

    async fn requeue_failed(&self, id: SubmissionId, now: DateTime<Utc>) -> Result<(Submission, EvaluationJob), JobStoreError> {
        let mut state = self.lock()?;
        let submission = state.submission_mut(id)?;
        submission.apply(LifecycleEvent::ManualRetry, now)?;
        let submission = submission.clone();

        let job = EvaluationJob::new(id, now);
        state.jobs.insert(job.id, job.clone());
        Ok((submission, job))
    }

    async fn claim_next(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
        policy: &ClaimPolicy,
    ) -> Result<Option<ClaimedJob>, JobStoreError> {
        let mut state = self.lock()?;

        let Some(job_id) = state
            .jobs
            .values()
            .filter(|j| j.is_claimable(now, policy))
            .min_by_key(|j| (j.visible_after, j.created_at, j.id))
            .map(|j| j.id)
        else {
            return Ok(None);
        };

        let mut job = state.jobs.get(&job_id).cloned().ok_or(JobStoreError::JobNotFound(job_id))?;
        let reclaimed = job.status == JobStatus::Claimed;
        let mut submission = state
            .submissions
            .get(&job.submission_id)
            .cloned()
            .ok_or(JobStoreError::SubmissionNotFound(job.submission_id))?;

        if !reclaimed {
            submission
                .apply(LifecycleEvent::StartProcessing, now)
                .map_err(|e| JobStoreError::ClaimConflict(e.to_string()))?;
        }
        let token = job.claim(worker, now, policy.stale_after)?;

        state.jobs.insert(job.id, job.clone());
        state.submissions.insert(submission.id, submission.clone());
        Ok(Some(ClaimedJob {
            job,
            submission,
            token,
            reclaimed,
        }))
    }

    async fn expire_stale_claims(&self, now: DateTime<Utc>, policy: &ClaimPolicy) -> Result<Vec<JobUpdate>, JobStoreError> {
        let mut state = self.lock()?;
        let expired: Vec<ClaimToken> = state
            .jobs
            .values()
            .filter(|j| j.is_exhausted_stale_claim(now, policy))
            .filter_map(EvaluationJob::token)
            .collect();

        let mut updates = Vec::with_capacity(expired.len());
        for token in expired {
            let error = JobError::new(
                FailureKind::AttemptsExhausted,
                format!("claim by {} expired after {} attempts", token.worker_id, token.attempt),
            );
            let summary = error.user_summary();
            updates.push(state.finish(
                &token,
                now,
                |job| job.fail(error, now),
                |submission, _| submission.record_failure(summary, now),
            )?);
        }
        Ok(updates)
    }

    async fn complete(&self, token: &ClaimToken, result: EvaluationResult, now: DateTime<Utc>) -> Result<JobUpdate, JobStoreError> {
        self.lock()?.finish(
            token,
            now,
            |job| job.succeed(result, now),
            |submission, job| match &job.result {
                Some(result) => submission.record_score(result.clone(), now),
                None => Err(DomainError::validation("succeeded job has no result")),
            },
        )
    }

    async fn schedule_retry(
        &self,
        token: &ClaimToken,
        error: JobError,
        visible_after: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<JobUpdate, JobStoreError> {
        self.lock()?.finish(
            token,
            now,
            |job| job.schedule_retry(error, visible_after, now),
            |submission, _| submission.apply(LifecycleEvent::RetryScheduled, now),
        )
    }

    async fn fail(&self, token: &ClaimToken, error: JobError, now: DateTime<Utc>) -> Result<JobUpdate, JobStoreError> {
        let summary = error.user_summary();
        self.lock()?.finish(
            token,
            now,
            |job| job.fail(error, now),
            |submission, _| submission.record_failure(summary, now),
        )
    }

    async fn get_job(&self, id: JobId) -> Result<Option<EvaluationJob>, JobStoreError> {
        Ok(self.lock()?.jobs.get(&id).cloned())
    }

    async fn latest_job(&self, submission: SubmissionId) -> Result<Option<EvaluationJob>, JobStoreError> {
        Ok(self.lock()?.latest_job(submission).cloned())
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let state = self.lock()?;
        let mut stats = JobStats::default();
        for job in state.jobs.values() {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bandscore_core::{BandScore, Criterion, TaskType, WritingTask};
    use std::collections::{BTreeMap, HashSet};
    use std::time::Duration;

    fn essay(words: usize) -> String {
        vec!["word"; words].join(" ")
    }

    fn draft(user: UserId, words: usize) -> Submission {
        let task = WritingTask::new(TaskId::new(), TaskType::Task2, "Discuss.").with_min_words(10);
        Submission::draft(SubmissionId::new(), user, task, &essay(words), Utc::now())
    }

    fn result() -> EvaluationResult {
        let scores = Criterion::ALL
            .into_iter()
            .map(|c| (c, BandScore::from_f64(6.5).unwrap()))
            .collect();
        EvaluationResult::new(scores, BTreeMap::new(), vec![], None).unwrap()
    }

    fn policy() -> ClaimPolicy {
        ClaimPolicy {
            stale_after: Duration::from_secs(60),
            max_attempts: 3,
        }
    }

    async fn queued(store: &InMemoryJobStore) -> Submission {
        let s = draft(UserId::new(), 20);
        store.insert_submission(&s).await.unwrap();
        store.enqueue(s.id, Utc::now()).await.unwrap();
        store.get_submission(s.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();
        let s = queued(&store).await;
        assert_eq!(s.status, SubmissionStatus::Pending);

        let w = WorkerId::new("w1");
        let claimed = store.claim_next(&w, Utc::now(), &policy()).await.unwrap().unwrap();
        assert_eq!(claimed.submission.id, s.id);
        assert_eq!(claimed.submission.status, SubmissionStatus::Processing);
        assert_eq!(claimed.job.status, JobStatus::Claimed);
        assert_eq!(claimed.job.attempt_count, 1);
        assert!(!claimed.reclaimed);

        // No more jobs
        assert!(store.claim_next(&w, Utc::now(), &policy()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_while_in_flight() {
        let store = InMemoryJobStore::new();
        let s = queued(&store).await;

        let again = store.enqueue(s.id, Utc::now()).await.unwrap();
        assert!(matches!(again, EnqueueOutcome::AlreadyQueued { job: Some(_), .. }));
        assert_eq!(store.stats().await.unwrap().queued, 1);
    }

    #[tokio::test]
    async fn deduplicated_enqueue_leaves_second_draft_alone() {
        let store = InMemoryJobStore::new();
        let user = UserId::new();
        let first = draft(user, 20);
        let second = Submission::draft(SubmissionId::new(), user, first.task.clone(), &essay(25), Utc::now());
        store.insert_submission(&first).await.unwrap();
        store.insert_submission(&second).await.unwrap();

        let now = Utc::now();
        let since = now - chrono::Duration::minutes(5);
        let queued = store.enqueue_deduplicated(first.id, now, Some(since)).await.unwrap();
        assert!(matches!(queued, EnqueueOutcome::Queued { .. }));

        match store.enqueue_deduplicated(second.id, now, Some(since)).await.unwrap() {
            EnqueueOutcome::Duplicate { existing } => assert_eq!(existing.id, first.id),
            other => panic!("unexpected outcome: {other:?}"),
        }
        let stored = store.get_submission(second.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubmissionStatus::Draft);
        assert_eq!(store.stats().await.unwrap().queued, 1);

        // Outside the window the second draft queues normally.
        let later = now + chrono::Duration::minutes(10);
        let outcome = store
            .enqueue_deduplicated(second.id, later, Some(later - chrono::Duration::minutes(5)))
            .await
            .unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Queued { .. }));
    }

    #[tokio::test]
    async fn enqueue_rejects_short_essays() {
        let store = InMemoryJobStore::new();
        let s = draft(UserId::new(), 3);
        store.insert_submission(&s).await.unwrap();

        let err = store.enqueue(s.id, Utc::now()).await.unwrap_err();
        assert!(matches!(err, JobStoreError::Domain(DomainError::Validation(_))));
        assert_eq!(store.stats().await.unwrap(), JobStats::default());
    }

    #[tokio::test]
    async fn claims_in_visibility_then_creation_order() {
        let store = InMemoryJobStore::new();
        let first = queued(&store).await;
        let second = queued(&store).await;
        let w = WorkerId::new("w");
        let now = Utc::now() + chrono::Duration::seconds(1);

        let a = store.claim_next(&w, now, &policy()).await.unwrap().unwrap();
        let b = store.claim_next(&w, now, &policy()).await.unwrap().unwrap();
        assert_eq!(a.submission.id, first.id);
        assert_eq!(b.submission.id, second.id);
    }

    #[tokio::test]
    async fn late_write_from_superseded_claim_is_rejected() {
        let store = InMemoryJobStore::new();
        let s = queued(&store).await;
        let t0 = Utc::now();

        let first = store.claim_next(&WorkerId::new("slow"), t0, &policy()).await.unwrap().unwrap();
        let t1 = t0 + chrono::Duration::seconds(61);
        let second = store.claim_next(&WorkerId::new("fast"), t1, &policy()).await.unwrap().unwrap();
        assert!(second.reclaimed);
        assert_eq!(second.job.attempt_count, 2);
        assert_eq!(second.submission.status, SubmissionStatus::Processing);

        let err = store.complete(&first.token, result(), t1).await.unwrap_err();
        assert!(matches!(err, JobStoreError::StaleClaimReclaimed { .. }));

        let update = store.complete(&second.token, result(), t1).await.unwrap();
        assert_eq!(update.submission.status, SubmissionStatus::Scored);
        assert_eq!(update.previous_status, SubmissionStatus::Processing);

        // still rejected once the job is terminal
        let err = store.complete(&first.token, result(), t1).await.unwrap_err();
        assert!(matches!(err, JobStoreError::StaleClaimReclaimed { .. }));
        assert_eq!(store.get_submission(s.id).await.unwrap().unwrap().status, SubmissionStatus::Scored);
    }

    #[tokio::test]
    async fn exhausted_stale_claims_are_failed_not_reclaimed() {
        let store = InMemoryJobStore::new();
        let s = queued(&store).await;
        let policy = ClaimPolicy {
            stale_after: Duration::from_secs(10),
            max_attempts: 1,
        };
        let t0 = Utc::now();
        store.claim_next(&WorkerId::new("w"), t0, &policy).await.unwrap().unwrap();

        let later = t0 + chrono::Duration::seconds(11);
        assert!(store.claim_next(&WorkerId::new("w2"), later, &policy).await.unwrap().is_none());

        let updates = store.expire_stale_claims(later, &policy).await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].job.last_error.as_ref().unwrap().kind, FailureKind::AttemptsExhausted);

        let s = store.get_submission(s.id).await.unwrap().unwrap();
        assert_eq!(s.status, SubmissionStatus::Failed);
        assert!(s.error_message.is_some());
    }

    #[tokio::test]
    async fn retry_and_manual_requeue() {
        let store = InMemoryJobStore::new();
        let s = queued(&store).await;
        let w = WorkerId::new("w");
        let t0 = Utc::now();

        let c = store.claim_next(&w, t0, &policy()).await.unwrap().unwrap();
        let at = t0 + chrono::Duration::seconds(30);
        let update = store
            .schedule_retry(&c.token, JobError::new(FailureKind::RateLimited, "429"), at, t0)
            .await
            .unwrap();
        assert_eq!(update.submission.status, SubmissionStatus::Pending);
        assert_eq!(update.job.status, JobStatus::RetryScheduled);

        // invisible until backoff elapses
        assert!(store.claim_next(&w, t0, &policy()).await.unwrap().is_none());
        let c = store.claim_next(&w, at, &policy()).await.unwrap().unwrap();
        assert_eq!(c.job.attempt_count, 2);

        store
            .fail(&c.token, JobError::new(FailureKind::Unauthorized, "401"), at)
            .await
            .unwrap();
        assert!(matches!(
            store.enqueue(s.id, at).await,
            Err(JobStoreError::Domain(DomainError::InvalidTransition(_)))
        ));

        let (s, job) = store.requeue_failed(s.id, at).await.unwrap();
        assert_eq!(s.status, SubmissionStatus::Pending);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(store.latest_job(s.id).await.unwrap().unwrap().id, job.id);
        assert!(store.requeue_failed(s.id, at).await.is_err());
    }

    #[tokio::test]
    async fn history_pages_newest_first_without_drafts() {
        let store = InMemoryJobStore::new();
        let user = UserId::new();
        let base = Utc::now();
        for i in 0..25 {
            let mut s = draft(user, 20);
            s.created_at = base + chrono::Duration::seconds(i);
            store.insert_submission(&s).await.unwrap();
            store.enqueue(s.id, base).await.unwrap();
        }
        store.insert_submission(&draft(user, 20)).await.unwrap();

        let first = store.list_submissions(user, 1).await.unwrap();
        assert_eq!(first.items.len(), 20);
        assert!(first.has_next);
        assert!(first.items[0].created_at > first.items[19].created_at);

        let second = store.list_submissions(user, 2).await.unwrap();
        assert_eq!(second.items.len(), 5);
        assert!(!second.has_next);
    }

    #[tokio::test]
    async fn far_out_history_pages_are_empty() {
        let store = InMemoryJobStore::new();
        let user = UserId::new();
        let s = draft(user, 20);
        store.insert_submission(&s).await.unwrap();
        store.enqueue(s.id, Utc::now()).await.unwrap();

        for page in [300_000_000, u32::MAX] {
            let listed = store.list_submissions(user, page).await.unwrap();
            assert!(listed.items.is_empty());
            assert!(!listed.has_next);
            assert_eq!(listed.page, page);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn at_most_one_claim_across_concurrent_claimers() {
        let store = Arc::new(InMemoryJobStore::new());
        for _ in 0..50 {
            queued(&store).await;
        }

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let w = WorkerId::new(format!("w{i}"));
                let mut mine = Vec::new();
                while let Some(c) = store.claim_next(&w, Utc::now(), &policy()).await.unwrap() {
                    mine.push(c.job.id);
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        for h in handles {
            for id in h.await.unwrap() {
                assert!(seen.insert(id), "job {id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 50);
    }
}
