//! Submission lifecycle service (application-level orchestration).
//!
//! The service is the only entry point for user-driven changes: drafting,
//! revising, submitting for evaluation, inspecting status and retrying a
//! failed evaluation. Worker-driven changes go through the job store directly.
//!
//! Every operation is scoped to the calling user; submissions owned by someone
//! else are reported as not found.

use std::sync::Arc;
use std::time::Duration;

use bandscore_core::{
    DomainError, EvaluationResult, Submission, SubmissionId, SubmissionStatus, TaskType, UserId, WritingTask,
};
use bandscore_events::{EventBus, StatusChanged};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::jobs::{EnqueueOutcome, JobStats, JobStore, JobStoreError, SubmissionPage};

/// A second submit for the same user and task inside this window returns the
/// in-flight submission instead of queueing another evaluation.
pub const DUPLICATE_WINDOW: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("submission not found: {0}")]
    NotFound(SubmissionId),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error(transparent)]
    Store(JobStoreError),
}

impl From<DomainError> for ServiceError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => ServiceError::Validation(msg),
            DomainError::InvalidTransition(msg) => ServiceError::InvalidTransition(msg),
        }
    }
}

impl From<JobStoreError> for ServiceError {
    fn from(value: JobStoreError) -> Self {
        match value {
            JobStoreError::SubmissionNotFound(id) => ServiceError::NotFound(id),
            JobStoreError::Domain(e) => e.into(),
            other => ServiceError::Store(other),
        }
    }
}

/// Result of [`SubmissionService::submit_for_evaluation`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// A new evaluation job was created.
    Queued(Submission),
    /// This submission was already waiting for or undergoing evaluation.
    AlreadyQueued(Submission),
    /// Another recent submission for the same task is still in flight; that
    /// one is returned and this draft is left untouched.
    Duplicate(Submission),
}

impl SubmitOutcome {
    pub fn submission(&self) -> &Submission {
        match self {
            SubmitOutcome::Queued(s) | SubmitOutcome::AlreadyQueued(s) | SubmitOutcome::Duplicate(s) => s,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, SubmitOutcome::Queued(_))
    }
}

/// What a user may see about a submission's evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub submission_id: SubmissionId,
    pub status: SubmissionStatus,
    pub task_type: TaskType,
    pub word_count: u32,
    /// Present only when SCORED.
    pub result: Option<EvaluationResult>,
    /// User-readable summary, present only when FAILED.
    pub error: Option<String>,
    /// Attempts made by the latest evaluation job.
    pub attempt_count: u32,
    pub submitted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Submission lifecycle operations over a [`JobStore`].
#[derive(Clone)]
pub struct SubmissionService {
    store: Arc<dyn JobStore>,
    bus: Arc<dyn EventBus<StatusChanged>>,
}

impl std::fmt::Debug for SubmissionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionService").finish_non_exhaustive()
    }
}

impl SubmissionService {
    pub fn new(store: Arc<dyn JobStore>, bus: Arc<dyn EventBus<StatusChanged>>) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Start a new DRAFT for `task`.
    pub async fn create_submission(
        &self,
        user: UserId,
        task: WritingTask,
        essay_text: &str,
    ) -> Result<Submission, ServiceError> {
        if task.prompt.trim().is_empty() {
            return Err(ServiceError::Validation("task prompt must not be empty".to_string()));
        }
        let submission = Submission::draft(SubmissionId::new(), user, task, essay_text, Utc::now());
        self.store.insert_submission(&submission).await?;
        info!(
            submission_id = %submission.id,
            user_id = %user,
            task_type = %submission.task.task_type,
            word_count = submission.word_count,
            "draft created"
        );
        Ok(submission)
    }

    /// Replace the text of a DRAFT.
    pub async fn revise_draft(
        &self,
        user: UserId,
        id: SubmissionId,
        essay_text: &str,
    ) -> Result<Submission, ServiceError> {
        let mut submission = self.owned(user, id).await?;
        submission.revise(essay_text, Utc::now())?;
        self.store.update_draft(&submission).await?;
        Ok(submission)
    }

    /// DRAFT → PENDING and queue an evaluation.
    ///
    /// Idempotent: a submission already PENDING or PROCESSING is returned as
    /// is, and a recent in-flight submission for the same task wins over a
    /// second draft.
    pub async fn submit_for_evaluation(&self, user: UserId, id: SubmissionId) -> Result<SubmitOutcome, ServiceError> {
        self.owned(user, id).await?;
        let now = Utc::now();

        let since = before(now, DUPLICATE_WINDOW);
        match self.store.enqueue_deduplicated(id, now, Some(since)).await? {
            EnqueueOutcome::Queued { submission, job } => {
                info!(submission_id = %id, job_id = %job.id, "evaluation queued");
                self.publish(&submission, SubmissionStatus::Draft, 0, now);
                Ok(SubmitOutcome::Queued(submission))
            }
            EnqueueOutcome::AlreadyQueued { submission, .. } => Ok(SubmitOutcome::AlreadyQueued(submission)),
            EnqueueOutcome::Duplicate { existing } => {
                info!(
                    submission_id = %id,
                    existing_id = %existing.id,
                    "recent in-flight submission for the same task; not queueing another"
                );
                Ok(SubmitOutcome::Duplicate(existing))
            }
        }
    }

    pub async fn get_status(&self, user: UserId, id: SubmissionId) -> Result<StatusView, ServiceError> {
        let submission = self.owned(user, id).await?;
        let attempt_count = self
            .store
            .latest_job(id)
            .await?
            .map(|job| job.attempt_count)
            .unwrap_or(0);

        let result = match submission.status {
            SubmissionStatus::Scored => submission.result,
            _ => None,
        };
        let error = match submission.status {
            SubmissionStatus::Failed => submission.error_message,
            _ => None,
        };
        Ok(StatusView {
            submission_id: submission.id,
            status: submission.status,
            task_type: submission.task.task_type,
            word_count: submission.word_count,
            result,
            error,
            attempt_count,
            submitted_at: submission.submitted_at,
            completed_at: submission.completed_at,
        })
    }

    /// FAILED → PENDING with a fresh job.
    pub async fn retry_failed(&self, user: UserId, id: SubmissionId) -> Result<Submission, ServiceError> {
        self.owned(user, id).await?;
        let now = Utc::now();
        let (submission, job) = self.store.requeue_failed(id, now).await?;
        info!(submission_id = %id, job_id = %job.id, "failed evaluation re-queued");
        self.publish(&submission, SubmissionStatus::Failed, 0, now);
        Ok(submission)
    }

    pub async fn list_submissions(&self, user: UserId, page: u32) -> Result<SubmissionPage, ServiceError> {
        Ok(self.store.list_submissions(user, page).await?)
    }

    pub async fn job_stats(&self) -> Result<JobStats, ServiceError> {
        Ok(self.store.stats().await?)
    }

    async fn owned(&self, user: UserId, id: SubmissionId) -> Result<Submission, ServiceError> {
        match self.store.get_submission(id).await? {
            Some(s) if s.user_id == user => Ok(s),
            _ => Err(ServiceError::NotFound(id)),
        }
    }

    fn publish(&self, submission: &Submission, from: SubmissionStatus, attempt: u32, at: DateTime<Utc>) {
        let msg = StatusChanged {
            submission_id: submission.id,
            user_id: submission.user_id,
            from,
            to: submission.status,
            attempt,
            at,
        };
        if let Err(e) = self.bus.publish(msg) {
            warn!(submission_id = %submission.id, error = %e, "failed to publish status change");
        }
    }
}

fn before(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{ClaimPolicy, FailureKind, InMemoryJobStore, JobError};
    use crate::workers::{EvaluationWorker, TickOutcome, WorkerConfig};
    use bandscore_ai::MockProvider;
    use bandscore_core::{TaskId, WorkerId};
    use bandscore_events::InMemoryEventBus;

    fn essay(words: usize) -> String {
        vec!["word"; words].join(" ")
    }

    fn task1() -> WritingTask {
        WritingTask::new(TaskId::new(), TaskType::Task1, "The chart shows energy use by sector.")
    }

    fn service() -> (SubmissionService, Arc<InMemoryJobStore>, Arc<InMemoryEventBus<StatusChanged>>) {
        let store = Arc::new(InMemoryJobStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        (SubmissionService::new(store.clone(), bus.clone()), store, bus)
    }

    #[tokio::test]
    async fn submit_then_score_is_visible_in_status() {
        let (service, store, bus) = service();
        let user = UserId::new();
        let draft = service.create_submission(user, task1(), &essay(180)).await.unwrap();
        assert_eq!(draft.status, SubmissionStatus::Draft);

        let outcome = service.submit_for_evaluation(user, draft.id).await.unwrap();
        assert!(outcome.is_new());
        assert_eq!(outcome.submission().status, SubmissionStatus::Pending);

        let worker = EvaluationWorker::new(store, Arc::new(MockProvider::new()), bus, WorkerConfig::default());
        assert_eq!(worker.tick(Utc::now()).await.unwrap(), TickOutcome::Scored(draft.id));

        let view = service.get_status(user, draft.id).await.unwrap();
        assert_eq!(view.status, SubmissionStatus::Scored);
        assert_eq!(view.attempt_count, 1);
        let result = view.result.unwrap();
        assert_eq!(result.overall_band().value(), 6.5);
        assert_eq!(result.criteria_scores().len(), 4);
        assert!(view.error.is_none());
    }

    #[tokio::test]
    async fn submit_is_idempotent() {
        let (service, store, _) = service();
        let user = UserId::new();
        let draft = service.create_submission(user, task1(), &essay(200)).await.unwrap();

        service.submit_for_evaluation(user, draft.id).await.unwrap();
        let again = service.submit_for_evaluation(user, draft.id).await.unwrap();
        assert!(matches!(again, SubmitOutcome::AlreadyQueued(_)));
        assert_eq!(store.stats().await.unwrap().queued, 1);
    }

    #[tokio::test]
    async fn second_draft_for_same_task_is_a_duplicate() {
        let (service, store, _) = service();
        let user = UserId::new();
        let task = task1();
        let first = service.create_submission(user, task.clone(), &essay(200)).await.unwrap();
        let second = service.create_submission(user, task, &essay(210)).await.unwrap();

        service.submit_for_evaluation(user, first.id).await.unwrap();
        let outcome = service.submit_for_evaluation(user, second.id).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Duplicate(store.get_submission(first.id).await.unwrap().unwrap()));
        assert_eq!(
            store.get_submission(second.id).await.unwrap().unwrap().status,
            SubmissionStatus::Draft
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_drafts_for_same_task_queue_once() {
        for _ in 0..50 {
            let (service, store, _) = service();
            let user = UserId::new();
            let task = task1();
            let first = service.create_submission(user, task.clone(), &essay(200)).await.unwrap();
            let second = service.create_submission(user, task, &essay(210)).await.unwrap();

            let a = tokio::spawn({
                let service = service.clone();
                async move { service.submit_for_evaluation(user, first.id).await }
            });
            let b = tokio::spawn({
                let service = service.clone();
                async move { service.submit_for_evaluation(user, second.id).await }
            });
            let outcomes = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];

            let queued = outcomes.iter().filter(|o| matches!(o, SubmitOutcome::Queued(_))).count();
            let duplicates = outcomes.iter().filter(|o| matches!(o, SubmitOutcome::Duplicate(_))).count();
            assert_eq!((queued, duplicates), (1, 1));
            assert_eq!(store.stats().await.unwrap().queued, 1);
        }
    }

    #[tokio::test]
    async fn short_essays_stay_draft() {
        let (service, _, _) = service();
        let user = UserId::new();
        let draft = service.create_submission(user, task1(), &essay(90)).await.unwrap();

        let err = service.submit_for_evaluation(user, draft.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(msg) if msg.contains("150")));
        assert_eq!(service.get_status(user, draft.id).await.unwrap().status, SubmissionStatus::Draft);
    }

    #[tokio::test]
    async fn drafts_are_revisable_until_submitted() {
        let (service, _, _) = service();
        let user = UserId::new();
        let draft = service.create_submission(user, task1(), &essay(10)).await.unwrap();

        let revised = service.revise_draft(user, draft.id, &essay(160)).await.unwrap();
        assert_eq!(revised.word_count, 160);
        service.submit_for_evaluation(user, draft.id).await.unwrap();

        let err = service.revise_draft(user, draft.id, "too late").await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn other_users_cannot_see_submissions() {
        let (service, _, _) = service();
        let owner = UserId::new();
        let draft = service.create_submission(owner, task1(), &essay(200)).await.unwrap();

        let err = service.get_status(UserId::new(), draft.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(id) if id == draft.id));
        assert!(service.submit_for_evaluation(UserId::new(), draft.id).await.is_err());
    }

    #[tokio::test]
    async fn retry_only_from_failed() {
        let (service, store, bus) = service();
        let sub = bus.subscribe();
        let user = UserId::new();
        let draft = service.create_submission(user, task1(), &essay(200)).await.unwrap();
        service.submit_for_evaluation(user, draft.id).await.unwrap();

        let err = service.retry_failed(user, draft.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition(_)));

        let claimed = store
            .claim_next(&WorkerId::new("w"), Utc::now(), &ClaimPolicy::default())
            .await
            .unwrap()
            .unwrap();
        store
            .fail(&claimed.token, JobError::new(FailureKind::Unauthorized, "401 from provider"), Utc::now())
            .await
            .unwrap();

        let view = service.get_status(user, draft.id).await.unwrap();
        assert_eq!(view.status, SubmissionStatus::Failed);
        assert!(!view.error.unwrap().contains("401"));

        let retried = service.retry_failed(user, draft.id).await.unwrap();
        assert_eq!(retried.status, SubmissionStatus::Pending);
        let view = service.get_status(user, draft.id).await.unwrap();
        assert_eq!(view.attempt_count, 0);
        assert!(view.error.is_none() && view.completed_at.is_none());

        let targets: Vec<_> = sub.drain().into_iter().map(|e| (e.from, e.to)).collect();
        assert_eq!(
            targets,
            vec![
                (SubmissionStatus::Draft, SubmissionStatus::Pending),
                (SubmissionStatus::Failed, SubmissionStatus::Pending),
            ]
        );
    }

    #[tokio::test]
    async fn history_excludes_drafts() {
        let (service, _, _) = service();
        let user = UserId::new();
        let submitted = service.create_submission(user, task1(), &essay(200)).await.unwrap();
        service.submit_for_evaluation(user, submitted.id).await.unwrap();
        service.create_submission(user, task1(), &essay(20)).await.unwrap();

        let page = service.list_submissions(user, 1).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, submitted.id);
        assert!(!page.has_next);
    }
}
