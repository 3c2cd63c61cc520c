//! Evaluation job record and its state machine.

use std::time::Duration;

use bandscore_ai::ProviderErrorKind;
use bandscore_core::{DomainError, EvaluationResult, JobId, SubmissionId, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::store::JobStoreError;

/// Job execution status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for its first claim.
    Queued,
    /// Held by a worker. `visible_after` is the lease expiry.
    Claimed,
    /// Waiting out a backoff after a transient failure.
    RetryScheduled,
    Succeeded,
    /// Terminal; never picked up again automatically.
    Failed,
}

/// Something that happens to a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Claim,
    Succeed,
    ScheduleRetry,
    Fail,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Claimed,
        JobStatus::RetryScheduled,
        JobStatus::Succeeded,
        JobStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Claimed => "CLAIMED",
            JobStatus::RetryScheduled => "RETRY_SCHEDULED",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        JobStatus::ALL.into_iter().find(|status| status.as_str() == s)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Still owed an evaluation.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// The only transition function for job status.
    ///
    /// `Claimed + Claim` is the stale-lease reclaim; whether the lease really
    /// expired is the claimer's check.
    pub fn transition(self, event: JobEvent) -> Result<JobStatus, DomainError> {
        use JobEvent as E;
        use JobStatus as S;

        match (self, event) {
            (S::Queued | S::RetryScheduled | S::Claimed, E::Claim) => Ok(S::Claimed),
            (S::Claimed, E::Succeed) => Ok(S::Succeeded),
            (S::Claimed, E::ScheduleRetry) => Ok(S::RetryScheduled),
            (S::Claimed, E::Fail) => Ok(S::Failed),
            (from, event) => Err(DomainError::invalid_transition(format!(
                "job {event:?} is not allowed from {}",
                from.as_str()
            ))),
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job attempt failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RateLimited,
    InvalidResponse,
    Timeout,
    Unauthorized,
    Unknown,
    /// Retries ran out (or a stale claim could not be retried).
    AttemptsExhausted,
}

impl From<ProviderErrorKind> for FailureKind {
    fn from(kind: ProviderErrorKind) -> Self {
        match kind {
            ProviderErrorKind::RateLimited => FailureKind::RateLimited,
            ProviderErrorKind::InvalidResponse => FailureKind::InvalidResponse,
            ProviderErrorKind::Timeout => FailureKind::Timeout,
            ProviderErrorKind::Unauthorized => FailureKind::Unauthorized,
            ProviderErrorKind::Unknown => FailureKind::Unknown,
        }
    }
}

/// Last failure recorded on a job.
///
/// `message` is operator-facing and may contain provider detail; users only
/// ever see [`JobError::user_summary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: FailureKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn user_summary(&self) -> &'static str {
        match self.kind {
            FailureKind::RateLimited | FailureKind::Timeout | FailureKind::Unknown | FailureKind::AttemptsExhausted => {
                "The evaluation service is temporarily unavailable. Please try again later."
            }
            FailureKind::InvalidResponse => {
                "The evaluation service returned an unusable result. Please try again."
            }
            FailureKind::Unauthorized => {
                "Evaluation is currently unavailable due to a service configuration problem."
            }
        }
    }
}

/// Proof of ownership presented with every post-claim write.
///
/// A write is accepted only if the job is still CLAIMED by the same worker at
/// the same attempt; a reclaim bumps the attempt and invalidates older tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimToken {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub attempt: u32,
}

/// One evaluation request for one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationJob {
    pub id: JobId,
    pub submission_id: SubmissionId,
    pub status: JobStatus,
    /// Starts at 0, +1 per claim.
    pub attempt_count: u32,
    pub claimed_by: Option<WorkerId>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Not claimable before this instant.
    pub visible_after: DateTime<Utc>,
    pub last_error: Option<JobError>,
    pub result: Option<EvaluationResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Knobs for [`EvaluationJob::is_claimable`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ClaimPolicy {
    /// Lease length; a claim older than this may be taken over.
    pub stale_after: Duration,
    pub max_attempts: u32,
}

impl Default for ClaimPolicy {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(300),
            max_attempts: 3,
        }
    }
}

/// `at + d`, saturating at the far future.
pub(crate) fn after(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl EvaluationJob {
    pub fn new(submission_id: SubmissionId, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            submission_id,
            status: JobStatus::Queued,
            attempt_count: 0,
            claimed_by: None,
            claimed_at: None,
            visible_after: now,
            last_error: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Eligible for `claim_next` at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>, policy: &ClaimPolicy) -> bool {
        match self.status {
            JobStatus::Queued | JobStatus::RetryScheduled => self.visible_after <= now,
            JobStatus::Claimed => self.visible_after <= now && self.attempt_count < policy.max_attempts,
            JobStatus::Succeeded | JobStatus::Failed => false,
        }
    }

    /// Claimed, lease expired, and out of attempts.
    pub fn is_exhausted_stale_claim(&self, now: DateTime<Utc>, policy: &ClaimPolicy) -> bool {
        self.status == JobStatus::Claimed
            && self.visible_after <= now
            && self.attempt_count >= policy.max_attempts
    }

    pub fn token(&self) -> Option<ClaimToken> {
        match (self.status, &self.claimed_by) {
            (JobStatus::Claimed, Some(worker)) => Some(ClaimToken {
                job_id: self.id,
                worker_id: worker.clone(),
                attempt: self.attempt_count,
            }),
            _ => None,
        }
    }

    /// Compare-and-swap guard for post-claim writes.
    pub fn check_token(&self, token: &ClaimToken) -> Result<(), JobStoreError> {
        if self.token().as_ref() == Some(token) {
            Ok(())
        } else {
            Err(JobStoreError::StaleClaimReclaimed {
                job_id: token.job_id,
                worker_id: token.worker_id.clone(),
            })
        }
    }

    pub fn claim(&mut self, worker: &WorkerId, now: DateTime<Utc>, stale_after: Duration) -> Result<ClaimToken, DomainError> {
        self.status = self.status.transition(JobEvent::Claim)?;
        self.attempt_count += 1;
        self.claimed_by = Some(worker.clone());
        self.claimed_at = Some(now);
        self.visible_after = after(now, stale_after);
        self.updated_at = now;
        Ok(ClaimToken {
            job_id: self.id,
            worker_id: worker.clone(),
            attempt: self.attempt_count,
        })
    }

    pub fn succeed(&mut self, result: EvaluationResult, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.status = self.status.transition(JobEvent::Succeed)?;
        self.result = Some(result);
        self.updated_at = now;
        Ok(())
    }

    pub fn schedule_retry(&mut self, error: JobError, at: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.status = self.status.transition(JobEvent::ScheduleRetry)?;
        self.last_error = Some(error);
        self.visible_after = at;
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(&mut self, error: JobError, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.status = self.status.transition(JobEvent::Fail)?;
        self.last_error = Some(error);
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(name: &str) -> WorkerId {
        WorkerId::new(name)
    }

    #[test]
    fn claim_increments_attempt_and_sets_lease() {
        let now = Utc::now();
        let mut job = EvaluationJob::new(SubmissionId::new(), now);
        let token = job.claim(&worker("w1"), now, Duration::from_secs(60)).unwrap();

        assert_eq!(job.status, JobStatus::Claimed);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(token.attempt, 1);
        assert_eq!(job.visible_after, now + chrono::Duration::seconds(60));
        assert!(job.check_token(&token).is_ok());
    }

    #[test]
    fn reclaim_invalidates_previous_token() {
        let now = Utc::now();
        let mut job = EvaluationJob::new(SubmissionId::new(), now);
        let old = job.claim(&worker("w1"), now, Duration::from_secs(1)).unwrap();
        let later = now + chrono::Duration::seconds(2);
        let new = job.claim(&worker("w2"), later, Duration::from_secs(1)).unwrap();

        assert!(matches!(
            job.check_token(&old),
            Err(JobStoreError::StaleClaimReclaimed { .. })
        ));
        assert!(job.check_token(&new).is_ok());
        assert_eq!(job.attempt_count, 2);
    }

    #[test]
    fn same_worker_reclaim_is_still_detected() {
        let now = Utc::now();
        let mut job = EvaluationJob::new(SubmissionId::new(), now);
        let old = job.claim(&worker("w1"), now, Duration::from_secs(1)).unwrap();
        job.claim(&worker("w1"), now + chrono::Duration::seconds(2), Duration::from_secs(1))
            .unwrap();
        assert!(job.check_token(&old).is_err());
    }

    #[test]
    fn terminal_jobs_reject_everything() {
        for status in [JobStatus::Succeeded, JobStatus::Failed] {
            for event in [JobEvent::Claim, JobEvent::Succeed, JobEvent::ScheduleRetry, JobEvent::Fail] {
                assert!(status.transition(event).is_err());
            }
        }
        assert!(JobStatus::Queued.transition(JobEvent::Succeed).is_err());
    }

    #[test]
    fn claimability_respects_visibility_and_attempts() {
        let now = Utc::now();
        let policy = ClaimPolicy {
            stale_after: Duration::from_secs(10),
            max_attempts: 1,
        };
        let mut job = EvaluationJob::new(SubmissionId::new(), now);
        assert!(job.is_claimable(now, &policy));

        job.claim(&worker("w"), now, policy.stale_after).unwrap();
        let after_lease = now + chrono::Duration::seconds(11);
        assert!(!job.is_claimable(now, &policy));
        // out of attempts: not reclaimable, but expirable
        assert!(!job.is_claimable(after_lease, &policy));
        assert!(job.is_exhausted_stale_claim(after_lease, &policy));
    }

    #[test]
    fn user_summary_hides_provider_text() {
        let err = JobError::new(FailureKind::Unknown, "HTTP 500: upstream exploded at 0xdeadbeef");
        assert!(!err.user_summary().contains("0xdeadbeef"));
        assert_eq!(JobStatus::parse("RETRY_SCHEDULED"), Some(JobStatus::RetryScheduled));
        assert_eq!(JobStatus::parse("nope"), None);
    }
}
