//! Submission aggregate and its lifecycle state machine.
//!
//! ```text
//! DRAFT ──submit──▶ PENDING ──start──▶ PROCESSING ──score──▶ SCORED
//!                     ▲                   │   │
//!                     └──retry scheduled──┘   └──fail──▶ FAILED
//!                     ▲                                     │
//!                     └────────────manual retry─────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::evaluation::EvaluationResult;
use crate::id::{SubmissionId, UserId};
use crate::task::WritingTask;
use crate::text::{clean_essay_text, count_words};

/// Where a submission is in its life.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    Draft,
    Pending,
    Processing,
    Scored,
    Failed,
}

/// Something that happened to a submission.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The author asked for evaluation.
    Submit,
    /// A worker claimed the evaluation job.
    StartProcessing,
    /// A transient failure pushed the job back to the queue.
    RetryScheduled,
    /// The evaluation succeeded.
    Score,
    /// The evaluation failed for good.
    Fail,
    /// Someone explicitly re-requested a failed evaluation.
    ManualRetry,
}

impl SubmissionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubmissionStatus::Draft => "DRAFT",
            SubmissionStatus::Pending => "PENDING",
            SubmissionStatus::Processing => "PROCESSING",
            SubmissionStatus::Scored => "SCORED",
            SubmissionStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(SubmissionStatus::Draft),
            "PENDING" => Some(SubmissionStatus::Pending),
            "PROCESSING" => Some(SubmissionStatus::Processing),
            "SCORED" => Some(SubmissionStatus::Scored),
            "FAILED" => Some(SubmissionStatus::Failed),
            _ => None,
        }
    }

    /// Waiting for or undergoing evaluation.
    pub fn is_in_flight(self) -> bool {
        matches!(self, SubmissionStatus::Pending | SubmissionStatus::Processing)
    }

    /// The only transition function for submission status.
    pub fn transition(self, event: LifecycleEvent) -> DomainResult<SubmissionStatus> {
        use LifecycleEvent as E;
        use SubmissionStatus as S;

        match (self, event) {
            (S::Draft, E::Submit) => Ok(S::Pending),
            (S::Pending, E::StartProcessing) => Ok(S::Processing),
            (S::Processing, E::RetryScheduled) => Ok(S::Pending),
            (S::Processing, E::Score) => Ok(S::Scored),
            (S::Processing, E::Fail) => Ok(S::Failed),
            (S::Failed, E::ManualRetry) => Ok(S::Pending),
            (from, event) => Err(DomainError::invalid_transition(format!(
                "{event:?} is not allowed from {}",
                from.as_str()
            ))),
        }
    }
}

impl core::fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An essay written by a user for a writing task.
///
/// Fields are public for storage adapters; status changes must go through
/// [`Submission::apply`] (or the helpers built on it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub user_id: UserId,
    pub task: WritingTask,
    pub essay_text: String,
    pub word_count: u32,
    pub status: SubmissionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<EvaluationResult>,
    /// User-readable failure summary (FAILED only).
    pub error_message: Option<String>,
}

impl Submission {
    /// Start a new draft.
    pub fn draft(
        id: SubmissionId,
        user_id: UserId,
        task: WritingTask,
        essay_text: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let essay_text = clean_essay_text(essay_text);
        Self {
            id,
            user_id,
            task,
            word_count: count_words(&essay_text),
            essay_text,
            status: SubmissionStatus::Draft,
            created_at: now,
            updated_at: now,
            submitted_at: None,
            completed_at: None,
            result: None,
            error_message: None,
        }
    }

    /// Replace the essay text. Only drafts can be edited.
    pub fn revise(&mut self, essay_text: &str, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != SubmissionStatus::Draft {
            return Err(DomainError::invalid_transition(format!(
                "essay text is immutable once {}",
                self.status
            )));
        }
        self.essay_text = clean_essay_text(essay_text);
        self.word_count = count_words(&self.essay_text);
        self.updated_at = now;
        Ok(())
    }

    /// Request evaluation of a draft.
    pub fn submit(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status == SubmissionStatus::Draft && self.word_count < self.task.min_words {
            return Err(DomainError::validation(format!(
                "essay has {} words; {} requires at least {}",
                self.word_count,
                self.task.task_type.label(),
                self.task.min_words
            )));
        }
        self.apply(LifecycleEvent::Submit, now)?;
        self.submitted_at = Some(now);
        Ok(())
    }

    /// Apply a lifecycle event, updating bookkeeping timestamps.
    pub fn apply(&mut self, event: LifecycleEvent, now: DateTime<Utc>) -> DomainResult<()> {
        self.status = self.status.transition(event)?;
        self.updated_at = now;
        match event {
            LifecycleEvent::Score | LifecycleEvent::Fail => self.completed_at = Some(now),
            LifecycleEvent::ManualRetry => {
                self.completed_at = None;
                self.error_message = None;
                self.result = None;
            }
            _ => {}
        }
        Ok(())
    }

    /// PROCESSING → SCORED with the evaluation attached.
    pub fn record_score(&mut self, result: EvaluationResult, now: DateTime<Utc>) -> DomainResult<()> {
        self.apply(LifecycleEvent::Score, now)?;
        self.result = Some(result);
        self.error_message = None;
        Ok(())
    }

    /// PROCESSING → FAILED with a user-readable summary.
    pub fn record_failure(&mut self, summary: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        self.apply(LifecycleEvent::Fail, now)?;
        self.error_message = Some(summary.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::TaskId;
    use crate::task::TaskType;
    use proptest::prelude::*;

    fn task(min_words: u32) -> WritingTask {
        WritingTask::new(TaskId::new(), TaskType::Task2, "Discuss both views.").with_min_words(min_words)
    }

    fn essay(words: usize) -> String {
        vec!["word"; words].join(" ")
    }

    fn draft(min_words: u32, words: usize) -> Submission {
        Submission::draft(SubmissionId::new(), UserId::new(), task(min_words), &essay(words), Utc::now())
    }

    #[test]
    fn happy_path_reaches_scored() {
        let mut s = draft(10, 12);
        let now = Utc::now();
        s.submit(now).unwrap();
        assert_eq!(s.status, SubmissionStatus::Pending);
        assert_eq!(s.submitted_at, Some(now));

        s.apply(LifecycleEvent::StartProcessing, now).unwrap();
        s.apply(LifecycleEvent::RetryScheduled, now).unwrap();
        s.apply(LifecycleEvent::StartProcessing, now).unwrap();
        s.apply(LifecycleEvent::Fail, now).unwrap();
        assert_eq!(s.status, SubmissionStatus::Failed);
        assert!(s.completed_at.is_some());

        s.apply(LifecycleEvent::ManualRetry, now).unwrap();
        assert_eq!(s.status, SubmissionStatus::Pending);
        assert!(s.completed_at.is_none());
    }

    #[test]
    fn submit_enforces_minimum_words() {
        let mut s = draft(250, 120);
        let err = s.submit(Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(s.status, SubmissionStatus::Draft);
    }

    #[test]
    fn text_is_frozen_after_submit() {
        let mut s = draft(1, 5);
        s.revise("a fresh draft of six words", Utc::now()).unwrap();
        assert_eq!(s.word_count, 6);
        s.submit(Utc::now()).unwrap();
        let err = s.revise("changed", Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
        assert_eq!(s.word_count, 6);
    }

    #[test]
    fn no_transition_skips_a_state() {
        assert!(SubmissionStatus::Draft.transition(LifecycleEvent::StartProcessing).is_err());
        assert!(SubmissionStatus::Pending.transition(LifecycleEvent::Score).is_err());
        assert!(SubmissionStatus::Scored.transition(LifecycleEvent::ManualRetry).is_err());
        assert!(SubmissionStatus::Processing.transition(LifecycleEvent::Submit).is_err());
    }

    fn any_event() -> impl Strategy<Value = LifecycleEvent> {
        prop_oneof![
            Just(LifecycleEvent::Submit),
            Just(LifecycleEvent::StartProcessing),
            Just(LifecycleEvent::RetryScheduled),
            Just(LifecycleEvent::Score),
            Just(LifecycleEvent::Fail),
            Just(LifecycleEvent::ManualRetry),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        #[test]
        fn observed_statuses_follow_the_lifecycle(events in proptest::collection::vec(any_event(), 0..40)) {
            use SubmissionStatus as S;

            let mut status = S::Draft;
            for event in events {
                let before = status;
                if let Ok(next) = status.transition(event) {
                    let allowed = matches!(
                        (before, next),
                        (S::Draft, S::Pending)
                            | (S::Pending, S::Processing)
                            | (S::Processing, S::Pending)
                            | (S::Processing, S::Scored)
                            | (S::Processing, S::Failed)
                            | (S::Failed, S::Pending)
                    );
                    prop_assert!(allowed, "{:?} -> {:?}", before, next);
                    status = next;
                }
                prop_assert!(before != S::Scored || status == S::Scored);
                prop_assert!(before == S::Draft || status != S::Draft);
            }
        }
    }
}
