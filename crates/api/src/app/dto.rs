use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bandscore_core::{
    BandScore, Submission, SubmissionId, SubmissionStatus, TaskId, TaskType, WritingTask,
};
use bandscore_infra::jobs::SubmissionPage;

// -------------------------
// Request DTOs
// -------------------------

/// Task snapshot supplied by the caller. `id` defaults to a fresh task id and
/// `min_words` to the examiner minimum for the task kind.
#[derive(Debug, Deserialize)]
pub struct TaskRequest {
    pub id: Option<TaskId>,
    pub task_type: TaskType,
    pub prompt: String,
    pub min_words: Option<u32>,
}

impl TaskRequest {
    pub fn into_task(self) -> WritingTask {
        let task = WritingTask::new(self.id.unwrap_or_default(), self.task_type, self.prompt);
        match self.min_words {
            Some(min) => task.with_min_words(min),
            None => task,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSubmissionRequest {
    pub task: TaskRequest,
    #[serde(default)]
    pub essay_text: String,
}

#[derive(Debug, Deserialize)]
pub struct ReviseDraftRequest {
    pub essay_text: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct SubmissionResponse {
    pub id: SubmissionId,
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub status: SubmissionStatus,
    pub word_count: u32,
    pub min_words: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
}

impl From<&Submission> for SubmissionResponse {
    fn from(s: &Submission) -> Self {
        Self {
            id: s.id,
            task_id: s.task.id,
            task_type: s.task.task_type,
            status: s.status,
            word_count: s.word_count,
            min_words: s.task.min_words,
            created_at: s.created_at,
            updated_at: s.updated_at,
            submitted_at: s.submitted_at,
        }
    }
}

/// Response of `POST /submissions/:id/submit`.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    #[serde(flatten)]
    pub submission: SubmissionResponse,
    /// `queued`, `already_queued` or `duplicate`.
    pub outcome: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HistoryItem {
    pub id: SubmissionId,
    pub task_type: TaskType,
    pub status: SubmissionStatus,
    pub word_count: u32,
    pub overall_band: Option<BandScore>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Submission> for HistoryItem {
    fn from(s: &Submission) -> Self {
        Self {
            id: s.id,
            task_type: s.task.task_type,
            status: s.status,
            word_count: s.word_count,
            overall_band: s.result.as_ref().map(|r| r.overall_band()),
            submitted_at: s.submitted_at,
            completed_at: s.completed_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub items: Vec<HistoryItem>,
    pub page: u32,
    pub has_next: bool,
}

impl From<SubmissionPage> for HistoryResponse {
    fn from(page: SubmissionPage) -> Self {
        Self {
            items: page.items.iter().map(HistoryItem::from).collect(),
            page: page.page,
            has_next: page.has_next,
        }
    }
}
