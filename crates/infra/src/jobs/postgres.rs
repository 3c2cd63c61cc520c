//! Postgres-backed job store.
//!
//! Every operation runs in one transaction. Rows are locked with
//! `SELECT ... FOR UPDATE` before the domain state machines are applied, and
//! `claim_next` uses `FOR UPDATE SKIP LOCKED` so concurrent workers never wait
//! on (or double-claim) the same job.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Code | JobStoreError |
//! |------------|-----------------|---------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | any | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use bandscore_core::{
    DomainError, EvaluationResult, JobId, LifecycleEvent, Submission, SubmissionId, SubmissionStatus,
    TaskId, TaskType, UserId, WorkerId, WritingTask,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{info, instrument};
use uuid::Uuid;

use super::store::{ClaimedJob, EnqueueOutcome, JobStats, JobStore, JobStoreError, JobUpdate, PAGE_SIZE, SubmissionPage};
use super::types::{ClaimPolicy, ClaimToken, EvaluationJob, FailureKind, JobError, JobStatus};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS submissions (
        id             UUID PRIMARY KEY,
        user_id        UUID NOT NULL,
        task_id        UUID NOT NULL,
        task_type      TEXT NOT NULL,
        task_prompt    TEXT NOT NULL,
        min_words      INTEGER NOT NULL,
        essay_text     TEXT NOT NULL,
        word_count     INTEGER NOT NULL,
        status         TEXT NOT NULL,
        created_at     TIMESTAMPTZ NOT NULL,
        updated_at     TIMESTAMPTZ NOT NULL,
        submitted_at   TIMESTAMPTZ,
        completed_at   TIMESTAMPTZ,
        result         JSONB,
        error_message  TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS submissions_user_created_idx
        ON submissions (user_id, created_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS evaluation_jobs (
        id             UUID PRIMARY KEY,
        submission_id  UUID NOT NULL REFERENCES submissions(id),
        status         TEXT NOT NULL,
        attempt_count  INTEGER NOT NULL DEFAULT 0,
        claimed_by     TEXT,
        claimed_at     TIMESTAMPTZ,
        visible_after  TIMESTAMPTZ NOT NULL,
        last_error     JSONB,
        result         JSONB,
        created_at     TIMESTAMPTZ NOT NULL,
        updated_at     TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS evaluation_jobs_claim_idx
        ON evaluation_jobs (status, visible_after, created_at)
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS evaluation_jobs_one_active_idx
        ON evaluation_jobs (submission_id)
        WHERE status IN ('QUEUED', 'CLAIMED', 'RETRY_SCHEDULED')
    "#,
];

const SUBMISSION_COLUMNS: &str = "id, user_id, task_id, task_type, task_prompt, min_words, essay_text, word_count, \
     status, created_at, updated_at, submitted_at, completed_at, result, error_message";

const JOB_COLUMNS: &str = "id, submission_id, status, attempt_count, claimed_by, claimed_at, visible_after, \
     last_error, result, created_at, updated_at";

/// Postgres job store. Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Connect and make sure the schema exists.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Create tables and indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        info!("job store schema ready");
        Ok(())
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'static, Postgres>, JobStoreError> {
        self.pool.begin().await.map_err(|e| map_sqlx_error(operation, e))
    }

    /// Token check plus job and submission steps, under row locks.
    async fn finish<F, G>(
        &self,
        operation: &'static str,
        token: &ClaimToken,
        now: DateTime<Utc>,
        job_step: F,
        submission_step: G,
    ) -> Result<JobUpdate, JobStoreError>
    where
        F: FnOnce(&mut EvaluationJob) -> Result<(), DomainError> + Send,
        G: FnOnce(&mut Submission, &EvaluationJob) -> Result<(), DomainError> + Send,
    {
        let mut tx = self.begin(operation).await?;
        let update = finish_in(&mut tx, operation, token, now, job_step, submission_step).await?;
        tx.commit().await.map_err(|e| map_sqlx_error(operation, e))?;
        Ok(update)
    }
}

async fn finish_in<F, G>(
    tx: &mut Transaction<'static, Postgres>,
    operation: &'static str,
    token: &ClaimToken,
    now: DateTime<Utc>,
    job_step: F,
    submission_step: G,
) -> Result<JobUpdate, JobStoreError>
where
    F: FnOnce(&mut EvaluationJob) -> Result<(), DomainError> + Send,
    G: FnOnce(&mut Submission, &EvaluationJob) -> Result<(), DomainError> + Send,
{
    let mut job = lock_job(tx, operation, token.job_id)
        .await?
        .ok_or(JobStoreError::JobNotFound(token.job_id))?;
    job.check_token(token)?;
    job_step(&mut job)?;

    let mut submission = lock_submission(tx, operation, job.submission_id)
        .await?
        .ok_or(JobStoreError::SubmissionNotFound(job.submission_id))?;
    let previous_status = submission.status;
    submission_step(&mut submission, &job)?;
    submission.updated_at = now;

    save_job(tx, operation, &job).await?;
    save_submission(tx, operation, &submission).await?;
    Ok(JobUpdate {
        job,
        submission,
        previous_status,
    })
}

async fn lock_submission(
    tx: &mut Transaction<'static, Postgres>,
    operation: &str,
    id: SubmissionId,
) -> Result<Option<Submission>, JobStoreError> {
    let row = sqlx::query(&format!("SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE id = $1 FOR UPDATE"))
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;
    row.map(|r| decode_submission(&r)).transpose()
}

/// Serializes duplicate checks for one user and task until the transaction ends.
async fn lock_user_task(
    tx: &mut Transaction<'static, Postgres>,
    operation: &str,
    user: UserId,
    task: TaskId,
) -> Result<(), JobStoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text || ':' || $2::text, 0))")
        .bind(user.as_uuid())
        .bind(task.as_uuid())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(())
}

async fn recent_in_flight_in(
    tx: &mut Transaction<'static, Postgres>,
    operation: &str,
    user: UserId,
    task: TaskId,
    since: DateTime<Utc>,
) -> Result<Option<Submission>, JobStoreError> {
    let row = sqlx::query(&format!(
        "SELECT {SUBMISSION_COLUMNS} FROM submissions \
         WHERE user_id = $1 AND task_id = $2 \
           AND status IN ('PENDING', 'PROCESSING') \
           AND submitted_at >= $3 \
         ORDER BY submitted_at DESC LIMIT 1"
    ))
    .bind(user.as_uuid())
    .bind(task.as_uuid())
    .bind(since)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;
    row.map(|r| decode_submission(&r)).transpose()
}

async fn lock_job(
    tx: &mut Transaction<'static, Postgres>,
    operation: &str,
    id: JobId,
) -> Result<Option<EvaluationJob>, JobStoreError> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM evaluation_jobs WHERE id = $1 FOR UPDATE"))
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;
    row.map(|r| decode_job(&r)).transpose()
}

async fn latest_job_in(
    tx: &mut Transaction<'static, Postgres>,
    operation: &str,
    submission: SubmissionId,
) -> Result<Option<EvaluationJob>, JobStoreError> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM evaluation_jobs WHERE submission_id = $1 ORDER BY created_at DESC, id DESC LIMIT 1"
    ))
    .bind(submission.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;
    row.map(|r| decode_job(&r)).transpose()
}

async fn save_submission(
    tx: &mut Transaction<'static, Postgres>,
    operation: &str,
    s: &Submission,
) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        UPDATE submissions
        SET essay_text = $2,
            word_count = $3,
            status = $4,
            updated_at = $5,
            submitted_at = $6,
            completed_at = $7,
            result = $8,
            error_message = $9
        WHERE id = $1
        "#,
    )
    .bind(s.id.as_uuid())
    .bind(&s.essay_text)
    .bind(s.word_count as i32)
    .bind(s.status.as_str())
    .bind(s.updated_at)
    .bind(s.submitted_at)
    .bind(s.completed_at)
    .bind(encode_json(&s.result)?)
    .bind(&s.error_message)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(())
}

async fn insert_job(
    tx: &mut Transaction<'static, Postgres>,
    operation: &str,
    job: &EvaluationJob,
) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        INSERT INTO evaluation_jobs (id, submission_id, status, attempt_count, visible_after, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.submission_id.as_uuid())
    .bind(job.status.as_str())
    .bind(job.attempt_count as i32)
    .bind(job.visible_after)
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(())
}

async fn save_job(
    tx: &mut Transaction<'static, Postgres>,
    operation: &str,
    job: &EvaluationJob,
) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        UPDATE evaluation_jobs
        SET status = $2,
            attempt_count = $3,
            claimed_by = $4,
            claimed_at = $5,
            visible_after = $6,
            last_error = $7,
            result = $8,
            updated_at = $9
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.status.as_str())
    .bind(job.attempt_count as i32)
    .bind(job.claimed_by.as_ref().map(WorkerId::as_str))
    .bind(job.claimed_at)
    .bind(job.visible_after)
    .bind(encode_json(&job.last_error)?)
    .bind(encode_json(&job.result)?)
    .bind(job.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(())
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, submission), fields(submission_id = %submission.id), err)]
    async fn insert_submission(&self, submission: &Submission) -> Result<(), JobStoreError> {
        let s = submission;
        sqlx::query(&format!(
            "INSERT INTO submissions ({SUBMISSION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
        ))
        .bind(s.id.as_uuid())
        .bind(s.user_id.as_uuid())
        .bind(s.task.id.as_uuid())
        .bind(s.task.task_type.as_str())
        .bind(&s.task.prompt)
        .bind(s.task.min_words as i32)
        .bind(&s.essay_text)
        .bind(s.word_count as i32)
        .bind(s.status.as_str())
        .bind(s.created_at)
        .bind(s.updated_at)
        .bind(s.submitted_at)
        .bind(s.completed_at)
        .bind(encode_json(&s.result)?)
        .bind(&s.error_message)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_submission", e))?;
        Ok(())
    }

    #[instrument(skip(self, submission), fields(submission_id = %submission.id), err)]
    async fn update_draft(&self, submission: &Submission) -> Result<(), JobStoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE submissions
            SET essay_text = $2, word_count = $3, updated_at = $4
            WHERE id = $1 AND status = 'DRAFT'
            "#,
        )
        .bind(submission.id.as_uuid())
        .bind(&submission.essay_text)
        .bind(submission.word_count as i32)
        .bind(submission.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_draft", e))?;

        if updated.rows_affected() == 1 {
            return Ok(());
        }
        match self.get_submission(submission.id).await? {
            Some(stored) => Err(DomainError::invalid_transition(format!(
                "essay text is immutable once {}",
                stored.status
            ))
            .into()),
            None => Err(JobStoreError::SubmissionNotFound(submission.id)),
        }
    }

    #[instrument(skip(self), fields(submission_id = %id), err)]
    async fn get_submission(&self, id: SubmissionId) -> Result<Option<Submission>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_submission", e))?;
        row.map(|r| decode_submission(&r)).transpose()
    }

    #[instrument(skip(self), fields(user_id = %user), err)]
    async fn list_submissions(&self, user: UserId, page: u32) -> Result<SubmissionPage, JobStoreError> {
        let page = page.max(1);
        let offset = i64::from(page - 1) * i64::from(PAGE_SIZE);
        let rows = sqlx::query(&format!(
            "SELECT {SUBMISSION_COLUMNS} FROM submissions \
             WHERE user_id = $1 AND status <> 'DRAFT' \
             ORDER BY created_at DESC, id DESC \
             LIMIT $2 OFFSET $3"
        ))
        .bind(user.as_uuid())
        .bind(i64::from(PAGE_SIZE) + 1)
        .bind(offset)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_submissions", e))?;

        let mut items = rows.iter().map(decode_submission).collect::<Result<Vec<_>, _>>()?;
        let has_next = items.len() > PAGE_SIZE as usize;
        items.truncate(PAGE_SIZE as usize);
        Ok(SubmissionPage { items, page, has_next })
    }

    #[instrument(skip(self), fields(submission_id = %id), err)]
    async fn enqueue_deduplicated(
        &self,
        id: SubmissionId,
        now: DateTime<Utc>,
        duplicate_since: Option<DateTime<Utc>>,
    ) -> Result<EnqueueOutcome, JobStoreError> {
        let mut tx = self.begin("enqueue").await?;
        let mut submission = lock_submission(&mut tx, "enqueue", id)
            .await?
            .ok_or(JobStoreError::SubmissionNotFound(id))?;

        if submission.status.is_in_flight() {
            let job = latest_job_in(&mut tx, "enqueue", id).await?;
            tx.commit().await.map_err(|e| map_sqlx_error("enqueue", e))?;
            return Ok(EnqueueOutcome::AlreadyQueued { submission, job });
        }

        if let Some(since) = duplicate_since.filter(|_| submission.status == SubmissionStatus::Draft) {
            lock_user_task(&mut tx, "enqueue", submission.user_id, submission.task.id).await?;
            if let Some(existing) =
                recent_in_flight_in(&mut tx, "enqueue", submission.user_id, submission.task.id, since).await?
            {
                tx.commit().await.map_err(|e| map_sqlx_error("enqueue", e))?;
                return Ok(EnqueueOutcome::Duplicate { existing });
            }
        }

        submission.submit(now)?;
        let job = EvaluationJob::new(id, now);
        save_submission(&mut tx, "enqueue", &submission).await?;
        insert_job(&mut tx, "enqueue", &job).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("enqueue", e))?;
        Ok(EnqueueOutcome::Queued { submission, job })
    }

    #[instrument(skip(self), fields(submission_id = %id), err)]
    async fn requeue_failed(&self, id: SubmissionId, now: DateTime<Utc>) -> Result<(Submission, EvaluationJob), JobStoreError> {
        let mut tx = self.begin("requeue_failed").await?;
        let mut submission = lock_submission(&mut tx, "requeue_failed", id)
            .await?
            .ok_or(JobStoreError::SubmissionNotFound(id))?;
        submission.apply(LifecycleEvent::ManualRetry, now)?;

        let job = EvaluationJob::new(id, now);
        save_submission(&mut tx, "requeue_failed", &submission).await?;
        insert_job(&mut tx, "requeue_failed", &job).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("requeue_failed", e))?;
        Ok((submission, job))
    }

    #[instrument(skip(self, policy), fields(worker_id = %worker), err)]
    async fn claim_next(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
        policy: &ClaimPolicy,
    ) -> Result<Option<ClaimedJob>, JobStoreError> {
        let mut tx = self.begin("claim_next").await?;
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM evaluation_jobs \
             WHERE visible_after <= $1 \
               AND (status IN ('QUEUED', 'RETRY_SCHEDULED') \
                    OR (status = 'CLAIMED' AND attempt_count < $2)) \
             ORDER BY visible_after, created_at \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(now)
        .bind(policy.max_attempts as i32)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut job = decode_job(&row)?;
        let reclaimed = job.status == JobStatus::Claimed;

        let mut submission = lock_submission(&mut tx, "claim_next", job.submission_id)
            .await?
            .ok_or(JobStoreError::SubmissionNotFound(job.submission_id))?;
        if !reclaimed {
            submission
                .apply(LifecycleEvent::StartProcessing, now)
                .map_err(|e| JobStoreError::ClaimConflict(e.to_string()))?;
        }
        let token = job.claim(worker, now, policy.stale_after)?;

        save_job(&mut tx, "claim_next", &job).await?;
        save_submission(&mut tx, "claim_next", &submission).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("claim_next", e))?;

        Ok(Some(ClaimedJob {
            job,
            submission,
            token,
            reclaimed,
        }))
    }

    #[instrument(skip(self, policy), err)]
    async fn expire_stale_claims(&self, now: DateTime<Utc>, policy: &ClaimPolicy) -> Result<Vec<JobUpdate>, JobStoreError> {
        let mut tx = self.begin("expire_stale_claims").await?;
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM evaluation_jobs \
             WHERE status = 'CLAIMED' AND visible_after <= $1 AND attempt_count >= $2 \
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(now)
        .bind(policy.max_attempts as i32)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("expire_stale_claims", e))?;

        let mut updates = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(token) = decode_job(row)?.token() else {
                continue;
            };
            let error = JobError::new(
                FailureKind::AttemptsExhausted,
                format!("claim by {} expired after {} attempts", token.worker_id, token.attempt),
            );
            let summary = error.user_summary();
            updates.push(
                finish_in(
                    &mut tx,
                    "expire_stale_claims",
                    &token,
                    now,
                    |job| job.fail(error, now),
                    |submission, _| submission.record_failure(summary, now),
                )
                .await?,
            );
        }
        tx.commit().await.map_err(|e| map_sqlx_error("expire_stale_claims", e))?;
        Ok(updates)
    }

    #[instrument(skip(self, result), fields(job_id = %token.job_id, attempt = token.attempt), err)]
    async fn complete(&self, token: &ClaimToken, result: EvaluationResult, now: DateTime<Utc>) -> Result<JobUpdate, JobStoreError> {
        self.finish(
            "complete",
            token,
            now,
            |job| job.succeed(result, now),
            |submission, job| match &job.result {
                Some(result) => submission.record_score(result.clone(), now),
                None => Err(DomainError::validation("succeeded job has no result")),
            },
        )
        .await
    }

    #[instrument(skip(self, error), fields(job_id = %token.job_id, attempt = token.attempt), err)]
    async fn schedule_retry(
        &self,
        token: &ClaimToken,
        error: JobError,
        visible_after: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<JobUpdate, JobStoreError> {
        self.finish(
            "schedule_retry",
            token,
            now,
            |job| job.schedule_retry(error, visible_after, now),
            |submission, _| submission.apply(LifecycleEvent::RetryScheduled, now),
        )
        .await
    }

    #[instrument(skip(self, error), fields(job_id = %token.job_id, attempt = token.attempt), err)]
    async fn fail(&self, token: &ClaimToken, error: JobError, now: DateTime<Utc>) -> Result<JobUpdate, JobStoreError> {
        let summary = error.user_summary();
        self.finish(
            "fail",
            token,
            now,
            |job| job.fail(error, now),
            |submission, _| submission.record_failure(summary, now),
        )
        .await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get_job(&self, id: JobId) -> Result<Option<EvaluationJob>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM evaluation_jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.map(|r| decode_job(&r)).transpose()
    }

    #[instrument(skip(self), fields(submission_id = %submission), err)]
    async fn latest_job(&self, submission: SubmissionId) -> Result<Option<EvaluationJob>, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM evaluation_jobs WHERE submission_id = $1 ORDER BY created_at DESC, id DESC LIMIT 1"
        ))
        .bind(submission.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_job", e))?;
        row.map(|r| decode_job(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM evaluation_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let status = JobStatus::parse(&status)
                .ok_or_else(|| JobStoreError::Storage(format!("unknown job status in database: {status}")))?;
            stats.record(status, n.max(0) as usize);
        }
        Ok(stats)
    }
}

/// Raw `submissions` row.
struct SubmissionRow {
    id: Uuid,
    user_id: Uuid,
    task_id: Uuid,
    task_type: String,
    task_prompt: String,
    min_words: i32,
    essay_text: String,
    word_count: i32,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    submitted_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    result: Option<serde_json::Value>,
    error_message: Option<String>,
}

impl<'r> FromRow<'r, PgRow> for SubmissionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(SubmissionRow {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            task_id: row.try_get("task_id")?,
            task_type: row.try_get("task_type")?,
            task_prompt: row.try_get("task_prompt")?,
            min_words: row.try_get("min_words")?,
            essay_text: row.try_get("essay_text")?,
            word_count: row.try_get("word_count")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            submitted_at: row.try_get("submitted_at")?,
            completed_at: row.try_get("completed_at")?,
            result: row.try_get("result")?,
            error_message: row.try_get("error_message")?,
        })
    }
}

impl TryFrom<SubmissionRow> for Submission {
    type Error = JobStoreError;

    fn try_from(row: SubmissionRow) -> Result<Self, Self::Error> {
        let task_type = TaskType::parse(&row.task_type)
            .ok_or_else(|| JobStoreError::Storage(format!("unknown task type in database: {}", row.task_type)))?;
        let status = SubmissionStatus::parse(&row.status)
            .ok_or_else(|| JobStoreError::Storage(format!("unknown submission status in database: {}", row.status)))?;
        let task = WritingTask::new(TaskId::from_uuid(row.task_id), task_type, row.task_prompt)
            .with_min_words(row.min_words.max(0) as u32);

        Ok(Submission {
            id: SubmissionId::from_uuid(row.id),
            user_id: UserId::from_uuid(row.user_id),
            task,
            essay_text: row.essay_text,
            word_count: row.word_count.max(0) as u32,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
            submitted_at: row.submitted_at,
            completed_at: row.completed_at,
            result: decode_json(row.result)?,
            error_message: row.error_message,
        })
    }
}

/// Raw `evaluation_jobs` row.
struct JobRow {
    id: Uuid,
    submission_id: Uuid,
    status: String,
    attempt_count: i32,
    claimed_by: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    visible_after: DateTime<Utc>,
    last_error: Option<serde_json::Value>,
    result: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            submission_id: row.try_get("submission_id")?,
            status: row.try_get("status")?,
            attempt_count: row.try_get("attempt_count")?,
            claimed_by: row.try_get("claimed_by")?,
            claimed_at: row.try_get("claimed_at")?,
            visible_after: row.try_get("visible_after")?,
            last_error: row.try_get("last_error")?,
            result: row.try_get("result")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for EvaluationJob {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| JobStoreError::Storage(format!("unknown job status in database: {}", row.status)))?;
        Ok(EvaluationJob {
            id: JobId::from_uuid(row.id),
            submission_id: SubmissionId::from_uuid(row.submission_id),
            status,
            attempt_count: row.attempt_count.max(0) as u32,
            claimed_by: row.claimed_by.map(WorkerId::new),
            claimed_at: row.claimed_at,
            visible_after: row.visible_after,
            last_error: decode_json(row.last_error)?,
            result: decode_json(row.result)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode_submission(row: &PgRow) -> Result<Submission, JobStoreError> {
    SubmissionRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to decode submission row: {e}")))?
        .try_into()
}

fn decode_job(row: &PgRow) -> Result<EvaluationJob, JobStoreError> {
    JobRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to decode job row: {e}")))?
        .try_into()
}

fn encode_json<T: serde::Serialize>(value: &Option<T>) -> Result<Option<serde_json::Value>, JobStoreError> {
    value
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| JobStoreError::Storage(format!("failed to encode column: {e}")))
}

fn decode_json<T: serde::de::DeserializeOwned>(value: Option<serde_json::Value>) -> Result<Option<T>, JobStoreError> {
    value
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| JobStoreError::Storage(format!("failed to decode column: {e}")))
}

/// Map SQLx errors to `JobStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => JobStoreError::Conflict(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => JobStoreError::Storage(format!("connection pool closed in {operation}")),
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
