//! Durable evaluation jobs: records, retry policy and storage.
//!
//! ## Design
//!
//! - One job per evaluation request; a manual retry creates a new job
//! - A claim is a lease: `visible_after` doubles as its expiry
//! - Post-claim writes present a [`ClaimToken`] and are rejected once the
//!   lease was taken over
//! - Transient failures back off exponentially; permanent ones fail at once

pub mod postgres;
pub mod retry;
pub mod store;
pub mod types;

pub use postgres::PostgresJobStore;
pub use retry::{GiveUpReason, RetryDecision, RetryPolicy};
pub use store::{
    ClaimedJob, EnqueueOutcome, InMemoryJobStore, JobStats, JobStore, JobStoreError, JobUpdate, PAGE_SIZE,
    SubmissionPage,
};
pub use types::{ClaimPolicy, ClaimToken, EvaluationJob, FailureKind, JobError, JobEvent, JobStatus};
