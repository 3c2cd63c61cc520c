//! `bandscore-core` — domain foundation for essay evaluation.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, band scores, evaluation results, writing tasks, word counting,
//! and the submission lifecycle state machine.

pub mod band;
pub mod error;
pub mod evaluation;
pub mod id;
pub mod submission;
pub mod task;
pub mod text;

pub use band::{BandScore, Criterion};
pub use error::{DomainError, DomainResult};
pub use evaluation::EvaluationResult;
pub use id::{JobId, SubmissionId, TaskId, UserId, WorkerId};
pub use submission::{LifecycleEvent, Submission, SubmissionStatus};
pub use task::{TaskType, WritingTask};
pub use text::{clean_essay_text, count_words};
