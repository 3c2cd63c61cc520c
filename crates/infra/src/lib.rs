//! Infrastructure layer: job storage, retry scheduling, workers, lifecycle
//! service and configuration.

pub mod config;
pub mod jobs;
pub mod submission_service;
pub mod workers;

pub use config::{ConfigError, PipelineConfig};
pub use submission_service::{ServiceError, StatusView, SubmissionService, SubmitOutcome};
