//! Provider trait and failure taxonomy.

use std::time::Duration;

use async_trait::async_trait;
use bandscore_core::{EvaluationResult, TaskType};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Everything a provider needs to grade one essay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationRequest {
    pub essay_text: String,
    pub task_prompt: String,
    pub task_type: TaskType,
}

/// Classified provider failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("rate limited by provider (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider returned an invalid evaluation: {0}")]
    InvalidResponse(String),

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider rejected the configured credentials")]
    Unauthorized,

    #[error("provider call failed: {0}")]
    Unknown(String),
}

/// Failure kind without payload; what retry policy and storage care about.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    RateLimited,
    InvalidResponse,
    Timeout,
    Unauthorized,
    Unknown,
}

impl ProviderError {
    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            ProviderError::RateLimited { .. } => ProviderErrorKind::RateLimited,
            ProviderError::InvalidResponse(_) => ProviderErrorKind::InvalidResponse,
            ProviderError::Timeout(_) => ProviderErrorKind::Timeout,
            ProviderError::Unauthorized => ProviderErrorKind::Unauthorized,
            ProviderError::Unknown(_) => ProviderErrorKind::Unknown,
        }
    }

    /// Provider-suggested minimum wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::Unknown(msg.into())
    }
}

impl ProviderErrorKind {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            ProviderErrorKind::RateLimited | ProviderErrorKind::Timeout | ProviderErrorKind::Unknown
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderErrorKind::RateLimited => "rate_limited",
            ProviderErrorKind::InvalidResponse => "invalid_response",
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::Unauthorized => "unauthorized",
            ProviderErrorKind::Unknown => "unknown",
        }
    }
}

impl core::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An essay grader.
///
/// Implementations hold no mutable shared state; the same provider instance is
/// used concurrently by every worker.
#[async_trait]
pub trait EvaluationProvider: Send + Sync {
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<EvaluationResult, ProviderError>;

    /// Short name for logs (`"mock"`, `"gemini"`).
    fn name(&self) -> &str;
}

#[async_trait]
impl<T> EvaluationProvider for std::sync::Arc<T>
where
    T: EvaluationProvider + ?Sized,
{
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<EvaluationResult, ProviderError> {
        (**self).evaluate(request).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_kinds_are_retriable() {
        assert!(ProviderErrorKind::RateLimited.is_retriable());
        assert!(ProviderErrorKind::Timeout.is_retriable());
        assert!(ProviderErrorKind::Unknown.is_retriable());
        assert!(!ProviderErrorKind::InvalidResponse.is_retriable());
        assert!(!ProviderErrorKind::Unauthorized.is_retriable());
    }

    #[test]
    fn kind_matches_variant() {
        let err = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(err.kind(), ProviderErrorKind::RateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(ProviderError::Unauthorized.retry_after(), None);
        assert_eq!(
            serde_json::to_string(&ProviderErrorKind::InvalidResponse).unwrap(),
            "\"invalid_response\""
        );
    }
}
