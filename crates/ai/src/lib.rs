//! `bandscore-ai`
//!
//! **Responsibility:** the boundary between the evaluation pipeline and the AI
//! vendor that actually grades essays.
//!
//! - It must not touch submission or job state.
//! - It turns essay text + task metadata into an [`EvaluationResult`] or a
//!   classified [`ProviderError`]; retry decisions are made by the caller.

pub mod factory;
pub mod gemini;
pub mod mock;
pub mod prompt;
pub mod provider;

pub use bandscore_core::EvaluationResult;
pub use factory::{ProviderConfig, build_provider};
pub use gemini::GeminiProvider;
pub use mock::MockProvider;
pub use provider::{EvaluationProvider, EvaluationRequest, ProviderError, ProviderErrorKind};
