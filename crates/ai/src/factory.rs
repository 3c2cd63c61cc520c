//! Startup-time provider selection.

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};

use crate::gemini::{DEFAULT_ENDPOINT, DEFAULT_MODEL, GeminiProvider};
use crate::mock::MockProvider;
use crate::provider::{EvaluationProvider, ProviderError};

/// How to reach the grading service.
#[derive(Debug)]
pub struct ProviderConfig {
    /// Provider name (`"gemini"` or `"mock"`), case-insensitive.
    pub provider: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub endpoint: String,
    /// Per-call timeout.
    pub timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl ProviderConfig {
    fn has_key(&self) -> bool {
        self.api_key
            .as_ref()
            .is_some_and(|k| !k.expose_secret().trim().is_empty())
    }
}

/// Build the provider used for the lifetime of the process.
///
/// No API key, an explicit `mock`, or an unrecognised provider name all fall
/// back to [`MockProvider`].
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn EvaluationProvider>, ProviderError> {
    let name = config.provider.trim().to_ascii_lowercase();

    if name == "mock" {
        info!(provider = "mock", "evaluation provider configured");
        return Ok(Arc::new(MockProvider::new()));
    }

    let key = match (&config.api_key, config.has_key()) {
        (Some(key), true) => key,
        _ => {
            warn!("no AI_API_KEY configured; using mock evaluation");
            return Ok(Arc::new(MockProvider::new()));
        }
    };

    match name.as_str() {
        "gemini" => {
            let provider = GeminiProvider::new(
                SecretString::from(key.expose_secret().trim().to_string()),
                config.endpoint.clone(),
                config.model.clone(),
                config.timeout,
            )?;
            info!(provider = "gemini", model = %config.model, timeout_secs = config.timeout.as_secs(), "evaluation provider configured");
            Ok(Arc::new(provider))
        }
        other => {
            warn!(provider = %other, "unknown AI provider; using mock evaluation");
            Ok(Arc::new(MockProvider::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_blank_key_selects_mock() {
        let provider = build_provider(&ProviderConfig::default()).unwrap();
        assert_eq!(provider.name(), "mock");

        let blank = ProviderConfig {
            api_key: Some(SecretString::from("   ".to_string())),
            ..ProviderConfig::default()
        };
        assert_eq!(build_provider(&blank).unwrap().name(), "mock");
    }

    #[test]
    fn key_selects_gemini() {
        let config = ProviderConfig {
            api_key: Some(SecretString::from("abc".to_string())),
            ..ProviderConfig::default()
        };
        assert_eq!(build_provider(&config).unwrap().name(), "gemini");
    }

    #[test]
    fn unknown_provider_falls_back_to_mock() {
        let config = ProviderConfig {
            provider: "OpenAI".into(),
            api_key: Some(SecretString::from("abc".to_string())),
            ..ProviderConfig::default()
        };
        assert_eq!(build_provider(&config).unwrap().name(), "mock");
    }
}
