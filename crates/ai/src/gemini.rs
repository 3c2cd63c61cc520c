//! Google Gemini provider (generateContent REST API).

use std::time::Duration;

use async_trait::async_trait;
use bandscore_core::EvaluationResult;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::prompt::{build_prompt, parse_evaluation};
use crate::provider::{EvaluationProvider, EvaluationRequest, ProviderError};

pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

const TEMPERATURE: f32 = 0.3;
const TOP_P: f32 = 0.95;
const MAX_OUTPUT_TOKENS: u32 = 2048;

/// Real provider backed by the Gemini API.
///
/// The API key only leaves its `SecretString` at the point it is written into
/// the request header.
pub struct GeminiProvider {
    api_key: SecretString,
    endpoint: String,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl std::fmt::Debug for GeminiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiProvider")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl GeminiProvider {
    pub fn new(
        api_key: SecretString,
        endpoint: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::unknown(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            api_key,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
            timeout,
            client,
        })
    }

    fn url(&self) -> String {
        format!("{}/models/{}:generateContent", self.endpoint, self.model)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    max_output_tokens: u32,
    response_mime_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

/// Map a non-success HTTP status onto the failure taxonomy.
fn classify_status(status: StatusCode, retry_after: Option<Duration>, timeout: Duration, body: &str) -> ProviderError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Unauthorized,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ProviderError::Timeout(timeout),
        other => {
            let snippet: String = body.chars().take(200).collect();
            ProviderError::unknown(format!("HTTP {}: {snippet}", other.as_u16()))
        }
    }
}

fn transport_error(e: &reqwest::Error, timeout: Duration, context: &str) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(timeout)
    } else {
        ProviderError::unknown(format!("{context}: {e}"))
    }
}

#[async_trait]
impl EvaluationProvider for GeminiProvider {
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<EvaluationResult, ProviderError> {
        let prompt = build_prompt(request);
        let body = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![RequestPart { text: &prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: TEMPERATURE,
                top_p: TOP_P,
                max_output_tokens: MAX_OUTPUT_TOKENS,
                response_mime_type: "application/json",
            },
        };

        let response = self
            .client
            .post(self.url())
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(&e, self.timeout, "request failed"))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let err = match response.text().await {
                Ok(text) => classify_status(status, retry_after, self.timeout, &text),
                Err(e) if e.is_timeout() => ProviderError::Timeout(self.timeout),
                Err(e) => classify_status(status, retry_after, self.timeout, &format!("unreadable body: {e}")),
            };
            warn!(model = %self.model, status = status.as_u16(), kind = %err.kind(), "gemini call failed");
            return Err(err);
        }

        let decoded: GenerateResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(self.timeout)
            } else {
                ProviderError::invalid_response(format!("undecodable response body: {e}"))
            }
        })?;

        let text = decoded
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect::<String>())
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ProviderError::invalid_response("response contained no candidate text"))?;

        debug!(model = %self.model, chars = text.len(), "gemini response received");
        parse_evaluation(&text)
    }

    fn name(&self) -> &str {
        "gemini"
    }
}
