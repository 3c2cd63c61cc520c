//! Pipeline configuration, read once from the environment at startup.

use std::time::Duration;

use bandscore_ai::ProviderConfig;
use bandscore_core::WorkerId;
use secrecy::SecretString;
use thiserror::Error;

use crate::jobs::{ClaimPolicy, RetryPolicy};
use crate::workers::WorkerConfig;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// Everything a process of the pipeline needs to start.
#[derive(Debug)]
pub struct PipelineConfig {
    /// Unset means the in-memory store.
    pub database_url: Option<SecretString>,
    pub provider: ProviderConfig,
    pub worker_count: usize,
    pub worker: WorkerConfig,
    pub bind_addr: String,
}

impl PipelineConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through `lookup` (`None` = unset).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let defaults = ProviderConfig::default();
        let provider = ProviderConfig {
            provider: get("AI_PROVIDER").unwrap_or(defaults.provider),
            api_key: get("AI_API_KEY").map(SecretString::from),
            model: get("AI_MODEL").unwrap_or(defaults.model),
            endpoint: get("AI_ENDPOINT").unwrap_or(defaults.endpoint),
            timeout: Duration::from_secs(parse(&get, "AI_TIMEOUT_SECS", defaults.timeout.as_secs())?),
        };

        let retry_defaults = RetryPolicy::default();
        let claim_defaults = ClaimPolicy::default();
        let worker_defaults = WorkerConfig::default();

        let max_attempts: u32 = parse(&get, "RETRY_MAX_ATTEMPTS", retry_defaults.max_attempts)?;
        let jitter: f64 = parse(&get, "RETRY_JITTER", retry_defaults.jitter)?;
        let retry = RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(parse(&get, "RETRY_BASE_DELAY_SECS", retry_defaults.base_delay.as_secs())?),
            max_delay: Duration::from_secs(parse(&get, "RETRY_MAX_DELAY_SECS", retry_defaults.max_delay.as_secs())?),
            jitter,
        };
        let claim = ClaimPolicy {
            stale_after: Duration::from_secs(parse(
                &get,
                "CLAIM_STALE_AFTER_SECS",
                claim_defaults.stale_after.as_secs(),
            )?),
            max_attempts,
        };
        let worker = WorkerConfig {
            worker_id: get("WORKER_ID").map(WorkerId::new).unwrap_or(worker_defaults.worker_id),
            poll_interval: Duration::from_millis(parse(
                &get,
                "WORKER_POLL_INTERVAL_MS",
                worker_defaults.poll_interval.as_millis() as u64,
            )?),
            execution_timeout: Duration::from_secs(parse(
                &get,
                "WORKER_EXECUTION_TIMEOUT_SECS",
                worker_defaults.execution_timeout.as_secs(),
            )?),
            claim,
            retry,
        };

        let config = Self {
            database_url: get("DATABASE_URL").map(SecretString::from),
            provider,
            worker_count: parse(&get, "WORKER_COUNT", 1usize)?,
            worker,
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.worker;
        if w.retry.max_attempts == 0 {
            return Err(invalid("RETRY_MAX_ATTEMPTS", "0", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&w.retry.jitter) {
            return Err(invalid("RETRY_JITTER", &w.retry.jitter.to_string(), "must be between 0.0 and 1.0"));
        }
        if w.retry.base_delay > w.retry.max_delay {
            return Err(ConfigError::Inconsistent(
                "RETRY_BASE_DELAY_SECS must not exceed RETRY_MAX_DELAY_SECS".to_string(),
            ));
        }
        if w.poll_interval.is_zero() {
            return Err(invalid("WORKER_POLL_INTERVAL_MS", "0", "must be positive"));
        }
        if self.worker_count == 0 {
            return Err(invalid("WORKER_COUNT", "0", "must be at least 1"));
        }
        if w.execution_timeout.is_zero() {
            return Err(invalid("WORKER_EXECUTION_TIMEOUT_SECS", "0", "must be positive"));
        }
        if w.execution_timeout >= w.claim.stale_after {
            return Err(ConfigError::Inconsistent(format!(
                "WORKER_EXECUTION_TIMEOUT_SECS ({}s) must be less than CLAIM_STALE_AFTER_SECS ({}s)",
                w.execution_timeout.as_secs(),
                w.claim.stale_after.as_secs()
            )));
        }
        if self.provider.timeout > w.execution_timeout {
            return Err(ConfigError::Inconsistent(format!(
                "AI_TIMEOUT_SECS ({}s) must not exceed WORKER_EXECUTION_TIMEOUT_SECS ({}s)",
                self.provider.timeout.as_secs(),
                w.execution_timeout.as_secs()
            )));
        }
        Ok(())
    }
}

fn parse<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn invalid(var: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<PipelineConfig, ConfigError> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        PipelineConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[]).unwrap();
        assert!(config.database_url.is_none());
        assert!(config.provider.api_key.is_none());
        assert_eq!(config.provider.timeout, Duration::from_secs(60));
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.worker.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.worker.execution_timeout, Duration::from_secs(90));
        assert_eq!(config.worker.claim.stale_after, Duration::from_secs(300));
        assert_eq!(config.worker.retry, RetryPolicy::default());
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
    }

    #[test]
    fn values_are_read_and_shared() {
        let config = load(&[
            ("DATABASE_URL", "postgres://localhost/bandscore"),
            ("AI_API_KEY", " secret "),
            ("RETRY_MAX_ATTEMPTS", "5"),
            ("WORKER_COUNT", "4"),
            ("WORKER_ID", "eval-a"),
        ])
        .unwrap();
        assert_eq!(config.provider.api_key.unwrap().expose_secret(), "secret");
        assert_eq!(config.worker.retry.max_attempts, 5);
        assert_eq!(config.worker.claim.max_attempts, 5);
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.worker.worker_id.as_str(), "eval-a");
        assert!(config.database_url.is_some());
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = load(&[("AI_API_KEY", "   "), ("WORKER_COUNT", "")]).unwrap();
        assert!(config.provider.api_key.is_none());
        assert_eq!(config.worker_count, 1);
    }

    #[test]
    fn rejects_garbage_numbers() {
        let err = load(&[("WORKER_COUNT", "many")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "WORKER_COUNT", .. }));
    }

    #[test]
    fn execution_timeout_must_be_below_staleness() {
        let err = load(&[("WORKER_EXECUTION_TIMEOUT_SECS", "300")]).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
        assert!(load(&[("WORKER_EXECUTION_TIMEOUT_SECS", "299"), ("AI_TIMEOUT_SECS", "60")]).is_ok());
    }

    #[test]
    fn provider_timeout_must_fit_execution_timeout() {
        let err = load(&[("AI_TIMEOUT_SECS", "120")]).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(msg) if msg.contains("AI_TIMEOUT_SECS")));
    }

    #[test]
    fn jitter_and_attempts_are_bounded() {
        assert!(load(&[("RETRY_JITTER", "1.5")]).is_err());
        assert!(load(&[("RETRY_MAX_ATTEMPTS", "0")]).is_err());
        assert!(load(&[("RETRY_JITTER", "0")]).is_ok());
    }
}
