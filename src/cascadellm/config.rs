//! Configuration surface for a cascade deployment.
//!
//! [`CascadeConfig`] is a plain struct; construct it manually or pull it
//! from the environment with [`CascadeConfig::from_env`]. It describes the
//! provider endpoint, the ordered credential list (primary first, fallbacks
//! after), and the retry/concurrency knobs. Agent wiring itself is code:
//! build an [`AgentRegistry`](crate::registry::AgentRegistry), register the
//! agents, add the edges, and hand it to the orchestrator before the first
//! run.

use crate::cascadellm::credentials::Credential;
use std::env;
use std::error::Error;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ConfigError {
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.message)
    }
}

impl Error for ConfigError {}

/// Deployment settings for the cascade engine.
#[derive(Debug, Clone)]
pub struct CascadeConfig {
    /// OpenAI-compatible endpoint base URL.
    pub base_url: String,
    /// Model identifier sent with every request.
    pub model: String,
    /// Primary API key.
    pub api_key: Option<String>,
    /// Backup keys, tried in order when the active one exhausts.
    pub fallback_api_keys: Vec<String>,
    /// Same-credential retry bound for transient failures.
    pub max_transient_retries: u32,
    /// Base delay for exponential backoff.
    pub backoff_base: Duration,
    /// Cap on concurrently executing agent calls.
    pub max_parallelism: usize,
    /// Optional overall run deadline.
    pub run_timeout: Option<Duration>,
    /// Bound on waiting for another caller's in-flight inference call.
    pub coalesce_timeout: Duration,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            base_url: String::from("https://openrouter.ai/api/v1"),
            model: String::from("google/gemini-2.0-flash-exp:free"),
            api_key: None,
            fallback_api_keys: Vec::new(),
            max_transient_retries: 3,
            backoff_base: Duration::from_millis(500),
            max_parallelism: 8,
            run_timeout: None,
            coalesce_timeout: Duration::from_secs(120),
        }
    }
}

impl CascadeConfig {
    /// Build a config from the environment:
    ///
    /// - `OPENAI_API_KEY` primary key
    /// - `FALLBACK_API_KEYS` comma-separated backup keys
    /// - `OPENAI_BASE_URL` endpoint override
    /// - `LLM_MODEL` model override
    /// - `MAX_RETRIES` transient retry bound
    /// - `RUN_TIMEOUT_SECS` overall run deadline in seconds
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.api_key = env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());
        if let Ok(keys) = env::var("FALLBACK_API_KEYS") {
            config.fallback_api_keys = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(url) = env::var("OPENAI_BASE_URL") {
            if !url.is_empty() {
                config.base_url = url;
            }
        }
        if let Ok(model) = env::var("LLM_MODEL") {
            if !model.is_empty() {
                config.model = model;
            }
        }
        if let Some(retries) = env::var("MAX_RETRIES").ok().and_then(|v| v.parse().ok()) {
            config.max_transient_retries = retries;
        }
        if let Some(secs) = env::var("RUN_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.run_timeout = Some(Duration::from_secs(secs));
        }
        config
    }

    /// At least one credential must be configured.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.is_none() && self.fallback_api_keys.is_empty() {
            return Err(ConfigError {
                message: String::from(
                    "no API key configured (OPENAI_API_KEY or FALLBACK_API_KEYS)",
                ),
            });
        }
        Ok(())
    }

    /// The ordered credential list for the
    /// [`CredentialManager`](crate::credentials::CredentialManager):
    /// primary first, fallbacks after.
    pub fn credentials(&self) -> Vec<Credential> {
        let mut credentials = Vec::new();
        if let Some(key) = &self.api_key {
            credentials.push(Credential::new("primary", key));
        }
        for (i, key) in self.fallback_api_keys.iter().enumerate() {
            credentials.push(Credential::new(format!("fallback-{}", i + 1), key));
        }
        credentials
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_preserve_fallback_order() {
        let config = CascadeConfig {
            api_key: Some("k0".into()),
            fallback_api_keys: vec!["k1".into(), "k2".into()],
            ..CascadeConfig::default()
        };
        let creds = config.credentials();
        assert_eq!(creds.len(), 3);
        assert_eq!(creds[0].label, "primary");
        assert_eq!(creds[2].label, "fallback-2");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_key_set() {
        assert!(CascadeConfig::default().validate().is_err());
    }
}
