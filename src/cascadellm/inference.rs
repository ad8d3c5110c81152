//! The seam to the external text-generation service.
//!
//! An [`InferenceClient`] is a thin wrapper around one provider's API. It is
//! deliberately stateless about credentials: the active [`Credential`] is
//! injected per call by the [`CredentialManager`](crate::credentials::CredentialManager),
//! which is the only component that classifies and reacts to
//! [`ProviderError`] kinds.

use crate::cascadellm::credentials::Credential;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::error::Error;
use std::fmt;

/// How many tokens were spent on prompt vs. completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
}

/// The prompt material for one inference call.
#[derive(Debug, Clone)]
pub struct PromptContext {
    /// System prompt steering the model.
    pub system: String,
    /// The user-role request body.
    pub user: String,
    /// Soft completion budget forwarded to the provider.
    pub max_tokens: usize,
}

impl PromptContext {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            max_tokens: 4096,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Canonical JSON form of this prompt, used for cache fingerprinting.
    /// Key order is fixed so equal prompts always hash identically.
    pub fn canonical_payload(&self) -> Value {
        json!({
            "system": self.system,
            "user": self.user,
            "max_tokens": self.max_tokens,
        })
    }
}

/// One generated response from the provider.
#[derive(Debug, Clone)]
pub struct GeneratedMessage {
    /// Raw assistant content. Agents parse structured JSON out of this.
    pub content: String,
    /// Token accounting, when the provider reports it.
    pub usage: Option<TokenUsage>,
}

/// Failure classification for provider calls.
///
/// Only the credential manager acts on the kind: `Quota` and `Auth` trigger
/// credential rotation, `Transient` triggers backoff and retry, `Permanent`
/// propagates immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Quota,
    Auth,
    Transient,
    Permanent,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderErrorKind::Quota => "quota",
            ProviderErrorKind::Auth => "auth",
            ProviderErrorKind::Transient => "transient",
            ProviderErrorKind::Permanent => "permanent",
        };
        f.write_str(s)
    }
}

/// Error returned by an [`InferenceClient`] or by the retry machinery that
/// wraps it.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Quota, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Auth, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Permanent, message)
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider error ({}): {}", self.kind, self.message)
    }
}

impl Error for ProviderError {}

/// Trait defining the interface to a text-generation provider.
///
/// Implementations must be safe to call concurrently; the cascade issues
/// sibling-agent calls in parallel against one shared client.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Run one generation request with the given credential and return the
    /// assistant content plus usage accounting.
    async fn generate(
        &self,
        credential: &Credential,
        context: &PromptContext,
    ) -> Result<GeneratedMessage, ProviderError>;

    /// Model identifier, for logging and diagnostics.
    fn model_name(&self) -> &str;
}
