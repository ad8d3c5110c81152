//! OpenAI-compatible chat-completions client.
//!
//! Works against any endpoint speaking the OpenAI wire format (OpenAI
//! itself, OpenRouter, local gateways). The credential is injected per call
//! by the [`CredentialManager`](crate::credentials::CredentialManager), so
//! one client instance serves every configured key. HTTP failures are
//! classified into [`ProviderError`] kinds here; reacting to them is the
//! credential manager's job.

use crate::cascadellm::credentials::Credential;
use crate::cascadellm::http_client_pool;
use crate::cascadellm::inference::{
    GeneratedMessage, InferenceClient, PromptContext, ProviderError, TokenUsage,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
    total_tokens: usize,
}

/// [`InferenceClient`] over an OpenAI-compatible `/chat/completions`
/// endpoint.
pub struct OpenAiCompatClient {
    base_url: String,
    model: String,
    request_timeout: Duration,
}

impl OpenAiCompatClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            request_timeout: Duration::from_secs(120),
        }
    }

    /// Per-request timeout (builder pattern). Elapsed requests classify as
    /// transient.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl InferenceClient for OpenAiCompatClient {
    async fn generate(
        &self,
        credential: &Credential,
        context: &PromptContext,
    ) -> Result<GeneratedMessage, ProviderError> {
        let client = http_client_pool::get_or_create_client(&self.base_url);
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": context.system },
                { "role": "user", "content": context.user },
            ],
            "max_tokens": context.max_tokens,
        });

        let response = client
            .post(self.endpoint())
            .bearer_auth(&credential.api_key)
            .json(&body)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let err = classify_status(status, &detail);
            log::error!(
                "chat completion failed (credential {}, status {}): {}",
                credential.label,
                status,
                err
            );
            return Err(err);
        }

        let payload: ChatResponse = response.json().await.map_err(|err| {
            ProviderError::permanent(format!("malformed provider response: {}", err))
        })?;

        let choice = payload
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::permanent("provider returned no choices"))?;

        Ok(GeneratedMessage {
            content: choice.message.content,
            usage: payload.usage.map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn classify_status(status: StatusCode, detail: &str) -> ProviderError {
    let message = format!("HTTP {}: {}", status, detail.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::auth(message),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::quota(message),
        StatusCode::REQUEST_TIMEOUT => ProviderError::transient(message),
        _ if status.is_server_error() => ProviderError::transient(message),
        _ => ProviderError::permanent(message),
    }
}

fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() {
        ProviderError::transient(format!("transport failure: {}", err))
    } else {
        ProviderError::permanent(format!("request failed: {}", err))
    }
}
