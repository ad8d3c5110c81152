//! Shared credential rotation and retry policy for inference calls.
//!
//! Every agent call to the external provider goes through one
//! [`CredentialManager`]. Classification and backoff policy live here and
//! nowhere else, so they are defined once and tested once:
//!
//! - quota/auth failures rotate to the next backup credential and retry;
//!   rotation is process-wide, so once rotated all subsequent calls use the
//!   new credential,
//! - transient failures (timeouts, 5xx) retry the same credential with
//!   exponential backoff up to a bounded count,
//! - permanent failures, and quota/auth failures with no credential left,
//!   propagate as [`ProviderError`].
//!
//! Concurrent `invoke` calls on the active credential proceed independently;
//! only the rotation itself is serialized behind a mutex.

use crate::cascadellm::event::{CascadeEvent, EventHandler};
use crate::cascadellm::inference::{ProviderError, ProviderErrorKind};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One API credential. The label is used in logs and rotation events; the
/// key itself is never logged.
#[derive(Debug, Clone)]
pub struct Credential {
    pub label: String,
    pub api_key: String,
}

impl Credential {
    pub fn new(label: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            api_key: api_key.into(),
        }
    }
}

/// An observable record of one credential rotation.
#[derive(Debug, Clone)]
pub struct RotationEvent {
    pub from: String,
    pub to: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

struct RotationState {
    active: usize,
    events: Vec<RotationEvent>,
}

/// Thread-safe manager holding an ordered credential list, primary first.
pub struct CredentialManager {
    credentials: Vec<Credential>,
    state: Mutex<RotationState>,
    max_transient_retries: u32,
    backoff_base: Duration,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl CredentialManager {
    /// Create a manager over an ordered credential list. The first entry is
    /// the primary; the rest are fallbacks tried in order.
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self {
            credentials,
            state: Mutex::new(RotationState {
                active: 0,
                events: Vec::new(),
            }),
            max_transient_retries: 3,
            backoff_base: Duration::from_millis(500),
            event_handler: None,
        }
    }

    /// Bound on same-credential retries for transient failures (builder pattern).
    pub fn with_max_transient_retries(mut self, retries: u32) -> Self {
        self.max_transient_retries = retries;
        self
    }

    /// Base delay for exponential backoff (builder pattern). Attempt `n`
    /// sleeps `base * 2^n`.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Attach an event handler notified on every rotation (builder pattern).
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// The currently active credential.
    pub fn active_credential(&self) -> Option<Credential> {
        let state = self.state.lock().ok()?;
        self.credentials.get(state.active).cloned()
    }

    /// All rotation events observed so far, oldest first.
    pub fn rotation_events(&self) -> Vec<RotationEvent> {
        self.state
            .lock()
            .map(|s| s.events.clone())
            .unwrap_or_default()
    }

    /// Execute `request` with the active credential, applying the retry and
    /// rotation policy described at the module level.
    pub async fn invoke<T, F, Fut>(&self, request: F) -> Result<T, ProviderError>
    where
        F: Fn(Credential) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        if self.credentials.is_empty() {
            return Err(ProviderError::permanent("no credentials configured"));
        }

        let mut transient_attempts: u32 = 0;
        loop {
            let (index, credential) = {
                let state = self
                    .state
                    .lock()
                    .map_err(|_| ProviderError::permanent("rotation state poisoned"))?;
                (state.active, self.credentials[state.active].clone())
            };

            match request(credential).await {
                Ok(value) => return Ok(value),
                Err(err) => match err.kind {
                    ProviderErrorKind::Permanent => return Err(err),
                    ProviderErrorKind::Transient => {
                        if transient_attempts >= self.max_transient_retries {
                            log::error!(
                                "transient failure persisted after {} retries: {}",
                                self.max_transient_retries,
                                err
                            );
                            return Err(err);
                        }
                        // Exponent capped so large configured retry bounds
                        // cannot overflow the delay.
                        let delay = self
                            .backoff_base
                            .saturating_mul(1u32 << transient_attempts.min(10));
                        log::warn!(
                            "transient provider failure (attempt {}), backing off {:?}: {}",
                            transient_attempts + 1,
                            delay,
                            err
                        );
                        tokio::time::sleep(delay).await;
                        transient_attempts += 1;
                    }
                    ProviderErrorKind::Quota | ProviderErrorKind::Auth => {
                        if !self.rotate_from(index, &err).await {
                            return Err(ProviderError::permanent(format!(
                                "all credentials exhausted, last failure: {}",
                                err
                            )));
                        }
                        // Fresh credential, fresh transient budget.
                        transient_attempts = 0;
                    }
                },
            }
        }
    }

    /// Advance past the credential at `observed_index`. Returns false when no
    /// backup remains. If another caller already rotated, this is a no-op
    /// that reports success so the caller retries with the new credential.
    async fn rotate_from(&self, observed_index: usize, cause: &ProviderError) -> bool {
        let event = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(_) => return false,
            };
            if state.active > observed_index {
                // Someone else rotated first; just retry.
                None
            } else if state.active + 1 < self.credentials.len() {
                let from = self.credentials[state.active].label.clone();
                state.active += 1;
                let to = self.credentials[state.active].label.clone();
                let event = RotationEvent {
                    from,
                    to,
                    reason: cause.to_string(),
                    at: Utc::now(),
                };
                state.events.push(event.clone());
                Some(event)
            } else {
                return false;
            }
        };

        if let Some(event) = event {
            log::warn!(
                "rotated credential {} -> {} ({})",
                event.from,
                event.to,
                event.reason
            );
            if let Some(handler) = &self.event_handler {
                handler
                    .on_event(&CascadeEvent::CredentialRotated {
                        from: event.from.clone(),
                        to: event.to.clone(),
                        reason: event.reason.clone(),
                    })
                    .await;
            }
        }
        true
    }
}
