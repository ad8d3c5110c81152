//! Content-addressed memo of prior inference calls, shared across agents.
//!
//! A fingerprint is derived from the agent name plus the normalized request
//! payload, so the same version pair or sub-query recurring across agents
//! hits the cache instead of being billed twice. Within a run the cache also
//! coalesces concurrent requests: for any fingerprint, at most one caller
//! performs the external call while the rest await its outcome on a
//! `tokio::sync::watch` slot.
//!
//! Entries are never evicted within a run. Cross-run persistence is a
//! collaborator concern, not handled here.
//!
//! Waiters bound their wait with `coalesce_timeout` and surface a transient
//! [`ProviderError`] on expiry. The cache performs no retries of its own:
//! a timed-out waiter's caller must issue a new request, which re-fetches
//! once the leader's slot resolves or is cleaned up.

use crate::cascadellm::inference::{GeneratedMessage, ProviderError};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

type CacheOutcome = Result<Arc<GeneratedMessage>, ProviderError>;

enum Slot {
    Ready(Arc<GeneratedMessage>),
    InFlight(watch::Receiver<Option<CacheOutcome>>),
}

/// What a `get_or_fetch` caller must do, decided under the lock and acted
/// on after the lock is released.
enum Plan {
    Hit(Arc<GeneratedMessage>),
    Wait(watch::Receiver<Option<CacheOutcome>>),
    Fetch(watch::Sender<Option<CacheOutcome>>),
}

/// Removes a claimed in-flight slot if the owning fetch future is dropped
/// before an outcome is recorded. Run timeouts cancel pending branches
/// mid-fetch; without this the fingerprint would reject every later caller.
struct InFlightGuard<'a> {
    cache: &'a ResponseCache,
    fingerprint: &'a str,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Ok(mut slots) = self.cache.slots.lock() {
                slots.remove(self.fingerprint);
            }
        }
    }
}

/// Shared response cache with per-fingerprint in-flight coalescing.
pub struct ResponseCache {
    // Guarded by a std mutex; never held across an await point.
    slots: Mutex<HashMap<String, Slot>>,
    coalesce_timeout: Duration,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            coalesce_timeout: Duration::from_secs(120),
        }
    }

    /// Bound on how long a caller waits on another caller's in-flight
    /// request before giving up with a transient error (builder pattern).
    pub fn with_coalesce_timeout(mut self, timeout: Duration) -> Self {
        self.coalesce_timeout = timeout;
        self
    }

    /// Derive the cache fingerprint for a request: SHA-256 over the agent
    /// name and the canonical JSON payload. `serde_json` maps serialize with
    /// sorted keys, so equal payloads always produce equal fingerprints.
    pub fn fingerprint(agent_name: &str, payload: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(agent_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(payload.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Look up a completed entry.
    pub fn get(&self, fingerprint: &str) -> Option<Arc<GeneratedMessage>> {
        let slots = self.slots.lock().ok()?;
        match slots.get(fingerprint) {
            Some(Slot::Ready(message)) => Some(Arc::clone(message)),
            _ => None,
        }
    }

    /// Insert a completed entry directly.
    pub fn put(&self, fingerprint: impl Into<String>, message: GeneratedMessage) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.insert(fingerprint.into(), Slot::Ready(Arc::new(message)));
        }
    }

    /// Number of completed entries.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .map(|slots| {
                slots
                    .values()
                    .filter(|slot| matches!(slot, Slot::Ready(_)))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the cached response for `fingerprint`, or run `fetch` to
    /// produce it. Concurrent callers for the same fingerprint coordinate so
    /// only the first runs `fetch`; the rest await and share its result.
    /// A failed fetch clears the slot so the fingerprint can be retried.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        fingerprint: &str,
        fetch: F,
    ) -> Result<Arc<GeneratedMessage>, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<GeneratedMessage, ProviderError>>,
    {
        // The decision is made under the lock, but every await happens with
        // the guard statically out of scope so the future stays Send.
        let plan = {
            let mut slots = self
                .slots
                .lock()
                .map_err(|_| ProviderError::permanent("response cache poisoned"))?;
            match slots.get(fingerprint) {
                Some(Slot::Ready(message)) => {
                    log::debug!("cache hit for {}", &fingerprint[..12.min(fingerprint.len())]);
                    Plan::Hit(Arc::clone(message))
                }
                Some(Slot::InFlight(rx)) => Plan::Wait(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    slots.insert(fingerprint.to_string(), Slot::InFlight(rx));
                    Plan::Fetch(tx)
                }
            }
        };

        let sender = match plan {
            Plan::Hit(message) => return Ok(message),
            Plan::Wait(rx) => return self.await_in_flight(fingerprint, rx).await,
            Plan::Fetch(sender) => sender,
        };

        let mut guard = InFlightGuard {
            cache: self,
            fingerprint,
            armed: true,
        };

        let outcome: CacheOutcome = fetch().await.map(Arc::new);

        {
            let mut slots = self
                .slots
                .lock()
                .map_err(|_| ProviderError::permanent("response cache poisoned"))?;
            match &outcome {
                Ok(message) => {
                    slots.insert(fingerprint.to_string(), Slot::Ready(Arc::clone(message)));
                }
                Err(_) => {
                    slots.remove(fingerprint);
                }
            }
        }
        guard.armed = false;

        // Waiters may already be gone; a closed channel is fine.
        let _ = sender.send(Some(outcome.clone()));
        outcome
    }

    async fn await_in_flight(
        &self,
        fingerprint: &str,
        mut rx: watch::Receiver<Option<CacheOutcome>>,
    ) -> Result<Arc<GeneratedMessage>, ProviderError> {
        let wait = async {
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(outcome) = current {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    // The fetching caller was dropped mid-call.
                    return Err(ProviderError::transient(
                        "in-flight inference call was abandoned",
                    ));
                }
            }
        };

        match tokio::time::timeout(self.coalesce_timeout, wait).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProviderError::transient(format!(
                "timed out after {:?} waiting on in-flight fingerprint {}",
                self.coalesce_timeout,
                &fingerprint[..12.min(fingerprint.len())]
            ))),
        }
    }
}
