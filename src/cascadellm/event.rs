//! Cascade event system.
//!
//! A callback-based observability layer for cascade runs. Implement
//! [`EventHandler`] and attach it via
//! [`CascadeOrchestrator::with_event_handler`](crate::orchestrator::CascadeOrchestrator::with_event_handler)
//! or
//! [`CredentialManager::with_event_handler`](crate::credentials::CredentialManager::with_event_handler)
//! to receive run lifecycle, branch outcome, and credential rotation
//! notifications. The single method has a default no-op implementation, so
//! handlers only match the variants they care about.
//!
//! # Example
//!
//! ```rust
//! use cascadellm::event::{CascadeEvent, EventHandler};
//! use async_trait::async_trait;
//!
//! struct LogHandler;
//!
//! #[async_trait]
//! impl EventHandler for LogHandler {
//!     async fn on_event(&self, event: &CascadeEvent) {
//!         if let CascadeEvent::BranchFailed { agent_name, error, .. } = event {
//!             eprintln!("branch {} failed: {}", agent_name, error);
//!         }
//!     }
//! }
//! ```

use crate::cascadellm::inference::TokenUsage;
use async_trait::async_trait;

/// Events emitted during a cascade run and by the credential manager.
#[derive(Debug, Clone)]
pub enum CascadeEvent {
    /// A run started for the given root agent.
    RunStarted { run_id: String, root_agent: String },

    /// The root's direct analysis completed.
    RootAnalyzed {
        run_id: String,
        root_agent: String,
        change_count: usize,
        tokens_used: Option<TokenUsage>,
    },

    /// A downstream agent completed its upstream-impact analysis.
    BranchCompleted {
        run_id: String,
        agent_name: String,
        impact_count: usize,
    },

    /// A downstream agent failed; its subtree was pruned, siblings continue.
    BranchFailed {
        run_id: String,
        agent_name: String,
        error: String,
    },

    /// The run finished aggregating.
    RunCompleted {
        run_id: String,
        root_agent: String,
        failed_branches: usize,
    },

    /// The credential manager rotated to a backup credential.
    CredentialRotated {
        from: String,
        to: String,
        reason: String,
    },
}

/// Callback interface for [`CascadeEvent`]s. Wrapped in `Arc<dyn EventHandler>`
/// and shared between the orchestrator and the credential manager.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, _event: &CascadeEvent) {}
}
