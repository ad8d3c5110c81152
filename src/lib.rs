//! # CascadeLLM
//!
//! CascadeLLM is an agent cascade engine for LLM-backed impact analysis. A
//! root specialist (say, an operating-system agent) asks an external model
//! what changed between two versions; the engine then fans that change set
//! out through an explicit dependency graph of downstream specialists
//! (container orchestration, databases, ...) with bounded concurrency, and
//! aggregates every branch, including the failed ones, into a single
//! renderable [`AnalysisResult`](model::AnalysisResult).
//!
//! The crate provides layered abstractions for:
//!
//! * **Uniform records**: [`ChangeRecord`](model::ChangeRecord) flowing
//!   downstream and [`ImpactRecord`](model::ImpactRecord) coming back, so
//!   heterogeneous agents compose
//! * **Agent graph**: [`AgentRegistry`] holding agent instances and their
//!   upstream/downstream wiring, with cycle and single-parent enforcement
//! * **Cascade orchestration**: [`CascadeOrchestrator`] driving the
//!   traversal centrally with a per-level barrier and isolated branch
//!   failures
//! * **Resilient provider access**: [`CredentialManager`] (key rotation on
//!   quota/auth failures, exponential backoff on transient ones) and
//!   [`ResponseCache`] (content-addressed memoization with in-flight
//!   coalescing)
//! * **Narrow collaborator seams**: [`InferenceClient`](inference::InferenceClient)
//!   for text generation and [`KnowledgeSource`](knowledge::KnowledgeSource)
//!   for context retrieval
//!
//! ## Quick tour
//!
//! ```rust,no_run
//! use cascadellm::{
//!     AgentRegistry, CascadeOrchestrator, CredentialManager, ResponseCache, SpecialistAgent,
//! };
//! use cascadellm::clients::OpenAiCompatClient;
//! use cascadellm::config::CascadeConfig;
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! # async {
//! let config = CascadeConfig::from_env();
//! config.validate()?;
//!
//! let credentials = Arc::new(CredentialManager::new(config.credentials()));
//! let cache = Arc::new(ResponseCache::new());
//! let client = Arc::new(OpenAiCompatClient::new(&config.base_url, &config.model));
//!
//! let mut registry = AgentRegistry::new();
//! registry.register(Arc::new(SpecialistAgent::new(
//!     "os-agent", "operating systems",
//!     client.clone(), credentials.clone(), cache.clone(),
//! )))?;
//! registry.register(Arc::new(SpecialistAgent::new(
//!     "k8s-agent", "Kubernetes",
//!     client.clone(), credentials.clone(), cache.clone(),
//! )))?;
//! registry.add_edge("os-agent", "k8s-agent")?;
//!
//! let orchestrator = CascadeOrchestrator::new(Arc::new(registry));
//! let mut params = HashMap::new();
//! params.insert("from_version".to_string(), "SLES 15 SP6".to_string());
//! params.insert("to_version".to_string(), "SLES 15 SP7".to_string());
//!
//! let result = orchestrator.run("os-agent", params).await?;
//! println!("{}", serde_json::to_string_pretty(&result)?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # };
//! ```

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// Lightweight on purpose: embedding applications opt in to `RUST_LOG`
/// driven diagnostics without committing to a logging backend.
///
/// ```rust
/// cascadellm::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::init();
    });
}

// Import the top-level `cascadellm` module.
pub mod cascadellm;

// Re-exporting key items for easier external access.
pub use cascadellm::agent;
pub use cascadellm::agent::{AnalysisError, CascadeAgent, SpecialistAgent};
pub use cascadellm::cache;
pub use cascadellm::cache::ResponseCache;
pub use cascadellm::clients;
pub use cascadellm::config;
pub use cascadellm::config::CascadeConfig;
pub use cascadellm::credentials;
pub use cascadellm::credentials::{Credential, CredentialManager, RotationEvent};
pub use cascadellm::event;
pub use cascadellm::event::{CascadeEvent, EventHandler};
pub use cascadellm::http_client_pool;
pub use cascadellm::inference;
pub use cascadellm::inference::{
    GeneratedMessage, InferenceClient, PromptContext, ProviderError, ProviderErrorKind, TokenUsage,
};
pub use cascadellm::knowledge;
pub use cascadellm::knowledge::{ContextSnippet, KnowledgeSource, StaticKnowledgeBase};
pub use cascadellm::model;
pub use cascadellm::model::{
    AnalysisResult, CascadeNodeResult, ChangeRecord, ChangeType, ImpactRecord, ImpactStatement,
    NodeOutcome, RunStatus, Severity,
};
pub use cascadellm::orchestrator;
pub use cascadellm::orchestrator::{CascadeError, CascadeOrchestrator};
pub use cascadellm::registry;
pub use cascadellm::registry::{AgentNode, AgentRegistry, GraphError};
