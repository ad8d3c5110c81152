//! The cascade orchestrator.
//!
//! Walks the registry graph from a configured root: the root performs a
//! direct analysis, its `ChangeRecord`s fan out to every registered child
//! concurrently, and each successful child that has children of its own
//! feeds the next level. Traversal is driven centrally from here (agents
//! never call each other), which is what makes the per-level barrier and
//! failure isolation testable:
//!
//! - sibling branches run in parallel, gated by one shared semaphore sized
//!   to `min(max_parallelism, registry max fan-out)`,
//! - a node's subtree counts as done only when every child subtree is
//!   resolved,
//! - a failed branch is recorded and pruned; its siblings always get a
//!   chance to complete (failures are never propagated as cancellation),
//! - results aggregate in registry insertion order regardless of completion
//!   order, so output is deterministic,
//! - a root failure is fatal before any downstream work starts.

use crate::cascadellm::agent::AnalysisError;
use crate::cascadellm::event::{CascadeEvent, EventHandler};
use crate::cascadellm::model::{
    AnalysisResult, CascadeNodeResult, ChangeRecord, ChangeType, ImpactRecord, RunStatus,
};
use crate::cascadellm::registry::AgentRegistry;
use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use uuid::Uuid;

/// Hard failures of a cascade run. Branch failures are not errors at this
/// level; they surface inside the [`AnalysisResult`] tree instead.
#[derive(Debug)]
pub enum CascadeError {
    /// No agents registered at all.
    EmptyRegistry,
    /// The configured root is not in the registry.
    UnknownRoot(String),
    /// The configured root has an upstream producer and cannot start a run.
    RootHasUpstream { root: String, upstream: String },
    /// The root's direct analysis failed; there is nothing to cascade.
    RootAnalysis {
        agent: String,
        source: AnalysisError,
    },
}

impl fmt::Display for CascadeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CascadeError::EmptyRegistry => write!(f, "no agents registered"),
            CascadeError::UnknownRoot(name) => write!(f, "unknown root agent: {}", name),
            CascadeError::RootHasUpstream { root, upstream } => write!(
                f,
                "root agent {} has upstream producer {}",
                root, upstream
            ),
            CascadeError::RootAnalysis { agent, source } => {
                write!(f, "root analysis failed for {}: {}", agent, source)
            }
        }
    }
}

impl Error for CascadeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CascadeError::RootAnalysis { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Per-run context shared by every dispatched branch task.
struct RunContext {
    run_id: String,
    registry: Arc<AgentRegistry>,
    semaphore: Arc<Semaphore>,
    deadline: Option<Instant>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl RunContext {
    async fn emit(&self, event: CascadeEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_event(&event).await;
        }
    }
}

/// Drives cascade runs over a read-only [`AgentRegistry`].
pub struct CascadeOrchestrator {
    registry: Arc<AgentRegistry>,
    max_parallelism: usize,
    run_timeout: Option<Duration>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl CascadeOrchestrator {
    /// Create an orchestrator over a finalized registry. Wiring must be
    /// complete before the first run; the graph is never mutated here.
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            max_parallelism: 8,
            run_timeout: None,
            event_handler: None,
        }
    }

    /// Cap on concurrently executing agent calls (builder pattern). The
    /// effective pool size is the smaller of this cap and the registry's
    /// maximum fan-out.
    pub fn with_max_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism.max(1);
        self
    }

    /// Overall run deadline (builder pattern). Branches still pending at
    /// the deadline resolve as timeout failures; completed siblings keep
    /// their results.
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    /// Attach an event handler for run and branch lifecycle events
    /// (builder pattern).
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Execute one full cascade from `root_name` and aggregate the result
    /// tree. Root failure is the only hard failure; branch failures are
    /// isolated and reported inside the returned [`AnalysisResult`].
    pub async fn run(
        &self,
        root_name: &str,
        params: HashMap<String, String>,
    ) -> Result<AnalysisResult, CascadeError> {
        if self.registry.is_empty() {
            return Err(CascadeError::EmptyRegistry);
        }
        let root_node = self
            .registry
            .get(root_name)
            .ok_or_else(|| CascadeError::UnknownRoot(root_name.to_string()))?;
        if let Some(upstream) = root_node.upstream() {
            return Err(CascadeError::RootHasUpstream {
                root: root_name.to_string(),
                upstream: upstream.to_string(),
            });
        }

        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        // Trace snapshot is taken up front; the registry is read-only for
        // the duration of the run.
        let agent_chain = self.registry.agent_chain_from(root_name);

        self.emit(CascadeEvent::RunStarted {
            run_id: run_id.clone(),
            root_agent: root_name.to_string(),
        })
        .await;
        log::info!("run {}: cascading from root {}", run_id, root_name);

        let root_agent = root_node.agent();
        let root_changes = match root_agent.analyze_direct(&params).await {
            Ok(changes) => changes,
            Err(source) => {
                log::error!("run {}: root {} failed: {}", run_id, root_name, source);
                return Err(CascadeError::RootAnalysis {
                    agent: root_name.to_string(),
                    source,
                });
            }
        };

        self.emit(CascadeEvent::RootAnalyzed {
            run_id: run_id.clone(),
            root_agent: root_name.to_string(),
            change_count: root_changes.len(),
            tokens_used: None,
        })
        .await;
        log::info!(
            "run {}: root {} produced {} changes",
            run_id,
            root_name,
            root_changes.len()
        );

        // Downstream agents are only ever invoked with a non-empty change
        // set; a clean root analysis ends the run at the root.
        let branches = if root_changes.is_empty() {
            log::info!(
                "run {}: root {} produced no changes, nothing to cascade",
                run_id,
                root_name
            );
            Vec::new()
        } else {
            let limit = self
                .max_parallelism
                .min(self.registry.max_fan_out())
                .max(1);
            let context = Arc::new(RunContext {
                run_id: run_id.clone(),
                registry: Arc::clone(&self.registry),
                semaphore: Arc::new(Semaphore::new(limit)),
                deadline: self.run_timeout.map(|t| Instant::now() + t),
                event_handler: self.event_handler.clone(),
            });
            propagate(
                context,
                root_name.to_string(),
                Arc::new(root_changes.clone()),
            )
            .await
        };

        let result = AnalysisResult {
            run_id: run_id.clone(),
            root_agent: root_name.to_string(),
            started_at,
            completed_at: Utc::now(),
            status: RunStatus::Completed,
            root_changes,
            branches,
            agent_chain,
        };

        let failed = result.failed_branches().len();
        self.emit(CascadeEvent::RunCompleted {
            run_id,
            root_agent: root_name.to_string(),
            failed_branches: failed,
        })
        .await;
        if failed > 0 {
            log::warn!(
                "run {}: completed with {} failed branch(es)",
                result.run_id,
                failed
            );
        } else {
            log::info!("run {}: completed cleanly", result.run_id);
        }
        Ok(result)
    }

    async fn emit(&self, event: CascadeEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_event(&event).await;
        }
    }
}

/// Dispatch `changes` to every child of `parent` concurrently and wait for
/// all their subtrees to resolve (the per-level barrier). Results come back
/// in registry insertion order.
fn propagate(
    context: Arc<RunContext>,
    parent: String,
    changes: Arc<Vec<ChangeRecord>>,
) -> BoxFuture<'static, Vec<CascadeNodeResult>> {
    async move {
        let child_names = context.registry.child_names(&parent).unwrap_or_default();
        if child_names.is_empty() {
            return Vec::new();
        }

        let mut handles = Vec::with_capacity(child_names.len());
        for child_name in &child_names {
            let context = Arc::clone(&context);
            let changes = Arc::clone(&changes);
            let child = child_name.clone();
            handles.push(tokio::spawn(async move {
                run_branch(context, child, changes).await
            }));
        }

        // Join in dispatch order; completion order is irrelevant to output.
        let mut results = Vec::with_capacity(handles.len());
        for (handle, child_name) in handles.into_iter().zip(child_names) {
            match handle.await {
                Ok(result) => results.push(result),
                Err(err) => {
                    log::error!("branch task for {} panicked: {}", child_name, err);
                    results.push(CascadeNodeResult::failed(
                        child_name,
                        format!("task join error: {}", err),
                    ));
                }
            }
        }
        results
    }
    .boxed()
}

/// Execute one branch: the child's upstream-impact analysis, then (on
/// success, when the child has children of its own and produced impacts)
/// the recursive fan-out of its subtree.
async fn run_branch(
    context: Arc<RunContext>,
    agent_name: String,
    changes: Arc<Vec<ChangeRecord>>,
) -> CascadeNodeResult {
    let agent = match context.registry.agent(&agent_name) {
        Some(agent) => agent,
        None => {
            return CascadeNodeResult::failed(&agent_name, "agent missing from registry");
        }
    };

    // The permit covers only the analysis call itself. It is released
    // before recursing so deep chains cannot deadlock the pool.
    let analysis = async {
        match context.semaphore.acquire().await {
            Ok(_permit) => agent.analyze_upstream_impact(&changes).await,
            Err(_) => Err(AnalysisError::Provider(
                crate::cascadellm::inference::ProviderError::permanent("worker pool closed"),
            )),
        }
    };

    let outcome = match context.deadline {
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                Err(timeout_failure(&agent_name))
            } else {
                match tokio::time::timeout(deadline - now, analysis).await {
                    Ok(result) => result,
                    Err(_) => Err(timeout_failure(&agent_name)),
                }
            }
        }
        None => analysis.await,
    };

    match outcome {
        Ok(record) => {
            context
                .emit(CascadeEvent::BranchCompleted {
                    run_id: context.run_id.clone(),
                    agent_name: agent_name.clone(),
                    impact_count: record.impacts.len(),
                })
                .await;

            let has_children = context
                .registry
                .child_names(&agent_name)
                .map(|children| !children.is_empty())
                .unwrap_or(false);

            let children = if has_children {
                let derived = derive_changes(&record);
                if derived.is_empty() {
                    log::info!(
                        "{}: no impacts to propagate further, subtree stops here",
                        agent_name
                    );
                    Vec::new()
                } else {
                    propagate(
                        Arc::clone(&context),
                        agent_name.clone(),
                        Arc::new(derived),
                    )
                    .await
                }
            } else {
                Vec::new()
            };

            CascadeNodeResult::succeeded(agent_name, record, children)
        }
        Err(err) => {
            log::warn!(
                "run {}: branch {} failed: {}",
                context.run_id,
                agent_name,
                err
            );
            context
                .emit(CascadeEvent::BranchFailed {
                    run_id: context.run_id.clone(),
                    agent_name: agent_name.clone(),
                    error: err.to_string(),
                })
                .await;
            CascadeNodeResult::failed(agent_name, err.to_string())
        }
    }
}

fn timeout_failure(agent_name: &str) -> AnalysisError {
    AnalysisError::Provider(crate::cascadellm::inference::ProviderError::transient(
        format!("{}: run timeout exceeded before branch completed", agent_name),
    ))
}

/// Convert a successful impact record into the next level's change set.
/// Impact statements carry no change classification, so derived records are
/// tagged behavioral and attributed to the producing agent.
fn derive_changes(record: &ImpactRecord) -> Vec<ChangeRecord> {
    record
        .impacts
        .iter()
        .map(|impact| {
            ChangeRecord::new(
                impact.component.clone(),
                ChangeType::Behavioral,
                impact.description.clone(),
                impact.severity,
            )
            .with_producer(&record.produced_by)
        })
        .collect()
}
