use async_trait::async_trait;
use cascadellm::agent::{AnalysisError, CascadeAgent};
use cascadellm::event::{CascadeEvent, EventHandler};
use cascadellm::inference::ProviderError;
use cascadellm::model::{
    ChangeRecord, ChangeType, ImpactRecord, ImpactStatement, RunStatus, Severity,
};
use cascadellm::orchestrator::{CascadeError, CascadeOrchestrator};
use cascadellm::registry::AgentRegistry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct ScriptedAgent {
    name: String,
    direct: Result<Vec<ChangeRecord>, String>,
    impact: Result<ImpactRecord, String>,
    delay: Option<Duration>,
    received: Mutex<Vec<ChangeRecord>>,
}

impl ScriptedAgent {
    fn root(name: &str, changes: Vec<ChangeRecord>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            direct: Ok(changes),
            impact: Ok(ImpactRecord::new(name, Severity::Low)),
            delay: None,
            received: Mutex::new(Vec::new()),
        })
    }

    fn failing_root(name: &str, error: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            direct: Err(error.to_string()),
            impact: Ok(ImpactRecord::new(name, Severity::Low)),
            delay: None,
            received: Mutex::new(Vec::new()),
        })
    }

    fn succeeding(name: &str, impact: ImpactRecord) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            direct: Ok(Vec::new()),
            impact: Ok(impact),
            delay: None,
            received: Mutex::new(Vec::new()),
        })
    }

    fn failing(name: &str, error: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            direct: Ok(Vec::new()),
            impact: Err(error.to_string()),
            delay: None,
            received: Mutex::new(Vec::new()),
        })
    }

    fn slow(name: &str, impact: ImpactRecord, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            direct: Ok(Vec::new()),
            impact: Ok(impact),
            delay: Some(delay),
            received: Mutex::new(Vec::new()),
        })
    }

    fn received(&self) -> Vec<ChangeRecord> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl CascadeAgent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn domain(&self) -> &str {
        "scripted"
    }

    async fn analyze_direct(
        &self,
        _params: &HashMap<String, String>,
    ) -> Result<Vec<ChangeRecord>, AnalysisError> {
        match &self.direct {
            Ok(changes) => Ok(changes.clone()),
            Err(message) => Err(AnalysisError::Provider(ProviderError::permanent(
                message.clone(),
            ))),
        }
    }

    async fn analyze_upstream_impact(
        &self,
        changes: &[ChangeRecord],
    ) -> Result<ImpactRecord, AnalysisError> {
        self.received.lock().unwrap().extend(changes.iter().cloned());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.impact {
            Ok(record) => Ok(record.clone()),
            Err(message) => Err(AnalysisError::Provider(ProviderError::transient(
                message.clone(),
            ))),
        }
    }
}

struct RecordingHandler {
    events: Mutex<Vec<CascadeEvent>>,
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn on_event(&self, event: &CascadeEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

fn os_changes() -> Vec<ChangeRecord> {
    vec![
        ChangeRecord::new(
            "kernel",
            ChangeType::Breaking,
            "cgroups v1 removed",
            Severity::Critical,
        )
        .with_producer("os-agent"),
        ChangeRecord::new(
            "systemd",
            ChangeType::Behavioral,
            "default unit ordering changed",
            Severity::Medium,
        )
        .with_producer("os-agent"),
        ChangeRecord::new(
            "openssl",
            ChangeType::Deprecation,
            "TLS 1.1 disabled by default",
            Severity::High,
        )
        .with_producer("os-agent"),
    ]
}

fn upgrade_params() -> HashMap<String, String> {
    let mut params = HashMap::new();
    params.insert("from_version".to_string(), "SLES 15 SP6".to_string());
    params.insert("to_version".to_string(), "SLES 15 SP7".to_string());
    params
}

#[tokio::test]
async fn branches_report_in_registration_order() {
    let root = ScriptedAgent::root("root", os_changes());
    let mut registry = AgentRegistry::new();
    registry.register(root).unwrap();
    for name in ["zeta", "alpha", "mid"] {
        registry
            .register(ScriptedAgent::succeeding(
                name,
                ImpactRecord::new(name, Severity::Low),
            ))
            .unwrap();
        registry.add_edge("root", name).unwrap();
    }

    let orchestrator = CascadeOrchestrator::new(Arc::new(registry));
    let result = orchestrator.run("root", upgrade_params()).await.unwrap();

    let names: Vec<&str> = result.branches.iter().map(|b| b.agent_name.as_str()).collect();
    assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    assert_eq!(result.status, RunStatus::Completed);
    assert!(!result.has_failures());
}

#[tokio::test]
async fn failed_branch_is_isolated_from_siblings() {
    let root = ScriptedAgent::root("os-agent", os_changes());
    let k8s = ScriptedAgent::succeeding(
        "k8s-agent",
        ImpactRecord::new("k8s-agent", Severity::High)
            .with_impact(ImpactStatement {
                component: "kubelet".to_string(),
                description: "must migrate to cgroups v2 driver".to_string(),
                severity: Severity::High,
            })
            .with_action("set cgroupDriver=systemd before upgrading nodes"),
    );
    let db = ScriptedAgent::failing("db-agent", "provider unavailable after retries");

    let mut registry = AgentRegistry::new();
    registry.register(root).unwrap();
    registry.register(k8s).unwrap();
    registry.register(db).unwrap();
    registry.add_edge("os-agent", "k8s-agent").unwrap();
    registry.add_edge("os-agent", "db-agent").unwrap();

    let orchestrator = CascadeOrchestrator::new(Arc::new(registry));
    let result = orchestrator.run("os-agent", upgrade_params()).await.unwrap();

    // The run completes; the db failure is recorded, not propagated.
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.root_changes.len(), 3);
    assert_eq!(result.branches.len(), 2);

    let k8s_node = result.node("k8s-agent").unwrap();
    assert_eq!(k8s_node.impact().unwrap().risk_level, Severity::High);
    assert_eq!(k8s_node.impact().unwrap().impacts.len(), 1);

    let db_node = result.node("db-agent").unwrap();
    assert!(db_node.is_failed());
    assert!(db_node.error().unwrap().contains("provider unavailable"));

    assert_eq!(result.failed_branches().len(), 1);
    assert_eq!(
        result.agent_chain["os-agent"],
        vec!["k8s-agent".to_string(), "db-agent".to_string()]
    );
}

#[tokio::test]
async fn empty_root_change_set_skips_fan_out() {
    let root = ScriptedAgent::root("os-agent", Vec::new());
    let child = ScriptedAgent::succeeding(
        "k8s-agent",
        ImpactRecord::new("k8s-agent", Severity::Low),
    );

    let mut registry = AgentRegistry::new();
    registry.register(root).unwrap();
    registry.register(Arc::clone(&child) as Arc<dyn CascadeAgent>).unwrap();
    registry.add_edge("os-agent", "k8s-agent").unwrap();

    let orchestrator = CascadeOrchestrator::new(Arc::new(registry));
    let result = orchestrator.run("os-agent", upgrade_params()).await.unwrap();

    // Children are never invoked with an empty change set.
    assert!(child.received().is_empty());
    assert_eq!(result.status, RunStatus::Completed);
    assert!(result.root_changes.is_empty());
    assert!(result.branches.is_empty());
    assert!(!result.has_failures());
}

#[tokio::test]
async fn root_failure_is_fatal() {
    let root = ScriptedAgent::failing_root("os-agent", "model rejected the request");
    let mut registry = AgentRegistry::new();
    registry.register(root).unwrap();

    let orchestrator = CascadeOrchestrator::new(Arc::new(registry));
    let err = orchestrator
        .run("os-agent", upgrade_params())
        .await
        .unwrap_err();
    match err {
        CascadeError::RootAnalysis { agent, .. } => assert_eq!(agent, "os-agent"),
        other => panic!("expected RootAnalysis, got {}", other),
    }
}

#[tokio::test]
async fn run_validates_registry_and_root() {
    let orchestrator = CascadeOrchestrator::new(Arc::new(AgentRegistry::new()));
    assert!(matches!(
        orchestrator.run("os-agent", HashMap::new()).await,
        Err(CascadeError::EmptyRegistry)
    ));

    let mut registry = AgentRegistry::new();
    registry
        .register(ScriptedAgent::root("os-agent", os_changes()))
        .unwrap();
    registry
        .register(ScriptedAgent::succeeding(
            "k8s-agent",
            ImpactRecord::new("k8s-agent", Severity::Low),
        ))
        .unwrap();
    registry.add_edge("os-agent", "k8s-agent").unwrap();

    let orchestrator = CascadeOrchestrator::new(Arc::new(registry));
    assert!(matches!(
        orchestrator.run("ghost", HashMap::new()).await,
        Err(CascadeError::UnknownRoot(_))
    ));
    assert!(matches!(
        orchestrator.run("k8s-agent", HashMap::new()).await,
        Err(CascadeError::RootHasUpstream { .. })
    ));
}

#[tokio::test]
async fn impacts_cascade_to_the_next_level() {
    let root = ScriptedAgent::root("os-agent", os_changes());
    let mid = ScriptedAgent::succeeding(
        "k8s-agent",
        ImpactRecord::new("k8s-agent", Severity::High).with_impact(ImpactStatement {
            component: "ingress-controller".to_string(),
            description: "TLS termination loses 1.1 clients".to_string(),
            severity: Severity::High,
        }),
    );
    let leaf = ScriptedAgent::succeeding(
        "app-agent",
        ImpactRecord::new("app-agent", Severity::Medium),
    );

    let mut registry = AgentRegistry::new();
    registry.register(Arc::clone(&root) as Arc<dyn CascadeAgent>).unwrap();
    registry.register(Arc::clone(&mid) as Arc<dyn CascadeAgent>).unwrap();
    registry.register(Arc::clone(&leaf) as Arc<dyn CascadeAgent>).unwrap();
    registry.add_edge("os-agent", "k8s-agent").unwrap();
    registry.add_edge("k8s-agent", "app-agent").unwrap();

    let orchestrator = CascadeOrchestrator::new(Arc::new(registry));
    let result = orchestrator.run("os-agent", upgrade_params()).await.unwrap();

    // The mid agent saw the root's raw changes.
    assert_eq!(mid.received().len(), 3);
    assert_eq!(mid.received()[0].produced_by(), Some("os-agent"));

    // The leaf saw changes derived from the mid agent's impacts, not the
    // root's change set.
    let leaf_changes = leaf.received();
    assert_eq!(leaf_changes.len(), 1);
    assert_eq!(leaf_changes[0].component, "ingress-controller");
    assert_eq!(leaf_changes[0].change_type, ChangeType::Behavioral);
    assert_eq!(leaf_changes[0].produced_by(), Some("k8s-agent"));

    let mid_node = result.node("k8s-agent").unwrap();
    assert_eq!(mid_node.children.len(), 1);
    assert_eq!(mid_node.children[0].agent_name, "app-agent");
}

#[tokio::test]
async fn empty_impact_set_stops_the_subtree() {
    let root = ScriptedAgent::root("os-agent", os_changes());
    // Succeeds but reports nothing to act on.
    let mid = ScriptedAgent::succeeding(
        "k8s-agent",
        ImpactRecord::new("k8s-agent", Severity::Low),
    );
    let leaf = ScriptedAgent::succeeding(
        "app-agent",
        ImpactRecord::new("app-agent", Severity::Low),
    );

    let mut registry = AgentRegistry::new();
    registry.register(root).unwrap();
    registry.register(mid).unwrap();
    registry.register(Arc::clone(&leaf) as Arc<dyn CascadeAgent>).unwrap();
    registry.add_edge("os-agent", "k8s-agent").unwrap();
    registry.add_edge("k8s-agent", "app-agent").unwrap();

    let orchestrator = CascadeOrchestrator::new(Arc::new(registry));
    let result = orchestrator.run("os-agent", upgrade_params()).await.unwrap();

    assert!(leaf.received().is_empty());
    assert!(result.node("app-agent").is_none());
    assert!(result.node("k8s-agent").unwrap().children.is_empty());
}

#[tokio::test]
async fn run_timeout_fails_pending_branches_only() {
    let root = ScriptedAgent::root("os-agent", os_changes());
    let fast = ScriptedAgent::succeeding(
        "k8s-agent",
        ImpactRecord::new("k8s-agent", Severity::Medium),
    );
    let slow = ScriptedAgent::slow(
        "db-agent",
        ImpactRecord::new("db-agent", Severity::Medium),
        Duration::from_secs(5),
    );

    let mut registry = AgentRegistry::new();
    registry.register(root).unwrap();
    registry.register(fast).unwrap();
    registry.register(slow).unwrap();
    registry.add_edge("os-agent", "k8s-agent").unwrap();
    registry.add_edge("os-agent", "db-agent").unwrap();

    let orchestrator = CascadeOrchestrator::new(Arc::new(registry))
        .with_run_timeout(Duration::from_millis(200));
    let result = orchestrator.run("os-agent", upgrade_params()).await.unwrap();

    assert!(!result.node("k8s-agent").unwrap().is_failed());
    let slow_node = result.node("db-agent").unwrap();
    assert!(slow_node.is_failed());
    assert!(slow_node.error().unwrap().contains("timeout"));
}

#[tokio::test]
async fn lifecycle_events_cover_the_whole_run() {
    let handler = Arc::new(RecordingHandler {
        events: Mutex::new(Vec::new()),
    });

    let root = ScriptedAgent::root("os-agent", os_changes());
    let k8s = ScriptedAgent::succeeding(
        "k8s-agent",
        ImpactRecord::new("k8s-agent", Severity::High),
    );
    let db = ScriptedAgent::failing("db-agent", "boom");

    let mut registry = AgentRegistry::new();
    registry.register(root).unwrap();
    registry.register(k8s).unwrap();
    registry.register(db).unwrap();
    registry.add_edge("os-agent", "k8s-agent").unwrap();
    registry.add_edge("os-agent", "db-agent").unwrap();

    let orchestrator = CascadeOrchestrator::new(Arc::new(registry))
        .with_event_handler(Arc::clone(&handler) as Arc<dyn EventHandler>);
    orchestrator.run("os-agent", upgrade_params()).await.unwrap();

    let events = handler.events.lock().unwrap();
    assert!(matches!(events.first(), Some(CascadeEvent::RunStarted { .. })));
    assert!(matches!(events.get(1), Some(CascadeEvent::RootAnalyzed { change_count: 3, .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, CascadeEvent::BranchCompleted { agent_name, .. } if agent_name == "k8s-agent")));
    assert!(events
        .iter()
        .any(|e| matches!(e, CascadeEvent::BranchFailed { agent_name, .. } if agent_name == "db-agent")));
    assert!(matches!(
        events.last(),
        Some(CascadeEvent::RunCompleted { failed_branches: 1, .. })
    ));
}
