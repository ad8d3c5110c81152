use async_trait::async_trait;
use cascadellm::agent::{AnalysisError, CascadeAgent, SpecialistAgent};
use cascadellm::cache::ResponseCache;
use cascadellm::credentials::{Credential, CredentialManager};
use cascadellm::inference::{
    GeneratedMessage, InferenceClient, PromptContext, ProviderError,
};
use cascadellm::knowledge::StaticKnowledgeBase;
use cascadellm::model::{ChangeRecord, ChangeType, Severity};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct MockClient {
    responses: Mutex<VecDeque<Result<String, ProviderError>>>,
    calls: AtomicUsize,
    last_user_prompt: Mutex<Option<String>>,
}

impl MockClient {
    fn with_responses(responses: Vec<Result<String, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().collect()),
            calls: AtomicUsize::new(0),
            last_user_prompt: Mutex::new(None),
        })
    }

    fn replying(content: &str) -> Arc<Self> {
        Self::with_responses(vec![Ok(content.to_string())])
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_user_prompt(&self) -> String {
        self.last_user_prompt.lock().unwrap().clone().unwrap_or_default()
    }
}

#[async_trait]
impl InferenceClient for MockClient {
    async fn generate(
        &self,
        _credential: &Credential,
        context: &PromptContext,
    ) -> Result<GeneratedMessage, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_user_prompt.lock().unwrap() = Some(context.user.clone());
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(Ok(content)) => Ok(GeneratedMessage {
                content,
                usage: None,
            }),
            Some(Err(err)) => Err(err),
            None => Err(ProviderError::permanent("mock response queue empty")),
        }
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

fn agent_over(client: Arc<MockClient>, name: &str) -> SpecialistAgent {
    SpecialistAgent::new(
        name,
        "operating systems",
        client,
        Arc::new(CredentialManager::new(vec![Credential::new(
            "primary", "sk-test",
        )])),
        Arc::new(ResponseCache::new()),
    )
}

fn upgrade_params() -> HashMap<String, String> {
    let mut params = HashMap::new();
    params.insert("from_version".to_string(), "SLES 15 SP6".to_string());
    params.insert("to_version".to_string(), "SLES 15 SP7".to_string());
    params
}

fn upstream_changes() -> Vec<ChangeRecord> {
    vec![ChangeRecord::new(
        "kernel",
        ChangeType::Breaking,
        "cgroups v1 removed",
        Severity::Critical,
    )
    .with_producer("os-agent")]
}

#[tokio::test]
async fn direct_analysis_parses_fenced_json() {
    let client = MockClient::replying(
        "Here is the analysis:\n```json\n{\n  \"breaking_changes\": [\n    {\n      \
         \"component\": \"kernel\",\n      \"change_type\": \"breaking\",\n      \
         \"description\": \"cgroups v1 removed\",\n      \"impact_severity\": \"CRITICAL\",\n      \
         \"affected_components\": [\"kubelet\", \"containerd\"]\n    },\n    {\n      \
         \"component\": \"openssl\",\n      \"change_type\": \"deprecated\",\n      \
         \"description\": \"TLS 1.1 off by default\",\n      \"impact_severity\": \"weird\"\n    }\n  ]\n}\n```",
    );
    let agent = agent_over(Arc::clone(&client), "os-agent");

    let changes = agent.analyze_direct(&upgrade_params()).await.unwrap();
    assert_eq!(changes.len(), 2);

    assert_eq!(changes[0].component, "kernel");
    assert_eq!(changes[0].change_type, ChangeType::Breaking);
    assert_eq!(changes[0].severity, Severity::Critical);
    assert_eq!(changes[0].produced_by(), Some("os-agent"));
    let affected = changes[0]
        .metadata
        .get(cascadellm::model::META_AFFECTED_COMPONENTS)
        .and_then(|v| v.as_array())
        .unwrap();
    assert_eq!(affected.len(), 2);

    // Lenient parsing: alias change types and unknown severities degrade
    // instead of failing the whole analysis.
    assert_eq!(changes[1].change_type, ChangeType::Deprecation);
    assert_eq!(changes[1].severity, Severity::Medium);
}

#[tokio::test]
async fn impact_analysis_parses_structured_output() {
    let client = MockClient::replying(
        "{\"impacts\": [{\"component\": \"kubelet\", \"description\": \"cgroup driver must change\", \
         \"severity\": \"HIGH\"}], \"required_actions\": [\"switch to systemd driver\"], \
         \"risk_level\": \"HIGH\"}",
    );
    let agent = agent_over(client, "k8s-agent");

    let record = agent
        .analyze_upstream_impact(&upstream_changes())
        .await
        .unwrap();
    assert_eq!(record.produced_by, "k8s-agent");
    assert_eq!(record.risk_level, Severity::High);
    assert_eq!(record.impacts.len(), 1);
    assert_eq!(record.impacts[0].component, "kubelet");
    assert_eq!(record.required_actions, vec!["switch to systemd driver"]);
}

#[tokio::test]
async fn missing_risk_level_falls_back_to_worst_impact() {
    let client = MockClient::replying(
        "{\"impacts\": [\
         {\"component\": \"a\", \"description\": \"x\", \"severity\": \"LOW\"}, \
         {\"component\": \"b\", \"description\": \"y\", \"severity\": \"CRITICAL\"}]}",
    );
    let agent = agent_over(client, "k8s-agent");

    let record = agent
        .analyze_upstream_impact(&upstream_changes())
        .await
        .unwrap();
    assert_eq!(record.risk_level, Severity::Critical);
    assert!(record.required_actions.is_empty());
}

#[tokio::test]
async fn empty_change_set_is_rejected_without_calling_the_provider() {
    let client = MockClient::replying("{\"impacts\": []}");
    let agent = agent_over(Arc::clone(&client), "k8s-agent");

    let err = agent.analyze_upstream_impact(&[]).await.unwrap_err();
    assert!(matches!(err, AnalysisError::EmptyChangeSet { .. }));
    assert_eq!(client.calls(), 0);
}

#[tokio::test]
async fn unparseable_output_is_a_malformed_output_error() {
    let client = MockClient::replying("Sorry, I cannot help with that.");
    let agent = agent_over(client, "os-agent");

    let err = agent.analyze_direct(&upgrade_params()).await.unwrap_err();
    match err {
        AnalysisError::MalformedOutput { agent, .. } => assert_eq!(agent, "os-agent"),
        other => panic!("expected MalformedOutput, got {}", other),
    }
}

#[tokio::test]
async fn provider_failure_surfaces_after_the_retry_budget() {
    let client = MockClient::with_responses(vec![Err(ProviderError::permanent(
        "model rejected the request",
    ))]);
    let agent = agent_over(client, "os-agent");

    let err = agent.analyze_direct(&upgrade_params()).await.unwrap_err();
    assert!(matches!(err, AnalysisError::Provider(_)));
}

#[tokio::test]
async fn knowledge_snippets_are_embedded_in_the_prompt() {
    let client = MockClient::replying("{\"breaking_changes\": []}");
    let kb = StaticKnowledgeBase::new().with_document(
        "release-notes",
        "SLES 15 SP7 drops cgroups v1 support entirely",
    );
    let agent = agent_over(Arc::clone(&client), "os-agent").with_knowledge(Arc::new(kb));

    agent.analyze_direct(&upgrade_params()).await.unwrap();

    let prompt = client.last_user_prompt();
    assert!(prompt.contains("[release-notes]"));
    assert!(prompt.contains("drops cgroups v1"));
    assert!(prompt.contains("from_version"));
}

#[tokio::test]
async fn analyses_run_on_spawned_tasks() {
    // The orchestrator dispatches branches via tokio::spawn, so the
    // analysis futures must be Send even while the cache coordinates
    // concurrent callers.
    let client = MockClient::replying("{\"breaking_changes\": []}");
    let agent = Arc::new(agent_over(Arc::clone(&client), "os-agent"));

    let handle = tokio::spawn({
        let agent = Arc::clone(&agent);
        async move { agent.analyze_direct(&upgrade_params()).await }
    });

    let changes = handle.await.unwrap().unwrap();
    assert!(changes.is_empty());
    assert_eq!(client.calls(), 1);
}

#[tokio::test]
async fn identical_requests_hit_the_cache() {
    let client = MockClient::with_responses(vec![
        Ok("{\"breaking_changes\": []}".to_string()),
        Ok("{\"breaking_changes\": []}".to_string()),
    ]);
    let agent = agent_over(Arc::clone(&client), "os-agent");

    agent.analyze_direct(&upgrade_params()).await.unwrap();
    agent.analyze_direct(&upgrade_params()).await.unwrap();
    assert_eq!(client.calls(), 1);

    // A different parameter set misses the cache.
    let mut params = upgrade_params();
    params.insert("to_version".to_string(), "SLES 15 SP8".to_string());
    agent.analyze_direct(&params).await.unwrap();
    assert_eq!(client.calls(), 2);
}
