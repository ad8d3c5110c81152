//! Agent contract and the prompt-driven specialist implementation.
//!
//! Every cascade participant implements [`CascadeAgent`]: a direct analysis
//! used when the agent is the root of a run, and an upstream-impact analysis
//! used when changes arrive from its producer. Agents must tolerate running
//! concurrently with their siblings; the orchestrator invokes each agent
//! node at most once per run.
//!
//! [`SpecialistAgent`] is the built-in implementation: it builds prompts
//! from its domain and expertise, optionally pulls context snippets from a
//! [`KnowledgeSource`], calls the inference provider through the shared
//! [`CredentialManager`] and [`ResponseCache`], and parses the model's JSON
//! into the uniform record types.

use crate::cascadellm::cache::ResponseCache;
use crate::cascadellm::credentials::CredentialManager;
use crate::cascadellm::inference::{InferenceClient, PromptContext, ProviderError};
use crate::cascadellm::knowledge::KnowledgeSource;
use crate::cascadellm::model::{
    ChangeRecord, ChangeType, ImpactRecord, ImpactStatement, Severity, META_AFFECTED_COMPONENTS,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Failure of one agent's analysis, after the provider's retry budget is
/// spent.
#[derive(Debug, Clone)]
pub enum AnalysisError {
    /// The inference collaborator failed terminally.
    Provider(ProviderError),
    /// The model answered, but not with the structured shape the agent
    /// requires.
    MalformedOutput { agent: String, detail: String },
    /// `analyze_upstream_impact` was invoked with no changes.
    EmptyChangeSet { agent: String },
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisError::Provider(err) => write!(f, "{}", err),
            AnalysisError::MalformedOutput { agent, detail } => {
                write!(f, "{}: unparseable model output: {}", agent, detail)
            }
            AnalysisError::EmptyChangeSet { agent } => {
                write!(f, "{}: upstream impact requested with no changes", agent)
            }
        }
    }
}

impl Error for AnalysisError {}

impl From<ProviderError> for AnalysisError {
    fn from(err: ProviderError) -> Self {
        AnalysisError::Provider(err)
    }
}

/// The capability set every analysis participant implements.
///
/// Side effects are limited to the shared credential manager and response
/// cache; agents never mutate registry structure during a run.
#[async_trait]
pub trait CascadeAgent: Send + Sync {
    /// Unique agent name, the identity used in the registry graph.
    fn name(&self) -> &str;

    /// The domain this agent specializes in.
    fn domain(&self) -> &str;

    /// Direct analysis, used only when this agent is the root of a run.
    /// `params` is a domain-specific key/value bag (e.g. a version pair).
    async fn analyze_direct(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<Vec<ChangeRecord>, AnalysisError>;

    /// Analyze how upstream changes impact this agent's domain. `changes`
    /// is always non-empty when called by the orchestrator.
    async fn analyze_upstream_impact(
        &self,
        changes: &[ChangeRecord],
    ) -> Result<ImpactRecord, AnalysisError>;
}

/// A prompt-driven [`CascadeAgent`] over an LLM provider.
pub struct SpecialistAgent {
    name: String,
    domain: String,
    expertise: Option<String>,
    inference: Arc<dyn InferenceClient>,
    credentials: Arc<CredentialManager>,
    cache: Arc<ResponseCache>,
    knowledge: Option<Arc<dyn KnowledgeSource>>,
    max_context_snippets: usize,
    max_tokens: usize,
}

impl SpecialistAgent {
    pub fn new(
        name: impl Into<String>,
        domain: impl Into<String>,
        inference: Arc<dyn InferenceClient>,
        credentials: Arc<CredentialManager>,
        cache: Arc<ResponseCache>,
    ) -> Self {
        Self {
            name: name.into(),
            domain: domain.into(),
            expertise: None,
            inference,
            credentials,
            cache,
            knowledge: None,
            max_context_snippets: 5,
            max_tokens: 4096,
        }
    }

    /// Free-form expertise embedded into the system prompt (builder pattern).
    pub fn with_expertise(mut self, expertise: impl Into<String>) -> Self {
        self.expertise = Some(expertise.into());
        self
    }

    /// Knowledge source consulted before each inference call (builder pattern).
    pub fn with_knowledge(mut self, knowledge: Arc<dyn KnowledgeSource>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    async fn gather_context(&self, query: &str) -> String {
        let source = match &self.knowledge {
            Some(source) => source,
            None => return String::from("(no additional context available)"),
        };
        match source.query(query, self.max_context_snippets).await {
            Ok(snippets) if !snippets.is_empty() => snippets
                .iter()
                .map(|s| format!("[{}] {}", s.source, s.content))
                .collect::<Vec<_>>()
                .join("\n"),
            Ok(_) => String::from("(no additional context available)"),
            Err(err) => {
                // Context is best-effort; the analysis proceeds without it.
                log::warn!("{}: knowledge lookup failed: {}", self.name, err);
                String::from("(no additional context available)")
            }
        }
    }

    /// One memoized, rotation-protected inference round trip.
    ///
    /// Retries happen inside the credential manager. An error surfacing
    /// here is terminal for this analysis; in particular a coalescing
    /// timeout, although transient, fails this branch rather than being
    /// retried against the provider.
    async fn call_model(&self, context: PromptContext) -> Result<String, AnalysisError> {
        let fingerprint = ResponseCache::fingerprint(&self.name, &context.canonical_payload());
        let credentials = Arc::clone(&self.credentials);
        let inference = Arc::clone(&self.inference);

        let message = self
            .cache
            .get_or_fetch(&fingerprint, move || async move {
                credentials
                    .invoke(move |credential| {
                        let inference = Arc::clone(&inference);
                        let context = context.clone();
                        async move { inference.generate(&credential, &context).await }
                    })
                    .await
            })
            .await?;

        if let Some(usage) = &message.usage {
            log::debug!(
                "{}: inference used {} tokens ({} in / {} out)",
                self.name,
                usage.total_tokens,
                usage.input_tokens,
                usage.output_tokens
            );
        }
        Ok(message.content.clone())
    }

    fn direct_system_prompt(&self) -> String {
        let mut prompt = format!(
            "You are a senior {} compatibility engineer. Detect specific changes \
             between the given versions, name exact components, and state severity \
             honestly (CRITICAL/HIGH/MEDIUM/LOW).",
            self.domain
        );
        if let Some(expertise) = &self.expertise {
            prompt.push_str("\n\nYour expertise includes:\n");
            prompt.push_str(expertise);
        }
        prompt
    }

    fn direct_user_prompt(params: &HashMap<String, String>, context: &str) -> String {
        let mut keys: Vec<&String> = params.keys().collect();
        keys.sort();
        let param_lines = keys
            .iter()
            .map(|k| format!("- {}: {}", k, params[k.as_str()]))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "Analyze the following upgrade:\n{}\n\nContext from the knowledge base:\n{}\n\n\
             Output ONLY a JSON object with this exact structure:\n\
             {{\n  \"breaking_changes\": [\n    {{\n      \"component\": \"exact component name\",\n      \
             \"change_type\": \"breaking|behavioral|deprecation|removal\",\n      \
             \"description\": \"what changed and why it breaks existing setups\",\n      \
             \"impact_severity\": \"CRITICAL|HIGH|MEDIUM|LOW\",\n      \
             \"affected_components\": [\"downstream components\"]\n    }}\n  ]\n}}\n\
             No markdown, no explanations.",
            param_lines, context
        )
    }

    fn impact_system_prompt(&self) -> String {
        let mut prompt = format!(
            "You are analyzing the downstream impact of upstream changes on {}. \
             Map each upstream change to specific impacts on this layer, the actions \
             required to mitigate, and the risk of not acting.",
            self.domain
        );
        if let Some(expertise) = &self.expertise {
            prompt.push_str("\n\nYour expertise includes:\n");
            prompt.push_str(expertise);
        }
        prompt
    }

    fn impact_user_prompt(changes: &[ChangeRecord], context: &str) -> String {
        format!(
            "Upstream changes:\n{}\n\nContext from the knowledge base:\n{}\n\n\
             Output ONLY a JSON object with this exact structure:\n\
             {{\n  \"impacts\": [\n    {{\n      \"component\": \"affected component\",\n      \
             \"description\": \"how it is affected\",\n      \
             \"severity\": \"CRITICAL|HIGH|MEDIUM|LOW\"\n    }}\n  ],\n  \
             \"required_actions\": [\"ordered remediation steps\"],\n  \
             \"risk_level\": \"CRITICAL|HIGH|MEDIUM|LOW\"\n}}\n\
             No markdown, no explanations.",
            format_changes(changes),
            context
        )
    }

    fn parse_direct(&self, content: &str) -> Result<Vec<ChangeRecord>, AnalysisError> {
        let payload = extract_json(content).ok_or_else(|| AnalysisError::MalformedOutput {
            agent: self.name.clone(),
            detail: "no JSON object found in response".into(),
        })?;
        let changes = payload
            .get("breaking_changes")
            .and_then(Value::as_array)
            .ok_or_else(|| AnalysisError::MalformedOutput {
                agent: self.name.clone(),
                detail: "missing breaking_changes array".into(),
            })?;

        let mut records = Vec::with_capacity(changes.len());
        for entry in changes {
            let component = str_field(entry, "component").unwrap_or("unknown");
            let description = str_field(entry, "description").unwrap_or("");
            let change_type = ChangeType::parse_lenient(str_field(entry, "change_type").unwrap_or(""));
            let severity = Severity::parse_lenient(str_field(entry, "impact_severity").unwrap_or(""));

            let mut record = ChangeRecord::new(component, change_type, description, severity)
                .with_producer(&self.name);
            if let Some(affected) = entry.get("affected_components") {
                if affected.is_array() {
                    record = record.with_metadata(META_AFFECTED_COMPONENTS, affected.clone());
                }
            }
            records.push(record);
        }
        Ok(records)
    }

    fn parse_impact(&self, content: &str) -> Result<ImpactRecord, AnalysisError> {
        let payload = extract_json(content).ok_or_else(|| AnalysisError::MalformedOutput {
            agent: self.name.clone(),
            detail: "no JSON object found in response".into(),
        })?;
        let impacts = payload
            .get("impacts")
            .and_then(Value::as_array)
            .ok_or_else(|| AnalysisError::MalformedOutput {
                agent: self.name.clone(),
                detail: "missing impacts array".into(),
            })?;

        let statements: Vec<ImpactStatement> = impacts
            .iter()
            .map(|entry| ImpactStatement {
                component: str_field(entry, "component").unwrap_or("unknown").to_string(),
                description: str_field(entry, "description").unwrap_or("").to_string(),
                severity: Severity::parse_lenient(str_field(entry, "severity").unwrap_or("")),
            })
            .collect();

        let risk_level = match str_field(&payload, "risk_level") {
            Some(level) => Severity::parse_lenient(level),
            // Fall back to the worst individual impact.
            None => statements
                .iter()
                .map(|s| s.severity)
                .max()
                .unwrap_or(Severity::Medium),
        };

        let required_actions = payload
            .get("required_actions")
            .and_then(Value::as_array)
            .map(|actions| {
                actions
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut record = ImpactRecord::new(self.name.clone(), risk_level);
        record.impacts = statements;
        record.required_actions = required_actions;
        Ok(record)
    }
}

#[async_trait]
impl CascadeAgent for SpecialistAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn domain(&self) -> &str {
        &self.domain
    }

    async fn analyze_direct(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<Vec<ChangeRecord>, AnalysisError> {
        let mut values: Vec<&str> = params.values().map(String::as_str).collect();
        values.sort();
        let context = self.gather_context(&values.join(" ")).await;

        let prompt = PromptContext::new(
            self.direct_system_prompt(),
            Self::direct_user_prompt(params, &context),
        )
        .with_max_tokens(self.max_tokens);

        log::info!("{}: running direct analysis", self.name);
        let content = self.call_model(prompt).await?;
        let records = self.parse_direct(&content)?;
        log::info!("{}: direct analysis found {} changes", self.name, records.len());
        Ok(records)
    }

    async fn analyze_upstream_impact(
        &self,
        changes: &[ChangeRecord],
    ) -> Result<ImpactRecord, AnalysisError> {
        if changes.is_empty() {
            return Err(AnalysisError::EmptyChangeSet {
                agent: self.name.clone(),
            });
        }

        let query: Vec<&str> = changes.iter().map(|c| c.component.as_str()).collect();
        let context = self.gather_context(&query.join(" ")).await;

        let prompt = PromptContext::new(
            self.impact_system_prompt(),
            Self::impact_user_prompt(changes, &context),
        )
        .with_max_tokens(self.max_tokens);

        log::info!(
            "{}: analyzing impact of {} upstream changes",
            self.name,
            changes.len()
        );
        let content = self.call_model(prompt).await?;
        self.parse_impact(&content)
    }
}

/// Render upstream changes as the plain-text block embedded in impact
/// prompts.
fn format_changes(changes: &[ChangeRecord]) -> String {
    changes
        .iter()
        .enumerate()
        .map(|(i, c)| {
            format!(
                "{}. [{}] {} ({:?}): {}",
                i + 1,
                c.severity,
                c.component,
                c.change_type,
                c.description
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Pull the first JSON object out of model output, tolerating markdown code
/// fences and prose around it.
fn extract_json(content: &str) -> Option<Value> {
    let trimmed = content.trim();

    // Prefer a fenced block when present.
    let candidate = if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        match after.find("```") {
            Some(end) => &after[..end],
            None => after,
        }
    } else {
        trimmed
    };

    let first = candidate.find('{')?;
    let last = candidate.rfind('}')?;
    if last < first {
        return None;
    }
    serde_json::from_str(&candidate[first..=last]).ok()
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_handles_fences_and_prose() {
        let fenced = "Here you go:\n```json\n{\"breaking_changes\": []}\n```\nDone.";
        assert!(extract_json(fenced).unwrap().get("breaking_changes").is_some());

        let bare = "{\"impacts\": []} trailing";
        assert!(extract_json(bare).unwrap().get("impacts").is_some());

        assert!(extract_json("no json here").is_none());
    }
}
