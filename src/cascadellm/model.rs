//! Uniform record types passed between agents.
//!
//! Every participant in a cascade speaks the same two shapes: a
//! [`ChangeRecord`] flowing downstream and an [`ImpactRecord`] coming back.
//! The orchestrator folds those into a tree of [`CascadeNodeResult`]s and
//! finally one [`AnalysisResult`], which is what the report-rendering side
//! consumes (it serializes cleanly with `serde`).
//!
//! All of these are created fresh per analysis run and treated as read-only
//! after construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Metadata key under which the originating agent name is recorded.
pub const META_PRODUCED_BY: &str = "produced_by";

/// Metadata key for the list of affected sub-components.
pub const META_AFFECTED_COMPONENTS: &str = "affected_components";

/// Severity of a change or impact, totally ordered so results can be
/// sorted and aggregated (`Low < Medium < High < Critical`).
///
/// Serializes as the uppercase strings the inference side emits
/// (`"CRITICAL"`, `"HIGH"`, `"MEDIUM"`, `"LOW"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Parse a severity string leniently, the way model output has to be
    /// read: case-insensitive, surrounding whitespace ignored, anything
    /// unrecognized falls back to `Medium`.
    pub fn parse_lenient(s: &str) -> Severity {
        match s.trim().to_ascii_uppercase().as_str() {
            "CRITICAL" => Severity::Critical,
            "HIGH" => Severity::High,
            "LOW" => Severity::Low,
            _ => Severity::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::High => "HIGH",
            Severity::Medium => "MEDIUM",
            Severity::Low => "LOW",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a change detected by a direct analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Breaking,
    Behavioral,
    Deprecation,
    Removal,
}

impl ChangeType {
    /// Lenient parser for model output. `"deprecated"` is accepted as an
    /// alias for `Deprecation`, `"removed"` for `Removal`; anything else
    /// unknown is treated as `Behavioral`.
    pub fn parse_lenient(s: &str) -> ChangeType {
        match s.trim().to_ascii_lowercase().as_str() {
            "breaking" => ChangeType::Breaking,
            "deprecation" | "deprecated" => ChangeType::Deprecation,
            "removal" | "removed" => ChangeType::Removal,
            _ => ChangeType::Behavioral,
        }
    }
}

/// One change detected in an agent's domain, propagated downstream.
///
/// `metadata` carries at minimum the originating agent name under
/// [`META_PRODUCED_BY`]; direct analyses also record affected
/// sub-components under [`META_AFFECTED_COMPONENTS`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub component: String,
    pub change_type: ChangeType,
    pub description: String,
    pub severity: Severity,
    pub metadata: HashMap<String, Value>,
}

impl ChangeRecord {
    pub fn new(
        component: impl Into<String>,
        change_type: ChangeType,
        description: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            component: component.into(),
            change_type,
            description: description.into(),
            severity,
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata entry (builder pattern, consumed before the record
    /// is handed to the orchestrator).
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Tag this record with the agent that produced it.
    pub fn with_producer(self, agent_name: &str) -> Self {
        self.with_metadata(META_PRODUCED_BY, Value::String(agent_name.to_string()))
    }

    /// The originating agent name, if recorded.
    pub fn produced_by(&self) -> Option<&str> {
        self.metadata.get(META_PRODUCED_BY).and_then(|v| v.as_str())
    }
}

/// One structured impact line inside an [`ImpactRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactStatement {
    pub component: String,
    pub description: String,
    pub severity: Severity,
}

/// Result of one downstream agent's upstream-impact analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactRecord {
    /// Ordered impact statements, most significant first when the producing
    /// agent bothers to sort them.
    pub impacts: Vec<ImpactStatement>,
    /// Ordered remediation steps.
    pub required_actions: Vec<String>,
    /// Overall risk of not acting on the upstream changes.
    pub risk_level: Severity,
    /// Name of the agent that produced this record.
    pub produced_by: String,
}

impl ImpactRecord {
    pub fn new(produced_by: impl Into<String>, risk_level: Severity) -> Self {
        Self {
            impacts: Vec::new(),
            required_actions: Vec::new(),
            risk_level,
            produced_by: produced_by.into(),
        }
    }

    pub fn with_impact(mut self, statement: ImpactStatement) -> Self {
        self.impacts.push(statement);
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.required_actions.push(action.into());
        self
    }
}

/// Outcome of a single agent's execution within a cascade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeOutcome {
    /// The agent completed its upstream-impact analysis.
    Impact(ImpactRecord),
    /// The agent failed terminally; its subtree was not explored.
    Failed { error: String },
}

/// One node of the result tree: an agent's outcome plus the results of its
/// children, in registry insertion order.
///
/// Failed branches are kept in the tree, explicitly marked, so a partial
/// run still renders as a complete report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeNodeResult {
    pub agent_name: String,
    pub outcome: NodeOutcome,
    pub children: Vec<CascadeNodeResult>,
}

impl CascadeNodeResult {
    pub fn succeeded(
        agent_name: impl Into<String>,
        record: ImpactRecord,
        children: Vec<CascadeNodeResult>,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            outcome: NodeOutcome::Impact(record),
            children,
        }
    }

    pub fn failed(agent_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            outcome: NodeOutcome::Failed {
                error: error.into(),
            },
            children: Vec::new(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, NodeOutcome::Failed { .. })
    }

    /// The impact record, if this node succeeded.
    pub fn impact(&self) -> Option<&ImpactRecord> {
        match &self.outcome {
            NodeOutcome::Impact(record) => Some(record),
            NodeOutcome::Failed { .. } => None,
        }
    }

    /// The terminal error, if this node failed.
    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            NodeOutcome::Impact(_) => None,
            NodeOutcome::Failed { error } => Some(error.as_str()),
        }
    }

    fn find<'a>(&'a self, agent_name: &str) -> Option<&'a CascadeNodeResult> {
        if self.agent_name == agent_name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(agent_name))
    }

    fn collect<'a>(&'a self, out: &mut BTreeMap<&'a str, &'a CascadeNodeResult>) {
        out.insert(self.agent_name.as_str(), self);
        for child in &self.children {
            child.collect(out);
        }
    }
}

/// Terminal state of a cascade run.
///
/// `Failed` means the root's own direct analysis failed and nothing was
/// cascaded. A run with isolated branch failures is still `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

/// Aggregated output of one cascade run, handed to the report renderer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Unique id for this run (UUID v4).
    pub run_id: String,
    /// Name of the root agent the cascade started from.
    pub root_agent: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub status: RunStatus,
    /// Changes produced by the root's direct analysis.
    pub root_changes: Vec<ChangeRecord>,
    /// Top-level branch results in registry insertion order. Each entry
    /// carries its full subtree.
    pub branches: Vec<CascadeNodeResult>,
    /// Parent name to ordered child names, for exactly the edges traversed
    /// in this run.
    pub agent_chain: BTreeMap<String, Vec<String>>,
}

impl AnalysisResult {
    /// Look up a node anywhere in the result tree by agent name.
    pub fn node(&self, agent_name: &str) -> Option<&CascadeNodeResult> {
        self.branches.iter().find_map(|b| b.find(agent_name))
    }

    /// Flattened agent-name to node view over the whole tree.
    pub fn flattened(&self) -> BTreeMap<&str, &CascadeNodeResult> {
        let mut out = BTreeMap::new();
        for branch in &self.branches {
            branch.collect(&mut out);
        }
        out
    }

    /// All failed nodes, anywhere in the tree.
    pub fn failed_branches(&self) -> Vec<&CascadeNodeResult> {
        self.flattened()
            .into_iter()
            .map(|(_, node)| node)
            .filter(|node| node.is_failed())
            .collect()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed_branches().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_is_totally_ordered() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn severity_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&Severity::Critical).unwrap(),
            "\"CRITICAL\""
        );
        assert_eq!(Severity::parse_lenient(" high "), Severity::High);
        assert_eq!(Severity::parse_lenient("bogus"), Severity::Medium);
    }

    #[test]
    fn change_type_lenient_aliases() {
        assert_eq!(
            ChangeType::parse_lenient("deprecated"),
            ChangeType::Deprecation
        );
        assert_eq!(ChangeType::parse_lenient("removed"), ChangeType::Removal);
        assert_eq!(ChangeType::parse_lenient("???"), ChangeType::Behavioral);
    }

    #[test]
    fn node_lookup_walks_subtrees() {
        let leaf = CascadeNodeResult::failed("db-agent", "boom");
        let mid = CascadeNodeResult::succeeded(
            "k8s-agent",
            ImpactRecord::new("k8s-agent", Severity::High),
            vec![leaf],
        );
        let result = AnalysisResult {
            run_id: "test".into(),
            root_agent: "os-agent".into(),
            started_at: Utc::now(),
            completed_at: Utc::now(),
            status: RunStatus::Completed,
            root_changes: Vec::new(),
            branches: vec![mid],
            agent_chain: BTreeMap::new(),
        };

        assert!(result.node("db-agent").unwrap().is_failed());
        assert!(!result.node("k8s-agent").unwrap().is_failed());
        assert_eq!(result.failed_branches().len(), 1);
    }
}
