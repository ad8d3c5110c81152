//! Agent registry: nodes, upstream/downstream wiring, graph invariants.
//!
//! The registry owns every agent instance and the edges between them. Two
//! invariants are enforced on every mutation:
//!
//! - the edge relation stays acyclic (checked by reachability before an
//!   edge is inserted), and
//! - each node has at most one upstream producer, so a change set always
//!   has one unambiguous origin per node. Multi-parent fan-in would need a
//!   merge policy for `ChangeRecord` sets that nobody has defined.
//!
//! Edge insertion order is preserved per node and is the canonical fan-out
//! order: execution is concurrent, but results are always reported in this
//! order. Wiring is done once at startup; the registry is read-only while a
//! run is in flight.

use crate::cascadellm::agent::CascadeAgent;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Errors raised while building the agent graph. All of these are fatal at
/// configuration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    DuplicateName(String),
    UnknownAgent(String),
    Cycle { upstream: String, downstream: String },
    DuplicateEdge { upstream: String, downstream: String },
    /// The downstream node already has a producer (single-parent fan-out).
    UpstreamTaken { downstream: String, existing: String },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::DuplicateName(name) => {
                write!(f, "agent already registered: {}", name)
            }
            GraphError::UnknownAgent(name) => write!(f, "unknown agent: {}", name),
            GraphError::Cycle {
                upstream,
                downstream,
            } => write!(
                f,
                "edge {} -> {} would create a cycle",
                upstream, downstream
            ),
            GraphError::DuplicateEdge {
                upstream,
                downstream,
            } => write!(f, "edge {} -> {} already exists", upstream, downstream),
            GraphError::UpstreamTaken {
                downstream,
                existing,
            } => write!(
                f,
                "{} already has upstream producer {}",
                downstream, existing
            ),
        }
    }
}

impl Error for GraphError {}

/// One node of the agent graph: the agent instance, its downstream edges
/// (owned here, in insertion order), and a non-owning back-reference to its
/// single upstream producer.
pub struct AgentNode {
    agent: Arc<dyn CascadeAgent>,
    downstream: Vec<String>,
    upstream: Option<String>,
}

impl AgentNode {
    pub fn agent(&self) -> &Arc<dyn CascadeAgent> {
        &self.agent
    }

    pub fn name(&self) -> &str {
        self.agent.name()
    }

    pub fn domain(&self) -> &str {
        self.agent.domain()
    }

    /// Downstream agent names in insertion order.
    pub fn downstream(&self) -> &[String] {
        &self.downstream
    }

    /// Name of the upstream producer, if any.
    pub fn upstream(&self) -> Option<&str> {
        self.upstream.as_deref()
    }
}

/// Holds agent instances and the upstream -> downstream edges between them.
#[derive(Default)]
pub struct AgentRegistry {
    nodes: HashMap<String, AgentNode>,
    order: Vec<String>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Add an agent node. Names must be unique.
    pub fn register(&mut self, agent: Arc<dyn CascadeAgent>) -> Result<(), GraphError> {
        let name = agent.name().to_string();
        if self.nodes.contains_key(&name) {
            return Err(GraphError::DuplicateName(name));
        }
        log::info!("registered agent {} (domain: {})", name, agent.domain());
        self.nodes.insert(
            name.clone(),
            AgentNode {
                agent,
                downstream: Vec::new(),
                upstream: None,
            },
        );
        self.order.push(name);
        Ok(())
    }

    /// Wire `upstream -> downstream`. Rejected when either endpoint is
    /// missing, the edge already exists, the downstream node already has a
    /// producer, or the edge would create a cycle. A rejected edge leaves
    /// the graph unchanged.
    pub fn add_edge(&mut self, upstream: &str, downstream: &str) -> Result<(), GraphError> {
        if !self.nodes.contains_key(upstream) {
            return Err(GraphError::UnknownAgent(upstream.to_string()));
        }
        if !self.nodes.contains_key(downstream) {
            return Err(GraphError::UnknownAgent(downstream.to_string()));
        }
        if self.nodes[upstream].downstream.iter().any(|d| d == downstream) {
            return Err(GraphError::DuplicateEdge {
                upstream: upstream.to_string(),
                downstream: downstream.to_string(),
            });
        }
        if let Some(existing) = &self.nodes[downstream].upstream {
            return Err(GraphError::UpstreamTaken {
                downstream: downstream.to_string(),
                existing: existing.clone(),
            });
        }
        // Cycle check: if upstream is reachable from downstream, inserting
        // this edge would close a loop. Covers the self-edge case too.
        if upstream == downstream || self.reachable(downstream, upstream) {
            return Err(GraphError::Cycle {
                upstream: upstream.to_string(),
                downstream: downstream.to_string(),
            });
        }

        if let Some(node) = self.nodes.get_mut(upstream) {
            node.downstream.push(downstream.to_string());
        }
        if let Some(node) = self.nodes.get_mut(downstream) {
            node.upstream = Some(upstream.to_string());
        }
        log::info!("wired {} -> {}", upstream, downstream);
        Ok(())
    }

    fn reachable(&self, from: &str, target: &str) -> bool {
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(from);
        while let Some(current) = queue.pop_front() {
            if current == target {
                return true;
            }
            if let Some(node) = self.nodes.get(current) {
                for child in &node.downstream {
                    queue.push_back(child);
                }
            }
        }
        false
    }

    pub fn get(&self, name: &str) -> Option<&AgentNode> {
        self.nodes.get(name)
    }

    pub fn agent(&self, name: &str) -> Option<Arc<dyn CascadeAgent>> {
        self.nodes.get(name).map(|n| Arc::clone(&n.agent))
    }

    /// Registered agent names in registration order.
    pub fn agent_names(&self) -> &[String] {
        &self.order
    }

    /// The downstream agents of `name`, in insertion order. This is the
    /// canonical fan-out order for the cascade.
    pub fn children_of(&self, name: &str) -> Result<Vec<Arc<dyn CascadeAgent>>, GraphError> {
        let node = self
            .nodes
            .get(name)
            .ok_or_else(|| GraphError::UnknownAgent(name.to_string()))?;
        Ok(node
            .downstream
            .iter()
            .filter_map(|child| self.agent(child))
            .collect())
    }

    /// Downstream agent names of `name`, in insertion order.
    pub fn child_names(&self, name: &str) -> Result<Vec<String>, GraphError> {
        let node = self
            .nodes
            .get(name)
            .ok_or_else(|| GraphError::UnknownAgent(name.to_string()))?;
        Ok(node.downstream.clone())
    }

    /// Agents with no upstream producer, in registration order.
    pub fn roots(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|name| self.nodes[name.as_str()].upstream.is_none())
            .map(String::as_str)
            .collect()
    }

    /// Whether `name` exists and has no upstream producer.
    pub fn is_root(&self, name: &str) -> bool {
        self.nodes
            .get(name)
            .map(|node| node.upstream.is_none())
            .unwrap_or(false)
    }

    /// The widest fan-out of any node, used to size the cascade worker pool.
    pub fn max_fan_out(&self) -> usize {
        self.nodes
            .values()
            .map(|node| node.downstream.len())
            .max()
            .unwrap_or(0)
    }

    /// Snapshot of the edges reachable from `root`: parent name to ordered
    /// child names, one entry per parent that actually has children.
    pub fn agent_chain_from(&self, root: &str) -> BTreeMap<String, Vec<String>> {
        let mut chain = BTreeMap::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(root);
        while let Some(current) = queue.pop_front() {
            if let Some(node) = self.nodes.get(current) {
                if !node.downstream.is_empty() {
                    chain.insert(current.to_string(), node.downstream.clone());
                    for child in &node.downstream {
                        queue.push_back(child);
                    }
                }
            }
        }
        chain
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
