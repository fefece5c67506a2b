//! Workflow type definitions.
//!
//! These are plain data. The engine takes a frozen copy of a [`Workflow`]
//! when an execution starts and never mutates it afterwards.

use serde::{Deserialize, Serialize};

/// A complete workflow definition.
///
/// # Example YAML
///
/// ```yaml
/// id: wf-orders
/// name: order-pipeline
///
/// nodes:
///   - id: fetch
///     type: delay
///     config:
///       milliseconds: 10
///
///   - id: tag
///     type: set
///     config:
///       fields:
///         - name: processed
///           value: true
///     dependencies: [fetch]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique workflow identifier
    #[serde(default)]
    pub id: String,

    /// Human-readable name
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Nodes (steps) in the workflow
    #[serde(default)]
    pub nodes: Vec<Node>,

    /// Explicit connections between nodes
    #[serde(default)]
    pub edges: Vec<Edge>,

    /// Global workflow settings
    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl Workflow {
    /// Create an empty workflow.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
            settings: WorkflowSettings::default(),
        }
    }

    /// Append a node.
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Append an edge `source -> target`.
    pub fn with_edge(mut self, source: &str, target: &str) -> Self {
        self.edges.push(Edge::new(source, target));
        self
    }

    /// Set the failure policy.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.settings.failure_policy = Some(policy);
        self
    }

    /// Look up a node by ID.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// A node (step) in the workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique node ID within this workflow
    pub id: String,

    /// Node type, resolved against the node registry at execution time
    #[serde(rename = "type")]
    pub node_type: String,

    #[serde(default)]
    pub name: String,

    /// Node-specific configuration
    #[serde(default)]
    pub config: serde_json::Value,

    /// Nodes that must finish before this one runs
    #[serde(default, alias = "depends_on")]
    pub dependencies: Vec<String>,

    /// Dependencies whose outputs are passed as input.
    /// Empty means every dependency.
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Declared output names (informational)
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Named retry strategy. Falls back to the workflow setting, then "default".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_strategy: Option<String>,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            node_type: node_type.into(),
            config: serde_json::Value::Null,
            dependencies: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            retry_strategy: None,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.dependencies
            .extend(deps.iter().map(|d| d.to_string()));
        self
    }

    pub fn with_retry_strategy(mut self, name: impl Into<String>) -> Self {
        self.retry_strategy = Some(name.into());
        self
    }
}

/// Directed connection `source -> target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(alias = "source")]
    pub source_node_id: String,

    #[serde(alias = "target")]
    pub target_node_id: String,

    /// Output port on the source node (informational)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,

    /// Condition label. Carried through but not evaluated by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_node_id: source.into(),
            target_node_id: target.into(),
            port: None,
            condition: None,
        }
    }
}

/// What happens to the rest of an execution when a node fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// First failure cancels every in-flight node and fails the execution
    #[default]
    FailFast,
    /// Independent branches keep running; dependents of the failure are skipped
    Continue,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FailFast => write!(f, "fail_fast"),
            Self::Continue => write!(f, "continue"),
        }
    }
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail_fast" | "fail-fast" => Ok(Self::FailFast),
            "continue" => Ok(Self::Continue),
            _ => Err(format!("Unknown failure policy: {}", s)),
        }
    }
}

/// Global workflow settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Whole-execution deadline in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    /// Unset means the engine's configured policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,

    /// Retry strategy name for nodes that don't pick their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_strategy: Option<String>,
}
