//! Execution state models.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::workflow::Workflow;

/// Default query limit.
pub const DEFAULT_QUERY_LIMIT: usize = 50;
/// Maximum query limit.
pub const MAX_QUERY_LIMIT: usize = 1000;

/// Execution status.
///
/// `pending -> running -> {success | failed | cancelled | timeout}`. An
/// execution that never starts may go straight from pending to a terminal
/// failure state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    /// Whether moving from `self` to `next` keeps the status monotonic.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        match self {
            Self::Pending => matches!(
                next,
                Self::Running | Self::Failed | Self::Cancelled | Self::Timeout
            ),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timeout" => Ok(Self::Timeout),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

/// Node status within an execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown node status: {}", s)),
        }
    }
}

/// One attempt inside a node's retry sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAttempt {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Latest state of one node in an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub execution_id: String,
    pub node_id: String,
    pub node_type: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_time_ms: u64,
    /// Number of the latest attempt (1-based, 0 if never run)
    #[serde(default)]
    pub attempt_number: u32,
    #[serde(default)]
    pub attempts: Vec<NodeAttempt>,
}

impl NodeResult {
    /// A pending result for a node that has not been dispatched.
    pub fn new(execution_id: &str, node_id: &str, node_type: &str) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            node_id: node_id.to_string(),
            node_type: node_type.to_string(),
            status: NodeStatus::Pending,
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
            execution_time_ms: 0,
            attempt_number: 0,
            attempts: Vec::new(),
        }
    }

    /// A terminal result for a node that never ran.
    pub fn unrun(
        execution_id: &str,
        node_id: &str,
        node_type: &str,
        status: NodeStatus,
        reason: impl Into<String>,
    ) -> Self {
        let mut result = Self::new(execution_id, node_id, node_type);
        result.status = status;
        result.error = Some(reason.into());
        result.completed_at = Some(Utc::now());
        result
    }
}

/// Node counts for an execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub total_nodes: usize,
    pub completed_nodes: usize,
    pub failed_nodes: usize,
    pub running_nodes: usize,
    pub skipped_nodes: usize,
    pub cancelled_nodes: usize,
    pub completion_percent: f64,
}

impl ExecutionProgress {
    /// Tally node results against the workflow's node count.
    pub fn compute<'a>(total_nodes: usize, results: impl IntoIterator<Item = &'a NodeResult>) -> Self {
        let mut progress = Self {
            total_nodes,
            ..Self::default()
        };
        for result in results {
            match result.status {
                NodeStatus::Success => progress.completed_nodes += 1,
                NodeStatus::Failed => progress.failed_nodes += 1,
                NodeStatus::Running => progress.running_nodes += 1,
                NodeStatus::Skipped => progress.skipped_nodes += 1,
                NodeStatus::Cancelled => progress.cancelled_nodes += 1,
                NodeStatus::Pending => {}
            }
        }

        let done = progress.completed_nodes
            + progress.failed_nodes
            + progress.skipped_nodes
            + progress.cancelled_nodes;
        progress.completion_percent = if total_nodes == 0 {
            100.0
        } else {
            (done as f64 * 100.0 / total_nodes as f64).min(100.0)
        };
        progress
    }
}

/// Execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub variables: Value,
    #[serde(default)]
    pub node_results: BTreeMap<String, NodeResult>,
    #[serde(default)]
    pub error: Option<String>,
    pub triggered_by: String,
    #[serde(default)]
    pub trigger_params: Value,
    #[serde(default)]
    pub progress: ExecutionProgress,
    #[serde(default)]
    pub metadata: Value,
}

impl Execution {
    /// A fresh pending execution of `workflow`.
    pub fn new(workflow: &Workflow, trigger_params: Value, triggered_by: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow.id.clone(),
            workflow_name: workflow.name.clone(),
            status: ExecutionStatus::Pending,
            started_at: now,
            completed_at: None,
            updated_at: now,
            variables: Value::Object(Default::default()),
            node_results: BTreeMap::new(),
            error: None,
            triggered_by: triggered_by.to_string(),
            trigger_params,
            progress: ExecutionProgress::compute(workflow.nodes.len(), []),
            metadata: Value::Object(Default::default()),
        }
    }

    /// Move to `next`, stamping `updated_at` and, for terminal states,
    /// `completed_at`.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Recompute progress from the current node results.
    pub fn refresh_progress(&mut self) {
        self.progress = ExecutionProgress::compute(
            self.progress.total_nodes,
            self.node_results.values(),
        );
    }

    /// Wall-clock duration, if finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|end| end - self.started_at)
    }
}

/// Point-in-time copy of an execution for recovery and inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub id: String,
    pub execution_id: String,
    pub created_at: DateTime<Utc>,
    pub state: ExecutionStatus,
    pub node_results: BTreeMap<String, NodeResult>,
    pub progress: ExecutionProgress,
    /// Scheduler position, e.g. the ids of finished nodes
    pub checkpoint: Value,
    #[serde(default)]
    pub metadata: Value,
    /// Serialized size of `node_results` in bytes
    pub size: usize,
}

impl StateSnapshot {
    pub fn capture(execution: &Execution, checkpoint: Value) -> Self {
        let size = serde_json::to_vec(&execution.node_results)
            .map(|bytes| bytes.len())
            .unwrap_or(0);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution.id.clone(),
            created_at: Utc::now(),
            state: execution.status,
            node_results: execution.node_results.clone(),
            progress: execution.progress.clone(),
            checkpoint,
            metadata: Value::Object(Default::default()),
            size,
        }
    }
}

/// Sort key for execution listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderBy {
    #[default]
    StartedAt,
    UpdatedAt,
    CompletedAt,
}

impl OrderBy {
    pub(crate) fn column(self) -> &'static str {
        match self {
            Self::StartedAt => "started_at",
            Self::UpdatedAt => "updated_at",
            Self::CompletedAt => "completed_at",
        }
    }
}

/// Filters for execution listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionFilters {
    /// Empty means any status
    pub statuses: Vec<ExecutionStatus>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
    pub order_by: OrderBy,
    pub descending: bool,
}

impl Default for ExecutionFilters {
    fn default() -> Self {
        Self {
            statuses: Vec::new(),
            started_after: None,
            started_before: None,
            limit: DEFAULT_QUERY_LIMIT,
            offset: 0,
            order_by: OrderBy::StartedAt,
            descending: true,
        }
    }
}

impl ExecutionFilters {
    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Limit after applying the default and the cap.
    pub fn effective_limit(&self) -> usize {
        if self.limit == 0 {
            DEFAULT_QUERY_LIMIT
        } else {
            self.limit.min(MAX_QUERY_LIMIT)
        }
    }

    pub(crate) fn matches(&self, execution: &Execution) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&execution.status))
            && self
                .started_after
                .map_or(true, |after| execution.started_at >= after)
            && self
                .started_before
                .map_or(true, |before| execution.started_at <= before)
    }

    pub(crate) fn sort_key(&self, execution: &Execution) -> Option<DateTime<Utc>> {
        match self.order_by {
            OrderBy::StartedAt => Some(execution.started_at),
            OrderBy::UpdatedAt => Some(execution.updated_at),
            OrderBy::CompletedAt => execution.completed_at,
        }
    }
}
