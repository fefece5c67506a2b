//! Node executor trait and context types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Input handed to a node: trigger params, upstream outputs and node config
/// merged into one object.
pub type NodeInput = Map<String, Value>;

/// Outcome reported by a node executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Result of one node invocation.
///
/// Executors report failures either by returning `Err` or by returning a
/// result with [`ResultStatus::Error`]; the [`Executor`](crate::engine::Executor)
/// folds both into this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ResultStatus,
    /// Output data from the node
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Protocol status code (e.g. HTTP) for retry matching
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionResult {
    /// Create a successful result.
    pub fn success(data: Value) -> Self {
        Self {
            status: ResultStatus::Success,
            data,
            error: None,
            status_code: None,
            timestamp: Utc::now(),
        }
    }

    /// Create an error-status result.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Error,
            data: Value::Null,
            error: Some(message.into()),
            status_code: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_status_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    /// Turn an error-status result into [`Error::NodeExecution`].
    pub fn into_result(self) -> Result<Self> {
        match self.status {
            ResultStatus::Success => Ok(self),
            ResultStatus::Error => Err(Error::NodeExecution {
                message: self
                    .error
                    .unwrap_or_else(|| "node reported an error".to_string()),
                status_code: self.status_code,
            }),
        }
    }
}

/// Context passed to a node during execution.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub node_id: String,
    pub node_type: String,

    /// 1-based attempt number within the current retry sequence
    pub attempt: u32,

    /// Cancelled when the execution is cancelled, times out or fails fast
    pub cancellation: CancellationToken,
}

impl NodeContext {
    /// Create a new context.
    pub fn new(execution_id: &str, node_id: &str) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            workflow_id: String::new(),
            node_id: node_id.to_string(),
            node_type: String::new(),
            attempt: 1,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_workflow(mut self, workflow_id: &str) -> Self {
        self.workflow_id = workflow_id.to_string();
        self
    }

    pub fn with_node_type(mut self, node_type: &str) -> Self {
        self.node_type = node_type.to_string();
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Copy of this context for a given attempt.
    pub fn for_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Trait that all node types implement.
///
/// Implementations may be retried, so they should be idempotent or tolerate
/// at-least-once execution, and they should return promptly once
/// `ctx.cancellation` fires.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Execute the node with its prepared input.
    async fn execute(&self, ctx: &NodeContext, input: &NodeInput) -> Result<ExecutionResult>;

    /// Get a description of this node type.
    fn description(&self) -> &str {
        "A workflow node"
    }
}
