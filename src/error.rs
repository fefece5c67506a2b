//! Error types for dagflow.
//!
//! Every variant maps to a stable, machine-readable code so callers polling
//! an execution (or a CLI consumer parsing JSON) can branch on the failure
//! kind without matching on message text.

use std::any::Any;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for dagflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// dagflow error types.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Workflow contains circular dependencies involving: {}", .0.join(", "))]
    CyclicGraph(Vec<String>),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Workflow validation failed: {}", join_issues(.0))]
    WorkflowValidation(Vec<Error>),

    #[error("Node execution failed: {message}")]
    NodeExecution {
        message: String,
        status_code: Option<u16>,
    },

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<Error> },

    #[error("Circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error("Circuit breaker not found: {0}")]
    CircuitNotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Worker pool queue is full")]
    QueueFull,

    #[error("Worker pool is closed")]
    PoolClosed,

    #[error("Worker pool has not been started")]
    PoolNotStarted,

    #[error("Job timed out after {0:?}")]
    JobTimeout(Duration),

    #[error("Shutdown timeout exceeded after {0:?}")]
    ShutdownTimeout(Duration),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Node error: {0}")]
    Node(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_issues(issues: &[Error]) -> String {
    issues
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Error for a task that panicked.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Error::Internal(format!("task panicked: {}", panic_message(&*payload)))
    }

    /// Build a node execution error without a status code.
    pub fn node_execution(message: impl Into<String>) -> Self {
        Error::NodeExecution {
            message: message.into(),
            status_code: None,
        }
    }

    /// Get the error code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            Error::CyclicGraph(_) => "CYCLIC_GRAPH",
            Error::NodeNotFound(_) => "NODE_NOT_FOUND",
            Error::InvalidReference(_) => "INVALID_REFERENCE",
            Error::DuplicateNode(_) => "DUPLICATE_NODE",
            Error::WorkflowValidation(_) => "VALIDATION_ERROR",
            Error::NodeExecution { .. } => "NODE_EXECUTION_ERROR",
            Error::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            Error::CircuitOpen(_) => "CIRCUIT_OPEN",
            Error::CircuitNotFound(_) => "CIRCUIT_NOT_FOUND",
            Error::Timeout(_) => "TIMEOUT",
            Error::Cancelled(_) => "CANCELLED",
            Error::QueueFull => "QUEUE_FULL",
            Error::PoolClosed => "POOL_CLOSED",
            Error::PoolNotStarted => "POOL_NOT_STARTED",
            Error::JobTimeout(_) => "JOB_TIMEOUT",
            Error::ShutdownTimeout(_) => "SHUTDOWN_TIMEOUT",
            Error::ExecutionNotFound(_) => "EXECUTION_NOT_FOUND",
            Error::InvalidTransition { .. } => "INVALID_TRANSITION",
            Error::Node(_) => "NODE_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Status code attached to a node failure, if any.
    ///
    /// Looks through `RetryExhausted` to the last underlying failure.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::NodeExecution { status_code, .. } => *status_code,
            Error::RetryExhausted { last, .. } => last.status_code(),
            _ => None,
        }
    }

    /// Whether this error is a cancellation or deadline rather than a failure
    /// of the work itself.
    pub fn is_interruption(&self) -> bool {
        matches!(self, Error::Cancelled(_) | Error::Timeout(_))
    }

    /// Get a sanitized error message safe for external consumers.
    ///
    /// Hides file paths, SQL and other storage internals.
    pub fn external_message(&self) -> String {
        match self {
            Error::Storage(_) => "A storage error occurred".to_string(),
            Error::Internal(_) => "An internal error occurred".to_string(),
            Error::Database(_) => "A database error occurred".to_string(),
            Error::Io(_) => "An I/O error occurred".to_string(),
            Error::Yaml(_) => "Invalid YAML format".to_string(),
            Error::Json(_) => "Invalid JSON format".to_string(),
            other => other.to_string(),
        }
    }

    /// Convert to a JSON error payload with the sanitized message.
    pub fn to_external_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.external_message(),
            }
        })
    }

    /// Convert to a JSON error payload (includes full error details).
    ///
    /// **Warning**: only use this for internal/debug output.
    pub fn to_json(&self) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        if let Error::WorkflowValidation(issues) = self {
            payload["error"]["issues"] = issues
                .iter()
                .map(|issue| {
                    serde_json::json!({
                        "code": issue.code(),
                        "message": issue.to_string(),
                    })
                })
                .collect();
        }
        payload
    }
}

/// Text of a panic payload, when it is a string.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::QueueFull.code(), "QUEUE_FULL");
        assert_eq!(Error::CircuitOpen("node_http".into()).code(), "CIRCUIT_OPEN");
        assert_eq!(
            Error::CyclicGraph(vec!["a".into(), "b".into()]).code(),
            "CYCLIC_GRAPH"
        );
    }

    #[test]
    fn test_validation_error_lists_all_issues() {
        let err = Error::WorkflowValidation(vec![
            Error::InvalidReference("edge a -> ghost".into()),
            Error::CyclicGraph(vec!["b".into(), "c".into()]),
        ]);

        let message = err.to_string();
        assert!(message.contains("ghost"));
        assert!(message.contains("b, c"));

        let json = err.to_json();
        assert_eq!(json["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(json["error"]["issues"][0]["code"], "INVALID_REFERENCE");
        assert_eq!(json["error"]["issues"][1]["code"], "CYCLIC_GRAPH");
    }

    #[test]
    fn test_status_code_through_retry_exhausted() {
        let err = Error::RetryExhausted {
            attempts: 3,
            last: Box::new(Error::NodeExecution {
                message: "bad gateway".into(),
                status_code: Some(502),
            }),
        };
        assert_eq!(err.status_code(), Some(502));
        assert!(err.to_string().contains("bad gateway"));
    }

    #[test]
    fn test_external_message_hides_internals() {
        let err = Error::Storage("disk /var/lib/dagflow.db is locked".into());
        assert!(!err.external_message().contains("/var/lib"));
        assert_eq!(err.to_external_json()["error"]["code"], "STORAGE_ERROR");
    }

    #[test]
    fn test_panic_payloads() {
        let err = Error::from_panic(Box::new("boom"));
        assert_eq!(err.to_string(), "Internal error: task panicked: boom");

        let owned: Box<dyn Any + Send> = Box::new(format!("bad index {}", 3));
        assert_eq!(panic_message(&*owned), "bad index 3");
        assert_eq!(panic_message(&42u8), "non-string panic payload");
    }
}
