//! Node invocation.
//!
//! The executor resolves a node type to its registered constructor and runs
//! the resulting [`NodeExecutor`]. Every outcome, including an unknown type
//! or a raised error, comes back as an [`ExecutionResult`] so the retry and
//! circuit-breaker layers only ever inspect result objects.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{panic_message, Result};
use crate::metrics;
use crate::nodes::{ExecutionResult, NodeContext, NodeExecutor, NodeInput, NodeRegistry};

/// Maps node types to executors and invokes them.
pub struct Executor {
    registry: RwLock<NodeRegistry>,
}

impl Executor {
    /// Create an executor over a registry.
    pub fn new(registry: NodeRegistry) -> Self {
        Self {
            registry: RwLock::new(registry),
        }
    }

    /// Register a constructor for a node type. Re-registering replaces.
    pub fn register_node_type<F>(&self, node_type: &str, constructor: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn NodeExecutor>> + Send + Sync + 'static,
    {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register_node_type(node_type, constructor);
    }

    /// Register a shared executor instance for a node type.
    pub fn register(&self, node_type: &str, executor: Arc<dyn NodeExecutor>) {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(node_type, executor);
    }

    pub fn has_node_type(&self, node_type: &str) -> bool {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .has(node_type)
    }

    /// Registered node types, sorted.
    pub fn node_types(&self) -> Vec<String> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .list()
            .into_iter()
            .map(String::from)
            .collect()
    }

    /// Run one node attempt.
    ///
    /// Never fails: unknown types, constructor errors and executor errors
    /// all become error-status results.
    pub async fn execute_node(
        &self,
        ctx: &NodeContext,
        node_type: &str,
        config: &Value,
        input: &NodeInput,
    ) -> ExecutionResult {
        let created = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .create(node_type, config);

        let node = match created {
            Some(Ok(node)) => node,
            Some(Err(e)) => {
                return ExecutionResult::error(format!(
                    "failed to create node of type {}: {}",
                    node_type, e
                ));
            }
            None => {
                return ExecutionResult::error(format!(
                    "node type {} not registered",
                    node_type
                ));
            }
        };

        let start = Instant::now();
        let result = match AssertUnwindSafe(node.execute(ctx, input)).catch_unwind().await {
            Ok(Ok(result)) => result,
            Err(payload) => {
                let message = panic_message(&*payload);
                warn!(
                    execution_id = %ctx.execution_id,
                    node_id = %ctx.node_id,
                    node_type = %node_type,
                    panic = %message,
                    "Node executor panicked"
                );
                ExecutionResult::error(format!("node {} panicked: {}", node_type, message))
            }
            Ok(Err(e)) => {
                let mut result = ExecutionResult::error(e.to_string());
                result.status_code = e.status_code();
                result
            }
        };

        let elapsed = start.elapsed();
        metrics::record_node_execution(node_type, &result.status.to_string());
        metrics::record_node_duration(elapsed, node_type);
        debug!(
            execution_id = %ctx.execution_id,
            node_id = %ctx.node_id,
            node_type = %node_type,
            attempt = ctx.attempt,
            status = %result.status,
            duration_ms = elapsed.as_millis() as u64,
            "Node attempt finished"
        );

        result
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(NodeRegistry::with_builtins())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::nodes::ResultStatus;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl NodeExecutor for Echo {
        async fn execute(&self, _ctx: &NodeContext, input: &NodeInput) -> Result<ExecutionResult> {
            Ok(ExecutionResult::success(Value::Object(input.clone())))
        }
    }

    struct Broken;

    #[async_trait]
    impl NodeExecutor for Broken {
        async fn execute(&self, _ctx: &NodeContext, _input: &NodeInput) -> Result<ExecutionResult> {
            Err(Error::NodeExecution {
                message: "service unavailable".to_string(),
                status_code: Some(503),
            })
        }
    }

    struct Panicky;

    #[async_trait]
    impl NodeExecutor for Panicky {
        async fn execute(&self, _ctx: &NodeContext, _input: &NodeInput) -> Result<ExecutionResult> {
            panic!("index out of range");
        }
    }

    fn ctx() -> NodeContext {
        NodeContext::new("exec-1", "n1")
    }

    #[tokio::test]
    async fn test_unregistered_type_is_error_result() {
        let executor = Executor::new(NodeRegistry::new());
        let result = executor
            .execute_node(&ctx(), "teleport", &Value::Null, &NodeInput::new())
            .await;

        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(
            result.error.as_deref(),
            Some("node type teleport not registered")
        );
    }

    #[tokio::test]
    async fn test_raised_error_becomes_error_result() {
        let executor = Executor::new(NodeRegistry::new());
        executor.register("broken", Arc::new(Broken));

        let result = executor
            .execute_node(&ctx(), "broken", &Value::Null, &NodeInput::new())
            .await;
        assert_eq!(result.status, ResultStatus::Error);
        assert!(result.error.unwrap().contains("service unavailable"));
        assert_eq!(result.status_code, Some(503));
    }

    #[tokio::test]
    async fn test_panic_becomes_error_result() {
        let executor = Executor::new(NodeRegistry::new());
        executor.register("panicky", Arc::new(Panicky));

        let result = executor
            .execute_node(&ctx(), "panicky", &Value::Null, &NodeInput::new())
            .await;
        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(
            result.error.as_deref(),
            Some("node panicky panicked: index out of range")
        );
    }

    #[tokio::test]
    async fn test_successful_execution() {
        let executor = Executor::new(NodeRegistry::new());
        executor.register("echo", Arc::new(Echo));

        let mut input = NodeInput::new();
        input.insert("x".into(), json!(1));
        let result = executor
            .execute_node(&ctx(), "echo", &Value::Null, &input)
            .await;

        assert!(result.is_success());
        assert_eq!(result.data, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_constructor_failure_is_error_result() {
        let executor = Executor::default();
        let result = executor
            .execute_node(&ctx(), "set", &json!({"fields": []}), &NodeInput::new())
            .await;

        assert_eq!(result.status, ResultStatus::Error);
        assert!(result.error.unwrap().contains("failed to create node"));
    }

    #[test]
    fn test_default_has_builtins() {
        let executor = Executor::default();
        assert_eq!(executor.node_types(), vec!["delay", "logger", "set"]);
    }
}
