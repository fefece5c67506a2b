//! Node registry - maps node type names to constructors.
//!
//! Registration is static: node types are compiled in and registered at
//! startup, before any workflow runs.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use super::types::NodeExecutor;
use super::{DelayNode, LoggerNode, SetNode};
use crate::error::Result;

/// Builds a node executor from the node's `config`.
pub type NodeConstructor = Arc<dyn Fn(&Value) -> Result<Arc<dyn NodeExecutor>> + Send + Sync>;

/// Registry of available node types.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    constructors: HashMap<String, NodeConstructor>,
}

impl NodeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in node types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_node_type("delay", |config| {
            Ok(Arc::new(DelayNode::from_config(config)?) as Arc<dyn NodeExecutor>)
        });
        registry.register_node_type("logger", |config| {
            Ok(Arc::new(LoggerNode::from_config(config)?) as Arc<dyn NodeExecutor>)
        });
        registry.register_node_type("set", |config| {
            Ok(Arc::new(SetNode::from_config(config)?) as Arc<dyn NodeExecutor>)
        });
        registry
    }

    /// Register a constructor for a node type. Re-registering replaces.
    pub fn register_node_type<F>(&mut self, node_type: &str, constructor: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn NodeExecutor>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(node_type.to_string(), Arc::new(constructor));
    }

    /// Register a single shared executor instance for a node type.
    pub fn register(&mut self, node_type: &str, executor: Arc<dyn NodeExecutor>) {
        self.register_node_type(node_type, move |_| Ok(executor.clone()));
    }

    /// Build an executor for a node. `None` if the type is unregistered.
    pub fn create(&self, node_type: &str, config: &Value) -> Option<Result<Arc<dyn NodeExecutor>>> {
        self.constructors
            .get(node_type)
            .map(|constructor| constructor(config))
    }

    /// Check if a node type is registered.
    pub fn has(&self, node_type: &str) -> bool {
        self.constructors.contains_key(node_type)
    }

    /// List all registered node types, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.constructors.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::nodes::{ExecutionResult, NodeContext, NodeInput};
    use async_trait::async_trait;

    struct Constant(&'static str);

    #[async_trait]
    impl NodeExecutor for Constant {
        async fn execute(&self, _ctx: &NodeContext, _input: &NodeInput) -> Result<ExecutionResult> {
            Ok(ExecutionResult::success(Value::String(self.0.to_string())))
        }
    }

    #[test]
    fn test_builtins_registered() {
        let registry = NodeRegistry::with_builtins();
        assert_eq!(registry.list(), vec!["delay", "logger", "set"]);
        assert!(registry.has("delay"));
        assert!(!registry.has("http_request"));
    }

    #[tokio::test]
    async fn test_reregistering_replaces() {
        let mut registry = NodeRegistry::new();
        registry.register("constant", Arc::new(Constant("first")));
        registry.register("constant", Arc::new(Constant("second")));

        let node = registry.create("constant", &Value::Null).unwrap().unwrap();
        let ctx = NodeContext::new("exec", "n1");
        let result = node.execute(&ctx, &NodeInput::new()).await.unwrap();
        assert_eq!(result.data, Value::String("second".into()));
    }

    #[test]
    fn test_constructor_errors_surface() {
        let mut registry = NodeRegistry::new();
        registry.register_node_type("picky", |_| Err(Error::Node("bad config".into())));

        assert!(registry.create("missing", &Value::Null).is_none());
        assert!(matches!(
            registry.create("picky", &Value::Null),
            Some(Err(Error::Node(_)))
        ));
    }
}
