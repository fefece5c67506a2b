//! Set node - add or update fields in the node input.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::types::{ExecutionResult, NodeContext, NodeExecutor, NodeInput};
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct SetConfig {
    fields: Vec<SetField>,
}

#[derive(Debug, Clone, Deserialize)]
struct SetField {
    /// Dotted path, e.g. `order.status`
    name: String,
    value: Value,
}

/// Set node implementation.
#[derive(Debug)]
pub struct SetNode {
    fields: Vec<SetField>,
}

impl SetNode {
    pub fn from_config(config: &Value) -> Result<Self> {
        let config: SetConfig = serde_json::from_value(config.clone())
            .map_err(|e| Error::Node(format!("Invalid set config: {}", e)))?;

        if config.fields.is_empty() {
            return Err(Error::Node(
                "Set node requires at least one field assignment".to_string(),
            ));
        }
        if config.fields.iter().any(|f| f.name.trim().is_empty()) {
            return Err(Error::Node(
                "Set node field name cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            fields: config.fields,
        })
    }
}

#[async_trait]
impl NodeExecutor for SetNode {
    fn description(&self) -> &str {
        "Set or update fields in object data"
    }

    async fn execute(&self, _ctx: &NodeContext, input: &NodeInput) -> Result<ExecutionResult> {
        let mut output = input.clone();
        // The node's own config is merged into its input; keep it out of the output.
        output.remove("fields");

        for assignment in &self.fields {
            set_path_value(&mut output, &assignment.name, assignment.value.clone());
        }

        Ok(ExecutionResult::success(Value::Object(output)))
    }
}

fn set_path_value(target: &mut Map<String, Value>, path: &str, value: Value) {
    let mut parts = path.split('.').peekable();
    let mut current = target;

    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part.to_string(), value);
            return;
        }

        let slot = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = match slot {
            Value::Object(map) => map,
            _ => return,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_sets_nested_fields() {
        let node = SetNode::from_config(&json!({
            "fields": [
                {"name": "status", "value": "done"},
                {"name": "meta.source", "value": "dagflow"}
            ]
        }))
        .unwrap();

        let mut input = NodeInput::new();
        input.insert("id".into(), json!(7));
        input.insert("meta".into(), json!("overwritten"));

        let result = node
            .execute(&NodeContext::new("exec", "set"), &input)
            .await
            .unwrap();
        assert_eq!(
            result.data,
            json!({"id": 7, "status": "done", "meta": {"source": "dagflow"}})
        );
    }

    #[test]
    fn test_requires_fields() {
        assert!(SetNode::from_config(&json!({"fields": []})).is_err());
        assert!(SetNode::from_config(&json!({"fields": [{"name": " ", "value": 1}]})).is_err());
        assert!(SetNode::from_config(&Value::Null).is_err());
    }
}
