//! Delay node - pause for a duration, honoring cancellation.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::types::{ExecutionResult, NodeContext, NodeExecutor, NodeInput};
use crate::error::{Error, Result};

/// Longest delay a single node may request.
const MAX_DELAY_MS: u64 = 60 * 60 * 1000;

#[derive(Debug, Default, Deserialize)]
struct DelayConfig {
    /// Duration in seconds (can be fractional, e.g. 0.5 for 500ms)
    #[serde(default)]
    seconds: Option<f64>,

    #[serde(default)]
    milliseconds: Option<u64>,
}

/// Delay node that pauses execution.
#[derive(Debug, Clone)]
pub struct DelayNode {
    duration: Duration,
}

impl DelayNode {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    /// Build from node config (`seconds` and/or `milliseconds`).
    pub fn from_config(config: &Value) -> Result<Self> {
        let config: DelayConfig = if config.is_null() {
            DelayConfig::default()
        } else {
            serde_json::from_value(config.clone())
                .map_err(|e| Error::Node(format!("Invalid delay config: {}", e)))?
        };

        let mut total_ms: u64 = 0;
        if let Some(seconds) = config.seconds {
            if seconds < 0.0 {
                return Err(Error::Node("Delay duration cannot be negative".to_string()));
            }
            total_ms += (seconds * 1000.0) as u64;
        }
        if let Some(ms) = config.milliseconds {
            total_ms += ms;
        }

        if total_ms > MAX_DELAY_MS {
            return Err(Error::Node(format!(
                "Delay of {}ms exceeds maximum of {}ms",
                total_ms, MAX_DELAY_MS
            )));
        }

        Ok(Self::new(Duration::from_millis(total_ms)))
    }
}

#[async_trait]
impl NodeExecutor for DelayNode {
    fn description(&self) -> &str {
        "Pause execution for a fixed duration"
    }

    async fn execute(&self, ctx: &NodeContext, _input: &NodeInput) -> Result<ExecutionResult> {
        debug!(
            execution_id = %ctx.execution_id,
            node_id = %ctx.node_id,
            delay_ms = self.duration.as_millis() as u64,
            "Delay node pausing"
        );

        tokio::select! {
            _ = tokio::time::sleep(self.duration) => {}
            _ = ctx.cancellation.cancelled() => {
                return Err(Error::Cancelled(format!("delay node '{}' interrupted", ctx.node_id)));
            }
        }

        Ok(ExecutionResult::success(json!({
            "waited_ms": self.duration.as_millis() as u64,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_combines_fields() {
        let node = DelayNode::from_config(&json!({"seconds": 0.5, "milliseconds": 20})).unwrap();
        assert_eq!(node.duration, Duration::from_millis(520));
    }

    #[test]
    fn test_null_config_means_no_wait() {
        let node = DelayNode::from_config(&Value::Null).unwrap();
        assert_eq!(node.duration, Duration::ZERO);
    }

    #[test]
    fn test_rejects_negative_and_excessive() {
        assert!(DelayNode::from_config(&json!({"seconds": -1.0})).is_err());
        assert!(DelayNode::from_config(&json!({"seconds": 7200.0})).is_err());
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_delay() {
        let node = DelayNode::new(Duration::from_secs(30));
        let ctx = NodeContext::new("exec", "wait");
        ctx.cancellation.cancel();

        let result = node.execute(&ctx, &NodeInput::new()).await;
        assert!(matches!(result, Err(Error::Cancelled(_))));
    }
}
