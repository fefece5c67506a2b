//! Logger node - emit a tracing event and pass the input through.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::types::{ExecutionResult, NodeContext, NodeExecutor, NodeInput};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
}

#[derive(Debug, Default, Deserialize)]
struct LoggerConfig {
    #[serde(default)]
    message: Option<String>,

    #[serde(default)]
    level: LogLevel,

    /// Whether to include the full input in the event
    #[serde(default)]
    log_input: bool,
}

/// Logger node for inspecting data flowing through a workflow.
#[derive(Debug)]
pub struct LoggerNode {
    message: String,
    level: LogLevel,
    log_input: bool,
}

impl LoggerNode {
    pub fn from_config(config: &Value) -> Result<Self> {
        let config: LoggerConfig = if config.is_null() {
            LoggerConfig::default()
        } else {
            serde_json::from_value(config.clone())
                .map_err(|e| Error::Node(format!("Invalid logger config: {}", e)))?
        };

        Ok(Self {
            message: config.message.unwrap_or_else(|| "logger node".to_string()),
            level: config.level,
            log_input: config.log_input,
        })
    }
}

#[async_trait]
impl NodeExecutor for LoggerNode {
    fn description(&self) -> &str {
        "Log a message and pass input through unchanged"
    }

    async fn execute(&self, ctx: &NodeContext, input: &NodeInput) -> Result<ExecutionResult> {
        let payload = if self.log_input {
            Value::Object(input.clone()).to_string()
        } else {
            String::new()
        };

        match self.level {
            LogLevel::Debug => debug!(
                execution_id = %ctx.execution_id,
                node_id = %ctx.node_id,
                input = %payload,
                "{}",
                self.message
            ),
            LogLevel::Info => info!(
                execution_id = %ctx.execution_id,
                node_id = %ctx.node_id,
                input = %payload,
                "{}",
                self.message
            ),
            LogLevel::Warn => warn!(
                execution_id = %ctx.execution_id,
                node_id = %ctx.node_id,
                input = %payload,
                "{}",
                self.message
            ),
        }

        Ok(ExecutionResult::success(Value::Object(input.clone())))
    }
}
