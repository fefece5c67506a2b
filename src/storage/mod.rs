//! Execution state storage.
//!
//! The engine writes every execution and node-result transition through the
//! [`Storage`] trait. Storage is authoritative after a restart; the engine's
//! in-memory map is only a cache of live executions.

mod memory;
mod models;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::MemoryStorage;
pub use models::*;
pub use sqlite::SqliteStorage;

use crate::error::Result;

/// Durable store for executions, node results and snapshots.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert a new execution. Fails if the id already exists.
    async fn create_execution(&self, execution: &Execution) -> Result<()>;

    /// Overwrite an existing execution record. Node results are stored
    /// separately and are not touched.
    async fn update_execution(&self, execution: &Execution) -> Result<()>;

    /// Load an execution with its node results.
    async fn get_execution(&self, id: &str) -> Result<Option<Execution>>;

    /// Delete an execution and everything recorded for it.
    async fn delete_execution(&self, id: &str) -> Result<bool>;

    /// Change only the status (and error). Rejects non-monotonic moves.
    async fn update_execution_status(
        &self,
        id: &str,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<()>;

    /// List executions, optionally for one workflow.
    async fn list_executions(
        &self,
        workflow_id: Option<&str>,
        filters: &ExecutionFilters,
    ) -> Result<Vec<Execution>>;

    async fn create_node_result(&self, result: &NodeResult) -> Result<()>;

    /// Overwrite a node result. Fails if it was never created.
    async fn update_node_result(&self, result: &NodeResult) -> Result<()>;

    async fn get_node_result(&self, execution_id: &str, node_id: &str)
        -> Result<Option<NodeResult>>;

    async fn list_node_results(&self, execution_id: &str) -> Result<Vec<NodeResult>>;

    async fn create_state_snapshot(&self, snapshot: &StateSnapshot) -> Result<()>;

    async fn get_latest_state_snapshot(&self, execution_id: &str) -> Result<Option<StateSnapshot>>;

    /// Snapshots for an execution, oldest first.
    async fn list_state_snapshots(&self, execution_id: &str) -> Result<Vec<StateSnapshot>>;

    /// Delete terminal executions that completed before `before`. Returns
    /// the number removed.
    async fn cleanup_old_executions(&self, before: DateTime<Utc>) -> Result<usize>;

    /// Delete orphaned node results (their execution no longer exists) that
    /// completed before `before`. Results of stored executions are kept.
    async fn cleanup_node_results(&self, before: DateTime<Utc>) -> Result<usize>;
}
