//! In-memory storage.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::models::*;
use super::Storage;
use crate::error::{Error, Result};

/// Storage held entirely in process memory. Reads return clones.
#[derive(Default)]
pub struct MemoryStorage {
    executions: RwLock<HashMap<String, Execution>>,
    node_results: RwLock<HashMap<String, BTreeMap<String, NodeResult>>>,
    snapshots: RwLock<HashMap<String, Vec<StateSnapshot>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_execution(&self, execution: &Execution) -> Result<()> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(&execution.id) {
            return Err(Error::Storage(format!(
                "execution {} already exists",
                execution.id
            )));
        }
        let mut record = execution.clone();
        record.node_results.clear();
        executions.insert(record.id.clone(), record);
        Ok(())
    }

    async fn update_execution(&self, execution: &Execution) -> Result<()> {
        let mut executions = self.executions.write().await;
        let Some(existing) = executions.get_mut(&execution.id) else {
            return Err(Error::ExecutionNotFound(execution.id.clone()));
        };
        let mut record = execution.clone();
        record.node_results.clear();
        *existing = record;
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        let Some(mut execution) = self.executions.read().await.get(id).cloned() else {
            return Ok(None);
        };
        if let Some(results) = self.node_results.read().await.get(id) {
            execution.node_results = results.clone();
        }
        Ok(Some(execution))
    }

    async fn delete_execution(&self, id: &str) -> Result<bool> {
        let removed = self.executions.write().await.remove(id).is_some();
        self.node_results.write().await.remove(id);
        self.snapshots.write().await.remove(id);
        Ok(removed)
    }

    async fn update_execution_status(
        &self,
        id: &str,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(id)
            .ok_or_else(|| Error::ExecutionNotFound(id.to_string()))?;
        execution.transition(status)?;
        if let Some(error) = error {
            execution.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn list_executions(
        &self,
        workflow_id: Option<&str>,
        filters: &ExecutionFilters,
    ) -> Result<Vec<Execution>> {
        let mut matching: Vec<Execution> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| workflow_id.map_or(true, |id| e.workflow_id == id))
            .filter(|e| filters.matches(e))
            .cloned()
            .collect();

        matching.sort_by(|a, b| {
            filters
                .sort_key(a)
                .cmp(&filters.sort_key(b))
                .then_with(|| a.id.cmp(&b.id))
        });
        if filters.descending {
            matching.reverse();
        }

        let page: Vec<Execution> = matching
            .into_iter()
            .skip(filters.offset)
            .take(filters.effective_limit())
            .collect();

        let node_results = self.node_results.read().await;
        Ok(page
            .into_iter()
            .map(|mut execution| {
                if let Some(results) = node_results.get(&execution.id) {
                    execution.node_results = results.clone();
                }
                execution
            })
            .collect())
    }

    async fn create_node_result(&self, result: &NodeResult) -> Result<()> {
        self.node_results
            .write()
            .await
            .entry(result.execution_id.clone())
            .or_default()
            .insert(result.node_id.clone(), result.clone());
        Ok(())
    }

    async fn update_node_result(&self, result: &NodeResult) -> Result<()> {
        let mut node_results = self.node_results.write().await;
        let existing = node_results
            .get_mut(&result.execution_id)
            .and_then(|results| results.get_mut(&result.node_id))
            .ok_or_else(|| {
                Error::Storage(format!(
                    "node result {}/{} not found",
                    result.execution_id, result.node_id
                ))
            })?;
        *existing = result.clone();
        Ok(())
    }

    async fn get_node_result(
        &self,
        execution_id: &str,
        node_id: &str,
    ) -> Result<Option<NodeResult>> {
        Ok(self
            .node_results
            .read()
            .await
            .get(execution_id)
            .and_then(|results| results.get(node_id))
            .cloned())
    }

    async fn list_node_results(&self, execution_id: &str) -> Result<Vec<NodeResult>> {
        Ok(self
            .node_results
            .read()
            .await
            .get(execution_id)
            .map(|results| results.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_state_snapshot(&self, snapshot: &StateSnapshot) -> Result<()> {
        self.snapshots
            .write()
            .await
            .entry(snapshot.execution_id.clone())
            .or_default()
            .push(snapshot.clone());
        Ok(())
    }

    async fn get_latest_state_snapshot(&self, execution_id: &str) -> Result<Option<StateSnapshot>> {
        Ok(self
            .snapshots
            .read()
            .await
            .get(execution_id)
            .and_then(|snapshots| snapshots.last())
            .cloned())
    }

    async fn list_state_snapshots(&self, execution_id: &str) -> Result<Vec<StateSnapshot>> {
        Ok(self
            .snapshots
            .read()
            .await
            .get(execution_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn cleanup_old_executions(&self, before: DateTime<Utc>) -> Result<usize> {
        let expired: Vec<String> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| e.status.is_terminal() && e.completed_at.is_some_and(|t| t < before))
            .map(|e| e.id.clone())
            .collect();

        for id in &expired {
            self.delete_execution(id).await?;
        }
        Ok(expired.len())
    }

    async fn cleanup_node_results(&self, before: DateTime<Utc>) -> Result<usize> {
        let executions = self.executions.read().await;
        let mut node_results = self.node_results.write().await;
        let mut removed = 0;
        for (execution_id, results) in node_results.iter_mut() {
            if executions.contains_key(execution_id) {
                continue;
            }
            let start = results.len();
            results.retain(|_, r| !r.completed_at.is_some_and(|t| t < before));
            removed += start - results.len();
        }
        node_results.retain(|_, results| !results.is_empty());
        Ok(removed)
    }
}
