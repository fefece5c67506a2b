//! SQLite storage implementation.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::Mutex;

use super::models::*;
use super::Storage;
use crate::error::{Error, Result};

/// Parse an RFC 3339 datetime string into a `chrono::DateTime<Utc>`.
///
/// Returns a `rusqlite::Error` on parse failure instead of panicking,
/// so it is safe to use inside `query_row` / `query_map` closures.
fn parse_datetime_utc(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_optional_datetime(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_datetime_utc).transpose()
}

/// Fixed-width timestamps so text comparison matches time order.
fn format_ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_json_text<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn from_json_text<T: serde::de::DeserializeOwned + Default>(s: &str) -> T {
    serde_json::from_str(s).unwrap_or_default()
}

const EXECUTION_COLUMNS: &str = "id, workflow_id, workflow_name, status, started_at, completed_at, updated_at,
     variables, error, triggered_by, trigger_params, progress, metadata";

const NODE_RESULT_COLUMNS: &str = "execution_id, node_id, node_type, status, output, error, started_at,
     completed_at, execution_time_ms, attempt_number, attempts";

const SNAPSHOT_COLUMNS: &str =
    "id, execution_id, created_at, state, node_results, progress, checkpoint, metadata, size";

/// SQLite-based storage.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut conn = Connection::open(path)?;

        // Initialize schema synchronously before wrapping in async mutex
        Self::init_schema_sync(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        Self::init_schema_sync(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema_sync(conn: &mut Connection) -> Result<()> {
        // WAL mode must be set before any transaction begins
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                workflow_name TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                updated_at TEXT NOT NULL,
                variables TEXT NOT NULL,
                error TEXT,
                triggered_by TEXT NOT NULL,
                trigger_params TEXT NOT NULL,
                progress TEXT NOT NULL,
                metadata TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS node_results (
                execution_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                node_type TEXT NOT NULL,
                status TEXT NOT NULL,
                output TEXT,
                error TEXT,
                started_at TEXT,
                completed_at TEXT,
                execution_time_ms INTEGER NOT NULL DEFAULT 0,
                attempt_number INTEGER NOT NULL DEFAULT 0,
                attempts TEXT NOT NULL,
                PRIMARY KEY (execution_id, node_id),
                FOREIGN KEY (execution_id) REFERENCES executions(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS state_snapshots (
                id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                state TEXT NOT NULL,
                node_results TEXT NOT NULL,
                progress TEXT NOT NULL,
                checkpoint TEXT NOT NULL,
                metadata TEXT NOT NULL,
                size INTEGER NOT NULL,
                FOREIGN KEY (execution_id) REFERENCES executions(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_executions_workflow ON executions(workflow_id, started_at);
            CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
            CREATE INDEX IF NOT EXISTS idx_node_results_completed ON node_results(completed_at);
            CREATE INDEX IF NOT EXISTS idx_snapshots_execution ON state_snapshots(execution_id, created_at);
            "#,
        )?;
        Ok(())
    }

    fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<Execution> {
        let status_str: String = row.get(3)?;
        let status = status_str.parse().unwrap_or(ExecutionStatus::Failed);

        Ok(Execution {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            workflow_name: row.get(2)?,
            status,
            started_at: parse_datetime_utc(&row.get::<_, String>(4)?)?,
            completed_at: parse_optional_datetime(row.get(5)?)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(6)?)?,
            variables: from_json_text(&row.get::<_, String>(7)?),
            node_results: Default::default(),
            error: row.get(8)?,
            triggered_by: row.get(9)?,
            trigger_params: from_json_text(&row.get::<_, String>(10)?),
            progress: from_json_text(&row.get::<_, String>(11)?),
            metadata: from_json_text(&row.get::<_, String>(12)?),
        })
    }

    fn row_to_node_result(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeResult> {
        let status_str: String = row.get(3)?;
        let output: Option<String> = row.get(4)?;

        Ok(NodeResult {
            execution_id: row.get(0)?,
            node_id: row.get(1)?,
            node_type: row.get(2)?,
            status: status_str.parse().unwrap_or(NodeStatus::Failed),
            output: output.and_then(|s| serde_json::from_str::<Value>(&s).ok()),
            error: row.get(5)?,
            started_at: parse_optional_datetime(row.get(6)?)?,
            completed_at: parse_optional_datetime(row.get(7)?)?,
            execution_time_ms: row.get::<_, i64>(8)?.max(0) as u64,
            attempt_number: row.get(9)?,
            attempts: from_json_text(&row.get::<_, String>(10)?),
        })
    }

    fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<StateSnapshot> {
        let state: String = row.get(3)?;

        Ok(StateSnapshot {
            id: row.get(0)?,
            execution_id: row.get(1)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(2)?)?,
            state: state.parse().unwrap_or(ExecutionStatus::Failed),
            node_results: from_json_text(&row.get::<_, String>(4)?),
            progress: from_json_text(&row.get::<_, String>(5)?),
            checkpoint: from_json_text(&row.get::<_, String>(6)?),
            metadata: from_json_text(&row.get::<_, String>(7)?),
            size: row.get::<_, i64>(8)?.max(0) as usize,
        })
    }

    fn load_node_results(conn: &Connection, execution_id: &str) -> Result<Vec<NodeResult>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM node_results WHERE execution_id = ?1 ORDER BY node_id",
            NODE_RESULT_COLUMNS
        ))?;
        let results = stmt
            .query_map([execution_id], Self::row_to_node_result)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(results)
    }

    fn attach_node_results(conn: &Connection, execution: &mut Execution) -> Result<()> {
        execution.node_results = Self::load_node_results(conn, &execution.id)?
            .into_iter()
            .map(|r| (r.node_id.clone(), r))
            .collect();
        Ok(())
    }

    fn node_result_params(result: &NodeResult) -> [SqlValue; 11] {
        [
            SqlValue::Text(result.execution_id.clone()),
            SqlValue::Text(result.node_id.clone()),
            SqlValue::Text(result.node_type.clone()),
            SqlValue::Text(result.status.to_string()),
            result
                .output
                .as_ref()
                .map_or(SqlValue::Null, |o| SqlValue::Text(to_json_text(o))),
            result
                .error
                .clone()
                .map_or(SqlValue::Null, SqlValue::Text),
            result
                .started_at
                .map_or(SqlValue::Null, |t| SqlValue::Text(format_ts(&t))),
            result
                .completed_at
                .map_or(SqlValue::Null, |t| SqlValue::Text(format_ts(&t))),
            SqlValue::Integer(result.execution_time_ms.min(i64::MAX as u64) as i64),
            SqlValue::Integer(i64::from(result.attempt_number)),
            SqlValue::Text(to_json_text(&result.attempts)),
        ]
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn create_execution(&self, execution: &Execution) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO executions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                EXECUTION_COLUMNS
            ),
            params![
                execution.id,
                execution.workflow_id,
                execution.workflow_name,
                execution.status.to_string(),
                format_ts(&execution.started_at),
                execution.completed_at.as_ref().map(format_ts),
                format_ts(&execution.updated_at),
                to_json_text(&execution.variables),
                execution.error,
                execution.triggered_by,
                to_json_text(&execution.trigger_params),
                to_json_text(&execution.progress),
                to_json_text(&execution.metadata),
            ],
        )?;
        Ok(())
    }

    async fn update_execution(&self, execution: &Execution) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE executions SET
                workflow_id = ?2,
                workflow_name = ?3,
                status = ?4,
                started_at = ?5,
                completed_at = ?6,
                updated_at = ?7,
                variables = ?8,
                error = ?9,
                triggered_by = ?10,
                trigger_params = ?11,
                progress = ?12,
                metadata = ?13
             WHERE id = ?1",
            params![
                execution.id,
                execution.workflow_id,
                execution.workflow_name,
                execution.status.to_string(),
                format_ts(&execution.started_at),
                execution.completed_at.as_ref().map(format_ts),
                format_ts(&execution.updated_at),
                to_json_text(&execution.variables),
                execution.error,
                execution.triggered_by,
                to_json_text(&execution.trigger_params),
                to_json_text(&execution.progress),
                to_json_text(&execution.metadata),
            ],
        )?;
        if changed == 0 {
            return Err(Error::ExecutionNotFound(execution.id.clone()));
        }
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        let conn = self.conn.lock().await;
        let execution = conn
            .query_row(
                &format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS),
                [id],
                Self::row_to_execution,
            )
            .optional()?;

        let Some(mut execution) = execution else {
            return Ok(None);
        };
        Self::attach_node_results(&conn, &mut execution)?;
        Ok(Some(execution))
    }

    async fn delete_execution(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM executions WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    async fn update_execution_status(
        &self,
        id: &str,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let mut execution = conn
            .query_row(
                &format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS),
                [id],
                Self::row_to_execution,
            )
            .optional()?
            .ok_or_else(|| Error::ExecutionNotFound(id.to_string()))?;

        execution.transition(status)?;
        conn.execute(
            "UPDATE executions SET status = ?2, updated_at = ?3, completed_at = ?4,
                error = COALESCE(?5, error)
             WHERE id = ?1",
            params![
                id,
                execution.status.to_string(),
                format_ts(&execution.updated_at),
                execution.completed_at.as_ref().map(format_ts),
                error,
            ],
        )?;
        Ok(())
    }

    async fn list_executions(
        &self,
        workflow_id: Option<&str>,
        filters: &ExecutionFilters,
    ) -> Result<Vec<Execution>> {
        let conn = self.conn.lock().await;

        let mut sql = format!("SELECT {} FROM executions WHERE 1=1", EXECUTION_COLUMNS);
        let mut bind: Vec<SqlValue> = Vec::new();

        if let Some(workflow_id) = workflow_id {
            sql.push_str(" AND workflow_id = ?");
            bind.push(SqlValue::Text(workflow_id.to_string()));
        }

        if !filters.statuses.is_empty() {
            let placeholders = vec!["?"; filters.statuses.len()].join(", ");
            sql.push_str(&format!(" AND status IN ({})", placeholders));
            bind.extend(
                filters
                    .statuses
                    .iter()
                    .map(|s| SqlValue::Text(s.to_string())),
            );
        }

        if let Some(started_after) = &filters.started_after {
            sql.push_str(" AND started_at >= ?");
            bind.push(SqlValue::Text(format_ts(started_after)));
        }

        if let Some(started_before) = &filters.started_before {
            sql.push_str(" AND started_at <= ?");
            bind.push(SqlValue::Text(format_ts(started_before)));
        }

        let direction = if filters.descending { "DESC" } else { "ASC" };
        sql.push_str(&format!(
            " ORDER BY {col} {dir}, id {dir} LIMIT ? OFFSET ?",
            col = filters.order_by.column(),
            dir = direction
        ));
        bind.push(SqlValue::Integer(filters.effective_limit() as i64));
        bind.push(SqlValue::Integer(filters.offset as i64));

        let mut stmt = conn.prepare(&sql)?;
        let mut executions = stmt
            .query_map(params_from_iter(bind.iter()), Self::row_to_execution)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for execution in &mut executions {
            Self::attach_node_results(&conn, execution)?;
        }
        Ok(executions)
    }

    async fn create_node_result(&self, result: &NodeResult) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO node_results ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(execution_id, node_id) DO UPDATE SET
                    node_type = excluded.node_type,
                    status = excluded.status,
                    output = excluded.output,
                    error = excluded.error,
                    started_at = excluded.started_at,
                    completed_at = excluded.completed_at,
                    execution_time_ms = excluded.execution_time_ms,
                    attempt_number = excluded.attempt_number,
                    attempts = excluded.attempts",
                NODE_RESULT_COLUMNS
            ),
            params_from_iter(Self::node_result_params(result)),
        )?;
        Ok(())
    }

    async fn update_node_result(&self, result: &NodeResult) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE node_results SET
                node_type = ?3,
                status = ?4,
                output = ?5,
                error = ?6,
                started_at = ?7,
                completed_at = ?8,
                execution_time_ms = ?9,
                attempt_number = ?10,
                attempts = ?11
             WHERE execution_id = ?1 AND node_id = ?2",
            params_from_iter(Self::node_result_params(result)),
        )?;
        if changed == 0 {
            return Err(Error::Storage(format!(
                "node result {}/{} not found",
                result.execution_id, result.node_id
            )));
        }
        Ok(())
    }

    async fn get_node_result(
        &self,
        execution_id: &str,
        node_id: &str,
    ) -> Result<Option<NodeResult>> {
        let conn = self.conn.lock().await;
        let result = conn
            .query_row(
                &format!(
                    "SELECT {} FROM node_results WHERE execution_id = ?1 AND node_id = ?2",
                    NODE_RESULT_COLUMNS
                ),
                [execution_id, node_id],
                Self::row_to_node_result,
            )
            .optional()?;
        Ok(result)
    }

    async fn list_node_results(&self, execution_id: &str) -> Result<Vec<NodeResult>> {
        let conn = self.conn.lock().await;
        Self::load_node_results(&conn, execution_id)
    }

    async fn create_state_snapshot(&self, snapshot: &StateSnapshot) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO state_snapshots ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                SNAPSHOT_COLUMNS
            ),
            params![
                snapshot.id,
                snapshot.execution_id,
                format_ts(&snapshot.created_at),
                snapshot.state.to_string(),
                to_json_text(&snapshot.node_results),
                to_json_text(&snapshot.progress),
                to_json_text(&snapshot.checkpoint),
                to_json_text(&snapshot.metadata),
                snapshot.size as i64,
            ],
        )?;
        Ok(())
    }

    async fn get_latest_state_snapshot(&self, execution_id: &str) -> Result<Option<StateSnapshot>> {
        let conn = self.conn.lock().await;
        let snapshot = conn
            .query_row(
                &format!(
                    "SELECT {} FROM state_snapshots WHERE execution_id = ?1
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                    SNAPSHOT_COLUMNS
                ),
                [execution_id],
                Self::row_to_snapshot,
            )
            .optional()?;
        Ok(snapshot)
    }

    async fn list_state_snapshots(&self, execution_id: &str) -> Result<Vec<StateSnapshot>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM state_snapshots WHERE execution_id = ?1 ORDER BY created_at, rowid",
            SNAPSHOT_COLUMNS
        ))?;
        let snapshots = stmt
            .query_map([execution_id], Self::row_to_snapshot)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(snapshots)
    }

    async fn cleanup_old_executions(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM executions
             WHERE status IN ('success', 'failed', 'cancelled', 'timeout')
               AND completed_at IS NOT NULL
               AND completed_at < ?1",
            [format_ts(&before)],
        )?;
        Ok(deleted)
    }

    async fn cleanup_node_results(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM node_results
             WHERE completed_at IS NOT NULL AND completed_at < ?1
               AND execution_id NOT IN (SELECT id FROM executions)",
            [format_ts(&before)],
        )?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Workflow;
    use serde_json::json;

    fn execution(workflow_id: &str) -> Execution {
        Execution::new(
            &Workflow::new(workflow_id, format!("{} name", workflow_id)),
            json!({"user": "ada"}),
            "test",
        )
    }

    #[tokio::test]
    async fn test_execution_crud() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let mut exec = execution("wf-1");
        storage.create_execution(&exec).await.unwrap();
        assert!(storage.create_execution(&exec).await.is_err());

        exec.transition(ExecutionStatus::Running).unwrap();
        exec.transition(ExecutionStatus::Failed).unwrap();
        exec.error = Some("node b failed".into());
        storage.update_execution(&exec).await.unwrap();

        let loaded = storage.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Failed);
        assert_eq!(loaded.workflow_name, "wf-1 name");
        assert_eq!(loaded.trigger_params, json!({"user": "ada"}));
        assert_eq!(loaded.error.as_deref(), Some("node b failed"));
        assert!(loaded.completed_at.is_some());

        assert!(storage.delete_execution(&exec.id).await.unwrap());
        assert!(!storage.delete_execution(&exec.id).await.unwrap());
        assert!(storage.get_execution(&exec.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_unknown_execution_fails() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let err = storage.update_execution(&execution("wf")).await.unwrap_err();
        assert!(matches!(err, Error::ExecutionNotFound(_)));
    }

    #[tokio::test]
    async fn test_node_results_attach_to_execution() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let exec = execution("wf");
        storage.create_execution(&exec).await.unwrap();

        let mut result = NodeResult::new(&exec.id, "fetch", "delay");
        result.status = NodeStatus::Running;
        result.started_at = Some(Utc::now());
        storage.create_node_result(&result).await.unwrap();

        result.status = NodeStatus::Success;
        result.output = Some(json!({"waited_ms": 5}));
        result.attempt_number = 2;
        result.attempts = vec![NodeAttempt {
            attempt: 1,
            started_at: Utc::now(),
            completed_at: Utc::now(),
            error: Some("timeout".into()),
        }];
        storage.update_node_result(&result).await.unwrap();

        let loaded = storage.get_execution(&exec.id).await.unwrap().unwrap();
        let fetch = &loaded.node_results["fetch"];
        assert_eq!(fetch.status, NodeStatus::Success);
        assert_eq!(fetch.output, Some(json!({"waited_ms": 5})));
        assert_eq!(fetch.attempt_number, 2);
        assert_eq!(fetch.attempts.len(), 1);
        assert_eq!(fetch.attempts[0].error.as_deref(), Some("timeout"));

        let missing = NodeResult::new(&exec.id, "ghost", "delay");
        assert!(storage.update_node_result(&missing).await.is_err());
        assert!(storage
            .get_node_result(&exec.id, "ghost")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_status_update_rejects_leaving_terminal_state() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let exec = execution("wf");
        storage.create_execution(&exec).await.unwrap();

        storage
            .update_execution_status(&exec.id, ExecutionStatus::Running, None)
            .await
            .unwrap();
        storage
            .update_execution_status(&exec.id, ExecutionStatus::Cancelled, Some("stopped"))
            .await
            .unwrap();
        let err = storage
            .update_execution_status(&exec.id, ExecutionStatus::Success, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");

        let loaded = storage.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Cancelled);
        assert_eq!(loaded.error.as_deref(), Some("stopped"));
    }

    #[tokio::test]
    async fn test_list_executions_filters() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let base = Utc::now();
        for i in 0..6 {
            let mut exec = execution(if i < 4 { "alpha" } else { "beta" });
            exec.started_at = base + chrono::Duration::seconds(i);
            if i == 1 {
                exec.transition(ExecutionStatus::Timeout).unwrap();
            }
            storage.create_execution(&exec).await.unwrap();
        }

        let alpha = storage
            .list_executions(Some("alpha"), &ExecutionFilters::default())
            .await
            .unwrap();
        assert_eq!(alpha.len(), 4);
        assert!(alpha.windows(2).all(|w| w[0].started_at >= w[1].started_at));

        let timeouts = storage
            .list_executions(
                None,
                &ExecutionFilters::default().with_status(ExecutionStatus::Timeout),
            )
            .await
            .unwrap();
        assert_eq!(timeouts.len(), 1);

        let recent = storage
            .list_executions(
                None,
                &ExecutionFilters {
                    started_after: Some(base + chrono::Duration::seconds(3)),
                    ..ExecutionFilters::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(recent.len(), 3);

        let page = storage
            .list_executions(None, &ExecutionFilters::default().with_limit(2))
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
    }

    #[tokio::test]
    async fn test_snapshots() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let mut exec = execution("wf");
        storage.create_execution(&exec).await.unwrap();
        assert!(storage
            .get_latest_state_snapshot(&exec.id)
            .await
            .unwrap()
            .is_none());

        exec.node_results
            .insert("a".into(), NodeResult::new(&exec.id, "a", "set"));
        storage
            .create_state_snapshot(&StateSnapshot::capture(&exec, json!({"executed": []})))
            .await
            .unwrap();
        exec.transition(ExecutionStatus::Running).unwrap();
        storage
            .create_state_snapshot(&StateSnapshot::capture(&exec, json!({"executed": ["a"]})))
            .await
            .unwrap();

        let latest = storage
            .get_latest_state_snapshot(&exec.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.state, ExecutionStatus::Running);
        assert_eq!(latest.checkpoint, json!({"executed": ["a"]}));
        assert_eq!(latest.node_results.len(), 1);

        let all = storage.list_state_snapshots(&exec.id).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].state, ExecutionStatus::Pending);
    }

    #[tokio::test]
    async fn test_cleanup_cascades() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let mut done = execution("wf");
        done.transition(ExecutionStatus::Running).unwrap();
        done.transition(ExecutionStatus::Success).unwrap();
        let pending = execution("wf");
        storage.create_execution(&done).await.unwrap();
        storage.create_execution(&pending).await.unwrap();

        let mut result = NodeResult::new(&done.id, "a", "set");
        result.completed_at = Some(Utc::now());
        storage.create_node_result(&result).await.unwrap();
        storage
            .create_state_snapshot(&StateSnapshot::capture(&done, json!(null)))
            .await
            .unwrap();

        let removed = storage
            .cleanup_old_executions(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(storage.get_execution(&pending.id).await.unwrap().is_some());
        assert!(storage.list_node_results(&done.id).await.unwrap().is_empty());
        assert!(storage.list_state_snapshots(&done.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_node_results_keeps_stored_executions() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let running = execution("wf");
        storage.create_execution(&running).await.unwrap();

        let mut early = NodeResult::new(&running.id, "a", "set");
        early.status = NodeStatus::Success;
        early.completed_at = Some(Utc::now() - chrono::Duration::hours(1));
        storage.create_node_result(&early).await.unwrap();

        let removed = storage.cleanup_node_results(Utc::now()).await.unwrap();
        assert_eq!(removed, 0);
        assert_eq!(storage.list_node_results(&running.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_backed_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dagflow.db");
        let exec = execution("wf");

        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.create_execution(&exec).await.unwrap();
        }

        let reopened = SqliteStorage::open(&path).unwrap();
        let loaded = reopened.get_execution(&exec.id).await.unwrap();
        assert!(loaded.is_some());
    }
}
