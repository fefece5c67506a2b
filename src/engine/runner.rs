//! Workflow runner.
//!
//! [`Engine::execute_workflow`] records a pending execution and returns its
//! id at once; the run itself happens on a spawned task. Each run has a
//! scheduler that exclusively owns readiness state: it submits ready nodes
//! to the shared [`WorkerPool`] and receives their outcomes over a channel,
//! so no scheduling state is shared with the workers.
//!
//! A dispatched node runs as
//! circuit breaker (`node_<type>`) -> retry loop -> [`Executor::execute_node`].
//!
//! Status flow: `pending -> running -> {success | failed | cancelled | timeout}`.
//! A workflow that fails validation goes `pending -> failed` without running.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::circuit_breaker::CircuitBreakerManager;
use super::executor::Executor;
use super::pool::{Job, PoolStats, WorkerPool};
use super::retry::{RetryManager, RetryStrategy, DEFAULT_STRATEGY};
use crate::config::{Config, EngineConfig};
use crate::error::{Error, Result};
use crate::metrics;
use crate::nodes::{NodeContext, NodeExecutor, NodeInput};
use crate::storage::{
    Execution, ExecutionFilters, ExecutionStatus, MemoryStorage, NodeAttempt, NodeResult,
    NodeStatus, SqliteStorage, StateSnapshot, Storage,
};
use crate::workflow::{DependencyResolver, FailurePolicy, Node, Workflow};

/// Per-call execution options.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Whole-execution deadline; overrides workflow and engine settings
    pub timeout: Option<Duration>,
    pub triggered_by: String,
    /// Cancelling this token cancels the execution
    pub cancellation: Option<CancellationToken>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            triggered_by: "api".to_string(),
            cancellation: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Failed,
    Cancelled,
    Timeout,
}

/// Control handle for a live run.
struct RunHandle {
    token: CancellationToken,
    reason: Mutex<Option<StopReason>>,
    done: watch::Receiver<bool>,
}

impl RunHandle {
    fn request_stop(&self, reason: StopReason) {
        {
            let mut current = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            current.get_or_insert(reason);
        }
        self.token.cancel();
    }

    fn reason(&self) -> Option<StopReason> {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct EngineInner {
    executor: Executor,
    retry: RetryManager,
    breakers: CircuitBreakerManager,
    storage: Arc<dyn Storage>,
    pool: WorkerPool,
    executions: RwLock<HashMap<String, Execution>>,
    runs: Mutex<HashMap<String, Arc<RunHandle>>>,
    config: EngineConfig,
    shutdown: CancellationToken,
}

/// Workflow execution engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Engine with default configuration over `storage`.
    ///
    /// Starts the worker pool, so it must be called inside a tokio runtime.
    pub fn new(storage: Arc<dyn Storage>) -> Result<Self> {
        Self::from_config(&Config::default(), storage)
    }

    /// Engine built from configuration, with the built-in node types.
    pub fn from_config(config: &Config, storage: Arc<dyn Storage>) -> Result<Self> {
        Self::with_components(
            config.engine.clone(),
            Executor::default(),
            RetryManager::with_default(config.retry.strategy()),
            CircuitBreakerManager::with_configs(
                config.circuit_breaker.default_config(),
                config.circuit_breaker.node_type_config(),
            ),
            storage,
        )
    }

    /// Open the configured storage (SQLite if a path is set, memory
    /// otherwise) and build an engine over it.
    pub fn open(config: &Config) -> Result<Self> {
        let storage: Arc<dyn Storage> = match &config.storage.database_path {
            Some(path) => Arc::new(SqliteStorage::open(path)?),
            None => Arc::new(MemoryStorage::new()),
        };
        Self::from_config(config, storage)
    }

    pub fn with_components(
        config: EngineConfig,
        executor: Executor,
        retry: RetryManager,
        breakers: CircuitBreakerManager,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        let pool = WorkerPool::new(config.pool_config());
        pool.start()?;

        Ok(Self {
            inner: Arc::new(EngineInner {
                executor,
                retry,
                breakers,
                storage,
                pool,
                executions: RwLock::new(HashMap::new()),
                runs: Mutex::new(HashMap::new()),
                config,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    pub fn retry_manager(&self) -> &RetryManager {
        &self.inner.retry
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerManager {
        &self.inner.breakers
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        self.inner.storage.clone()
    }

    /// Register a node type constructor.
    pub fn register_node_type<F>(&self, node_type: &str, constructor: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn NodeExecutor>> + Send + Sync + 'static,
    {
        self.inner.executor.register_node_type(node_type, constructor);
    }

    /// Register (or replace) a named retry strategy.
    pub fn register_retry_strategy(&self, name: &str, strategy: RetryStrategy) {
        self.inner.retry.add_strategy(name, strategy);
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    fn runs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<RunHandle>>> {
        self.inner.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a run and return its execution id.
    pub async fn execute_workflow(&self, workflow: &Workflow, trigger_params: Value) -> Result<String> {
        self.execute_workflow_with_options(workflow, trigger_params, ExecuteOptions::default())
            .await
    }

    /// Start a run with a whole-execution deadline.
    pub async fn execute_workflow_with_timeout(
        &self,
        workflow: &Workflow,
        trigger_params: Value,
        timeout: Duration,
    ) -> Result<String> {
        let options = ExecuteOptions {
            timeout: Some(timeout),
            ..ExecuteOptions::default()
        };
        self.execute_workflow_with_options(workflow, trigger_params, options)
            .await
    }

    /// Start a run. Returns once the pending execution is stored.
    pub async fn execute_workflow_with_options(
        &self,
        workflow: &Workflow,
        trigger_params: Value,
        options: ExecuteOptions,
    ) -> Result<String> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::PoolClosed);
        }

        let workflow = Arc::new(workflow.clone());
        let execution = Execution::new(&workflow, trigger_params, &options.triggered_by);
        let execution_id = execution.id.clone();

        self.inner.storage.create_execution(&execution).await?;
        self.inner
            .executions
            .write()
            .await
            .insert(execution_id.clone(), execution);

        let token = options
            .cancellation
            .map(|parent| parent.child_token())
            .unwrap_or_default();
        let timeout = options
            .timeout
            .or(workflow.settings.timeout_seconds.map(Duration::from_secs))
            .or(self.inner.config.execution_timeout());

        let (done_tx, done_rx) = watch::channel(false);
        let handle = Arc::new(RunHandle {
            token,
            reason: Mutex::new(None),
            done: done_rx,
        });
        self.runs().insert(execution_id.clone(), handle.clone());
        metrics::inc_active_executions();

        info!(
            execution_id = %execution_id,
            workflow_id = %workflow.id,
            nodes = workflow.nodes.len(),
            "Execution accepted"
        );

        let engine = self.clone();
        let id = execution_id.clone();
        tokio::spawn(async move {
            engine.run_execution(workflow, id.clone(), timeout, handle).await;
            engine.runs().remove(&id);
            metrics::dec_active_executions();
            let _ = done_tx.send(true);
        });

        Ok(execution_id)
    }

    /// Current state of an execution, from the live cache or storage.
    pub async fn get_execution(&self, execution_id: &str) -> Result<Execution> {
        if let Some(execution) = self.inner.executions.read().await.get(execution_id) {
            return Ok(execution.clone());
        }
        self.inner
            .storage
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| Error::ExecutionNotFound(execution_id.to_string()))
    }

    /// Request cancellation. A no-op for executions that already finished.
    pub fn cancel_execution(&self, execution_id: &str) -> bool {
        let handle = self.runs().get(execution_id).cloned();
        match handle {
            Some(handle) => {
                info!(execution_id, "Cancellation requested");
                handle.request_stop(StopReason::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Wait until an execution reaches a terminal state.
    pub async fn wait_for_execution(&self, execution_id: &str) -> Result<Execution> {
        let handle = self.runs().get(execution_id).cloned();
        if let Some(handle) = handle {
            let mut done = handle.done.clone();
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        }
        self.get_execution(execution_id).await
    }

    /// Executions from storage, newest first by default.
    pub async fn list_executions(
        &self,
        workflow_id: Option<&str>,
        filters: &ExecutionFilters,
    ) -> Result<Vec<Execution>> {
        self.inner.storage.list_executions(workflow_id, filters).await
    }

    /// Delete finished executions older than `older_than`. Their node
    /// results and snapshots go with them; live executions are untouched.
    pub async fn cleanup_old_executions(&self, older_than: Duration) -> Result<usize> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| Error::Config(format!("invalid retention period: {}", e)))?;
        let before = Utc::now() - age;

        let removed = self.inner.storage.cleanup_old_executions(before).await?;
        self.inner.executions.write().await.retain(|_, e| {
            !(e.status.is_terminal() && e.completed_at.is_some_and(|t| t < before))
        });

        info!(removed, "Cleaned up old executions");
        Ok(removed)
    }

    /// Cancel live runs, wait for them, then stop the worker pool.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        self.inner.shutdown.cancel();

        let handles: Vec<Arc<RunHandle>> = self.runs().values().cloned().collect();
        info!(live = handles.len(), "Shutting down engine");
        for handle in &handles {
            handle.request_stop(StopReason::Cancelled);
        }

        let wait_all = futures::future::join_all(handles.iter().map(|handle| {
            let mut done = handle.done.clone();
            async move {
                while !*done.borrow_and_update() {
                    if done.changed().await.is_err() {
                        break;
                    }
                }
            }
        }));
        if tokio::time::timeout(timeout, wait_all).await.is_err() {
            warn!("Executions still running at shutdown deadline");
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        self.inner.pool.shutdown(remaining).await
    }

    // ------------------------------------------------------------------
    // Execution state
    // ------------------------------------------------------------------

    /// Mutate the cached execution under the lock and return a copy.
    async fn update_cached<F>(&self, execution_id: &str, f: F) -> Option<Execution>
    where
        F: FnOnce(&mut Execution) -> Result<()>,
    {
        let mut executions = self.inner.executions.write().await;
        let execution = executions.get_mut(execution_id)?;
        if let Err(e) = f(execution) {
            warn!(execution_id, error = %e, "Rejected execution update");
        }
        Some(execution.clone())
    }

    async fn persist_execution(&self, execution: &Execution) -> bool {
        match self.inner.storage.update_execution(execution).await {
            Ok(()) => true,
            Err(e) => {
                warn!(execution_id = %execution.id, error = %e, "Failed to persist execution");
                false
            }
        }
    }

    /// Persist a terminal execution and drop it from the live cache. Storage
    /// serves it from then on; a failed write keeps the cached copy.
    async fn retire_execution(&self, execution: &Execution) {
        if self.persist_execution(execution).await {
            self.inner.executions.write().await.remove(&execution.id);
        }
    }

    async fn store_node_result(&self, result: &NodeResult, created: bool) {
        let updated = self
            .update_cached(&result.execution_id, |execution| {
                execution
                    .node_results
                    .insert(result.node_id.clone(), result.clone());
                execution.refresh_progress();
                execution.updated_at = Utc::now();
                Ok(())
            })
            .await;

        let write = if created {
            self.inner.storage.create_node_result(result).await
        } else {
            self.inner.storage.update_node_result(result).await
        };
        if let Err(e) = write {
            warn!(
                execution_id = %result.execution_id,
                node_id = %result.node_id,
                error = %e,
                "Failed to persist node result"
            );
        }
        if let Some(execution) = updated {
            self.persist_execution(&execution).await;
        }
    }

    // ------------------------------------------------------------------
    // Running
    // ------------------------------------------------------------------

    #[instrument(skip_all, fields(execution_id = %execution_id, workflow_id = %workflow.id))]
    async fn run_execution(
        &self,
        workflow: Arc<Workflow>,
        execution_id: String,
        timeout: Option<Duration>,
        handle: Arc<RunHandle>,
    ) {
        let started = Instant::now();
        let resolver = DependencyResolver::from_workflow(&workflow);

        let order = match resolver
            .validate_workflow()
            .and_then(|()| resolver.resolve_execution_order())
        {
            Ok(order) => order,
            Err(e) => {
                warn!(error = %e, "Workflow validation failed");
                let details = e.to_json()["error"].clone();
                if let Some(execution) = self
                    .update_cached(&execution_id, |execution| {
                        execution.error = Some(e.to_string());
                        execution.metadata["validation"] = details;
                        execution.transition(ExecutionStatus::Failed)
                    })
                    .await
                {
                    self.retire_execution(&execution).await;
                }
                metrics::record_workflow_execution(&ExecutionStatus::Failed.to_string());
                return;
            }
        };

        let Some(execution) = self
            .update_cached(&execution_id, |execution| {
                execution.transition(ExecutionStatus::Running)
            })
            .await
        else {
            return;
        };
        self.persist_execution(&execution).await;
        info!(nodes = order.len(), "Execution running");

        let policy = workflow
            .settings
            .failure_policy
            .unwrap_or(self.inner.config.failure_policy);
        let (scheduler, outcomes) = Scheduler::new(
            self.clone(),
            workflow,
            resolver,
            order,
            &execution,
            handle,
            policy,
            timeout,
        );
        let (status, error) = scheduler.run(outcomes).await;

        let Some(execution) = self
            .update_cached(&execution_id, |execution| {
                execution.refresh_progress();
                execution.error = error.clone();
                execution.transition(status)
            })
            .await
        else {
            return;
        };
        let snapshot = StateSnapshot::capture(&execution, json!({ "final": true }));
        if let Err(e) = self.inner.storage.create_state_snapshot(&snapshot).await {
            warn!(error = %e, "Failed to write final snapshot");
        }
        self.retire_execution(&execution).await;

        let elapsed = started.elapsed();
        metrics::record_workflow_execution(&status.to_string());
        metrics::record_workflow_duration(elapsed);
        match &error {
            Some(error) => info!(
                status = %status,
                duration_ms = elapsed.as_millis() as u64,
                error = %error,
                "Execution finished"
            ),
            None => info!(
                status = %status,
                duration_ms = elapsed.as_millis() as u64,
                "Execution finished"
            ),
        }
    }

    /// One node: breaker around retries around single attempts.
    async fn run_node(
        &self,
        ctx: &NodeContext,
        config: &Value,
        input: &NodeInput,
        strategy: &RetryStrategy,
        attempts: &Mutex<Vec<NodeAttempt>>,
    ) -> Result<Value> {
        let inner = &self.inner;
        let node_type = ctx.node_type.as_str();

        inner
            .breakers
            .execute_for_node_type(node_type, move || {
                inner
                    .retry
                    .execute_with_retry(strategy, node_type, &ctx.cancellation, move |attempt| {
                        let attempt_ctx = ctx.for_attempt(attempt);
                        async move {
                            let started_at = Utc::now();
                            let result = inner
                                .executor
                                .execute_node(&attempt_ctx, node_type, config, input)
                                .await
                                .into_result();
                            attempts
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .push(NodeAttempt {
                                    attempt,
                                    started_at,
                                    completed_at: Utc::now(),
                                    error: result.as_ref().err().map(|e| e.to_string()),
                                });
                            result.map(|r| r.data)
                        }
                    })
            })
            .await
    }
}

/// Build a node's input: trigger params, then `input_from_<dep>` outputs,
/// then the node's own config. Later layers win on key clashes.
fn prepare_input(
    node: &Node,
    trigger_params: &Value,
    dependencies: &[String],
    outputs: &HashMap<String, Value>,
) -> NodeInput {
    let mut input = NodeInput::new();

    if let Value::Object(params) = trigger_params {
        input.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    let sources = if node.inputs.is_empty() {
        dependencies
    } else {
        node.inputs.as_slice()
    };
    for source in sources {
        if let Some(output) = outputs.get(source) {
            input.insert(format!("input_from_{}", source), output.clone());
        }
    }

    if let Value::Object(config) = &node.config {
        input.extend(config.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    input
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct NodeOutcome {
    node_id: String,
    result: Result<Value>,
    attempts: Vec<NodeAttempt>,
}

/// Owns the readiness state of one run.
struct Scheduler {
    engine: Engine,
    workflow: Arc<Workflow>,
    resolver: DependencyResolver,
    order: Vec<String>,
    execution_id: String,
    trigger_params: Value,
    handle: Arc<RunHandle>,
    policy: FailurePolicy,
    timeout: Option<Duration>,
    deadline: Option<tokio::time::Instant>,
    tx: mpsc::UnboundedSender<NodeOutcome>,

    succeeded: HashSet<String>,
    failed: Vec<String>,
    finished: HashSet<String>,
    in_flight: HashMap<String, NodeResult>,
    outputs: HashMap<String, Value>,

    stop_reason: Option<StopReason>,
    grace_deadline: Option<tokio::time::Instant>,
    first_error: Option<String>,
    backpressure: bool,
    since_snapshot: usize,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    fn new(
        engine: Engine,
        workflow: Arc<Workflow>,
        resolver: DependencyResolver,
        order: Vec<String>,
        execution: &Execution,
        handle: Arc<RunHandle>,
        policy: FailurePolicy,
        timeout: Option<Duration>,
    ) -> (Self, mpsc::UnboundedReceiver<NodeOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            engine,
            workflow,
            resolver,
            order,
            execution_id: execution.id.clone(),
            trigger_params: execution.trigger_params.clone(),
            handle,
            policy,
            timeout,
            deadline: timeout.map(|t| tokio::time::Instant::now() + t),
            tx,
            succeeded: HashSet::new(),
            failed: Vec::new(),
            finished: HashSet::new(),
            in_flight: HashMap::new(),
            outputs: HashMap::new(),
            stop_reason: None,
            grace_deadline: None,
            first_error: None,
            backpressure: false,
            since_snapshot: 0,
        };
        (scheduler, rx)
    }

    /// Drive the run to a terminal state. Returns the final status and error.
    async fn run(
        mut self,
        mut outcomes: mpsc::UnboundedReceiver<NodeOutcome>,
    ) -> (ExecutionStatus, Option<String>) {
        let token = self.handle.token.clone();
        let dispatch_retry = self.engine.inner.config.dispatch_retry();

        loop {
            if self.stop_reason.is_none() && token.is_cancelled() {
                self.stop(self.handle.reason().unwrap_or(StopReason::Cancelled));
            }
            if self.stop_reason.is_none() {
                self.dispatch_ready().await;
            }
            if self.in_flight.is_empty() && (self.stop_reason.is_some() || !self.backpressure) {
                break;
            }

            let stopping = self.stop_reason.is_some();
            let backpressure = self.backpressure;
            let deadline = self.deadline;
            let grace_deadline = self.grace_deadline;

            tokio::select! {
                Some(outcome) = outcomes.recv() => self.complete(outcome).await,
                _ = token.cancelled(), if !stopping => {
                    self.stop(self.handle.reason().unwrap_or(StopReason::Cancelled));
                }
                _ = sleep_until_opt(deadline), if !stopping && deadline.is_some() => {
                    warn!(execution_id = %self.execution_id, "Execution deadline reached");
                    self.stop(StopReason::Timeout);
                }
                _ = tokio::time::sleep(dispatch_retry), if !stopping && backpressure => {}
                _ = sleep_until_opt(grace_deadline), if stopping => {
                    self.abandon_in_flight().await;
                    break;
                }
            }
        }

        self.skip_remaining().await;
        self.verdict()
    }

    fn stop(&mut self, reason: StopReason) {
        if self.stop_reason.is_none() {
            debug!(
                execution_id = %self.execution_id,
                reason = ?reason,
                in_flight = self.in_flight.len(),
                "Stopping execution"
            );
            self.stop_reason = Some(reason);
            self.grace_deadline =
                Some(tokio::time::Instant::now() + self.engine.inner.config.cancel_grace());
        }
        self.handle.token.cancel();
    }

    fn node_type(&self, node_id: &str) -> String {
        self.workflow
            .node(node_id)
            .map(|n| n.node_type.clone())
            .unwrap_or_default()
    }

    /// Submit every node whose dependencies have all succeeded. A full
    /// pool queue leaves the rest for the next pass.
    async fn dispatch_ready(&mut self) {
        self.backpressure = false;

        let ready: Vec<String> = self
            .order
            .iter()
            .filter(|id| !self.finished.contains(*id) && !self.in_flight.contains_key(*id))
            .filter(|id| self.resolver.can_execute(id, &self.succeeded).unwrap_or(false))
            .cloned()
            .collect();

        for node_id in ready {
            if self.stop_reason.is_some() {
                return;
            }
            match self.dispatch(&node_id) {
                Ok(record) => {
                    self.in_flight.insert(node_id, record.clone());
                    self.engine.store_node_result(&record, true).await;
                }
                Err(Error::QueueFull) => {
                    debug!(execution_id = %self.execution_id, node_id = %node_id, "Worker pool full, deferring node");
                    self.backpressure = true;
                    return;
                }
                Err(e) => {
                    warn!(execution_id = %self.execution_id, node_id = %node_id, error = %e, "Node could not be dispatched");
                    let record = NodeResult::unrun(
                        &self.execution_id,
                        &node_id,
                        &self.node_type(&node_id),
                        NodeStatus::Failed,
                        e.to_string(),
                    );
                    self.record_failure(&node_id, &e);
                    self.finished.insert(node_id);
                    self.engine.store_node_result(&record, true).await;
                }
            }
        }
    }

    fn dispatch(&self, node_id: &str) -> Result<NodeResult> {
        let node = self
            .workflow
            .node(node_id)
            .cloned()
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
        let dependencies = self.resolver.node_dependencies(node_id)?;
        let input = prepare_input(&node, &self.trigger_params, &dependencies, &self.outputs);

        let strategy_name = node
            .retry_strategy
            .clone()
            .or_else(|| self.workflow.settings.retry_strategy.clone())
            .unwrap_or_else(|| DEFAULT_STRATEGY.to_string());
        let strategy = Arc::new(self.engine.inner.retry.strategy(&strategy_name));

        let ctx = NodeContext::new(&self.execution_id, node_id)
            .with_workflow(&self.workflow.id)
            .with_node_type(&node.node_type)
            .with_cancellation(self.handle.token.clone());
        let node_type = node.node_type.clone();
        let node = Arc::new(node);
        let input = Arc::new(input);
        let engine = self.engine.clone();
        let tx = self.tx.clone();

        let job = Job::new(format!("{}:{}", self.execution_id, node_id), move || {
            let engine = engine.clone();
            let tx = tx.clone();
            let node = node.clone();
            let input = input.clone();
            let strategy = strategy.clone();
            let ctx = ctx.clone();
            async move {
                let attempts = Mutex::new(Vec::new());
                let result = AssertUnwindSafe(
                    engine.run_node(&ctx, &node.config, &input, &strategy, &attempts),
                )
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(Error::from_panic(payload)));
                let attempts = attempts.into_inner().unwrap_or_else(PoisonError::into_inner);
                // Send fails only if the run already gave up on this node
                let _ = tx.send(NodeOutcome {
                    node_id: node.id.clone(),
                    result,
                    attempts,
                });
                Ok(())
            }
        });
        self.engine.inner.pool.submit(job)?;

        debug!(execution_id = %self.execution_id, node_id, node_type = %node_type, strategy = %strategy_name, "Node dispatched");
        let mut record = NodeResult::new(&self.execution_id, node_id, &node_type);
        record.status = NodeStatus::Running;
        record.started_at = Some(Utc::now());
        Ok(record)
    }

    fn record_failure(&mut self, node_id: &str, err: &Error) {
        self.failed.push(node_id.to_string());
        if self.first_error.is_none() {
            self.first_error = Some(format!("node '{}' failed: {}", node_id, err));
        }
        if self.policy == FailurePolicy::FailFast {
            self.stop(StopReason::Failed);
        }
    }

    async fn complete(&mut self, outcome: NodeOutcome) {
        let NodeOutcome {
            node_id,
            result,
            attempts,
        } = outcome;
        let Some(mut record) = self.in_flight.remove(&node_id) else {
            return;
        };

        let now = Utc::now();
        record.completed_at = Some(now);
        record.execution_time_ms = record
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        if let Some(last) = attempts.last() {
            record.attempt_number = last.attempt;
        }
        record.attempts = attempts;

        match result {
            Ok(output) => {
                debug!(execution_id = %self.execution_id, node_id = %node_id, attempts = record.attempt_number, "Node succeeded");
                record.status = NodeStatus::Success;
                record.output = Some(output.clone());
                self.outputs.insert(node_id.clone(), output);
                self.succeeded.insert(node_id.clone());
            }
            Err(e @ Error::Cancelled(_)) => {
                debug!(execution_id = %self.execution_id, node_id = %node_id, "Node cancelled");
                record.status = NodeStatus::Cancelled;
                record.error = Some(e.to_string());
            }
            Err(e) => {
                warn!(execution_id = %self.execution_id, node_id = %node_id, error = %e, "Node failed");
                record.status = NodeStatus::Failed;
                record.error = Some(e.to_string());
                self.record_failure(&node_id, &e);
            }
        }
        self.finished.insert(node_id);
        self.engine.store_node_result(&record, false).await;

        self.since_snapshot += 1;
        let interval = self.engine.inner.config.snapshot_interval;
        if interval > 0 && self.since_snapshot >= interval {
            self.since_snapshot = 0;
            self.snapshot().await;
        }
    }

    async fn abandon_in_flight(&mut self) {
        let abandoned: Vec<NodeResult> = self.in_flight.drain().map(|(_, r)| r).collect();
        for mut record in abandoned {
            warn!(execution_id = %self.execution_id, node_id = %record.node_id, "Node did not stop within the cancel grace period");
            record.status = NodeStatus::Cancelled;
            record.error = Some("node did not stop within the cancel grace period".to_string());
            record.completed_at = Some(Utc::now());
            self.finished.insert(record.node_id.clone());
            self.engine.store_node_result(&record, false).await;
        }
    }

    /// Mark every node that never ran as skipped.
    async fn skip_remaining(&mut self) {
        let reason = match self.stop_reason {
            Some(StopReason::Timeout) => "execution timed out before the node ran",
            Some(StopReason::Cancelled) => "execution cancelled before the node ran",
            Some(StopReason::Failed) => "execution stopped after a node failure",
            None => "an upstream dependency did not succeed",
        };

        let never_ran: Vec<String> = self
            .order
            .iter()
            .filter(|id| !self.finished.contains(*id))
            .cloned()
            .collect();
        for node_id in never_ran {
            let record = NodeResult::unrun(
                &self.execution_id,
                &node_id,
                &self.node_type(&node_id),
                NodeStatus::Skipped,
                reason,
            );
            self.finished.insert(node_id);
            self.engine.store_node_result(&record, true).await;
        }
    }

    fn verdict(&self) -> (ExecutionStatus, Option<String>) {
        match self.stop_reason {
            Some(StopReason::Timeout) => {
                let message = match self.timeout {
                    Some(timeout) => format!("execution timed out after {:?}", timeout),
                    None => "execution timed out".to_string(),
                };
                (ExecutionStatus::Timeout, Some(message))
            }
            Some(StopReason::Cancelled) => {
                (ExecutionStatus::Cancelled, Some("execution cancelled".to_string()))
            }
            _ if self.failed.is_empty() => (ExecutionStatus::Success, None),
            _ => {
                let first = self.first_error.clone().unwrap_or_default();
                let message = if self.failed.len() == 1 {
                    first
                } else {
                    format!(
                        "{} nodes failed ({}); first: {}",
                        self.failed.len(),
                        self.failed.join(", "),
                        first
                    )
                };
                (ExecutionStatus::Failed, Some(message))
            }
        }
    }

    async fn snapshot(&self) {
        let Some(execution) = self
            .engine
            .inner
            .executions
            .read()
            .await
            .get(&self.execution_id)
            .cloned()
        else {
            return;
        };

        let mut succeeded: Vec<&String> = self.succeeded.iter().collect();
        succeeded.sort();
        let mut in_flight: Vec<&String> = self.in_flight.keys().collect();
        in_flight.sort();
        let checkpoint = json!({
            "succeeded": succeeded,
            "failed": self.failed,
            "in_flight": in_flight,
        });

        let snapshot = StateSnapshot::capture(&execution, checkpoint);
        if let Err(e) = self.engine.inner.storage.create_state_snapshot(&snapshot).await {
            warn!(execution_id = %self.execution_id, error = %e, "Failed to write state snapshot");
        }
    }
}
