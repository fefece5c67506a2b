//! Bounded worker pool.
//!
//! A fixed number of workers drain a bounded job queue. Submission never
//! blocks indefinitely: a full queue is reported as [`Error::QueueFull`] so
//! callers get an explicit backpressure signal.
//!
//! Each job may carry its own timeout and a coarse inline retry count. The
//! pool retry is separate from the node-level [`RetryManager`](super::RetryManager).
//! Finished jobs are reported on a buffered result channel; when that buffer
//! is full the result is dropped rather than stalling the worker.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics;

/// Number of recent job durations kept for averages and percentiles.
const DURATION_WINDOW: usize = 1000;

/// Repeatable unit of work.
pub type JobTask = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A job submitted to the pool.
#[derive(Clone)]
pub struct Job {
    pub id: String,
    pub task: JobTask,
    /// Informational; the queue is FIFO
    pub priority: i32,
    /// Per-attempt time limit
    pub timeout: Option<Duration>,
    /// Extra attempts after the first failure
    pub retry: u32,
}

impl Job {
    pub fn new<F, Fut>(id: impl Into<String>, task: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            id: id.into(),
            task: Arc::new(move || Box::pin(task())),
            priority: 0,
            timeout: None,
            retry: 0,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Outcome of a finished job.
#[derive(Debug)]
pub struct JobResult {
    pub job_id: String,
    /// Last error if every attempt failed
    pub error: Option<Error>,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
    /// Attempts made beyond the first
    pub retried: u32,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_size: usize,
    pub result_buffer: usize,
    /// Retry attempt `n` waits `n * retry_base_delay`
    pub retry_base_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            queue_size: 100,
            result_buffer: 100,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Default)]
struct PoolMetrics {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    active_workers: AtomicU64,
    queued_jobs: AtomicU64,
    durations: Mutex<VecDeque<Duration>>,
}

impl PoolMetrics {
    fn record_duration(&self, duration: Duration) {
        let mut durations = self.durations.lock().unwrap_or_else(PoisonError::into_inner);
        if durations.len() == DURATION_WINDOW {
            durations.pop_front();
        }
        durations.push_back(duration);
    }

    fn publish_gauges(&self) {
        metrics::set_pool_gauges(
            self.active_workers.load(Ordering::Relaxed) as f64,
            self.queued_jobs.load(Ordering::Relaxed) as f64,
        );
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub active_workers: u64,
    pub queued_jobs: u64,
    /// Mean over the recent duration window
    pub average_duration: Duration,
    /// `completed / (completed + failed)`, 1.0 before any job finishes
    pub success_rate: f64,
}

/// Fixed-size pool of async workers.
pub struct WorkerPool {
    config: PoolConfig,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    receiver: Mutex<Option<mpsc::Receiver<Job>>>,
    result_tx: Mutex<Option<mpsc::Sender<JobResult>>>,
    result_rx: Mutex<Option<mpsc::Receiver<JobResult>>>,
    started: AtomicBool,
    closed: AtomicBool,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    metrics: Arc<PoolMetrics>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkerPool {
    /// Create a stopped pool. Call [`WorkerPool::start`] before submitting.
    pub fn new(config: PoolConfig) -> Self {
        let config = PoolConfig {
            workers: config.workers.max(1),
            queue_size: config.queue_size.max(1),
            result_buffer: config.result_buffer.max(1),
            ..config
        };
        let (sender, receiver) = mpsc::channel(config.queue_size);
        let (result_tx, result_rx) = mpsc::channel(config.result_buffer);

        Self {
            config,
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            result_tx: Mutex::new(Some(result_tx)),
            result_rx: Mutex::new(Some(result_rx)),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            metrics: Arc::new(PoolMetrics::default()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Spawn the workers. Calling it again is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::PoolClosed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let receiver = lock(&self.receiver)
            .take()
            .ok_or_else(|| Error::Internal("worker pool receiver already taken".to_string()))?;
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let result_tx = lock(&self.result_tx).clone();

        let mut workers = lock(&self.workers);
        for worker_id in 0..self.config.workers {
            workers.push(tokio::spawn(worker_loop(
                worker_id,
                receiver.clone(),
                result_tx.clone(),
                self.shutdown.clone(),
                self.metrics.clone(),
                self.config.retry_base_delay,
            )));
        }

        info!(workers = self.config.workers, queue_size = self.config.queue_size, "Worker pool started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    fn live_sender(&self) -> Result<mpsc::Sender<Job>> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(Error::PoolNotStarted);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::PoolClosed);
        }
        lock(&self.sender).clone().ok_or(Error::PoolClosed)
    }

    fn accepted(&self) {
        self.metrics.submitted.fetch_add(1, Ordering::Relaxed);
        self.metrics.publish_gauges();
    }

    /// Enqueue a job without waiting. Fails with [`Error::QueueFull`] if the
    /// queue has no room.
    pub fn submit(&self, job: Job) -> Result<()> {
        let sender = self.live_sender()?;

        self.metrics.queued_jobs.fetch_add(1, Ordering::Relaxed);
        match sender.try_send(job) {
            Ok(()) => {
                self.accepted();
                Ok(())
            }
            Err(e) => {
                self.metrics.queued_jobs.fetch_sub(1, Ordering::Relaxed);
                match e {
                    mpsc::error::TrySendError::Full(_) => Err(Error::QueueFull),
                    mpsc::error::TrySendError::Closed(_) => Err(Error::PoolClosed),
                }
            }
        }
    }

    /// Enqueue a job, waiting up to `timeout` for queue space.
    pub async fn submit_with_timeout(&self, job: Job, timeout: Duration) -> Result<()> {
        let sender = self.live_sender()?;

        self.metrics.queued_jobs.fetch_add(1, Ordering::Relaxed);
        match tokio::time::timeout(timeout, sender.send(job)).await {
            Ok(Ok(())) => {
                self.accepted();
                Ok(())
            }
            Ok(Err(_)) => {
                self.metrics.queued_jobs.fetch_sub(1, Ordering::Relaxed);
                Err(Error::PoolClosed)
            }
            Err(_) => {
                self.metrics.queued_jobs.fetch_sub(1, Ordering::Relaxed);
                Err(Error::QueueFull)
            }
        }
    }

    /// Take the result receiver. Only the first caller gets it.
    pub fn take_results(&self) -> Option<mpsc::Receiver<JobResult>> {
        lock(&self.result_rx).take()
    }

    /// Stop accepting jobs and wait up to `timeout` for workers to finish
    /// their current job.
    ///
    /// Jobs still queued are discarded. Workers that overrun the timeout are
    /// left to finish on their own and [`Error::ShutdownTimeout`] is returned.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        lock(&self.sender).take();
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        lock(&self.result_tx).take();

        match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(_) => {
                info!("Worker pool stopped");
                Ok(())
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Worker pool shutdown timed out");
                Err(Error::ShutdownTimeout(timeout))
            }
        }
    }

    /// Counters plus averages over the recent duration window.
    pub fn stats(&self) -> PoolStats {
        let m = &self.metrics;
        let completed = m.completed.load(Ordering::Relaxed);
        let failed = m.failed.load(Ordering::Relaxed);
        let finished = completed + failed;

        let average_duration = {
            let durations = lock(&m.durations);
            if durations.is_empty() {
                Duration::ZERO
            } else {
                durations.iter().sum::<Duration>() / durations.len() as u32
            }
        };

        PoolStats {
            submitted: m.submitted.load(Ordering::Relaxed),
            completed,
            failed,
            retried: m.retried.load(Ordering::Relaxed),
            active_workers: m.active_workers.load(Ordering::Relaxed),
            queued_jobs: m.queued_jobs.load(Ordering::Relaxed),
            average_duration,
            success_rate: if finished == 0 {
                1.0
            } else {
                completed as f64 / finished as f64
            },
        }
    }

    /// Duration at percentile `p` (0.0..=100.0) over the recent window.
    pub fn percentile(&self, p: f64) -> Option<Duration> {
        let mut durations: Vec<Duration> = lock(&self.metrics.durations).iter().copied().collect();
        if durations.is_empty() {
            return None;
        }
        durations.sort_unstable();
        let rank = (p.clamp(0.0, 100.0) / 100.0 * (durations.len() - 1) as f64).round() as usize;
        durations.get(rank).copied()
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    results: Option<mpsc::Sender<JobResult>>,
    shutdown: CancellationToken,
    metrics: Arc<PoolMetrics>,
    retry_base_delay: Duration,
) {
    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                job = receiver.recv() => job,
            }
        };
        let Some(job) = job else {
            break;
        };

        metrics.queued_jobs.fetch_sub(1, Ordering::Relaxed);
        metrics.active_workers.fetch_add(1, Ordering::Relaxed);
        metrics.publish_gauges();

        let result = run_job(&job, retry_base_delay, &shutdown).await;

        metrics.retried.fetch_add(u64::from(result.retried), Ordering::Relaxed);
        if result.is_success() {
            metrics.completed.fetch_add(1, Ordering::Relaxed);
            metrics::record_pool_job("completed");
        } else {
            metrics.failed.fetch_add(1, Ordering::Relaxed);
            metrics::record_pool_job("failed");
        }
        metrics.record_duration(result.duration);
        metrics.active_workers.fetch_sub(1, Ordering::Relaxed);
        metrics.publish_gauges();

        if let Some(results) = &results {
            if let Err(mpsc::error::TrySendError::Full(dropped)) = results.try_send(result) {
                debug!(worker_id, job_id = %dropped.job_id, "Result buffer full, dropping job result");
            }
        }
    }

    debug!(worker_id, "Worker exiting");
}

/// One attempt of a job. A panic in the task becomes an error and leaves
/// the worker alive.
async fn run_attempt(job: &Job) -> Result<()> {
    let task = match std::panic::catch_unwind(AssertUnwindSafe(|| (job.task)())) {
        Ok(task) => task,
        Err(payload) => return Err(Error::from_panic(payload)),
    };
    AssertUnwindSafe(task)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(Error::from_panic(payload)))
}

async fn run_job(job: &Job, retry_base_delay: Duration, shutdown: &CancellationToken) -> JobResult {
    let start = Instant::now();
    let mut retried = 0;
    let mut last_error = None;

    for attempt in 0..=job.retry {
        if attempt > 0 {
            if shutdown.is_cancelled() {
                break;
            }
            retried += 1;
            tokio::time::sleep(retry_base_delay.saturating_mul(attempt)).await;
        }

        let task = run_attempt(job);
        let outcome = match job.timeout {
            Some(limit) => tokio::time::timeout(limit, task)
                .await
                .unwrap_or(Err(Error::JobTimeout(limit))),
            None => task.await,
        };

        match outcome {
            Ok(()) => {
                last_error = None;
                break;
            }
            Err(e) => {
                debug!(job_id = %job.id, attempt = attempt + 1, error = %e, "Job attempt failed");
                last_error = Some(e);
            }
        }
    }

    JobResult {
        job_id: job.id.clone(),
        error: last_error,
        duration: start.elapsed(),
        timestamp: Utc::now(),
        retried,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Notify;

    fn small(workers: usize, queue_size: usize) -> PoolConfig {
        PoolConfig {
            workers,
            queue_size,
            result_buffer: 16,
            retry_base_delay: Duration::from_millis(1),
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_submit_requires_start() {
        let pool = WorkerPool::new(small(1, 1));
        let result = pool.submit(Job::new("j", || async { Ok(()) }));
        assert!(matches!(result, Err(Error::PoolNotStarted)));
    }

    #[tokio::test]
    async fn test_runs_jobs_and_reports_results() {
        let pool = WorkerPool::new(small(2, 8));
        pool.start().unwrap();
        pool.start().unwrap();
        let mut results = pool.take_results().unwrap();
        assert!(pool.take_results().is_none());

        for i in 0..4 {
            pool.submit(Job::new(format!("job-{}", i), || async { Ok(()) }))
                .unwrap();
        }

        let mut ids = Vec::new();
        for _ in 0..4 {
            let result = results.recv().await.unwrap();
            assert!(result.is_success());
            ids.push(result.job_id);
        }
        ids.sort();
        assert_eq!(ids, vec!["job-0", "job-1", "job-2", "job-3"]);

        let stats = pool.stats();
        assert_eq!(stats.submitted, 4);
        assert_eq!(stats.completed, 4);
        assert_eq!(stats.success_rate, 1.0);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(small(1, 8));
        pool.start().unwrap();
        let mut results = pool.take_results().unwrap();

        pool.submit(Job::new("panics", || async {
            let explode = true;
            if explode {
                panic!("job exploded");
            }
            Ok(())
        }))
        .unwrap();
        pool.submit(Job::new("after", || async { Ok(()) })).unwrap();

        let first = results.recv().await.unwrap();
        assert_eq!(first.job_id, "panics");
        assert!(first
            .error
            .as_ref()
            .unwrap()
            .to_string()
            .contains("job exploded"));

        let second = results.recv().await.unwrap();
        assert_eq!(second.job_id, "after");
        assert!(second.is_success());

        let stats = pool.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_full_queue_is_rejected() {
        let pool = WorkerPool::new(small(1, 1));
        pool.start().unwrap();

        let gate = Arc::new(Notify::new());
        let blocker = gate.clone();
        pool.submit(Job::new("blocker", move || {
            let blocker = blocker.clone();
            async move {
                blocker.notified().await;
                Ok(())
            }
        }))
        .unwrap();
        wait_until(|| pool.stats().active_workers == 1).await;

        pool.submit(Job::new("queued", || async { Ok(()) })).unwrap();
        let overflow = pool.submit(Job::new("overflow", || async { Ok(()) }));
        assert!(matches!(overflow, Err(Error::QueueFull)));

        let waited = pool
            .submit_with_timeout(Job::new("late", || async { Ok(()) }), Duration::from_millis(20))
            .await;
        assert!(matches!(waited, Err(Error::QueueFull)));

        gate.notify_one();
        wait_until(|| pool.stats().completed == 2).await;
    }

    #[tokio::test]
    async fn test_submit_with_timeout_waits_for_space() {
        let pool = WorkerPool::new(small(1, 1));
        pool.start().unwrap();

        for i in 0..5 {
            pool.submit_with_timeout(
                Job::new(format!("j{}", i), || async {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(())
                }),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        }
        wait_until(|| pool.stats().completed == 5).await;
    }

    #[tokio::test]
    async fn test_inline_retry() {
        let pool = WorkerPool::new(small(1, 4));
        pool.start().unwrap();
        let mut results = pool.take_results().unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        pool.submit(
            Job::new("flaky", move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::node_execution("not yet"))
                    } else {
                        Ok(())
                    }
                }
            })
            .with_retry(3),
        )
        .unwrap();

        let result = results.recv().await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.retried, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(pool.stats().retried, 2);
    }

    #[tokio::test]
    async fn test_job_timeout() {
        let pool = WorkerPool::new(small(1, 4));
        pool.start().unwrap();
        let mut results = pool.take_results().unwrap();

        pool.submit(
            Job::new("slow", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .with_timeout(Duration::from_millis(20)),
        )
        .unwrap();

        let result = results.recv().await.unwrap();
        assert!(matches!(result.error, Some(Error::JobTimeout(_))));
        assert_eq!(pool.stats().failed, 1);
        assert_eq!(pool.stats().success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_results_dropped_when_buffer_full() {
        let pool = WorkerPool::new(PoolConfig {
            result_buffer: 1,
            ..small(1, 8)
        });
        pool.start().unwrap();

        for i in 0..3 {
            pool.submit(Job::new(format!("j{}", i), || async { Ok(()) }))
                .unwrap();
        }
        wait_until(|| pool.stats().completed == 3).await;

        let mut results = pool.take_results().unwrap();
        assert!(results.try_recv().is_ok());
        assert!(results.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_jobs_and_closes_results() {
        let pool = WorkerPool::new(small(2, 4));
        pool.start().unwrap();
        let mut results = pool.take_results().unwrap();

        pool.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(!pool.is_running());
        assert!(matches!(
            pool.submit(Job::new("late", || async { Ok(()) })),
            Err(Error::PoolClosed)
        ));
        assert!(matches!(pool.start(), Err(Error::PoolClosed)));
        assert!(results.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_timeout_reported() {
        let pool = WorkerPool::new(small(1, 4));
        pool.start().unwrap();
        pool.submit(Job::new("long", || async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(())
        }))
        .unwrap();
        wait_until(|| pool.stats().active_workers == 1).await;

        let result = pool.shutdown(Duration::from_millis(30)).await;
        assert!(matches!(result, Err(Error::ShutdownTimeout(_))));
    }

    #[tokio::test]
    async fn test_duration_stats() {
        let pool = WorkerPool::new(small(1, 8));
        pool.start().unwrap();
        assert!(pool.percentile(50.0).is_none());

        for ms in [5u64, 10, 15] {
            pool.submit(Job::new(format!("sleep-{}", ms), move || async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(())
            }))
            .unwrap();
        }
        wait_until(|| pool.stats().completed == 3).await;

        let stats = pool.stats();
        assert!(stats.average_duration >= Duration::from_millis(10));
        let p0 = pool.percentile(0.0).unwrap();
        let p100 = pool.percentile(100.0).unwrap();
        assert!(p0 <= p100);
        assert!(p100 >= Duration::from_millis(15));
    }
}
