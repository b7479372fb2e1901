//! Persistent job queue with delayed scheduling and bounded retries.
//!
//! Jobs live in a [`JobStore`]; one worker per queue name claims due jobs,
//! dispatches them to the [`JobHandler`] registered for their task type and
//! records the outcome. A failed job is retried with linear backoff until
//! its `max_retry` is used up, then it stays Failed for operators to see.

use crate::config::QueueConfig;
use crate::entities::JobStatus;
use crate::entities::queue_jobs::NewJob;
use crate::notify::NotificationSink;
use crate::store::{JobStore, StoreError};
use crate::tasks::TaskError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Executes one task type. The payload is opaque to the queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> Result<(), TaskError>;
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_type: &str, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(task_type.to_string(), handler);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn task_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { id: i64 },
    /// Failed, rescheduled with backoff.
    Retrying { id: i64 },
    /// Failed with no retries left.
    Failed { id: i64 },
}

pub struct JobQueue<S> {
    store: Arc<S>,
    handlers: HandlerRegistry,
    config: QueueConfig,
    alerts: Option<Arc<dyn NotificationSink>>,
}

impl<S: JobStore + 'static> JobQueue<S> {
    pub fn new(store: Arc<S>, handlers: HandlerRegistry, config: QueueConfig) -> Self {
        Self {
            store,
            handlers,
            config,
            alerts: None,
        }
    }

    /// Send an operator alert whenever a job runs out of retries.
    pub fn with_alerts(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.alerts = Some(sink);
        self
    }

    pub async fn enqueue(&self, job: NewJob) -> Result<i64, QueueError> {
        let id = self.store.enqueue(job).await?;
        Ok(id)
    }

    /// Claim at most one due job from `queue_name` and run it.
    pub async fn poll_once(&self, queue_name: &str) -> Result<Option<JobOutcome>, QueueError> {
        let Some(job) = self
            .store
            .claim_next(queue_name, OffsetDateTime::now_utc())
            .await?
        else {
            return Ok(None);
        };

        debug!(
            job_id = job.id,
            queue = %queue_name,
            task_type = %job.task_type,
            attempt = job.retry_count + 1,
            "Running job"
        );

        let result = match self.handlers.get(&job.task_type) {
            Some(handler) => handler.handle(&job.payload).await,
            None => Err(TaskError::UnknownTaskType(job.task_type.clone())),
        };

        let error = match result {
            Ok(()) => {
                self.store.complete(job.id).await?;
                info!(job_id = job.id, task_type = %job.task_type, "Job completed");
                return Ok(Some(JobOutcome::Completed { id: job.id }));
            }
            Err(e) => e,
        };

        let status = self.store.fail(job.id, self.config.backoff_unit).await?;
        if status == JobStatus::Failed {
            error!(
                job_id = job.id,
                task_type = %job.task_type,
                attempts = job.retry_count + 1,
                error = %error,
                "Job failed permanently"
            );
            self.alert_exhausted(job.id, &job.task_type, &error).await;
            Ok(Some(JobOutcome::Failed { id: job.id }))
        } else {
            warn!(
                job_id = job.id,
                task_type = %job.task_type,
                attempt = job.retry_count + 1,
                max_retry = job.max_retry,
                error = %error,
                "Job failed, will retry"
            );
            Ok(Some(JobOutcome::Retrying { id: job.id }))
        }
    }

    async fn alert_exhausted(&self, id: i64, task_type: &str, error: &TaskError) {
        let Some(sink) = &self.alerts else {
            return;
        };
        let text = format!("Job {id} ({task_type}) failed permanently: {error}");
        if let Err(e) = sink.send_operator_alert(&text).await {
            warn!(job_id = id, error = %e, "Failed to send operator alert");
        }
    }

    /// One worker task per configured queue name.
    pub fn spawn_workers(self: Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.config
            .names
            .iter()
            .map(|name| {
                let queue = self.clone();
                tokio::spawn(queue.run_worker(name.clone(), shutdown_rx.clone()))
            })
            .collect()
    }

    async fn run_worker(self: Arc<Self>, queue_name: String, mut shutdown_rx: watch::Receiver<bool>) {
        info!(queue = %queue_name, "Queue worker started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let claimed = match self.poll_once(&queue_name).await {
                Ok(outcome) => outcome.is_some(),
                Err(e) => {
                    error!(queue = %queue_name, error = %e, "Failed to poll queue");
                    false
                }
            };
            if claimed {
                continue;
            }

            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(queue = %queue_name, "Queue worker shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingHandler {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _payload: &[u8]) -> Result<(), TaskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(TaskError::InvalidPayload("always fails".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn queue(
        fail: bool,
    ) -> (Arc<MemoryStore>, Arc<CountingHandler>, JobQueue<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail,
        });
        let mut handlers = HandlerRegistry::new();
        handlers.register("test:task", handler.clone());
        let config = QueueConfig {
            backoff_unit: Duration::ZERO,
            ..QueueConfig::default()
        };
        (store.clone(), handler, JobQueue::new(store, handlers, config))
    }

    #[tokio::test]
    async fn test_successful_job_completes() {
        let (store, handler, queue) = queue(false);
        let id = queue
            .enqueue(NewJob::new("default", "test:task", "x"))
            .await
            .unwrap();
        assert_eq!(
            queue.poll_once("default").await.unwrap(),
            Some(JobOutcome::Completed { id })
        );
        assert_eq!(queue.poll_once("default").await.unwrap(), None);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.get_job(id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_failing_job_runs_max_retry_times_then_fails() {
        let (store, handler, queue) = queue(true);
        let id = queue
            .enqueue(NewJob::new("default", "test:task", "x").max_retry(3))
            .await
            .unwrap();

        assert_eq!(
            queue.poll_once("default").await.unwrap(),
            Some(JobOutcome::Retrying { id })
        );
        assert_eq!(
            queue.poll_once("default").await.unwrap(),
            Some(JobOutcome::Retrying { id })
        );
        assert_eq!(
            queue.poll_once("default").await.unwrap(),
            Some(JobOutcome::Failed { id })
        );
        assert_eq!(queue.poll_once("default").await.unwrap(), None);

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 3);
    }

    #[tokio::test]
    async fn test_unknown_task_type_consumes_retries() {
        let (store, handler, queue) = queue(false);
        let id = queue
            .enqueue(NewJob::new("default", "nobody:handles", "x").max_retry(1))
            .await
            .unwrap();
        assert_eq!(
            queue.poll_once("default").await.unwrap(),
            Some(JobOutcome::Failed { id })
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            store.get_job(id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_delayed_job_waits_for_schedule() {
        let (_store, handler, queue) = queue(false);
        queue
            .enqueue(
                NewJob::new("default", "test:task", "x")
                    .schedule_at(OffsetDateTime::now_utc() + Duration::from_secs(3600)),
            )
            .await
            .unwrap();
        assert_eq!(queue.poll_once("default").await.unwrap(), None);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_workers_drain_and_stop_on_shutdown() {
        let (store, handler, queue) = queue(false);
        for _ in 0..5 {
            queue
                .enqueue(NewJob::new("low", "test:task", "x"))
                .await
                .unwrap();
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = Arc::new(queue).spawn_workers(shutdown_rx);

        for _ in 0..100 {
            if handler.calls.load(Ordering::SeqCst) == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown_tx.send(true).unwrap();
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(handler.calls.load(Ordering::SeqCst), 5);
        assert!(
            store
                .jobs()
                .await
                .iter()
                .all(|job| job.status == JobStatus::Completed)
        );
    }
}
