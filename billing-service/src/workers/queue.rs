use crate::models::Task;
use crate::services::broker::Broker;
use crate::services::error::BillingError;
use crate::services::metrics::record_task_outcome;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Processes one dequeued task. The task carries its attempts counter already
/// decremented for this run.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> anyhow::Result<()>;
}

/// A named FIFO queue stored as a broker list. Producers push at the head and
/// workers pop from the tail.
#[derive(Clone)]
pub struct TaskQueue {
    name: String,
    broker: Arc<dyn Broker>,
}

impl TaskQueue {
    pub fn new(name: impl Into<String>, broker: Arc<dyn Broker>) -> Self {
        Self {
            name: name.into(),
            broker,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Broker list holding this queue's tasks.
    pub fn list_key(&self) -> String {
        format!("queue_{}", self.name)
    }

    /// Append a task. Fails only when the broker is unavailable.
    pub async fn enqueue(
        &self,
        description: &str,
        args: serde_json::Value,
        attempts: u32,
    ) -> Result<(), BillingError> {
        let task = Task {
            created_at: Utc::now().timestamp(),
            args,
            description: description.to_string(),
            attempts,
        };
        self.push(&task).await?;

        tracing::debug!(
            queue = %self.name,
            description = %task.description,
            attempts = attempts,
            "Task enqueued"
        );

        Ok(())
    }

    async fn push(&self, task: &Task) -> Result<(), BillingError> {
        let payload = serde_json::to_string(task)?;
        self.broker.push(&self.list_key(), &payload).await
    }

    /// Spawn `workers` loops that drain this queue until `shutdown` fires.
    pub fn spawn_workers(
        &self,
        workers: usize,
        handler: Arc<dyn TaskHandler>,
        poll_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..workers)
            .map(|worker_id| {
                let queue = self.clone();
                let handler = Arc::clone(&handler);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    queue
                        .run_worker(worker_id, handler, poll_timeout, shutdown)
                        .await
                })
            })
            .collect()
    }

    async fn run_worker(
        self,
        worker_id: usize,
        handler: Arc<dyn TaskHandler>,
        poll_timeout: Duration,
        shutdown: CancellationToken,
    ) {
        let list = self.list_key();
        tracing::info!(queue = %self.name, worker_id = worker_id, "Queue worker started");

        loop {
            // Checked between iterations only: dropping a pop mid-flight could lose a task.
            if shutdown.is_cancelled() {
                break;
            }

            let raw = match self.broker.pop(&list, poll_timeout).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(
                        queue = %self.name,
                        worker_id = worker_id,
                        error = %e,
                        "Broker unavailable, stopping queue worker"
                    );
                    break;
                }
            };

            if let Err(e) = self.process(&raw, handler.as_ref()).await {
                tracing::error!(
                    queue = %self.name,
                    worker_id = worker_id,
                    error = %e,
                    "Failed to re-enqueue task, stopping queue worker"
                );
                break;
            }
        }

        tracing::info!(queue = %self.name, worker_id = worker_id, "Queue worker stopped");
    }

    /// Run one raw task. Errors only when a retry cannot be pushed back.
    async fn process(&self, raw: &str, handler: &dyn TaskHandler) -> Result<(), BillingError> {
        let mut task: Task = match serde_json::from_str(raw) {
            Ok(task) => task,
            Err(e) => {
                tracing::error!(queue = %self.name, error = %e, "Discarding undecodable task");
                record_task_outcome(&self.name, "discarded");
                return Ok(());
            }
        };

        task.attempts = task.attempts.saturating_sub(1);

        match handler.handle(&task).await {
            Ok(()) => {
                record_task_outcome(&self.name, "succeeded");
            }
            Err(e) if task.attempts > 0 => {
                tracing::warn!(
                    queue = %self.name,
                    description = %task.description,
                    attempts_remaining = task.attempts,
                    error = %e,
                    "Task failed, retrying"
                );
                record_task_outcome(&self.name, "retried");
                self.push(&task).await?;
            }
            Err(e) => {
                tracing::error!(
                    queue = %self.name,
                    description = %task.description,
                    error = %e,
                    "Task failed, no attempts left"
                );
                record_task_outcome(&self.name, "dropped");
            }
        }

        Ok(())
    }
}

/// Owns every background loop of the process and stops them together.
pub struct QueueSupervisor {
    shutdown_token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for QueueSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueSupervisor {
    pub fn new() -> Self {
        Self {
            shutdown_token: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Token observed by every supervised loop.
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub async fn spawn_queue(
        &self,
        queue: &TaskQueue,
        workers: usize,
        handler: Arc<dyn TaskHandler>,
        poll_timeout: Duration,
    ) {
        tracing::info!(queue = %queue.name(), workers = workers, "Starting queue workers");
        let handles = queue.spawn_workers(workers, handler, poll_timeout, self.token());
        self.handles.lock().await.extend(handles);
    }

    pub async fn track(&self, handle: JoinHandle<()>) {
        self.handles.lock().await.push(handle);
    }

    /// Signal all loops and wait for them. In-flight handlers run to completion.
    pub async fn shutdown(&self) {
        tracing::info!("Initiating graceful shutdown of background workers");
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = ?e, "Background task failed");
            }
        }

        tracing::info!("Background workers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::broker::MemoryBroker;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        seen: std::sync::Mutex<Vec<String>>,
        calls: AtomicUsize,
        fail: bool,
    }

    impl Recorder {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                seen: std::sync::Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl TaskHandler for Recorder {
        async fn handle(&self, task: &Task) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(task.description.clone());
            if self.fail {
                anyhow::bail!("backend refused");
            }
            Ok(())
        }
    }

    async fn wait_for_calls(recorder: &Recorder, expected: usize) {
        for _ in 0..200 {
            if recorder.calls.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn single_worker_processes_in_enqueue_order() {
        let broker = Arc::new(MemoryBroker::new());
        let queue = TaskQueue::new("fifo", broker.clone());
        for name in ["first", "second", "third"] {
            queue.enqueue(name, serde_json::json!({}), 1).await.unwrap();
        }

        let recorder = Recorder::new(false);
        let supervisor = QueueSupervisor::new();
        supervisor
            .spawn_queue(&queue, 1, recorder.clone(), Duration::from_millis(20))
            .await;

        wait_for_calls(&recorder, 3).await;
        supervisor.shutdown().await;

        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec!["first", "second", "third"]
        );
        assert_eq!(broker.list_len(&queue.list_key()), 0);
    }

    #[tokio::test]
    async fn failing_task_runs_exactly_its_attempt_budget() {
        let broker = Arc::new(MemoryBroker::new());
        let queue = TaskQueue::new("retry", broker.clone());
        queue
            .enqueue("always fails", serde_json::json!({"service_id": 1}), 2)
            .await
            .unwrap();

        let recorder = Recorder::new(true);
        let supervisor = QueueSupervisor::new();
        supervisor
            .spawn_queue(&queue, 2, recorder.clone(), Duration::from_millis(20))
            .await;

        wait_for_calls(&recorder, 2).await;
        // Give a third attempt time to show up if the budget were ignored.
        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.shutdown().await;

        assert_eq!(recorder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(broker.list_len(&queue.list_key()), 0);
    }

    #[tokio::test]
    async fn handler_sees_decremented_attempts() {
        let broker = Arc::new(MemoryBroker::new());
        let queue = TaskQueue::new("counter", broker.clone());
        queue.enqueue("once", serde_json::json!({}), 3).await.unwrap();

        let raw = broker
            .pop(&queue.list_key(), Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        struct Check;
        #[async_trait]
        impl TaskHandler for Check {
            async fn handle(&self, task: &Task) -> anyhow::Result<()> {
                assert_eq!(task.attempts, 2);
                Ok(())
            }
        }

        queue.process(&raw, &Check).await.unwrap();
    }

    #[tokio::test]
    async fn undecodable_task_is_discarded() {
        let broker = Arc::new(MemoryBroker::new());
        let queue = TaskQueue::new("garbage", broker.clone());
        let recorder = Recorder::new(false);

        queue.process("{not json", &*recorder).await.unwrap();

        assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(broker.list_len(&queue.list_key()), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_idle_workers() {
        let broker = Arc::new(MemoryBroker::new());
        let queue = TaskQueue::new("idle", broker);
        let supervisor = QueueSupervisor::new();
        supervisor
            .spawn_queue(&queue, 2, Recorder::new(false), Duration::from_millis(20))
            .await;

        tokio::time::timeout(Duration::from_secs(2), supervisor.shutdown())
            .await
            .expect("workers should stop within one poll timeout");
    }

    #[tokio::test]
    async fn worker_stops_when_broker_is_unavailable() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_unavailable(true);
        let queue = TaskQueue::new("down", broker.clone());

        let handles = queue.spawn_workers(
            1,
            Recorder::new(false),
            Duration::from_millis(20),
            CancellationToken::new(),
        );

        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .expect("worker should exit on broker error")
                .unwrap();
        }
    }
}
