//! Sequential task dispatcher

use super::{
    ExecutionAttempt, RetryPolicy, TaskContext, TaskError, TaskEvent, TaskHandler, TaskOutcome,
    TaskRecord, TaskStatus, TaskType,
};
use crate::storage::Database;
use chrono::Utc;
use futures_util::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct ExecutorInner {
    db: Arc<Database>,
    policy: RetryPolicy,
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
    queue: mpsc::UnboundedSender<String>,
    events: broadcast::Sender<TaskEvent>,
    cancel: CancellationToken,
}

/// Runs queued tasks one at a time
#[derive(Clone)]
pub struct TaskExecutor {
    inner: Arc<ExecutorInner>,
}

impl TaskExecutor {
    /// Start the consumer loop and requeue every unfinished task
    pub async fn start(
        db: Arc<Database>,
        policy: RetryPolicy,
        handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
    ) -> Result<Self, TaskError> {
        let (queue, receiver) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(100);
        let executor = Self {
            inner: Arc::new(ExecutorInner {
                db,
                policy,
                handlers,
                queue,
                events,
                cancel: CancellationToken::new(),
            }),
        };

        let pending = executor.inner.db.pending_tasks().await?;
        for mut task in pending {
            if task.status == TaskStatus::Executing {
                // Interrupted mid-run by a crash or shutdown
                task.status = TaskStatus::Preparing;
                task.modified_at = Utc::now();
                executor.inner.db.update_task(&task).await?;
            }
            executor.enqueue(&task.task_id)?;
        }

        tokio::spawn(executor.clone().consume(receiver));
        Ok(executor)
    }

    /// Store a new task and queue it
    pub async fn submit(&self, task_type: TaskType, extra: Value) -> Result<String, TaskError> {
        let task = TaskRecord::new(task_type, extra);
        self.inner.db.insert_task(&task).await?;
        debug!("Submitted {} task {}", task_type, task.task_id);
        self.enqueue(&task.task_id)?;
        Ok(task.task_id)
    }

    pub fn enqueue(&self, task_id: &str) -> Result<(), TaskError> {
        self.inner
            .queue
            .send(task_id.to_string())
            .map_err(|_| TaskError::Stopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    pub async fn task(&self, task_id: &str) -> Result<TaskRecord, TaskError> {
        self.inner
            .db
            .load_task(task_id)
            .await?
            .ok_or_else(|| TaskError::UnknownTask(task_id.to_string()))
    }

    pub async fn tasks(&self) -> Result<Vec<TaskRecord>, TaskError> {
        Ok(self.inner.db.list_tasks().await?)
    }

    /// Stop dispatching; the running task finishes first
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    async fn consume(self, mut receiver: mpsc::UnboundedReceiver<String>) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(task_id) => {
                        if let Err(e) = self.dispatch(&task_id).await {
                            error!("Task {} could not be dispatched: {}", task_id, e);
                        }
                    }
                    None => break,
                },
            }
        }
        debug!("Task executor stopped");
    }

    async fn dispatch(&self, task_id: &str) -> Result<(), TaskError> {
        let db = &self.inner.db;
        let Some(mut task) = db.load_task(task_id).await? else {
            warn!("Queued task {} no longer exists", task_id);
            return Ok(());
        };
        if task.status.is_terminal() {
            debug!("Task {} already finished", task_id);
            return Ok(());
        }

        task.status = TaskStatus::Executing;
        task.modified_at = Utc::now();
        if !db.update_task(&task).await? {
            return Ok(());
        }

        let started_at = Utc::now();
        let ctx = TaskContext::new(db.clone(), task_id);
        let outcome = match self.inner.handlers.get(&task.task_type) {
            Some(handler) => match AssertUnwindSafe(handler.execute(&task, &ctx))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(panic) => TaskOutcome::terminal(format!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                )),
            },
            None => TaskOutcome::terminal(format!("no handler for {} tasks", task.task_type)),
        };

        let (extra, error, retryable) = match outcome {
            TaskOutcome::Success { extra } => (extra, None, false),
            TaskOutcome::Failure {
                extra,
                message,
                retryable,
            } => (extra, Some(message), retryable),
        };

        task.history.push(ExecutionAttempt {
            started_at,
            finished_at: Utc::now(),
            error: error.clone(),
        });
        task.extra = match extra {
            Some(extra) => extra,
            // Keep whatever progress the handler saved while running
            None => db
                .load_task(task_id)
                .await?
                .map(|stored| stored.extra)
                .unwrap_or(task.extra),
        };
        task.status = match &error {
            None => TaskStatus::Success,
            Some(_) if retryable && self.inner.policy.should_retry(&task) => TaskStatus::Preparing,
            Some(_) => TaskStatus::Failure,
        };
        task.modified_at = Utc::now();

        if !db.update_task(&task).await? {
            return Ok(());
        }

        match task.status {
            TaskStatus::Preparing => {
                info!(
                    "Retrying {} task {} (attempt {} failed: {})",
                    task.task_type,
                    task_id,
                    task.history.len(),
                    error.as_deref().unwrap_or_default()
                );
                self.enqueue(task_id)?;
            }
            status => {
                match &error {
                    Some(e) => warn!("{} task {} failed: {}", task.task_type, task_id, e),
                    None => info!("{} task {} succeeded", task.task_type, task_id),
                }
                let _ = self.inner.events.send(TaskEvent::Finished {
                    task_id: task_id.to_string(),
                    task_type: task.task_type,
                    status,
                    error,
                });
            }
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fails with the scripted outcomes, then succeeds
    struct Scripted {
        runs: AtomicUsize,
        failures: Vec<TaskOutcome>,
    }

    impl Scripted {
        fn new(failures: Vec<TaskOutcome>) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                failures,
            })
        }
    }

    #[async_trait]
    impl TaskHandler for Scripted {
        async fn execute(&self, _task: &TaskRecord, ctx: &TaskContext) -> TaskOutcome {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            ctx.save_extra(&json!({ "runs": run + 1 })).await.unwrap();
            match self.failures.get(run) {
                Some(outcome) => outcome.clone(),
                None => TaskOutcome::success(),
            }
        }
    }

    struct Panics;

    #[async_trait]
    impl TaskHandler for Panics {
        async fn execute(&self, _task: &TaskRecord, _ctx: &TaskContext) -> TaskOutcome {
            panic!("bitmap out of range");
        }
    }

    async fn executor(
        handler: Arc<dyn TaskHandler>,
        policy: RetryPolicy,
    ) -> (TaskExecutor, broadcast::Receiver<TaskEvent>) {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let mut handlers: HashMap<TaskType, Arc<dyn TaskHandler>> = HashMap::new();
        handlers.insert(TaskType::PullFile, handler);
        let executor = TaskExecutor::start(db, policy, handlers).await.unwrap();
        let events = executor.subscribe();
        (executor, events)
    }

    async fn finished(events: &mut broadcast::Receiver<TaskEvent>) -> TaskEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_retryable_failure_is_retried() {
        let handler = Scripted::new(vec![TaskOutcome::retryable("timeout")]);
        let (executor, mut events) = executor(handler.clone(), RetryPolicy::default()).await;
        let id = executor.submit(TaskType::PullFile, json!({})).await.unwrap();

        assert!(matches!(
            finished(&mut events).await,
            TaskEvent::Finished { status: TaskStatus::Success, .. }
        ));
        let task = executor.task(&id).await.unwrap();
        assert_eq!(task.history.len(), 2);
        assert_eq!(task.history[0].error.as_deref(), Some("timeout"));
        assert_eq!(task.extra, json!({ "runs": 2 }));
        assert_eq!(handler.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let handler = Scripted::new(vec![TaskOutcome::retryable("timeout"); 5]);
        let (executor, mut events) = executor(handler.clone(), RetryPolicy::new(3)).await;
        let id = executor.submit(TaskType::PullFile, json!({})).await.unwrap();

        assert_eq!(
            finished(&mut events).await,
            TaskEvent::Finished {
                task_id: id.clone(),
                task_type: TaskType::PullFile,
                status: TaskStatus::Failure,
                error: Some("timeout".to_string()),
            }
        );
        assert_eq!(handler.runs.load(Ordering::SeqCst), 3);
        assert_eq!(executor.task(&id).await.unwrap().history.len(), 3);
    }

    #[tokio::test]
    async fn test_terminal_failure_not_retried() {
        let outcome = TaskOutcome::terminal("not found").with_extra(json!({ "reason": "gone" }));
        let handler = Scripted::new(vec![outcome]);
        let (executor, mut events) = executor(handler.clone(), RetryPolicy::default()).await;
        let id = executor.submit(TaskType::PullFile, json!({})).await.unwrap();

        finished(&mut events).await;
        let task = executor.task(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failure);
        assert_eq!(task.extra, json!({ "reason": "gone" }));
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_recorded_and_consumer_survives() {
        let (executor, mut events) = executor(Arc::new(Panics), RetryPolicy::default()).await;
        let first = executor.submit(TaskType::PullFile, json!({})).await.unwrap();
        let second = executor.submit(TaskType::PullFile, json!({})).await.unwrap();

        finished(&mut events).await;
        finished(&mut events).await;
        for id in [first, second] {
            let task = executor.task(&id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Failure);
            assert!(task.last_error().unwrap().contains("bitmap out of range"));
        }
    }

    #[tokio::test]
    async fn test_missing_handler_fails_task() {
        let (executor, mut events) =
            executor(Scripted::new(Vec::new()), RetryPolicy::default()).await;
        let id = executor.submit(TaskType::PullIcon, json!({})).await.unwrap();

        assert!(matches!(
            finished(&mut events).await,
            TaskEvent::Finished { status: TaskStatus::Failure, task_id, .. } if task_id == id
        ));
    }

    #[tokio::test]
    async fn test_interrupted_tasks_requeued_on_start() {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let mut interrupted = TaskRecord::new(TaskType::PullFile, json!({}));
        interrupted.status = TaskStatus::Executing;
        db.insert_task(&interrupted).await.unwrap();
        let mut done = TaskRecord::new(TaskType::PullFile, json!({}));
        done.status = TaskStatus::Success;
        db.insert_task(&done).await.unwrap();

        let handler = Scripted::new(Vec::new());
        let mut handlers: HashMap<TaskType, Arc<dyn TaskHandler>> = HashMap::new();
        handlers.insert(TaskType::PullFile, handler.clone());
        let executor = TaskExecutor::start(db, RetryPolicy::default(), handlers)
            .await
            .unwrap();
        let mut events = executor.subscribe();

        // The requeued task may finish before we subscribe
        let task = loop {
            let task = executor.task(&interrupted.task_id).await.unwrap();
            if task.status.is_terminal() {
                break task;
            }
            let _ = tokio::time::timeout(Duration::from_millis(50), events.recv()).await;
        };
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails_eventually() {
        let (executor, _events) = executor(Scripted::new(Vec::new()), RetryPolicy::default()).await;
        executor.shutdown();
        // The consumer drops its receiver once it observes the cancellation
        let mut stopped = false;
        for _ in 0..50 {
            if matches!(executor.enqueue("late"), Err(TaskError::Stopped)) {
                stopped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(stopped);
    }
}
