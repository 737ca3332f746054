//! Async Task Runner
//!
//! Runs built operations on a bounded pool of workers and keeps their
//! status for the queue polling endpoint. Build happens in the caller so
//! that Busy, NotFound, Conflict and validation failures reject the request
//! before any task exists.

use crate::domain::ExecutorRef;
use crate::error::{Error, Result};
use crate::operations::{exec_and_settle, Operation, RetryPolicy};
use crate::store::Db;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tracing::{error, info, warn};

// =============================================================================
// Task Records
// =============================================================================

/// Where a submitted operation stands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Completed {
        #[serde(skip_serializing_if = "Option::is_none")]
        resource_url: Option<String>,
    },
    Failed {
        error: String,
    },
}

impl TaskStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, TaskStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub label: String,
    #[serde(flatten)]
    pub status: TaskStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct TaskRunnerConfig {
    /// Operations executing at the same time
    pub workers: usize,
    /// Pause before re-running a retryable operation
    pub retry_delay: Duration,
}

impl Default for TaskRunnerConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            retry_delay: Duration::from_secs(1),
        }
    }
}

// =============================================================================
// Task Runner
// =============================================================================

pub struct TaskRunner {
    db: Arc<Db>,
    executor: ExecutorRef,
    config: TaskRunnerConfig,
    permits: Semaphore,
    tasks: Mutex<HashMap<String, TaskRecord>>,
    notify: Notify,
}

impl TaskRunner {
    pub fn new(db: Arc<Db>, executor: ExecutorRef, config: TaskRunnerConfig) -> Arc<Self> {
        let permits = Semaphore::new(config.workers.max(1));
        Arc::new(Self {
            db,
            executor,
            config,
            permits,
            tasks: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        })
    }

    /// Build `op` and queue it; returns the task id
    pub fn submit(self: &Arc<Self>, mut op: Box<dyn Operation>) -> Result<String> {
        op.build()?;

        let id = op.id().to_string();
        self.tasks.lock().insert(
            id.clone(),
            TaskRecord {
                id: id.clone(),
                label: op.label().to_string(),
                status: TaskStatus::Pending,
                submitted_at: Utc::now(),
                finished_at: None,
            },
        );
        info!("Queued {} as task {}", op.label(), id);

        let runner = self.clone();
        tokio::spawn(async move { runner.run(op).await });
        Ok(id)
    }

    async fn run(self: Arc<Self>, mut op: Box<dyn Operation>) {
        let id = op.id().to_string();

        let result = match self.permits.acquire().await {
            Ok(_permit) => self.settle(op.as_mut()).await,
            Err(_) => Err(Error::Internal("task runner is closed".into())),
        };

        let status = match result {
            Ok(()) => TaskStatus::Completed {
                resource_url: op.resource_url(),
            },
            Err(e) => {
                error!("Task {} ({}) failed: {}", id, op.label(), e);
                TaskStatus::Failed {
                    error: e.to_string(),
                }
            }
        };

        if let Some(record) = self.tasks.lock().get_mut(&id) {
            record.status = status;
            record.finished_at = Some(Utc::now());
        }
        self.notify.notify_waiters();
    }

    /// Exec and settle, re-running retryable operations
    async fn settle(&self, op: &mut dyn Operation) -> Result<()> {
        let mut attempt = 1;
        loop {
            let err = match exec_and_settle(&self.db, op, self.executor.as_ref()).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            let may_retry = match op.retry_policy() {
                RetryPolicy::Retry { max_attempts } => attempt < max_attempts,
                RetryPolicy::NoRetries => false,
            };
            if !may_retry || !err.is_retryable() || !err.is_rollback_safe() {
                return Err(err);
            }

            attempt += 1;
            warn!(
                "Retrying {} (attempt {}) after: {}",
                op.label(),
                attempt,
                err
            );
            tokio::time::sleep(self.config.retry_delay).await;
            op.build()?;
        }
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.tasks.lock().get(id).map(|r| r.status.clone())
    }

    /// Status for the queue endpoint; final records are dropped once served
    pub fn take_status(&self, id: &str) -> Option<TaskStatus> {
        let mut tasks = self.tasks.lock();
        let status = tasks.get(id)?.status.clone();
        if status.is_final() {
            tasks.remove(id);
        }
        Some(status)
    }

    pub fn list(&self) -> Vec<TaskRecord> {
        let mut records: Vec<_> = self.tasks.lock().values().cloned().collect();
        records.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        records
    }

    /// Wait until the task reaches a final status
    pub async fn wait(&self, id: &str) -> Option<TaskStatus> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.status(id)? {
                TaskStatus::Pending => {}
                status => return Some(status),
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::BrickAllocator;
    use crate::domain::{Durability, GB};
    use crate::executor::{MockCall, MockExecutor};
    use crate::operations::testing::{cluster, pending_count};
    use crate::operations::VolumeCreateOperation;
    use crate::domain::Executor;
    use crate::store::{OperationType, PendingOperationEntry, PendingStatus, SnapshotSpec, VolumeEntry};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TB: u64 = 1024 * 1024 * GB;

    fn runner(db: Arc<Db>, exec: Arc<MockExecutor>) -> Arc<TaskRunner> {
        TaskRunner::new(
            db,
            exec,
            TaskRunnerConfig {
                workers: 2,
                retry_delay: Duration::from_millis(1),
            },
        )
    }

    fn create(db: &Arc<Db>, size: u64) -> Box<dyn Operation> {
        Box::new(VolumeCreateOperation::new(
            db.clone(),
            BrickAllocator::default(),
            VolumeEntry::new(None, size, Durability::Replicate { replica: 3 }, SnapshotSpec::default()),
            vec![],
        ))
    }

    #[tokio::test]
    async fn test_completed_task_reports_resource() {
        let (db, _) = cluster(3, 1, 6 * TB);
        let runner = runner(db.clone(), MockExecutor::new());

        let id = runner.submit(create(&db, 10)).unwrap();
        let status = runner.wait(&id).await.unwrap();

        assert_matches!(status, TaskStatus::Completed { resource_url: Some(ref url) } if url.starts_with("/volumes/"));
        assert!(runner.take_status(&id).is_some());
        assert!(runner.take_status(&id).is_none());
    }

    #[tokio::test]
    async fn test_wait_blocks_while_pending() {
        let (db, _) = cluster(3, 1, 6 * TB);
        let runner = runner(db.clone(), MockExecutor::new());

        let id = runner.submit(create(&db, 10)).unwrap();
        {
            // The worker has not been scheduled yet
            let mut waiting = tokio_test::task::spawn(runner.wait(&id));
            tokio_test::assert_pending!(waiting.poll());
        }
        assert_eq!(runner.status(&id), Some(TaskStatus::Pending));
        assert_eq!(runner.list().len(), 1);

        assert_matches!(runner.wait(&id).await, Some(TaskStatus::Completed { .. }));
        assert!(runner.list()[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn test_build_failure_is_returned_synchronously() {
        let (db, _) = cluster(3, 1, 10 * GB);
        let runner = runner(db.clone(), MockExecutor::new());

        assert_matches!(runner.submit(create(&db, 100)), Err(Error::NoSpace(_)));
        assert!(runner.list().is_empty());
    }

    #[tokio::test]
    async fn test_failed_task_keeps_error() {
        let (db, _) = cluster(3, 1, 6 * TB);
        let exec = MockExecutor::new();
        exec.fail_on(MockCall::VolumeCreate);
        let runner = runner(db.clone(), exec.clone());

        let id = runner.submit(create(&db, 10)).unwrap();
        let status = runner.wait(&id).await.unwrap();

        assert_matches!(status, TaskStatus::Failed { .. });
        assert_eq!(exec.calls(MockCall::VolumeCreate), 3);
        assert_eq!(pending_count(&db), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let (db, _) = cluster(3, 1, 6 * TB);
        let exec = MockExecutor::new();
        exec.fail_once(MockCall::VolumeCreate);
        let runner = runner(db.clone(), exec.clone());

        let id = runner.submit(create(&db, 10)).unwrap();
        assert_matches!(runner.wait(&id).await, Some(TaskStatus::Completed { .. }));
        assert_eq!(exec.calls(MockCall::VolumeCreate), 2);
    }

    /// Retryable operation whose Exec and Rollback always fail
    struct BrokenRollback {
        id: String,
        db: Arc<Db>,
        builds: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Operation for BrokenRollback {
        fn id(&self) -> &str {
            &self.id
        }

        fn label(&self) -> &'static str {
            "Broken Rollback"
        }

        fn resource_url(&self) -> Option<String> {
            None
        }

        fn retry_policy(&self) -> RetryPolicy {
            RetryPolicy::Retry { max_attempts: 3 }
        }

        fn build(&mut self) -> Result<()> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            let entry = PendingOperationEntry::with_id(&self.id, OperationType::CreateVolume);
            self.db.update(|tx| tx.put(&entry))
        }

        async fn exec(&mut self, _executor: &dyn Executor) -> Result<()> {
            Err(Error::executor("node0", "timed out"))
        }

        async fn rollback(&mut self, _executor: &dyn Executor) -> Result<()> {
            Err(Error::executor("node0", "still unreachable"))
        }

        fn finalize(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_rollback_is_not_retried() {
        let db = Db::in_memory();
        let builds = Arc::new(AtomicUsize::new(0));
        let runner = runner(db.clone(), MockExecutor::new());

        let op = BrokenRollback {
            id: crate::store::generate_id(),
            db: db.clone(),
            builds: builds.clone(),
        };
        let id = runner.submit(Box::new(op)).unwrap();

        assert_matches!(runner.wait(&id).await, Some(TaskStatus::Failed { ref error }) if error.contains("rollback failed"));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        let pending: Vec<PendingOperationEntry> =
            db.view(|tx| tx.list::<PendingOperationEntry>()).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, PendingStatus::Failed);
    }
}
