//! Pending Operation Engine
//!
//! Every multi-step infrastructure change runs as an [`Operation`] with four
//! phases:
//!
//! - **Build**: one transaction validating the request, claiming entities
//!   and reserving capacity, and recording a pending operation entry
//! - **Exec**: executor calls, outside of any transaction
//! - **Finalize**: one transaction persisting the final state after Exec
//!   succeeded
//! - **Rollback**: one transaction undoing Build after Exec failed before
//!   the point of no return
//!
//! Failures past the point of no return leave the entry in place, marked
//! failed, with its claims intact.

pub mod bricks;
pub mod brick_remove;
pub mod brick_replace;
pub mod device_remove;
pub mod volume_create;
pub mod volume_delete;
pub mod volume_expand;
pub mod volume_migrate;

#[cfg(test)]
pub(crate) mod testing;

pub use brick_remove::*;
pub use brick_replace::*;
pub use device_remove::*;
pub use volume_create::*;
pub use volume_delete::*;
pub use volume_expand::*;
pub use volume_migrate::*;

use crate::domain::Executor;
use crate::error::{Error, Result};
use crate::store::{Db, PendingOperationEntry, PendingStatus};
use async_trait::async_trait;
use tracing::{error, info, info_span, warn, Instrument};

// =============================================================================
// Operation Trait
// =============================================================================

/// Whether the caller may re-run an operation after a failed Exec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    NoRetries,
    /// Roll back and run Build and Exec again, up to `max_attempts` in total
    Retry { max_attempts: u32 },
}

/// Lifecycle of one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    New,
    Built,
    Executed,
    Finalized,
    ExecFailed,
    RolledBack,
    /// Failed past the point of no return
    Failed,
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationState::New => "new",
            OperationState::Built => "built",
            OperationState::Executed => "executed",
            OperationState::Finalized => "finalized",
            OperationState::ExecFailed => "exec-failed",
            OperationState::RolledBack => "rolled-back",
            OperationState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// A multi-step change driven by the engine
#[async_trait]
pub trait Operation: Send + Sync {
    /// Id of the operation; also the id of its pending entry
    fn id(&self) -> &str;

    /// Human readable name used in logs and task listings
    fn label(&self) -> &'static str;

    /// URL of the resource the operation produced, if any
    fn resource_url(&self) -> Option<String>;

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::NoRetries
    }

    /// Claim entities, reserve capacity and record the pending entry
    fn build(&mut self) -> Result<()>;

    /// Drive the executor
    async fn exec(&mut self, executor: &dyn Executor) -> Result<()>;

    /// Undo Build after a rollback-safe Exec failure
    async fn rollback(&mut self, executor: &dyn Executor) -> Result<()>;

    /// Persist the outcome of a successful Exec
    fn finalize(&mut self) -> Result<()>;
}

// =============================================================================
// Engine
// =============================================================================

/// Build an operation and settle it
pub async fn run_operation(
    db: &Db,
    op: &mut dyn Operation,
    executor: &dyn Executor,
) -> Result<()> {
    op.build()?;
    exec_and_settle(db, op, executor).await
}

/// Run Exec on a built operation, then Finalize or Rollback
///
/// Returns the Exec error when Exec failed and Rollback succeeded. A failed
/// Rollback leaves state half undone: the entry is marked failed and the
/// error becomes [`Error::Unrecoverable`] so that nobody re-runs the
/// operation on top of it.
pub async fn exec_and_settle(
    db: &Db,
    op: &mut dyn Operation,
    executor: &dyn Executor,
) -> Result<()> {
    let span = info_span!("operation", op_id = %op.id(), label = op.label());

    async move {
        info!("Operation {}: {}", op.label(), OperationState::Built);

        match op.exec(executor).await {
            Ok(()) => {
                info!("Operation {}: {}", op.label(), OperationState::Executed);
                if let Err(e) = op.finalize() {
                    error!("Finalize of {} failed: {}", op.label(), e);
                    return Err(e);
                }
                info!("Operation {}: {}", op.label(), OperationState::Finalized);
                Ok(())
            }
            Err(e) if e.is_rollback_safe() => {
                warn!(
                    "Operation {}: {}: {}",
                    op.label(),
                    OperationState::ExecFailed,
                    e
                );
                match op.rollback(executor).await {
                    Ok(()) => {
                        info!("Operation {}: {}", op.label(), OperationState::RolledBack);
                        Err(e)
                    }
                    Err(rb) => {
                        error!("Rollback of {} failed: {}", op.label(), rb);
                        if let Err(mark) = mark_failed(db, op.id()) {
                            error!("Unable to mark operation {} failed: {}", op.id(), mark);
                        }
                        Err(Error::Unrecoverable {
                            operation: op.label().to_string(),
                            reason: format!("{}; rollback failed: {}", e, rb),
                        })
                    }
                }
            }
            Err(e) => {
                error!("Operation {}: {}: {}", op.label(), OperationState::Failed, e);
                if let Err(mark) = mark_failed(db, op.id()) {
                    error!("Unable to mark operation {} failed: {}", op.id(), mark);
                }
                Err(e)
            }
        }
    }
    .instrument(span)
    .await
}

/// Flag the pending entry for manual reconciliation, keeping every claim
fn mark_failed(db: &Db, op_id: &str) -> Result<()> {
    db.update(|tx| {
        if let Some(mut entry) = tx.try_get::<PendingOperationEntry>(op_id)? {
            entry.status = PendingStatus::Failed;
            tx.put(&entry)?;
        }
        Ok(())
    })
}

/// Delete the pending entry of a settled operation
pub(crate) fn remove_entry(tx: &mut crate::store::Tx<'_>, op_id: &str) -> Result<()> {
    if tx.contains::<PendingOperationEntry>(op_id) {
        tx.delete::<PendingOperationEntry>(op_id)?;
    }
    Ok(())
}

/// Treat an operation whose Exec ran out of options as unrecoverable
pub(crate) fn past_point_of_no_return(operation: &str, err: Error) -> Error {
    match err {
        Error::Unrecoverable { .. } => err,
        other => Error::Unrecoverable {
            operation: operation.to_string(),
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MockExecutor;
    use crate::store::OperationType;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    /// Records the phases it went through
    struct Scripted {
        id: String,
        db: Arc<Db>,
        exec_result: Option<Error>,
        rollback_result: Option<Error>,
        phases: Vec<&'static str>,
    }

    impl Scripted {
        fn new(db: Arc<Db>, exec_result: Option<Error>) -> Self {
            Self {
                id: crate::store::generate_id(),
                db,
                exec_result,
                rollback_result: None,
                phases: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl Operation for Scripted {
        fn id(&self) -> &str {
            &self.id
        }

        fn label(&self) -> &'static str {
            "Scripted"
        }

        fn resource_url(&self) -> Option<String> {
            None
        }

        fn build(&mut self) -> Result<()> {
            self.phases.push("build");
            let entry = PendingOperationEntry::with_id(&self.id, OperationType::Unknown);
            self.db.update(|tx| tx.put(&entry))
        }

        async fn exec(&mut self, _executor: &dyn Executor) -> Result<()> {
            self.phases.push("exec");
            match self.exec_result.take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn rollback(&mut self, _executor: &dyn Executor) -> Result<()> {
            self.phases.push("rollback");
            if let Some(e) = self.rollback_result.take() {
                return Err(e);
            }
            let id = self.id.clone();
            self.db.update(|tx| remove_entry(tx, &id))
        }

        fn finalize(&mut self) -> Result<()> {
            self.phases.push("finalize");
            let id = self.id.clone();
            self.db.update(|tx| remove_entry(tx, &id))
        }
    }

    fn pending(db: &Db) -> Vec<PendingOperationEntry> {
        db.view(|tx| tx.list::<PendingOperationEntry>()).unwrap()
    }

    #[tokio::test]
    async fn test_success_finalizes() {
        let db = Db::in_memory();
        let exec = MockExecutor::new();
        let mut op = Scripted::new(db.clone(), None);

        run_operation(&db, &mut op, exec.as_ref()).await.unwrap();

        assert_eq!(op.phases, vec!["build", "exec", "finalize"]);
        assert!(pending(&db).is_empty());
    }

    #[tokio::test]
    async fn test_rollback_safe_failure_rolls_back() {
        let db = Db::in_memory();
        let exec = MockExecutor::new();
        let mut op = Scripted::new(db.clone(), Some(Error::executor("h1", "boom")));

        let result = run_operation(&db, &mut op, exec.as_ref()).await;

        assert_matches!(result, Err(Error::Executor { .. }));
        assert_eq!(op.phases, vec!["build", "exec", "rollback"]);
        assert!(pending(&db).is_empty());
    }

    #[tokio::test]
    async fn test_failed_rollback_is_unrecoverable() {
        let db = Db::in_memory();
        let exec = MockExecutor::new();
        let mut op = Scripted::new(db.clone(), Some(Error::executor("h1", "boom")));
        op.rollback_result = Some(Error::Internal("disk full".into()));

        let result = run_operation(&db, &mut op, exec.as_ref()).await;

        assert_matches!(result, Err(Error::Unrecoverable { ref reason, .. }) if reason.contains("boom") && reason.contains("disk full"));
        assert_eq!(op.phases, vec!["build", "exec", "rollback"]);
        let entries = pending(&db);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, PendingStatus::Failed);
    }

    #[tokio::test]
    async fn test_unrecoverable_failure_keeps_entry() {
        let db = Db::in_memory();
        let exec = MockExecutor::new();
        let mut op = Scripted::new(
            db.clone(),
            Some(Error::Unrecoverable {
                operation: "Scripted".into(),
                reason: "diverged".into(),
            }),
        );

        let result = run_operation(&db, &mut op, exec.as_ref()).await;

        assert_matches!(result, Err(Error::Unrecoverable { .. }));
        assert_eq!(op.phases, vec!["build", "exec"]);
        let entries = pending(&db);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, PendingStatus::Failed);
    }

    #[test]
    fn test_point_of_no_return_wraps_once() {
        let err = past_point_of_no_return("Expand Volume", Error::executor("h", "x"));
        assert_matches!(err, Error::Unrecoverable { ref operation, .. } if operation == "Expand Volume");
        let again = past_point_of_no_return("Other", err);
        assert_matches!(again, Error::Unrecoverable { ref operation, .. } if operation == "Expand Volume");
    }
}
