use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::db::{DbConnection, QueryExecutor, TabularResult, ABORT_GRACE};
use crate::error::{EngineError, Result};

/// How a batch treats its transaction and failing steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub transactional: bool,
    pub rollback_on_failure: bool,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            transactional: true,
            rollback_on_failure: true,
        }
    }
}

/// One statement of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchStep {
    /// 1-based position in the submitted list.
    pub ordinal: usize,
    pub sql: String,
    pub result: Option<TabularResult>,
    pub success: bool,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionOutcome {
    NotUsed,
    Committed,
    RolledBack,
    RollbackFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub steps: Vec<BatchStep>,
    /// Statements submitted, attempted or not.
    pub total_steps: usize,
    pub successful_steps: usize,
    pub failed_steps: usize,
    pub is_successful: bool,
    pub execution_time_ms: u64,
    pub transaction: TransactionOutcome,
}

impl BatchResult {
    /// Statements never attempted because the batch stopped early.
    pub fn skipped_steps(&self) -> usize {
        self.total_steps - self.steps.len()
    }
}

/// Savepoint that isolates each step when a transactional batch continues
/// past failures.
pub const STEP_SAVEPOINT: &str = "sqlpilot_step";

/// Runs an ordered list of statements over one connection.
///
/// With `rollback_on_failure` the first failing step stops the batch and
/// the transaction is rolled back. Without it every statement is attempted
/// and the transaction commits only when all of them succeeded. Each step
/// then runs under a savepoint, so one failure does not poison the steps
/// after it.
#[derive(Debug, Clone)]
pub struct BatchTransactionCoordinator {
    executor: QueryExecutor,
}

impl BatchTransactionCoordinator {
    pub fn new(executor: QueryExecutor) -> Self {
        Self { executor }
    }

    pub async fn run_batch(
        &self,
        conn: &mut dyn DbConnection,
        statements: &[String],
        policy: BatchPolicy,
        deadline: Instant,
    ) -> Result<BatchResult> {
        let started = Instant::now();

        if policy.transactional {
            conn.begin().await.map_err(|e| {
                EngineError::Connection(format!("failed to begin transaction: {}", e))
            })?;
        }
        let isolate_steps = policy.transactional && !policy.rollback_on_failure;

        let mut steps = Vec::with_capacity(statements.len());
        for (idx, sql) in statements.iter().enumerate() {
            let ordinal = idx + 1;
            if isolate_steps {
                if let Err(e) = conn.savepoint(STEP_SAVEPOINT).await {
                    return Err(abort(conn, policy, ordinal, e).await);
                }
            }

            let step_started = Instant::now();
            let outcome = self.executor.run(conn, sql, deadline).await;
            let execution_time_ms = step_started.elapsed().as_millis() as u64;
            match outcome {
                Ok(result) => {
                    if isolate_steps {
                        if let Err(e) = conn.release_savepoint(STEP_SAVEPOINT).await {
                            return Err(abort(conn, policy, ordinal, e).await);
                        }
                    }
                    steps.push(BatchStep {
                        ordinal,
                        sql: sql.clone(),
                        result: Some(result),
                        success: true,
                        error: None,
                        execution_time_ms,
                    });
                }
                Err(err) if err.aborts_batch() => {
                    return Err(abort(conn, policy, ordinal, err).await);
                }
                Err(err) => {
                    debug!(step = ordinal, error = %err, "batch step failed");
                    if isolate_steps {
                        if let Err(e) = conn.rollback_to_savepoint(STEP_SAVEPOINT).await {
                            return Err(abort(conn, policy, ordinal, e).await);
                        }
                    }
                    steps.push(BatchStep {
                        ordinal,
                        sql: sql.clone(),
                        result: None,
                        success: false,
                        error: Some(err.to_string()),
                        execution_time_ms,
                    });
                    if policy.rollback_on_failure {
                        break;
                    }
                }
            }
        }

        let failed_steps = steps.iter().filter(|s| !s.success).count();
        let successful_steps = steps.len() - failed_steps;
        let rollback_until = deadline.max(Instant::now() + ABORT_GRACE);

        let transaction = if !policy.transactional {
            TransactionOutcome::NotUsed
        } else if failed_steps == 0 {
            if let Err(e) = conn.commit().await {
                rollback(conn, rollback_until).await;
                return Err(match e {
                    EngineError::Execution { message, sql, category, code } => {
                        EngineError::Execution {
                            message: format!("commit failed: {}", message),
                            sql,
                            category,
                            code,
                        }
                    }
                    other => other,
                });
            }
            TransactionOutcome::Committed
        } else {
            rollback(conn, rollback_until).await
        };

        Ok(BatchResult {
            total_steps: statements.len(),
            successful_steps,
            failed_steps,
            is_successful: failed_steps == 0,
            execution_time_ms: started.elapsed().as_millis() as u64,
            transaction,
            steps,
        })
    }
}

/// Give up on the batch. The rollback gets a short grace period of its own,
/// since the batch deadline may already have passed.
async fn abort(
    conn: &mut dyn DbConnection,
    policy: BatchPolicy,
    step: usize,
    err: EngineError,
) -> EngineError {
    warn!(step, error = %err, "batch aborted");
    if policy.transactional {
        rollback(conn, Instant::now() + ABORT_GRACE).await;
    }
    err
}

async fn rollback(conn: &mut dyn DbConnection, until: Instant) -> TransactionOutcome {
    match tokio::time::timeout_at(until, conn.rollback()).await {
        Ok(Ok(())) => TransactionOutcome::RolledBack,
        Ok(Err(e)) => {
            warn!(error = %e, "rollback failed");
            TransactionOutcome::RollbackFailed
        }
        Err(_) => {
            warn!("rollback did not complete in time");
            TransactionOutcome::RollbackFailed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::FakeDriver;
    use crate::db::{DatabaseType, Driver};
    use std::time::Duration;

    fn coordinator() -> BatchTransactionCoordinator {
        BatchTransactionCoordinator::new(QueryExecutor::new(Duration::from_secs(30)))
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    fn statements(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn middle_fails() -> Vec<String> {
        statements(&[
            "INSERT INTO items VALUES ('first')",
            "INSERT INTO FAIL_missing VALUES ('second')",
            "INSERT INTO items VALUES ('third')",
        ])
    }

    #[tokio::test]
    async fn test_all_steps_commit() {
        let driver = FakeDriver::new(DatabaseType::PostgreSql);
        let mut conn = driver.connect("fake").await.unwrap();
        let list = statements(&[
            "INSERT INTO items VALUES ('a')",
            "INSERT INTO items VALUES ('b')",
            "SELECT * FROM items",
        ]);

        let result = coordinator()
            .run_batch(conn.as_mut(), &list, BatchPolicy::default(), deadline())
            .await
            .unwrap();

        assert!(result.is_successful);
        assert_eq!(result.successful_steps, 3);
        assert_eq!(result.transaction, TransactionOutcome::Committed);
        let ordinals: Vec<usize> = result.steps.iter().map(|s| s.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2, 3]);
        // the read inside the transaction sees its own writes
        assert_eq!(result.steps[2].result.as_ref().unwrap().row_count(), 2);
        assert_eq!(driver.committed(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_rollback_on_failure_stops_and_discards() {
        let driver = FakeDriver::new(DatabaseType::PostgreSql);
        let mut conn = driver.connect("fake").await.unwrap();

        let result = coordinator()
            .run_batch(conn.as_mut(), &middle_fails(), BatchPolicy::default(), deadline())
            .await
            .unwrap();

        assert_eq!(result.total_steps, 3);
        assert_eq!(result.successful_steps, 1);
        assert_eq!(result.failed_steps, 1);
        assert_eq!(result.skipped_steps(), 1);
        assert!(!result.is_successful);
        assert_eq!(result.transaction, TransactionOutcome::RolledBack);
        assert!(!driver
            .executed()
            .iter()
            .any(|s| s.contains("'third'")));

        let read = conn.query("SELECT * FROM items").await.unwrap();
        assert_eq!(read.row_count(), 0);
        assert!(driver.committed().is_empty());
    }

    #[tokio::test]
    async fn test_continue_mode_attempts_everything_then_rolls_back() {
        let driver = FakeDriver::new(DatabaseType::PostgreSql);
        let mut conn = driver.connect("fake").await.unwrap();
        let policy = BatchPolicy {
            transactional: true,
            rollback_on_failure: false,
        };

        let result = coordinator()
            .run_batch(conn.as_mut(), &middle_fails(), policy, deadline())
            .await
            .unwrap();

        assert_eq!(result.steps.len(), 3);
        assert!(result.steps[0].success);
        assert!(!result.steps[1].success);
        assert!(result.steps[1].error.as_deref().unwrap().contains("does not exist"));
        assert!(result.steps[2].success);
        assert!(!result.is_successful);
        assert_eq!(result.successful_steps, 2);
        assert_eq!(result.transaction, TransactionOutcome::RolledBack);
        assert!(driver.committed().is_empty());
        assert!(driver
            .executed()
            .contains(&"ROLLBACK TO SAVEPOINT sqlpilot_step".to_string()));
    }

    #[tokio::test]
    async fn test_failed_step_does_not_poison_later_steps() {
        let driver = FakeDriver::new(DatabaseType::PostgreSql);
        let mut conn = driver.connect("fake").await.unwrap();
        let policy = BatchPolicy {
            transactional: true,
            rollback_on_failure: false,
        };
        let list = statements(&[
            "INSERT INTO items VALUES ('first')",
            "SELEC broken",
            "INSERT INTO items VALUES ('third')",
            "SELECT * FROM items",
        ]);

        let result = coordinator().run_batch(conn.as_mut(), &list, policy, deadline()).await.unwrap();

        assert_eq!(result.failed_steps, 1);
        assert!(result.steps[2].success, "{:?}", result.steps[2].error);
        // the failed step's savepoint was rolled back, the others were kept
        let read = result.steps[3].result.as_ref().unwrap();
        assert_eq!(read.text_rows(), vec![vec!["first".to_string()], vec!["third".to_string()]]);
        assert_eq!(result.transaction, TransactionOutcome::RolledBack);
    }

    #[tokio::test]
    async fn test_without_savepoints_a_failure_poisons_the_transaction() {
        let driver = FakeDriver::new(DatabaseType::PostgreSql);
        let mut conn = driver.connect("fake").await.unwrap();
        conn.begin().await.unwrap();
        assert!(conn.query("SELEC broken").await.is_err());
        let err = conn.query("INSERT INTO items VALUES ('x')").await.unwrap_err();
        assert!(matches!(err, EngineError::Execution { code: Some(ref c), .. } if c == "25P02"));
    }

    #[tokio::test]
    async fn test_non_transactional_continue_keeps_successes() {
        let driver = FakeDriver::new(DatabaseType::PostgreSql);
        let mut conn = driver.connect("fake").await.unwrap();
        let policy = BatchPolicy {
            transactional: false,
            rollback_on_failure: false,
        };

        let result = coordinator()
            .run_batch(conn.as_mut(), &middle_fails(), policy, deadline())
            .await
            .unwrap();

        assert_eq!(result.transaction, TransactionOutcome::NotUsed);
        assert_eq!(result.failed_steps, 1);
        assert_eq!(driver.committed(), vec!["first", "third"]);
    }

    #[tokio::test]
    async fn test_begin_failure_is_connection_error() {
        let driver = FakeDriver::new(DatabaseType::SqlServer);
        driver.set_fail_begin(true);
        let mut conn = driver.connect("fake").await.unwrap();

        let err = coordinator()
            .run_batch(conn.as_mut(), &middle_fails(), BatchPolicy::default(), deadline())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Connection(_)));
        assert_eq!(driver.executed(), vec!["BEGIN TRANSACTION"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rolls_back() {
        let driver = FakeDriver::new(DatabaseType::PostgreSql);
        let mut conn = driver.connect("fake").await.unwrap();
        let list = statements(&[
            "INSERT INTO items VALUES ('a')",
            "SELECT pg_sleep(60)",
            "INSERT INTO items VALUES ('b')",
        ]);
        let deadline = Instant::now() + Duration::from_secs(2);

        let err = coordinator()
            .run_batch(conn.as_mut(), &list, BatchPolicy::default(), deadline)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Timeout { .. }));
        assert_eq!(driver.cancels(), 1);
        assert_eq!(driver.executed().last().map(String::as_str), Some("ROLLBACK"));
        assert!(driver.committed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_returns_promptly_when_rollback_stalls() {
        let driver = FakeDriver::new(DatabaseType::PostgreSql);
        driver.set_stall_rollback(true);
        let mut conn = driver.connect("fake").await.unwrap();
        let list = statements(&["INSERT INTO items VALUES ('a')", "SELECT pg_sleep(60)"]);
        let started = Instant::now();
        let deadline = started + Duration::from_secs(1);

        let err = coordinator()
            .run_batch(conn.as_mut(), &list, BatchPolicy::default(), deadline)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Timeout { .. }));
        assert_eq!(driver.cancels(), 1);
        assert!(started.elapsed() <= Duration::from_secs(1) + ABORT_GRACE);
        assert!(driver.committed().is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let driver = FakeDriver::new(DatabaseType::PostgreSql);
        let mut conn = driver.connect("fake").await.unwrap();
        let result = coordinator()
            .run_batch(conn.as_mut(), &[], BatchPolicy::default(), deadline())
            .await
            .unwrap();
        assert!(result.is_successful);
        assert_eq!(result.total_steps, 0);
        assert_eq!(result.transaction, TransactionOutcome::Committed);
    }
}
