use serde::{Serialize, Serializer};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::db::DbConnection;
use crate::error::{EngineError, Result};

/// A single result cell. NULL stays distinct from text until it is
/// serialized, where it becomes the literal `NULL`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Cell {
    Null,
    Text(String),
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Null => None,
            Cell::Text(s) => Some(s),
        }
    }

    pub fn display(&self) -> &str {
        match self {
            Cell::Null => "NULL",
            Cell::Text(s) => s,
        }
    }
}

impl From<Option<String>> for Cell {
    fn from(value: Option<String>) -> Self {
        value.map(Cell::Text).unwrap_or(Cell::Null)
    }
}

impl Serialize for Cell {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.display())
    }
}

/// Ordered header row plus equal-length data rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TabularResult {
    headers: Vec<String>,
    rows: Vec<Vec<Cell>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rows_affected: Option<u64>,
}

impl TabularResult {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
            rows_affected: None,
        }
    }

    /// Result of a statement that returns no result set.
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            headers: Vec::new(),
            rows: Vec::new(),
            rows_affected: Some(rows_affected),
        }
    }

    /// Append a data row. Rows whose width differs from the header are
    /// rejected so the result is never ragged.
    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<()> {
        if row.len() != self.headers.len() {
            return Err(EngineError::execution(
                format!(
                    "row has {} cells but the result has {} columns",
                    row.len(),
                    self.headers.len()
                ),
                "",
            ));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn set_rows_affected(&mut self, rows_affected: Option<u64>) {
        self.rows_affected = rows_affected;
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.headers.len()
    }

    pub fn rows_affected(&self) -> Option<u64> {
        self.rows_affected
    }

    /// Rows flattened to text, NULL rendered as `NULL`.
    pub fn text_rows(&self) -> Vec<Vec<String>> {
        self.rows
            .iter()
            .map(|row| row.iter().map(|c| c.display().to_string()).collect())
            .collect()
    }
}

/// Time allowed after a deadline for cancelling the in-flight statement and
/// rolling back, before the session is given up on.
pub const ABORT_GRACE: Duration = Duration::from_secs(2);

/// Runs single statements against an open connection under a deadline.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    default_timeout: Duration,
}

impl QueryExecutor {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// The effective deadline: the command timeout from now, or the caller's
    /// absolute deadline when that comes first.
    pub fn deadline_for(&self, timeout: Option<Duration>, deadline: Option<Instant>) -> Instant {
        let command = Instant::now() + timeout.unwrap_or(self.default_timeout);
        match deadline {
            Some(d) if d < command => d,
            _ => command,
        }
    }

    /// Run one statement. The read loop is dropped when the deadline passes,
    /// so a timed-out call never yields a partial result, and the server is
    /// asked to cancel the statement before the timeout is reported.
    pub async fn run(
        &self,
        conn: &mut dyn DbConnection,
        sql: &str,
        deadline: Instant,
    ) -> Result<TabularResult> {
        let started = Instant::now();
        if started >= deadline {
            return Err(EngineError::timeout(sql, Duration::ZERO));
        }

        match tokio::time::timeout_at(deadline, conn.query(sql)).await {
            Ok(Ok(result)) => {
                debug!(
                    rows = result.row_count(),
                    columns = result.column_count(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "statement completed"
                );
                Ok(result)
            }
            Ok(Err(err)) => Err(attach_sql(err, sql)),
            Err(_) => {
                let elapsed = started.elapsed();
                cancel_in_flight(conn).await;
                Err(EngineError::timeout(sql, elapsed))
            }
        }
    }
}

async fn cancel_in_flight(conn: &mut dyn DbConnection) {
    match tokio::time::timeout(ABORT_GRACE, conn.cancel()).await {
        Ok(Ok(())) => debug!("cancelled timed-out statement"),
        Ok(Err(e)) => warn!(error = %e, "failed to cancel timed-out statement"),
        Err(_) => warn!("cancel request for timed-out statement did not complete"),
    }
}

/// Drivers may not know the statement text; fill it in for execution errors.
fn attach_sql(err: EngineError, sql: &str) -> EngineError {
    match err {
        EngineError::Execution {
            message,
            sql: existing,
            category,
            code,
        } if existing.is_empty() => EngineError::Execution {
            message,
            sql: crate::error::sql_excerpt(sql),
            category,
            code,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::FakeDriver;
    use crate::db::{DatabaseType, Driver};

    async fn fake_connection() -> (FakeDriver, Box<dyn DbConnection>) {
        let driver = FakeDriver::new(DatabaseType::PostgreSql);
        let conn = driver.connect("fake://db").await.unwrap();
        (driver, conn)
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[test]
    fn test_null_display() {
        assert_eq!(Cell::Null.display(), "NULL");
        assert_eq!(Cell::text("NULL").display(), "NULL");
        assert!(Cell::Null.is_null());
        assert!(!Cell::text("NULL").is_null());
    }

    #[test]
    fn test_cell_serializes_as_text() {
        let row = vec![Cell::Null, Cell::text("x")];
        assert_eq!(serde_json::to_string(&row).unwrap(), r#"["NULL","x"]"#);
    }

    #[test]
    fn test_push_row_rejects_ragged_rows() {
        let mut r = TabularResult::new(vec!["a".into(), "b".into()]);
        r.push_row(vec![Cell::text("1"), Cell::Null]).unwrap();
        assert!(r.push_row(vec![Cell::text("1")]).is_err());
        assert_eq!(r.row_count(), 1);
    }

    #[test]
    fn test_text_rows() {
        let mut r = TabularResult::new(vec!["a".into()]);
        r.push_row(vec![Cell::Null]).unwrap();
        assert_eq!(r.text_rows(), vec![vec!["NULL".to_string()]]);
    }

    #[test]
    fn test_deadline_prefers_earlier() {
        let exec = QueryExecutor::new(Duration::from_secs(30));
        let soon = Instant::now() + Duration::from_secs(1);
        assert_eq!(exec.deadline_for(None, Some(soon)), soon);
        let later = Instant::now() + Duration::from_secs(300);
        assert!(exec.deadline_for(Some(Duration::from_secs(5)), Some(later)) < later);
    }

    #[tokio::test]
    async fn test_header_only_result() {
        let (_driver, mut conn) = fake_connection().await;
        let exec = QueryExecutor::new(Duration::from_secs(30));
        let result = exec
            .run(conn.as_mut(), "SELECT * FROM empty", deadline())
            .await
            .unwrap();
        assert_eq!(result.headers(), ["id", "name"]);
        assert_eq!(result.row_count(), 0);
    }

    #[tokio::test]
    async fn test_rows_match_header_width() {
        let (_driver, mut conn) = fake_connection().await;
        let exec = QueryExecutor::new(Duration::from_secs(30));
        let result = exec
            .run(conn.as_mut(), "SELECT * FROM nulls", deadline())
            .await
            .unwrap();
        assert_eq!(result.column_count(), 2);
        for row in result.rows() {
            assert_eq!(row.len(), result.column_count());
        }
        assert_eq!(result.rows()[0], vec![Cell::Null, Cell::text("NULL")]);
    }

    #[tokio::test]
    async fn test_driver_failure_is_execution_error() {
        let (_driver, mut conn) = fake_connection().await;
        let exec = QueryExecutor::new(Duration::from_secs(30));
        let err = exec
            .run(conn.as_mut(), "SELECT * FROM FAIL_missing", deadline())
            .await
            .unwrap_err();
        match err {
            EngineError::Execution { sql, message, .. } => {
                assert_eq!(sql, "SELECT * FROM FAIL_missing");
                assert!(message.contains("does not exist"));
            }
            other => panic!("expected execution error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry_is_timeout() {
        let (driver, mut conn) = fake_connection().await;
        let exec = QueryExecutor::new(Duration::from_secs(30));
        let deadline = Instant::now() + Duration::from_secs(1);
        let err = exec
            .run(conn.as_mut(), "SELECT pg_sleep(10)", deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }));
        assert_eq!(driver.cancels(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_deadline_skips_execution() {
        let (driver, mut conn) = fake_connection().await;
        let exec = QueryExecutor::new(Duration::from_secs(30));
        let deadline = Instant::now();
        tokio::time::advance(Duration::from_millis(10)).await;
        let err = exec
            .run(conn.as_mut(), "INSERT INTO items VALUES ('a')", deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }));
        assert!(driver.executed().is_empty());
        assert_eq!(driver.cancels(), 0);
    }
}
