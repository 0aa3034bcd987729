//! Scripted in-memory driver used by the unit tests.
//!
//! Understands a handful of statements:
//! - `SELECT 1` / `SELECT 1 FROM DUAL`: probe, fails while the server is "down"
//! - `INSERT INTO items VALUES ('<v>')`: appends `<v>` (buffered inside a transaction)
//! - `WITH ... (INSERT INTO items VALUES ('<v>') ...) SELECT ...`: appends `<v>`
//!   and returns it as one row
//! - `SELECT * FROM items`: one `value` column with every committed value
//! - `SELECT * FROM empty`: header-only result
//! - `SELECT * FROM nulls`: one row holding a NULL and the text `NULL`
//! - `SELECT pg_sleep(<secs>)`: sleeps, then returns one row
//! - anything containing `FAIL`: execution error
//!
//! Inside a transaction a failed statement poisons it the way PostgreSQL
//! does: every later statement fails with 25P02 until ROLLBACK or
//! ROLLBACK TO SAVEPOINT.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::db::{Cell, DatabaseType, DbConnection, Driver, TabularResult, STEP_SAVEPOINT};
use crate::error::{EngineError, ErrorCategory, Result};

#[derive(Debug, Default)]
struct FakeState {
    committed: Vec<String>,
    executed: Vec<String>,
    connections_opened: usize,
    server_down: bool,
    refuse_connections: bool,
    fail_begin: bool,
    stall_rollback: bool,
    cancels: usize,
}

#[derive(Clone)]
pub struct FakeDriver {
    database_type: DatabaseType,
    state: Arc<Mutex<FakeState>>,
}

impl FakeDriver {
    pub fn new(database_type: DatabaseType) -> Self {
        Self {
            database_type,
            state: Arc::new(Mutex::new(FakeState::default())),
        }
    }

    pub fn committed(&self) -> Vec<String> {
        self.state.lock().committed.clone()
    }

    /// Every statement run through any connection, probes excluded.
    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    pub fn connections_opened(&self) -> usize {
        self.state.lock().connections_opened
    }

    pub fn set_server_down(&self, down: bool) {
        self.state.lock().server_down = down;
    }

    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    pub fn set_fail_begin(&self, fail: bool) {
        self.state.lock().fail_begin = fail;
    }

    /// Make ROLLBACK hang, like one queued behind a statement that ignores
    /// cancellation.
    pub fn set_stall_rollback(&self, stall: bool) {
        self.state.lock().stall_rollback = stall;
    }

    pub fn cancels(&self) -> usize {
        self.state.lock().cancels
    }
}

#[async_trait]
impl Driver for FakeDriver {
    fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    fn driver_name(&self) -> &'static str {
        "fake"
    }

    async fn connect(&self, _connection_string: &str) -> Result<Box<dyn DbConnection>> {
        let mut state = self.state.lock();
        if state.refuse_connections {
            return Err(EngineError::Connection("connection refused".to_string()));
        }
        state.connections_opened += 1;
        Ok(Box::new(FakeConnection {
            database_type: self.database_type,
            state: self.state.clone(),
            pending: None,
            savepoint: None,
            aborted: false,
        }))
    }
}

struct FakeConnection {
    database_type: DatabaseType,
    state: Arc<Mutex<FakeState>>,
    pending: Option<Vec<String>>,
    /// Pending length when the savepoint was taken.
    savepoint: Option<usize>,
    aborted: bool,
}

fn aborted_error() -> EngineError {
    EngineError::Execution {
        message: "current transaction is aborted, commands ignored until end of transaction block"
            .to_string(),
        sql: String::new(),
        category: ErrorCategory::Transaction,
        code: Some("25P02".to_string()),
    }
}

impl FakeConnection {
    fn control(&mut self, sql: &str) -> Result<()> {
        let trimmed = sql.trim();
        let dialect = self.database_type;
        let mut state = self.state.lock();
        state.executed.push(trimmed.to_string());
        if trimmed.eq_ignore_ascii_case(dialect.begin_sql()) {
            if state.fail_begin {
                return Err(EngineError::Connection("cannot begin transaction".into()));
            }
            self.pending = Some(Vec::new());
            self.aborted = false;
        } else if trimmed.eq_ignore_ascii_case(dialect.commit_sql()) {
            let pending = self.pending.take().unwrap_or_default();
            // committing an aborted transaction rolls it back
            if !std::mem::take(&mut self.aborted) {
                state.committed.extend(pending);
            }
        } else if trimmed.eq_ignore_ascii_case(dialect.rollback_sql()) {
            self.pending = None;
            self.savepoint = None;
            self.aborted = false;
        } else if trimmed.eq_ignore_ascii_case(&dialect.savepoint_sql(STEP_SAVEPOINT)) {
            if self.aborted {
                return Err(aborted_error());
            }
            self.savepoint = self.pending.as_ref().map(Vec::len);
        } else if trimmed.eq_ignore_ascii_case(&dialect.rollback_to_savepoint_sql(STEP_SAVEPOINT)) {
            let (Some(pending), Some(len)) = (self.pending.as_mut(), self.savepoint) else {
                return Err(EngineError::execution("savepoint does not exist", sql));
            };
            pending.truncate(len);
            self.aborted = false;
        } else if dialect
            .release_savepoint_sql(STEP_SAVEPOINT)
            .is_some_and(|release| trimmed.eq_ignore_ascii_case(&release))
        {
            if self.aborted {
                return Err(aborted_error());
            }
            self.savepoint = None;
        } else {
            return Err(EngineError::execution("unsupported control statement", sql));
        }
        Ok(())
    }
}

fn single(header: &str, value: &str) -> Result<TabularResult> {
    let mut result = TabularResult::new(vec![header.to_string()]);
    result.push_row(vec![Cell::text(value)])?;
    Ok(result)
}

#[async_trait]
impl DbConnection for FakeConnection {
    fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    fn is_closed(&self) -> bool {
        self.state.lock().server_down
    }

    async fn query(&mut self, sql: &str) -> Result<TabularResult> {
        let trimmed = sql.trim();
        let upper = trimmed.to_ascii_uppercase();

        if upper == self.database_type.probe_sql() {
            if self.state.lock().server_down {
                return Err(EngineError::Connection("server closed the connection".into()));
            }
            return single("?column?", "1");
        }

        self.state.lock().executed.push(trimmed.to_string());

        if self.aborted {
            return Err(aborted_error());
        }

        if upper.contains("FAIL") {
            if self.pending.is_some() {
                self.aborted = true;
            }
            return Err(EngineError::Execution {
                message: "relation \"missing\" does not exist".to_string(),
                sql: String::new(),
                category: ErrorCategory::Semantic,
                code: Some("42P01".to_string()),
            });
        }

        if let Some(rest) = upper.strip_prefix("SELECT PG_SLEEP(") {
            let secs: f64 = rest.trim_end_matches(')').trim().parse().unwrap_or(0.0);
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
            return single("pg_sleep", "");
        }

        let cte_insert = upper.starts_with("WITH") && upper.contains("(INSERT INTO ITEMS VALUES");
        if upper.starts_with("INSERT INTO ITEMS VALUES") || cte_insert {
            let value = trimmed
                .split('\'')
                .nth(1)
                .unwrap_or_default()
                .to_string();
            match self.pending.as_mut() {
                Some(pending) => pending.push(value.clone()),
                None => self.state.lock().committed.push(value.clone()),
            }
            if cte_insert {
                return single("value", &value);
            }
            return Ok(TabularResult::affected(1));
        }

        match upper.as_str() {
            "SELECT * FROM ITEMS" => {
                let mut values = self.state.lock().committed.clone();
                if let Some(pending) = &self.pending {
                    values.extend(pending.iter().cloned());
                }
                let mut result = TabularResult::new(vec!["value".to_string()]);
                for v in values {
                    result.push_row(vec![Cell::Text(v)])?;
                }
                Ok(result)
            }
            "SELECT * FROM EMPTY" => Ok(TabularResult::new(vec!["id".into(), "name".into()])),
            "SELECT * FROM NULLS" => {
                let mut result = TabularResult::new(vec!["a".into(), "b".into()]);
                result.push_row(vec![Cell::Null, Cell::text("NULL")])?;
                Ok(result)
            }
            _ => {
                if self.pending.is_some() {
                    self.aborted = true;
                }
                Err(EngineError::Execution {
                    message: "syntax error".to_string(),
                    sql: String::new(),
                    category: ErrorCategory::Syntax,
                    code: Some("42601".to_string()),
                })
            }
        }
    }

    async fn batch_execute(&mut self, sql: &str) -> Result<()> {
        let stall = self.state.lock().stall_rollback
            && sql.trim().eq_ignore_ascii_case(self.database_type.rollback_sql());
        if stall {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.control(sql)
    }

    async fn cancel(&mut self) -> Result<()> {
        self.state.lock().cancels += 1;
        Ok(())
    }
}
