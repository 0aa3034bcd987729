use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Longest SQL excerpt carried inside an error.
const SQL_EXCERPT_CHARS: usize = 200;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Categorized failure kinds reported by a driver while running SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Syntax errors (SQLSTATE class 42 - syntax_error, etc.)
    Syntax,
    /// Semantic errors (missing table/column, ambiguous reference)
    Semantic,
    /// Execution/runtime errors (division by zero, constraint violation)
    Execution,
    /// Transaction state errors (e.g., transaction aborted)
    Transaction,
    /// Connection/communication errors
    Connection,
    /// Unknown or unclassified errors
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Syntax => write!(f, "Syntax Error"),
            ErrorCategory::Semantic => write!(f, "Semantic Error"),
            ErrorCategory::Execution => write!(f, "Execution Error"),
            ErrorCategory::Transaction => write!(f, "Transaction Error"),
            ErrorCategory::Connection => write!(f, "Connection Error"),
            ErrorCategory::Unknown => write!(f, "Error"),
        }
    }
}

/// Categorize a SQLSTATE code into an ErrorCategory.
pub fn categorize_sqlstate(code: &str) -> ErrorCategory {
    if code.len() < 2 {
        return ErrorCategory::Unknown;
    }
    match &code[..2] {
        // 42601 = syntax_error; the rest of class 42 is undefined objects,
        // ambiguous references and privileges
        "42" if code == "42601" || code == "42000" => ErrorCategory::Syntax,
        "42" => ErrorCategory::Semantic,
        "22" | "23" | "53" | "54" | "55" | "57" => ErrorCategory::Execution,
        "25" | "40" => ErrorCategory::Transaction,
        "08" => ErrorCategory::Connection,
        _ => ErrorCategory::Unknown,
    }
}

/// Every failure the engine surfaces to its callers.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Unsupported dialect, missing driver or missing connection parameters.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The connection could not be opened or failed its health check.
    #[error("connection error: {0}")]
    Connection(String),

    /// The driver rejected or failed the statement.
    #[error("{category}: {message}")]
    Execution {
        message: String,
        sql: String,
        category: ErrorCategory,
        code: Option<String>,
    },

    /// The caller's deadline passed before the statement completed.
    #[error("query timed out after {elapsed_ms} ms: {sql}")]
    Timeout { sql: String, elapsed_ms: u64 },

    /// The statement was rejected before execution.
    #[error("validation error: {reason}")]
    Validation { reason: String, sql: String },
}

impl EngineError {
    pub fn execution(message: impl Into<String>, sql: &str) -> Self {
        EngineError::Execution {
            message: message.into(),
            sql: sql_excerpt(sql),
            category: ErrorCategory::Unknown,
            code: None,
        }
    }

    pub fn timeout(sql: &str, elapsed: Duration) -> Self {
        EngineError::Timeout {
            sql: sql_excerpt(sql),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn validation(reason: impl Into<String>, sql: &str) -> Self {
        EngineError::Validation {
            reason: reason.into(),
            sql: sql_excerpt(sql),
        }
    }

    /// Timeouts and lost connections leave the session in an unknown state,
    /// so they end a batch instead of being recorded against a single step.
    pub fn aborts_batch(&self) -> bool {
        matches!(
            self,
            EngineError::Timeout { .. } | EngineError::Connection(_)
        )
    }

    /// The SQL excerpt attached to this error, if any.
    pub fn sql(&self) -> Option<&str> {
        match self {
            EngineError::Execution { sql, .. }
            | EngineError::Timeout { sql, .. }
            | EngineError::Validation { sql, .. } => Some(sql),
            _ => None,
        }
    }
}

/// Truncate SQL text for inclusion in errors and log lines.
pub fn sql_excerpt(sql: &str) -> String {
    let trimmed = sql.trim();
    match trimmed.char_indices().nth(SQL_EXCERPT_CHARS) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
