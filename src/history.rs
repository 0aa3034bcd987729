use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::db::DatabaseType;

/// Write-once record of one execution, handed to the audit collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub sql: String,
    /// Generating model, when the SQL came from a prompt.
    pub model: Option<String>,
    pub database_type: DatabaseType,
    pub execution_time_ms: u64,
    pub rows_returned: usize,
    pub success: bool,
    pub error: Option<String>,
    pub from_cache: bool,
    pub executed_at: DateTime<Utc>,
}

/// Receives a record after every execution. Storage is the sink's business.
pub trait HistorySink: Send + Sync {
    fn record(&self, record: HistoryRecord);
}

/// Bounded in-memory history, oldest entries dropped first.
pub struct QueryHistory {
    entries: Mutex<VecDeque<HistoryRecord>>,
    max_entries: usize,
}

impl QueryHistory {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_entries,
        }
    }

    pub fn entries(&self) -> Vec<HistoryRecord> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last(&self) -> Option<HistoryRecord> {
        self.entries.lock().back().cloned()
    }

    pub fn search(&self, query: &str) -> Vec<HistoryRecord> {
        let query_lower = query.to_lowercase();
        self.entries
            .lock()
            .iter()
            .filter(|e| e.sql.to_lowercase().contains(&query_lower))
            .cloned()
            .collect()
    }

    pub fn failures(&self) -> Vec<HistoryRecord> {
        self.entries
            .lock()
            .iter()
            .filter(|e| !e.success)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl HistorySink for QueryHistory {
    fn record(&self, record: HistoryRecord) {
        if self.max_entries == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        while entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(record);
    }
}
