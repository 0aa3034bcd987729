//! Execution instrumentation and heuristic scoring.
use std::future::Future;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Pid, System};
use tokio::time::Instant;

use crate::analysis::lexer::{has_cte, has_subquery, has_word_pair, lex, Lexeme};
use crate::db::TabularResult;
use crate::error::Result;

const MB: i64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionMetrics {
    pub execution_time_ms: u64,
    pub rows_returned: usize,
    pub columns_returned: usize,
    /// Change in process resident memory across the call. Advisory only:
    /// other tasks and allocator behaviour distort it.
    pub memory_delta_bytes: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub complexity_score: u32,
    pub estimated_cost: f64,
    pub performance_score: u32,
}

/// Weighted keyword presence, capped at 100.
pub fn complexity_score(sql: &str) -> u32 {
    complexity_from_lexemes(&lex(sql, None))
}

pub fn complexity_from_lexemes(lexemes: &[Lexeme]) -> u32 {
    let has = |word: &str| lexemes.iter().any(|l| l.is_word(word));
    let mut score = 0;
    if has("JOIN") {
        score += 10;
    }
    if has("WHERE") {
        score += 5;
    }
    if has_word_pair(lexemes, "GROUP", "BY") {
        score += 15;
    }
    if has_word_pair(lexemes, "ORDER", "BY") {
        score += 5;
    }
    if has("HAVING") {
        score += 10;
    }
    if has_subquery(lexemes) {
        score += 20;
    }
    if has("UNION") {
        score += 15;
    }
    if has_cte(lexemes) {
        score += 25;
    }
    score.min(100)
}

pub fn estimated_cost(complexity_score: u32, rows_returned: usize) -> f64 {
    1.0 + complexity_score as f64 * 0.1 + rows_returned as f64 * 0.001
}

pub fn performance_score(execution_time_ms: u64, memory_delta_bytes: i64, complexity_score: u32) -> u32 {
    let mut score: i64 = 100;

    score -= match execution_time_ms {
        t if t > 10_000 => 30,
        t if t > 5_000 => 20,
        t if t > 1_000 => 10,
        _ => 0,
    };
    score -= match memory_delta_bytes {
        m if m > 100 * MB => 20,
        m if m > 50 * MB => 10,
        _ => 0,
    };
    score -= match complexity_score {
        c if c > 50 => 15,
        c if c > 25 => 10,
        _ => 0,
    };

    score.clamp(0, 100) as u32
}

/// Best-effort resident memory of the current process.
struct MemorySampler {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl MemorySampler {
    fn new() -> Self {
        Self {
            pid: sysinfo::get_current_pid().ok(),
            system: Mutex::new(System::new()),
        }
    }

    fn resident_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock();
        system.refresh_process(pid);
        system.process(pid).map(|p| p.memory())
    }
}

/// Outcome of an instrumented call: metrics are produced even on failure.
#[derive(Debug)]
pub struct Instrumented {
    pub outcome: Result<TabularResult>,
    pub metrics: ExecutionMetrics,
}

pub struct PerformanceMonitor {
    sampler: MemorySampler,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self {
            sampler: MemorySampler::new(),
        }
    }

    /// Time `execution`, sample memory around it and score the statement.
    pub async fn instrument<F>(&self, sql: &str, execution: F) -> Instrumented
    where
        F: Future<Output = Result<TabularResult>>,
    {
        let memory_before = self.sampler.resident_bytes();
        let start_time = Utc::now();
        let started = Instant::now();

        let outcome = execution.await;

        let execution_time_ms = started.elapsed().as_millis() as u64;
        let end_time = Utc::now();
        let memory_delta_bytes = match (memory_before, self.sampler.resident_bytes()) {
            (Some(before), Some(after)) => after as i64 - before as i64,
            _ => 0,
        };

        let (rows_returned, columns_returned) = match &outcome {
            Ok(result) => (result.row_count(), result.column_count()),
            Err(_) => (0, 0),
        };
        let complexity = complexity_score(sql);

        Instrumented {
            metrics: ExecutionMetrics {
                execution_time_ms,
                rows_returned,
                columns_returned,
                memory_delta_bytes,
                start_time,
                end_time,
                complexity_score: complexity,
                estimated_cost: estimated_cost(complexity, rows_returned),
                performance_score: performance_score(execution_time_ms, memory_delta_bytes, complexity),
            },
            outcome,
        }
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}
