//! The engine facade: pooling, caching, instrumentation and history around
//! single statements and batches.
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::analysis::lexer::lex;
use crate::analysis::{
    self, Level, OptimizationAnalyzer, OptimizationRecommendation, OptimizationReport,
    QueryProfile, RecommendationCategory,
};
use crate::cache::{BaselineStore, CacheKey, CacheStats, PerformanceBaseline, ResultCache};
use crate::config::EngineConfig;
use crate::db::{
    BatchPolicy, BatchResult, BatchTransactionCoordinator, ConnectionDescriptor,
    ConnectionPoolManager, DatabaseType, DriverRegistry, HealthProbe, HealthStatus,
    PooledHandle, PostgresDriver, QueryExecutor, TabularResult, TransactionOutcome,
};
use crate::error::{EngineError, Result};
use crate::generator::{complexity_level, SqlGenerator};
use crate::history::{HistoryRecord, HistorySink, QueryHistory};
use crate::perf::{ExecutionMetrics, Instrumented, PerformanceMonitor};

#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Command timeout; the configured default applies when unset.
    pub timeout: Option<Duration>,
    /// Absolute deadline. The earlier of this and the timeout wins.
    pub deadline: Option<Instant>,
    pub use_cache: bool,
    /// Overrides `validate_sql` from the config.
    pub validate: Option<bool>,
    /// Model that generated the SQL, recorded in history.
    pub model: Option<String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            deadline: None,
            use_cache: true,
            validate: None,
            model: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub transactional: bool,
    pub rollback_on_failure: bool,
    pub timeout: Option<Duration>,
    pub deadline: Option<Instant>,
    pub validate: Option<bool>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            transactional: true,
            rollback_on_failure: true,
            timeout: None,
            deadline: None,
            validate: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub result: TabularResult,
    /// Metrics of the execution that produced `result`; for a cache hit,
    /// those of the original run.
    pub metrics: ExecutionMetrics,
    pub from_cache: bool,
    pub cached_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptOutcome {
    pub sql: String,
    pub sql_from_cache: bool,
    pub report: OptimizationReport,
    pub outcome: QueryOutcome,
}

#[derive(Debug, Clone)]
struct CachedQuery {
    descriptor: ConnectionDescriptor,
    result: TabularResult,
    metrics: ExecutionMetrics,
}

/// Shared by every task issuing queries; all state is internally locked.
pub struct QueryEngine {
    config: EngineConfig,
    pool: ConnectionPoolManager,
    executor: QueryExecutor,
    batches: BatchTransactionCoordinator,
    monitor: PerformanceMonitor,
    analyzer: OptimizationAnalyzer,
    results: ResultCache<CachedQuery>,
    prompts: ResultCache<String>,
    baselines: BaselineStore,
    history: Arc<dyn HistorySink>,
}

impl QueryEngine {
    /// Engine with the built-in PostgreSQL driver and in-memory history.
    pub fn new(config: EngineConfig) -> Self {
        let drivers = DriverRegistry::new().with_driver(Arc::new(PostgresDriver::new(
            config.postgres.tls.clone(),
            config.connect_timeout(),
        )));
        let history = Arc::new(QueryHistory::new(config.history_max_entries));
        Self::with_drivers(config, drivers, history)
    }

    pub fn with_drivers(
        config: EngineConfig,
        drivers: DriverRegistry,
        history: Arc<dyn HistorySink>,
    ) -> Self {
        let executor = QueryExecutor::new(config.default_timeout());
        Self {
            pool: ConnectionPoolManager::new(
                drivers,
                HealthProbe::new(config.health_check_timeout()),
            ),
            batches: BatchTransactionCoordinator::new(executor.clone()),
            executor,
            monitor: PerformanceMonitor::new(),
            analyzer: OptimizationAnalyzer::new(),
            results: ResultCache::new(config.cache_ttl(), config.cache_capacity()),
            prompts: ResultCache::new(config.cache_ttl(), config.cache_capacity()),
            baselines: BaselineStore::new(config.baseline_capacity()),
            history,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPoolManager {
        &self.pool
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.results.stats()
    }

    pub fn baseline(&self, sql: &str) -> Option<PerformanceBaseline> {
        self.baselines.get(sql)
    }

    /// Drop every cached result, e.g. after an out-of-band schema change.
    pub fn clear_cache(&self) {
        self.results.clear();
        self.prompts.clear();
    }

    pub async fn execute_query(
        &self,
        descriptor: &ConnectionDescriptor,
        sql: &str,
        options: QueryOptions,
    ) -> Result<QueryOutcome> {
        let dialect = descriptor.database_type();
        if options.validate.unwrap_or(self.config.validate_sql) {
            if let Err(e) = analysis::validate(sql, dialect) {
                self.record(dialect, sql, options.model.as_deref(), None, Err(&e), false);
                return Err(e);
            }
        }

        let read_only = statement_profile(sql, dialect).statement_type.is_read_only();
        let key = CacheKey::for_query(descriptor, sql);
        if options.use_cache && read_only {
            if let Some(entry) = self.results.get(&key) {
                debug!(key = %key, "result cache hit");
                let outcome = QueryOutcome {
                    result: entry.value.result,
                    metrics: entry.value.metrics,
                    from_cache: true,
                    cached_at: Some(entry.cached_at),
                };
                self.record(dialect, sql, options.model.as_deref(), Some(&outcome.metrics), Ok(()), true);
                return Ok(outcome);
            }
        }

        let deadline = self.executor.deadline_for(options.timeout, options.deadline);
        let Instrumented { outcome, metrics } = match self.run_single(descriptor, sql, deadline).await {
            Ok(measured) => measured,
            Err(e) => {
                self.record(dialect, sql, options.model.as_deref(), None, Err(&e), false);
                return Err(e);
            }
        };

        match outcome {
            Ok(result) => {
                self.baselines
                    .record(sql, metrics.execution_time_ms, metrics.rows_returned);
                if !read_only {
                    self.invalidate_results(descriptor);
                } else if options.use_cache {
                    self.results.put(
                        key,
                        CachedQuery {
                            descriptor: descriptor.clone(),
                            result: result.clone(),
                            metrics: metrics.clone(),
                        },
                    );
                }
                self.record(dialect, sql, options.model.as_deref(), Some(&metrics), Ok(()), false);
                Ok(QueryOutcome {
                    result,
                    metrics,
                    from_cache: false,
                    cached_at: None,
                })
            }
            Err(e) => {
                self.record(dialect, sql, options.model.as_deref(), Some(&metrics), Err(&e), false);
                Err(e)
            }
        }
    }

    pub async fn execute_batch(
        &self,
        descriptor: &ConnectionDescriptor,
        statements: &[String],
        options: BatchOptions,
    ) -> Result<BatchResult> {
        let dialect = descriptor.database_type();
        let script = statements.join(";\n");
        if options.validate.unwrap_or(self.config.validate_sql) {
            for sql in statements {
                if let Err(e) = analysis::validate(sql, dialect) {
                    self.record(dialect, sql, None, None, Err(&e), false);
                    return Err(e);
                }
            }
        }

        let deadline = self.executor.deadline_for(options.timeout, options.deadline);
        let policy = BatchPolicy {
            transactional: options.transactional,
            rollback_on_failure: options.rollback_on_failure,
        };

        let outcome = match self.acquire(descriptor, &script, deadline).await {
            Ok(mut handle) => {
                let outcome = match handle.connection() {
                    Ok(conn) => self.batches.run_batch(conn, statements, policy, deadline).await,
                    Err(e) => Err(e),
                };
                let session_lost = match &outcome {
                    Ok(batch) => batch.transaction == TransactionOutcome::RollbackFailed,
                    Err(e) => e.aborts_batch(),
                };
                if session_lost {
                    handle.invalidate();
                }
                outcome
            }
            Err(e) => Err(e),
        };

        let writes = statements
            .iter()
            .any(|sql| !statement_profile(sql, dialect).statement_type.is_read_only());
        if writes {
            self.invalidate_results(descriptor);
        }

        match &outcome {
            Ok(batch) => {
                for step in &batch.steps {
                    let rows = step.result.as_ref().map_or(0, TabularResult::row_count);
                    if step.success {
                        self.baselines.record(&step.sql, step.execution_time_ms, rows);
                    }
                    self.history.record(HistoryRecord {
                        sql: step.sql.clone(),
                        model: None,
                        database_type: dialect,
                        execution_time_ms: step.execution_time_ms,
                        rows_returned: rows,
                        success: step.success,
                        error: step.error.clone(),
                        from_cache: false,
                        executed_at: Utc::now(),
                    });
                }
                info!(
                    steps = batch.total_steps,
                    failed = batch.failed_steps,
                    transaction = ?batch.transaction,
                    "batch finished"
                );
            }
            Err(e) => self.record(dialect, &script, None, None, Err(e), false),
        }
        outcome
    }

    /// Lexical analysis plus a warning when the statement's recorded
    /// average exceeds the slow-query threshold.
    pub fn analyze_query(&self, sql: &str, dialect: DatabaseType) -> OptimizationReport {
        let mut report = self.analyzer.analyze(sql, dialect);
        if let Some(baseline) = self.baselines.get(sql) {
            let threshold = self.config.slow_query_threshold_ms;
            if baseline.average_execution_time_ms > threshold as f64 {
                report.push(OptimizationRecommendation {
                    category: RecommendationCategory::Performance,
                    description: format!(
                        "Averages {:.0} ms over {} runs, above the {} ms slow-query threshold",
                        baseline.average_execution_time_ms, baseline.execution_count, threshold
                    ),
                    impact: Level::High,
                    effort: Level::Medium,
                    recommendation: "Review the execution plan and index the filtered and joined columns"
                        .to_string(),
                });
            }
        }
        report
    }

    pub async fn check_health(&self, descriptor: &ConnectionDescriptor) -> HealthStatus {
        let mut handle = match self.pool.acquire(descriptor).await {
            Ok(handle) => handle,
            Err(e) => return HealthStatus::unreachable(e.to_string()),
        };
        let status = match handle.connection() {
            Ok(conn) => self.pool.probe().check(conn).await,
            Err(e) => HealthStatus::unreachable(e.to_string()),
        };
        if !status.is_healthy() {
            handle.invalidate();
        }
        status
    }

    /// Translate a prompt to SQL, then validate, analyze and execute it.
    ///
    /// Generated SQL is cached per (prompt, model, service, complexity level)
    /// and is always validated, whatever the config says.
    pub async fn execute_prompt(
        &self,
        generator: &dyn SqlGenerator,
        prompt: &str,
        schema: &str,
        descriptor: &ConnectionDescriptor,
        options: QueryOptions,
    ) -> Result<PromptOutcome> {
        let dialect = descriptor.database_type();
        let key = CacheKey::for_prompt(
            prompt,
            generator.model(),
            generator.service_name(),
            complexity_level(prompt),
        );

        let (sql, sql_from_cache) = match self.prompts.get(&key) {
            Some(entry) => (entry.value, true),
            None => {
                let sql = generator.generate_sql(prompt, schema, dialect).await?;
                let sql = sql.trim().to_string();
                if let Err(e) = analysis::validate(&sql, dialect) {
                    self.record(dialect, &sql, Some(generator.model()), None, Err(&e), false);
                    return Err(e);
                }
                self.prompts.put(key, sql.clone());
                (sql, false)
            }
        };

        let report = self.analyze_query(&sql, dialect);
        let options = QueryOptions {
            validate: Some(true),
            model: Some(generator.model().to_string()),
            ..options
        };
        let outcome = self.execute_query(descriptor, &sql, options).await?;

        Ok(PromptOutcome {
            sql,
            sql_from_cache,
            report,
            outcome,
        })
    }

    async fn acquire(
        &self,
        descriptor: &ConnectionDescriptor,
        sql: &str,
        deadline: Instant,
    ) -> Result<PooledHandle> {
        let started = Instant::now();
        match tokio::time::timeout_at(deadline, self.pool.acquire(descriptor)).await {
            Ok(handle) => handle,
            Err(_) => Err(EngineError::timeout(sql, started.elapsed())),
        }
    }

    async fn run_single(
        &self,
        descriptor: &ConnectionDescriptor,
        sql: &str,
        deadline: Instant,
    ) -> Result<Instrumented> {
        let mut handle = self.acquire(descriptor, sql, deadline).await?;
        let conn = handle.connection()?;
        let measured = self
            .monitor
            .instrument(sql, self.executor.run(conn, sql, deadline))
            .await;
        if let Err(e) = &measured.outcome {
            if e.aborts_batch() {
                // the session state is unknown after a timeout or lost link
                handle.invalidate();
            }
        }
        Ok(measured)
    }

    fn invalidate_results(&self, descriptor: &ConnectionDescriptor) {
        let dropped = self.results.retain(|cached| cached.descriptor != *descriptor);
        if dropped > 0 {
            debug!(db = %descriptor.display_string(), dropped, "invalidated cached results");
        }
    }

    fn record(
        &self,
        database_type: DatabaseType,
        sql: &str,
        model: Option<&str>,
        metrics: Option<&ExecutionMetrics>,
        outcome: std::result::Result<(), &EngineError>,
        from_cache: bool,
    ) {
        self.history.record(HistoryRecord {
            sql: sql.to_string(),
            model: model.map(str::to_string),
            database_type,
            execution_time_ms: metrics.map_or(0, |m| m.execution_time_ms),
            rows_returned: metrics.map_or(0, |m| m.rows_returned),
            success: outcome.is_ok(),
            error: outcome.err().map(|e| e.to_string()),
            from_cache,
            executed_at: Utc::now(),
        });
    }
}

fn statement_profile(sql: &str, dialect: DatabaseType) -> QueryProfile {
    QueryProfile::from_lexemes(&lex(sql, Some(dialect)))
}
