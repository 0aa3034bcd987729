//! Benchmark suite for sqlpilot's lexical analysis pipeline.
//!
//! Benchmarks cover:
//! - Tokenizing (text to lexemes) per dialect
//! - Complexity scoring
//! - Full optimization analysis
//! - Pre-execution validation
//! - Script splitting
//!
//! Run with: `cargo bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sqlpilot::analysis::lexer::{lex, split_statements};
use sqlpilot::analysis::{validate, OptimizationAnalyzer};
use sqlpilot::perf::complexity_score;
use sqlpilot::DatabaseType;

// ---------------------------------------------------------------------------
// SQL test inputs organized by complexity
// ---------------------------------------------------------------------------

const SIMPLE_SELECT: &str = "SELECT * FROM users";

const SELECT_WITH_WHERE: &str =
    "SELECT id, name, email FROM users WHERE age > 18 AND status = 'active'";

const SELECT_WITH_JOIN: &str = "SELECT u.name, o.total, o.created_at \
    FROM users u \
    JOIN orders o ON u.id = o.user_id \
    WHERE o.total > 100.00 \
    ORDER BY o.created_at DESC \
    LIMIT 50";

const MULTI_JOIN: &str = "SELECT u.name, o.id, p.name AS product, oi.quantity \
    FROM users u \
    JOIN orders o ON u.id = o.user_id \
    JOIN order_items oi ON o.id = oi.order_id \
    JOIN products p ON oi.product_id = p.id \
    WHERE o.status = 'completed' AND u.active = true \
    ORDER BY o.created_at DESC";

const AGGREGATION: &str = "SELECT department, COUNT(*) AS emp_count, \
    AVG(salary) AS avg_salary, MAX(salary) AS max_salary, MIN(salary) AS min_salary \
    FROM employees \
    WHERE hire_date > '2020-01-01' \
    GROUP BY department \
    HAVING COUNT(*) > 5 \
    ORDER BY avg_salary DESC";

const CTE_QUERY: &str = "WITH active_users AS (\
        SELECT id, name, email FROM users WHERE status = 'active'\
    ), user_orders AS (\
        SELECT u.id, u.name, COUNT(o.id) AS order_count, SUM(o.total) AS total_spent \
        FROM active_users u \
        JOIN orders o ON u.id = o.user_id \
        GROUP BY u.id, u.name\
    ) \
    SELECT name, order_count, total_spent \
    FROM user_orders \
    WHERE total_spent > 1000 \
    ORDER BY total_spent DESC";

const WINDOW_FUNCTION: &str = "SELECT name, department, salary, \
    ROW_NUMBER() OVER (PARTITION BY department ORDER BY salary DESC) AS rank, \
    AVG(salary) OVER (PARTITION BY department) AS dept_avg, \
    SUM(salary) OVER (ORDER BY hire_date ROWS BETWEEN UNBOUNDED PRECEDING AND CURRENT ROW) AS running_total \
    FROM employees";

const SUBQUERY: &str = "SELECT u.name, u.email \
    FROM users u \
    WHERE u.id IN (SELECT DISTINCT user_id FROM orders WHERE total > 500) \
    AND u.department = (SELECT department FROM departments WHERE name = 'Engineering') \
    AND EXISTS (SELECT 1 FROM reviews r WHERE r.user_id = u.id AND r.rating > 4)";

const UNION_QUERY: &str = "SELECT id, name, 'customer' AS type FROM customers WHERE active = true \
    UNION ALL \
    SELECT id, name, 'supplier' AS type FROM suppliers WHERE active = true \
    UNION ALL \
    SELECT id, name, 'partner' AS type FROM partners WHERE active = true";

const INSERT_QUERY: &str =
    "INSERT INTO users (name, email, age, department) VALUES ('John Doe', 'john@example.com', 30, 'Engineering')";

const UPDATE_QUERY: &str = "UPDATE employees SET salary = salary * 1.10, \
    updated_at = CURRENT_TIMESTAMP \
    WHERE department = 'Engineering' AND performance_rating > 4";

const DELETE_QUERY: &str =
    "DELETE FROM sessions WHERE last_active < CURRENT_TIMESTAMP - INTERVAL '30 days'";

const CASE_EXPRESSION: &str = "SELECT name, \
    CASE \
        WHEN salary > 100000 THEN 'senior' \
        WHEN salary > 60000 THEN 'mid' \
        WHEN salary > 30000 THEN 'junior' \
        ELSE 'intern' \
    END AS level, \
    CASE department \
        WHEN 'Engineering' THEN 'tech' \
        WHEN 'Marketing' THEN 'business' \
        ELSE 'other' \
    END AS category \
    FROM employees";

const NOLOCK_QUERY: &str = "SELECT o.id, c.name FROM orders o WITH (NOLOCK) \
    JOIN customers c WITH (NOLOCK) ON c.id = o.customer_id \
    WHERE o.created_at > '2024-01-01'";

const CASES: [(&str, &str); 13] = [
    ("simple_select", SIMPLE_SELECT),
    ("select_where", SELECT_WITH_WHERE),
    ("select_join", SELECT_WITH_JOIN),
    ("multi_join", MULTI_JOIN),
    ("aggregation", AGGREGATION),
    ("cte", CTE_QUERY),
    ("window_function", WINDOW_FUNCTION),
    ("subquery", SUBQUERY),
    ("union", UNION_QUERY),
    ("insert", INSERT_QUERY),
    ("update", UPDATE_QUERY),
    ("delete", DELETE_QUERY),
    ("case_expression", CASE_EXPRESSION),
];

// ---------------------------------------------------------------------------
// Benchmark groups
// ---------------------------------------------------------------------------

fn bench_lexing(c: &mut Criterion) {
    let mut group = c.benchmark_group("lexing");

    for (name, sql) in &CASES {
        group.bench_with_input(BenchmarkId::new("lex", name), sql, |b, sql| {
            b.iter(|| lex(black_box(sql), Some(DatabaseType::PostgreSql)));
        });
    }

    for dialect in DatabaseType::ALL {
        group.bench_with_input(
            BenchmarkId::new("lex_dialect", dialect.name()),
            &dialect,
            |b, dialect| {
                b.iter(|| lex(black_box(MULTI_JOIN), Some(*dialect)));
            },
        );
    }

    group.finish();
}

fn bench_complexity(c: &mut Criterion) {
    let mut group = c.benchmark_group("complexity");

    for (name, sql) in &CASES {
        group.bench_with_input(BenchmarkId::new("score", name), sql, |b, sql| {
            b.iter(|| complexity_score(black_box(sql)));
        });
    }

    group.finish();
}

fn bench_analysis(c: &mut Criterion) {
    let mut group = c.benchmark_group("analysis");

    let analyzer = OptimizationAnalyzer::new();

    for (name, sql) in &CASES {
        group.bench_with_input(BenchmarkId::new("analyze", name), sql, |b, sql| {
            b.iter(|| analyzer.analyze(black_box(sql), DatabaseType::PostgreSql));
        });
    }

    group.bench_function("analyze_nolock_sqlserver", |b| {
        b.iter(|| analyzer.analyze(black_box(NOLOCK_QUERY), DatabaseType::SqlServer));
    });

    group.finish();
}

fn bench_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("validation");

    for (name, sql) in &CASES {
        group.bench_with_input(BenchmarkId::new("validate", name), sql, |b, sql| {
            b.iter(|| validate(black_box(sql), DatabaseType::PostgreSql).is_ok());
        });
    }

    group.finish();
}

fn bench_multi_statement(c: &mut Criterion) {
    let mut group = c.benchmark_group("multi_statement");

    let two_stmts = format!("{}; {}", SIMPLE_SELECT, SELECT_WITH_WHERE);
    let five_stmts = format!(
        "{}; {}; {}; {}; {}",
        SIMPLE_SELECT, SELECT_WITH_WHERE, INSERT_QUERY, UPDATE_QUERY, DELETE_QUERY
    );

    group.bench_function("split_2_statements", |b| {
        b.iter(|| split_statements(black_box(&two_stmts)));
    });

    group.bench_function("split_5_statements", |b| {
        b.iter(|| split_statements(black_box(&five_stmts)));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_lexing,
    bench_complexity,
    bench_analysis,
    bench_validation,
    bench_multi_statement,
);
criterion_main!(benches);
