/// Lexical optimization advisor.
///
/// Flags well-known anti-patterns in SQL text without executing it. The
/// `optimized_query` it produces is a textual substitution that callers must
/// review before running.
use std::fmt;

use serde::Serialize;

use super::lexer::{lex, Lexeme};
use super::profile::{QueryProfile, StatementType};
use crate::db::DatabaseType;
use crate::perf::complexity_from_lexemes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecommendationCategory {
    Performance,
    Memory,
    Security,
    DatabaseSpecific,
}

impl fmt::Display for RecommendationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecommendationCategory::Performance => write!(f, "Performance"),
            RecommendationCategory::Memory => write!(f, "Memory"),
            RecommendationCategory::Security => write!(f, "Security"),
            RecommendationCategory::DatabaseSpecific => write!(f, "Database-Specific"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Level {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationRecommendation {
    pub category: RecommendationCategory,
    pub description: String,
    pub impact: Level,
    pub effort: Level,
    pub recommendation: String,
}

impl OptimizationRecommendation {
    pub fn new(
        category: RecommendationCategory,
        description: &str,
        impact: Level,
        effort: Level,
        recommendation: &str,
    ) -> Self {
        Self {
            category,
            description: description.to_string(),
            impact,
            effort,
            recommendation: recommendation.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationReport {
    pub original_query: String,
    /// Heuristic substitution, not verified to be equivalent or safe.
    pub optimized_query: String,
    pub dialect: DatabaseType,
    pub profile: QueryProfile,
    pub recommendations: Vec<OptimizationRecommendation>,
    pub complexity_score: u32,
    pub estimated_improvement_percent: u32,
    pub estimated_memory_reduction_percent: u32,
    pub security_score: u32,
    pub overall_score: u32,
}

impl OptimizationReport {
    pub fn count(&self, category: RecommendationCategory) -> usize {
        self.recommendations
            .iter()
            .filter(|r| r.category == category)
            .count()
    }

    /// Add a recommendation and refresh the aggregate scores.
    pub fn push(&mut self, recommendation: OptimizationRecommendation) {
        self.recommendations.push(recommendation);
        self.rescore();
    }

    fn rescore(&mut self) {
        use RecommendationCategory::*;
        let perf = self.count(Performance) as u32;
        let mem = self.count(Memory) as u32;
        let sec = self.count(Security) as u32;

        self.estimated_improvement_percent = (perf * 15 + mem * 10).min(80);
        self.estimated_memory_reduction_percent = (mem * 20).min(60);
        self.security_score = 100u32.saturating_sub(sec * 10);
        self.overall_score = (self.estimated_improvement_percent
            + self.estimated_memory_reduction_percent
            + self.security_score)
            / 3;
    }
}

/// A single lexical rule: inspects the statement and may emit a recommendation.
trait Rule: Send + Sync {
    fn check(&self, ctx: &RuleContext<'_>) -> Option<OptimizationRecommendation>;
}

struct RuleContext<'a> {
    lexemes: &'a [Lexeme],
    profile: &'a QueryProfile,
    dialect: DatabaseType,
}

impl RuleContext<'_> {
    fn has_word(&self, word: &str) -> bool {
        self.lexemes.iter().any(|l| l.is_word(word))
    }
}

/// Runs the rule set over SQL text.
pub struct OptimizationAnalyzer {
    rules: Vec<Box<dyn Rule>>,
}

impl OptimizationAnalyzer {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(SelectStar),
                Box::new(CrossJoinWithoutWhere),
                Box::new(TooManyJoins),
                Box::new(LeadingWildcardLike),
                Box::new(NotInSubquery),
                Box::new(UnboundedResult),
                Box::new(DistinctWithJoins),
                Box::new(StringConcatenation),
                Box::new(UnguardedWrite),
                Box::new(NoLockHint),
                Box::new(OrderByRand),
                Box::new(OracleRownum),
            ],
        }
    }

    pub fn analyze(&self, sql: &str, dialect: DatabaseType) -> OptimizationReport {
        let lexemes = lex(sql, Some(dialect));
        let profile = QueryProfile::from_lexemes(&lexemes);
        let ctx = RuleContext {
            lexemes: &lexemes,
            profile: &profile,
            dialect,
        };
        let recommendations = self.rules.iter().filter_map(|r| r.check(&ctx)).collect();

        let mut report = OptimizationReport {
            original_query: sql.to_string(),
            optimized_query: rewrite(sql, dialect),
            dialect,
            complexity_score: complexity_from_lexemes(&lexemes),
            profile,
            recommendations,
            estimated_improvement_percent: 0,
            estimated_memory_reduction_percent: 0,
            security_score: 100,
            overall_score: 0,
        };
        report.rescore();
        report
    }
}

impl Default for OptimizationAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

struct SelectStar;

impl Rule for SelectStar {
    fn check(&self, ctx: &RuleContext<'_>) -> Option<OptimizationRecommendation> {
        let lex = ctx.lexemes;
        let found = lex.iter().enumerate().any(|(i, l)| {
            if !l.is_word("SELECT") {
                return false;
            }
            let mut j = i + 1;
            while let Some(next) = lex.get(j) {
                match next {
                    Lexeme::Word(w) if w == "DISTINCT" || w == "ALL" => j += 1,
                    Lexeme::Word(w) if w == "TOP" => {
                        j += 1;
                        if lex.get(j).is_some_and(|l| l.is_symbol("(")) {
                            j += 3;
                        } else {
                            j += 1;
                        }
                        if lex.get(j).is_some_and(|l| l.is_word("PERCENT")) {
                            j += 1;
                        }
                    }
                    _ => break,
                }
            }
            lex.get(j).is_some_and(|l| l.is_symbol("*"))
        });
        found.then(|| {
            OptimizationRecommendation::new(
                RecommendationCategory::Performance,
                "SELECT * retrieves every column",
                Level::Medium,
                Level::Low,
                "List only the columns the caller needs to reduce I/O and allow covering indexes",
            )
        })
    }
}

struct CrossJoinWithoutWhere;

impl Rule for CrossJoinWithoutWhere {
    fn check(&self, ctx: &RuleContext<'_>) -> Option<OptimizationRecommendation> {
        (ctx.profile.joins.cross > 0 && !ctx.profile.has_where).then(|| {
            OptimizationRecommendation::new(
                RecommendationCategory::Performance,
                "CROSS JOIN without a WHERE clause produces a cartesian product",
                Level::High,
                Level::Medium,
                "Replace with an INNER JOIN on the relating columns or add a filtering WHERE clause",
            )
        })
    }
}

struct TooManyJoins;

impl Rule for TooManyJoins {
    fn check(&self, ctx: &RuleContext<'_>) -> Option<OptimizationRecommendation> {
        (ctx.profile.joins.total() > 3).then(|| {
            OptimizationRecommendation::new(
                RecommendationCategory::Performance,
                "Query joins more than three tables",
                Level::Medium,
                Level::High,
                "Verify indexes on every join column and consider staging intermediate results",
            )
        })
    }
}

struct LeadingWildcardLike;

impl Rule for LeadingWildcardLike {
    fn check(&self, ctx: &RuleContext<'_>) -> Option<OptimizationRecommendation> {
        let found = ctx.lexemes.windows(2).any(|w| {
            (w[0].is_word("LIKE") || w[0].is_word("ILIKE"))
                && matches!(&w[1], Lexeme::Str(s) if s.starts_with('%'))
        });
        found.then(|| {
            OptimizationRecommendation::new(
                RecommendationCategory::Performance,
                "LIKE pattern starts with a wildcard and cannot use an index",
                Level::Medium,
                Level::Medium,
                "Anchor the pattern at the start or use full-text search",
            )
        })
    }
}

struct NotInSubquery;

impl Rule for NotInSubquery {
    fn check(&self, ctx: &RuleContext<'_>) -> Option<OptimizationRecommendation> {
        let found = ctx.lexemes.windows(4).any(|w| {
            w[0].is_word("NOT") && w[1].is_word("IN") && w[2].is_symbol("(") && w[3].is_word("SELECT")
        });
        found.then(|| {
            OptimizationRecommendation::new(
                RecommendationCategory::Performance,
                "NOT IN with a subquery handles NULLs poorly and often prevents anti-join plans",
                Level::Medium,
                Level::Low,
                "Rewrite as NOT EXISTS with a correlated subquery",
            )
        })
    }
}

struct UnboundedResult;

impl Rule for UnboundedResult {
    fn check(&self, ctx: &RuleContext<'_>) -> Option<OptimizationRecommendation> {
        let p = ctx.profile;
        let unbounded = p.statement_type == StatementType::Select
            && ctx.has_word("FROM")
            && !p.has_where
            && !p.has_row_limit
            && !p.has_aggregation;
        unbounded.then(|| {
            OptimizationRecommendation::new(
                RecommendationCategory::Memory,
                "Result set is unbounded: no WHERE clause and no row limit",
                Level::Medium,
                Level::Low,
                "Add a filter or a row limit (LIMIT, TOP, FETCH FIRST) to cap memory use",
            )
        })
    }
}

struct DistinctWithJoins;

impl Rule for DistinctWithJoins {
    fn check(&self, ctx: &RuleContext<'_>) -> Option<OptimizationRecommendation> {
        (ctx.profile.has_distinct && ctx.profile.joins.total() > 0).then(|| {
            OptimizationRecommendation::new(
                RecommendationCategory::Memory,
                "DISTINCT over joined rows forces a large sort or hash",
                Level::Medium,
                Level::Medium,
                "Remove duplicate-producing joins or replace them with EXISTS",
            )
        })
    }
}

struct StringConcatenation;

impl Rule for StringConcatenation {
    fn check(&self, ctx: &RuleContext<'_>) -> Option<OptimizationRecommendation> {
        let has_literal = ctx.lexemes.iter().any(|l| matches!(l, Lexeme::Str(_)));
        let concatenates = ctx.lexemes.iter().any(|l| l.is_symbol("+") || l.is_symbol("||"))
            || ctx
                .lexemes
                .windows(2)
                .any(|w| w[0].is_word("CONCAT") && w[1].is_symbol("("));
        (has_literal && concatenates).then(|| {
            OptimizationRecommendation::new(
                RecommendationCategory::Security,
                "String literals are concatenated into the statement, a possible injection vector",
                Level::High,
                Level::Medium,
                "Use bound parameters instead of building SQL from strings",
            )
        })
    }
}

struct UnguardedWrite;

impl Rule for UnguardedWrite {
    fn check(&self, ctx: &RuleContext<'_>) -> Option<OptimizationRecommendation> {
        let kind = match ctx.profile.statement_type {
            StatementType::Delete => "DELETE",
            StatementType::Update => "UPDATE",
            _ => return None,
        };
        if ctx.profile.has_where {
            return None;
        }
        Some(OptimizationRecommendation {
            category: RecommendationCategory::Security,
            description: format!("{} without WHERE affects every row of the table", kind),
            impact: Level::High,
            effort: Level::Low,
            recommendation: "Add a WHERE clause that limits the affected rows".to_string(),
        })
    }
}

struct NoLockHint;

impl Rule for NoLockHint {
    fn check(&self, ctx: &RuleContext<'_>) -> Option<OptimizationRecommendation> {
        (ctx.dialect == DatabaseType::SqlServer && ctx.has_word("NOLOCK")).then(|| {
            OptimizationRecommendation::new(
                RecommendationCategory::DatabaseSpecific,
                "NOLOCK hint allows dirty reads",
                Level::Medium,
                Level::Low,
                "Remove NOLOCK and use READ COMMITTED SNAPSHOT isolation instead",
            )
        })
    }
}

struct OrderByRand;

impl Rule for OrderByRand {
    fn check(&self, ctx: &RuleContext<'_>) -> Option<OptimizationRecommendation> {
        let found = ctx.dialect == DatabaseType::MySql
            && ctx
                .lexemes
                .windows(4)
                .any(|w| w[0].is_word("ORDER") && w[1].is_word("BY") && w[2].is_word("RAND") && w[3].is_symbol("("));
        found.then(|| {
            OptimizationRecommendation::new(
                RecommendationCategory::DatabaseSpecific,
                "ORDER BY RAND() sorts the whole table",
                Level::High,
                Level::Medium,
                "Pick random keys in application code or sample with a key range",
            )
        })
    }
}

struct OracleRownum;

impl Rule for OracleRownum {
    fn check(&self, ctx: &RuleContext<'_>) -> Option<OptimizationRecommendation> {
        (ctx.dialect == DatabaseType::Oracle && ctx.has_word("ROWNUM")).then(|| {
            OptimizationRecommendation::new(
                RecommendationCategory::DatabaseSpecific,
                "ROWNUM is applied before ORDER BY",
                Level::Medium,
                Level::Low,
                "Use FETCH FIRST n ROWS ONLY (12c and later)",
            )
        })
    }
}

/// Replace `SELECT *` with a column-list placeholder and strip SQL Server
/// NOLOCK hints. Text inside quotes is left untouched.
fn rewrite(sql: &str, dialect: DatabaseType) -> String {
    let mut out = replace_sequence(sql, &["SELECT", "*"], "SELECT <column_list>");
    if dialect == DatabaseType::SqlServer {
        out = remove_sequence(&out, &["WITH", "(", "NOLOCK", ")"]);
        out = remove_sequence(&out, &["(", "NOLOCK", ")"]);
    }
    out
}

/// Byte ranges outside quotes where `parts` appear in order, case
/// insensitive, separated only by whitespace.
fn find_sequence(sql: &str, parts: &[&str]) -> Vec<std::ops::Range<usize>> {
    let bytes = sql.as_bytes();
    let mut ranges = Vec::new();
    let mut i = 0;
    let mut quote: Option<u8> = None;

    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        if b == b'\'' || b == b'"' {
            quote = Some(b);
            i += 1;
            continue;
        }
        if let Some(end) = match_at(bytes, i, parts) {
            ranges.push(i..end);
            i = end;
        } else {
            i += 1;
        }
    }
    ranges
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn match_at(bytes: &[u8], start: usize, parts: &[&str]) -> Option<usize> {
    if start > 0 && is_word_byte(bytes[start - 1]) && is_word_byte(bytes[start]) {
        return None;
    }
    let mut pos = start;
    for (n, part) in parts.iter().enumerate() {
        if n > 0 {
            while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
                pos += 1;
            }
        }
        let end = pos + part.len();
        if end > bytes.len() || !bytes[pos..end].eq_ignore_ascii_case(part.as_bytes()) {
            return None;
        }
        let word_part = part.bytes().all(is_word_byte);
        if word_part && end < bytes.len() && is_word_byte(bytes[end]) {
            return None;
        }
        pos = end;
    }
    Some(pos)
}

fn replace_sequence(sql: &str, parts: &[&str], replacement: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for range in find_sequence(sql, parts) {
        out.push_str(&sql[last..range.start]);
        out.push_str(replacement);
        last = range.end;
    }
    out.push_str(&sql[last..]);
    out
}

/// Drop every occurrence of `parts` along with the spaces in front of it.
fn remove_sequence(sql: &str, parts: &[&str]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for range in find_sequence(sql, parts) {
        out.push_str(&sql[last..range.start]);
        out.truncate(out.trim_end_matches([' ', '\t']).len());
        last = range.end;
    }
    out.push_str(&sql[last..]);
    out
}
