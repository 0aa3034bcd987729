use serde::Serialize;

use super::lexer::{count_subqueries, has_cte, has_word_pair, leading_keyword, Lexeme};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatementType {
    Select,
    Insert,
    Update,
    Delete,
    Merge,
    Create,
    Alter,
    Drop,
    Truncate,
    Execute,
    Other,
}

impl StatementType {
    fn from_keyword(keyword: Option<&str>) -> Self {
        match keyword {
            Some("SELECT") | Some("VALUES") | Some("SHOW") | Some("EXPLAIN") | Some("TABLE") => {
                StatementType::Select
            }
            Some("INSERT") => StatementType::Insert,
            Some("UPDATE") => StatementType::Update,
            Some("DELETE") => StatementType::Delete,
            Some("MERGE") => StatementType::Merge,
            Some("CREATE") => StatementType::Create,
            Some("ALTER") => StatementType::Alter,
            Some("DROP") => StatementType::Drop,
            Some("TRUNCATE") => StatementType::Truncate,
            Some("EXEC") | Some("EXECUTE") | Some("CALL") => StatementType::Execute,
            _ => StatementType::Other,
        }
    }

    /// Statements whose results may be cached.
    pub fn is_read_only(&self) -> bool {
        matches!(self, StatementType::Select)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JoinCounts {
    pub inner: usize,
    pub left: usize,
    pub right: usize,
    pub full: usize,
    pub cross: usize,
}

impl JoinCounts {
    pub fn total(&self) -> usize {
        self.inner + self.left + self.right + self.full + self.cross
    }
}

/// Structural metadata about a statement, gathered lexically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryProfile {
    pub statement_type: StatementType,
    pub joins: JoinCounts,
    pub subquery_count: usize,
    pub has_aggregation: bool,
    pub has_window_functions: bool,
    pub has_cte: bool,
    pub has_distinct: bool,
    pub has_where: bool,
    pub has_group_by: bool,
    pub has_having: bool,
    pub has_order_by: bool,
    pub has_union: bool,
    /// LIMIT, TOP, FETCH FIRST/NEXT or ROWNUM.
    pub has_row_limit: bool,
}

const AGGREGATES: [&str; 7] = ["COUNT", "SUM", "AVG", "MIN", "MAX", "STRING_AGG", "ARRAY_AGG"];

impl QueryProfile {
    pub fn from_lexemes(lexemes: &[Lexeme]) -> Self {
        let mut joins = JoinCounts::default();
        for (i, lexeme) in lexemes.iter().enumerate() {
            if !lexeme.is_word("JOIN") {
                continue;
            }
            let mut prev = i.checked_sub(1).and_then(|p| lexemes.get(p));
            if prev.is_some_and(|l| l.is_word("OUTER")) {
                prev = i.checked_sub(2).and_then(|p| lexemes.get(p));
            }
            match prev {
                Some(l) if l.is_word("LEFT") => joins.left += 1,
                Some(l) if l.is_word("RIGHT") => joins.right += 1,
                Some(l) if l.is_word("FULL") => joins.full += 1,
                Some(l) if l.is_word("CROSS") => joins.cross += 1,
                _ => joins.inner += 1,
            }
        }
        // CROSS APPLY / OUTER APPLY behave like lateral joins
        joins.cross += lexemes
            .windows(2)
            .filter(|w| (w[0].is_word("CROSS") || w[0].is_word("OUTER")) && w[1].is_word("APPLY"))
            .count();

        let has_group_by = has_word_pair(lexemes, "GROUP", "BY");
        let has_aggregation = has_group_by
            || lexemes.windows(2).any(|w| {
                matches!(&w[0], Lexeme::Word(name) if AGGREGATES.contains(&name.as_str()))
                    && w[1].is_symbol("(")
            });
        let has_window_functions = lexemes
            .windows(2)
            .any(|w| w[0].is_word("OVER") && (w[1].is_symbol("(") || w[1].is_name()));

        let has_row_limit = lexemes.iter().any(|l| {
            l.is_word("LIMIT") || l.is_word("TOP") || l.is_word("ROWNUM")
        }) || has_word_pair(lexemes, "FETCH", "FIRST")
            || has_word_pair(lexemes, "FETCH", "NEXT");

        Self {
            statement_type: StatementType::from_keyword(leading_keyword(lexemes)),
            joins,
            subquery_count: count_subqueries(lexemes),
            has_aggregation,
            has_window_functions,
            has_cte: has_cte(lexemes),
            has_distinct: lexemes.iter().any(|l| l.is_word("DISTINCT")),
            has_where: lexemes.iter().any(|l| l.is_word("WHERE")),
            has_group_by,
            has_having: lexemes.iter().any(|l| l.is_word("HAVING")),
            has_order_by: has_word_pair(lexemes, "ORDER", "BY"),
            has_union: lexemes.iter().any(|l| l.is_word("UNION")),
            has_row_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::lexer::lex;

    fn profile(sql: &str) -> QueryProfile {
        QueryProfile::from_lexemes(&lex(sql, None))
    }

    #[test]
    fn test_simple_select() {
        let p = profile("SELECT * FROM users");
        assert_eq!(p.statement_type, StatementType::Select);
        assert_eq!(p.joins.total(), 0);
        assert!(!p.has_aggregation);
        assert!(!p.has_where);
    }

    #[test]
    fn test_join_variants() {
        let p = profile(
            "SELECT * FROM a JOIN b ON a.id = b.a_id \
             LEFT OUTER JOIN c ON b.id = c.b_id \
             RIGHT JOIN d ON d.id = a.id \
             FULL JOIN e ON e.id = a.id \
             CROSS JOIN f \
             INNER JOIN g ON g.id = a.id",
        );
        assert_eq!(
            p.joins,
            JoinCounts {
                inner: 2,
                left: 1,
                right: 1,
                full: 1,
                cross: 1
            }
        );
        assert_eq!(p.joins.total(), 6);
    }

    #[test]
    fn test_aggregation_and_window() {
        let p = profile("SELECT dept, COUNT(*) FROM emp");
        assert!(p.has_aggregation);
        assert!(!p.has_group_by);
        let p = profile("SELECT ROW_NUMBER() OVER (PARTITION BY dept ORDER BY id) FROM emp");
        assert!(p.has_window_functions);
        assert!(p.has_order_by);
    }

    #[test]
    fn test_cte_statement_type() {
        let p = profile("WITH cte AS (SELECT 1) SELECT * FROM cte");
        assert!(p.has_cte);
        assert_eq!(p.statement_type, StatementType::Select);
        assert_eq!(p.subquery_count, 1);

        let p = profile("WITH ins AS (INSERT INTO t (v) VALUES (1) RETURNING v) SELECT * FROM ins");
        assert_eq!(p.statement_type, StatementType::Insert);
        assert!(!p.statement_type.is_read_only());
    }

    #[test]
    fn test_dml_types() {
        assert_eq!(profile("delete from t").statement_type, StatementType::Delete);
        assert_eq!(profile("UPDATE t SET a = 1").statement_type, StatementType::Update);
        assert_eq!(profile("TRUNCATE TABLE t").statement_type, StatementType::Truncate);
        assert_eq!(profile("EXEC sp_who").statement_type, StatementType::Execute);
        assert!(!StatementType::Insert.is_read_only());
        assert!(StatementType::Select.is_read_only());
    }

    #[test]
    fn test_row_limits() {
        assert!(profile("SELECT TOP 10 * FROM t").has_row_limit);
        assert!(profile("SELECT * FROM t LIMIT 5").has_row_limit);
        assert!(profile("SELECT * FROM t FETCH FIRST 5 ROWS ONLY").has_row_limit);
        assert!(!profile("SELECT * FROM t").has_row_limit);
    }
}
