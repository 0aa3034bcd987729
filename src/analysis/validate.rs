//! Pre-execution guard against dangerous statements.
use super::lexer::{lex, split_statements, Lexeme};
use super::profile::{QueryProfile, StatementType};
use crate::db::DatabaseType;
use crate::error::{EngineError, Result};

/// Reject SQL matching a known dangerous pattern.
///
/// Lexical only: this narrows the blast radius of generated SQL, it does not
/// prove a statement safe.
pub fn validate(sql: &str, dialect: DatabaseType) -> Result<()> {
    let statements = split_statements(sql);
    if statements.is_empty() {
        return Err(EngineError::validation("empty statement", sql));
    }
    if statements.len() > 1 {
        return Err(EngineError::validation(
            format!("{} stacked statements; submit them as a batch", statements.len()),
            sql,
        ));
    }

    let lexemes = lex(sql, Some(dialect));
    let profile = QueryProfile::from_lexemes(&lexemes);

    match profile.statement_type {
        StatementType::Drop => return Err(EngineError::validation("DROP is not allowed", sql)),
        StatementType::Truncate => {
            return Err(EngineError::validation("TRUNCATE is not allowed", sql))
        }
        StatementType::Delete | StatementType::Update if !profile.has_where => {
            return Err(EngineError::validation(
                "DELETE or UPDATE without WHERE would affect every row",
                sql,
            ))
        }
        _ => {}
    }

    if let Some(reason) = injection_pattern(&lexemes) {
        return Err(EngineError::validation(reason, sql));
    }
    Ok(())
}

fn is_literal(lexeme: &Lexeme) -> bool {
    matches!(lexeme, Lexeme::Str(_) | Lexeme::Number(_))
}

fn injection_pattern(lexemes: &[Lexeme]) -> Option<&'static str> {
    // OR 1=1, OR 'a'='a'
    let tautology = lexemes.windows(4).any(|w| {
        w[0].is_word("OR") && is_literal(&w[1]) && w[2].is_symbol("=") && w[3] == w[1]
    });
    if tautology {
        return Some("always-true OR predicate");
    }

    let predicate = lexemes.iter().position(|l| l.is_word("WHERE"))?;
    let tail = &lexemes[predicate..];
    let concatenated = tail.windows(2).any(|w| {
        let joins = |l: &Lexeme| l.is_symbol("+") || l.is_symbol("||");
        (matches!(w[0], Lexeme::Str(_)) && joins(&w[1]))
            || (joins(&w[0]) && matches!(w[1], Lexeme::Str(_)))
            || (w[0].is_word("CONCAT") && w[1].is_symbol("("))
    });
    concatenated.then_some("string concatenation inside a predicate")
}
