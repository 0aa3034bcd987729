/// Lexical view of SQL text.
///
/// Built on the `sqlparser` tokenizer for the target dialect, so keywords
/// inside string literals, quoted identifiers and comments are never
/// mistaken for clauses. Text the tokenizer rejects (an unterminated quote,
/// for instance) falls back to a plain character scan.
use sqlparser::ast::DollarQuotedString;
use sqlparser::dialect::{
    Dialect, GenericDialect, MsSqlDialect, MySqlDialect, PostgreSqlDialect,
};
use sqlparser::tokenizer::{Token, Tokenizer};

use crate::db::DatabaseType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lexeme {
    /// Unquoted word, upper-cased.
    Word(String),
    /// Quoted identifier, verbatim.
    Ident(String),
    /// String literal contents.
    Str(String),
    Number(String),
    /// Operators and punctuation.
    Symbol(String),
}

impl Lexeme {
    pub fn is_word(&self, word: &str) -> bool {
        matches!(self, Lexeme::Word(w) if w == word)
    }

    pub fn is_symbol(&self, symbol: &str) -> bool {
        matches!(self, Lexeme::Symbol(s) if s == symbol)
    }

    pub fn is_name(&self) -> bool {
        matches!(self, Lexeme::Word(_) | Lexeme::Ident(_))
    }
}

fn dialect_for(database_type: Option<DatabaseType>) -> Box<dyn Dialect> {
    match database_type {
        Some(DatabaseType::PostgreSql) => Box::new(PostgreSqlDialect {}),
        Some(DatabaseType::MySql) => Box::new(MySqlDialect {}),
        Some(DatabaseType::SqlServer) => Box::new(MsSqlDialect {}),
        Some(DatabaseType::Oracle) | None => Box::new(GenericDialect {}),
    }
}

/// Tokenize SQL for the given dialect, or dialect-neutral when `None`.
pub fn lex(sql: &str, database_type: Option<DatabaseType>) -> Vec<Lexeme> {
    let dialect = dialect_for(database_type);
    match Tokenizer::new(dialect.as_ref(), sql).tokenize() {
        Ok(tokens) => tokens.into_iter().filter_map(convert).collect(),
        Err(_) => fallback_lex(sql),
    }
}

fn convert(token: Token) -> Option<Lexeme> {
    let lexeme = match token {
        Token::Whitespace(_) | Token::EOF => return None,
        Token::Word(w) if w.quote_style.is_none() => Lexeme::Word(w.value.to_ascii_uppercase()),
        Token::Word(w) => Lexeme::Ident(w.value),
        Token::SingleQuotedString(s)
        | Token::NationalStringLiteral(s)
        | Token::EscapedStringLiteral(s)
        | Token::DollarQuotedString(DollarQuotedString { value: s, .. }) => {
            Lexeme::Str(s)
        }
        Token::Number(n, _) => Lexeme::Number(n),
        other => Lexeme::Symbol(other.to_string()),
    };
    Some(lexeme)
}

fn fallback_lex(sql: &str) -> Vec<Lexeme> {
    let mut out = Vec::new();
    let mut chars = sql.chars().peekable();
    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
        } else if ch == '\'' {
            chars.next();
            let mut literal = String::new();
            while let Some(c) = chars.next() {
                if c == '\'' {
                    if chars.peek() == Some(&'\'') {
                        chars.next();
                        literal.push('\'');
                        continue;
                    }
                    break;
                }
                literal.push(c);
            }
            out.push(Lexeme::Str(literal));
        } else if ch.is_alphanumeric() || ch == '_' {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_alphanumeric() || c == '_' || c == '$' {
                    word.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            if word.chars().all(|c| c.is_ascii_digit()) {
                out.push(Lexeme::Number(word));
            } else {
                out.push(Lexeme::Word(word.to_ascii_uppercase()));
            }
        } else {
            chars.next();
            if ch == '|' && chars.peek() == Some(&'|') {
                chars.next();
                out.push(Lexeme::Symbol("||".to_string()));
            } else {
                out.push(Lexeme::Symbol(ch.to_string()));
            }
        }
    }
    out
}

/// Split a script into statements at top-level semicolons.
///
/// Semicolons inside literals, quoted identifiers, comments and
/// dollar-quoted bodies (`$$ ... $$`, `$tag$ ... $tag$`) are kept.
pub fn split_statements(script: &str) -> Vec<String> {
    let chars: Vec<char> = script.chars().collect();
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        let end = match ch {
            '\'' | '"' | '`' => closing(&chars, i + 1, &[ch]),
            '[' => closing(&chars, i + 1, &[']']),
            '-' if chars.get(i + 1) == Some(&'-') => closing(&chars, i + 2, &['\n']),
            '/' if chars.get(i + 1) == Some(&'*') => closing(&chars, i + 2, &['*', '/']),
            '$' => match dollar_tag(&chars, i) {
                Some(tag) => closing(&chars, i + tag.len(), &tag),
                None => i + 1,
            },
            ';' => {
                let stmt = current.trim();
                if !stmt.is_empty() {
                    statements.push(stmt.to_string());
                }
                current.clear();
                i += 1;
                continue;
            }
            _ => i + 1,
        };
        current.extend(&chars[i..end]);
        i = end;
    }

    let tail = current.trim();
    if !tail.is_empty() {
        statements.push(tail.to_string());
    }
    statements
}

/// Index just past the first occurrence of `terminator` at or after `from`,
/// or the end of input when it never appears.
fn closing(chars: &[char], from: usize, terminator: &[char]) -> usize {
    let mut i = from;
    while i + terminator.len() <= chars.len() {
        if chars[i..i + terminator.len()] == *terminator {
            return i + terminator.len();
        }
        i += 1;
    }
    chars.len()
}

/// `$$` or `$tag$` opening at `start`. Positional parameters like `$1` are
/// not tags.
fn dollar_tag(chars: &[char], start: usize) -> Option<Vec<char>> {
    let mut j = start + 1;
    while let Some(&c) = chars.get(j) {
        if c == '$' {
            return Some(chars[start..=j].to_vec());
        }
        let valid = c == '_' || c.is_alphabetic() || (j > start + 1 && c.is_ascii_digit());
        if !valid {
            return None;
        }
        j += 1;
    }
    None
}

/// First depth-0 word after a leading CTE, or the first word otherwise.
///
/// A CTE whose body modifies data (`WITH ins AS (INSERT ...) SELECT ...`)
/// reports that modifying keyword, so the statement never reads as a plain
/// SELECT.
pub fn leading_keyword(lexemes: &[Lexeme]) -> Option<&str> {
    let first = match lexemes.iter().find(|l| !l.is_symbol("(")) {
        Some(Lexeme::Word(w)) => w.as_str(),
        _ => return None,
    };
    if first != "WITH" {
        return Some(first);
    }
    let mut depth = 0i32;
    let mut nested_write: Option<&str> = None;
    for lexeme in lexemes.iter().skip(1) {
        match lexeme {
            Lexeme::Symbol(s) if s == "(" => depth += 1,
            Lexeme::Symbol(s) if s == ")" => depth -= 1,
            Lexeme::Word(w) if depth > 0 && nested_write.is_none() && is_write_keyword(w) => {
                nested_write = Some(w.as_str());
            }
            Lexeme::Word(w) if depth == 0 && (w == "SELECT" || is_write_keyword(w)) => {
                return match nested_write {
                    Some(write) if w == "SELECT" => Some(write),
                    _ => Some(w.as_str()),
                };
            }
            _ => {}
        }
    }
    Some(nested_write.unwrap_or(first))
}

fn is_write_keyword(word: &str) -> bool {
    matches!(word, "INSERT" | "UPDATE" | "DELETE" | "MERGE")
}

/// True when a word is immediately followed by another word.
pub fn has_word_pair(lexemes: &[Lexeme], first: &str, second: &str) -> bool {
    lexemes
        .windows(2)
        .any(|w| w[0].is_word(first) && w[1].is_word(second))
}

/// True when `(` is directly followed by SELECT.
pub fn has_subquery(lexemes: &[Lexeme]) -> bool {
    count_subqueries(lexemes) > 0
}

pub fn count_subqueries(lexemes: &[Lexeme]) -> usize {
    lexemes
        .windows(2)
        .filter(|w| w[0].is_symbol("(") && w[1].is_word("SELECT"))
        .count()
}

/// `WITH [RECURSIVE] name [(cols)] AS (` anywhere in the text. Table hints
/// such as `WITH (NOLOCK)` do not count.
pub fn has_cte(lexemes: &[Lexeme]) -> bool {
    for (i, lexeme) in lexemes.iter().enumerate() {
        if !lexeme.is_word("WITH") {
            continue;
        }
        let mut j = i + 1;
        if lexemes.get(j).is_some_and(|l| l.is_word("RECURSIVE")) {
            j += 1;
        }
        if !lexemes.get(j).is_some_and(Lexeme::is_name) {
            continue;
        }
        j += 1;
        if lexemes.get(j).is_some_and(|l| l.is_symbol("(")) {
            let mut depth = 0i32;
            while let Some(l) = lexemes.get(j) {
                if l.is_symbol("(") {
                    depth += 1;
                } else if l.is_symbol(")") {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                j += 1;
            }
            j += 1;
        }
        if lexemes.get(j).is_some_and(|l| l.is_word("AS"))
            && lexemes.get(j + 1).is_some_and(|l| l.is_symbol("("))
        {
            return true;
        }
    }
    false
}
