//! Statement safety validation.
//!
//! Runs before anything else looks at the query:
//!
//! 1. Comments are stripped, so they can neither hide nor fake a statement
//! 2. More than one statement is rejected in every mode
//! 3. In the default mode only read verbs may start the statement and no
//!    mutating keyword may appear anywhere in it
//! 4. In privileged mode schema and grant changes are still rejected
//!
//! Keywords are matched against lexed word tokens only. Text inside string
//! literals and quoted identifiers never triggers a rejection.

use querygate_core::Operation;
use querygate_rls::{Token, TokenKind, lexer, strip_comments, tokenize};

use crate::error::AuthError;

/// Verbs a default-mode statement may start with.
const READ_VERBS: &[&str] = &["SELECT", "SHOW", "DESCRIBE", "DESC", "EXPLAIN"];

/// Keywords rejected anywhere in a default-mode statement.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    // Data changes
    "INSERT",
    "UPDATE",
    "DELETE",
    "REPLACE",
    "MERGE",
    // `SELECT ... INTO` creates tables
    "INTO",
    "COPY",
    // Schema changes
    "DROP",
    "ALTER",
    "CREATE",
    "TRUNCATE",
    // Procedures
    "EXEC",
    "EXECUTE",
    "CALL",
    // Privileges
    "GRANT",
    "REVOKE",
    // Transaction control
    "COMMIT",
    "ROLLBACK",
    "SAVEPOINT",
];

/// Keywords rejected even for operator-configured SQL.
const PRIVILEGED_FORBIDDEN: &[&str] = &["DROP", "TRUNCATE", "ALTER", "CREATE", "GRANT", "REVOKE"];

/// Validate that `sql` is a single statement allowed in the given mode.
///
/// Returns the comment-stripped SQL, which is what later stages consume.
/// Validating the returned text again yields the same verdict.
pub fn validate_safety(sql: &str, allow_all_ops: bool) -> Result<String, AuthError> {
    let cleaned = strip_comments(sql)?;
    if cleaned.is_empty() {
        return Err(AuthError::EmptyQuery);
    }

    let tokens = lexer::significant(tokenize(&cleaned)?);
    let statements = count_statements(&tokens);
    if statements == 0 {
        return Err(AuthError::EmptyQuery);
    }
    if statements > 1 {
        tracing::info!(statements, "Rejected stacked statements");
        return Err(AuthError::MultiStatementRejected { statements });
    }

    let words: Vec<&Token<'_>> = tokens.iter().filter(|t| t.kind == TokenKind::Word).collect();

    if allow_all_ops {
        if let Some(word) = words.iter().find(|t| t.is_any_keyword(PRIVILEGED_FORBIDDEN)) {
            return Err(AuthError::forbidden(word.text.to_ascii_uppercase()));
        }
        let verb = leading_verb(&tokens);
        if !verb.as_deref().is_some_and(|v| READ_VERBS.contains(&v)) {
            tracing::warn!(verb = ?verb, "Allowing non-read statement in privileged mode");
        }
        return Ok(cleaned);
    }

    match leading_verb(&tokens) {
        Some(verb) if READ_VERBS.contains(&verb.as_str()) => {}
        Some(verb) => return Err(AuthError::forbidden(verb)),
        None => return Err(AuthError::forbidden(first_text(&tokens))),
    }
    if let Some(word) = words.iter().find(|t| t.is_any_keyword(FORBIDDEN_KEYWORDS)) {
        return Err(AuthError::forbidden(word.text.to_ascii_uppercase()));
    }
    Ok(cleaned)
}

/// Operation a statement performs, for table-level grants.
///
/// Read verbs map to `select`. A `WITH` prefix is looked through to the
/// verb of the main statement.
pub fn statement_operation(sql: &str) -> Result<Operation, AuthError> {
    let tokens = lexer::significant(tokenize(sql)?);
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth = depth.saturating_sub(1),
            TokenKind::Word if depth == 0 => {
                if i == 0 && token.is_keyword("WITH") {
                    continue;
                }
                if i > 0 && !tokens[0].is_keyword("WITH") {
                    break;
                }
                if let Some(op) = verb_operation(token) {
                    return Ok(op);
                }
                if i == 0 {
                    break;
                }
            }
            _ => {}
        }
    }
    Ok(Operation::Select)
}

fn verb_operation(token: &Token<'_>) -> Option<Operation> {
    let verb = token.text.to_ascii_uppercase();
    match verb.as_str() {
        "SELECT" | "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" | "VALUES" | "TABLE" => {
            Some(Operation::Select)
        }
        "INSERT" | "REPLACE" => Some(Operation::Insert),
        "UPDATE" | "MERGE" => Some(Operation::Update),
        "DELETE" => Some(Operation::Delete),
        _ => None,
    }
}

fn count_statements(tokens: &[Token<'_>]) -> usize {
    tokens
        .split(|t| t.kind == TokenKind::Semicolon)
        .filter(|statement| !statement.is_empty())
        .count()
}

fn leading_verb(tokens: &[Token<'_>]) -> Option<String> {
    tokens
        .iter()
        .find(|t| t.kind != TokenKind::LParen)
        .filter(|t| t.kind == TokenKind::Word)
        .map(|t| t.text.to_ascii_uppercase())
}

fn first_text(tokens: &[Token<'_>]) -> String {
    tokens
        .first()
        .map(|t| t.text.to_string())
        .unwrap_or_default()
}
