//! Row limit appending for read queries.

use crate::error::RlsError;
use crate::lexer::{self, TokenKind};

/// Add `LIMIT n` to a read query that has no top-level `LIMIT`/`FETCH`
/// in its final set operand. Other statements are returned unchanged.
/// The limit goes before a trailing `OFFSET` or locking clause, and a
/// trailing semicolon stays at the end.
pub fn append_limit(sql: &str, limit: u32) -> Result<String, RlsError> {
    let tokens = lexer::significant(lexer::tokenize(sql)?);
    let Some(first) = tokens.first() else {
        return Ok(sql.to_string());
    };
    let is_read = first.is_any_keyword(&["SELECT", "WITH"]) || first.kind == TokenKind::LParen;
    if !is_read {
        return Ok(sql.to_string());
    }

    let mut depth = 0usize;
    let mut has_limit = false;
    let mut tail = None;
    for token in &tokens {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth = depth.saturating_sub(1),
            _ if depth > 0 => {}
            _ if token.is_any_keyword(&["UNION", "INTERSECT", "EXCEPT", "MINUS"]) => {
                has_limit = false;
                tail = None;
            }
            _ if token.is_any_keyword(&["LIMIT", "FETCH", "TOP"]) => has_limit = true,
            _ if tail.is_none() && token.is_any_keyword(&["OFFSET", "FOR", "LOCK"]) => {
                tail = Some(token.start);
            }
            _ => {}
        }
    }
    if has_limit {
        return Ok(sql.to_string());
    }

    if let Some(at) = tail {
        return Ok(format!("{}LIMIT {} {}", &sql[..at], limit, &sql[at..]));
    }

    let Some(last) = tokens.iter().rev().find(|t| t.kind != TokenKind::Semicolon) else {
        return Ok(sql.to_string());
    };
    let at = last.end;
    Ok(format!("{} LIMIT {}{}", &sql[..at], limit, &sql[at..]))
}
