//! SQL lexer.
//!
//! Splits SQL text into tokens that carry their byte span in the source.
//! Tokenization is done by `sqlparser`; this module maps its line/column
//! spans back to byte offsets and folds its token set into [`TokenKind`].
//!
//! Dialects disagree on where some tokens end: MySQL honours backslash
//! escapes and `#` line comments and does not nest block comments, while
//! PostgreSQL nests them. [`tokenize`] reads the text as generic SQL and
//! as MySQL, compares comment spans against PostgreSQL, and rejects it
//! with [`RlsError::Ambiguous`] when the readings differ.

use std::collections::BTreeSet;

use serde::Serialize;
use sqlparser::dialect::{Dialect, GenericDialect, MySqlDialect, PostgreSqlDialect};
use sqlparser::tokenizer::{
    Location, Token as SqlToken, TokenWithSpan, Tokenizer, TokenizerError, Whitespace,
};

use crate::error::RlsError;

/// Token classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// Unquoted identifier or keyword.
    Word,
    /// `"ident"` or `` `ident` ``. Always an identifier, never a literal.
    QuotedIdent,
    /// `'...'`, `E'...'`, `X'...'`, `$tag$...$tag$`.
    String,
    Number,
    /// `$1`, `?`, `:name`.
    Param,
    Operator,
    Star,
    Comma,
    Period,
    LParen,
    RParen,
    Semicolon,
    Punct,
    Comment,
    Whitespace,
}

/// A token and its byte span in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    pub start: usize,
    pub end: usize,
}

impl<'a> Token<'a> {
    /// Comments and whitespace.
    pub fn is_trivia(&self) -> bool {
        matches!(self.kind, TokenKind::Comment | TokenKind::Whitespace)
    }

    /// Case-insensitive keyword comparison. Quoted identifiers never match.
    pub fn is_keyword(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
    }

    pub fn is_any_keyword(&self, keywords: &[&str]) -> bool {
        keywords.iter().any(|keyword| self.is_keyword(keyword))
    }

    pub fn is_identifier(&self) -> bool {
        matches!(self.kind, TokenKind::Word | TokenKind::QuotedIdent)
    }

    /// Identifier value with quoting removed.
    pub fn identifier(&self) -> String {
        match self.kind {
            TokenKind::QuotedIdent if self.text.len() >= 2 => {
                let quote = &self.text[..1];
                let inner = &self.text[1..self.text.len() - 1];
                inner.replace(&quote.repeat(2), quote)
            }
            _ => self.text.to_string(),
        }
    }
}

/// Tokenize SQL text, rejecting input whose token boundaries depend on the
/// dialect.
pub fn tokenize(sql: &str) -> Result<Vec<Token<'_>>, RlsError> {
    let generic = lex(sql, &GenericDialect {});
    let mysql = lex(sql, &MySqlDialect {});

    let tokens = match (generic, mysql) {
        (Ok(ours), Ok(theirs)) => {
            if let Some(offset) = first_divergence(&ours, &theirs) {
                let what = cause(spanning(&ours, offset).chain(spanning(&theirs, offset)));
                return Err(RlsError::Ambiguous { what, offset });
            }
            ours
        }
        (Ok(ours), Err(RlsError::Tokenize { offset, .. })) => {
            let what = cause(ours.iter().filter(|t| t.start <= offset));
            return Err(RlsError::Ambiguous { what, offset });
        }
        (Err(RlsError::Tokenize { offset, .. }), Ok(theirs)) => {
            let what = cause(theirs.iter().filter(|t| t.start <= offset));
            return Err(RlsError::Ambiguous { what, offset });
        }
        (Err(err), _) | (_, Err(err)) => return Err(err),
    };

    // A text PostgreSQL cannot tokenize will not run there either.
    if let Ok(postgres) = lex(sql, &PostgreSqlDialect {}) {
        let ours = comment_spans(&tokens);
        let theirs = comment_spans(&postgres);
        if let Some(&(offset, _)) = ours.symmetric_difference(&theirs).next() {
            return Err(RlsError::Ambiguous {
                what: "nested comment",
                offset,
            });
        }
    }

    Ok(refine(sql, tokens))
}

/// Replace every comment with a single space and trim the result.
pub fn strip_comments(sql: &str) -> Result<String, RlsError> {
    let tokens = tokenize(sql)?;
    let mut out = String::with_capacity(sql.len());
    for token in &tokens {
        if token.kind == TokenKind::Comment {
            out.push(' ');
            if token.text.ends_with('\n') {
                out.push('\n');
            }
        } else {
            out.push_str(token.text);
        }
    }
    Ok(out.trim().to_string())
}

/// Tokens that are neither comments nor whitespace.
pub fn significant(tokens: Vec<Token<'_>>) -> Vec<Token<'_>> {
    tokens.into_iter().filter(|t| !t.is_trivia()).collect()
}

fn lex<'a>(sql: &'a str, dialect: &dyn Dialect) -> Result<Vec<Token<'a>>, RlsError> {
    let spanned = Tokenizer::new(dialect, sql)
        .with_unescape(false)
        .tokenize_with_location()
        .map_err(|err| tokenizer_error(sql, err))?;

    let mut cursor = Cursor::new(sql);
    let mut tokens = Vec::with_capacity(spanned.len());
    for TokenWithSpan { token, span } in spanned {
        let start = cursor.seek(span.start);
        let end = cursor.seek(span.end);
        if start == end {
            continue;
        }
        tokens.push(Token {
            kind: classify(&token),
            text: &sql[start..end],
            start,
            end,
        });
    }
    Ok(tokens)
}

fn tokenizer_error(sql: &str, err: TokenizerError) -> RlsError {
    RlsError::Tokenize {
        offset: Cursor::new(sql).seek(err.location),
        message: err.message,
    }
}

fn classify(token: &SqlToken) -> TokenKind {
    match token {
        SqlToken::Word(word) if word.quote_style.is_some() => TokenKind::QuotedIdent,
        SqlToken::Word(_) => TokenKind::Word,
        // Double quotes delimit identifiers, never literals.
        SqlToken::DoubleQuotedString(_) => TokenKind::QuotedIdent,
        SqlToken::SingleQuotedString(_)
        | SqlToken::TripleSingleQuotedString(_)
        | SqlToken::TripleDoubleQuotedString(_)
        | SqlToken::DollarQuotedString(_)
        | SqlToken::SingleQuotedByteStringLiteral(_)
        | SqlToken::DoubleQuotedByteStringLiteral(_)
        | SqlToken::TripleSingleQuotedByteStringLiteral(_)
        | SqlToken::TripleDoubleQuotedByteStringLiteral(_)
        | SqlToken::SingleQuotedRawStringLiteral(_)
        | SqlToken::DoubleQuotedRawStringLiteral(_)
        | SqlToken::TripleSingleQuotedRawStringLiteral(_)
        | SqlToken::TripleDoubleQuotedRawStringLiteral(_)
        | SqlToken::NationalStringLiteral(_)
        | SqlToken::EscapedStringLiteral(_)
        | SqlToken::UnicodeStringLiteral(_)
        | SqlToken::HexStringLiteral(_) => TokenKind::String,
        SqlToken::Number(..) => TokenKind::Number,
        SqlToken::Placeholder(_) | SqlToken::Question => TokenKind::Param,
        SqlToken::Whitespace(Whitespace::SingleLineComment { .. })
        | SqlToken::Whitespace(Whitespace::MultiLineComment(_)) => TokenKind::Comment,
        SqlToken::Whitespace(_) => TokenKind::Whitespace,
        SqlToken::Mul => TokenKind::Star,
        SqlToken::Comma => TokenKind::Comma,
        SqlToken::Period => TokenKind::Period,
        SqlToken::LParen => TokenKind::LParen,
        SqlToken::RParen => TokenKind::RParen,
        SqlToken::SemiColon => TokenKind::Semicolon,
        SqlToken::Char(_)
        | SqlToken::Colon
        | SqlToken::Backslash
        | SqlToken::LBracket
        | SqlToken::RBracket
        | SqlToken::LBrace
        | SqlToken::RBrace => TokenKind::Punct,
        _ => TokenKind::Operator,
    }
}

/// Fold `:` + name into a named parameter and split words carrying `@`
/// or `#`, which PostgreSQL reads as operators.
fn refine<'a>(sql: &'a str, tokens: Vec<Token<'a>>) -> Vec<Token<'a>> {
    let mut out: Vec<Token<'a>> = Vec::with_capacity(tokens.len());
    for token in tokens {
        let named_param = token.kind == TokenKind::Word
            && out
                .last()
                .is_some_and(|prev| prev.text == ":" && prev.end == token.start);
        if named_param {
            if let Some(prev) = out.last_mut() {
                prev.kind = TokenKind::Param;
                prev.end = token.end;
                prev.text = &sql[prev.start..prev.end];
            }
            continue;
        }
        if token.kind == TokenKind::Word && token.text.contains(['@', '#']) {
            split_word(token, &mut out);
        } else {
            out.push(token);
        }
    }
    out
}

fn split_word<'a>(token: Token<'a>, out: &mut Vec<Token<'a>>) {
    let is_op = |c: char| c == '@' || c == '#';
    let mut piece_start = 0;
    let mut chars = token.text.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        let boundary = match chars.peek() {
            Some(&(_, next)) => is_op(next) != is_op(c),
            None => true,
        };
        if boundary {
            let end = idx + c.len_utf8();
            out.push(Token {
                kind: if is_op(c) { TokenKind::Operator } else { TokenKind::Word },
                text: &token.text[piece_start..end],
                start: token.start + piece_start,
                end: token.start + end,
            });
            piece_start = end;
        }
    }
}

/// Earliest offset where one reading has a token boundary and the other
/// does not. A string prefix split off by one reading (`E'..'` read as a
/// word and a literal) is not a divergence.
fn first_divergence(ours: &[Token<'_>], theirs: &[Token<'_>]) -> Option<usize> {
    let a: BTreeSet<usize> = ours.iter().map(|t| t.end).collect();
    let b: BTreeSet<usize> = theirs.iter().map(|t| t.end).collect();
    a.symmetric_difference(&b)
        .copied()
        .filter(|&at| !is_prefix_split(ours, at))
        .min()
}

fn is_prefix_split(tokens: &[Token<'_>], at: usize) -> bool {
    tokens.iter().any(|t| {
        if t.kind != TokenKind::String || at <= t.start || at >= t.end {
            return false;
        }
        let (prefix, rest) = t.text.split_at(at - t.start);
        rest.starts_with('\'')
            && prefix.len() <= 2
            && prefix.chars().all(|c| c.is_ascii_alphabetic() || c == '&')
    })
}

fn spanning<'t, 'a>(tokens: &'t [Token<'a>], at: usize) -> impl Iterator<Item = &'t Token<'a>> {
    tokens.iter().filter(move |t| t.start < at && at < t.end)
}

fn cause<'t, 'a: 't>(tokens: impl Iterator<Item = &'t Token<'a>>) -> &'static str {
    let mut what = "token boundary";
    for t in tokens {
        let found = match t.kind {
            TokenKind::Comment if t.text.starts_with('#') => "hash comment",
            TokenKind::Comment if t.text.starts_with("/*") => "nested comment",
            TokenKind::String if t.text.contains('\\') => "backslash escape",
            TokenKind::String if t.text.starts_with('$') => "dollar quoting",
            _ => continue,
        };
        if what == "token boundary" || found == "hash comment" {
            what = found;
        }
    }
    what
}

fn comment_spans(tokens: &[Token<'_>]) -> BTreeSet<(usize, usize)> {
    tokens
        .iter()
        .filter(|t| t.kind == TokenKind::Comment)
        .map(|t| (t.start, t.end))
        .collect()
}

/// Walks the source to turn 1-based line/column locations into byte
/// offsets. Seeks must be monotonic.
struct Cursor<'a> {
    src: &'a str,
    pos: usize,
    line: u64,
    column: u64,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn seek(&mut self, to: Location) -> usize {
        while (self.line, self.column) < (to.line, to.column) {
            let Some(c) = self.src[self.pos..].chars().next() else {
                break;
            };
            self.pos += c.len_utf8();
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        self.pos
    }
}



fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn is_operator_char(c: char) -> bool {
    matches!(
        c,
        '+' | '-' | '/' | '<' | '>' | '=' | '~' | '!' | '@' | '#' | '%' | '^' | '&' | '|'
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kinds(sql: &str) -> Vec<(TokenKind, &str)> {
        significant(tokenize(sql).unwrap())
            .into_iter()
            .map(|t| (t.kind, t.text))
            .collect()
    }

    #[test]
    fn test_basic_select() {
        assert_eq!(
            kinds("SELECT u.id, * FROM users u WHERE x >= 10;"),
            vec![
                (TokenKind::Word, "SELECT"),
                (TokenKind::Word, "u"),
                (TokenKind::Period, "."),
                (TokenKind::Word, "id"),
                (TokenKind::Comma, ","),
                (TokenKind::Star, "*"),
                (TokenKind::Word, "FROM"),
                (TokenKind::Word, "users"),
                (TokenKind::Word, "u"),
                (TokenKind::Word, "WHERE"),
                (TokenKind::Word, "x"),
                (TokenKind::Operator, ">="),
                (TokenKind::Number, "10"),
                (TokenKind::Semicolon, ";"),
            ]
        );
    }

    #[test]
    fn test_spans_cover_source() {
        let sql = "SELECT 'a' -- c\n FROM t";
        let tokens = tokenize(sql).unwrap();
        let rebuilt: String = tokens.iter().map(|t| t.text).collect();
        assert_eq!(rebuilt, sql);
        for t in &tokens {
            assert_eq!(&sql[t.start..t.end], t.text);
        }
    }

    #[test]
    fn test_literals_hide_structure() {
        let toks = kinds("SELECT 'DROP TABLE x; --' , \"a;b\" FROM t");
        assert_eq!(toks[1], (TokenKind::String, "'DROP TABLE x; --'"));
        assert_eq!(toks[3], (TokenKind::QuotedIdent, "\"a;b\""));
        assert_eq!(toks[4], (TokenKind::Word, "FROM"));
    }

    #[test]
    fn test_dollar_quoting_rejected() {
        // MySQL reads `$$` as an identifier.
        let err = tokenize("SELECT $$ DELETE $$").unwrap_err();
        assert!(matches!(err, RlsError::Ambiguous { .. }));
    }

    #[test]
    fn test_doubled_quotes() {
        let toks = kinds("SELECT 'it''s', \"a\"\"b\"");
        assert_eq!(toks[1].0, TokenKind::String);
        assert_eq!(toks[3], (TokenKind::QuotedIdent, "\"a\"\"b\""));
    }

    #[test]
    fn test_quoted_identifier_value() {
        let tokens = significant(tokenize("SELECT \"Ssn\", `a``b`").unwrap());
        assert_eq!(tokens[1].identifier(), "Ssn");
        assert_eq!(tokens[3].identifier(), "a`b");
    }

    #[test]
    fn test_prefixed_strings() {
        let toks = kinds("SELECT X'FF', N'x'");
        assert_eq!(toks[1], (TokenKind::String, "X'FF'"));
        assert_eq!(toks[3], (TokenKind::String, "N'x'"));
    }

    #[test]
    fn test_params_and_casts() {
        let toks = kinds("SELECT $1::text, :name, ?");
        assert_eq!(toks[1], (TokenKind::Param, "$1"));
        assert_eq!(toks[2], (TokenKind::Operator, "::"));
        assert_eq!(toks[5], (TokenKind::Param, ":name"));
        assert_eq!(toks[7], (TokenKind::Param, "?"));
    }

    #[test]
    fn test_non_ascii_identifier() {
        let toks = kinds("SELECT prénom AS имя FROM t");
        assert_eq!(toks[1], (TokenKind::Word, "prénom"));
        assert_eq!(toks[3], (TokenKind::Word, "имя"));
    }

    #[test]
    fn test_unterminated_string() {
        let err = tokenize("SELECT 'abc").unwrap_err();
        assert!(matches!(err, RlsError::Tokenize { .. }), "{err:?}");
    }

    #[test]
    fn test_unterminated_comment() {
        assert!(matches!(
            tokenize("SELECT 1 /* open"),
            Err(RlsError::Tokenize { .. })
        ));
    }

    #[test]
    fn test_backslash_ambiguity_rejected() {
        // Standard SQL ends the literal at the second quote; MySQL does not.
        let err = tokenize("SELECT 'a\\' , ssn, '' FROM users").unwrap_err();
        assert!(matches!(err, RlsError::Ambiguous { what: "backslash escape", .. }));
    }

    #[test]
    fn test_harmless_backslash_accepted() {
        let toks = kinds("SELECT 'C:\\path' FROM t");
        assert_eq!(toks[1], (TokenKind::String, "'C:\\path'"));
    }

    #[test]
    fn test_nested_comment_ambiguity_rejected() {
        let err = tokenize("SELECT id /* /* */, ssn FROM users -- */").unwrap_err();
        assert!(matches!(err, RlsError::Ambiguous { what: "nested comment", .. }));
    }

    #[test]
    fn test_hash_comment_ambiguity_rejected() {
        // MySQL ends the line at `#`, hiding the quote that opens a literal
        // for everyone else.
        let err = tokenize("SELECT id # '\n, ssn FROM users -- '").unwrap_err();
        assert!(matches!(err, RlsError::Ambiguous { what: "hash comment", .. }));
    }

    #[test]
    fn test_at_prefix_split_from_column() {
        let toks = kinds("SELECT @ssn FROM users");
        assert_eq!(toks[1], (TokenKind::Operator, "@"));
        assert_eq!(toks[2], (TokenKind::Word, "ssn"));
    }

    #[test]
    fn test_spans_track_multibyte_lines() {
        let sql = "SELECT 'é'\n, имя FROM t";
        let tokens = significant(tokenize(sql).unwrap());
        let name = tokens.iter().find(|t| t.text == "имя").unwrap();
        assert_eq!(&sql[name.start..name.end], "имя");
    }

    #[test]
    fn test_strip_comments_idempotent() {
        let once = strip_comments("/* lead */ SELECT a -- trailing\nFROM t /* x */").unwrap();
        assert_eq!(once, "SELECT a  \nFROM t");
        assert_eq!(strip_comments(&once).unwrap(), once);
    }

    #[test]
    fn test_operator_stops_before_comment() {
        let toks = kinds("SELECT a=-- note\n1");
        assert_eq!(toks[2], (TokenKind::Operator, "="));
        assert_eq!(toks[3], (TokenKind::Number, "1"));
    }
}
