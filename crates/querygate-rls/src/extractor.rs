//! Table and column reference extraction.
//!
//! [`TextExtractor`] works on the token stream from [`crate::lexer`] and
//! never builds a full syntax tree. A statement is broken into *scopes*: each
//! operand of a top-level `UNION`/`INTERSECT`/`EXCEPT` is a scope, and every
//! parenthesised sub-query, derived table or CTE body is a nested scope that
//! can see the tables of its enclosing scopes (correlation).
//!
//! For every scope the extractor records the tables in its `FROM`/`JOIN`
//! list with their aliases, the select items, wildcards, every column
//! reference with the clause it appears in, and the byte positions needed to
//! add a `WHERE` predicate.

use std::collections::BTreeSet;

use querygate_core::{Catalog, normalize_table_name, unquote_identifier};
use serde::Serialize;

use crate::error::RlsError;
use crate::lexer::{self, Token, TokenKind};

/// Extracts table and column references from SQL text.
pub trait ReferenceExtractor: Send + Sync {
    fn extract(&self, sql: &str) -> Result<Extraction, RlsError>;
}

/// Token-based [`ReferenceExtractor`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TextExtractor;

impl TextExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl ReferenceExtractor for TextExtractor {
    fn extract(&self, sql: &str) -> Result<Extraction, RlsError> {
        let tokens = lexer::significant(lexer::tokenize(sql)?);
        let parens = match_parens(&tokens)?;
        let mut walker = Walker {
            sql,
            toks: &tokens,
            parens,
            scopes: Vec::new(),
        };
        for (lo, hi) in walker.statements() {
            walker.statement(lo, hi);
        }
        Ok(Extraction {
            scopes: walker.scopes,
        })
    }
}

/// A table named in a `FROM`, `JOIN`, `UPDATE` or `INSERT INTO` position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRef {
    /// Name as written, possibly schema-qualified and quoted.
    pub name: String,
    /// Alias as written.
    pub alias: Option<String>,
}

impl TableRef {
    pub fn new(name: impl Into<String>, alias: Option<&str>) -> Self {
        Self {
            name: name.into(),
            alias: alias.map(str::to_string),
        }
    }

    /// Normalised base name used as a policy and catalog key.
    pub fn key(&self) -> String {
        normalize_table_name(&self.name)
    }

    /// The name other clauses use to refer to this table.
    pub fn exposed(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Whether `qualifier` refers to this table, by alias or by name.
    pub fn answers_to(&self, qualifier: &str) -> bool {
        if let Some(alias) = &self.alias {
            if ident_eq(alias, qualifier) {
                return true;
            }
        }
        self.key() == normalize_table_name(qualifier)
    }
}

/// The clause a reference was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Clause {
    Select,
    Where,
    Join,
    GroupBy,
    Having,
    OrderBy,
    Other,
}

/// A column reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reference {
    /// Qualifier as written (`u`, `public.users`).
    pub table: Option<String>,
    pub column: String,
    pub clause: Clause,
    /// Constant select item such as `'x'`, `1` or `COUNT(*)`.
    pub is_literal: bool,
    /// The reference makes up a whole `ORDER BY` item.
    pub whole_item: bool,
    /// A non-reserved keyword (`range`, `rows`, `current`) read as a column.
    /// It may be either, so it is enforced but never reported as unknown.
    pub is_keyword: bool,
}

/// `*` or `qualifier.*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Wildcard {
    pub qualifier: Option<String>,
    pub clause: Clause,
}

/// A select item with the column it passes through, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Projection {
    /// Result column name (alias, column name or item text).
    pub output: String,
    pub table: Option<String>,
    pub column: Option<String>,
    /// Column references inside the item, outside nested queries.
    pub refs: Vec<Reference>,
}

/// Where a row filter goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAnchor {
    /// Byte span of an existing `WHERE` condition.
    Where { start: usize, end: usize },
    /// Byte offset at which to insert a new `WHERE` clause.
    Append { at: usize },
}

/// One `SELECT` (or DML) level of a statement.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Scope {
    /// 0 for top-level set operands.
    pub depth: usize,
    /// Last operand of its set operation; its `ORDER BY` sees the final aliases.
    pub is_last_segment: bool,
    pub tables: Vec<TableRef>,
    /// Aliases of derived tables and names of CTEs/table functions in this scope.
    pub derived: Vec<String>,
    pub outer_tables: Vec<TableRef>,
    pub outer_derived: Vec<String>,
    /// CTE names in reach. Only these may stand in for a table name.
    #[serde(skip)]
    pub ctes: Vec<String>,
    pub select_items: Vec<String>,
    pub projections: Vec<Projection>,
    pub wildcards: Vec<Wildcard>,
    pub column_refs: Vec<Reference>,
    /// Lowercased select-list aliases.
    pub select_aliases: BTreeSet<String>,
    #[serde(skip)]
    pub filter_anchor: Option<FilterAnchor>,
    /// Trailing `ORDER BY`/`LIMIT` of a parenthesised query; tables are copies.
    #[serde(skip)]
    pub inherits_tables: bool,
}

/// Tables a column reference may belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Candidate tables by normalised name.
    Tables(Vec<String>),
    /// The qualifier names a derived table or CTE, checked where it is defined.
    Derived,
}

impl Scope {
    fn from_context(ctx: &Context, is_last_segment: bool) -> Self {
        Self {
            depth: ctx.depth,
            is_last_segment,
            outer_tables: ctx.outer_tables.clone(),
            outer_derived: ctx.outer_derived.clone(),
            ctes: ctx.ctes.clone(),
            ..Self::default()
        }
    }

    fn child_context(&self) -> Context {
        let mut outer_tables = self.tables.clone();
        outer_tables.extend(self.outer_tables.iter().cloned());
        let mut outer_derived = self.derived.clone();
        outer_derived.extend(self.outer_derived.iter().cloned());
        Context {
            outer_tables,
            outer_derived,
            ctes: self.ctes.clone(),
            depth: self.depth + 1,
        }
    }

    fn is_cte_name(&self, name: &str) -> bool {
        !name.contains('.') && self.ctes.iter().any(|d| ident_eq(d, name))
    }

    /// Own tables followed by tables of enclosing scopes.
    pub fn visible_tables(&self) -> impl Iterator<Item = &TableRef> {
        self.tables.iter().chain(self.outer_tables.iter())
    }

    /// Candidate tables for a column reference.
    pub fn resolve(&self, reference: &Reference, catalog: Option<&Catalog>) -> Resolution {
        match &reference.table {
            Some(qualifier) => self.resolve_qualifier(qualifier),
            None => Resolution::Tables(self.resolve_unqualified(&reference.column, catalog)),
        }
    }

    /// Resolve a qualifier through aliases and names, own scope first.
    ///
    /// An unknown qualifier resolves to every visible table plus the
    /// qualifier itself read as a table name.
    pub fn resolve_qualifier(&self, qualifier: &str) -> Resolution {
        if let Some(table) = self.tables.iter().find(|t| t.answers_to(qualifier)) {
            return Resolution::Tables(vec![table.key()]);
        }
        if self.derived.iter().any(|d| ident_eq(d, qualifier)) {
            return Resolution::Derived;
        }
        if let Some(table) = self.outer_tables.iter().find(|t| t.answers_to(qualifier)) {
            return Resolution::Tables(vec![table.key()]);
        }
        if self.outer_derived.iter().any(|d| ident_eq(d, qualifier)) {
            return Resolution::Derived;
        }
        let mut candidates = unique_keys(self.visible_tables());
        push_unique(&mut candidates, normalize_table_name(qualifier));
        Resolution::Tables(candidates)
    }

    fn resolve_unqualified(&self, column: &str, catalog: Option<&Catalog>) -> Vec<String> {
        let own = unique_keys(self.tables.iter());
        let outer = unique_keys(self.outer_tables.iter());

        let Some(catalog) = catalog else {
            return merge(own, outer);
        };

        let may_hold = |table: &String| !catalog.has_table(table) || catalog.has_column(table, column);
        let own_hits: Vec<String> = own.iter().filter(|t| may_hold(*t)).cloned().collect();
        if !own_hits.is_empty() {
            return own_hits;
        }
        let outer_hits: Vec<String> = outer.iter().filter(|t| may_hold(*t)).cloned().collect();
        if !outer_hits.is_empty() {
            return outer_hits;
        }
        merge(own, outer)
    }

    /// Tables referenced as a whole row by a bare name, as in `row_to_json(u)`.
    pub fn whole_row_tables(&self, name: &str, catalog: Option<&Catalog>) -> Vec<String> {
        let matches: Vec<&TableRef> = self
            .visible_tables()
            .filter(|t| match &t.alias {
                Some(alias) => ident_eq(alias, name),
                None => t.answers_to(name),
            })
            .collect();
        if matches.is_empty() {
            return Vec::new();
        }
        if let Some(catalog) = catalog {
            if self.visible_tables().any(|t| catalog.has_column(&t.key(), name)) {
                return Vec::new();
            }
        }
        unique_keys(matches.into_iter())
    }
}

/// Everything extracted from one SQL text.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Extraction {
    scopes: Vec<Scope>,
}

impl Extraction {
    /// All scopes. Nested scopes come before the scope that contains them.
    pub fn scopes(&self) -> &[Scope] {
        &self.scopes
    }

    /// Top-level set operands.
    pub fn segments(&self) -> impl Iterator<Item = &Scope> {
        self.scopes.iter().filter(|s| s.depth == 0)
    }

    /// Real tables across every scope, deduplicated by name and alias.
    pub fn tables(&self) -> Vec<&TableRef> {
        let mut out: Vec<&TableRef> = Vec::new();
        for scope in self.scopes.iter().filter(|s| !s.inherits_tables) {
            for table in &scope.tables {
                if !out.iter().any(|t| t.key() == table.key() && t.alias == table.alias) {
                    out.push(table);
                }
            }
        }
        out
    }

    /// Normalised names of every real table.
    pub fn table_names(&self) -> BTreeSet<String> {
        self.tables().into_iter().map(TableRef::key).collect()
    }

    pub fn select_items(&self) -> Vec<&str> {
        self.segments()
            .flat_map(|s| s.select_items.iter().map(String::as_str))
            .collect()
    }

    pub fn column_refs(&self) -> impl Iterator<Item = &Reference> {
        self.scopes.iter().flat_map(|s| s.column_refs.iter())
    }

    /// Aliases defined by any select list.
    pub fn select_aliases(&self) -> BTreeSet<String> {
        self.scopes
            .iter()
            .flat_map(|s| s.select_aliases.iter().cloned())
            .collect()
    }

    /// Aliases visible to the statement's final `ORDER BY`.
    pub fn last_select_aliases(&self) -> BTreeSet<String> {
        self.segments()
            .filter(|s| s.is_last_segment)
            .flat_map(|s| s.select_aliases.iter().cloned())
            .collect()
    }

    /// Projections of the first top-level operand, which names the result columns.
    pub fn output_projections(&self) -> &[Projection] {
        self.segments()
            .find(|s| !s.projections.is_empty())
            .map(|s| s.projections.as_slice())
            .unwrap_or(&[])
    }
}

/// Case-insensitive identifier comparison that ignores quoting.
pub fn ident_eq(a: &str, b: &str) -> bool {
    unquote_identifier(a).to_lowercase() == unquote_identifier(b).to_lowercase()
}

fn unique_keys<'a>(tables: impl Iterator<Item = &'a TableRef>) -> Vec<String> {
    let mut out = Vec::new();
    for table in tables {
        push_unique(&mut out, table.key());
    }
    out
}

fn push_unique(out: &mut Vec<String>, key: String) {
    if !out.contains(&key) {
        out.push(key);
    }
}

fn merge(mut own: Vec<String>, outer: Vec<String>) -> Vec<String> {
    for key in outer {
        push_unique(&mut own, key);
    }
    own
}

fn match_parens(tokens: &[Token<'_>]) -> Result<Vec<usize>, RlsError> {
    let mut map: Vec<usize> = (0..tokens.len()).collect();
    let mut stack = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::LParen => stack.push(i),
            TokenKind::RParen => {
                let open = stack.pop().ok_or(RlsError::UnbalancedParenthesis {
                    offset: token.start,
                })?;
                map[open] = i;
                map[i] = open;
            }
            _ => {}
        }
    }
    if let Some(open) = stack.pop() {
        return Err(RlsError::UnbalancedParenthesis {
            offset: tokens[open].start,
        });
    }
    Ok(map)
}

// Words that never name a column when they appear bare.
const RESERVED: &[&str] = &[
    "ALL", "AND", "ANY", "ARRAY", "AS", "ASC", "BOTH", "CASE", "CAST", "COLLATE", "CROSS",
    "CURRENT_DATE", "CURRENT_TIME", "CURRENT_TIMESTAMP", "CURRENT_USER", "DEFAULT", "DESC",
    "DISTINCT", "ELSE", "END", "EXCEPT", "FALSE", "FETCH", "FOR", "FROM", "FULL", "GROUP",
    "HAVING", "ILIKE", "IN", "INNER", "INTERSECT", "INTO", "IS", "JOIN", "LATERAL", "LEADING",
    "LEFT", "LIKE", "LIMIT", "LOCALTIME", "LOCALTIMESTAMP", "NATURAL", "NOT", "NULL", "OFFSET",
    "ON", "ONLY", "OR", "ORDER", "OUTER", "RIGHT", "SELECT", "SESSION_USER", "SIMILAR", "SOME",
    "SYMMETRIC", "THEN", "TO", "TRAILING", "TRUE", "UNION", "USING", "WHEN", "WHERE", "WINDOW",
    "WITH",
];

// Keywords PostgreSQL also accepts as column names.
const CONTEXTUAL: &[&str] = &[
    "BETWEEN", "CURRENT", "ESCAPE", "EXISTS", "FILTER", "FOLLOWING", "GROUPING", "INTERVAL",
    "NULLS", "OVER", "PARTITION", "PRECEDING", "RANGE", "RECURSIVE", "ROW", "ROWS", "SET", "SETS",
    "UNBOUNDED", "UNKNOWN", "VALUES", "WITHIN",
];

// Words that may follow a table name without being its alias.
const NOT_ALIAS: &[&str] = &[
    "STRAIGHT_JOIN", "APPLY", "TABLESAMPLE", "USE", "FORCE", "IGNORE", "QUALIFY", "RETURNING",
    "MINUS", "PIVOT", "UNPIVOT", "CONNECT", "START",
];

const JOIN_WORDS: &[&str] = &[
    "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "OUTER", "CROSS", "NATURAL", "STRAIGHT_JOIN", "APPLY",
];

const INTERVAL_UNITS: &[&str] = &[
    "YEAR", "MONTH", "WEEK", "DAY", "HOUR", "MINUTE", "SECOND", "MICROSECOND", "MILLISECOND",
    "QUARTER",
];

fn is_reserved(word: &str) -> bool {
    RESERVED.iter().any(|k| k.eq_ignore_ascii_case(word))
}

fn is_contextual(word: &str) -> bool {
    CONTEXTUAL.iter().any(|k| k.eq_ignore_ascii_case(word))
}

/// Reserved or contextual: never taken as an alias or a table name.
fn is_keyword_like(word: &str) -> bool {
    is_reserved(word) || is_contextual(word)
}

fn is_interval_unit(word: &str) -> bool {
    let upper = word.to_ascii_uppercase();
    upper.split('_').all(|part| {
        let singular = part.strip_suffix('S').unwrap_or(part);
        INTERVAL_UNITS.contains(&singular)
    })
}

#[derive(Debug, Clone, Default)]
struct Context {
    outer_tables: Vec<TableRef>,
    outer_derived: Vec<String>,
    ctes: Vec<String>,
    depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClauseKind {
    Select,
    From,
    Where,
    GroupBy,
    Having,
    OrderBy,
    Limit,
    Window,
    Update,
    Set,
    Insert,
    Values,
    Other,
}

#[derive(Debug, Clone, Copy)]
struct ClauseRange {
    kind: ClauseKind,
    /// Index of the clause's first keyword token.
    keyword: usize,
    lo: usize,
    hi: usize,
}

/// An identifier chain such as `a`, `u.ssn`, `public.users.id` or `u.*`.
struct Chain {
    parts: Vec<String>,
    next: usize,
    star: bool,
}

impl Chain {
    fn qualifier(&self) -> Option<String> {
        let n = if self.star { self.parts.len() } else { self.parts.len().saturating_sub(1) };
        (n > 0).then(|| self.parts[..n].join("."))
    }

    fn column(&self) -> String {
        self.parts
            .last()
            .map(|p| unquote_identifier(p).to_string())
            .unwrap_or_default()
    }
}

struct Walker<'t, 's> {
    sql: &'s str,
    toks: &'t [Token<'s>],
    parens: Vec<usize>,
    scopes: Vec<Scope>,
}

impl<'t, 's> Walker<'t, 's> {
    fn kw(&self, i: usize, keyword: &str) -> bool {
        self.toks.get(i).is_some_and(|t| t.is_keyword(keyword))
    }

    fn kind(&self, i: usize) -> Option<TokenKind> {
        self.toks.get(i).map(|t| t.kind)
    }

    fn text(&self, lo: usize, hi: usize) -> String {
        if lo >= hi {
            return String::new();
        }
        self.sql[self.toks[lo].start..self.toks[hi - 1].end].to_string()
    }

    /// Ranges between top-level semicolons.
    fn statements(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        let mut start = 0;
        let mut i = 0;
        while i < self.toks.len() {
            match self.toks[i].kind {
                TokenKind::LParen => {
                    i = self.parens[i] + 1;
                    continue;
                }
                TokenKind::Semicolon => {
                    if start < i {
                        out.push((start, i));
                    }
                    start = i + 1;
                }
                _ => {}
            }
            i += 1;
        }
        if start < self.toks.len() {
            out.push((start, self.toks.len()));
        }
        out
    }

    fn starts_query(&self, i: usize) -> bool {
        match self.toks.get(i) {
            Some(t) if t.kind == TokenKind::LParen => self.starts_query(i + 1),
            Some(t) => t.is_any_keyword(&["SELECT", "WITH", "VALUES"]),
            None => false,
        }
    }

    fn starts_statement(&self, i: usize) -> bool {
        self.starts_query(i)
            || self
                .toks
                .get(i)
                .is_some_and(|t| t.is_any_keyword(&["INSERT", "UPDATE", "DELETE", "MERGE"]))
    }

    fn statement(&mut self, lo: usize, hi: usize) {
        let mut lo = lo;
        if self.kw(lo, "EXPLAIN") {
            lo += 1;
            while lo < hi && !self.starts_statement(lo) {
                lo = if self.kind(lo) == Some(TokenKind::LParen) {
                    self.parens[lo] + 1
                } else {
                    lo + 1
                };
            }
        }
        if lo >= hi {
            return;
        }
        if self.kw(lo, "DESCRIBE") || self.kw(lo, "DESC") || self.kw(lo, "SHOW") {
            self.metadata_statement(lo, hi);
            return;
        }
        self.query(lo, hi, &Context::default(), true);
    }

    /// `DESCRIBE t`, `SHOW COLUMNS FROM t`, `SHOW CREATE TABLE t`.
    fn metadata_statement(&mut self, lo: usize, hi: usize) {
        let target = if self.kw(lo, "SHOW") {
            let mut i = lo + 1;
            if self.kw(i, "FULL") {
                i += 1;
            }
            if self.kw(i, "CREATE") && self.kw(i + 1, "TABLE") {
                Some(i + 2)
            } else if self
                .toks
                .get(i)
                .is_some_and(|t| t.is_any_keyword(&["COLUMNS", "FIELDS", "INDEX", "INDEXES", "KEYS"]))
            {
                (i..hi)
                    .find(|&j| self.kw(j, "FROM") || self.kw(j, "IN"))
                    .map(|j| j + 1)
            } else {
                None
            }
        } else {
            Some(lo + 1)
        };

        let mut scope = Scope::from_context(&Context::default(), true);
        if let Some(i) = target.filter(|&i| i < hi && self.toks[i].is_identifier()) {
            if let Some(chain) = self.chain_at(i, hi) {
                scope.tables.push(TableRef::new(chain.parts.join("."), None));
            }
        }
        self.scopes.push(scope);
    }

    fn query(&mut self, lo: usize, hi: usize, ctx: &Context, last: bool) {
        let mut ctx = ctx.clone();
        let mut lo = lo;
        if self.kw(lo, "WITH") {
            lo = self.with_clause(lo + 1, hi, &mut ctx);
        }
        let operands = self.set_operands(lo, hi);
        let last_idx = operands.len().saturating_sub(1);
        for (idx, (s, e)) in operands.into_iter().enumerate() {
            self.segment(s, e, &ctx, last && idx == last_idx);
        }
    }

    /// Parse CTE definitions; returns the index of the main query.
    fn with_clause(&mut self, lo: usize, hi: usize, ctx: &mut Context) -> usize {
        let mut i = lo;
        if self.kw(i, "RECURSIVE") {
            i += 1;
        }
        while i < hi {
            if !self.toks[i].is_identifier() {
                return i;
            }
            let name = self.toks[i].identifier();
            ctx.outer_derived.push(name.clone());
            ctx.ctes.push(name);
            i += 1;
            if self.kind(i) == Some(TokenKind::LParen) {
                i = self.parens[i] + 1;
            }
            if self.kw(i, "AS") {
                i += 1;
            }
            while self.kw(i, "NOT") || self.kw(i, "MATERIALIZED") {
                i += 1;
            }
            if i < hi && self.kind(i) == Some(TokenKind::LParen) {
                let close = self.parens[i];
                let body = Context {
                    depth: ctx.depth + 1,
                    ..ctx.clone()
                };
                self.query(i + 1, close, &body, true);
                i = close + 1;
            }
            if self.kind(i) == Some(TokenKind::Comma) {
                i += 1;
            } else {
                return i;
            }
        }
        i
    }

    fn set_operands(&self, lo: usize, hi: usize) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        let mut start = lo;
        let mut i = lo;
        while i < hi {
            if self.kind(i) == Some(TokenKind::LParen) {
                i = self.parens[i] + 1;
                continue;
            }
            let token = self.toks[i];
            let column_exclusion = token.is_keyword("EXCEPT")
                && i > lo
                && self.kind(i - 1) == Some(TokenKind::Star);
            if token.is_any_keyword(&["UNION", "INTERSECT", "EXCEPT", "MINUS"]) && !column_exclusion {
                out.push((start, i));
                i += 1;
                while self.kw(i, "ALL") || self.kw(i, "DISTINCT") {
                    i += 1;
                }
                start = i;
                continue;
            }
            i += 1;
        }
        out.push((start, hi));
        out
    }

    fn segment(&mut self, lo: usize, hi: usize, ctx: &Context, is_last: bool) {
        if lo >= hi {
            return;
        }

        if self.kind(lo) == Some(TokenKind::LParen) && self.starts_query(lo + 1) {
            let close = self.parens[lo];
            let first_new = self.scopes.len();
            self.query(lo + 1, close, ctx, is_last);
            if close + 1 < hi {
                let mut scope = Scope::from_context(ctx, is_last);
                scope.inherits_tables = true;
                for inner in self.scopes[first_new..].iter().filter(|s| s.depth == ctx.depth) {
                    scope.tables.extend(inner.tables.iter().cloned());
                    scope.select_aliases.extend(inner.select_aliases.iter().cloned());
                }
                let clauses = self.split_clauses(close + 1, hi);
                self.scan_clauses(&clauses, &mut scope);
                self.scopes.push(scope);
            }
            return;
        }

        let clauses = self.split_clauses(lo, hi);
        let mut scope = Scope::from_context(ctx, is_last);
        for clause in &clauses {
            match clause.kind {
                ClauseKind::From | ClauseKind::Update => {
                    self.from_list(clause.lo, clause.hi, &mut scope)
                }
                ClauseKind::Insert => self.insert_target(clause.lo, clause.hi, &mut scope),
                _ => {}
            }
        }
        self.scan_clauses(&clauses, &mut scope);
        scope.filter_anchor = self.filter_anchor(&clauses, hi);
        self.scopes.push(scope);
    }

    fn split_clauses(&self, lo: usize, hi: usize) -> Vec<ClauseRange> {
        let mut out: Vec<ClauseRange> = Vec::new();
        let mut i = lo;
        while i < hi {
            if self.kind(i) == Some(TokenKind::LParen) {
                i = self.parens[i] + 1;
                continue;
            }
            let current = out.last().map(|c| c.kind);
            if let Some((kind, width)) = self.clause_keyword(i, lo, current) {
                match out.last_mut() {
                    Some(prev) => prev.hi = i,
                    None if i > lo => out.push(ClauseRange {
                        kind: ClauseKind::Other,
                        keyword: lo,
                        lo,
                        hi: i,
                    }),
                    None => {}
                }
                out.push(ClauseRange {
                    kind,
                    keyword: i,
                    lo: (i + width).min(hi),
                    hi,
                });
                i += width;
                continue;
            }
            i += 1;
        }
        if out.is_empty() && lo < hi {
            out.push(ClauseRange {
                kind: ClauseKind::Other,
                keyword: lo,
                lo,
                hi,
            });
        }
        out
    }

    fn clause_keyword(
        &self,
        i: usize,
        lo: usize,
        current: Option<ClauseKind>,
    ) -> Option<(ClauseKind, usize)> {
        let token = self.toks[i];
        if token.kind != TokenKind::Word {
            return None;
        }
        let upper = token.text.to_ascii_uppercase();
        match upper.as_str() {
            "SELECT" => Some((ClauseKind::Select, 1)),
            // `IS [NOT] DISTINCT FROM` is a comparison
            "FROM" if !(i > lo && self.kw(i - 1, "DISTINCT")) => Some((ClauseKind::From, 1)),
            "WHERE" => Some((ClauseKind::Where, 1)),
            "GROUP" if self.kw(i + 1, "BY") => Some((ClauseKind::GroupBy, 2)),
            "HAVING" => Some((ClauseKind::Having, 1)),
            "ORDER" if self.kw(i + 1, "BY") => Some((ClauseKind::OrderBy, 2)),
            "LIMIT" | "OFFSET" | "FETCH" => Some((ClauseKind::Limit, 1)),
            "WINDOW" => Some((ClauseKind::Window, 1)),
            "QUALIFY" | "RETURNING" => Some((ClauseKind::Other, 1)),
            "FOR" if current.is_some()
                && ["UPDATE", "SHARE", "NO", "KEY"].iter().any(|k| self.kw(i + 1, k)) =>
            {
                Some((ClauseKind::Other, 1))
            }
            "UPDATE" if i == lo => Some((ClauseKind::Update, 1)),
            "DELETE" if i == lo => Some((ClauseKind::Other, 1)),
            "INSERT" | "REPLACE" | "MERGE" if i == lo => Some((ClauseKind::Insert, 1)),
            "SET" => Some((ClauseKind::Set, 1)),
            "VALUES" => Some((ClauseKind::Values, 1)),
            "INTO" if current == Some(ClauseKind::Select) => Some((ClauseKind::Other, 1)),
            _ => None,
        }
    }

    fn scan_clauses(&mut self, clauses: &[ClauseRange], scope: &mut Scope) {
        for clause in clauses {
            let (lo, hi) = (clause.lo, clause.hi);
            match clause.kind {
                ClauseKind::Select => self.select_list(lo, hi, scope),
                ClauseKind::Where => self.scan(lo, hi, Clause::Where, scope),
                ClauseKind::GroupBy => self.scan(lo, hi, Clause::GroupBy, scope),
                ClauseKind::Having => self.scan(lo, hi, Clause::Having, scope),
                ClauseKind::OrderBy => self.order_by(lo, hi, scope),
                ClauseKind::Window => self.window(lo, hi, scope),
                ClauseKind::Limit => self.scan_subqueries(lo, hi, scope),
                ClauseKind::Set | ClauseKind::Values | ClauseKind::Other => {
                    self.scan(lo, hi, Clause::Other, scope)
                }
                ClauseKind::From | ClauseKind::Update | ClauseKind::Insert => {}
            }
        }
    }

    fn filter_anchor(&self, clauses: &[ClauseRange], hi: usize) -> Option<FilterAnchor> {
        let table_clause = clauses
            .iter()
            .position(|c| matches!(c.kind, ClauseKind::From | ClauseKind::Update))?;

        if let Some(clause) = clauses.iter().find(|c| c.kind == ClauseKind::Where) {
            if clause.lo >= clause.hi {
                return None;
            }
            return Some(FilterAnchor::Where {
                start: self.toks[clause.lo].start,
                end: self.toks[clause.hi - 1].end,
            });
        }

        let follower = clauses[table_clause + 1..].iter().find(|c| {
            matches!(
                c.kind,
                ClauseKind::GroupBy
                    | ClauseKind::Having
                    | ClauseKind::Window
                    | ClauseKind::OrderBy
                    | ClauseKind::Limit
                    | ClauseKind::Other
            )
        });
        let at = match follower {
            Some(clause) => self.toks[clause.keyword - 1].end,
            None => self.toks[hi - 1].end,
        };
        Some(FilterAnchor::Append { at })
    }

    fn split_commas(&self, lo: usize, hi: usize) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        if lo >= hi {
            return out;
        }
        let mut start = lo;
        let mut i = lo;
        while i < hi {
            match self.toks[i].kind {
                TokenKind::LParen => {
                    i = self.parens[i] + 1;
                    continue;
                }
                TokenKind::Comma => {
                    out.push((start, i));
                    start = i + 1;
                }
                _ => {}
            }
            i += 1;
        }
        out.push((start, hi));
        out
    }

    fn chain_at(&self, i: usize, hi: usize) -> Option<Chain> {
        let first = self.toks.get(i).filter(|_| i < hi)?;
        if !first.is_identifier() {
            return None;
        }
        let mut parts = vec![first.text.to_string()];
        let mut j = i + 1;
        let mut star = false;
        while j + 1 < hi && self.kind(j) == Some(TokenKind::Period) {
            let next = self.toks[j + 1];
            if next.is_identifier() {
                parts.push(next.text.to_string());
                j += 2;
            } else if next.kind == TokenKind::Star {
                star = true;
                j += 2;
                break;
            } else {
                break;
            }
        }
        Some(Chain { parts, next: j, star })
    }

    fn from_list(&mut self, lo: usize, hi: usize, scope: &mut Scope) {
        let mut i = lo;
        while i < hi {
            i = self.table_factor(i, hi, scope);
            while i < hi {
                let token = self.toks[i];
                if token.kind == TokenKind::Comma {
                    i += 1;
                    break;
                }
                if self.is_join_word(i) {
                    while i < hi && self.is_join_word(i) {
                        i += 1;
                    }
                    break;
                }
                if token.is_keyword("ON") {
                    let end = self.join_condition_end(i + 1, hi);
                    self.scan(i + 1, end, Clause::Join, scope);
                    i = end;
                    continue;
                }
                if token.is_keyword("USING") && self.kind(i + 1) == Some(TokenKind::LParen) {
                    let close = self.parens[i + 1];
                    for j in i + 2..close {
                        let column = self.toks[j];
                        if column.is_identifier() {
                            scope.column_refs.push(Reference {
                                table: None,
                                column: column.identifier(),
                                clause: Clause::Join,
                                is_literal: false,
                                whole_item: false,
                                is_keyword: false,
                            });
                        }
                    }
                    i = close + 1;
                    continue;
                }
                i = if token.kind == TokenKind::LParen {
                    self.parens[i] + 1
                } else {
                    i + 1
                };
            }
        }
    }

    fn is_join_word(&self, i: usize) -> bool {
        self.toks.get(i).is_some_and(|t| t.is_any_keyword(JOIN_WORDS))
            && self.kind(i + 1) != Some(TokenKind::LParen)
    }

    fn join_condition_end(&self, lo: usize, hi: usize) -> usize {
        let mut i = lo;
        while i < hi {
            if self.kind(i) == Some(TokenKind::LParen) {
                i = self.parens[i] + 1;
                continue;
            }
            if self.kind(i) == Some(TokenKind::Comma) || self.is_join_word(i) {
                return i;
            }
            i += 1;
        }
        hi
    }

    fn table_factor(&mut self, lo: usize, hi: usize, scope: &mut Scope) -> usize {
        let mut i = lo;
        while i < hi && (self.kw(i, "LATERAL") || self.kw(i, "ONLY")) {
            i += 1;
        }
        if i >= hi {
            return i;
        }

        let token = self.toks[i];
        if token.kind == TokenKind::LParen {
            let close = self.parens[i];
            if self.starts_query(i + 1) {
                let ctx = scope.child_context();
                self.query(i + 1, close, &ctx, true);
            } else {
                self.from_list(i + 1, close, scope);
            }
            let (alias, next) = self.table_alias(close + 1, hi);
            return match alias {
                Some(alias) => {
                    scope.derived.push(alias);
                    self.skip_column_aliases(next, hi)
                }
                None => next,
            };
        }

        if !token.is_identifier() || (token.kind == TokenKind::Word && is_keyword_like(token.text)) {
            return i + 1;
        }
        let Some(chain) = self.chain_at(i, hi) else {
            return i + 1;
        };
        let name = chain.parts.join(".");
        let next = chain.next;

        if next < hi && self.kind(next) == Some(TokenKind::LParen) {
            // table function
            let close = self.parens[next];
            self.scan(next + 1, close, Clause::Join, scope);
            let (alias, after) = self.table_alias(close + 1, hi);
            let has_alias = alias.is_some();
            scope.derived.push(alias.unwrap_or_else(|| chain.column()));
            return if has_alias {
                self.skip_column_aliases(after, hi)
            } else {
                after
            };
        }

        let (alias, after) = self.table_alias(next, hi);
        if scope.is_cte_name(&name) {
            scope.derived.push(alias.clone().unwrap_or(name));
        } else {
            scope.tables.push(TableRef {
                name,
                alias: alias.clone(),
            });
        }
        if alias.is_some() {
            self.skip_column_aliases(after, hi)
        } else {
            after
        }
    }

    fn table_alias(&self, i: usize, hi: usize) -> (Option<String>, usize) {
        if i >= hi {
            return (None, i);
        }
        if self.kw(i, "AS") {
            return match self.toks.get(i + 1) {
                Some(t) if i + 1 < hi && t.is_identifier() => (Some(t.text.to_string()), i + 2),
                _ => (None, i + 1),
            };
        }
        let token = self.toks[i];
        let bare_alias = token.kind == TokenKind::Word
            && !is_keyword_like(token.text)
            && !token.is_any_keyword(NOT_ALIAS)
            && !token.is_any_keyword(JOIN_WORDS);
        if token.kind == TokenKind::QuotedIdent || bare_alias {
            return (Some(token.text.to_string()), i + 1);
        }
        (None, i)
    }

    fn skip_column_aliases(&self, i: usize, hi: usize) -> usize {
        if i < hi && self.kind(i) == Some(TokenKind::LParen) {
            self.parens[i] + 1
        } else {
            i
        }
    }

    /// `INSERT [INTO] t [AS x] [(cols)]`.
    fn insert_target(&mut self, lo: usize, hi: usize, scope: &mut Scope) {
        const MODIFIERS: &[&str] = &[
            "INTO", "IGNORE", "OR", "REPLACE", "ABORT", "FAIL", "ROLLBACK", "LOW_PRIORITY",
            "DELAYED", "HIGH_PRIORITY", "OVERWRITE", "TABLE",
        ];
        let mut i = lo;
        while i < hi && self.toks[i].is_any_keyword(MODIFIERS) {
            i += 1;
        }
        let Some(chain) = self.chain_at(i, hi) else {
            return;
        };
        let mut next = chain.next;
        let mut alias = None;
        if self.kw(next, "AS") && next + 1 < hi && self.toks[next + 1].is_identifier() {
            alias = Some(self.toks[next + 1].text.to_string());
            next += 2;
        }
        scope.tables.push(TableRef {
            name: chain.parts.join("."),
            alias,
        });
        if next < hi && self.kind(next) == Some(TokenKind::LParen) {
            let close = self.parens[next];
            for j in next + 1..close {
                let column = self.toks[j];
                if column.is_identifier() {
                    scope.column_refs.push(Reference {
                        table: None,
                        column: column.identifier(),
                        clause: Clause::Other,
                        is_literal: false,
                        whole_item: false,
                        is_keyword: false,
                    });
                }
            }
        }
    }

    fn select_list(&mut self, lo: usize, hi: usize, scope: &mut Scope) {
        let mut lo = lo;
        while lo < hi {
            if self.kw(lo, "DISTINCT") || self.kw(lo, "ALL") {
                lo += 1;
                if self.kw(lo, "ON") && self.kind(lo + 1) == Some(TokenKind::LParen) {
                    let close = self.parens[lo + 1];
                    self.scan(lo + 2, close, Clause::Select, scope);
                    lo = close + 1;
                }
                continue;
            }
            if self.kw(lo, "TOP") {
                lo += 1;
                lo = if self.kind(lo) == Some(TokenKind::LParen) {
                    self.parens[lo] + 1
                } else {
                    lo + 1
                };
                if self.kw(lo, "PERCENT") {
                    lo += 1;
                }
                continue;
            }
            break;
        }
        for (s, e) in self.split_commas(lo, hi) {
            self.select_item(s, e, scope);
        }
    }

    fn select_item(&mut self, s: usize, e: usize, scope: &mut Scope) {
        if s >= e {
            return;
        }
        let item_text = self.text(s, e);
        scope.select_items.push(item_text.clone());

        if self.kind(s) == Some(TokenKind::Star) {
            scope.wildcards.push(Wildcard {
                qualifier: None,
                clause: Clause::Select,
            });
            scope.projections.push(Projection {
                output: "*".to_string(),
                table: None,
                column: None,
                refs: Vec::new(),
            });
            self.scan(s + 1, e, Clause::Select, scope);
            return;
        }

        let alias = self.item_alias(s, e);
        let refs_before = scope.column_refs.len();
        let wildcards_before = scope.wildcards.len();
        let scopes_before = self.scopes.len();
        self.scan(s, alias.expr_end, Clause::Select, scope);

        let (table, column) = match self.chain_at(s, alias.origin_end) {
            Some(chain) if chain.next == alias.origin_end && chain.star => (chain.qualifier(), None),
            Some(chain) if chain.next == alias.origin_end && !self.is_reserved_at(s) => {
                (chain.qualifier(), Some(chain.column()))
            }
            _ => (None, None),
        };
        if let Some(name) = &alias.name {
            scope.select_aliases.insert(name.to_lowercase());
        }
        let output = match (&alias.name, &column) {
            (Some(name), _) => name.clone(),
            (None, Some(column)) => column.clone(),
            (None, None) if table.is_some() && column.is_none() => "*".to_string(),
            (None, None) => item_text.clone(),
        };
        let refs = scope.column_refs[refs_before..]
            .iter()
            .filter(|r| !r.is_literal)
            .cloned()
            .collect();
        scope.projections.push(Projection {
            output,
            table,
            column,
            refs,
        });

        let nothing_found = scope.column_refs.len() == refs_before
            && scope.wildcards.len() == wildcards_before
            && self.scopes.len() == scopes_before;
        if nothing_found {
            scope.column_refs.push(Reference {
                table: None,
                column: item_text,
                clause: Clause::Select,
                is_literal: true,
                whole_item: true,
                is_keyword: false,
            });
        }
    }

    fn is_reserved_at(&self, i: usize) -> bool {
        self.toks
            .get(i)
            .is_some_and(|t| t.kind == TokenKind::Word && is_reserved(t.text))
    }

    fn item_alias(&self, s: usize, e: usize) -> ItemAlias {
        let none = ItemAlias {
            expr_end: e,
            origin_end: e,
            name: None,
        };
        if e <= s + 1 {
            return none;
        }

        let mut i = s;
        let mut as_at = None;
        while i < e {
            if self.kind(i) == Some(TokenKind::LParen) {
                i = self.parens[i] + 1;
                continue;
            }
            if self.kw(i, "AS") {
                as_at = Some(i);
            }
            i += 1;
        }
        if let Some(p) = as_at.filter(|&p| p + 2 == e) {
            let target = self.toks[p + 1];
            if matches!(
                    target.kind,
                    TokenKind::Word | TokenKind::QuotedIdent | TokenKind::String
                )
            {
                return ItemAlias {
                    expr_end: p,
                    origin_end: p,
                    name: Some(target.identifier()),
                };
            }
        }

        let last = self.toks[e - 1];
        let prev = self.toks[e - 2];
        let last_is_name = last.kind == TokenKind::QuotedIdent
            || (last.kind == TokenKind::Word && !is_keyword_like(last.text));
        if !last_is_name {
            return none;
        }
        match prev.kind {
            TokenKind::RParen | TokenKind::String | TokenKind::Number | TokenKind::Param => {
                ItemAlias {
                    expr_end: e - 1,
                    origin_end: e - 1,
                    name: Some(last.identifier()),
                }
            }
            TokenKind::Word if prev.is_any_keyword(&["END", "NULL", "TRUE", "FALSE"]) => ItemAlias {
                expr_end: e - 1,
                origin_end: e - 1,
                name: Some(last.identifier()),
            },
            // `col alias`: the alias is recorded but the name is still
            // scanned as a column in case the left side is an operator word
            TokenKind::Word | TokenKind::QuotedIdent
                if self
                    .chain_at(s, e - 1)
                    .is_some_and(|c| c.next == e - 1 && !c.star)
                    && !self.is_reserved_at(s) =>
            {
                ItemAlias {
                    expr_end: e,
                    origin_end: e - 1,
                    name: Some(last.identifier()),
                }
            }
            _ => none,
        }
    }

    fn order_by(&mut self, lo: usize, hi: usize, scope: &mut Scope) {
        for (s, e) in self.split_commas(lo, hi) {
            let mut end = e;
            loop {
                if end > s + 1 && self.toks[end - 1].is_any_keyword(&["ASC", "DESC"]) {
                    end -= 1;
                    continue;
                }
                if end > s + 2
                    && self.toks[end - 2].is_keyword("NULLS")
                    && self.toks[end - 1].is_any_keyword(&["FIRST", "LAST"])
                {
                    end -= 2;
                    continue;
                }
                break;
            }
            if end == s + 1 && self.toks[s].is_identifier() && !self.is_reserved_at(s) {
                scope.column_refs.push(Reference {
                    table: None,
                    column: self.toks[s].identifier(),
                    clause: Clause::OrderBy,
                    is_literal: false,
                    whole_item: true,
                    is_keyword: is_contextual(self.toks[s].text)
                        && self.toks[s].kind == TokenKind::Word,
                });
            } else {
                self.scan(s, e, Clause::OrderBy, scope);
            }
        }
    }

    /// `WINDOW w AS (...)`: only the window definition holds references.
    fn window(&mut self, lo: usize, hi: usize, scope: &mut Scope) {
        for (s, e) in self.split_commas(lo, hi) {
            if s >= e {
                continue;
            }
            if self.toks[s].is_identifier() && self.kw(s + 1, "AS") {
                self.scan(s + 2, e, Clause::Other, scope);
            } else {
                self.scan(s, e, Clause::Other, scope);
            }
        }
    }

    fn scan_subqueries(&mut self, lo: usize, hi: usize, scope: &mut Scope) {
        let mut i = lo;
        while i < hi {
            if self.kind(i) == Some(TokenKind::LParen) && self.starts_query(i + 1) {
                let close = self.parens[i];
                let ctx = scope.child_context();
                self.query(i + 1, close, &ctx, true);
                i = close + 1;
                continue;
            }
            i += 1;
        }
    }

    /// Collect column references and wildcards from an expression range.
    fn scan(&mut self, lo: usize, hi: usize, clause: Clause, scope: &mut Scope) {
        let mut i = lo;
        while i < hi {
            let token = self.toks[i];
            match token.kind {
                TokenKind::LParen if self.starts_query(i + 1) => {
                    let close = self.parens[i];
                    let ctx = scope.child_context();
                    self.query(i + 1, close, &ctx, true);
                    i = close + 1;
                }
                TokenKind::Word | TokenKind::QuotedIdent => {
                    i = self.identifier(i, hi, clause, scope);
                }
                TokenKind::Operator if token.text == "::" => {
                    i = self.skip_type(i + 1, hi);
                }
                _ => i += 1,
            }
        }
    }

    fn identifier(&mut self, i: usize, hi: usize, clause: Clause, scope: &mut Scope) -> usize {
        let token = self.toks[i];
        if token.kind == TokenKind::Word {
            let upper = token.text.to_ascii_uppercase();
            match upper.as_str() {
                "AS" => return self.skip_type(i + 1, hi),
                "NULLS" if self.kw(i + 1, "FIRST") || self.kw(i + 1, "LAST") => return i + 2,
                "OVER" if self.kind(i + 1) == Some(TokenKind::Word) => return i + 2,
                "COLLATE" => return i + 2,
                "AT" if self.kw(i + 1, "TIME") && self.kw(i + 2, "ZONE") => return i + 3,
                "INTERVAL" => {
                    let mut j = i + 1;
                    if matches!(
                        self.kind(j),
                        Some(TokenKind::String | TokenKind::Number | TokenKind::Param)
                    ) {
                        j += 1;
                        if j < hi
                            && self
                                .toks
                                .get(j)
                                .is_some_and(|t| t.kind == TokenKind::Word && is_interval_unit(t.text))
                        {
                            j += 1;
                        }
                    }
                    return j;
                }
                "DATE" | "TIME" | "TIMESTAMP" | "TIMESTAMPTZ"
                    if self.kind(i + 1) == Some(TokenKind::String) =>
                {
                    return i + 2;
                }
                "EXTRACT"
                    if self.kind(i + 1) == Some(TokenKind::LParen)
                        && self.kind(i + 2) == Some(TokenKind::Word)
                        && self.kw(i + 3, "FROM") =>
                {
                    return i + 4;
                }
                _ => {}
            }
            if is_reserved(&upper) {
                return i + 1;
            }
        }
        let keyword = token.kind == TokenKind::Word && is_contextual(token.text);

        let Some(chain) = self.chain_at(i, hi) else {
            return i + 1;
        };
        if chain.star {
            scope.wildcards.push(Wildcard {
                qualifier: chain.qualifier(),
                clause,
            });
            return chain.next;
        }
        if chain.next < hi && self.kind(chain.next) == Some(TokenKind::LParen) {
            // function call; arguments are scanned next
            return chain.next;
        }
        scope.column_refs.push(Reference {
            is_keyword: keyword && chain.qualifier().is_none(),
            table: chain.qualifier(),
            column: chain.column(),
            clause,
            is_literal: false,
            whole_item: false,
        });
        chain.next
    }

    /// Skip a type name after `::` or `AS`.
    fn skip_type(&self, i: usize, hi: usize) -> usize {
        let mut j = i;
        if j >= hi || !self.toks[j].is_identifier() {
            return j;
        }
        j += 1;
        while j + 1 < hi
            && self.kind(j) == Some(TokenKind::Period)
            && self.toks[j + 1].is_identifier()
        {
            j += 2;
        }
        while j < hi
            && self.toks[j].is_any_keyword(&["PRECISION", "VARYING", "UNSIGNED", "SIGNED"])
        {
            j += 1;
        }
        if (self.kw(j, "WITH") || self.kw(j, "WITHOUT"))
            && self.kw(j + 1, "TIME")
            && self.kw(j + 2, "ZONE")
            && j + 2 < hi
        {
            j += 3;
        }
        if j < hi && self.kind(j) == Some(TokenKind::LParen) {
            j = self.parens[j] + 1;
        }
        while j + 1 < hi && self.toks[j].text == "[" && self.toks[j + 1].text == "]" {
            j += 2;
        }
        j
    }
}

struct ItemAlias {
    /// End of the range scanned for references.
    expr_end: usize,
    /// End of the expression proper, used to find the projected column.
    origin_end: usize,
    name: Option<String>,
}
