//! # querygate-rls
//!
//! SQL analysis and row-level filter injection for querygate.
//!
//! This crate provides functionality to:
//! - Tokenize SQL with byte spans, failing closed on dialect-ambiguous input
//! - Extract tables, aliases, select items and column references per scope
//! - Inject row filters for user-scoped tables
//! - Append row limits to read queries
//!
//! ## How It Works
//!
//! Row filters are added to every scope that reads a user-scoped table:
//!
//! **Before (from caller):**
//! ```sql
//! SELECT * FROM orders WHERE status = 'pending' OR priority > 3
//! ```
//!
//! **After (to the database):**
//! ```sql
//! SELECT * FROM orders WHERE (status = 'pending' OR priority > 3) AND (orders.owner_id = 'u-42')
//! ```
//!
//! The caller's condition is parenthesised so that an `OR` in it cannot
//! escape the filter.

pub mod error;
pub mod extractor;
pub mod injector;
pub mod lexer;
pub mod limit;

pub use error::RlsError;
pub use extractor::{
    Clause, Extraction, FilterAnchor, Projection, Reference, ReferenceExtractor, Resolution,
    Scope, TableRef, TextExtractor, Wildcard, ident_eq,
};
pub use injector::{InjectionResult, RlsInjector, build_filter, render_template};
pub use lexer::{Token, TokenKind, strip_comments, tokenize};
pub use limit::append_limit;
