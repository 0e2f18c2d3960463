//! Error types for the RLS crate.

use thiserror::Error;

/// Errors that can occur while lexing or analysing SQL text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RlsError {
    /// The tokenizer rejected the text, e.g. a literal or comment never closes.
    #[error("{message} at byte {offset}")]
    Tokenize { message: String, offset: usize },

    /// Parentheses do not balance.
    #[error("unbalanced parenthesis at byte {offset}")]
    UnbalancedParenthesis { offset: usize },

    /// SQL dialects disagree on where tokens begin and end.
    #[error("ambiguous {what} near byte {offset}")]
    Ambiguous { what: &'static str, offset: usize },
}
