//! Authorization error types.
//!
//! Every variant is terminal for the query that produced it. Messages name
//! the offending tables and columns but never why they are restricted.

use querygate_core::Role;
use querygate_rls::RlsError;
use serde::Serialize;

/// Error returned when a query is not authorized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Only a single statement is allowed, found {statements}")]
    MultiStatementRejected { statements: usize },

    #[error("Operation '{keyword}' is not permitted")]
    ForbiddenOperation { keyword: String },

    #[error("Query is empty")]
    EmptyQuery,

    #[error("Query could not be analysed: {0}")]
    Unparseable(String),

    #[error(
        "Query references unknown tables [{}] or columns [{}]",
        .invalid_tables.join(", "),
        .invalid_columns.join(", ")
    )]
    SchemaViolation {
        invalid_tables: Vec<String>,
        invalid_columns: Vec<String>,
    },

    #[error("No access policy is configured for role '{role}' on connection '{connection_id}'")]
    PolicyMissing { role: Role, connection_id: String },

    #[error("Policy store error: {0}")]
    PolicyStore(String),

    #[error("Access to tables [{}] is not permitted", .tables.join(", "))]
    TableAccessBlocked { tables: Vec<String> },

    #[error("SELECT * is not permitted on table '{table}'; list the columns explicitly")]
    SelectStarBlocked { table: String },

    #[error("Access to columns [{}] is not permitted", .columns.join(", "))]
    ColumnAccessBlocked { columns: Vec<String> },
}

impl AuthError {
    /// Machine-checkable category of this error.
    pub fn kind(&self) -> AuthErrorKind {
        match self {
            AuthError::MultiStatementRejected { .. } => AuthErrorKind::MultiStatementRejected,
            AuthError::ForbiddenOperation { .. } => AuthErrorKind::ForbiddenOperation,
            AuthError::EmptyQuery => AuthErrorKind::EmptyQuery,
            AuthError::Unparseable(_) => AuthErrorKind::Unparseable,
            AuthError::SchemaViolation { .. } => AuthErrorKind::SchemaViolation,
            AuthError::PolicyMissing { .. } => AuthErrorKind::PolicyMissing,
            AuthError::PolicyStore(_) => AuthErrorKind::PolicyStore,
            AuthError::TableAccessBlocked { .. } => AuthErrorKind::TableAccessBlocked,
            AuthError::SelectStarBlocked { .. } => AuthErrorKind::SelectStarBlocked,
            AuthError::ColumnAccessBlocked { .. } => AuthErrorKind::ColumnAccessBlocked,
        }
    }

    pub fn forbidden(keyword: impl Into<String>) -> Self {
        AuthError::ForbiddenOperation {
            keyword: keyword.into(),
        }
    }
}

impl From<RlsError> for AuthError {
    fn from(err: RlsError) -> Self {
        AuthError::Unparseable(err.to_string())
    }
}

/// Categories of authorization errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthErrorKind {
    // =========================================================================
    // Statement safety
    // =========================================================================
    /// More than one statement in the input.
    MultiStatementRejected,
    /// A mutating or administrative verb.
    ForbiddenOperation,
    /// Nothing left after comment stripping.
    EmptyQuery,
    /// Text could not be segmented unambiguously.
    Unparseable,

    // =========================================================================
    // Schema
    // =========================================================================
    /// Unknown tables or columns.
    SchemaViolation,

    // =========================================================================
    // Policy
    // =========================================================================
    /// Non-admin principal without a policy record.
    PolicyMissing,
    /// The policy store failed.
    PolicyStore,
    /// Table not granted, or operation not granted on it.
    TableAccessBlocked,

    // =========================================================================
    // Column access
    // =========================================================================
    /// Wildcard over a table with denied columns.
    SelectStarBlocked,
    /// Denied columns referenced.
    ColumnAccessBlocked,
}

impl AuthErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthErrorKind::MultiStatementRejected => "multi_statement_rejected",
            AuthErrorKind::ForbiddenOperation => "forbidden_operation",
            AuthErrorKind::EmptyQuery => "empty_query",
            AuthErrorKind::Unparseable => "unparseable",
            AuthErrorKind::SchemaViolation => "schema_violation",
            AuthErrorKind::PolicyMissing => "policy_missing",
            AuthErrorKind::PolicyStore => "policy_store",
            AuthErrorKind::TableAccessBlocked => "table_access_blocked",
            AuthErrorKind::SelectStarBlocked => "select_star_blocked",
            AuthErrorKind::ColumnAccessBlocked => "column_access_blocked",
        }
    }
}
