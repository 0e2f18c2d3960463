//! Table and column access enforcement.
//!
//! This is the security boundary: it never fails open. When a reference
//! cannot be tied to a single table, every candidate table is checked and a
//! denial on any of them blocks the query.

use std::collections::BTreeSet;

use querygate_core::{Catalog, Operation};
use querygate_rls::{
    Clause, Extraction, Reference, ReferenceExtractor, Resolution, Scope, TextExtractor,
};

use crate::compiler::CompiledPolicy;
use crate::error::AuthError;

/// Checks extracted references against a compiled policy.
#[derive(Debug, Clone, Default)]
pub struct ColumnAccessEnforcer<E = TextExtractor> {
    extractor: E,
}

impl ColumnAccessEnforcer<TextExtractor> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<E: ReferenceExtractor> ColumnAccessEnforcer<E> {
    pub fn with_extractor(extractor: E) -> Self {
        Self { extractor }
    }

    /// Check every wildcard and column reference in `sql`.
    pub fn enforce(
        &self,
        sql: &str,
        catalog: Option<&Catalog>,
        policy: &CompiledPolicy,
    ) -> Result<(), AuthError> {
        if policy.is_admin {
            return Ok(());
        }
        let extraction = self.extractor.extract(sql)?;
        check_columns(&extraction, catalog, policy)
    }
}

/// Deny-by-default at table granularity.
///
/// Every real table must be granted to the role and allow `operation`.
/// Admins pass.
pub fn check_table_access(
    extraction: &Extraction,
    operation: Operation,
    policy: &CompiledPolicy,
) -> Result<(), AuthError> {
    if policy.is_admin {
        return Ok(());
    }

    let blocked: BTreeSet<String> = extraction
        .table_names()
        .into_iter()
        .filter(|table| {
            !policy.is_table_allowed(table)
                || !policy
                    .table_permission(table)
                    .is_some_and(|p| p.allows(operation))
        })
        .collect();

    if blocked.is_empty() {
        return Ok(());
    }
    tracing::info!(tables = ?blocked, %operation, "Blocked table access");
    Err(AuthError::TableAccessBlocked {
        tables: blocked.into_iter().collect(),
    })
}

/// Check wildcards and column references of an extracted statement.
pub fn check_columns(
    extraction: &Extraction,
    catalog: Option<&Catalog>,
    policy: &CompiledPolicy,
) -> Result<(), AuthError> {
    if policy.is_admin {
        return Ok(());
    }

    for scope in extraction.scopes() {
        if let Some(table) = blocked_wildcard(scope, catalog, policy) {
            tracing::info!(table = %table, "Blocked wildcard projection");
            return Err(AuthError::SelectStarBlocked { table });
        }
    }

    let last_aliases = extraction.last_select_aliases();
    let mut blocked = BTreeSet::new();

    for scope in extraction.scopes() {
        let order_aliases = if scope.depth == 0 && scope.is_last_segment {
            &last_aliases
        } else {
            &scope.select_aliases
        };

        for reference in scope.column_refs.iter().filter(|r| !r.is_literal) {
            if is_order_by_alias(reference, order_aliases) {
                continue;
            }
            let Resolution::Tables(candidates) = scope.resolve(reference, catalog) else {
                continue;
            };
            let column = reference.column.to_lowercase();
            for table in candidates {
                if policy.is_denied(&table, &column) {
                    blocked.insert(format!("{}.{}", table, column));
                }
            }
        }
    }

    if blocked.is_empty() {
        return Ok(());
    }
    tracing::info!(columns = ?blocked, "Blocked column access");
    Err(AuthError::ColumnAccessBlocked {
        columns: blocked.into_iter().collect(),
    })
}

/// First table covered by a wildcard, or a whole-row reference, that has a
/// denied column.
fn blocked_wildcard(
    scope: &Scope,
    catalog: Option<&Catalog>,
    policy: &CompiledPolicy,
) -> Option<String> {
    let mut covered: Vec<String> = Vec::new();

    for wildcard in &scope.wildcards {
        match &wildcard.qualifier {
            None => {
                covered.extend(scope.tables.iter().map(|t| t.key()));
                if scope.inherits_tables {
                    covered.extend(scope.outer_tables.iter().map(|t| t.key()));
                }
            }
            Some(qualifier) => {
                if let Resolution::Tables(tables) = scope.resolve_qualifier(qualifier) {
                    covered.extend(tables);
                }
            }
        }
    }

    let bare = |r: &&Reference| !r.is_literal && !r.is_keyword && r.table.is_none();
    for reference in scope.column_refs.iter().filter(bare) {
        covered.extend(scope.whole_row_tables(&reference.column, catalog));
    }

    covered.into_iter().find(|table| policy.has_denied_columns(table))
}

fn is_order_by_alias(reference: &Reference, aliases: &BTreeSet<String>) -> bool {
    reference.clause == Clause::OrderBy
        && reference.whole_item
        && reference.table.is_none()
        && aliases.contains(&reference.column.to_lowercase())
}
