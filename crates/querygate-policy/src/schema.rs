//! Schema validation against the connection's catalog.
//!
//! Best effort only. Column access enforcement is the security boundary;
//! this layer gives callers early, readable feedback about typos and
//! hallucinated names.

use std::collections::BTreeSet;

use querygate_core::Catalog;
use querygate_rls::{Extraction, ReferenceExtractor, Resolution, Scope, TextExtractor, ident_eq};
use serde::Serialize;

use crate::error::AuthError;

/// Outcome of schema validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub invalid_tables: Vec<String>,
    pub invalid_columns: Vec<String>,
}

impl SchemaReport {
    pub fn valid() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            invalid_tables: Vec::new(),
            invalid_columns: Vec::new(),
        }
    }

    fn from_findings(tables: BTreeSet<String>, columns: BTreeSet<String>) -> Self {
        let mut errors: Vec<String> = tables
            .iter()
            .map(|t| format!("Table '{}' does not exist", t))
            .collect();
        errors.extend(columns.iter().map(|c| format!("Column '{}' does not exist", c)));
        Self {
            valid: errors.is_empty(),
            errors,
            invalid_tables: tables.into_iter().collect(),
            invalid_columns: columns.into_iter().collect(),
        }
    }

    /// Convert a failing report into `AuthError::SchemaViolation`.
    pub fn into_result(self) -> Result<(), AuthError> {
        if self.valid {
            Ok(())
        } else {
            Err(AuthError::SchemaViolation {
                invalid_tables: self.invalid_tables,
                invalid_columns: self.invalid_columns,
            })
        }
    }
}

/// Validate `sql` against `catalog`. Without a catalog the query is valid.
pub fn validate_schema(sql: &str, catalog: Option<&Catalog>) -> Result<SchemaReport, AuthError> {
    let Some(catalog) = catalog else {
        return Ok(SchemaReport::valid());
    };
    let extraction = TextExtractor::new().extract(sql)?;
    Ok(check_extraction(&extraction, catalog))
}

/// Validate an already extracted statement.
pub fn check_extraction(extraction: &Extraction, catalog: &Catalog) -> SchemaReport {
    let aliases = extraction.select_aliases();
    let referenced: Vec<String> = extraction.table_names().into_iter().collect();

    let mut invalid_tables = BTreeSet::new();
    let mut invalid_columns = BTreeSet::new();

    for scope in extraction.scopes().iter().filter(|s| !s.inherits_tables) {
        for table in &scope.tables {
            if !catalog.has_table(&table.name) {
                invalid_tables.insert(table.key());
            }
        }
    }

    for scope in extraction.scopes() {
        for reference in scope.column_refs.iter().filter(|r| !r.is_literal) {
            if !scope.whole_row_tables(&reference.column, Some(catalog)).is_empty() {
                continue;
            }
            let candidates = match scope.resolve(reference, Some(catalog)) {
                Resolution::Derived => continue,
                Resolution::Tables(candidates) => candidates,
            };
            if reference.is_keyword
                || column_exists(scope, &candidates, &reference.column, catalog)
            {
                continue;
            }
            if reference.table.is_none() {
                let is_alias = aliases.iter().any(|a| ident_eq(a, &reference.column));
                let in_any = referenced
                    .iter()
                    .any(|t| catalog.has_column(t, &reference.column));
                if is_alias || in_any || has_derived_source(scope) {
                    continue;
                }
            }
            let display = match &reference.table {
                Some(qualifier) => format!("{}.{}", qualifier, reference.column),
                None => reference.column.clone(),
            };
            invalid_columns.insert(display);
        }
    }

    let report = SchemaReport::from_findings(invalid_tables, invalid_columns);
    if !report.valid {
        tracing::debug!(errors = ?report.errors, "Schema validation failed");
    }
    report
}

/// A candidate missing from the catalog is already reported as a table
/// error, so its columns are not reported again.
fn column_exists(scope: &Scope, candidates: &[String], column: &str, catalog: &Catalog) -> bool {
    if candidates.is_empty() {
        return has_derived_source(scope);
    }
    candidates
        .iter()
        .any(|t| !catalog.has_table(t) || catalog.has_column(t, column))
}

fn has_derived_source(scope: &Scope) -> bool {
    !scope.derived.is_empty() || !scope.outer_derived.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use querygate_core::{Column, Table};

    fn catalog() -> Catalog {
        Catalog::new(vec![
            Table::new(
                "users",
                vec![
                    Column::new("id", "int").primary_key(),
                    Column::new("email", "text"),
                    Column::new("ssn", "text"),
                ],
            ),
            Table::new(
                "orders",
                vec![
                    Column::new("id", "int").primary_key(),
                    Column::new("user_id", "int"),
                    Column::new("total", "numeric"),
                ],
            ),
        ])
    }

    fn check(sql: &str) -> SchemaReport {
        validate_schema(sql, Some(&catalog())).unwrap()
    }

    #[test]
    fn test_no_catalog_is_valid() {
        let report = validate_schema("SELECT nope FROM nowhere", None).unwrap();
        assert!(report.valid);
    }

    #[test]
    fn test_valid_query() {
        let report = check(
            "SELECT u.email, o.total FROM users u JOIN orders o ON o.user_id = u.id WHERE u.id = 1",
        );
        assert!(report.valid, "{:?}", report.errors);
    }

    #[test]
    fn test_unknown_table() {
        let report = check("SELECT id FROM Customers");
        assert!(!report.valid);
        assert_eq!(report.invalid_tables, vec!["customers"]);
        assert!(report.invalid_columns.is_empty());
    }

    #[test]
    fn test_unknown_columns_sorted_and_deduplicated() {
        let report = check("SELECT phone, age FROM users WHERE phone IS NOT NULL");
        assert_eq!(report.invalid_columns, vec!["age", "phone"]);
        assert_eq!(report.errors.len(), 2);
    }

    #[test]
    fn test_qualified_column_checked_on_its_table() {
        let report = check("SELECT u.total FROM users u JOIN orders o ON o.user_id = u.id");
        assert_eq!(report.invalid_columns, vec!["u.total"]);
    }

    #[test]
    fn test_select_alias_is_not_a_column() {
        assert!(check("SELECT id AS x FROM users ORDER BY x").valid);
        assert!(check("SELECT count(*) AS n FROM orders HAVING n > 1").valid);
    }

    #[test]
    fn test_derived_sources_skipped() {
        assert!(check("SELECT d.anything FROM (SELECT id AS anything FROM users) d").valid);
        assert!(check("WITH recent AS (SELECT id FROM orders) SELECT id FROM recent").valid);
    }

    #[test]
    fn test_schema_prefix_and_case() {
        assert!(check("SELECT ID FROM public.USERS").valid);
    }

    #[test]
    fn test_into_result() {
        let err = check("SELECT x FROM nowhere").into_result().unwrap_err();
        assert_eq!(
            err,
            AuthError::SchemaViolation {
                invalid_tables: vec!["nowhere".into()],
                invalid_columns: vec![],
            }
        );
    }
}
